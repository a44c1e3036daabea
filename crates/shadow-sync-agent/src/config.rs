//! Agent configuration.

use anyhow::{Context, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Shadow to synchronize
    pub shadow: ShadowConfig,

    /// Broker connection
    pub mqtt: MqttConfig,

    /// Retry and timeout policy
    pub sync: SyncConfig,
}

/// Shadow configuration.
#[derive(Debug, Clone)]
pub struct ShadowConfig {
    /// Thing name
    pub thing_name: String,

    /// Named shadow, `None` for the classic shadow
    pub shadow_name: Option<String>,

    /// Desired state published at the start of each run
    pub desired_state: Value,
}

/// MQTT configuration.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// Broker URL (`tcp://`, `mqtt://`, `ssl://` or `mqtts://`)
    pub broker: String,

    /// Client ID for the MQTT connection
    pub client_id: String,

    /// Keep-alive interval
    pub keep_alive: Duration,

    /// How long to wait for CONNACK/SUBACK/PUBACK/UNSUBACK
    pub ack_timeout: Duration,

    /// CA certificate (PEM) for TLS brokers
    pub ca_path: Option<PathBuf>,

    /// Client certificate (PEM) for mutual TLS
    pub cert_path: Option<PathBuf>,

    /// Client private key (PEM) for mutual TLS
    pub key_path: Option<PathBuf>,
}

/// Sync policy configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Fixed delay between connect attempts and failed runs
    pub retry_delay: Duration,

    /// Bound on each waiting state, `None` waits indefinitely
    pub await_timeout: Option<Duration>,

    /// Run a single sync and exit
    pub once: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            shadow: ShadowConfig {
                thing_name: "shadow-device".to_string(),
                shadow_name: None,
                desired_state: serde_json::json!({"powerOn": 1}),
            },
            mqtt: MqttConfig {
                broker: "tcp://localhost:1883".to_string(),
                client_id: format!("shadow-sync-{}", Uuid::new_v4()),
                keep_alive: Duration::from_secs(30),
                ack_timeout: Duration::from_secs(10),
                ca_path: None,
                cert_path: None,
                key_path: None,
            },
            sync: SyncConfig {
                retry_delay: Duration::from_secs(5),
                await_timeout: None,
                once: false,
            },
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `SHADOW_SYNC_THING_NAME`: Thing name
    /// - `SHADOW_SYNC_SHADOW_NAME`: Named shadow (classic shadow if unset)
    /// - `SHADOW_SYNC_MQTT_BROKER`: MQTT broker URL
    /// - `SHADOW_SYNC_CLIENT_ID`: MQTT client ID
    /// - `SHADOW_SYNC_CA_PATH`, `SHADOW_SYNC_CERT_PATH`, `SHADOW_SYNC_KEY_PATH`: TLS material
    /// - `SHADOW_SYNC_KEEP_ALIVE_SECS`: Keep-alive interval
    /// - `SHADOW_SYNC_ACK_TIMEOUT_SECS`: Acknowledgment wait bound
    /// - `SHADOW_SYNC_RETRY_DELAY_SECS`: Delay between connect attempts
    /// - `SHADOW_SYNC_AWAIT_TIMEOUT_SECS`: Bound on waiting for shadow responses
    /// - `SHADOW_SYNC_DESIRED_STATE`: Desired state JSON
    /// - `SHADOW_SYNC_ONCE`: Run a single sync and exit
    ///
    /// # Errors
    ///
    /// Returns error if a variable holds an invalid value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(thing) = lookup("SHADOW_SYNC_THING_NAME") {
            config.shadow.thing_name = thing;
        }

        config.shadow.shadow_name = lookup("SHADOW_SYNC_SHADOW_NAME").filter(|name| !name.is_empty());

        if let Some(state) = lookup("SHADOW_SYNC_DESIRED_STATE") {
            config.shadow.desired_state =
                serde_json::from_str(&state).context("Invalid SHADOW_SYNC_DESIRED_STATE JSON")?;
        }

        if let Some(broker) = lookup("SHADOW_SYNC_MQTT_BROKER") {
            config.mqtt.broker = broker;
        }

        if let Some(client_id) = lookup("SHADOW_SYNC_CLIENT_ID") {
            config.mqtt.client_id = client_id;
        }

        config.mqtt.ca_path = lookup("SHADOW_SYNC_CA_PATH").map(PathBuf::from);
        config.mqtt.cert_path = lookup("SHADOW_SYNC_CERT_PATH").map(PathBuf::from);
        config.mqtt.key_path = lookup("SHADOW_SYNC_KEY_PATH").map(PathBuf::from);

        if let Some(secs) = lookup("SHADOW_SYNC_KEEP_ALIVE_SECS") {
            config.mqtt.keep_alive = parse_secs(&secs).context("Invalid SHADOW_SYNC_KEEP_ALIVE_SECS")?;
        }

        if let Some(secs) = lookup("SHADOW_SYNC_ACK_TIMEOUT_SECS") {
            config.mqtt.ack_timeout =
                parse_secs(&secs).context("Invalid SHADOW_SYNC_ACK_TIMEOUT_SECS")?;
        }

        if let Some(secs) = lookup("SHADOW_SYNC_RETRY_DELAY_SECS") {
            config.sync.retry_delay =
                parse_secs(&secs).context("Invalid SHADOW_SYNC_RETRY_DELAY_SECS")?;
        }

        if let Some(secs) = lookup("SHADOW_SYNC_AWAIT_TIMEOUT_SECS") {
            config.sync.await_timeout =
                Some(parse_secs(&secs).context("Invalid SHADOW_SYNC_AWAIT_TIMEOUT_SECS")?);
        }

        if let Some(once) = lookup("SHADOW_SYNC_ONCE") {
            config.sync.once = matches!(once.as_str(), "1" | "true" | "yes");
        }

        Ok(config)
    }
}

fn parse_secs(value: &str) -> Result<Duration> {
    let secs: u64 = value
        .trim()
        .parse()
        .with_context(|| format!("'{value}' is not a number of seconds"))?;
    Ok(Duration::from_secs(secs))
}
