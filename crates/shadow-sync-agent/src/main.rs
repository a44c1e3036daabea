//! # Shadow Sync Agent
//!
//! Keeps a device shadow synchronized with a local light over MQTT.
//!
//! Each session resets the shadow, publishes the configured desired state,
//! applies the resulting delta to the light and reports the new state back.
//! Connection failures are retried with a fixed delay; a lost session is
//! re-established and synchronized again.

use anyhow::{Context, Result};
use shadow_sync_core::{
    EngineConfig, InboundMessage, SessionSupervisor, ShadowSyncEngine, SupervisorConfig,
};
use shadow_sync_proto::{JsonCodec, ShadowTopics};
use tracing_subscriber::EnvFilter;

mod config;
mod light;
mod mqtt;

pub use config::AgentConfig;
pub use light::Light;
pub use mqtt::MqttTransport;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting shadow sync agent"
    );

    let config = AgentConfig::from_env()?;

    let topics = ShadowTopics::new(
        &config.shadow.thing_name,
        config.shadow.shadow_name.as_deref(),
    )
    .context("Invalid thing or shadow name")?;
    let transport = MqttTransport::new(&config.mqtt).context("Invalid MQTT configuration")?;

    let mut engine = ShadowSyncEngine::new(
        topics,
        JsonCodec,
        Light::new(),
        config.shadow.desired_state.clone(),
    )
    .with_config(EngineConfig {
        await_timeout: config.sync.await_timeout,
    });
    let mut supervisor = SessionSupervisor::new(
        transport,
        SupervisorConfig {
            retry_delay: config.sync.retry_delay,
        },
    );

    tracing::info!(
        thing = %config.shadow.thing_name,
        shadow = config.shadow.shadow_name.as_deref().unwrap_or("<classic>"),
        broker = %config.mqtt.broker,
        "Agent initialized"
    );

    if config.sync.once {
        let outcome = supervisor
            .run_once(&mut engine, log_inbound)
            .await
            .context("Shadow sync failed")?;
        tracing::info!(
            reported = %outcome.reported,
            version = ?outcome.version,
            anomalies = outcome.anomalies,
            "Shadow synchronized"
        );
        return Ok(());
    }

    tracing::info!("Agent running, press Ctrl+C to stop");

    tokio::select! {
        never = supervisor.run(&mut engine, log_inbound) => match never {},
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    supervisor.shutdown().await;
    tracing::info!("Agent stopped");

    Ok(())
}

fn log_inbound(message: &InboundMessage) {
    tracing::debug!(
        topic = %message.topic,
        payload_len = message.payload.len(),
        "Received MQTT message"
    );
}
