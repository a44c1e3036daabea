//! MQTT transport backed by rumqttc.
//!
//! Every call waits for its broker acknowledgment. Publishes that arrive while
//! a call is waiting are queued and handed out by `recv()` in arrival order.

use crate::config::MqttConfig;
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode, TlsConfiguration,
};
use shadow_sync_core::{InboundMessage, Session, Transport, TransportError};
use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;
use url::Url;

const PLAIN_PORT: u16 = 1883;
const TLS_PORT: u16 = 8883;
const REQUEST_CAPACITY: usize = 16;
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Transport over a single rumqttc connection.
pub struct MqttTransport {
    options: MqttOptions,
    ack_timeout: Duration,
    session: Option<MqttSession>,
    inbox: VecDeque<InboundMessage>,
}

struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
}

impl MqttTransport {
    /// Build a transport from configuration. No connection is opened yet.
    ///
    /// # Errors
    ///
    /// Returns error if the broker URL is invalid or TLS material cannot be read.
    pub fn new(config: &MqttConfig) -> Result<Self, MqttError> {
        let endpoint = parse_mqtt_url(&config.broker)?;

        let mut options = MqttOptions::new(&config.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_session(true);

        if endpoint.tls {
            options.set_transport(rumqttc::Transport::tls_with_config(tls_config(config)?));
        }

        tracing::debug!(
            host = %endpoint.host,
            port = endpoint.port,
            tls = endpoint.tls,
            client_id = %config.client_id,
            "MQTT transport configured"
        );

        Ok(Self {
            options,
            ack_timeout: config.ack_timeout,
            session: None,
            inbox: VecDeque::new(),
        })
    }

    fn client(&self) -> Result<AsyncClient, TransportError> {
        self.session
            .as_ref()
            .map(|session| session.client.clone())
            .ok_or(TransportError::NotConnected)
    }

    /// Poll the event loop until `request` is acknowledged, queueing inbound
    /// publishes.
    async fn await_ack(&mut self, request: Request) -> Result<Packet, TransportError> {
        let limit = self.ack_timeout;
        tokio::time::timeout(limit, self.pump_until(request))
            .await
            .map_err(|_| request.error(format!("no acknowledgment within {limit:?}")))?
    }

    async fn pump_until(&mut self, request: Request) -> Result<Packet, TransportError> {
        let session = self.session.as_mut().ok_or(TransportError::NotConnected)?;
        let mut waiter = AckWaiter::new(request);
        loop {
            match session.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.inbox
                        .push_back(InboundMessage::new(publish.topic, publish.payload.to_vec()));
                }
                Ok(event) => {
                    if let Some(ack) = waiter.observe(event) {
                        return Ok(ack);
                    }
                }
                Err(err) => {
                    self.session = None;
                    return Err(TransportError::ConnectionLost(err.to_string()));
                }
            }
        }
    }
}

/// Request kinds acknowledged by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    Subscribe,
    Publish,
    Unsubscribe,
}

impl Request {
    /// Packet id assigned when the request goes out.
    fn sent(self, outgoing: &Outgoing) -> Option<u16> {
        match (self, outgoing) {
            (Self::Subscribe, Outgoing::Subscribe(pkid))
            | (Self::Publish, Outgoing::Publish(pkid))
            | (Self::Unsubscribe, Outgoing::Unsubscribe(pkid)) => Some(*pkid),
            _ => None,
        }
    }

    /// Packet id carried by an acknowledgment of this kind.
    fn acked(self, packet: &Packet) -> Option<u16> {
        match (self, packet) {
            (Self::Subscribe, Packet::SubAck(ack)) => Some(ack.pkid),
            (Self::Publish, Packet::PubAck(ack)) => Some(ack.pkid),
            (Self::Unsubscribe, Packet::UnsubAck(ack)) => Some(ack.pkid),
            _ => None,
        }
    }

    fn error(self, reason: String) -> TransportError {
        match self {
            Self::Subscribe => TransportError::Subscribe(reason),
            Self::Publish => TransportError::Publish(reason),
            Self::Unsubscribe => TransportError::Unsubscribe(reason),
        }
    }
}

/// Pairs one request with its acknowledgment by packet id, so a late ack of
/// an earlier timed-out request is not mistaken for the current one.
#[derive(Debug)]
struct AckWaiter {
    request: Request,
    pkid: Option<u16>,
}

impl AckWaiter {
    fn new(request: Request) -> Self {
        Self {
            request,
            pkid: None,
        }
    }

    fn observe(&mut self, event: Event) -> Option<Packet> {
        match event {
            Event::Outgoing(outgoing) => {
                if self.pkid.is_none() {
                    self.pkid = self.request.sent(&outgoing);
                }
                None
            }
            Event::Incoming(packet) => {
                let acked = self.request.acked(&packet)?;
                if self.pkid == Some(acked) {
                    return Some(packet);
                }
                tracing::debug!(
                    pkid = acked,
                    expected = ?self.pkid,
                    "Ignoring stale acknowledgment"
                );
                None
            }
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&mut self) -> Result<Session, TransportError> {
        self.inbox.clear();
        let (client, mut eventloop) = AsyncClient::new(self.options.clone(), REQUEST_CAPACITY);

        let connack = tokio::time::timeout(self.ack_timeout, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => return Ok(ack),
                    Ok(_) => {}
                    Err(err) => return Err(TransportError::Connect(err.to_string())),
                }
            }
        })
        .await
        .map_err(|_| TransportError::Connect("timed out waiting for CONNACK".to_string()))??;

        if connack.code != ConnectReturnCode::Success {
            return Err(TransportError::Connect(format!(
                "broker refused connection: {:?}",
                connack.code
            )));
        }

        self.session = Some(MqttSession { client, eventloop });
        Ok(Session {
            session_present: connack.session_present,
        })
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        tracing::debug!(topic, "Subscribing");
        self.client()?
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Subscribe(format!("{topic}: {e}")))?;

        let ack = self.await_ack(Request::Subscribe).await?;

        if let Packet::SubAck(suback) = ack {
            if suback
                .return_codes
                .iter()
                .any(|code| matches!(code, SubscribeReasonCode::Failure))
            {
                return Err(TransportError::Subscribe(format!("{topic}: refused by broker")));
            }
        }
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        tracing::debug!(topic, payload_len = payload.len(), "Publishing");
        self.client()?
            .publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .await
            .map_err(|e| TransportError::Publish(format!("{topic}: {e}")))?;

        self.await_ack(Request::Publish).await?;
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        tracing::debug!(topic, "Unsubscribing");
        self.client()?
            .unsubscribe(topic)
            .await
            .map_err(|e| TransportError::Unsubscribe(format!("{topic}: {e}")))?;

        self.await_ack(Request::Unsubscribe).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<InboundMessage, TransportError> {
        if let Some(message) = self.inbox.pop_front() {
            return Ok(message);
        }

        let session = self.session.as_mut().ok_or(TransportError::NotConnected)?;
        loop {
            match session.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    return Ok(InboundMessage::new(publish.topic, publish.payload.to_vec()));
                }
                Ok(_) => {}
                Err(err) => {
                    self.session = None;
                    return Err(TransportError::ConnectionLost(err.to_string()));
                }
            }
        }
    }

    async fn disconnect(&mut self) {
        self.inbox.clear();
        let Some(mut session) = self.session.take() else {
            return;
        };

        if let Err(err) = session.client.disconnect().await {
            tracing::debug!(error = %err, "Disconnect request not queued");
            return;
        }

        // Drive the event loop until the DISCONNECT packet is flushed.
        let flushed = tokio::time::timeout(DISCONNECT_GRACE, async {
            loop {
                match session.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;

        if flushed.is_err() {
            tracing::debug!("Disconnect not flushed before grace period");
        }
    }
}

/// Broker address extracted from a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BrokerEndpoint {
    host: String,
    port: u16,
    tls: bool,
}

fn parse_mqtt_url(input: &str) -> Result<BrokerEndpoint, MqttError> {
    if input.contains("://") {
        let url =
            Url::parse(input).map_err(|e| MqttError::InvalidBrokerUrl(format!("{input}: {e}")))?;

        let tls = match url.scheme() {
            "tcp" | "mqtt" => false,
            "ssl" | "mqtts" => true,
            scheme => {
                return Err(MqttError::InvalidBrokerUrl(format!(
                    "{input}: unsupported scheme '{scheme}'"
                )));
            }
        };

        let host = url
            .host_str()
            .ok_or_else(|| MqttError::InvalidBrokerUrl(format!("{input}: missing host")))?;
        let port = url.port().unwrap_or(if tls { TLS_PORT } else { PLAIN_PORT });

        return Ok(BrokerEndpoint {
            host: host.to_string(),
            port,
            tls,
        });
    }

    let (host, port) = match input.split_once(':') {
        None => (input, PLAIN_PORT),
        Some((host, port)) => (
            host,
            port.parse().map_err(|_| {
                MqttError::InvalidBrokerUrl(format!("{input}: invalid port '{port}'"))
            })?,
        ),
    };
    if host.is_empty() {
        return Err(MqttError::InvalidBrokerUrl(format!("{input}: missing host")));
    }

    Ok(BrokerEndpoint {
        host: host.to_string(),
        port,
        tls: false,
    })
}

fn tls_config(config: &MqttConfig) -> Result<TlsConfiguration, MqttError> {
    let ca_path = config
        .ca_path
        .as_deref()
        .ok_or_else(|| MqttError::Tls("TLS broker requires a CA certificate".to_string()))?;
    let ca = read_pem(ca_path)?;

    let client_auth = match (config.cert_path.as_deref(), config.key_path.as_deref()) {
        (Some(cert), Some(key)) => Some((read_pem(cert)?, read_pem(key)?)),
        (None, None) => None,
        _ => {
            return Err(MqttError::Tls(
                "client certificate and key must be given together".to_string(),
            ))
        }
    };

    Ok(TlsConfiguration::Simple {
        ca,
        alpn: None,
        client_auth,
    })
}

fn read_pem(path: &Path) -> Result<Vec<u8>, MqttError> {
    std::fs::read(path).map_err(|e| MqttError::Tls(format!("{}: {e}", path.display())))
}

/// Errors configuring the MQTT transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MqttError {
    /// Invalid MQTT broker URL
    #[error("invalid MQTT broker URL: {0}")]
    InvalidBrokerUrl(String),

    /// TLS material missing or unreadable
    #[error("TLS configuration error: {0}")]
    Tls(String),
}
