//! Publish/subscribe transport abstraction.
//!
//! Every call services the transport's inbound processing loop until its own
//! acknowledgment arrives. Publishes received meanwhile are buffered and handed
//! out by `recv()` in arrival order, so the sync engine consumes them on the
//! same task that issued the call.

#[cfg(test)]
mod mock;

#[cfg(test)]
pub(crate) use mock::MockTransport;

use async_trait::async_trait;
use thiserror::Error;

/// A raw inbound publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Topic the message arrived on
    pub topic: String,
    /// Raw payload
    pub payload: Vec<u8>,
}

impl InboundMessage {
    /// Create an inbound message.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// An established session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Session {
    /// Broker resumed a previous session
    pub session_present: bool,
}

/// Transport errors.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Connection attempt failed
    #[error("connection failed: {0}")]
    Connect(String),

    /// Subscribe was refused or could not be sent
    #[error("subscribe failed: {0}")]
    Subscribe(String),

    /// Publish could not be delivered
    #[error("publish failed: {0}")]
    Publish(String),

    /// Unsubscribe could not be sent
    #[error("unsubscribe failed: {0}")]
    Unsubscribe(String),

    /// Operation issued without a session
    #[error("not connected")]
    NotConnected,

    /// The session dropped
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

impl TransportError {
    /// Whether the error means the session is gone.
    #[must_use]
    pub fn is_session_lost(&self) -> bool {
        matches!(self, Self::ConnectionLost(_) | Self::NotConnected)
    }
}

/// Transport used by the supervisor and the sync engine.
#[async_trait]
pub trait Transport: Send {
    /// Establish a session.
    async fn connect(&mut self) -> Result<Session, TransportError>;

    /// Subscribe to a topic and wait for the acknowledgment.
    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    /// Publish a payload and wait for the acknowledgment.
    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError>;

    /// Unsubscribe from a topic and wait for the acknowledgment.
    async fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    /// Next inbound publish, buffered or freshly received.
    async fn recv(&mut self) -> Result<InboundMessage, TransportError>;

    /// Tear the session down. Never fails.
    async fn disconnect(&mut self);
}
