//! Scripted transport for testing.
//!
//! Records every call and lets a responder closure inject inbound messages in
//! reaction to publishes, the way a broker and shadow service would.

use super::{InboundMessage, Session, Transport, TransportError};
use async_trait::async_trait;
use std::collections::VecDeque;

type Responder = Box<dyn FnMut(&str, &[u8]) -> Vec<InboundMessage> + Send>;

/// Mock transport for testing.
#[derive(Default)]
pub(crate) struct MockTransport {
    pub connected: bool,
    pub connect_attempts: usize,
    pub disconnects: usize,
    pub subscribed: Vec<String>,
    pub unsubscribed: Vec<String>,
    pub published: Vec<(String, Vec<u8>)>,
    inbox: VecDeque<InboundMessage>,
    responder: Option<Responder>,
    fail_connects: usize,
    session_limit: Option<usize>,
    sessions: usize,
    fail_subscribe: Option<String>,
    fail_publish: Option<String>,
    fail_unsubscribe: bool,
    hang_when_idle: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a live session.
    pub fn connected(mut self) -> Self {
        self.connected = true;
        self
    }

    /// Fail the next `count` connect attempts.
    pub fn fail_connects(mut self, count: usize) -> Self {
        self.fail_connects = count;
        self
    }

    /// Refuse every connect after `count` successful sessions.
    pub fn session_limit(mut self, count: usize) -> Self {
        self.session_limit = Some(count);
        self
    }

    /// Fail subscribing to topics ending with `suffix`.
    pub fn fail_subscribe(mut self, suffix: &str) -> Self {
        self.fail_subscribe = Some(suffix.to_string());
        self
    }

    /// Fail publishing to topics ending with `suffix`.
    pub fn fail_publish(mut self, suffix: &str) -> Self {
        self.fail_publish = Some(suffix.to_string());
        self
    }

    /// Fail every unsubscribe.
    pub fn fail_unsubscribe(mut self) -> Self {
        self.fail_unsubscribe = true;
        self
    }

    /// Block in `recv()` instead of reporting session loss when idle.
    pub fn hang_when_idle(mut self) -> Self {
        self.hang_when_idle = true;
        self
    }

    /// React to publishes with inbound messages.
    pub fn respond_with<F>(mut self, responder: F) -> Self
    where
        F: FnMut(&str, &[u8]) -> Vec<InboundMessage> + Send + 'static,
    {
        self.responder = Some(Box::new(responder));
        self
    }

    /// Queue an inbound message.
    pub fn push(&mut self, topic: &str, payload: &[u8]) {
        self.inbox.push_back(InboundMessage::new(topic, payload));
    }

    /// Payloads published to topics ending with `suffix`.
    pub fn published_to(&self, suffix: &str) -> Vec<serde_json::Value> {
        self.published
            .iter()
            .filter(|(topic, _)| topic.ends_with(suffix))
            .map(|(_, payload)| serde_json::from_slice(payload).unwrap_or_default())
            .collect()
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.connected {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self) -> Result<Session, TransportError> {
        self.connect_attempts += 1;

        if self.fail_connects > 0 {
            self.fail_connects -= 1;
            return Err(TransportError::Connect("broker unreachable".to_string()));
        }
        if self.session_limit.is_some_and(|limit| self.sessions >= limit) {
            return Err(TransportError::Connect("session limit reached".to_string()));
        }

        self.sessions += 1;
        self.connected = true;
        Ok(Session::default())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.ensure_connected()?;
        if self
            .fail_subscribe
            .as_deref()
            .is_some_and(|suffix| topic.ends_with(suffix))
        {
            return Err(TransportError::Subscribe(format!("{topic}: refused")));
        }
        self.subscribed.push(topic.to_string());
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.ensure_connected()?;
        if self
            .fail_publish
            .as_deref()
            .is_some_and(|suffix| topic.ends_with(suffix))
        {
            return Err(TransportError::Publish(format!("{topic}: no ack")));
        }
        self.published.push((topic.to_string(), payload.to_vec()));

        if let Some(responder) = self.responder.as_mut() {
            let replies = responder(topic, payload);
            self.inbox.extend(replies);
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.ensure_connected()?;
        if self.fail_unsubscribe {
            return Err(TransportError::Unsubscribe(format!("{topic}: refused")));
        }
        self.unsubscribed.push(topic.to_string());
        Ok(())
    }

    async fn recv(&mut self) -> Result<InboundMessage, TransportError> {
        self.ensure_connected()?;
        if let Some(message) = self.inbox.pop_front() {
            return Ok(message);
        }
        if self.hang_when_idle {
            std::future::pending::<()>().await;
        }
        self.connected = false;
        Err(TransportError::ConnectionLost("script exhausted".to_string()))
    }

    async fn disconnect(&mut self) {
        self.disconnects += 1;
        self.connected = false;
    }
}
