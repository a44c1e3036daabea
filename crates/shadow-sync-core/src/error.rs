//! Sync run failures.

use crate::correlation::Operation;
use crate::engine::SyncState;
use crate::transport::TransportError;
use shadow_sync_proto::CodecError;
use std::time::Duration;

/// Errors that end a sync run.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    /// Subscribing to a shadow topic failed
    #[error("subscribe to {topic} failed: {source}")]
    Subscribe {
        /// Topic filter
        topic: String,
        /// Transport failure
        source: TransportError,
    },

    /// Publishing a shadow request failed
    #[error("publish to {topic} failed: {source}")]
    Publish {
        /// Target topic
        topic: String,
        /// Transport failure
        source: TransportError,
    },

    /// A document could not be encoded
    #[error("encoding {operation} document failed: {source}")]
    Encode {
        /// Operation being published
        operation: Operation,
        /// Codec failure
        source: CodecError,
    },

    /// The shadow service rejected a request
    #[error("{operation} rejected with code {code}: {message}")]
    Rejected {
        /// Rejected operation
        operation: Operation,
        /// Status code
        code: u16,
        /// Reason given by the service
        message: String,
    },

    /// A waiting state hit its deadline
    #[error("no response while {state:?} within {after:?}")]
    Timeout {
        /// State that was waiting
        state: SyncState,
        /// Configured wait bound
        after: Duration,
    },

    /// The transport lost the session
    #[error("session lost: {0}")]
    SessionLost(TransportError),
}

impl SyncError {
    /// Whether the supervisor has to reconnect before the next run.
    #[must_use]
    pub fn is_session_lost(&self) -> bool {
        matches!(self, Self::SessionLost(_))
    }

    pub(crate) fn subscribe(topic: &str, source: TransportError) -> Self {
        if source.is_session_lost() {
            return Self::SessionLost(source);
        }
        Self::Subscribe {
            topic: topic.to_string(),
            source,
        }
    }

    pub(crate) fn publish(topic: &str, source: TransportError) -> Self {
        if source.is_session_lost() {
            return Self::SessionLost(source);
        }
        Self::Publish {
            topic: topic.to_string(),
            source,
        }
    }
}
