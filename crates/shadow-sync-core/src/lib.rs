//! # Shadow Sync Core
//!
//! Keeps a device's local state and its cloud shadow document reconciled.
//!
//! This crate provides:
//! - `CorrelationTracker`: clientToken issuing and acknowledgment matching
//! - `ShadowSyncEngine`: the delete/subscribe/desired/delta/reported/confirm cycle
//! - `SessionSupervisor`: unbounded connect-retry loop around a `Transport`
//! - `Transport` and `Actuator` seams for the broker and the hardware

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod actuator;
pub mod correlation;
pub mod engine;
pub mod error;
pub mod supervisor;
pub mod transport;

pub use actuator::{Actuator, MirrorActuator};
pub use correlation::{CorrelationToken, CorrelationTracker, InvalidToken, Operation};
pub use engine::{EngineConfig, RunOutcome, ShadowSyncEngine, SyncState};
pub use error::SyncError;
pub use supervisor::{SessionSupervisor, SupervisorConfig};
pub use transport::{InboundMessage, Session, Transport, TransportError};
