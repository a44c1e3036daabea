//! Session supervision around the transport.
//!
//! Connect attempts are retried forever with a fixed delay. Each established
//! session gets one successful sync run; failed runs are retried on the same
//! session, and only session loss sends the supervisor back to connecting.

use crate::actuator::Actuator;
use crate::engine::{RunOutcome, ShadowSyncEngine};
use crate::error::SyncError;
use crate::transport::{InboundMessage, Transport};
use shadow_sync_proto::DocumentCodec;
use std::convert::Infallible;
use std::time::Duration;

/// Supervisor configuration.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    /// Fixed delay between connect attempts and between failed runs
    pub retry_delay: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// Owns the transport and keeps a session alive.
pub struct SessionSupervisor<T> {
    transport: T,
    config: SupervisorConfig,
}

impl<T: Transport> SessionSupervisor<T> {
    /// Create a supervisor over `transport`.
    #[must_use]
    pub fn new(transport: T, config: SupervisorConfig) -> Self {
        Self { transport, config }
    }

    /// The supervised transport.
    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Close the session, if any.
    pub async fn shutdown(&mut self) {
        self.transport.disconnect().await;
    }

    /// Connect, retrying without limit. Returns the number of retries.
    pub async fn connect_with_retry(&mut self) -> usize {
        let mut retries = 0;
        loop {
            match self.transport.connect().await {
                Ok(session) => {
                    tracing::info!(
                        retries,
                        session_present = session.session_present,
                        "Connected to MQTT broker"
                    );
                    return retries;
                }
                Err(err) => {
                    retries += 1;
                    tracing::warn!(
                        error = %err,
                        attempt = retries,
                        delay = ?self.config.retry_delay,
                        "Error on connect. Retrying..."
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        }
    }

    /// Bounded mode: connect, drive a single run, disconnect.
    ///
    /// # Errors
    ///
    /// Returns the failure of the run.
    pub async fn run_once<C, A, F>(
        &mut self,
        engine: &mut ShadowSyncEngine<C, A>,
        mut on_message: F,
    ) -> Result<RunOutcome, SyncError>
    where
        C: DocumentCodec + Send,
        A: Actuator,
        F: FnMut(&InboundMessage) + Send,
    {
        self.connect_with_retry().await;
        let result = engine.sync(&mut self.transport, &mut on_message).await;
        self.transport.disconnect().await;
        result
    }

    /// Keep the shadow synchronized until the process is stopped.
    pub async fn run<C, A, F>(
        &mut self,
        engine: &mut ShadowSyncEngine<C, A>,
        mut on_message: F,
    ) -> Infallible
    where
        C: DocumentCodec + Send,
        A: Actuator,
        F: FnMut(&InboundMessage) + Send,
    {
        loop {
            self.connect_with_retry().await;
            self.serve_session(engine, &mut on_message).await;
            self.transport.disconnect().await;
            tracing::warn!("Session lost, reconnecting");
        }
    }

    /// Returns once the session is gone.
    async fn serve_session<C, A, F>(
        &mut self,
        engine: &mut ShadowSyncEngine<C, A>,
        on_message: &mut F,
    ) where
        C: DocumentCodec + Send,
        A: Actuator,
        F: FnMut(&InboundMessage) + Send,
    {
        loop {
            match engine.sync(&mut self.transport, on_message).await {
                Ok(outcome) => {
                    tracing::info!(
                        reported = %outcome.reported,
                        "Shadow in sync, idling until the session drops"
                    );
                    break;
                }
                Err(err) if err.is_session_lost() => return,
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        delay = ?self.config.retry_delay,
                        "Sync run failed. Retrying..."
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        }

        loop {
            match self.transport.recv().await {
                Ok(message) => {
                    tracing::debug!(topic = %message.topic, "Inbound message while idle");
                    on_message(&message);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "Session ended");
                    return;
                }
            }
        }
    }
}
