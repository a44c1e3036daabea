//! Shadow synchronization state machine.
//!
//! One `sync()` call drives a single run:
//!
//! ```text
//! Idle -> DeletingShadow -> SubscribingDelta -> PublishingDesired -> AwaitingDelta
//!      -> PublishingReported -> AwaitingConfirm -> Unsubscribing -> Done
//! ```
//!
//! Inbound messages are classified by the `TopicRouter` and fed through a single
//! transition table keyed on `(state, message type)`. Any failure returns the
//! engine to `Idle`.

use crate::actuator::Actuator;
use crate::correlation::{CorrelationToken, CorrelationTracker, Operation};
use crate::error::SyncError;
use crate::transport::{InboundMessage, Transport};
use serde_json::Value;
use shadow_sync_proto::{
    DocumentCodec, MessageType, ShadowDocument, ShadowMessage, ShadowTopics, TopicKind,
    TopicRouter,
};
use std::time::Duration;
use tokio::time::Instant;

/// States of a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    /// No run in progress
    Idle,
    /// Waiting for the delete response
    DeletingShadow,
    /// Subscribing to the update topics
    SubscribingDelta,
    /// Publishing the desired state
    PublishingDesired,
    /// Waiting for the delta notification
    AwaitingDelta,
    /// Publishing the reported state
    PublishingReported,
    /// Waiting for the correlated update acknowledgment
    AwaitingConfirm,
    /// Releasing subscriptions
    Unsubscribing,
    /// Run completed
    Done,
}

/// Engine configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineConfig {
    /// Bound on each waiting state; `None` waits indefinitely
    pub await_timeout: Option<Duration>,
}

/// Summary of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    /// Local state reported back to the shadow
    pub reported: Value,
    /// Last document version acknowledged by the service
    pub version: Option<u64>,
    /// Responses ignored for carrying a foreign correlation token
    pub anomalies: u32,
}

/// State owned by one run, dropped when it ends.
#[derive(Debug)]
struct SyncRun {
    state: SyncState,
    tracker: CorrelationTracker,
    local_state: Option<Value>,
    subscriptions: Vec<String>,
    version: Option<u64>,
    anomalies: u32,
    deadline: Option<Instant>,
}

impl SyncRun {
    fn new() -> Self {
        Self {
            state: SyncState::Idle,
            tracker: CorrelationTracker::new(),
            local_state: None,
            subscriptions: Vec::new(),
            version: None,
            anomalies: 0,
            deadline: None,
        }
    }
}

/// Outcome of feeding one message to the transition table.
#[derive(Debug)]
enum Step {
    Stay,
    Advance(Command),
    Fail(SyncError),
}

/// Transport work requested by a transition.
#[derive(Debug, PartialEq)]
enum Command {
    SubscribeUpdates,
    Report(Value),
    Teardown,
}

/// Drives shadow synchronization runs.
pub struct ShadowSyncEngine<C, A> {
    topics: ShadowTopics,
    router: TopicRouter,
    codec: C,
    actuator: A,
    desired: Value,
    config: EngineConfig,
    state: SyncState,
}

impl<C, A> ShadowSyncEngine<C, A>
where
    C: DocumentCodec + Send,
    A: Actuator,
{
    /// Create an engine publishing `desired` at the start of every run.
    #[must_use]
    pub fn new(topics: ShadowTopics, codec: C, actuator: A, desired: Value) -> Self {
        Self {
            router: TopicRouter::new(topics.limits()),
            topics,
            codec,
            actuator,
            desired,
            config: EngineConfig::default(),
            state: SyncState::Idle,
        }
    }

    /// Replace the engine configuration.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// State reached by the last run.
    #[must_use]
    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Topics of the synchronized shadow.
    #[must_use]
    pub fn topics(&self) -> &ShadowTopics {
        &self.topics
    }

    /// The actuator.
    #[must_use]
    pub fn actuator(&self) -> &A {
        &self.actuator
    }

    /// Run one synchronization cycle over an established session.
    ///
    /// `on_message` observes every raw inbound message before it is routed.
    ///
    /// # Errors
    ///
    /// Returns the failure that sent the run back to `Idle`.
    pub async fn sync<T, F>(
        &mut self,
        transport: &mut T,
        on_message: &mut F,
    ) -> Result<RunOutcome, SyncError>
    where
        T: Transport,
        F: FnMut(&InboundMessage) + Send,
    {
        let mut run = SyncRun::new();
        self.state = SyncState::Idle;

        match self.drive(&mut run, transport, on_message).await {
            Ok(()) => {
                tracing::info!(
                    version = ?run.version,
                    anomalies = run.anomalies,
                    "Shadow sync run complete"
                );
                Ok(RunOutcome {
                    reported: run.local_state.take().unwrap_or_default(),
                    version: run.version,
                    anomalies: run.anomalies,
                })
            }
            Err(err) => {
                tracing::warn!(error = %err, state = ?run.state, "Shadow sync run failed");
                if !err.is_session_lost() {
                    self.release(&mut run, transport).await;
                }
                run.tracker.abandon();
                self.enter(&mut run, SyncState::Idle);
                Err(err)
            }
        }
    }

    async fn drive<T, F>(
        &mut self,
        run: &mut SyncRun,
        transport: &mut T,
        on_message: &mut F,
    ) -> Result<(), SyncError>
    where
        T: Transport,
        F: FnMut(&InboundMessage) + Send,
    {
        self.delete_shadow(run, transport).await?;

        loop {
            let message = self.next_message(run, transport, on_message).await?;

            match self.transition(run, &message) {
                Step::Stay => {}
                Step::Fail(err) => return Err(err),
                Step::Advance(Command::SubscribeUpdates) => {
                    self.subscribe_updates(run, transport).await?;
                    self.publish_desired(run, transport).await?;
                }
                Step::Advance(Command::Report(state)) => {
                    self.publish_reported(run, transport, state).await?;
                }
                Step::Advance(Command::Teardown) => {
                    self.enter(run, SyncState::Unsubscribing);
                    self.release(run, transport).await;
                    self.enter(run, SyncState::Done);
                    return Ok(());
                }
            }
        }
    }

    /// The transition table.
    fn transition(&mut self, run: &mut SyncRun, message: &ShadowMessage) -> Step {
        if message.message_type == MessageType::NotShadow {
            return Step::Stay;
        }
        if !self
            .topics
            .matches(message.thing_name.as_deref(), message.shadow_name.as_deref())
        {
            tracing::debug!(
                thing_name = ?message.thing_name,
                shadow_name = ?message.shadow_name,
                "Ignoring message for another shadow"
            );
            return Step::Stay;
        }

        match (run.state, message.message_type) {
            (SyncState::DeletingShadow, MessageType::DeleteAccepted) => {
                tracing::info!("Shadow document deleted");
                Step::Advance(Command::SubscribeUpdates)
            }
            (SyncState::DeletingShadow, MessageType::DeleteRejected) => {
                self.on_delete_rejected(&message.payload)
            }
            (SyncState::AwaitingDelta, MessageType::UpdateDelta) => {
                self.on_delta(run, &message.payload)
            }
            (
                SyncState::AwaitingDelta | SyncState::AwaitingConfirm,
                MessageType::UpdateAccepted,
            ) => self.on_update_accepted(run, &message.payload),
            (
                SyncState::AwaitingDelta | SyncState::AwaitingConfirm,
                MessageType::UpdateRejected,
            ) => self.on_update_rejected(run, &message.payload),
            (state, message_type) => {
                tracing::debug!(?state, ?message_type, "Ignoring unexpected shadow message");
                Step::Stay
            }
        }
    }

    fn on_delete_rejected(&self, payload: &[u8]) -> Step {
        let error = match self.codec.decode_error(payload) {
            Ok(error) => error,
            Err(err) => {
                tracing::warn!(error = %err, "Failed to decode delete/rejected payload");
                return Step::Stay;
            }
        };

        if error.is_not_found() {
            tracing::info!(message = %error.message, "No shadow document to delete");
            return Step::Advance(Command::SubscribeUpdates);
        }

        Step::Fail(SyncError::Rejected {
            operation: Operation::Delete,
            code: error.code,
            message: error.message,
        })
    }

    fn on_delta(&mut self, run: &mut SyncRun, payload: &[u8]) -> Step {
        let document = match self.codec.decode(payload) {
            Ok(document) => document,
            Err(err) => {
                tracing::warn!(error = %err, "Failed to decode update/delta payload");
                return Step::Stay;
            }
        };

        let delta = document.delta();
        let local = self.actuator.apply(&delta);
        tracing::info!(%delta, %local, version = ?document.version, "Applied shadow delta");

        run.version = document.version.or(run.version);
        run.local_state = Some(local.clone());
        Step::Advance(Command::Report(local))
    }

    fn on_update_accepted(&self, run: &mut SyncRun, payload: &[u8]) -> Step {
        let document = match self.codec.decode(payload) {
            Ok(document) => document,
            Err(err) => {
                tracing::warn!(error = %err, "Failed to decode update/accepted payload");
                return Step::Stay;
            }
        };

        let received = document.client_token();
        if !run.tracker.confirm(Operation::Update, parse_token(received)) {
            record_mismatch(run, received, "update/accepted");
            return Step::Stay;
        }

        run.version = document.version.or(run.version);
        if run.state == SyncState::AwaitingConfirm {
            tracing::info!(version = ?run.version, "Reported state accepted");
            Step::Advance(Command::Teardown)
        } else {
            tracing::debug!(version = ?run.version, "Desired state accepted");
            Step::Stay
        }
    }

    fn on_update_rejected(&self, run: &mut SyncRun, payload: &[u8]) -> Step {
        let error = match self.codec.decode_error(payload) {
            Ok(error) => error,
            Err(err) => {
                tracing::warn!(error = %err, "Failed to decode update/rejected payload");
                return Step::Stay;
            }
        };

        let received = error.client_token.as_deref();
        if !run.tracker.confirm(Operation::Update, parse_token(received)) {
            record_mismatch(run, received, "update/rejected");
            return Step::Stay;
        }

        Step::Fail(SyncError::Rejected {
            operation: Operation::Update,
            code: error.code,
            message: error.message,
        })
    }

    async fn delete_shadow<T: Transport>(
        &mut self,
        run: &mut SyncRun,
        transport: &mut T,
    ) -> Result<(), SyncError> {
        self.enter(run, SyncState::DeletingShadow);
        self.subscribe(run, transport, TopicKind::DeleteAccepted)
            .await?;
        self.subscribe(run, transport, TopicKind::DeleteRejected)
            .await?;

        let topic = self.topics.topic(TopicKind::Delete);
        tracing::info!(topic, "Requesting shadow delete");
        transport
            .publish(&topic, &[])
            .await
            .map_err(|e| SyncError::publish(&topic, e))?;

        self.arm_deadline(run);
        Ok(())
    }

    async fn subscribe_updates<T: Transport>(
        &mut self,
        run: &mut SyncRun,
        transport: &mut T,
    ) -> Result<(), SyncError> {
        self.enter(run, SyncState::SubscribingDelta);
        for kind in [
            TopicKind::UpdateDelta,
            TopicKind::UpdateAccepted,
            TopicKind::UpdateRejected,
        ] {
            self.subscribe(run, transport, kind).await?;
        }
        Ok(())
    }

    async fn publish_desired<T: Transport>(
        &mut self,
        run: &mut SyncRun,
        transport: &mut T,
    ) -> Result<(), SyncError> {
        self.enter(run, SyncState::PublishingDesired);
        let token = run.tracker.issue();
        run.tracker.remember(Operation::Update, token);

        let document = ShadowDocument::desired(self.desired.clone(), token.to_string());
        self.publish_update(transport, &document, token).await?;

        self.enter(run, SyncState::AwaitingDelta);
        self.arm_deadline(run);
        Ok(())
    }

    async fn publish_reported<T: Transport>(
        &mut self,
        run: &mut SyncRun,
        transport: &mut T,
        state: Value,
    ) -> Result<(), SyncError> {
        self.enter(run, SyncState::PublishingReported);
        let token = run.tracker.issue();
        run.tracker.remember(Operation::Update, token);

        let document = ShadowDocument::reported(state, token.to_string());
        self.publish_update(transport, &document, token).await?;

        self.enter(run, SyncState::AwaitingConfirm);
        self.arm_deadline(run);
        Ok(())
    }

    async fn publish_update<T: Transport>(
        &self,
        transport: &mut T,
        document: &ShadowDocument,
        token: CorrelationToken,
    ) -> Result<(), SyncError> {
        let payload = self
            .codec
            .encode(document)
            .map_err(|source| SyncError::Encode {
                operation: Operation::Update,
                source,
            })?;

        let topic = self.topics.topic(TopicKind::Update);
        tracing::info!(topic, %token, payload_len = payload.len(), "Publishing shadow update");
        transport
            .publish(&topic, &payload)
            .await
            .map_err(|e| SyncError::publish(&topic, e))
    }

    async fn subscribe<T: Transport>(
        &self,
        run: &mut SyncRun,
        transport: &mut T,
        kind: TopicKind,
    ) -> Result<(), SyncError> {
        let topic = self.topics.topic(kind);
        tracing::info!(topic, "Subscribing to shadow topic");

        transport
            .subscribe(&topic)
            .await
            .map_err(|e| SyncError::subscribe(&topic, e))?;

        run.subscriptions.push(topic);
        Ok(())
    }

    /// Unsubscribe from everything the run opened; failures are only logged.
    async fn release<T: Transport>(&self, run: &mut SyncRun, transport: &mut T) {
        for topic in run.subscriptions.drain(..) {
            if let Err(err) = transport.unsubscribe(&topic).await {
                tracing::warn!(topic, error = %err, "Failed to unsubscribe");
            }
        }
    }

    async fn next_message<T, F>(
        &self,
        run: &SyncRun,
        transport: &mut T,
        on_message: &mut F,
    ) -> Result<ShadowMessage, SyncError>
    where
        T: Transport,
        F: FnMut(&InboundMessage) + Send,
    {
        let received = match (run.deadline, self.config.await_timeout) {
            (Some(deadline), Some(after)) => tokio::time::timeout_at(deadline, transport.recv())
                .await
                .map_err(|_| SyncError::Timeout {
                    state: run.state,
                    after,
                })?,
            _ => transport.recv().await,
        };
        let inbound = received.map_err(SyncError::SessionLost)?;

        on_message(&inbound);

        let message = self.router.route(&inbound.topic, &inbound.payload);
        tracing::debug!(
            topic = %inbound.topic,
            message_type = ?message.message_type,
            payload_len = inbound.payload.len(),
            "Received message"
        );
        Ok(message)
    }

    fn enter(&mut self, run: &mut SyncRun, state: SyncState) {
        tracing::debug!(from = ?run.state, to = ?state, "Sync state transition");
        run.state = state;
        run.deadline = None;
        self.state = state;
    }

    fn arm_deadline(&self, run: &mut SyncRun) {
        run.deadline = self
            .config
            .await_timeout
            .map(|after| Instant::now() + after);
    }
}

fn parse_token(received: Option<&str>) -> Option<CorrelationToken> {
    received.and_then(|token| token.parse().ok())
}

fn record_mismatch(run: &mut SyncRun, received: Option<&str>, topic: &str) {
    run.anomalies += 1;
    tracing::warn!(
        anomaly = "correlation_mismatch",
        topic,
        received = ?received,
        pending = ?run.tracker.pending(Operation::Update).map(|t| t.to_string()),
        "Ignoring response for another request"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::MirrorActuator;
    use crate::transport::MockTransport;
    use serde_json::json;
    use shadow_sync_proto::JsonCodec;
    use tokio_test::{assert_err, assert_ok};

    const THING: &str = "lamp";

    fn topics() -> ShadowTopics {
        ShadowTopics::new(THING, None).unwrap()
    }

    fn topic(kind: TopicKind) -> String {
        topics().topic(kind)
    }

    fn engine() -> ShadowSyncEngine<JsonCodec, MirrorActuator> {
        ShadowSyncEngine::new(topics(), JsonCodec, MirrorActuator::new(), json!({"powerOn": 1}))
    }

    fn inbound(kind: TopicKind, payload: &serde_json::Value) -> InboundMessage {
        InboundMessage::new(topic(kind), payload.to_string())
    }

    fn token_of(payload: &[u8]) -> String {
        let value: serde_json::Value = serde_json::from_slice(payload).unwrap();
        value["clientToken"].as_str().unwrap().to_string()
    }

    /// Plays the shadow service: deletes, raises a delta for the desired
    /// state, accepts updates echoing their token.
    fn shadow_service(delete_reply: InboundMessage) -> MockTransport {
        let mut delete_reply = Some(delete_reply);
        let mut desired_token: Option<String> = None;

        MockTransport::new().connected().respond_with(move |topic, payload| {
            if topic.ends_with("/delete") {
                return delete_reply.take().into_iter().collect();
            }
            let document: serde_json::Value = serde_json::from_slice(payload).unwrap();
            let token = token_of(payload);

            if let Some(desired) = document["state"].get("desired") {
                desired_token = Some(token.clone());
                vec![
                    inbound(
                        TopicKind::UpdateAccepted,
                        &json!({"state": {"desired": desired}, "clientToken": token, "version": 1}),
                    ),
                    inbound(
                        TopicKind::UpdateDelta,
                        &json!({"state": desired, "version": 1}),
                    ),
                ]
            } else {
                let stale = desired_token.clone().unwrap_or_default();
                vec![
                    inbound(TopicKind::UpdateAccepted, &json!({"clientToken": stale})),
                    inbound(
                        TopicKind::UpdateAccepted,
                        &json!({"state": document["state"], "clientToken": token, "version": 2}),
                    ),
                ]
            }
        })
    }

    fn delete_accepted() -> InboundMessage {
        inbound(TopicKind::DeleteAccepted, &json!({"version": 7}))
    }

    #[tokio::test]
    async fn end_to_end_run_reaches_done() {
        let mut engine = engine();
        let mut transport = shadow_service(delete_accepted());

        let outcome = assert_ok!(engine.sync(&mut transport, &mut |_| {}).await);

        assert_eq!(engine.state(), SyncState::Done);
        assert_eq!(outcome.reported, json!({"powerOn": 1}));
        assert_eq!(outcome.version, Some(2));
        assert_eq!(outcome.anomalies, 1);

        let desired = transport.published_to("/update");
        assert_eq!(desired.len(), 2);
        assert_eq!(desired[0]["state"]["desired"], json!({"powerOn": 1}));
        assert_eq!(desired[1]["state"]["reported"], json!({"powerOn": 1}));
        assert_ne!(desired[0]["clientToken"], desired[1]["clientToken"]);

        assert_eq!(transport.subscribed.len(), 5);
        assert_eq!(transport.unsubscribed, transport.subscribed);
    }

    #[tokio::test]
    async fn delete_is_published_empty() {
        let mut engine = engine();
        let mut transport = shadow_service(delete_accepted());

        assert_ok!(engine.sync(&mut transport, &mut |_| {}).await);

        let (delete_topic, payload) = &transport.published[0];
        assert_eq!(delete_topic, &topic(TopicKind::Delete));
        assert!(payload.is_empty());
        assert_eq!(
            &transport.subscribed[..2],
            &[topic(TopicKind::DeleteAccepted), topic(TopicKind::DeleteRejected)]
        );
    }

    #[test]
    fn delete_rejected_not_found_matches_delete_accepted() {
        let router = TopicRouter::default();

        for (kind, payload) in [
            (TopicKind::DeleteAccepted, json!({"version": 3})),
            (
                TopicKind::DeleteRejected,
                json!({"code": 404, "message": "No shadow exists with name: 'lamp'"}),
            ),
        ] {
            let mut engine = engine();
            let mut run = SyncRun::new();
            engine.enter(&mut run, SyncState::DeletingShadow);

            let message = router.route(&topic(kind), payload.to_string().as_bytes());
            let step = engine.transition(&mut run, &message);

            assert!(
                matches!(step, Step::Advance(Command::SubscribeUpdates)),
                "{kind:?}: {step:?}"
            );
        }
    }

    #[tokio::test]
    async fn delete_rejected_not_found_completes_run() {
        let mut engine = engine();
        let reply = inbound(
            TopicKind::DeleteRejected,
            &json!({"code": 404, "message": "No shadow exists with name: 'lamp'"}),
        );
        let mut transport = shadow_service(reply);

        assert_ok!(engine.sync(&mut transport, &mut |_| {}).await);
        assert_eq!(engine.state(), SyncState::Done);
    }

    #[tokio::test]
    async fn delete_rejected_other_code_fails_run() {
        let mut engine = engine();
        let reply = inbound(
            TopicKind::DeleteRejected,
            &json!({"code": 403, "message": "Forbidden"}),
        );
        let mut transport = shadow_service(reply);

        let err = assert_err!(engine.sync(&mut transport, &mut |_| {}).await);

        assert!(matches!(
            err,
            SyncError::Rejected {
                operation: Operation::Delete,
                code: 403,
                ..
            }
        ));
        assert_eq!(engine.state(), SyncState::Idle);
        assert_eq!(transport.unsubscribed, transport.subscribed);
        assert!(transport.published_to("/update").is_empty());
    }

    #[tokio::test]
    async fn malformed_payload_is_dropped() {
        let mut engine = engine();
        let mut transport = MockTransport::new().connected().respond_with(|target, payload| {
            if target.ends_with("/delete") {
                return vec![delete_accepted()];
            }
            let token = token_of(payload);
            if payload.windows(7).any(|w| w == b"desired") {
                vec![
                    InboundMessage::new(topic(TopicKind::UpdateDelta), "{\"state\":"),
                    inbound(TopicKind::UpdateDelta, &json!({"state": {"powerOn": 1}})),
                ]
            } else {
                vec![
                    InboundMessage::new(topic(TopicKind::UpdateAccepted), "not json"),
                    inbound(TopicKind::UpdateAccepted, &json!({"clientToken": token})),
                ]
            }
        });

        let outcome = assert_ok!(engine.sync(&mut transport, &mut |_| {}).await);

        assert_eq!(outcome.reported, json!({"powerOn": 1}));
        assert_eq!(outcome.anomalies, 0);
        assert_eq!(transport.published_to("/update").len(), 2);
    }

    #[tokio::test]
    async fn correlated_update_rejection_fails_run() {
        let mut engine = engine();
        let mut transport = MockTransport::new().connected().respond_with(|target, payload| {
            if target.ends_with("/delete") {
                return vec![delete_accepted()];
            }
            vec![
                inbound(
                    TopicKind::UpdateRejected,
                    &json!({"code": 400, "message": "stale", "clientToken": "999999x"}),
                ),
                inbound(
                    TopicKind::UpdateRejected,
                    &json!({"code": 400, "message": "Missing required node: state", "clientToken": token_of(payload)}),
                ),
            ]
        });

        let err = assert_err!(engine.sync(&mut transport, &mut |_| {}).await);

        assert!(matches!(
            err,
            SyncError::Rejected {
                operation: Operation::Update,
                code: 400,
                ..
            }
        ));
        assert_eq!(engine.state(), SyncState::Idle);
        assert_eq!(transport.unsubscribed.len(), 5);
    }

    #[tokio::test]
    async fn subscribe_failure_releases_opened_topics() {
        let mut engine = engine();
        let mut transport = shadow_service(delete_accepted()).fail_subscribe("update/delta");

        let err = assert_err!(engine.sync(&mut transport, &mut |_| {}).await);

        assert!(matches!(err, SyncError::Subscribe { .. }));
        assert_eq!(engine.state(), SyncState::Idle);
        assert_eq!(
            transport.unsubscribed,
            vec![topic(TopicKind::DeleteAccepted), topic(TopicKind::DeleteRejected)]
        );
    }

    #[tokio::test]
    async fn publish_failure_fails_run() {
        let mut engine = engine();
        let mut transport = shadow_service(delete_accepted()).fail_publish("/update");

        let err = assert_err!(engine.sync(&mut transport, &mut |_| {}).await);

        assert!(matches!(err, SyncError::Publish { .. }));
        assert!(!err.is_session_lost());
        assert_eq!(engine.state(), SyncState::Idle);
    }

    #[tokio::test]
    async fn session_loss_aborts_without_unsubscribing() {
        let mut engine = engine();
        // delete is never answered, so the script runs dry
        let mut transport = MockTransport::new().connected();

        let err = assert_err!(engine.sync(&mut transport, &mut |_| {}).await);

        assert!(err.is_session_lost());
        assert_eq!(engine.state(), SyncState::Idle);
        assert!(transport.unsubscribed.is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_failures_do_not_block_done() {
        let mut engine = engine();
        let mut transport = shadow_service(delete_accepted()).fail_unsubscribe();

        assert_ok!(engine.sync(&mut transport, &mut |_| {}).await);

        assert_eq!(engine.state(), SyncState::Done);
        assert!(transport.unsubscribed.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn await_timeout_returns_to_idle() {
        let mut engine = engine().with_config(EngineConfig {
            await_timeout: Some(Duration::from_secs(30)),
        });
        let mut transport = MockTransport::new()
            .connected()
            .hang_when_idle()
            .respond_with(|topic, _| {
                if topic.ends_with("/delete") {
                    vec![delete_accepted()]
                } else {
                    Vec::new()
                }
            });

        let err = assert_err!(engine.sync(&mut transport, &mut |_| {}).await);

        assert!(matches!(
            err,
            SyncError::Timeout {
                state: SyncState::AwaitingDelta,
                ..
            }
        ));
        assert_eq!(engine.state(), SyncState::Idle);
    }

    #[tokio::test]
    async fn foreign_messages_are_ignored_but_observed() {
        let mut engine = engine();
        let mut transport = shadow_service(delete_accepted());
        transport.push("$aws/things/other/shadow/delete/rejected", b"{\"code\":500}");
        transport.push("$aws/things/lamp/shadow/name/kitchen/delete/accepted", b"{}");
        transport.push("/luz/gabriel", b"toggle");

        let mut seen = Vec::new();
        let outcome = assert_ok!(
            engine
                .sync(&mut transport, &mut |message: &InboundMessage| {
                    seen.push(message.topic.clone());
                })
                .await
        );

        assert_eq!(outcome.reported, json!({"powerOn": 1}));
        assert_eq!(seen[..3], ["$aws/things/other/shadow/delete/rejected", "$aws/things/lamp/shadow/name/kitchen/delete/accepted", "/luz/gabriel"]);
        assert_eq!(seen.len(), 3 + 1 + 2 + 2);
    }

    #[test]
    fn loosely_echoed_token_is_an_anomaly() {
        let router = TopicRouter::default();
        let mut engine = engine();
        let mut run = SyncRun::new();
        let token = run.tracker.issue_at(3_000_042);
        run.tracker.remember(Operation::Update, token);
        engine.enter(&mut run, SyncState::AwaitingConfirm);

        for echoed in ["42", "+42", "0000042"] {
            let payload = json!({"clientToken": echoed}).to_string();
            let message = router.route(&topic(TopicKind::UpdateAccepted), payload.as_bytes());
            assert!(matches!(engine.transition(&mut run, &message), Step::Stay));
        }
        assert_eq!(run.anomalies, 3);
        assert_eq!(run.tracker.pending(Operation::Update), Some(token));

        let payload = json!({"clientToken": "000042"}).to_string();
        let message = router.route(&topic(TopicKind::UpdateAccepted), payload.as_bytes());
        assert!(matches!(
            engine.transition(&mut run, &message),
            Step::Advance(Command::Teardown)
        ));
    }

    #[tokio::test]
    async fn custom_limits_reach_the_router() {
        let limits = shadow_sync_proto::TopicLimits {
            max_thing_len: 256,
            max_shadow_len: 64,
        };
        let topics = ShadowTopics::with_limits(&"t".repeat(200), None, limits).unwrap();
        let replies = topics.clone();
        let mut engine =
            ShadowSyncEngine::new(topics, JsonCodec, MirrorActuator::new(), json!({"powerOn": 1}));

        let mut transport = MockTransport::new().connected().respond_with(move |target, payload| {
            let reply = |kind: TopicKind, body: serde_json::Value| {
                InboundMessage::new(replies.topic(kind), body.to_string())
            };
            if target.ends_with("/delete") {
                return vec![reply(TopicKind::DeleteAccepted, json!({}))];
            }
            let document: serde_json::Value = serde_json::from_slice(payload).unwrap();
            let mut out = vec![reply(
                TopicKind::UpdateAccepted,
                json!({"clientToken": document["clientToken"]}),
            )];
            if let Some(desired) = document["state"].get("desired") {
                out.push(reply(TopicKind::UpdateDelta, json!({"state": desired})));
            }
            out
        });

        let outcome = assert_ok!(engine.sync(&mut transport, &mut |_| {}).await);

        assert_eq!(engine.state(), SyncState::Done);
        assert_eq!(outcome.reported, json!({"powerOn": 1}));
        assert_eq!(transport.published_to("/update").len(), 2);
    }
}
