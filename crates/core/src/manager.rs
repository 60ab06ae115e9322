//! Connection Session Manager
//!
//! Owns the lifecycle state of the one real-time session, drives the
//! negotiator, and publishes every transition through a `watch` channel.
//!
//! All mutations run inside `watch::Sender::send_if_modified`, so each
//! transition is atomic with respect to observers and to other transitions.

use crate::error::{NegotiationError, PreconditionError, SessionError};
use crate::negotiator::Negotiator;
use crate::precondition::{KeyRemovalObserver, ProviderKeySource};
use crate::session::{
    ConnectionPhase, ConnectionState, ErrorInfo, SessionCredential, SessionProfile,
    TransportParams,
};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{Instrument, Span, debug, error, info, instrument, warn};

/// Handle to the connection lifecycle. Clones share the same state.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    negotiator: Arc<dyn Negotiator>,
    profile: SessionProfile,
    provider_key: ProviderKeySource,
    state: watch::Sender<ConnectionState>,
}

enum Begin {
    Started(u64),
    AlreadyActive(ConnectionPhase),
    Refused(PreconditionError),
}

#[derive(Clone, Copy)]
enum Teardown {
    Requested,
    ProviderKeyRemoved,
}

impl ConnectionManager {
    /// Creates a manager in the `Idle` phase and registers it for removals
    /// of `provider_key`.
    pub fn new(
        negotiator: Arc<dyn Negotiator>,
        profile: SessionProfile,
        provider_key: ProviderKeySource,
    ) -> Self {
        let (state, _rx) = watch::channel(ConnectionState::default());
        let inner = Arc::new(Inner {
            negotiator,
            profile,
            provider_key,
            state,
        });
        let observer: Weak<dyn KeyRemovalObserver> = Arc::downgrade(&inner) as Weak<Inner>;
        inner.provider_key.observe(observer);
        Self { inner }
    }

    /// Negotiates a new session with the broker.
    ///
    /// A call while a session is already connecting or connected does nothing.
    /// The exchange runs on its own task, so the state still settles when the
    /// returned future is dropped early.
    ///
    /// If the attempt is cancelled by `disconnect()` or by removal of the
    /// provider key before the broker answers, the result is discarded and the
    /// call resolves with `Ok(())` even if the broker failed. Read `state()`
    /// for the outcome.
    #[instrument(name = "connect", skip(self), fields(attempt, room))]
    pub async fn connect(&self) -> Result<(), SessionError> {
        let request = self.inner.profile.new_request();
        let attempt = match self.inner.begin(&request.room_name) {
            Begin::Started(attempt) => attempt,
            Begin::AlreadyActive(phase) => {
                debug!(%phase, "Ignoring connect request; session already active");
                return Ok(());
            }
            Begin::Refused(err) => {
                warn!(error = %err, "Refusing to connect");
                return Err(err.into());
            }
        };

        let span = Span::current();
        span.record("attempt", attempt);
        span.record("room", request.room_name.as_str());
        info!("Negotiating session with broker...");

        let inner = Arc::clone(&self.inner);
        let negotiation = tokio::spawn(
            async move {
                let result = inner.negotiator.negotiate(&request).await;
                inner.settle(attempt, result)
            }
            .instrument(span),
        );

        match negotiation.await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(error = %err, "Negotiation task failed");
                let failure = NegotiationError::transport(format!("negotiation task failed: {err}"));
                self.inner.settle(attempt, Err(failure))
            }
        }
    }

    /// Tears the session down. Never fails and is a no-op while idle.
    ///
    /// While a negotiation is in flight the attempt is cancelled; the state
    /// returns to `Idle` as soon as the broker answers.
    pub async fn disconnect(&self) {
        self.inner.teardown(Teardown::Requested);
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn transport_params(&self) -> TransportParams {
        self.inner.state.borrow().transport_params()
    }

    pub fn provider_key(&self) -> &ProviderKeySource {
        &self.inner.provider_key
    }
}

impl Inner {
    fn begin(&self, room_name: &str) -> Begin {
        let mut begin = Begin::AlreadyActive(ConnectionPhase::Connecting);
        self.state.send_if_modified(|s| match s.phase {
            ConnectionPhase::Connecting | ConnectionPhase::Connected => {
                begin = Begin::AlreadyActive(s.phase);
                false
            }
            ConnectionPhase::Idle | ConnectionPhase::Error => {
                if !self.provider_key.is_present() {
                    let err = PreconditionError::MissingProviderKey;
                    s.last_error = Some(ErrorInfo::from(&err));
                    begin = Begin::Refused(err);
                    return true;
                }
                s.attempt += 1;
                s.phase = ConnectionPhase::Connecting;
                s.credential = None;
                s.last_error = None;
                s.voice = None;
                s.room_name = Some(room_name.to_string());
                begin = Begin::Started(s.attempt);
                true
            }
        });
        begin
    }

    fn settle(
        &self,
        attempt: u64,
        result: Result<SessionCredential, NegotiationError>,
    ) -> Result<(), SessionError> {
        let mut outcome = Ok(());

        self.state.send_if_modified(|s| {
            if s.attempt != attempt || s.phase != ConnectionPhase::Connecting {
                debug!(current = s.attempt, "Discarding result of a cancelled attempt");
                return reset_cancelled(s);
            }
            match result {
                Ok(_) if !self.provider_key.is_present() => {
                    warn!("Provider key removed during negotiation; discarding credential");
                    s.attempt += 1;
                    reset_cancelled(s)
                }
                Ok(credential) => {
                    s.phase = ConnectionPhase::Connected;
                    s.credential = Some(credential);
                    s.voice = Some(self.profile.voice);
                    info!(attempt, "Session connected");
                    true
                }
                Err(err) => {
                    warn!(attempt, error = %err, "Session negotiation failed");
                    s.phase = ConnectionPhase::Error;
                    s.credential = None;
                    s.voice = None;
                    s.last_error = Some(ErrorInfo::from(&err));
                    outcome = Err(SessionError::from(err));
                    true
                }
            }
        });
        outcome
    }

    fn teardown(&self, cause: Teardown) {
        self.state.send_if_modified(|s| match (s.phase, cause) {
            (ConnectionPhase::Idle, _) => false,
            (ConnectionPhase::Error, Teardown::ProviderKeyRemoved) => false,
            (ConnectionPhase::Connecting, _) => {
                s.attempt += 1;
                match cause {
                    Teardown::Requested => info!("Cancelling session negotiation in flight"),
                    Teardown::ProviderKeyRemoved => {
                        warn!("Provider key removed while connecting. Cancelling...")
                    }
                }
                true
            }
            (ConnectionPhase::Connected | ConnectionPhase::Error, _) => {
                if let Teardown::ProviderKeyRemoved = cause {
                    warn!("Provider key removed while connected. Disconnecting...");
                }
                s.phase = ConnectionPhase::Idle;
                s.credential = None;
                s.voice = None;
                s.room_name = None;
                s.last_error = None;
                info!(attempt = s.attempt, "Session disconnected");
                true
            }
        });
    }
}

impl KeyRemovalObserver for Inner {
    fn key_removed(&self) {
        self.teardown(Teardown::ProviderKeyRemoved);
    }
}

/// Moves a cancelled `Connecting` state back to `Idle`.
fn reset_cancelled(s: &mut ConnectionState) -> bool {
    if s.phase != ConnectionPhase::Connecting {
        return false;
    }
    s.phase = ConnectionPhase::Idle;
    s.credential = None;
    s.voice = None;
    s.room_name = None;
    info!(attempt = s.attempt, "Cancelled attempt settled; session idle");
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NegotiationFailure;
    use crate::negotiator::MockNegotiator;
    use crate::session::{ErrorKind, SessionRequest, Voice};
    use async_trait::async_trait;
    use secrecy::SecretString;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::task::JoinHandle;

    const MEDIA: &str = "wss://media.example.test";

    fn profile() -> SessionProfile {
        SessionProfile::new("test-user", "agent-42")
    }

    fn key() -> ProviderKeySource {
        ProviderKeySource::new(Some(SecretString::from("sk-test")))
    }

    fn manager_with(
        negotiator: impl Negotiator + 'static,
        key: ProviderKeySource,
    ) -> ConnectionManager {
        ConnectionManager::new(Arc::new(negotiator), profile(), key)
    }

    fn succeeding_mock(times: usize, token: &'static str) -> MockNegotiator {
        let mut mock = MockNegotiator::new();
        mock.expect_negotiate()
            .times(times)
            .returning(move |_| Ok(SessionCredential::new(MEDIA, token)));
        mock
    }

    fn assert_invariants(state: &ConnectionState) {
        assert_eq!(
            state.credential.is_some(),
            state.phase == ConnectionPhase::Connected,
            "credential must be present iff connected: {:?}",
            state
        );
        assert_eq!(state.should_connect(), state.phase == ConnectionPhase::Connected);
    }

    async fn wait_for_phase(
        manager: &ConnectionManager,
        phase: ConnectionPhase,
    ) -> ConnectionState {
        let mut rx = manager.subscribe();
        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|s| s.phase == phase))
            .await
            .expect("timed out waiting for phase")
            .expect("state channel closed")
            .clone()
    }

    /// Blocks inside `negotiate` until the test releases it.
    struct GatedNegotiator {
        calls: AtomicUsize,
        started: Notify,
        release: Notify,
        fail_with: Mutex<Option<NegotiationError>>,
    }

    impl GatedNegotiator {
        fn new() -> Arc<Self> {
            Self::with_failure(None)
        }

        fn with_failure(fail_with: Option<NegotiationError>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                started: Notify::new(),
                release: Notify::new(),
                fail_with: Mutex::new(fail_with),
            })
        }
    }

    #[async_trait]
    impl Negotiator for GatedNegotiator {
        async fn negotiate(
            &self,
            _request: &SessionRequest,
        ) -> Result<SessionCredential, NegotiationError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.started.notify_one();
            self.release.notified().await;
            let failure = self.fail_with.lock().unwrap().clone();
            match failure {
                Some(err) => Err(err),
                None => Ok(SessionCredential::new(MEDIA, format!("token-{}", n))),
            }
        }
    }

    #[tokio::test]
    async fn test_starts_idle() {
        let manager = manager_with(MockNegotiator::new(), key());
        let state = manager.state();
        assert_eq!(state.phase, ConnectionPhase::Idle);
        assert_eq!(state.attempt, 0);
        assert_invariants(&state);
        assert_eq!(manager.transport_params(), TransportParams::default());
    }

    #[tokio::test]
    async fn test_connect_success_stores_credential() {
        let manager = manager_with(succeeding_mock(1, "abc"), key());

        manager.connect().await.unwrap();

        let state = manager.state();
        assert_eq!(state.phase, ConnectionPhase::Connected);
        assert_eq!(state.credential.as_ref().unwrap().token, "abc");
        assert_eq!(state.voice, Some(Voice::Alloy));
        assert!(state.last_error.is_none());
        assert_invariants(&state);

        let params = manager.transport_params();
        assert!(params.should_connect);
        assert_eq!(params.ws_url, MEDIA);
        assert_eq!(params.token, "abc");
    }

    #[tokio::test]
    async fn test_missing_key_never_contacts_negotiator() {
        let mut mock = MockNegotiator::new();
        mock.expect_negotiate().times(0);
        let manager = manager_with(mock, ProviderKeySource::empty());

        let err = manager.connect().await.unwrap_err();

        assert_eq!(err, SessionError::Precondition(PreconditionError::MissingProviderKey));
        let state = manager.state();
        assert_eq!(state.phase, ConnectionPhase::Idle);
        assert_eq!(state.last_error.as_ref().unwrap().kind, ErrorKind::Precondition);
        assert_invariants(&state);
    }

    #[tokio::test]
    async fn test_negotiation_failure_records_error() {
        let mut mock = MockNegotiator::new();
        mock.expect_negotiate()
            .times(1)
            .returning(|_| Err(NegotiationError::rejected(Some("room full".to_string()))));
        let manager = manager_with(mock, key());

        let err = manager.connect().await.unwrap_err();

        match err {
            SessionError::Negotiation(e) => {
                assert_eq!(e.reason, NegotiationFailure::Rejected);
                assert_eq!(e.message.as_deref(), Some("room full"));
            }
            other => panic!("Expected negotiation error, got {:?}", other),
        }
        let state = manager.state();
        assert_eq!(state.phase, ConnectionPhase::Error);
        assert_eq!(
            state.last_error,
            Some(ErrorInfo {
                kind: ErrorKind::Rejected,
                message: "room full".to_string()
            })
        );
        assert_invariants(&state);
    }

    #[tokio::test]
    async fn test_retry_after_error_uses_fresh_room() {
        let rooms = Arc::new(Mutex::new(Vec::new()));
        let seen = rooms.clone();
        let mut calls = 0;
        let mut mock = MockNegotiator::new();
        mock.expect_negotiate().times(2).returning(move |req| {
            seen.lock().unwrap().push(req.room_name.clone());
            calls += 1;
            if calls == 1 {
                Err(NegotiationError::transport("broker responded with HTTP 500"))
            } else {
                Ok(SessionCredential::new(MEDIA, "second"))
            }
        });
        let manager = manager_with(mock, key());

        assert!(manager.connect().await.is_err());
        assert_eq!(manager.state().phase, ConnectionPhase::Error);

        manager.connect().await.unwrap();
        let state = manager.state();
        assert_eq!(state.phase, ConnectionPhase::Connected);
        assert!(state.last_error.is_none());
        assert_eq!(state.attempt, 2);

        let rooms = rooms.lock().unwrap();
        assert_eq!(rooms.len(), 2);
        assert_ne!(rooms[0], rooms[1]);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let manager = manager_with(succeeding_mock(1, "abc"), key());
        manager.connect().await.unwrap();

        manager.disconnect().await;
        let once = manager.state();
        manager.disconnect().await;
        let twice = manager.state();

        assert_eq!(once.phase, ConnectionPhase::Idle);
        assert_eq!(once, twice);
        assert!(once.credential.is_none());
        assert!(once.voice.is_none());
        assert!(!manager.transport_params().should_connect);
    }

    #[tokio::test]
    async fn test_disconnect_while_idle_does_not_notify() {
        let manager = manager_with(MockNegotiator::new(), key());
        let rx = manager.subscribe();

        manager.disconnect().await;

        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_disconnect_clears_error() {
        let mut mock = MockNegotiator::new();
        mock.expect_negotiate()
            .times(1)
            .returning(|_| Err(NegotiationError::malformed("missing data.token")));
        let manager = manager_with(mock, key());
        let _ = manager.connect().await;

        manager.disconnect().await;

        let state = manager.state();
        assert_eq!(state.phase, ConnectionPhase::Idle);
        assert!(state.last_error.is_none());
    }

    #[tokio::test]
    async fn test_connect_while_connected_is_noop() {
        let manager = manager_with(succeeding_mock(1, "abc"), key());
        manager.connect().await.unwrap();
        let before = manager.state();

        manager.connect().await.unwrap();

        assert_eq!(manager.state(), before);
    }

    #[tokio::test]
    async fn test_reentrant_connect_sends_single_request() {
        let negotiator = GatedNegotiator::new();
        let manager = ConnectionManager::new(negotiator.clone(), profile(), key());

        let first = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect().await }
        });
        negotiator.started.notified().await;
        assert_eq!(manager.state().phase, ConnectionPhase::Connecting);
        assert_invariants(&manager.state());

        manager.connect().await.unwrap();
        manager.connect().await.unwrap();
        assert_eq!(negotiator.calls.load(Ordering::SeqCst), 1);

        negotiator.release.notify_one();
        first.await.unwrap().unwrap();

        let state = manager.state();
        assert_eq!(state.phase, ConnectionPhase::Connected);
        assert_eq!(state.credential.unwrap().token, "token-1");
        assert_eq!(negotiator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_phases_pass_through_connecting() {
        let negotiator = GatedNegotiator::with_failure(Some(NegotiationError::transport("down")));
        let manager = ConnectionManager::new(negotiator.clone(), profile(), key());
        assert_eq!(manager.state().phase, ConnectionPhase::Idle);

        let task = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect().await }
        });
        negotiator.started.notified().await;
        assert_eq!(manager.state().phase, ConnectionPhase::Connecting);

        negotiator.release.notify_one();
        assert!(task.await.unwrap().is_err());
        assert_eq!(manager.state().phase, ConnectionPhase::Error);
        assert_invariants(&manager.state());
    }

    #[tokio::test]
    async fn test_disconnect_during_connect_discards_credential() {
        let negotiator = GatedNegotiator::new();
        let manager = ConnectionManager::new(negotiator.clone(), profile(), key());

        let task = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect().await }
        });
        negotiator.started.notified().await;

        manager.disconnect().await;
        let pending = manager.state();
        assert_eq!(pending.phase, ConnectionPhase::Connecting);
        assert_eq!(pending.attempt, 2);

        negotiator.release.notify_one();
        task.await.unwrap().unwrap();

        let state = manager.state();
        assert_eq!(state.phase, ConnectionPhase::Idle);
        assert!(state.credential.is_none());
        assert!(!manager.transport_params().should_connect);
        assert_invariants(&state);
    }

    #[tokio::test]
    async fn test_cancelled_connect_ignores_broker_failure() {
        let negotiator = GatedNegotiator::with_failure(Some(NegotiationError::transport("down")));
        let manager = ConnectionManager::new(negotiator.clone(), profile(), key());

        let task = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect().await }
        });
        negotiator.started.notified().await;
        manager.disconnect().await;
        negotiator.release.notify_one();

        assert_eq!(task.await.unwrap(), Ok(()));
        let state = manager.state();
        assert_eq!(state.phase, ConnectionPhase::Idle);
        assert!(state.last_error.is_none());
    }

    #[tokio::test]
    async fn test_key_removal_disconnects_connected_session() {
        let source = key();
        let manager = manager_with(succeeding_mock(1, "abc"), source.clone());
        manager.connect().await.unwrap();

        source.clear();

        let state = manager.state();
        assert_eq!(state.phase, ConnectionPhase::Idle);
        assert!(state.credential.is_none());
        assert!(!manager.transport_params().should_connect);
        assert_invariants(&state);
    }

    #[tokio::test]
    async fn test_key_cleared_then_restored_still_disconnects() {
        let source = key();
        let manager = manager_with(succeeding_mock(1, "abc"), source.clone());
        manager.connect().await.unwrap();

        source.clear();
        source.set("sk-replacement");
        tokio::time::sleep(Duration::from_millis(20)).await;

        let state = manager.state();
        assert_eq!(state.phase, ConnectionPhase::Idle);
        assert!(state.credential.is_none());
    }

    #[tokio::test]
    async fn test_blank_key_disconnects_connected_session() {
        let source = key();
        let manager = manager_with(succeeding_mock(1, "abc"), source.clone());
        manager.connect().await.unwrap();

        source.set("   ");

        assert_eq!(manager.state().phase, ConnectionPhase::Idle);
    }

    #[tokio::test]
    async fn test_key_removal_during_connect_cancels_attempt() {
        let negotiator = GatedNegotiator::new();
        let source = key();
        let manager = ConnectionManager::new(negotiator.clone(), profile(), source.clone());

        let task = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect().await }
        });
        negotiator.started.notified().await;

        source.clear();
        assert_eq!(manager.state().attempt, 2);
        negotiator.release.notify_one();
        task.await.unwrap().unwrap();

        let state = wait_for_phase(&manager, ConnectionPhase::Idle).await;
        assert!(state.credential.is_none());
    }

    #[tokio::test]
    async fn test_key_rotation_keeps_session() {
        let source = key();
        let manager = manager_with(succeeding_mock(1, "abc"), source.clone());
        manager.connect().await.unwrap();

        source.set("sk-rotated");
        tokio::task::yield_now().await;

        assert_eq!(manager.state().phase, ConnectionPhase::Connected);
    }

    #[tokio::test]
    async fn test_key_removal_keeps_error_visible() {
        let mut mock = MockNegotiator::new();
        mock.expect_negotiate()
            .times(1)
            .returning(|_| Err(NegotiationError::rejected(None)));
        let source = key();
        let manager = manager_with(mock, source.clone());
        let _ = manager.connect().await;

        source.clear();
        tokio::task::yield_now().await;

        assert_eq!(manager.state().phase, ConnectionPhase::Error);
    }

    #[tokio::test]
    async fn test_key_restored_allows_connect() {
        let source = ProviderKeySource::empty();
        let manager = manager_with(succeeding_mock(1, "abc"), source.clone());
        assert!(manager.connect().await.is_err());

        source.set("sk-test");
        manager.connect().await.unwrap();

        assert_eq!(manager.state().phase, ConnectionPhase::Connected);
    }

    #[tokio::test]
    async fn test_dropped_connect_still_settles() {
        let negotiator = GatedNegotiator::new();
        let manager = ConnectionManager::new(negotiator.clone(), profile(), key());

        let abandoned = tokio::time::timeout(Duration::from_millis(20), manager.connect()).await;
        assert!(abandoned.is_err());
        negotiator.started.notified().await;
        assert_eq!(manager.state().phase, ConnectionPhase::Connecting);

        negotiator.release.notify_one();

        let state = wait_for_phase(&manager, ConnectionPhase::Connected).await;
        assert_eq!(state.credential.unwrap().token, "token-1");
    }

    #[tokio::test]
    async fn test_disconnect_after_dropped_connect_allows_reconnect() {
        let negotiator = GatedNegotiator::new();
        let manager = ConnectionManager::new(negotiator.clone(), profile(), key());

        let abandoned = tokio::time::timeout(Duration::from_millis(20), manager.connect()).await;
        assert!(abandoned.is_err());
        negotiator.started.notified().await;
        manager.disconnect().await;
        manager.disconnect().await;

        negotiator.release.notify_one();
        let state = wait_for_phase(&manager, ConnectionPhase::Idle).await;
        assert!(state.credential.is_none());

        let retry = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect().await }
        });
        negotiator.started.notified().await;
        negotiator.release.notify_one();
        retry.await.unwrap().unwrap();

        let state = manager.state();
        assert_eq!(state.phase, ConnectionPhase::Connected);
        assert_eq!(state.credential.unwrap().token, "token-2");
        assert_eq!(negotiator.calls.load(Ordering::SeqCst), 2);
    }

    #[derive(Clone, Copy, Debug)]
    enum Step {
        Connect,
        Succeed,
        Fail,
        Disconnect,
        ClearKey,
        SetKey,
    }

    const STEPS: [Step; 6] = [
        Step::Connect,
        Step::Succeed,
        Step::Fail,
        Step::Disconnect,
        Step::ClearKey,
        Step::SetKey,
    ];

    fn is_legal_succession(from: ConnectionPhase, to: ConnectionPhase) -> bool {
        use ConnectionPhase::*;
        matches!(
            (from, to),
            (Idle, Idle)
                | (Error, Error)
                | (Connecting, Connecting)
                | (Idle | Error, Connecting)
                | (Connecting, Connected | Error | Idle)
                | (Connected | Error, Idle)
        )
    }

    async fn run_steps(steps: &[Step]) {
        let negotiator = GatedNegotiator::new();
        let source = key();
        let manager = ConnectionManager::new(negotiator.clone(), profile(), source.clone());
        let mut rx = manager.subscribe();
        let mut last = manager.state();
        let mut in_flight: Option<JoinHandle<Result<(), SessionError>>> = None;

        for step in steps.iter().copied().chain([Step::Succeed]) {
            match step {
                Step::Connect => {
                    let phase = manager.state().phase;
                    let negotiates = in_flight.is_none()
                        && source.is_present()
                        && matches!(phase, ConnectionPhase::Idle | ConnectionPhase::Error);
                    if negotiates {
                        in_flight = Some(tokio::spawn({
                            let manager = manager.clone();
                            async move { manager.connect().await }
                        }));
                        negotiator.started.notified().await;
                    } else {
                        let _ = manager.connect().await;
                    }
                }
                Step::Succeed | Step::Fail => {
                    if let Some(task) = in_flight.take() {
                        *negotiator.fail_with.lock().unwrap() = match step {
                            Step::Fail => Some(NegotiationError::rejected(None)),
                            _ => None,
                        };
                        negotiator.release.notify_one();
                        let _ = task.await.unwrap();
                    }
                }
                Step::Disconnect => manager.disconnect().await,
                Step::ClearKey => source.clear(),
                Step::SetKey => source.set("sk-test"),
            }

            if rx.has_changed().unwrap() {
                let next = rx.borrow_and_update().clone();
                assert!(
                    is_legal_succession(last.phase, next.phase),
                    "{:?} -> {:?} after {:?} in {:?}",
                    last.phase,
                    next.phase,
                    step,
                    steps
                );
                assert_invariants(&next);
                last = next;
            }
            if !source.is_present() {
                assert_ne!(manager.state().phase, ConnectionPhase::Connected, "{:?}", steps);
            }
            if in_flight.is_some() {
                assert_eq!(manager.state().phase, ConnectionPhase::Connecting, "{:?}", steps);
            }
        }
        assert_ne!(manager.state().phase, ConnectionPhase::Connecting, "{:?}", steps);
    }

    #[tokio::test]
    async fn test_every_short_sequence_keeps_invariants() {
        const LEN: u32 = 5;
        for n in 0..STEPS.len().pow(LEN) {
            let mut rest = n;
            let steps: Vec<Step> = (0..LEN)
                .map(|_| {
                    let step = STEPS[rest % STEPS.len()];
                    rest /= STEPS.len();
                    step
                })
                .collect();
            run_steps(&steps).await;
        }
    }
}
