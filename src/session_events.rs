//! Per-session event loop.
//!
//! One task per CDM session reacts to the session's events: license messages
//! start a license exchange, key status changes are classified into usable and
//! unusable key IDs. Results are reported as [`SessionEvent`]s.
//!
//! License exchanges run as sub-tasks reporting back through a bounded
//! internal queue, so `session.update` calls are only ever made from the loop,
//! one at a time.
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::cdm::{KeySessionEvent, MediaKeySession};
use crate::config::DecryptorConfig;
use crate::error::{Error, Result};
use crate::key::{KeyId, KeyStatus};
use crate::key_system::{KeyStatusPolicy, KeySystemOption};
use crate::license::{fetch_license_with_retry, BackoffOptions, LicenseFailure};

const DEFAULT_MESSAGE_TYPE: &str = "license-request";

/// Classified outcome of a session's activity.
#[derive(Debug)]
pub enum SessionEvent {
    /// Recoverable anomaly.
    Warning(Error),
    /// Key statuses were evaluated.
    KeysUpdate {
        whitelisted: Vec<KeyId>,
        blacklisted: Vec<KeyId>,
    },
    /// The session cannot be used, the rest of the content can still play.
    Blacklisted(Error),
    Fatal(Error),
}

/// Result of [`check_key_statuses`].
#[derive(Debug, Default)]
pub struct KeyStatusesCheck {
    /// Set when problematic statuses were tolerated.
    pub warning: Option<Error>,
    pub whitelisted: Vec<KeyId>,
    pub blacklisted: Vec<KeyId>,
}

/// Sort key IDs by usability according to the key status policies.
///
/// Fails on the first problematic status whose policy is
/// [`KeyStatusPolicy::Error`].
pub fn check_key_statuses(
    key_statuses: &[(KeyId, KeyStatus)],
    option: &KeySystemOption,
) -> Result<KeyStatusesCheck> {
    let mut check = KeyStatusesCheck::default();
    let mut bad_statuses = Vec::new();
    for (key_id, status) in key_statuses {
        let (policy, message) = match status {
            KeyStatus::Expired => (
                option.on_key_expiration,
                format!("A decryption key expired ({})", key_id),
            ),
            KeyStatus::InternalError => (
                option.on_key_internal_error,
                format!("A \"{}\" status has been encountered ({})", status, key_id),
            ),
            KeyStatus::OutputRestricted => (
                option.on_key_output_restricted,
                format!("A \"{}\" status has been encountered ({})", status, key_id),
            ),
            _ => {
                check.whitelisted.push(key_id.clone());
                continue;
            }
        };
        bad_statuses.push((key_id.clone(), *status));
        match policy {
            KeyStatusPolicy::Error => {
                return Err(Error::KeyStatusChange {
                    message,
                    key_statuses: bad_statuses,
                })
            }
            KeyStatusPolicy::Continue => check.whitelisted.push(key_id.clone()),
            KeyStatusPolicy::Fallback => check.blacklisted.push(key_id.clone()),
        }
    }
    if !bad_statuses.is_empty() {
        check.warning = Some(Error::KeyStatusChange {
            message: "One or several problematic key statuses have been encountered".into(),
            key_statuses: bad_statuses,
        });
    }
    Ok(check)
}

enum Internal {
    LicenseRetry(Error),
    License(std::result::Result<Option<Vec<u8>>, LicenseFailure>),
    KeyStatusesHandled(Result<Option<Vec<u8>>>),
}

/// Event loop of one CDM session.
pub struct SessionEventsListener {
    session: Arc<dyn MediaKeySession>,
    option: Arc<KeySystemOption>,
    config: DecryptorConfig,
    cdm_events: broadcast::Receiver<KeySessionEvent>,
}

impl SessionEventsListener {
    /// Subscribes to the session's events right away: events emitted after
    /// this call are not lost even if the loop is spawned later.
    pub fn new(
        session: Arc<dyn MediaKeySession>,
        option: Arc<KeySystemOption>,
        config: DecryptorConfig,
    ) -> Self {
        let cdm_events = session.subscribe();
        Self {
            session,
            option,
            config,
            cdm_events,
        }
    }

    /// Run the loop until `cancel` fires, the session closes, or a
    /// blacklisting or fatal event was emitted.
    pub fn spawn(self, cancel: CancellationToken) -> mpsc::Receiver<SessionEvent> {
        let (events, receiver) = mpsc::channel(self.config.session_event_queue_capacity.max(1));
        tokio::spawn(self.run(cancel, events));
        receiver
    }

    fn backoff_options(&self) -> BackoffOptions {
        BackoffOptions {
            base_delay: Duration::from_millis(self.config.license_retry_base_delay_ms),
            max_delay: Duration::from_millis(self.config.license_retry_max_delay_ms),
            total_retry: self
                .option
                .license_request
                .retry
                .unwrap_or(self.config.license_default_retry),
            jitter: self.config.backoff_jitter,
        }
    }

    async fn run(mut self, cancel: CancellationToken, events: mpsc::Sender<SessionEvent>) {
        let capacity = self.config.session_event_queue_capacity.max(1);
        let (internal, mut internal_rx) = mpsc::channel(capacity);
        let mut tasks = JoinSet::new();
        let mut closed: BoxFuture<'static, ()> = self
            .session
            .closed()
            .unwrap_or_else(|| futures::future::pending().boxed());

        if !self.session.key_statuses().is_empty() && self.on_key_statuses(&events).await.is_break() {
            return;
        }

        loop {
            let flow = tokio::select! {
                _ = cancel.cancelled() => ControlFlow::Break(()),
                _ = &mut closed => {
                    debug!("DRM: Session closed, stopping its listener");
                    ControlFlow::Break(())
                }
                event = self.cdm_events.recv() => {
                    self.on_cdm_event(event, &internal, &mut tasks, &cancel, &events).await
                }
                Some(message) = internal_rx.recv() => {
                    self.on_internal(message, &events, &cancel).await
                }
            };
            if flow.is_break() {
                break;
            }
        }
        tasks.abort_all();
    }

    async fn on_cdm_event(
        &mut self,
        event: std::result::Result<KeySessionEvent, RecvError>,
        internal: &mpsc::Sender<Internal>,
        tasks: &mut JoinSet<()>,
        cancel: &CancellationToken,
        events: &mpsc::Sender<SessionEvent>,
    ) -> ControlFlow<()> {
        match event {
            Ok(KeySessionEvent::Message {
                message,
                message_type,
            }) => {
                let message_type = message_type
                    .filter(|t| !t.is_empty())
                    .unwrap_or_else(|| DEFAULT_MESSAGE_TYPE.to_string());
                info!(
                    "DRM: Received message event, type {} ({})",
                    message_type,
                    self.session.session_id()
                );
                let fetcher = self.option.license_fetcher.clone();
                let backoff = self.backoff_options();
                let timeout = self.option.license_request.timeout.resolve(&self.config);
                let internal = internal.clone();
                let cancel = cancel.clone();
                tasks.spawn(async move {
                    let retries = internal.clone();
                    let result = fetch_license_with_retry(
                        fetcher.as_ref(),
                        &message,
                        &message_type,
                        timeout,
                        backoff,
                        &cancel,
                        |err, _| {
                            let retries = retries.clone();
                            async move {
                                let _ = retries.send(Internal::LicenseRetry(err)).await;
                            }
                        },
                    )
                    .await;
                    let _ = internal.send(Internal::License(result)).await;
                });
                ControlFlow::Continue(())
            }
            Ok(KeySessionEvent::KeyStatusesChange) => {
                info!("DRM: keystatuseschange event received ({})", self.session.session_id());
                if let Some(handler) = self.option.key_statuses_handler.clone() {
                    let session_id = self.session.session_id();
                    let statuses = self.session.key_statuses();
                    let internal = internal.clone();
                    tasks.spawn(async move {
                        let result = handler
                            .on_key_statuses_change(&session_id, &statuses)
                            .await
                            .map_err(|err| Error::KeyStatusChange {
                                message: if err.message.is_empty() {
                                    "Unknown key statuses handler error".into()
                                } else {
                                    err.message
                                },
                                key_statuses: statuses.clone(),
                            });
                        let _ = internal.send(Internal::KeyStatusesHandled(result)).await;
                    });
                }
                self.on_key_statuses(events).await
            }
            Ok(KeySessionEvent::KeyError(message)) => {
                let _ = send(events, SessionEvent::Fatal(Error::KeyError(message))).await;
                ControlFlow::Break(())
            }
            Err(RecvError::Lagged(missed)) => {
                warn!(
                    "DRM: Missed {} events of session {}, a license message may have been lost. \
                     Checking key statuses again",
                    missed,
                    self.session.session_id()
                );
                self.on_key_statuses(events).await
            }
            Err(RecvError::Closed) => ControlFlow::Break(()),
        }
    }

    async fn on_internal(
        &self,
        message: Internal,
        events: &mpsc::Sender<SessionEvent>,
        cancel: &CancellationToken,
    ) -> ControlFlow<()> {
        match message {
            Internal::LicenseRetry(err) => send(events, SessionEvent::Warning(err)).await,
            Internal::License(Ok(Some(license)))
            | Internal::KeyStatusesHandled(Ok(Some(license))) => {
                self.update_session(&license, events, cancel).await
            }
            Internal::License(Ok(None)) | Internal::KeyStatusesHandled(Ok(None)) => {
                info!("DRM: No license given, skipping session.update");
                ControlFlow::Continue(())
            }
            Internal::License(Err(LicenseFailure::Cancelled)) => ControlFlow::Break(()),
            Internal::License(Err(LicenseFailure::Blacklisted(err))) => {
                let _ = send(events, SessionEvent::Blacklisted(err)).await;
                ControlFlow::Break(())
            }
            Internal::License(Err(LicenseFailure::Fatal(err)))
            | Internal::KeyStatusesHandled(Err(err)) => {
                let _ = send(events, SessionEvent::Fatal(err)).await;
                ControlFlow::Break(())
            }
        }
    }

    async fn update_session(
        &self,
        response: &[u8],
        events: &mpsc::Sender<SessionEvent>,
        cancel: &CancellationToken,
    ) -> ControlFlow<()> {
        debug!("DRM: Updating session {}", self.session.session_id());
        let result = tokio::select! {
            _ = cancel.cancelled() => return ControlFlow::Break(()),
            result = self.session.update(response) => result,
        };
        match result {
            Ok(()) => {
                info!("DRM: Session update succeeded");
                ControlFlow::Continue(())
            }
            Err(err) => {
                let _ = send(events, SessionEvent::Fatal(Error::KeyUpdate(err.to_string()))).await;
                ControlFlow::Break(())
            }
        }
    }

    async fn on_key_statuses(&self, events: &mpsc::Sender<SessionEvent>) -> ControlFlow<()> {
        match check_key_statuses(&self.session.key_statuses(), &self.option) {
            Ok(check) => {
                if let Some(warning) = check.warning {
                    if send(events, SessionEvent::Warning(warning)).await.is_break() {
                        return ControlFlow::Break(());
                    }
                }
                send(
                    events,
                    SessionEvent::KeysUpdate {
                        whitelisted: check.whitelisted,
                        blacklisted: check.blacklisted,
                    },
                )
                .await
            }
            Err(err) => {
                let _ = send(events, SessionEvent::Fatal(err)).await;
                ControlFlow::Break(())
            }
        }
    }
}

/// Forward an event, stopping the loop when nobody listens anymore.
async fn send(events: &mpsc::Sender<SessionEvent>, event: SessionEvent) -> ControlFlow<()> {
    match events.send(event).await {
        Ok(()) => ControlFlow::Continue(()),
        Err(_) => ControlFlow::Break(()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::license::{KeyStatusesHandler, LicenseError, LicenseFetcher, LicenseResult};
    use crate::testing::{noop_fetcher, FakeSession};

    fn kid(byte: u8) -> KeyId {
        KeyId::new(vec![byte; 16])
    }

    fn option_with(fetcher: Arc<dyn LicenseFetcher>) -> KeySystemOption {
        KeySystemOption::new("widevine", fetcher)
    }

    fn flaky_fetcher(failures: u32, error: LicenseError) -> Arc<dyn LicenseFetcher> {
        let calls = Arc::new(AtomicU32::new(0));
        Arc::new(move |_: Vec<u8>, _: String| {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            let error = error.clone();
            async move {
                if attempt < failures {
                    Err(error)
                } else {
                    Ok(Some(b"license".to_vec()))
                }
            }
        })
    }

    fn license_message() -> KeySessionEvent {
        KeySessionEvent::Message {
            message: b"challenge".to_vec(),
            message_type: None,
        }
    }

    fn listen(
        session: &Arc<FakeSession>,
        option: KeySystemOption,
    ) -> (CancellationToken, mpsc::Receiver<SessionEvent>) {
        let cancel = CancellationToken::new();
        let session: Arc<dyn MediaKeySession> = session.clone();
        let events = SessionEventsListener::new(session, Arc::new(option), DecryptorConfig::default())
            .spawn(cancel.clone());
        (cancel, events)
    }

    #[test]
    fn statuses_follow_policies() {
        let statuses = vec![
            (kid(1), KeyStatus::Usable),
            (kid(2), KeyStatus::Expired),
            (kid(3), KeyStatus::OutputRestricted),
            (kid(4), KeyStatus::StatusPending),
        ];
        let mut option = option_with(noop_fetcher());
        let err = check_key_statuses(&statuses, &option).unwrap_err();
        assert_eq!(err.code(), "KEY_STATUS_CHANGE_ERROR");

        option.on_key_expiration = KeyStatusPolicy::Continue;
        option.on_key_output_restricted = KeyStatusPolicy::Fallback;
        let check = check_key_statuses(&statuses, &option).expect("check");
        assert_eq!(check.whitelisted, vec![kid(1), kid(2), kid(4)]);
        assert_eq!(check.blacklisted, vec![kid(3)]);
        match check.warning {
            Some(Error::KeyStatusChange { key_statuses, .. }) => assert_eq!(key_statuses.len(), 2),
            other => panic!("unexpected warning {:?}", other),
        }

        let clean = check_key_statuses(&statuses[..1], &option).expect("check");
        assert!(clean.warning.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn success_on_last_allowed_attempt() {
        let session = FakeSession::new();
        session.set_keys_on_update(vec![(kid(1), KeyStatus::Usable)]);
        let (_cancel, mut events) = listen(
            &session,
            option_with(flaky_fetcher(2, LicenseError::new("busy"))),
        );
        session.emit(license_message());

        assert!(matches!(events.recv().await, Some(SessionEvent::Warning(Error::KeyLoad(_)))));
        assert!(matches!(events.recv().await, Some(SessionEvent::Warning(Error::KeyLoad(_)))));
        match events.recv().await {
            Some(SessionEvent::KeysUpdate { whitelisted, blacklisted }) => {
                assert_eq!(whitelisted, vec![kid(1)]);
                assert!(blacklisted.is_empty());
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(session.updates(), vec![b"license".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_with_fallback_blacklists() {
        let session = FakeSession::new();
        let (_cancel, mut events) = listen(
            &session,
            option_with(flaky_fetcher(u32::MAX, LicenseError::new("nope").fallback_on_last_try())),
        );
        session.emit(license_message());

        assert!(matches!(events.recv().await, Some(SessionEvent::Warning(_))));
        assert!(matches!(events.recv().await, Some(SessionEvent::Warning(_))));
        assert!(matches!(events.recv().await, Some(SessionEvent::Blacklisted(Error::KeyLoad(_)))));
        assert!(events.recv().await.is_none());
        assert!(session.updates().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn update_failure_is_fatal() {
        let session = FakeSession::new();
        session.fail_updates();
        let (_cancel, mut events) = listen(&session, option_with(flaky_fetcher(0, LicenseError::default())));
        session.emit(license_message());
        match events.recv().await {
            Some(SessionEvent::Fatal(err)) => assert_eq!(err.code(), "KEY_UPDATE_ERROR"),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(events.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn no_license_skips_update() {
        let session = FakeSession::new();
        let (_cancel, mut events) = listen(&session, option_with(noop_fetcher()));
        session.emit(license_message());
        session.set_key_statuses(vec![(kid(5), KeyStatus::Usable)]);
        session.emit(KeySessionEvent::KeyStatusesChange);
        assert!(matches!(events.recv().await, Some(SessionEvent::KeysUpdate { .. })));
        assert!(session.updates().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn existing_statuses_are_checked_first() {
        let session = FakeSession::new();
        session.set_key_statuses(vec![(kid(1), KeyStatus::Expired)]);
        let mut option = option_with(noop_fetcher());
        option.on_key_expiration = KeyStatusPolicy::Fallback;
        let (_cancel, mut events) = listen(&session, option);
        assert!(matches!(events.recv().await, Some(SessionEvent::Warning(_))));
        match events.recv().await {
            Some(SessionEvent::KeysUpdate { whitelisted, blacklisted }) => {
                assert!(whitelisted.is_empty());
                assert_eq!(blacklisted, vec![kid(1)]);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn key_error_is_fatal() {
        let session = FakeSession::new();
        let (_cancel, mut events) = listen(&session, option_with(noop_fetcher()));
        session.emit(KeySessionEvent::KeyError("hardware".into()));
        assert!(matches!(events.recv().await, Some(SessionEvent::Fatal(Error::KeyError(_)))));
    }

    struct RenewingHandler;

    #[async_trait]
    impl KeyStatusesHandler for RenewingHandler {
        async fn on_key_statuses_change(
            &self,
            _session_id: &str,
            key_statuses: &[(KeyId, KeyStatus)],
        ) -> LicenseResult {
            if key_statuses.iter().any(|(_, s)| *s == KeyStatus::Expired) {
                Ok(Some(b"renewal".to_vec()))
            } else {
                Ok(None)
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn key_statuses_handler_response_updates_the_session() {
        let session = FakeSession::new();
        let mut option = option_with(noop_fetcher());
        option.on_key_expiration = KeyStatusPolicy::Continue;
        option.key_statuses_handler = Some(Arc::new(RenewingHandler));
        let (_cancel, mut events) = listen(&session, option);

        session.set_key_statuses(vec![(kid(1), KeyStatus::Expired)]);
        session.emit(KeySessionEvent::KeyStatusesChange);
        assert!(matches!(events.recv().await, Some(SessionEvent::Warning(_))));
        assert!(matches!(events.recv().await, Some(SessionEvent::KeysUpdate { .. })));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(session.updates(), vec![b"renewal".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn lagging_behind_cdm_events_rechecks_key_statuses() {
        let session = FakeSession::new();
        let (_cancel, mut events) = listen(&session, option_with(noop_fetcher()));
        session.set_key_statuses(vec![(kid(1), KeyStatus::Usable)]);
        // More events than the session channel retains, before the loop runs.
        for _ in 0..40 {
            session.emit(KeySessionEvent::KeyStatusesChange);
        }
        tokio::time::sleep(Duration::from_millis(1)).await;

        let mut updates = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                SessionEvent::KeysUpdate { whitelisted, .. } => {
                    assert_eq!(whitelisted, vec![kid(1)]);
                    updates += 1;
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        // Initial check, one for the lag, then the 16 retained events.
        assert_eq!(updates, 18);

        session.emit(KeySessionEvent::KeyStatusesChange);
        assert!(matches!(events.recv().await, Some(SessionEvent::KeysUpdate { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_loop() {
        let session = FakeSession::new();
        let (cancel, mut events) = listen(&session, option_with(noop_fetcher()));
        cancel.cancel();
        assert!(events.recv().await.is_none());
    }
}
