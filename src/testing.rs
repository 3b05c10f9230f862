//! In-memory doubles of the CDM, the media element and the manifest.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;

use crate::cdm::{
    CdmProvider, KeySessionEvent, MediaElement, MediaKeySession, MediaKeySystemAccess, MediaKeys,
    SessionType,
};
use crate::error::{Error, Result};
use crate::init_data::InitDataValue;
use crate::key::{merge_key_ids_into, KeyId, KeyStatus};
use crate::key_system::KeySystemConfiguration;
use crate::license::{LicenseFetcher, LicenseResult};
use crate::manifest::{
    ContentProtections, Manifest, PeriodKeyIds, ProtectionInitData, RepresentationView,
};

/// License fetcher answering nothing.
pub fn noop_fetcher() -> Arc<dyn LicenseFetcher> {
    Arc::new(|_: Vec<u8>, _: String| async {
        let response: LicenseResult = Ok(None);
        response
    })
}

/// Outcome of `load` on fake sessions.
#[derive(Debug, Clone, Default)]
pub enum LoadBehavior {
    /// The session is found and gets these key statuses.
    Loaded(Vec<(KeyId, KeyStatus)>),
    #[default]
    NotFound,
    Fail,
}

#[derive(Default)]
struct SessionState {
    session_id: String,
    /// Id given by `generate_request`.
    generated_id: String,
    key_statuses: Vec<(KeyId, KeyStatus)>,
    keys_on_update: Option<Vec<(KeyId, KeyStatus)>>,
    load_behavior: LoadBehavior,
    failing_closes: u32,
    close_calls: usize,
    fail_generate_request: bool,
    fail_updates: bool,
    gate: Option<oneshot::Receiver<()>>,
    load_gate: Option<oneshot::Receiver<()>>,
    closed_notifications: bool,
    log: Vec<String>,
    requests: Vec<Vec<u8>>,
    updates: Vec<Vec<u8>>,
    loaded_ids: Vec<String>,
}

/// Scriptable CDM session.
///
/// `generate_request` emits a message carrying the request data. `update`
/// makes the configured keys usable, or by default every 16-byte chunk of
/// the response.
pub struct FakeSession {
    state: Mutex<SessionState>,
    events: broadcast::Sender<KeySessionEvent>,
    closed: CancellationToken,
}

impl FakeSession {
    pub fn new() -> Arc<Self> {
        Self::build(SessionState {
            generated_id: "session".into(),
            ..SessionState::default()
        })
    }

    fn build(state: SessionState) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            state: Mutex::new(state),
            events,
            closed: CancellationToken::new(),
        })
    }

    pub fn set_session_id(&self, session_id: &str) {
        self.state.lock().session_id = session_id.to_string();
    }

    pub fn set_key_statuses(&self, key_statuses: Vec<(KeyId, KeyStatus)>) {
        self.state.lock().key_statuses = key_statuses;
    }

    pub fn set_keys_on_update(&self, key_statuses: Vec<(KeyId, KeyStatus)>) {
        self.state.lock().keys_on_update = Some(key_statuses);
    }

    pub fn fail_next_closes(&self, count: u32) {
        self.state.lock().failing_closes = count;
    }

    pub fn fail_generate_request(&self) {
        self.state.lock().fail_generate_request = true;
    }

    pub fn fail_updates(&self) {
        self.state.lock().fail_updates = true;
    }

    /// Hold the next `generate_request` until the returned sender fires.
    pub fn gate_generate_request(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.state.lock().gate = Some(rx);
        tx
    }

    /// Hold the next `load` until the returned sender fires.
    pub fn gate_load(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.state.lock().load_gate = Some(rx);
        tx
    }

    /// Simulate the CDM closing the session on its own.
    pub fn close_from_cdm(&self) {
        self.closed.cancel();
    }

    pub fn emit(&self, event: KeySessionEvent) {
        let _ = self.events.send(event);
    }

    pub fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }

    pub fn log(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.state.lock().requests.clone()
    }

    pub fn updates(&self) -> Vec<Vec<u8>> {
        self.state.lock().updates.clone()
    }

    pub fn loaded_ids(&self) -> Vec<String> {
        self.state.lock().loaded_ids.clone()
    }
}

#[async_trait]
impl MediaKeySession for FakeSession {
    fn session_id(&self) -> String {
        self.state.lock().session_id.clone()
    }

    fn key_statuses(&self) -> Vec<(KeyId, KeyStatus)> {
        self.state.lock().key_statuses.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<KeySessionEvent> {
        self.events.subscribe()
    }

    fn closed(&self) -> Option<BoxFuture<'static, ()>> {
        if !self.state.lock().closed_notifications {
            return None;
        }
        let closed = self.closed.clone();
        Some(async move { closed.cancelled().await }.boxed())
    }

    async fn generate_request(&self, _init_data_type: Option<&str>, init_data: &[u8]) -> Result<()> {
        let gate = {
            let mut state = self.state.lock();
            state.log.push("generate:start".into());
            state.requests.push(init_data.to_vec());
            state.gate.take()
        };
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        {
            let mut state = self.state.lock();
            state.log.push("generate:end".into());
            if state.fail_generate_request {
                return Err(Error::Cdm("generateRequest refused".into()));
            }
            if state.session_id.is_empty() {
                state.session_id = state.generated_id.clone();
            }
        }
        self.emit(KeySessionEvent::Message {
            message: init_data.to_vec(),
            message_type: Some("license-request".into()),
        });
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<bool> {
        let gate = {
            let mut state = self.state.lock();
            state.log.push("load:start".into());
            state.loaded_ids.push(session_id.to_string());
            state.load_gate.take()
        };
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        let behavior = {
            let mut state = self.state.lock();
            state.log.push("load:end".into());
            state.load_behavior.clone()
        };
        match behavior {
            LoadBehavior::Loaded(key_statuses) => {
                {
                    let mut state = self.state.lock();
                    state.session_id = session_id.to_string();
                    state.key_statuses = key_statuses;
                }
                self.emit(KeySessionEvent::KeyStatusesChange);
                Ok(true)
            }
            LoadBehavior::NotFound => Ok(false),
            LoadBehavior::Fail => Err(Error::Cdm("load failed".into())),
        }
    }

    async fn update(&self, response: &[u8]) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.fail_updates {
                return Err(Error::Cdm("update refused".into()));
            }
            state.updates.push(response.to_vec());
            state.key_statuses = state.keys_on_update.clone().unwrap_or_else(|| {
                response
                    .chunks(16)
                    .map(|chunk| (KeyId::from(chunk), KeyStatus::Usable))
                    .collect()
            });
        }
        self.emit(KeySessionEvent::KeyStatusesChange);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.close_calls += 1;
        state.log.push("close".into());
        if state.failing_closes > 0 {
            state.failing_closes -= 1;
            return Err(Error::Cdm("close refused".into()));
        }
        Ok(())
    }
}

#[derive(Default)]
struct MediaKeysState {
    sessions: Vec<Arc<FakeSession>>,
    load_behavior: LoadBehavior,
    fail_closes: bool,
    closed_notifications: bool,
    fail_server_certificate: bool,
    fail_updates: bool,
    certificates: Vec<Vec<u8>>,
}

/// MediaKeys creating [`FakeSession`]s named `session-<n>`.
#[derive(Default)]
pub struct FakeMediaKeys {
    state: Mutex<MediaKeysState>,
}

impl FakeMediaKeys {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The `index`-th created session.
    pub fn session(&self, index: usize) -> Arc<FakeSession> {
        self.state.lock().sessions[index].clone()
    }

    pub fn created(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn set_load_behavior(&self, behavior: LoadBehavior) {
        self.state.lock().load_behavior = behavior;
    }

    /// Every session created from now on refuses to close.
    pub fn fail_closes(&self) {
        self.state.lock().fail_closes = true;
    }

    pub fn enable_closed_notifications(&self) {
        self.state.lock().closed_notifications = true;
    }

    pub fn fail_server_certificate(&self) {
        self.state.lock().fail_server_certificate = true;
    }

    /// Every session created from now on refuses updates.
    pub fn fail_updates(&self) {
        self.state.lock().fail_updates = true;
    }

    pub fn certificates(&self) -> Vec<Vec<u8>> {
        self.state.lock().certificates.clone()
    }
}

#[async_trait]
impl MediaKeys for FakeMediaKeys {
    fn create_session(&self, _session_type: SessionType) -> Result<Arc<dyn MediaKeySession>> {
        let mut state = self.state.lock();
        let session = FakeSession::build(SessionState {
            generated_id: format!("session-{}", state.sessions.len()),
            load_behavior: state.load_behavior.clone(),
            failing_closes: if state.fail_closes { u32::MAX } else { 0 },
            closed_notifications: state.closed_notifications,
            fail_updates: state.fail_updates,
            ..SessionState::default()
        });
        state.sessions.push(session.clone());
        Ok(session)
    }

    async fn set_server_certificate(&self, certificate: &[u8]) -> Result<bool> {
        let mut state = self.state.lock();
        state.certificates.push(certificate.to_vec());
        if state.fail_server_certificate {
            return Err(Error::Cdm("certificate refused".into()));
        }
        Ok(true)
    }
}

struct FakeAccess {
    key_system: String,
    configuration: KeySystemConfiguration,
    media_keys: Arc<FakeMediaKeys>,
    fail_creation: bool,
}

#[async_trait]
impl MediaKeySystemAccess for FakeAccess {
    fn key_system(&self) -> &str {
        &self.key_system
    }

    fn configuration(&self) -> &KeySystemConfiguration {
        &self.configuration
    }

    async fn create_media_keys(&self) -> Result<Arc<dyn MediaKeys>> {
        if self.fail_creation {
            return Err(Error::Cdm("cannot create MediaKeys".into()));
        }
        Ok(self.media_keys.clone())
    }
}

/// Provider supporting a fixed set of key system names, accepting the first
/// requested configuration.
pub struct FakeProvider {
    supported: Vec<String>,
    media_keys: Arc<FakeMediaKeys>,
    requests: Mutex<Vec<String>>,
    fail_media_keys_creation: AtomicBool,
}

impl FakeProvider {
    pub fn new(supported: &[&str], media_keys: Arc<FakeMediaKeys>) -> Self {
        Self {
            supported: supported.iter().map(|s| (*s).to_string()).collect(),
            media_keys,
            requests: Mutex::new(Vec::new()),
            fail_media_keys_creation: AtomicBool::new(false),
        }
    }

    /// Key system names requested so far.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    pub fn fail_media_keys_creation(&self) {
        self.fail_media_keys_creation.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl CdmProvider for FakeProvider {
    async fn request_media_key_system_access(
        &self,
        key_system: &str,
        configurations: &[KeySystemConfiguration],
    ) -> Result<Arc<dyn MediaKeySystemAccess>> {
        self.requests.lock().push(key_system.to_string());
        let configuration = configurations
            .first()
            .filter(|_| self.supported.iter().any(|s| s == key_system))
            .ok_or_else(|| Error::Cdm(format!("{} is not supported", key_system)))?;
        Ok(Arc::new(FakeAccess {
            key_system: key_system.to_string(),
            configuration: configuration.clone(),
            media_keys: self.media_keys.clone(),
            fail_creation: self.fail_media_keys_creation.load(Ordering::SeqCst),
        }))
    }
}

/// Media element recording the MediaKeys attached to it.
#[derive(Default)]
pub struct FakeMediaElement {
    media_keys: Mutex<Option<Arc<dyn MediaKeys>>>,
    attach_calls: AtomicUsize,
    fail_attachments: AtomicBool,
}

impl FakeMediaElement {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_attachments(&self) {
        self.fail_attachments.store(true, Ordering::SeqCst);
    }

    /// Number of times MediaKeys were attached.
    pub fn attach_calls(&self) -> usize {
        self.attach_calls.load(Ordering::SeqCst)
    }

    pub fn media_keys(&self) -> Option<Arc<dyn MediaKeys>> {
        self.media_keys.lock().clone()
    }
}

#[async_trait]
impl MediaElement for FakeMediaElement {
    async fn set_media_keys(&self, media_keys: Option<Arc<dyn MediaKeys>>) -> Result<()> {
        if media_keys.is_some() {
            self.attach_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_attachments.load(Ordering::SeqCst) {
                return Err(Error::Cdm("the element refused the MediaKeys".into()));
            }
        }
        *self.media_keys.lock() = media_keys;
        Ok(())
    }
}

/// Representation protected by key IDs and a single `cenc` payload.
pub struct FakeRepresentation {
    id: String,
    protections: ContentProtections,
    decipherable: Option<bool>,
}

impl FakeRepresentation {
    pub const SYSTEM_ID: &'static str = "edef8ba979d64acea3c827dcd51d21ed";

    pub fn new(id: &str, key_ids: Vec<KeyId>, pssh: &[u8]) -> Self {
        Self {
            id: id.to_string(),
            protections: ContentProtections {
                key_ids,
                init_data: vec![ProtectionInitData {
                    init_data_type: "cenc".into(),
                    values: vec![InitDataValue::new(Some(Self::SYSTEM_ID.into()), pssh.to_vec())],
                }],
            },
            decipherable: None,
        }
    }
}

/// Manifest made of periods of [`FakeRepresentation`]s.
pub struct FakeManifest {
    periods: Mutex<Vec<(String, Vec<FakeRepresentation>)>>,
}

impl FakeManifest {
    pub fn new(periods: Vec<(&str, Vec<FakeRepresentation>)>) -> Self {
        Self {
            periods: Mutex::new(
                periods
                    .into_iter()
                    .map(|(id, representations)| (id.to_string(), representations))
                    .collect(),
            ),
        }
    }

    pub fn decipherability(&self, id: &str) -> Option<bool> {
        self.periods
            .lock()
            .iter()
            .flat_map(|(_, representations)| representations.iter())
            .find(|r| r.id == id)
            .and_then(|r| r.decipherable)
    }
}

impl Manifest for FakeManifest {
    fn period_key_ids(&self) -> Vec<PeriodKeyIds> {
        self.periods
            .lock()
            .iter()
            .map(|(period_id, representations)| {
                let mut key_ids = Vec::new();
                for representation in representations {
                    merge_key_ids_into(&mut key_ids, &representation.protections.key_ids);
                }
                PeriodKeyIds {
                    period_id: period_id.clone(),
                    key_ids,
                }
            })
            .collect()
    }

    fn update_representations_decipherability(
        &self,
        update: &mut dyn FnMut(&RepresentationView<'_>) -> Option<bool>,
    ) {
        let mut periods = self.periods.lock();
        for (_, representations) in periods.iter_mut() {
            for representation in representations.iter_mut() {
                let decipherable = update(&RepresentationView {
                    id: &representation.id,
                    decipherable: representation.decipherable,
                    content_protections: Some(&representation.protections),
                });
                representation.decipherable = decipherable;
            }
        }
    }
}
