//! Top-level decryption state machine for one content.
//!
//! ```text
//! Initializing -> WaitingForAttachment -> ReadyForContent
//!       \________________\______________________\__> Error | Disposed
//! ```
//!
//! Initialization data is queued and processed in order. While a session is
//! being negotiated the queue is locked; under the default `InitData` license
//! policy it is unlocked as soon as the session's listener is set up, under
//! the other policies only once the license's keys are known.
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cdm::{CdmProvider, MediaKeySession, SessionType};
use crate::config::DecryptorConfig;
use crate::create_session::{create_or_load_session, SessionLoadingKind};
use crate::error::{Error, Result};
use crate::init_data::InitializationData;
use crate::key::{
    are_all_key_ids_contained_in, are_some_key_ids_contained_in, is_key_id_contained_in,
    merge_key_ids_into, KeyId,
};
use crate::key_system::{
    can_create_persistent_session, system_id_for, KeySystemOption, SingleLicensePer,
};
use crate::loaded_sessions::ClosingStatus;
use crate::manifest::{
    blacklist_protection_data, content_key_ids, key_ids_of_period, update_decipherability,
    Manifest,
};
use crate::media_keys::{init_media_keys, MediaElementHandle, MediaKeysInfos};
use crate::session::KeySessionRecord;
use crate::session_events::{SessionEvent, SessionEventsListener};

/// State of a [`ContentDecryptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentDecryptorState {
    /// Looking for a key system and creating MediaKeys.
    Initializing,
    /// MediaKeys are ready, [`ContentDecryptor::attach`] can be called.
    WaitingForAttachment,
    /// Initialization data can be processed.
    ReadyForContent,
    Error,
    Disposed,
}

/// Event emitted by a [`ContentDecryptor`].
#[derive(Debug)]
pub enum DecryptorEvent {
    StateChange(ContentDecryptorState),
    Warning(Error),
    /// Fatal error, emitted at most once.
    Error(Error),
}

/// Usable and unusable key IDs linked to a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct LinkedKeyIds {
    whitelisted: Vec<KeyId>,
    blacklisted: Vec<KeyId>,
}

/// Session handled by this decryptor.
struct SessionInfo {
    id: u64,
    record: Arc<KeySessionRecord>,
    source: SessionLoadingKind,
    /// Set once the session's key statuses were evaluated.
    key_statuses: Option<LinkedKeyIds>,
    is_blacklisted: bool,
}

/// Manifest change computed under the state lock and applied after it.
enum ManifestUpdate {
    Decipherability {
        manifest: Arc<dyn Manifest>,
        blacklisted: Vec<KeyId>,
    },
    ProtectionData {
        manifest: Arc<dyn Manifest>,
        init_data: InitializationData,
    },
}

impl ManifestUpdate {
    fn apply(self) {
        match self {
            ManifestUpdate::Decipherability {
                manifest,
                blacklisted,
            } => update_decipherability(manifest.as_ref(), &[], &blacklisted, &[]),
            ManifestUpdate::ProtectionData {
                manifest,
                init_data,
            } => blacklist_protection_data(manifest.as_ref(), &init_data),
        }
    }
}

enum Step {
    Handled(Option<ManifestUpdate>),
    Negotiate(InitializationData, MediaKeysInfos),
}

struct Inner {
    state: ContentDecryptorState,
    media_keys: Option<MediaKeysInfos>,
    attach_requested: bool,
    /// MediaKeys are attached to the media element.
    is_attached: bool,
    init_data_queue: VecDeque<InitializationData>,
    queue_locked: bool,
    sessions: Vec<SessionInfo>,
    next_session_id: u64,
}

impl Inner {
    fn can_process(&self) -> bool {
        self.state == ContentDecryptorState::ReadyForContent && self.is_attached && !self.queue_locked
    }

    fn is_stopped(&self) -> bool {
        matches!(
            self.state,
            ContentDecryptorState::Error | ContentDecryptorState::Disposed
        )
    }

    /// Decide what to do with `init_data` without awaiting anything. Locks the
    /// queue when a negotiation has to start.
    fn prepare(&mut self, init_data: InitializationData, infos: &MediaKeysInfos) -> Step {
        if let Some(update) = self.try_to_use_already_created_session(&init_data, infos) {
            return Step::Handled(update);
        }

        match infos.options.single_license_per {
            SingleLicensePer::Content => {
                let first_created = self
                    .sessions
                    .iter()
                    .find(|s| s.source == SessionLoadingKind::Created);
                if let Some(first_created) = first_created {
                    // The content's license is already there and does not
                    // cover these keys.
                    return Step::Handled(match init_data.key_ids.as_deref() {
                        None => match &init_data.content {
                            Some(content) => Some(ManifestUpdate::ProtectionData {
                                manifest: content.manifest.clone(),
                                init_data: init_data.clone(),
                            }),
                            None => {
                                warn!("DRM: Unable to fallback from a non-decipherable quality");
                                None
                            }
                        },
                        Some(key_ids) => {
                            first_created.record.associate_key_ids(key_ids);
                            init_data.content.as_ref().map(|content| {
                                ManifestUpdate::Decipherability {
                                    manifest: content.manifest.clone(),
                                    blacklisted: key_ids.to_vec(),
                                }
                            })
                        }
                    });
                }
            }
            SingleLicensePer::Periods => {
                if let Some(content) = &init_data.content {
                    let period_key_ids =
                        key_ids_of_period(content.manifest.as_ref(), &content.period_id);
                    let owner = self
                        .sessions
                        .iter()
                        .filter(|s| s.source == SessionLoadingKind::Created)
                        .find(|s| {
                            period_key_ids
                                .iter()
                                .any(|key_id| s.record.is_associated_with_key_id(key_id))
                        });
                    if let Some(owner) = owner {
                        owner.record.associate_key_ids(&period_key_ids);
                        let whitelisted = owner
                            .key_statuses
                            .as_ref()
                            .map(|k| k.whitelisted.as_slice())
                            .unwrap_or_default();
                        let blacklisted: Vec<KeyId> = period_key_ids
                            .iter()
                            .filter(|key_id| !is_key_id_contained_in(key_id, whitelisted))
                            .cloned()
                            .collect();
                        return Step::Handled((!blacklisted.is_empty()).then(|| {
                            ManifestUpdate::Decipherability {
                                manifest: content.manifest.clone(),
                                blacklisted,
                            }
                        }));
                    }
                }
            }
            SingleLicensePer::InitData => {}
        }

        self.queue_locked = true;
        Step::Negotiate(init_data, infos.clone())
    }

    /// `Some` when a session handled by this decryptor already covers
    /// `init_data`.
    fn try_to_use_already_created_session(
        &mut self,
        init_data: &InitializationData,
        infos: &MediaKeysInfos,
    ) -> Option<Option<ManifestUpdate>> {
        let index = self
            .sessions
            .iter()
            .position(|s| s.record.is_compatible_with(init_data))?;
        let info = &self.sessions[index];

        if info.is_blacklisted {
            let Some(content) = init_data.content.as_ref().filter(|_| init_data.init_data_type.is_some())
            else {
                error!("DRM: Cannot forbid key id, the content is unknown.");
                return Some(None);
            };
            info!("DRM: Init data previously blacklisted, blacklisting it");
            return Some(Some(ManifestUpdate::ProtectionData {
                manifest: content.manifest.clone(),
                init_data: init_data.clone(),
            }));
        }

        if let (Some(statuses), Some(key_ids)) = (&info.key_statuses, init_data.known_key_ids()) {
            let blacklisted: Vec<KeyId> = match infos.options.single_license_per {
                // Only avoid the session when every key is unusable.
                SingleLicensePer::InitData => {
                    if are_all_key_ids_contained_in(key_ids, &statuses.blacklisted) {
                        key_ids.to_vec()
                    } else {
                        Vec::new()
                    }
                }
                _ => key_ids
                    .iter()
                    .filter(|key_id| !is_key_id_contained_in(key_id, &statuses.whitelisted))
                    .cloned()
                    .collect(),
            };
            if !blacklisted.is_empty() {
                info!("DRM: Init data's key ids are not decipherable, blacklisting them");
                return Some(init_data.content.as_ref().map(|content| {
                    ManifestUpdate::Decipherability {
                        manifest: content.manifest.clone(),
                        blacklisted,
                    }
                }));
            }
        }

        if infos.loaded_sessions.reuse(init_data).is_some() {
            debug!("DRM: Init data already processed. Skipping it.");
            return Some(None);
        }

        // The session has been closed since, start again.
        self.sessions.remove(index);
        None
    }
}

/// Context of one session's event handling task.
struct SessionContext {
    info_id: u64,
    init_data: InitializationData,
    record: Arc<KeySessionRecord>,
    session: Arc<dyn MediaKeySession>,
    session_type: SessionType,
    is_current_license: bool,
    infos: MediaKeysInfos,
}

struct Shared {
    inner: Mutex<Inner>,
    events: mpsc::UnboundedSender<DecryptorEvent>,
    cancel: CancellationToken,
    config: DecryptorConfig,
    handle: Arc<MediaElementHandle>,
    provider: Arc<dyn CdmProvider>,
    options: Vec<KeySystemOption>,
}

/// Negotiates decryption sessions for one content on one media element.
///
/// Dropping the decryptor disposes of it.
pub struct ContentDecryptor {
    shared: Arc<Shared>,
}

impl ContentDecryptor {
    /// Start looking for a key system among `options`, in order.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        handle: Arc<MediaElementHandle>,
        provider: Arc<dyn CdmProvider>,
        options: Vec<KeySystemOption>,
        config: DecryptorConfig,
    ) -> (Self, mpsc::UnboundedReceiver<DecryptorEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: ContentDecryptorState::Initializing,
                media_keys: None,
                attach_requested: false,
                is_attached: false,
                init_data_queue: VecDeque::new(),
                queue_locked: true,
                sessions: Vec::new(),
                next_session_id: 0,
            }),
            events,
            cancel: CancellationToken::new(),
            config,
            handle,
            provider,
            options,
        });
        tokio::spawn(shared.clone().initialize());
        (Self { shared }, receiver)
    }

    #[must_use]
    pub fn state(&self) -> ContentDecryptorState {
        self.shared.inner.lock().state
    }

    /// DRM system id of the selected key system, as lowercase hex.
    #[must_use]
    pub fn system_id(&self) -> Option<String> {
        let inner = self.shared.inner.lock();
        let infos = inner.media_keys.as_ref()?;
        system_id_for(infos.access.key_system()).map(|uuid| uuid.simple().to_string())
    }

    /// Attach the MediaKeys to the media element.
    ///
    /// Only allowed once the decryptor is waiting for attachment. Later calls
    /// are no-ops.
    pub fn attach(&self) -> Result<()> {
        let infos = {
            let mut inner = self.shared.inner.lock();
            match inner.state {
                ContentDecryptorState::WaitingForAttachment | ContentDecryptorState::ReadyForContent
                    if inner.attach_requested =>
                {
                    debug!("DRM: MediaKeys attachment already started");
                    return Ok(());
                }
                ContentDecryptorState::WaitingForAttachment => {}
                state => {
                    return Err(Error::InvalidState(format!(
                        "cannot attach MediaKeys in the {:?} state",
                        state
                    )));
                }
            }
            let Some(infos) = inner.media_keys.clone() else {
                return Err(Error::InvalidState("MediaKeys are not created".into()));
            };
            inner.attach_requested = true;
            if infos.options.disable_media_keys_attachment_lock {
                inner.state = ContentDecryptorState::ReadyForContent;
                self.shared
                    .emit(DecryptorEvent::StateChange(ContentDecryptorState::ReadyForContent));
            }
            infos
        };
        tokio::spawn(self.shared.clone().attach_media_keys(infos));
        Ok(())
    }

    /// Handle initialization data encountered in the content.
    pub fn on_initialization_data(&self, init_data: InitializationData) -> Result<()> {
        {
            let mut inner = self.shared.inner.lock();
            if inner.is_stopped() {
                return Err(Error::InvalidState(
                    "the content decryptor is stopped".into(),
                ));
            }
            inner.init_data_queue.push_back(init_data);
        }
        self.shared.process_queue();
        Ok(())
    }

    /// Stop every pending operation.
    pub fn dispose(&self) {
        {
            let mut inner = self.shared.inner.lock();
            if inner.state == ContentDecryptorState::Disposed {
                return;
            }
            inner.state = ContentDecryptorState::Disposed;
            inner.init_data_queue.clear();
        }
        info!("DRM: Disposing of the content decryptor");
        self.shared.cancel.cancel();
        self.shared
            .emit(DecryptorEvent::StateChange(ContentDecryptorState::Disposed));
    }
}

impl Drop for ContentDecryptor {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl Shared {
    fn emit(&self, event: DecryptorEvent) {
        let _ = self.events.send(event);
    }

    fn is_stopped(&self) -> bool {
        self.inner.lock().is_stopped()
    }

    async fn initialize(self: Arc<Self>) {
        let result = tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = init_media_keys(&self.handle, self.provider.as_ref(), &self.options, &self.config) => result,
        };
        let infos = match result {
            Ok(infos) => infos,
            Err(err) => return self.on_fatal_error(err),
        };

        if infos.options.close_sessions_on_stop {
            let cancel = self.cancel.clone();
            let loaded_sessions = infos.loaded_sessions.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                if let Err(err) = loaded_sessions.close_all_sessions().await {
                    warn!("DRM: Could not close all sessions on stop: {}", err);
                }
            });
        }

        let mut inner = self.inner.lock();
        if inner.state != ContentDecryptorState::Initializing {
            return;
        }
        inner.media_keys = Some(infos);
        inner.state = ContentDecryptorState::WaitingForAttachment;
        self.emit(DecryptorEvent::StateChange(
            ContentDecryptorState::WaitingForAttachment,
        ));
    }

    async fn attach_media_keys(self: Arc<Self>, infos: MediaKeysInfos) {
        let result = tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = self.handle.attach_media_keys(&infos) => result,
        };
        if let Err(err) = result {
            return self.on_fatal_error(err);
        }

        if let Some(certificate) = &infos.options.server_certificate {
            match infos.media_keys.set_server_certificate(certificate).await {
                Ok(true) => info!("DRM: Server certificate set"),
                Ok(false) => debug!("DRM: The CDM does not use server certificates"),
                Err(err) => {
                    warn!("DRM: Could not set the server certificate: {}", err);
                    self.emit(DecryptorEvent::Warning(Error::ServerCertificate(
                        err.to_string(),
                    )));
                }
            }
        }

        {
            let mut inner = self.inner.lock();
            if inner.is_stopped() {
                return;
            }
            info!("DRM: MediaKeys attached, processing initialization data");
            inner.is_attached = true;
            inner.queue_locked = false;
            if inner.state != ContentDecryptorState::ReadyForContent {
                inner.state = ContentDecryptorState::ReadyForContent;
                self.emit(DecryptorEvent::StateChange(
                    ContentDecryptorState::ReadyForContent,
                ));
            }
        }
        self.process_queue();
    }

    /// Process queued initialization data until the queue is empty or locked.
    fn process_queue(self: &Arc<Self>) {
        loop {
            let step = {
                let mut inner = self.inner.lock();
                if !inner.can_process() {
                    return;
                }
                let Some(infos) = inner.media_keys.clone() else {
                    return;
                };
                let Some(init_data) = inner.init_data_queue.pop_front() else {
                    return;
                };
                inner.prepare(init_data, &infos)
            };
            match step {
                Step::Handled(update) => {
                    if let Some(update) = update {
                        update.apply();
                    }
                }
                Step::Negotiate(init_data, infos) => {
                    tokio::spawn(self.clone().negotiate(init_data, infos));
                }
            }
        }
    }

    fn unlock_queue(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            if !inner.queue_locked {
                return;
            }
            inner.queue_locked = false;
        }
        self.process_queue();
    }

    async fn negotiate(self: Arc<Self>, init_data: InitializationData, infos: MediaKeysInfos) {
        match self.try_negotiate(init_data, infos).await {
            Ok(()) | Err(Error::Cancelled) => {}
            Err(err) => self.on_fatal_error(err),
        }
    }

    async fn try_negotiate(
        self: &Arc<Self>,
        init_data: InitializationData,
        infos: MediaKeysInfos,
    ) -> Result<()> {
        let options = infos.options.clone();
        let wanted_session_type = if options.persistent_storage.is_none() {
            SessionType::Temporary
        } else if !can_create_persistent_session(infos.access.as_ref()) {
            warn!("DRM: Cannot create \"persistent-license\" session: not supported");
            SessionType::Temporary
        } else {
            SessionType::PersistentLicense
        };
        let max_session_cache_size = options
            .max_session_cache_size
            .unwrap_or(self.config.max_simultaneous_sessions);

        let creation = create_or_load_session(
            &init_data,
            &infos.loaded_sessions,
            infos.persistent_sessions.as_deref(),
            wanted_session_type,
            max_session_cache_size,
            &self.cancel,
        )
        .await?;
        if self.is_stopped() {
            return Ok(());
        }

        let session = creation.entry.session.clone();
        let info_id = {
            let mut inner = self.inner.lock();
            let id = inner.next_session_id;
            inner.next_session_id += 1;
            inner.sessions.push(SessionInfo {
                id,
                record: creation.entry.record.clone(),
                source: creation.kind,
                key_statuses: None,
                is_blacklisted: false,
            });
            id
        };

        let listener =
            SessionEventsListener::new(session.clone(), options.clone(), self.config.clone());
        let session_events = listener.spawn(self.cancel.child_token());
        let context = SessionContext {
            info_id,
            init_data: init_data.clone(),
            record: creation.entry.record.clone(),
            session: session.clone(),
            session_type: creation.entry.session_type,
            is_current_license: creation.kind == SessionLoadingKind::Created,
            infos: infos.clone(),
        };
        tokio::spawn(self.clone().handle_session_events(session_events, context));

        if options.single_license_per == SingleLicensePer::InitData {
            self.unlock_queue();
        }

        if creation.kind == SessionLoadingKind::Created {
            let request_data = init_data.values.construct_request_data();
            let generated = infos
                .loaded_sessions
                .generate_license_request(&session, init_data.init_data_type.as_deref(), &request_data)
                .await;
            if let Err(err) = generated {
                let closing = infos
                    .loaded_sessions
                    .get_entry_for_session(&session)
                    .map_or(true, |entry| entry.closing_status != ClosingStatus::None);
                if closing {
                    debug!("DRM: Session closed while generating its request");
                    self.inner.lock().sessions.retain(|s| s.id != info_id);
                    return Ok(());
                }
                return Err(Error::KeyGenerateRequest(err.to_string()));
            }
        }
        Ok(())
    }

    async fn handle_session_events(
        self: Arc<Self>,
        mut session_events: mpsc::Receiver<SessionEvent>,
        context: SessionContext,
    ) {
        let mut is_persisted = false;
        while let Some(event) = session_events.recv().await {
            if self.is_stopped() {
                break;
            }
            match event {
                SessionEvent::Warning(err) => self.emit(DecryptorEvent::Warning(err)),
                SessionEvent::KeysUpdate {
                    whitelisted,
                    blacklisted,
                } => {
                    self.on_keys_update(&context, whitelisted, blacklisted, &mut is_persisted);
                }
                SessionEvent::Blacklisted(err) => self.on_session_blacklisted(&context, err),
                SessionEvent::Fatal(err) => self.on_fatal_error(err),
            }
        }
    }

    fn on_keys_update(
        self: &Arc<Self>,
        context: &SessionContext,
        whitelisted: Vec<KeyId>,
        blacklisted: Vec<KeyId>,
        is_persisted: &mut bool,
    ) {
        let linked = key_ids_linked_to_session(
            &context.init_data,
            context.infos.options.single_license_per,
            context.is_current_license,
            whitelisted,
            blacklisted,
        );
        context.record.associate_key_ids(&linked.whitelisted);
        context.record.associate_key_ids(&linked.blacklisted);
        {
            let mut inner = self.inner.lock();
            if let Some(info) = inner.sessions.iter_mut().find(|s| s.id == context.info_id) {
                info.key_statuses = Some(linked.clone());
            }
        }

        if !*is_persisted && context.session_type == SessionType::PersistentLicense {
            if let Some(persistent) = &context.infos.persistent_sessions {
                let associated = context.record.associated_key_ids();
                if !associated.is_empty() {
                    let limit = self.config.max_stored_persistent_sessions.saturating_sub(1);
                    if persistent.len() > limit {
                        persistent.delete_old_sessions(persistent.len() - limit);
                    }
                    persistent.add(
                        &context.init_data,
                        Some(associated.as_slice()),
                        &context.session.session_id(),
                    );
                    *is_persisted = true;
                }
            }
        }

        if let Some(content) = &context.init_data.content {
            update_decipherability(
                content.manifest.as_ref(),
                &linked.whitelisted,
                &linked.blacklisted,
                &[],
            );
        }
        self.unlock_queue();
    }

    fn on_session_blacklisted(self: &Arc<Self>, context: &SessionContext, err: Error) {
        {
            let mut inner = self.inner.lock();
            if let Some(info) = inner.sessions.iter_mut().find(|s| s.id == context.info_id) {
                info.is_blacklisted = true;
            }
        }
        match &context.init_data.content {
            Some(content) if context.init_data.init_data_type.is_some() => {
                info!("DRM: Blacklisting the protection data of a failed session");
                blacklist_protection_data(content.manifest.as_ref(), &context.init_data);
            }
            _ => error!("DRM: Cannot blacklist the session's content, it is unknown"),
        }
        self.emit(DecryptorEvent::Warning(err));
        self.unlock_queue();
    }

    fn on_fatal_error(&self, err: Error) {
        {
            let mut inner = self.inner.lock();
            if inner.is_stopped() {
                debug!("DRM: Ignoring error after stop: {}", err);
                return;
            }
            inner.state = ContentDecryptorState::Error;
            inner.init_data_queue.clear();
        }
        error!("DRM: Fatal error: {}", err);
        self.cancel.cancel();
        self.emit(DecryptorEvent::Error(err));
        self.emit(DecryptorEvent::StateChange(ContentDecryptorState::Error));
    }
}

/// Split the key IDs linked to a session into usable and unusable ones.
///
/// Key IDs announced with the initialization data but missing from the
/// CDM's answer are unusable. For the session holding a content or period
/// license, the other keys of that content or those periods are unusable
/// unless the CDM reported them as usable.
fn key_ids_linked_to_session(
    init_data: &InitializationData,
    single_license_per: SingleLicensePer,
    is_current_license: bool,
    usable: Vec<KeyId>,
    unusable: Vec<KeyId>,
) -> LinkedKeyIds {
    let usable_count = usable.len();
    let mut associated = usable;
    merge_key_ids_into(&mut associated, &unusable);

    if let Some(expected) = &init_data.key_ids {
        let missing: Vec<KeyId> = expected
            .iter()
            .filter(|key_id| !is_key_id_contained_in(key_id, &associated))
            .cloned()
            .collect();
        if !missing.is_empty() {
            warn!(
                "DRM: {} key ids announced for the content were not found in the license",
                missing.len()
            );
            associated.extend(missing);
        }
    }

    if is_current_license {
        if let Some(content) = &init_data.content {
            let manifest = content.manifest.as_ref();
            match single_license_per {
                SingleLicensePer::Content => {
                    merge_key_ids_into(&mut associated, &content_key_ids(manifest));
                }
                SingleLicensePer::Periods => {
                    for period in manifest.period_key_ids() {
                        if period.period_id == content.period_id
                            || are_some_key_ids_contained_in(&period.key_ids, &associated)
                        {
                            merge_key_ids_into(&mut associated, &period.key_ids);
                        }
                    }
                }
                SingleLicensePer::InitData => {}
            }
        }
    }

    let blacklisted = associated.split_off(usable_count);
    LinkedKeyIds {
        whitelisted: associated,
        blacklisted,
    }
}
