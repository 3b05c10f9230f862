//! MediaKeys lifecycle on a media element.
//!
//! A [`MediaElementHandle`] pairs a media element with the decryption state
//! currently attached to it. The state survives between contents, so a new
//! content asking for the same key system reuses the MediaKeys and the
//! sessions already loaded on them.
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cdm::{CdmProvider, MediaElement, MediaKeySystemAccess, MediaKeys};
use crate::config::DecryptorConfig;
use crate::error::{Error, Result};
use crate::key_system::{
    build_configurations, find_key_system, key_system_candidates, KeySystemConfiguration,
    KeySystemOption,
};
use crate::loaded_sessions::LoadedSessionsStore;
use crate::persistent_sessions::PersistentSessionsStore;
use crate::utils::same_arc;

/// Everything needed to create and manage sessions for one content.
#[derive(Clone)]
pub struct MediaKeysInfos {
    pub options: Arc<KeySystemOption>,
    pub access: Arc<dyn MediaKeySystemAccess>,
    pub media_keys: Arc<dyn MediaKeys>,
    pub loaded_sessions: Arc<LoadedSessionsStore>,
    pub persistent_sessions: Option<Arc<PersistentSessionsStore>>,
    /// Configurations requested when the key system was selected.
    pub configurations: Vec<KeySystemConfiguration>,
}

/// A media element and the decryption state attached to it.
pub struct MediaElementHandle {
    element: Arc<dyn MediaElement>,
    attached: Mutex<Option<MediaKeysInfos>>,
}

impl MediaElementHandle {
    pub fn new(element: Arc<dyn MediaElement>) -> Self {
        Self {
            element,
            attached: Mutex::new(None),
        }
    }

    pub fn element(&self) -> &Arc<dyn MediaElement> {
        &self.element
    }

    /// Name of the key system currently attached, if any.
    pub fn current_key_system(&self) -> Option<String> {
        self.attached
            .lock()
            .as_ref()
            .map(|infos| infos.access.key_system().to_string())
    }

    pub(crate) fn attached(&self) -> Option<MediaKeysInfos> {
        self.attached.lock().clone()
    }

    /// Attach `infos`' MediaKeys to the element.
    ///
    /// Sessions of a previously attached, different, session store are closed
    /// first. Nothing is done on the element if the same MediaKeys are
    /// already attached.
    pub async fn attach_media_keys(&self, infos: &MediaKeysInfos) -> Result<()> {
        let previous = self.attached();
        if let Some(previous) = previous {
            if !same_arc(&previous.loaded_sessions, &infos.loaded_sessions) {
                debug!("DRM: Closing sessions of the previous MediaKeys");
                if let Err(err) = previous.loaded_sessions.close_all_sessions().await {
                    warn!("DRM: Could not close all previous sessions: {}", err);
                }
            }
            if same_arc(&previous.media_keys, &infos.media_keys) {
                debug!("DRM: MediaKeys already attached");
                *self.attached.lock() = Some(infos.clone());
                return Ok(());
            }
        }

        info!("DRM: Attaching MediaKeys to the media element");
        if let Err(err) = self
            .element
            .set_media_keys(Some(infos.media_keys.clone()))
            .await
        {
            *self.attached.lock() = None;
            return Err(Error::MediaKeysAttachment(err.to_string()));
        }
        *self.attached.lock() = Some(infos.clone());
        Ok(())
    }

    /// Close every session of the attached state and detach the MediaKeys.
    pub async fn dispose_decryption_resources(&self) -> Result<()> {
        let Some(current) = self.attached.lock().take() else {
            return Ok(());
        };
        info!("DRM: Disposing of the decryption resources");
        let closed = current.loaded_sessions.close_all_sessions().await;
        self.element
            .set_media_keys(None)
            .await
            .map_err(|err| Error::MediaKeysAttachment(err.to_string()))?;
        closed
    }
}

/// Select a key system and create MediaKeys for it, reusing the state
/// attached to `handle` when it is compatible with one of `options`.
pub async fn init_media_keys(
    handle: &MediaElementHandle,
    provider: &dyn CdmProvider,
    options: &[KeySystemOption],
    config: &DecryptorConfig,
) -> Result<MediaKeysInfos> {
    if let Some(current) = handle.attached() {
        let key_system = current.access.key_system().to_string();
        let compatible = options.iter().find(|option| {
            key_system_candidates(&option.key_system).contains(&key_system)
                && build_configurations(option, &key_system) == current.configurations
        });
        if let Some(option) = compatible {
            info!("DRM: Reusing already attached MediaKeys ({})", key_system);
            return Ok(MediaKeysInfos {
                options: Arc::new(option.clone()),
                persistent_sessions: persistent_store(option),
                ..current
            });
        }
    }

    let found = find_key_system(provider, options).await?;
    let option = options
        .get(found.option_index)
        .cloned()
        .ok_or_else(|| Error::InvalidState("selected key system option is missing".into()))?;
    let media_keys = found
        .access
        .create_media_keys()
        .await
        .map_err(|err| Error::CreateMediaKeys(err.to_string()))?;
    info!("DRM: MediaKeys created for {}", found.access.key_system());

    Ok(MediaKeysInfos {
        persistent_sessions: persistent_store(&option),
        options: Arc::new(option),
        loaded_sessions: Arc::new(LoadedSessionsStore::new(media_keys.clone(), config.clone())),
        access: found.access,
        media_keys,
        configurations: found.configurations,
    })
}

fn persistent_store(option: &KeySystemOption) -> Option<Arc<PersistentSessionsStore>> {
    option
        .persistent_storage
        .as_ref()
        .map(|storage| Arc::new(PersistentSessionsStore::new(storage.clone())))
}
