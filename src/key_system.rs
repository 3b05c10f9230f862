//! Key system options and selection.
//!
//! An application describes each DRM it can play with a [`KeySystemOption`].
//! Options are tried in order against the platform's [`CdmProvider`] until one
//! key system accepts a configuration.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cdm::{CdmProvider, MediaKeySystemAccess, SessionType};
use crate::config::DecryptorConfig;
use crate::error::{Error, Result};
use crate::license::{KeyStatusesHandler, LicenseFetcher};
use crate::storage::PersistentSessionsStorage;

/// Widevine system UUID.
pub const WIDEVINE_UUID: Uuid = Uuid::from_u128(0xedef8ba979d64acea3c827dcd51d21ed);
/// PlayReady system UUID.
pub const PLAYREADY_UUID: Uuid = Uuid::from_u128(0x9a04f07998404286ab92e65be0885f95);
/// W3C ClearKey system UUID.
pub const CLEARKEY_UUID: Uuid = Uuid::from_u128(0xe2719d58a985b3c9781ab030af78d30e);
/// FairPlay system UUID.
pub const FAIRPLAY_UUID: Uuid = Uuid::from_u128(0x94ce86fb07ff4f43adb893d2fa968ca2);

const WIDEVINE_ROBUSTNESSES: [&str; 5] = [
    "HW_SECURE_ALL",
    "HW_SECURE_DECODE",
    "HW_SECURE_CRYPTO",
    "SW_SECURE_DECODE",
    "SW_SECURE_CRYPTO",
];
const PLAYREADY_ROBUSTNESSES: [&str; 2] = ["3000", "2000"];

const VIDEO_CONTENT_TYPES: [&str; 3] = [
    r#"video/mp4;codecs="avc1.4d401e""#,
    r#"video/mp4;codecs="avc1.42e01e""#,
    r#"video/webm;codecs="vp8""#,
];
const AUDIO_CONTENT_TYPES: [&str; 2] = [
    r#"audio/mp4;codecs="mp4a.40.2""#,
    "audio/webm;codecs=opus",
];

/// How many licenses a content needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SingleLicensePer {
    /// One license per distinct initialization data.
    #[default]
    InitData,
    /// One license for the whole content.
    Content,
    /// One license per manifest period.
    Periods,
}

/// What to do with a key in a problematic status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyStatusPolicy {
    /// Fail the whole decryption.
    #[default]
    Error,
    /// Warn and keep using the key.
    Continue,
    /// Warn and stop playing what depends on the key.
    Fallback,
}

/// Timeout of one license request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LicenseTimeout {
    /// Use [`DecryptorConfig::license_default_timeout_ms`].
    #[default]
    Default,
    Disabled,
    After(Duration),
}

impl LicenseTimeout {
    #[must_use]
    pub fn resolve(self, config: &DecryptorConfig) -> Option<Duration> {
        match self {
            LicenseTimeout::Default => Some(config.license_default_timeout()),
            LicenseTimeout::Disabled => None,
            LicenseTimeout::After(duration) => Some(duration),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LicenseRequestConfig {
    /// Retries after a failed request, `None` for the configured default.
    pub retry: Option<u32>,
    pub timeout: LicenseTimeout,
}

/// How strongly a CDM feature is wanted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MediaKeysRequirement {
    Required,
    #[default]
    Optional,
    NotAllowed,
}

/// A codec and the robustness it should be decrypted with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaCapability {
    pub content_type: String,
    pub robustness: String,
}

/// Configuration requested from, and accepted by, a key system.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySystemConfiguration {
    pub init_data_types: Vec<String>,
    pub video_capabilities: Vec<MediaCapability>,
    pub audio_capabilities: Vec<MediaCapability>,
    pub distinctive_identifier: MediaKeysRequirement,
    pub persistent_state: MediaKeysRequirement,
    pub session_types: Vec<SessionType>,
}

/// Everything needed to decrypt a content with one DRM.
#[derive(Clone)]
pub struct KeySystemOption {
    /// Short name (`widevine`, `playready`, `clearkey`, `fairplay`) or a
    /// full key system name.
    pub key_system: String,
    pub license_fetcher: Arc<dyn LicenseFetcher>,
    pub license_request: LicenseRequestConfig,
    pub key_statuses_handler: Option<Arc<dyn KeyStatusesHandler>>,
    pub server_certificate: Option<Vec<u8>>,
    /// Enables persistent-license sessions.
    pub persistent_storage: Option<Arc<dyn PersistentSessionsStorage>>,
    pub persistent_state_required: bool,
    pub distinctive_identifier_required: bool,
    pub single_license_per: SingleLicensePer,
    /// Loaded sessions kept open, `None` for the configured default.
    pub max_session_cache_size: Option<usize>,
    pub on_key_expiration: KeyStatusPolicy,
    pub on_key_internal_error: KeyStatusPolicy,
    pub on_key_output_restricted: KeyStatusPolicy,
    pub close_sessions_on_stop: bool,
    pub disable_media_keys_attachment_lock: bool,
    pub video_robustnesses: Option<Vec<String>>,
    pub audio_robustnesses: Option<Vec<String>>,
}

impl KeySystemOption {
    pub fn new(key_system: impl Into<String>, license_fetcher: Arc<dyn LicenseFetcher>) -> Self {
        Self {
            key_system: key_system.into(),
            license_fetcher,
            license_request: LicenseRequestConfig::default(),
            key_statuses_handler: None,
            server_certificate: None,
            persistent_storage: None,
            persistent_state_required: false,
            distinctive_identifier_required: false,
            single_license_per: SingleLicensePer::default(),
            max_session_cache_size: None,
            on_key_expiration: KeyStatusPolicy::default(),
            on_key_internal_error: KeyStatusPolicy::default(),
            on_key_output_restricted: KeyStatusPolicy::default(),
            close_sessions_on_stop: false,
            disable_media_keys_attachment_lock: false,
            video_robustnesses: None,
            audio_robustnesses: None,
        }
    }
}

impl fmt::Debug for KeySystemOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySystemOption")
            .field("key_system", &self.key_system)
            .field("license_request", &self.license_request)
            .field("has_key_statuses_handler", &self.key_statuses_handler.is_some())
            .field("has_server_certificate", &self.server_certificate.is_some())
            .field("persistent", &self.persistent_storage.is_some())
            .field("single_license_per", &self.single_license_per)
            .field("max_session_cache_size", &self.max_session_cache_size)
            .field("on_key_expiration", &self.on_key_expiration)
            .field("on_key_internal_error", &self.on_key_internal_error)
            .field("on_key_output_restricted", &self.on_key_output_restricted)
            .field("close_sessions_on_stop", &self.close_sessions_on_stop)
            .finish_non_exhaustive()
    }
}

/// Key system names to try for an option's `key_system`.
#[must_use]
pub fn key_system_candidates(key_system: &str) -> Vec<String> {
    let known: &[&str] = match key_system {
        "widevine" => &["com.widevine.alpha"],
        "playready" => &[
            "com.microsoft.playready.recommendation",
            "com.microsoft.playready",
            "com.chromecast.playready",
            "com.youtube.playready",
        ],
        "clearkey" => &["webkit-org.w3.clearkey", "org.w3.clearkey"],
        "fairplay" => &["com.apple.fps.1_0"],
        other => return vec![other.to_string()],
    };
    known.iter().map(|name| (*name).to_string()).collect()
}

fn default_robustnesses(key_system: &str) -> Vec<String> {
    let defaults: &[&str] = if key_system == "com.widevine.alpha" {
        &WIDEVINE_ROBUSTNESSES
    } else if key_system == "com.microsoft.playready.recommendation" {
        &PLAYREADY_ROBUSTNESSES
    } else {
        &[""]
    };
    defaults.iter().map(|r| (*r).to_string()).collect()
}

fn capabilities(content_types: &[&str], robustnesses: &[String]) -> Vec<MediaCapability> {
    robustnesses
        .iter()
        .flat_map(|robustness| {
            content_types.iter().map(move |content_type| MediaCapability {
                content_type: (*content_type).to_string(),
                robustness: robustness.clone(),
            })
        })
        .collect()
}

/// Configurations requested for `key_system`: a full one with capabilities,
/// then a relaxed one without.
#[must_use]
pub fn build_configurations(option: &KeySystemOption, key_system: &str) -> Vec<KeySystemConfiguration> {
    let mut session_types = vec![SessionType::Temporary];
    let mut persistent_state = if option.persistent_state_required {
        MediaKeysRequirement::Required
    } else {
        MediaKeysRequirement::Optional
    };
    if option.persistent_storage.is_some() {
        session_types.push(SessionType::PersistentLicense);
        persistent_state = MediaKeysRequirement::Required;
    }
    let distinctive_identifier = if option.distinctive_identifier_required {
        MediaKeysRequirement::Required
    } else {
        MediaKeysRequirement::Optional
    };
    let video_robustnesses = option
        .video_robustnesses
        .clone()
        .unwrap_or_else(|| default_robustnesses(key_system));
    let audio_robustnesses = option
        .audio_robustnesses
        .clone()
        .unwrap_or_else(|| default_robustnesses(key_system));

    let full = KeySystemConfiguration {
        init_data_types: vec!["cenc".to_string()],
        video_capabilities: capabilities(&VIDEO_CONTENT_TYPES, &video_robustnesses),
        audio_capabilities: capabilities(&AUDIO_CONTENT_TYPES, &audio_robustnesses),
        distinctive_identifier,
        persistent_state,
        session_types,
    };
    let relaxed = KeySystemConfiguration {
        video_capabilities: Vec::new(),
        audio_capabilities: Vec::new(),
        ..full.clone()
    };
    vec![full, relaxed]
}

/// Key system accepted by the CDM provider.
#[derive(Clone)]
pub struct FoundKeySystem {
    /// Index of the accepted option.
    pub option_index: usize,
    pub access: Arc<dyn MediaKeySystemAccess>,
    /// Configurations that were requested.
    pub configurations: Vec<KeySystemConfiguration>,
}

/// Try every option, and every candidate name of each option, in order.
pub async fn find_key_system(
    provider: &dyn CdmProvider,
    options: &[KeySystemOption],
) -> Result<FoundKeySystem> {
    let mut tried = Vec::new();
    for (option_index, option) in options.iter().enumerate() {
        for key_system in key_system_candidates(&option.key_system) {
            let configurations = build_configurations(option, &key_system);
            debug!("DRM: Requesting key system access for {}", key_system);
            match provider
                .request_media_key_system_access(&key_system, &configurations)
                .await
            {
                Ok(access) => {
                    info!("DRM: Found compatible key system {}", key_system);
                    return Ok(FoundKeySystem {
                        option_index,
                        access,
                        configurations,
                    });
                }
                Err(err) => {
                    debug!("DRM: {} not supported: {}", key_system, err);
                    tried.push(key_system);
                }
            }
        }
    }
    Err(Error::IncompatibleKeySystems(tried.join(", ")))
}

/// DRM system id of a key system name.
#[must_use]
pub fn system_id_for(key_system: &str) -> Option<Uuid> {
    if key_system.starts_with("com.widevine") {
        Some(WIDEVINE_UUID)
    } else if key_system.contains("playready") {
        Some(PLAYREADY_UUID)
    } else if key_system.contains("clearkey") {
        Some(CLEARKEY_UUID)
    } else if key_system.starts_with("com.apple.fps") {
        Some(FAIRPLAY_UUID)
    } else {
        None
    }
}

/// Whether the accepted configuration allows persistent-license sessions.
#[must_use]
pub fn can_create_persistent_session(access: &dyn MediaKeySystemAccess) -> bool {
    access
        .configuration()
        .session_types
        .contains(&SessionType::PersistentLicense)
}
