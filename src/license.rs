//! License acquisition callbacks and retry logic.
//!
//! The application supplies the license exchange itself as a
//! [`LicenseFetcher`]. This module wraps it with a timeout and an exponential
//! backoff, and classifies the final failure.
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::key::{KeyId, KeyStatus};

/// Failure reported by an application callback.
#[derive(Debug, Clone, Default, thiserror::Error)]
#[error("{message}")]
pub struct LicenseError {
    pub message: String,
    /// Do not retry this request.
    pub no_retry: bool,
    /// When the last attempt fails with this error, blacklist the session
    /// instead of failing the whole decryption.
    pub fallback_on_last_try: bool,
}

impl LicenseError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn no_retry(mut self) -> Self {
        self.no_retry = true;
        self
    }

    #[must_use]
    pub fn fallback_on_last_try(mut self) -> Self {
        self.fallback_on_last_try = true;
        self
    }
}

/// Outcome of a license callback. `Ok(None)` means nothing has to be given
/// to the CDM.
pub type LicenseResult = std::result::Result<Option<Vec<u8>>, LicenseError>;

/// Exchanges a CDM message with the license server.
#[async_trait]
pub trait LicenseFetcher: Send + Sync {
    async fn get_license(&self, message: Vec<u8>, message_type: String) -> LicenseResult;
}

#[async_trait]
impl<F, Fut> LicenseFetcher for F
where
    F: Fn(Vec<u8>, String) -> Fut + Send + Sync,
    Fut: Future<Output = LicenseResult> + Send,
{
    async fn get_license(&self, message: Vec<u8>, message_type: String) -> LicenseResult {
        (self)(message, message_type).await
    }
}

/// Optional hook called on every key status change of a session. Returned
/// bytes are given to the session as an update.
#[async_trait]
pub trait KeyStatusesHandler: Send + Sync {
    async fn on_key_statuses_change(
        &self,
        session_id: &str,
        key_statuses: &[(KeyId, KeyStatus)],
    ) -> LicenseResult;
}

/// Backoff parameters of license requests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffOptions {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Retries after the first attempt.
    pub total_retry: u32,
    /// Relative jitter, `0.3` is +/-30%.
    pub jitter: f64,
}

/// Delay before the `retry_count`-th retry (1-based):
/// `min(base * 2^(retry_count - 1), max)`.
#[must_use]
pub fn backoff_delay(base: Duration, max: Duration, retry_count: u32) -> Duration {
    let exponent = retry_count.saturating_sub(1).min(31);
    base.saturating_mul(1 << exponent).min(max)
}

/// Randomize `delay` by up to `jitter` of its value in both directions.
#[must_use]
pub fn fuzzed_delay(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let factor = rand::thread_rng().gen_range(-jitter..=jitter);
    delay.mul_f64((1.0 + factor).max(0.0))
}

/// Final failure of a license exchange.
#[derive(Debug)]
pub enum LicenseFailure {
    /// The cancellation token fired.
    Cancelled,
    /// The session should be blacklisted, decryption goes on.
    Blacklisted(Error),
    Fatal(Error),
}

enum AttemptError {
    TimedOut(Duration),
    Failed(LicenseError),
}

impl AttemptError {
    fn is_retryable(&self) -> bool {
        match self {
            AttemptError::TimedOut(_) => true,
            AttemptError::Failed(err) => !err.no_retry,
        }
    }

    fn into_error(self) -> Error {
        match self {
            AttemptError::TimedOut(timeout) => Error::KeyLoadTimeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            },
            AttemptError::Failed(err) => Error::KeyLoad(err.message),
        }
    }
}

/// Fetch a license, retrying with backoff.
///
/// `on_retry` is awaited with the failure and the retry number before each
/// backoff sleep.
pub async fn fetch_license_with_retry<R, RFut>(
    fetcher: &dyn LicenseFetcher,
    message: &[u8],
    message_type: &str,
    timeout: Option<Duration>,
    backoff: BackoffOptions,
    cancel: &CancellationToken,
    mut on_retry: R,
) -> std::result::Result<Option<Vec<u8>>, LicenseFailure>
where
    R: FnMut(Error, u32) -> RFut,
    RFut: Future<Output = ()>,
{
    let mut retry_count = 0u32;
    loop {
        let attempt = async {
            let request = fetcher.get_license(message.to_vec(), message_type.to_string());
            match timeout {
                Some(duration) => match tokio::time::timeout(duration, request).await {
                    Ok(result) => result.map_err(AttemptError::Failed),
                    Err(_) => Err(AttemptError::TimedOut(duration)),
                },
                None => request.await.map_err(AttemptError::Failed),
            }
        };
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(LicenseFailure::Cancelled),
            result = attempt => result,
        };
        let failure = match result {
            Ok(license) => return Ok(license),
            Err(failure) => failure,
        };

        retry_count += 1;
        if !failure.is_retryable() || retry_count > backoff.total_retry {
            let fallback =
                matches!(&failure, AttemptError::Failed(err) if err.fallback_on_last_try);
            let error = failure.into_error();
            if fallback {
                warn!("DRM: Last license attempt failed, blacklisting the session: {}", error);
                return Err(LicenseFailure::Blacklisted(error));
            }
            return Err(LicenseFailure::Fatal(error));
        }

        on_retry(failure.into_error(), retry_count).await;
        let delay = fuzzed_delay(
            backoff_delay(backoff.base_delay, backoff.max_delay, retry_count),
            backoff.jitter,
        );
        debug!("DRM: Retrying license request in {:?}", delay);
        tokio::select! {
            _ = cancel.cancelled() => return Err(LicenseFailure::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
