//! Pre-session connectivity check.
//!
//! Batch runs against a remote database can spend minutes inside one
//! feature statement; a dropped uplink surfaces as an opaque mid-batch
//! statement failure. Probing a well-known URL before each session turns
//! that into an immediate [`DbError::Offline`] instead. Successes are
//! remembered briefly so back-to-back sessions don't probe on every open.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::DbError;

/// URL probed when none is configured.
pub const DEFAULT_PROBE_URL: &str = "http://www.google.com/";

/// How long the probe waits for a response.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a successful probe is trusted before re-checking.
const PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// Rate-limited HTTP reachability check run before each session open.
pub struct ConnectivityProbe {
    url: String,
    timeout: Duration,
    interval: Duration,
    client: reqwest::Client,
    last_success: Mutex<Option<Instant>>,
}

impl Default for ConnectivityProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_URL, PROBE_TIMEOUT, PROBE_INTERVAL)
    }
}

impl ConnectivityProbe {
    /// Creates a probe for the given URL, response timeout, and re-check
    /// interval.
    #[must_use]
    pub fn new(url: impl Into<String>, timeout: Duration, interval: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
            interval,
            client: reqwest::Client::new(),
            last_success: Mutex::new(None),
        }
    }

    /// Verifies the check URL is reachable, skipping the request entirely
    /// when the last success is newer than the re-check interval.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Offline`] if the request fails, times out, or
    /// returns a non-success status.
    pub async fn check(&self) -> Result<(), DbError> {
        let now = Instant::now();
        let last = *self
            .last_success
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if !should_check(last, now, self.interval) {
            return Ok(());
        }

        let response = self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);

        match response {
            Ok(_) => {
                *self
                    .last_success
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Instant::now());
                Ok(())
            }
            Err(source) => Err(DbError::Offline {
                url: self.url.clone(),
                source,
            }),
        }
    }
}

/// Whether enough time has passed since the last successful probe to
/// warrant another request.
fn should_check(last_success: Option<Instant>, now: Instant, interval: Duration) -> bool {
    last_success.is_none_or(|last| now.duration_since(last) >= interval)
}
