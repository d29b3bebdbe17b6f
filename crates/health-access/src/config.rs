//! Service configuration
//!
//! All tunables live in [`AccessConfig`]. Every field has a default, so a
//! JSON file only needs to name what it changes:
//!
//! ```json
//! { "grant_window_secs": 1800, "signing_key": "9f2c..." }
//! ```
//!
//! The signing key may also come from the `HEALTH_ACCESS_SIGNING_KEY`
//! environment variable, which takes precedence over the file.

use std::path::Path;
use std::time::Duration as StdDuration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::error::StorageError;

/// Environment variable holding the hex-encoded token signing key
pub const SIGNING_KEY_ENV: &str = "HEALTH_ACCESS_SIGNING_KEY";

/// Minimum signing key length in bytes (HMAC-SHA256 block strength)
pub const MIN_SIGNING_KEY_BYTES: usize = 32;

/// Upper bound on every configured lifetime and interval: one year
pub const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.into(),
    }
}

fn check_duration(field: &'static str, secs: u64) -> Result<(), ConfigError> {
    if secs == 0 {
        return Err(invalid(field, "must be greater than 0"));
    }
    if secs > MAX_DURATION_SECS {
        return Err(invalid(field, format!("must be at most {} seconds", MAX_DURATION_SECS)));
    }
    Ok(())
}

/// Seconds as a chrono duration, clamped to `MAX_DURATION_SECS` so an
/// unvalidated config can never wrap or overflow
fn bounded_seconds(secs: u64) -> chrono::Duration {
    const MAX_SECONDS: i64 = MAX_DURATION_SECS as i64;
    let secs = i64::try_from(secs).map_or(MAX_SECONDS, |secs| secs.min(MAX_SECONDS));
    chrono::Duration::seconds(secs)
}

/// Bounded retry around transient storage conditions.
///
/// Only [`StorageError::Busy`] is retried. Each retry waits twice as long as
/// the previous one, capped at `max_backoff_ms`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 200,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Backoff to wait before the given retry (1-based)
    pub fn backoff(&self, retry: u32) -> StdDuration {
        let factor = 1u64.checked_shl(retry.saturating_sub(1)).unwrap_or(u64::MAX);
        let millis = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        StdDuration::from_millis(millis)
    }

    /// Run a storage operation, retrying while it reports a transient condition
    pub fn run<T, F>(&self, mut op: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Result<T, StorageError>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Err(err) if err.is_transient() && attempt < attempts => {
                    let wait = self.backoff(attempt);
                    debug!(attempt, ?wait, error = %err, "transient storage error, retrying");
                    std::thread::sleep(wait);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

/// Tunables for the access core
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Number of digits in a one-time code
    pub code_length: usize,
    /// Lifetime of a one-time-code challenge
    pub challenge_ttl_secs: u64,
    /// Failed attempts before a challenge locks
    pub max_code_attempts: u32,
    /// Lifetime of an ordinary session
    pub session_ttl_secs: u64,
    /// Lifetime of an emergency grant
    pub grant_window_secs: u64,
    /// Minimum similarity for a biometric match, in [0, 1]
    pub biometric_threshold: f64,
    /// Period of the expiry sweeper
    pub sweep_interval_secs: u64,
    /// Retry policy for the storage client
    pub retry: RetryPolicy,
    /// Hex-encoded HMAC key for session tokens. When absent an ephemeral
    /// key is generated at start-up and tokens do not survive a restart.
    pub signing_key: Option<String>,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            code_length: 6,
            challenge_ttl_secs: 10 * 60,
            max_code_attempts: 5,
            session_ttl_secs: 24 * 60 * 60,
            grant_window_secs: 30 * 60,
            biometric_threshold: 0.85,
            sweep_interval_secs: 60,
            retry: RetryPolicy::default(),
            signing_key: None,
        }
    }
}

impl AccessConfig {
    /// Parse a JSON document; missing fields keep their defaults
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: AccessConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an optional JSON file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                debug!(path = %path.display(), "loading access configuration");
                serde_json::from_str(&std::fs::read_to_string(path)?)?
            }
            None => AccessConfig::default(),
        };
        if let Ok(key) = std::env::var(SIGNING_KEY_ENV) {
            config.signing_key = Some(key);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(4..=10).contains(&self.code_length) {
            return Err(invalid("code_length", "must be between 4 and 10 digits"));
        }
        check_duration("challenge_ttl_secs", self.challenge_ttl_secs)?;
        if self.max_code_attempts == 0 {
            return Err(invalid("max_code_attempts", "must be greater than 0"));
        }
        check_duration("session_ttl_secs", self.session_ttl_secs)?;
        check_duration("grant_window_secs", self.grant_window_secs)?;
        if !(0.0..=1.0).contains(&self.biometric_threshold) || self.biometric_threshold == 0.0 {
            return Err(invalid("biometric_threshold", "must be in (0, 1]"));
        }
        check_duration("sweep_interval_secs", self.sweep_interval_secs)?;
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.signing_key.is_some() {
            self.signing_key_bytes()?;
        }
        Ok(())
    }

    /// Decode the configured signing key, if any
    pub fn signing_key_bytes(&self) -> Result<Option<Vec<u8>>, ConfigError> {
        let Some(encoded) = &self.signing_key else {
            return Ok(None);
        };
        let bytes = hex::decode(encoded.trim())
            .map_err(|e| invalid("signing_key", format!("not valid hex: {}", e)))?;
        if bytes.len() < MIN_SIGNING_KEY_BYTES {
            return Err(invalid(
                "signing_key",
                format!("must be at least {} bytes", MIN_SIGNING_KEY_BYTES),
            ));
        }
        Ok(Some(bytes))
    }

    pub fn challenge_ttl(&self) -> chrono::Duration {
        bounded_seconds(self.challenge_ttl_secs)
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        bounded_seconds(self.session_ttl_secs)
    }

    pub fn grant_window(&self) -> chrono::Duration {
        bounded_seconds(self.grant_window_secs)
    }

    pub fn sweep_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.sweep_interval_secs.min(MAX_DURATION_SECS))
    }
}
