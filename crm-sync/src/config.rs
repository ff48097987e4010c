//! Sync layer configuration
//!
//! Loaded from an optional file (YAML, TOML or JSON, picked by extension) and
//! `CRM_SYNC__*` environment variables, e.g. `CRM_SYNC__REQUEST_TIMEOUT=5000`
//! or `CRM_SYNC__REST__BASE_URL=https://db.example.com/rest/v1`.
//! Durations are written in milliseconds.

use crate::error::SyncResult;
use crate::remote::RestConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "CRM_SYNC";

// Serialize Duration as milliseconds
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(super::millis(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Exponential backoff for records that keep failing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay after the first failure
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    /// Upper bound for any delay
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempts` (1-based): `base * 2^(attempts-1)`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Wall-clock deadline for the next automatic retry.
    pub fn retry_at(&self, now: DateTime<Utc>, attempts: u32) -> DateTime<Utc> {
        chrono::Duration::from_std(self.delay_for(attempts))
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(now)
    }
}

/// Where snapshots are written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotBackend {
    Json,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Upper bound for a single remote call
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,

    pub retry: RetryPolicy,

    /// Period of the background sweep; zero disables it
    #[serde(with = "duration_millis")]
    pub sweep_interval: Duration,

    /// Connectivity assumed until the first network notification
    pub start_online: bool,

    pub snapshot_backend: SnapshotBackend,

    pub snapshot_path: PathBuf,

    pub rest: RestConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(15),
            retry: RetryPolicy::default(),
            sweep_interval: Duration::from_secs(30),
            start_online: true,
            snapshot_backend: SnapshotBackend::Json,
            snapshot_path: PathBuf::from("crm_sync_snapshot.json"),
            rest: RestConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Load from `path` (if given) layered under the process environment.
    pub fn load(path: Option<&Path>) -> SyncResult<Self> {
        Self::from_sources(path, environment())
    }

    pub(crate) fn from_sources(
        path: Option<&Path>,
        env: ::config::Environment,
    ) -> SyncResult<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        let loaded: SyncConfig = builder.add_source(env).build()?.try_deserialize()?;

        tracing::debug!(
            request_timeout_ms = millis(loaded.request_timeout),
            sweep_interval_ms = millis(loaded.sweep_interval),
            start_online = loaded.start_online,
            snapshot = %loaded.snapshot_path.display(),
            "Loaded sync configuration"
        );
        Ok(loaded)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (!self.sweep_interval.is_zero()).then_some(self.sweep_interval)
    }
}

/// Whole milliseconds for log fields, saturating at `u64::MAX`.
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn environment() -> ::config::Environment {
    ::config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}
