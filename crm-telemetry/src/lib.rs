//! Structured logging for the CRM sync binaries
//!
//! - development: human-readable output with colors when attached to a terminal
//! - production: one JSON object per line
//!
//! `RUST_LOG` overrides the default directives in both modes.

pub mod error;

pub use error::{Result, TelemetryError};

use serde::{Deserialize, Serialize};
use std::io::IsTerminal;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Environment variable selecting the output mode
pub const ENV_VAR: &str = "CRM_SYNC_ENV";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub format: LogFormat,
    pub verbose: bool,
    pub ansi: bool,
}

impl LogConfig {
    /// Pick the format from `CRM_SYNC_ENV` (anything but `production` is
    /// development) and colors from `NO_COLOR` and the terminal.
    pub fn from_env(verbose: bool) -> Self {
        let production = std::env::var(ENV_VAR).is_ok_and(|env| env == "production");
        let ansi = std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
        Self {
            format: if production { LogFormat::Json } else { LogFormat::Pretty },
            verbose,
            ansi,
        }
    }

    fn level(&self) -> Level {
        if self.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        }
    }

    /// Default filter directives when `RUST_LOG` is unset.
    pub fn directives(&self) -> String {
        format!(
            "crm_sync={level},crmsync={level},sqlx=warn,reqwest=info",
            level = self.level()
        )
    }

    fn filter(&self) -> Result<EnvFilter> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(self.directives())
                .map_err(|e| TelemetryError::Filter(e.to_string())),
        }
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(config: &LogConfig) -> Result<()> {
    let filter = config.filter()?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match config.format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(config.ansi)
                    .with_level(true),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(false)
                    .json(),
            )
            .try_init(),
    };
    installed.map_err(|e| TelemetryError::Init(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directives_follow_verbosity() {
        let quiet = LogConfig {
            format: LogFormat::Json,
            verbose: false,
            ansi: false,
        };
        let verbose = LogConfig {
            verbose: true,
            ..quiet.clone()
        };

        assert!(quiet.directives().starts_with("crm_sync=INFO"));
        assert!(verbose.directives().starts_with("crm_sync=DEBUG"));
        assert!(EnvFilter::try_new(verbose.directives()).is_ok());
    }

    #[test]
    fn test_second_init_fails() {
        let config = LogConfig {
            format: LogFormat::Json,
            verbose: false,
            ansi: false,
        };
        // The first call may race with other tests; only the second must fail.
        let _ = init_tracing(&config);
        assert!(matches!(init_tracing(&config), Err(TelemetryError::Init(_))));
    }
}
