// src/utils/config.rs
//! Engine configuration
//!
//! Layered with the `config` crate, lowest priority first:
//!
//! 1. Built-in defaults
//! 2. `flowgate.toml` in the working directory (or an explicit path)
//! 3. `FLOWGATE__SECTION__KEY` environment variables

use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "flowgate.toml";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "FLOWGATE";

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub poller: PollerConfig,
    pub capture: CaptureConfig,
    pub logging: LoggingConfig,
}

/// Durable flow store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite file shared by the capture and control processes
    pub path: PathBuf,

    /// How long a writer waits on a locked database (milliseconds)
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("flowgate.db"),
            busy_timeout_ms: 2_000,
        }
    }
}

/// Command poller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Fixed tick interval (milliseconds)
    pub interval_ms: u64,

    /// First retry delay after a store failure (milliseconds)
    pub backoff_initial_ms: u64,

    /// Upper bound on the retry delay (milliseconds)
    pub backoff_max_ms: u64,

    /// How long store failures may persist before blocked exchanges are
    /// released fail-open (milliseconds)
    pub failure_ceiling_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            backoff_initial_ms: 200,
            backoff_max_ms: 5_000,
            failure_ceiling_ms: 30_000,
        }
    }
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn failure_ceiling(&self) -> Duration {
        Duration::from_millis(self.failure_ceiling_ms)
    }
}

/// Capture host settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Release a blocked exchange unmodified after this many seconds.
    /// `None` waits for a decision indefinitely.
    pub max_hold_secs: Option<u64>,

    /// Status code of the synthesized response for dropped exchanges
    pub drop_status: u16,

    /// How long a forwarded exchange may go without a completion report
    /// before the host forgets which session it belongs to
    pub inflight_ttl_secs: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_hold_secs: None,
            drop_status: 502,
            inflight_ttl_secs: 600,
        }
    }
}

impl CaptureConfig {
    pub fn max_hold(&self) -> Option<Duration> {
        self.max_hold_secs.map(Duration::from_secs)
    }

    pub fn inflight_ttl(&self) -> Duration {
        Duration::from_secs(self.inflight_ttl_secs)
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `flowgate.toml` (if present) and the environment
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(DEFAULT_CONFIG_FILE))
    }

    /// Load configuration using an explicit file path
    pub fn load_from(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: EngineConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.poller.interval_ms == 0 {
            return Err(EngineError::ConfigError(
                "poller.interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.poller.backoff_initial_ms == 0
            || self.poller.backoff_initial_ms > self.poller.backoff_max_ms
        {
            return Err(EngineError::ConfigError(format!(
                "poller backoff must satisfy 0 < initial ({}) <= max ({})",
                self.poller.backoff_initial_ms, self.poller.backoff_max_ms
            )));
        }

        if self.poller.failure_ceiling_ms < self.poller.interval_ms {
            return Err(EngineError::ConfigError(
                "poller.failure_ceiling_ms must be at least one poll interval".to_string(),
            ));
        }

        if !(400..=599).contains(&self.capture.drop_status) {
            return Err(EngineError::ConfigError(format!(
                "capture.drop_status must be an error status, got {}",
                self.capture.drop_status
            )));
        }

        if self.capture.max_hold_secs == Some(0) {
            return Err(EngineError::ConfigError(
                "capture.max_hold_secs must be positive when set".to_string(),
            ));
        }

        if self.capture.inflight_ttl_secs == 0 {
            return Err(EngineError::ConfigError(
                "capture.inflight_ttl_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.poller.interval(), Duration::from_millis(100));
        assert!(config.capture.max_hold().is_none());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.store.busy_timeout_ms, 2_000);
        assert_eq!(config.capture.drop_status, 502);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowgate.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[poller]\ninterval_ms = 250\n\n[capture]\nmax_hold_secs = 60\n\n[store]\npath = \"/tmp/project.db\""
        )
        .unwrap();

        let config = EngineConfig::load_from(&path).unwrap();
        assert_eq!(config.poller.interval_ms, 250);
        assert_eq!(config.capture.max_hold(), Some(Duration::from_secs(60)));
        assert_eq!(config.store.path, PathBuf::from("/tmp/project.db"));
        // Untouched sections keep their defaults
        assert_eq!(config.poller.backoff_max_ms, 5_000);
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = EngineConfig::default();
        config.poller.interval_ms = 0;
        assert!(matches!(config.validate(), Err(EngineError::ConfigError(_))));
    }

    #[test]
    fn test_validate_rejects_zero_inflight_ttl() {
        let mut config = EngineConfig::default();
        config.capture.inflight_ttl_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_success_drop_status() {
        let mut config = EngineConfig::default();
        config.capture.drop_status = 200;
        assert!(config.validate().is_err());
    }
}
