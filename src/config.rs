//! Driver configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, optional)
//! 2. Environment variables (prefixed with `SPINNAKER_DAQ_`, `__` between sections)
//!
//! Every field has a default, so an empty or missing file yields a working
//! configuration.
//!
//! # Example
//! ```no_run
//! use daq_driver_spinnaker::config::DriverConfig;
//!
//! let config = DriverConfig::load_from("config/spinnaker.toml")?;
//! println!("Default frame timeout: {:?}", config.acquisition.default_wait());
//! # Ok::<(), daq_driver_spinnaker::SpinError>(())
//! ```

use crate::acquisition::Wait;
use crate::error::{SpinError, SpinResult};
use crate::logging::LogFormat;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment prefix for overrides, e.g. `SPINNAKER_DAQ_RESET__TIMEOUT_MS=5000`.
pub const ENV_PREFIX: &str = "SPINNAKER_DAQ_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Logging settings.
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Frame wait defaults.
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Lock polling behavior.
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Device reset polling.
    #[serde(default)]
    pub reset: ResetConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Subscriber output (pretty, compact, json)
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Frame acquisition defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Default frame wait in milliseconds (0 polls once)
    #[serde(default = "default_frame_timeout")]
    pub default_timeout_ms: u64,
    /// Ignore `default_timeout_ms` and block until a frame arrives
    #[serde(default)]
    pub block_forever: bool,
    /// Normalize pixels copied by `Camera::next_image` into [0, 1]
    #[serde(default)]
    pub normalize: bool,
}

/// Registry lock polling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Failed try-locks that only yield before the poller starts sleeping
    #[serde(default = "default_spin_limit")]
    pub lock_spin_limit: u32,
    /// Sleep between try-locks once the spin limit is used up (microseconds)
    #[serde(default = "default_poll_interval_us")]
    pub lock_poll_interval_us: u64,
}

/// Device reset re-enumeration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetConfig {
    /// Interval between re-enumeration attempts (milliseconds)
    #[serde(default = "default_reset_poll_ms")]
    pub poll_interval_ms: u64,
    /// How long to wait for the device to come back (milliseconds)
    #[serde(default = "default_reset_timeout_ms")]
    pub timeout_ms: u64,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_frame_timeout() -> u64 {
    1000
}

fn default_spin_limit() -> u32 {
    64
}

fn default_poll_interval_us() -> u64 {
    50
}

fn default_reset_poll_ms() -> u64 {
    500
}

fn default_reset_timeout_ms() -> u64 {
    30_000
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_frame_timeout(),
            block_forever: false,
            normalize: false,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            lock_spin_limit: default_spin_limit(),
            lock_poll_interval_us: default_poll_interval_us(),
        }
    }
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_reset_poll_ms(),
            timeout_ms: default_reset_timeout_ms(),
        }
    }
}

impl AcquisitionConfig {
    /// Wait used by `Camera::next_frame` and `Camera::next_image`.
    pub fn default_wait(&self) -> Wait {
        if self.block_forever {
            Wait::Forever
        } else {
            Wait::For(Duration::from_millis(self.default_timeout_ms))
        }
    }
}

impl RegistryConfig {
    /// Sleep between failed try-locks.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.lock_poll_interval_us)
    }
}

impl ResetConfig {
    /// Interval between re-enumeration attempts.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Default bound on a waiting reset.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl DriverConfig {
    /// Defaults overridden by environment variables only.
    pub fn load() -> SpinResult<Self> {
        let config: Self = Self::figment().extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path, then apply environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> SpinResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> SpinResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(SpinError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.reset.poll_interval_ms == 0 {
            return Err(SpinError::Configuration(
                "reset.poll_interval_ms must be > 0".to_string(),
            ));
        }

        if self.reset.poll_interval_ms > self.reset.timeout_ms {
            return Err(SpinError::Configuration(format!(
                "reset.poll_interval_ms ({}) exceeds reset.timeout_ms ({})",
                self.reset.poll_interval_ms, self.reset.timeout_ms
            )));
        }

        Ok(())
    }

    /// Render as TOML, e.g. to write a template config file.
    pub fn to_toml(&self) -> SpinResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| SpinError::Configuration(format!("Failed to serialize config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = DriverConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(
            config.acquisition.default_wait(),
            Wait::For(Duration::from_millis(1000))
        );
        assert_eq!(config.reset.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn load_partial_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"
log_format = "json"

[reset]
poll_interval_ms = 100
timeout_ms = 2000
"#
        )
        .unwrap();

        let config = DriverConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.application.log_format, LogFormat::Json);
        assert!(!config.acquisition.normalize);
        assert_eq!(config.reset.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.registry.lock_spin_limit, 64);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = DriverConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config, DriverConfig::default());
    }

    #[test]
    fn invalid_log_level() {
        let mut config = DriverConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(matches!(
            config.validate(),
            Err(SpinError::Configuration(_))
        ));
    }

    #[test]
    fn reset_poll_longer_than_timeout() {
        let mut config = DriverConfig::default();
        config.reset.poll_interval_ms = 10_000;
        config.reset.timeout_ms = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_round_trip_of_template() {
        let text = DriverConfig::default().to_toml().unwrap();
        assert!(text.contains("[registry]"));
        let parsed: DriverConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, DriverConfig::default());
    }
}
