//! Tracing initialization.
//!
//! The driver emits `tracing` events at every lifecycle transition (system
//! get/release/deferral, camera open, alias release, teardown). This module
//! installs a `tracing-subscriber` for applications that do not bring their own.
//!
//! # Example
//! ```no_run
//! use daq_driver_spinnaker::{config::DriverConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DriverConfig::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!("Spinnaker driver ready");
//! # Ok(())
//! # }
//! ```

use crate::config::DriverConfig;
use crate::error::{SpinError, SpinResult};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

/// Output format, set by `application.log_format`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, colored (for development)
    Pretty,
    /// One line per event, no colors
    #[default]
    Compact,
    /// JSON lines for log aggregation
    Json,
}

/// Install a global subscriber at `application.log_level`.
///
/// `RUST_LOG` wins over the configured level when set. Idempotent: if a global
/// subscriber is already installed this returns `Ok(())`, so tests and
/// embedding applications can call it freely.
pub fn init_from_config(config: &DriverConfig) -> SpinResult<()> {
    let level = config.application.log_level.to_lowercase();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&level))
        .map_err(|e| SpinError::Configuration(format!("Invalid log level '{level}': {e}")))?;

    // Release paths run on whichever thread drops the last handle
    let base = fmt::layer().with_thread_ids(true).with_thread_names(true);
    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.application.log_format {
        LogFormat::Pretty => base.pretty().boxed(),
        LogFormat::Compact => base.compact().with_ansi(false).boxed(),
        LogFormat::Json => base.json().boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .or_else(|e| {
            if e
                .to_string()
                .contains("a global default trace dispatcher has already been set")
            {
                Ok(())
            } else {
                Err(SpinError::Configuration(format!(
                    "Failed to initialize tracing: {e}"
                )))
            }
        })
}
