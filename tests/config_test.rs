//! Configuration loading with environment overrides.

use daq_driver_spinnaker::{DriverConfig, SpinError, Wait};
use serial_test::serial;
use std::io::Write;
use std::time::Duration;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("Failed to create temp file");
    file.write_all(contents.as_bytes())
        .expect("Failed to write config");
    file
}

#[test]
#[serial]
fn test_env_overrides_file() -> anyhow::Result<()> {
    let file = write_config(
        r#"
[acquisition]
default_timeout_ms = 250

[reset]
timeout_ms = 5000
"#,
    );

    std::env::set_var("SPINNAKER_DAQ_RESET__TIMEOUT_MS", "9000");
    let loaded = DriverConfig::load_from(file.path());
    std::env::remove_var("SPINNAKER_DAQ_RESET__TIMEOUT_MS");
    let config = loaded?;

    assert_eq!(config.acquisition.default_wait(), Wait::from_millis(250));
    assert_eq!(config.reset.timeout(), Duration::from_secs(9));
    Ok(())
}

#[test]
#[serial]
fn test_env_only_load() -> anyhow::Result<()> {
    std::env::set_var("SPINNAKER_DAQ_ACQUISITION__BLOCK_FOREVER", "true");
    let loaded = DriverConfig::load();
    std::env::remove_var("SPINNAKER_DAQ_ACQUISITION__BLOCK_FOREVER");

    assert_eq!(loaded?.acquisition.default_wait(), Wait::Forever);
    Ok(())
}

#[test]
#[serial]
fn test_invalid_env_value_rejected() {
    std::env::set_var("SPINNAKER_DAQ_APPLICATION__LOG_LEVEL", "chatty");
    let loaded = DriverConfig::load();
    std::env::remove_var("SPINNAKER_DAQ_APPLICATION__LOG_LEVEL");

    assert!(matches!(loaded, Err(SpinError::Configuration(_))));
}

#[test]
#[serial]
fn test_malformed_file_is_config_error() {
    let file = write_config("[reset\npoll_interval_ms = ");
    assert!(matches!(
        DriverConfig::load_from(file.path()),
        Err(SpinError::Config(_))
    ));
}

#[test]
#[serial]
fn test_shipped_template_matches_defaults() -> anyhow::Result<()> {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/spinnaker.toml");
    assert_eq!(DriverConfig::load_from(path)?, DriverConfig::default());
    Ok(())
}
