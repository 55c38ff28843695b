//! Integration tests for configuration loading

use beacon_engage::infra::Config;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

#[test]
fn test_load_config_from_file() {
    let mut temp_file = NamedTempFile::new().unwrap();

    let config_content = r#"
[registry]
silence_timeout_ms = 15000
sweep_interval_ms = 1000
smoothing_window = 7
immediate_rssi = -50
near_rssi = -70
hysteresis_db = 4

[dispatcher]
inbox_capacity = 128

[delivery]
base_backoff_ms = 500
max_backoff_ms = 60000
max_attempts = 5

[backend]
url = "https://engage.example.com/api"
timeout_ms = 3000

[storage]
dir = "/var/lib/engage"

[metrics]
interval_secs = 15
"#;

    temp_file.write_all(config_content.as_bytes()).unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.silence_timeout(), Duration::from_secs(15));
    assert_eq!(config.sweep_interval(), Duration::from_secs(1));
    assert_eq!(config.smoothing_window(), 7);
    assert_eq!(config.immediate_rssi(), -50);
    assert_eq!(config.near_rssi(), -70);
    assert_eq!(config.hysteresis_db(), 4);
    assert_eq!(config.inbox_capacity(), 128);
    // Unset keys in a present section keep their defaults
    assert_eq!(config.drain_batch(), 64);
    assert_eq!(config.base_backoff(), Duration::from_millis(500));
    assert_eq!(config.max_attempts(), 5);
    assert_eq!(config.backend_url(), "https://engage.example.com/api");
    assert_eq!(config.backend_timeout(), Duration::from_secs(3));
    assert_eq!(config.storage_dir(), "/var/lib/engage");
    assert_eq!(config.metrics_interval_secs(), 15);
    assert_eq!(config.notifier_capacity(), 256);
}

#[test]
fn test_invalid_thresholds_rejected() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file
        .write_all(b"[registry]\nimmediate_rssi = -80\nnear_rssi = -60\n")
        .unwrap();
    temp_file.flush().unwrap();

    let err = Config::from_file(temp_file.path()).unwrap_err();
    assert!(format!("{err:#}").contains("immediate_rssi"));
}

#[test]
fn test_load_from_path_fallback() {
    let config = Config::load_from_path("/nonexistent/config.toml");
    assert_eq!(config.config_file(), "default");
    assert_eq!(config.silence_timeout(), Duration::from_secs(30));
    assert_eq!(config.backend_url(), "http://localhost:8088");
}

#[test]
fn test_shipped_dev_config_parses() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/dev.toml");
    let config = Config::from_file(path).unwrap();
    assert_eq!(config.max_attempts(), 8);
    assert_eq!(config.storage_dir(), "engage-data");
}
