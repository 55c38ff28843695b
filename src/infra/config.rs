//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! Every section is optional; missing keys fall back to the defaults below.

use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Silence after which a beacon is considered gone
    #[serde(default = "default_silence_timeout_ms")]
    pub silence_timeout_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Number of ranged samples in the moving average
    #[serde(default = "default_smoothing_window")]
    pub smoothing_window: usize,
    /// Smoothed RSSI at or above this is Immediate (dBm)
    #[serde(default = "default_immediate_rssi")]
    pub immediate_rssi: i16,
    /// Smoothed RSSI at or above this is Near (dBm)
    #[serde(default = "default_near_rssi")]
    pub near_rssi: i16,
    /// Margin a smoothed value must clear past a threshold to change tier (dB)
    #[serde(default = "default_hysteresis_db")]
    pub hysteresis_db: u8,
}

fn default_silence_timeout_ms() -> u64 {
    30_000
}

fn default_sweep_interval_ms() -> u64 {
    2_000
}

fn default_smoothing_window() -> usize {
    5
}

fn default_immediate_rssi() -> i16 {
    -55
}

fn default_near_rssi() -> i16 {
    -75
}

fn default_hysteresis_db() -> u8 {
    3
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            silence_timeout_ms: default_silence_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            smoothing_window: default_smoothing_window(),
            immediate_rssi: default_immediate_rssi(),
            near_rssi: default_near_rssi(),
            hysteresis_db: default_hysteresis_db(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
    /// Max sightings handled before re-checking control commands
    #[serde(default = "default_drain_batch")]
    pub drain_batch: usize,
}

fn default_inbox_capacity() -> usize {
    512
}

fn default_drain_batch() -> usize {
    64
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { inbox_capacity: default_inbox_capacity(), drain_batch: default_drain_batch() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    /// Idle re-scan interval of the delivery scheduler
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_dead_letter_retention")]
    pub dead_letter_retention: usize,
}

fn default_base_backoff_ms() -> u64 {
    2_000
}

fn default_max_backoff_ms() -> u64 {
    300_000
}

fn default_max_attempts() -> u32 {
    8
}

fn default_attempt_timeout_ms() -> u64 {
    10_000
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_dead_letter_retention() -> usize {
    100
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_attempts: default_max_attempts(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            dead_letter_retention: default_dead_letter_retention(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifierConfig {
    #[serde(default = "default_notifier_capacity")]
    pub capacity: usize,
}

fn default_notifier_capacity() -> usize {
    256
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self { capacity: default_notifier_capacity() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_url")]
    pub url: String,
    #[serde(default = "default_backend_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_backend_url() -> String {
    "http://localhost:8088".to_string()
}

fn default_backend_timeout_ms() -> u64 {
    10_000
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self { url: default_backend_url(), timeout_ms: default_backend_timeout_ms() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_dir")]
    pub dir: String,
}

fn default_storage_dir() -> String {
    "engage-data".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { dir: default_storage_dir() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Summary log interval (0 to disable)
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

fn default_metrics_interval() -> u64 {
    30
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval() }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the engine
#[derive(Debug, Clone)]
pub struct Config {
    registry: RegistryConfig,
    dispatcher: DispatcherConfig,
    delivery: DeliveryConfig,
    notifier: NotifierConfig,
    backend: BackendConfig,
    storage: StorageConfig,
    metrics: MetricsConfig,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            registry: toml_config.registry,
            dispatcher: toml_config.dispatcher,
            delivery: toml_config.delivery,
            notifier: toml_config.notifier,
            backend: toml_config.backend,
            storage: toml_config.storage,
            metrics: toml_config.metrics,
            config_file,
        }
    }

    /// Determine config file path: `--config`/`-c` argument, then the
    /// `CONFIG_FILE` environment variable, then `config/dev.toml`
    pub fn resolve_config_path(args: &[String]) -> String {
        Self::resolve_config_path_with(args, env::var("CONFIG_FILE").ok())
    }

    fn resolve_config_path_with(args: &[String], env_path: Option<String>) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" || arg == "-c" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        env_path.unwrap_or_else(|| "config/dev.toml".to_string())
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let config = Self::from_toml(toml_config, path.display().to_string());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a path, falling back to defaults on any error
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), path = %path, "config_fallback_to_defaults");
                Self::default()
            }
        }
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load(args: &[String]) -> Self {
        Self::load_from_path(&Self::resolve_config_path(args))
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.registry.smoothing_window > 0, "registry.smoothing_window must be > 0");
        anyhow::ensure!(
            self.registry.immediate_rssi > self.registry.near_rssi,
            "registry.immediate_rssi must be greater than registry.near_rssi"
        );
        anyhow::ensure!(self.dispatcher.inbox_capacity > 0, "dispatcher.inbox_capacity must be > 0");
        anyhow::ensure!(self.delivery.max_attempts > 0, "delivery.max_attempts must be > 0");
        anyhow::ensure!(
            self.delivery.base_backoff_ms <= self.delivery.max_backoff_ms,
            "delivery.base_backoff_ms must not exceed delivery.max_backoff_ms"
        );
        Ok(())
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    // Registry
    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.registry.silence_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.registry.sweep_interval_ms.max(1))
    }

    pub fn smoothing_window(&self) -> usize {
        self.registry.smoothing_window.max(1)
    }

    pub fn immediate_rssi(&self) -> i16 {
        self.registry.immediate_rssi
    }

    pub fn near_rssi(&self) -> i16 {
        self.registry.near_rssi
    }

    pub fn hysteresis_db(&self) -> u8 {
        self.registry.hysteresis_db
    }

    // Dispatcher
    pub fn inbox_capacity(&self) -> usize {
        self.dispatcher.inbox_capacity.max(1)
    }

    pub fn drain_batch(&self) -> usize {
        self.dispatcher.drain_batch.max(1)
    }

    // Delivery
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.delivery.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.delivery.max_backoff_ms)
    }

    pub fn max_attempts(&self) -> u32 {
        self.delivery.max_attempts.max(1)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery.attempt_timeout_ms)
    }

    pub fn delivery_poll_interval(&self) -> Duration {
        Duration::from_millis(self.delivery.poll_interval_ms.max(1))
    }

    pub fn dead_letter_retention(&self) -> usize {
        self.delivery.dead_letter_retention
    }

    // Notifier
    pub fn notifier_capacity(&self) -> usize {
        self.notifier.capacity.max(1)
    }

    // Backend
    pub fn backend_url(&self) -> &str {
        &self.backend.url
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend.timeout_ms)
    }

    // Storage
    pub fn storage_dir(&self) -> &str {
        &self.storage.dir
    }

    // Metrics
    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics.interval_secs
    }

    /// Builder: silence timeout
    pub fn with_silence_timeout_ms(mut self, ms: u64) -> Self {
        self.registry.silence_timeout_ms = ms;
        self
    }

    /// Builder: sweep interval
    pub fn with_sweep_interval_ms(mut self, ms: u64) -> Self {
        self.registry.sweep_interval_ms = ms;
        self
    }

    /// Builder: smoothing window
    pub fn with_smoothing_window(mut self, window: usize) -> Self {
        self.registry.smoothing_window = window;
        self
    }

    /// Builder: sighting inbox capacity
    pub fn with_inbox_capacity(mut self, capacity: usize) -> Self {
        self.dispatcher.inbox_capacity = capacity;
        self
    }

    /// Builder: backoff schedule
    pub fn with_backoff_ms(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.delivery.base_backoff_ms = base_ms;
        self.delivery.max_backoff_ms = max_ms;
        self
    }

    /// Builder: max delivery attempts
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.delivery.max_attempts = attempts;
        self
    }

    /// Builder: delivery scheduler poll interval
    pub fn with_delivery_poll_interval_ms(mut self, ms: u64) -> Self {
        self.delivery.poll_interval_ms = ms;
        self
    }

    /// Builder: backend base URL
    pub fn with_backend_url(mut self, url: &str) -> Self {
        self.backend.url = url.to_string();
        self
    }

    /// Builder: metrics summary interval (0 disables the reporter)
    pub fn with_metrics_interval_secs(mut self, secs: u64) -> Self {
        self.metrics.interval_secs = secs;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.silence_timeout(), Duration::from_secs(30));
        assert_eq!(config.sweep_interval(), Duration::from_secs(2));
        assert_eq!(config.smoothing_window(), 5);
        assert_eq!(config.immediate_rssi(), -55);
        assert_eq!(config.near_rssi(), -75);
        assert_eq!(config.max_attempts(), 8);
        assert_eq!(config.base_backoff(), Duration::from_secs(2));
        assert_eq!(config.max_backoff(), Duration::from_secs(300));
        assert_eq!(config.config_file(), "default");
    }

    #[test]
    fn test_resolve_config_path_default() {
        let args: Vec<String> = vec!["engage-agent".to_string()];
        // CONFIG_FILE may be set in the environment running the tests
        if env::var("CONFIG_FILE").is_err() {
            assert_eq!(Config::resolve_config_path(&args), "config/dev.toml");
        }
    }

    #[test]
    fn test_resolve_config_path_from_arg() {
        let args: Vec<String> = vec![
            "engage-agent".to_string(),
            "--config".to_string(),
            "config/store.toml".to_string(),
        ];
        assert_eq!(Config::resolve_config_path(&args), "config/store.toml");
    }

    #[test]
    fn test_resolve_config_path_from_arg_equals() {
        let args: Vec<String> =
            vec!["engage-agent".to_string(), "--config=config/mall.toml".to_string()];
        assert_eq!(Config::resolve_config_path(&args), "config/mall.toml");
    }

    #[test]
    fn test_resolve_config_path_env_between_arg_and_default() {
        let bare: Vec<String> = vec!["engage-agent".to_string()];
        let env_path = Some("/etc/engage/site.toml".to_string());
        assert_eq!(Config::resolve_config_path_with(&bare, env_path.clone()), "/etc/engage/site.toml");
        assert_eq!(Config::resolve_config_path_with(&bare, None), "config/dev.toml");

        let with_arg: Vec<String> =
            vec!["engage-agent".to_string(), "-c".to_string(), "config/store.toml".to_string()];
        assert_eq!(Config::resolve_config_path_with(&with_arg, env_path), "config/store.toml");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_config: TomlConfig = toml::from_str("[registry]\nsilence_timeout_ms = 5000\n").unwrap();
        let config = Config::from_toml(toml_config, "inline".to_string());
        assert_eq!(config.silence_timeout(), Duration::from_secs(5));
        assert_eq!(config.smoothing_window(), 5);
        assert_eq!(config.inbox_capacity(), 512);
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let toml_config: TomlConfig =
            toml::from_str("[registry]\nimmediate_rssi = -80\nnear_rssi = -60\n").unwrap();
        let config = Config::from_toml(toml_config, "inline".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builders() {
        let config = Config::default().with_backoff_ms(10, 40).with_max_attempts(3);
        assert_eq!(config.base_backoff(), Duration::from_millis(10));
        assert_eq!(config.max_backoff(), Duration::from_millis(40));
        assert_eq!(config.max_attempts(), 3);
    }
}
