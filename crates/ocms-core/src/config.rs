use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Prefix for environment overrides, e.g. `OCMS__WEBHOOKS__WORKERS=8`.
pub const ENV_PREFIX: &str = "OCMS";

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub webhooks: WebhookSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    /// Subscribers registered at startup
    #[serde(default)]
    pub subscribers: Vec<SubscriberSeed>,
}

impl AppConfig {
    /// Load configuration from an optional file with environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Parse configuration from an inline TOML document
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }
}

/// Webhook dispatch engine settings
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookSettings {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_seconds")]
    pub initial_backoff_seconds: u64,
    #[serde(default = "default_max_backoff_seconds")]
    pub max_backoff_seconds: u64,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_max_response_body_bytes")]
    pub max_response_body_bytes: usize,
    #[serde(default = "default_retry_scan_interval_seconds")]
    pub retry_scan_interval_seconds: u64,
    #[serde(default = "default_retry_batch_size")]
    pub retry_batch_size: usize,
    #[serde(default = "default_requeue_grace_seconds")]
    pub requeue_grace_seconds: u64,
    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default)]
    pub debounce: DebounceSettings,
}

impl WebhookSettings {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_secs(self.initial_backoff_seconds)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn retry_scan_interval(&self) -> Duration {
        Duration::from_secs(self.retry_scan_interval_seconds)
    }

    pub fn requeue_grace(&self) -> Duration {
        Duration::from_secs(self.requeue_grace_seconds)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.retention_days) * 24 * 60 * 60)
    }
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            max_attempts: default_max_attempts(),
            initial_backoff_seconds: default_initial_backoff_seconds(),
            max_backoff_seconds: default_max_backoff_seconds(),
            request_timeout_seconds: default_request_timeout_seconds(),
            max_response_body_bytes: default_max_response_body_bytes(),
            retry_scan_interval_seconds: default_retry_scan_interval_seconds(),
            retry_batch_size: default_retry_batch_size(),
            requeue_grace_seconds: default_requeue_grace_seconds(),
            cleanup_interval_seconds: default_cleanup_interval_seconds(),
            retention_days: default_retention_days(),
            debounce: DebounceSettings::default(),
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_seconds() -> u64 {
    60
}

fn default_max_backoff_seconds() -> u64 {
    24 * 60 * 60
}

fn default_request_timeout_seconds() -> u64 {
    30
}

fn default_max_response_body_bytes() -> usize {
    10 * 1024
}

fn default_retry_scan_interval_seconds() -> u64 {
    30
}

fn default_retry_batch_size() -> usize {
    50
}

// Must stay above the request timeout or in-flight deliveries get re-queued.
fn default_requeue_grace_seconds() -> u64 {
    60
}

fn default_cleanup_interval_seconds() -> u64 {
    24 * 60 * 60
}

fn default_retention_days() -> u32 {
    30
}

/// Event coalescing settings
#[derive(Debug, Clone, Deserialize)]
pub struct DebounceSettings {
    #[serde(default = "default_debounce_enabled")]
    pub enabled: bool,
    #[serde(default = "default_debounce_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_debounce_max_wait_ms")]
    pub max_wait_ms: u64,
}

impl DebounceSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

impl Default for DebounceSettings {
    fn default() -> Self {
        Self {
            enabled: default_debounce_enabled(),
            interval_ms: default_debounce_interval_ms(),
            max_wait_ms: default_debounce_max_wait_ms(),
        }
    }
}

fn default_debounce_enabled() -> bool {
    true
}

fn default_debounce_interval_ms() -> u64 {
    1000
}

fn default_debounce_max_wait_ms() -> u64 {
    5000
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// A subscriber registered from configuration
#[derive(Clone, Deserialize)]
pub struct SubscriberSeed {
    pub name: String,
    pub url: String,
    pub secret: String,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl std::fmt::Debug for SubscriberSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberSeed")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("secret", &"<redacted>")
            .field("events", &self.events)
            .field("active", &self.active)
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn default_active() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhook_settings_defaults() {
        let settings = WebhookSettings::default();

        assert_eq!(settings.workers, 4);
        assert_eq!(settings.max_attempts, 5);
        assert_eq!(settings.initial_backoff(), Duration::from_secs(60));
        assert_eq!(settings.max_backoff(), Duration::from_secs(86_400));
        assert_eq!(settings.request_timeout(), Duration::from_secs(30));
        assert_eq!(settings.max_response_body_bytes, 10_240);
        assert_eq!(settings.retry_scan_interval(), Duration::from_secs(30));
        assert_eq!(settings.retry_batch_size, 50);
        assert_eq!(settings.retention(), Duration::from_secs(30 * 86_400));
        assert!(settings.requeue_grace() > settings.request_timeout());
    }

    #[test]
    fn test_webhook_settings_builders() {
        let settings = WebhookSettings::default()
            .with_workers(8)
            .with_queue_capacity(16)
            .with_max_attempts(3);

        assert_eq!(settings.workers, 8);
        assert_eq!(settings.queue_capacity, 16);
        assert_eq!(settings.max_attempts, 3);
    }

    #[test]
    fn test_load_from_toml() {
        let config = AppConfig::from_toml_str(
            r#"
            [webhooks]
            workers = 2
            retention_days = 7

            [webhooks.debounce]
            enabled = false
            interval_ms = 250

            [logging]
            level = "debug"
            json = true

            [[subscribers]]
            name = "Search indexer"
            url = "https://hooks.example.com/ocms"
            secret = "whsec_test"
            events = ["page.published", "page.deleted"]

            [subscribers.headers]
            X-Tenant = "main"
            "#,
        )
        .unwrap();

        assert_eq!(config.webhooks.workers, 2);
        assert_eq!(config.webhooks.queue_capacity, 1000);
        assert_eq!(config.webhooks.retention_days, 7);
        assert!(!config.webhooks.debounce.enabled);
        assert_eq!(config.webhooks.debounce.interval(), Duration::from_millis(250));
        assert_eq!(config.webhooks.debounce.max_wait(), Duration::from_millis(5000));
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);

        assert_eq!(config.subscribers.len(), 1);
        let subscriber = &config.subscribers[0];
        assert!(subscriber.active);
        assert_eq!(subscriber.events.len(), 2);
        assert_eq!(subscriber.headers.len(), 1);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = AppConfig::from_toml_str("").unwrap();

        assert_eq!(config.webhooks.workers, 4);
        assert!(config.webhooks.debounce.enabled);
        assert_eq!(config.logging.level, "info");
        assert!(config.subscribers.is_empty());
    }

    #[test]
    fn test_subscriber_debug_redacts_secret() {
        let seed = SubscriberSeed {
            name: "hook".to_string(),
            url: "https://example.com".to_string(),
            secret: "super-secret".to_string(),
            events: vec![],
            active: true,
            headers: HashMap::new(),
        };

        let debug = format!("{:?}", seed);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("<redacted>"));
    }
}
