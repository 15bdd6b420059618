use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::transport::BackoffConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub video: VideoConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    /// Base URL of the REST collaborator, e.g. `https://api.example.com/api`
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// WebSocket URL of the push channel
    #[serde(default = "default_socket_url")]
    pub socket_url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Initial bearer token; rotated at runtime through the credential store
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Upper bound for a single handshake in milliseconds
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Consecutive failed attempts before giving up (0 = retry forever)
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,
    /// A session with no inbound frame for this long is treated as dropped (0 = disabled)
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Fallback unread-count polling interval in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Refresh the unread counter when a push event arrives
    #[serde(default = "default_true")]
    pub push_refresh: bool,
    /// Refresh the unread counter on a timer
    #[serde(default = "default_true")]
    pub polling: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VideoConfig {
    /// Video ids to project status for
    #[serde(default)]
    pub watch_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_api_base_url() -> String {
    "http://localhost:3000/api".to_string()
}

fn default_socket_url() -> String {
    "ws://localhost:3000/ws".to_string()
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_backoff_initial_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000 // 30 seconds
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_jitter() -> f64 {
    0.1
}

fn default_idle_timeout_ms() -> u64 {
    90_000
}

fn default_page_size() -> u32 {
    20
}

fn default_poll_interval() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("endpoint.api_base_url", default_api_base_url())?
            .set_default("endpoint.socket_url", default_socket_url())?
            .set_default("logging.level", default_log_level())?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // ARA_SYNC__ENDPOINT__SOCKET_URL, ARA_SYNC__AUTH__TOKEN, etc.
            .add_source(
                Environment::with_prefix("ARA_SYNC")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("video.watch_ids"),
            );

        builder.build()?.try_deserialize()
    }
}

impl ConnectionConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }

    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay_ms: self.backoff_initial_ms,
            max_delay_ms: self.backoff_max_ms,
            multiplier: self.backoff_multiplier,
            jitter_factor: self.backoff_jitter.clamp(0.0, 1.0),
        }
    }
}

impl NotificationsConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            socket_url: default_socket_url(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_jitter: default_backoff_jitter(),
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            poll_interval_secs: default_poll_interval(),
            request_timeout_secs: default_request_timeout(),
            push_refresh: true,
            polling: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let connection = ConnectionConfig::default();
        assert_eq!(connection.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(connection.max_reconnect_attempts, 10);

        let notifications = NotificationsConfig::default();
        assert_eq!(notifications.poll_interval(), Duration::from_secs(30));
        assert!(notifications.push_refresh);
        assert!(notifications.polling);
    }

    #[test]
    fn test_backoff_jitter_is_clamped() {
        let connection = ConnectionConfig {
            backoff_jitter: 4.0,
            ..Default::default()
        };
        assert_eq!(connection.backoff().jitter_factor, 1.0);
    }

    #[test]
    fn test_log_format_parses_lowercase() {
        let logging: LoggingConfig =
            serde_json::from_value(serde_json::json!({"format": "json"})).unwrap();
        assert_eq!(logging.format, LogFormat::Json);
        assert_eq!(logging.level, "info");
    }
}
