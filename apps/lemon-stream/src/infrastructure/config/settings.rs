//! Streamer Configuration Settings
//!
//! Typed view of `config.yaml`. Every section is optional and falls back to
//! the defaults below; the API key and instrument list are resolved by the
//! [`ConfigLoader`](super::ConfigLoader) across all configuration sources.

use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::application::services::{DisplayMode, OrchestratorConfig, ReconnectConfig};
use crate::domain::instrument::Isin;
use crate::infrastructure::ably::{HeartbeatConfig, StreamClientConfig, WireFormat};
use crate::infrastructure::lemon::LemonApiConfig;

/// Default credentials endpoint.
pub const DEFAULT_AUTH_URL: &str = "https://realtime.lemon.markets/v1/auth";

/// Default market data API base.
pub const DEFAULT_MARKET_DATA_URL: &str = "https://data.lemon.markets/v1";

// =============================================================================
// Secrets
// =============================================================================

/// lemon.markets API key.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    /// Wrap a key.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The key itself, for the `Authorization` header.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey([REDACTED])")
    }
}

/// Where a setting was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// Process environment.
    Environment,
    /// Secrets (dotenv) file.
    SecretsFile,
    /// YAML config file.
    ConfigFile,
}

impl KeySource {
    /// Name used in logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Environment => "environment",
            Self::SecretsFile => "secrets file",
            Self::ConfigFile => "config file",
        }
    }
}

impl std::fmt::Display for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Sections
// =============================================================================

/// lemon.markets HTTP API settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiSettings {
    /// Credentials endpoint.
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
    /// Market data API base (latest quotes).
    #[serde(default = "default_market_data_url")]
    pub market_data_url: String,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            auth_url: default_auth_url(),
            market_data_url: default_market_data_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Reconnect backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectSettings {
    /// Consecutive attempts before giving up (0 = fail fast).
    #[serde(default)]
    pub max_attempts: u32,
    /// First delay in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Delay cap in seconds.
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    /// Growth factor per attempt.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_secs: default_max_delay_secs(),
            multiplier: default_multiplier(),
        }
    }
}

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Realtime WebSocket endpoint.
    #[serde(default = "default_stream_url")]
    pub url: String,
    /// Frame encoding.
    #[serde(default)]
    pub format: WireFormat,
    /// Ask the broker for protocol heartbeats.
    #[serde(default)]
    pub heartbeats: bool,
    /// Refresh credentials this long before they expire.
    #[serde(default = "default_refresh_margin_secs")]
    pub refresh_margin_secs: u64,
    /// Bound on connect + CONNECTED.
    #[serde(default = "default_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Bound on ATTACH + ATTACHED.
    #[serde(default = "default_timeout_secs")]
    pub subscribe_timeout_secs: u64,
    /// WebSocket ping interval.
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// Silence after which the connection is dead.
    #[serde(default = "default_pong_timeout_secs")]
    pub pong_timeout_secs: u64,
    /// Reconnect backoff.
    #[serde(default)]
    pub reconnect: ReconnectSettings,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            url: default_stream_url(),
            format: WireFormat::default(),
            heartbeats: false,
            refresh_margin_secs: default_refresh_margin_secs(),
            connect_timeout_secs: default_timeout_secs(),
            subscribe_timeout_secs: default_timeout_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            pong_timeout_secs: default_pong_timeout_secs(),
            reconnect: ReconnectSettings::default(),
        }
    }
}

/// Console output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplaySettings {
    /// `log` or `status`.
    #[serde(default)]
    pub mode: DisplayMode,
    /// Seed the store from `/quotes/latest` after connecting.
    #[serde(default = "default_true")]
    pub seed_latest: bool,
    /// IANA zone for quote times and credential expiry, e.g. `Europe/Berlin`.
    #[serde(default = "default_timezone")]
    pub timezone: Tz,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            mode: DisplayMode::default(),
            seed_latest: true,
            timezone: default_timezone(),
        }
    }
}

const fn default_timezone() -> Tz {
    Tz::UTC
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Default filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// OpenTelemetry export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySettings {
    /// Export spans over OTLP.
    #[serde(default)]
    pub otlp_enabled: bool,
    /// Collector endpoint.
    #[serde(default = "default_otlp_endpoint")]
    pub otlp_endpoint: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            otlp_enabled: false,
            otlp_endpoint: default_otlp_endpoint(),
        }
    }
}

/// Prometheus exporter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSettings {
    /// Listener port (0 = disabled).
    #[serde(default)]
    pub port: u16,
}

/// `api` section as written in the file; the key is resolved separately.
#[derive(Debug, Clone, Default, Deserialize)]
pub(super) struct ApiSection {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(flatten)]
    pub settings: ApiSettings,
}

/// Raw `config.yaml` document.
#[derive(Debug, Clone, Default, Deserialize)]
pub(super) struct FileConfig {
    #[serde(default)]
    pub api: ApiSection,
    #[serde(default)]
    pub instruments: Vec<String>,
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub display: DisplaySettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub telemetry: TelemetrySettings,
    #[serde(default)]
    pub metrics: MetricsSettings,
}

// =============================================================================
// Resolved configuration
// =============================================================================

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct StreamerConfig {
    /// API key.
    pub api_key: ApiKey,
    /// Where the API key came from.
    pub key_source: KeySource,
    /// Instruments, in configured order, without duplicates.
    pub instruments: Vec<Isin>,
    /// HTTP API settings.
    pub api: ApiSettings,
    /// Broker settings.
    pub stream: StreamSettings,
    /// Console output.
    pub display: DisplaySettings,
    /// Logging.
    pub logging: LoggingSettings,
    /// OpenTelemetry export.
    pub telemetry: TelemetrySettings,
    /// Prometheus exporter.
    pub metrics: MetricsSettings,
}

impl StreamerConfig {
    /// Lifecycle settings for the orchestrator.
    #[must_use]
    pub fn orchestrator(&self) -> OrchestratorConfig {
        let reconnect = &self.stream.reconnect;
        OrchestratorConfig {
            refresh_margin: Duration::from_secs(self.stream.refresh_margin_secs),
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(reconnect.initial_delay_ms),
                max_delay: Duration::from_secs(reconnect.max_delay_secs),
                multiplier: reconnect.multiplier,
                max_attempts: reconnect.max_attempts,
                ..ReconnectConfig::default()
            },
            seed_latest: self.display.seed_latest,
            ..OrchestratorConfig::new(self.instruments.clone())
        }
    }

    /// Broker client settings.
    #[must_use]
    pub fn stream_client(&self) -> StreamClientConfig {
        StreamClientConfig {
            url: self.stream.url.clone(),
            format: self.stream.format,
            broker_heartbeats: self.stream.heartbeats,
            connect_timeout: Duration::from_secs(self.stream.connect_timeout_secs),
            subscribe_timeout: Duration::from_secs(self.stream.subscribe_timeout_secs),
            heartbeat: HeartbeatConfig::new(
                Duration::from_secs(self.stream.ping_interval_secs),
                Duration::from_secs(self.stream.pong_timeout_secs),
            ),
        }
    }

    /// HTTP client settings for the auth and market data endpoints.
    #[must_use]
    pub fn lemon_api(&self) -> LemonApiConfig {
        LemonApiConfig {
            api_key: self.api_key.clone(),
            auth_url: self.api.auth_url.clone(),
            market_data_url: self.api.market_data_url.clone(),
            timeout: Duration::from_secs(self.api.timeout_secs),
        }
    }
}

fn default_auth_url() -> String {
    DEFAULT_AUTH_URL.to_string()
}

fn default_market_data_url() -> String {
    DEFAULT_MARKET_DATA_URL.to_string()
}

fn default_stream_url() -> String {
    crate::infrastructure::ably::DEFAULT_STREAM_URL.to_string()
}

const fn default_timeout_secs() -> u64 {
    10
}

const fn default_refresh_margin_secs() -> u64 {
    3600
}

const fn default_ping_interval_secs() -> u64 {
    20
}

const fn default_pong_timeout_secs() -> u64 {
    60
}

const fn default_initial_delay_ms() -> u64 {
    1000
}

const fn default_max_delay_secs() -> u64 {
    64
}

const fn default_multiplier() -> f64 {
    2.0
}

const fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4318".to_string()
}
