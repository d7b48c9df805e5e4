//! Configuration Module
//!
//! YAML settings plus layered resolution of the API key and instrument list.

mod loader;
mod settings;

pub use loader::{
    API_KEY_VAR, ConfigError, ConfigLoader, DEFAULT_CONFIG_PATH, DEFAULT_SECRETS_PATH,
    INSTRUMENTS_VAR,
};
pub use settings::{
    ApiKey, ApiSettings, DEFAULT_AUTH_URL, DEFAULT_MARKET_DATA_URL, DisplaySettings, KeySource,
    LoggingSettings, MetricsSettings, ReconnectSettings, StreamSettings, StreamerConfig,
    TelemetrySettings,
};
