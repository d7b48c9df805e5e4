//! Logging and OpenTelemetry Tracing
//!
//! Installs the global `tracing` subscriber: an `EnvFilter` (the configured
//! level is the default directive, `RUST_LOG` adds to it), a fmt layer on
//! stderr, and optionally an OTLP span exporter.
//!
//! # Usage
//!
//! ```ignore
//! use lemon_stream::infrastructure::telemetry::{self, TelemetryConfig};
//!
//! // Keep the guard alive for the duration of the program
//! let _guard = telemetry::init(TelemetryConfig::default())?;
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::infrastructure::config::{LoggingSettings, TelemetrySettings};

/// Service name for OpenTelemetry traces.
const DEFAULT_SERVICE_NAME: &str = "lemon-stream";

/// Directives applied on top of the configured level.
const QUIET_DEPENDENCIES: [&str; 4] = ["hyper=warn", "h2=warn", "tungstenite=info", "reqwest=info"];

/// Telemetry setup errors.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// A filter directive did not parse.
    #[error("invalid log filter '{directive}': {message}")]
    Filter {
        /// Offending directive.
        directive: String,
        /// Parser message.
        message: String,
    },

    /// The OTLP exporter could not be built.
    #[error("failed to create OTLP exporter: {0}")]
    Exporter(String),

    /// A global subscriber is already installed.
    #[error("failed to install tracing subscriber: {0}")]
    Install(String),
}

/// Guard that shuts down OpenTelemetry when dropped.
pub struct TelemetryGuard {
    tracer_provider: Option<SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("Failed to shutdown OpenTelemetry tracer provider: {e}");
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Default filter directive, e.g. `info` or `lemon_stream=debug`.
    pub level: String,
    /// Whether OTLP export is enabled.
    pub otlp_enabled: bool,
    /// OTLP exporter endpoint.
    pub otlp_endpoint: String,
    /// Service name for traces.
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self::from_settings(&LoggingSettings::default(), &TelemetrySettings::default())
    }
}

impl TelemetryConfig {
    /// Build from the `logging` and `telemetry` config sections.
    #[must_use]
    pub fn from_settings(logging: &LoggingSettings, telemetry: &TelemetrySettings) -> Self {
        Self {
            level: logging.level.clone(),
            otlp_enabled: telemetry.otlp_enabled,
            otlp_endpoint: telemetry.otlp_endpoint.clone(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
        }
    }

    /// Filter with the configured level as default and `RUST_LOG` on top.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::Filter`] if a directive does not parse.
    pub fn env_filter(&self) -> Result<EnvFilter, TelemetryError> {
        let mut filter = EnvFilter::builder()
            .with_default_directive(parse_directive(&self.level)?)
            .from_env_lossy();
        for directive in QUIET_DEPENDENCIES {
            filter = filter.add_directive(parse_directive(directive)?);
        }
        Ok(filter)
    }
}

fn parse_directive(
    directive: &str,
) -> Result<tracing_subscriber::filter::Directive, TelemetryError> {
    directive.parse().map_err(
        |e: tracing_subscriber::filter::ParseError| TelemetryError::Filter {
            directive: directive.to_string(),
            message: e.to_string(),
        },
    )
}

/// Install the global subscriber.
///
/// Returns a guard that must be kept alive for the duration of the program.
///
/// # Errors
///
/// Returns an error if the filter is invalid, the exporter cannot be built,
/// or a subscriber is already installed.
pub fn init(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let env_filter = config.env_filter()?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if !config.otlp_enabled {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| TelemetryError::Install(e.to_string()))?;

        return Ok(TelemetryGuard {
            tracer_provider: None,
        });
    }

    let otlp_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&config.otlp_endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter(e.to_string()))?;

    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(otlp_exporter)
        .with_resource(
            opentelemetry_sdk::Resource::builder()
                .with_service_name(config.service_name.clone())
                .build(),
        )
        .build();

    let tracer = tracer_provider.tracer(config.service_name);
    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::Install(e.to_string()))?;

    Ok(TelemetryGuard {
        tracer_provider: Some(tracer_provider),
    })
}

// =============================================================================
// Tests
// =============================================================================
