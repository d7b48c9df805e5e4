//! Lemon Stream Binary
//!
//! Streams live quotes for the configured ISINs to the terminal.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin lemon-stream -- --config config.yaml --secrets .env
//! ```
//!
//! # Environment Variables
//!
//! - `LEMON_API_KEY`: lemon.markets API key (else secrets file, else `api.key`)
//! - `LEMON_INSTRUMENTS`: comma separated ISINs (else secrets file, else `instruments`).
//!   In the secrets file, quote the value if it contains spaces:
//!   `LEMON_INSTRUMENTS="US0378331005, DE0007164600"`
//! - `LEMON_CONFIG`: config file path (default: config.yaml)
//! - `LEMON_SECRETS`: secrets file path (default: .env)
//! - `RUST_LOG`: log filter on top of `logging.level`
//!
//! # Exit Codes
//!
//! 0 clean shutdown, 2 configuration, 3 credentials, 4 connection, 1 anything else.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use lemon_stream::infrastructure::config::{DEFAULT_CONFIG_PATH, DEFAULT_SECRETS_PATH};
use lemon_stream::infrastructure::telemetry;
use lemon_stream::{
    AblyConnector, ConfigLoader, ConsoleRenderer, CredentialClient, Isin, LatestQuotesClient,
    Orchestrator, OrchestratorError, StreamerConfig, TelemetryConfig, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

const EXIT_FAILURE: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_CREDENTIALS: u8 = 3;
const EXIT_CONNECTION: u8 = 4;

/// Live quote console for the lemon.markets market data stream.
#[derive(Debug, Parser)]
#[command(name = "lemon-stream", version, about)]
struct Args {
    /// YAML config file.
    #[arg(long, env = "LEMON_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Secrets file in dotenv syntax.
    #[arg(long, env = "LEMON_SECRETS", default_value = DEFAULT_SECRETS_PATH)]
    secrets: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("rustls crypto provider was already installed");
    }

    // The log level lives in the config file, so nothing is logged before this.
    let config = match ConfigLoader::new(&args.config, &args.secrets).load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let _telemetry_guard = match telemetry::init(TelemetryConfig::from_settings(
        &config.logging,
        &config.telemetry,
    )) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialise logging: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting lemon-stream");
    log_config(&config);

    if config.metrics.port > 0
        && let Err(e) = init_metrics(config.metrics.port)
    {
        tracing::error!(error = %e, port = config.metrics.port, "Failed to start metrics exporter");
        return ExitCode::from(EXIT_FAILURE);
    }

    let mut orchestrator = match build_orchestrator(&config) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build HTTP client");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    let shutdown_token = CancellationToken::new();
    tokio::spawn(await_shutdown(shutdown_token.clone()));

    match orchestrator.run(shutdown_token).await {
        Ok(summary) => {
            tracing::info!(
                quotes = summary.quotes_applied,
                seeded = summary.seeded,
                refreshes = summary.refreshes,
                "lemon-stream stopped"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "lemon-stream terminated");
            ExitCode::from(exit_code(&e))
        }
    }
}

fn build_orchestrator(
    config: &StreamerConfig,
) -> Result<Orchestrator<std::io::Stdout>, reqwest::Error> {
    let api = config.lemon_api();
    let http = api.http_client()?;

    let credentials = Arc::new(CredentialClient::with_http(http.clone(), &api));
    let seeder = Arc::new(LatestQuotesClient::with_http(http, &api));
    let connector = Arc::new(AblyConnector::new(config.stream_client()));

    Ok(Orchestrator::new(
        config.orchestrator(),
        credentials,
        connector,
        ConsoleRenderer::stdout(config.display.mode).with_timezone(config.display.timezone),
    )
    .with_seeder(seeder))
}

const fn exit_code(error: &OrchestratorError) -> u8 {
    match error {
        OrchestratorError::Credentials(_) => EXIT_CREDENTIALS,
        OrchestratorError::Connection(_) => EXIT_CONNECTION,
        OrchestratorError::Output(_) => EXIT_FAILURE,
    }
}

/// Log the resolved configuration.
fn log_config(config: &StreamerConfig) {
    let instruments: Vec<&str> = config.instruments.iter().map(Isin::as_str).collect();
    tracing::info!(
        key_source = %config.key_source,
        instruments = %instruments.join(","),
        display = ?config.display.mode,
        timezone = %config.display.timezone,
        format = %config.stream.format,
        refresh_margin_secs = config.stream.refresh_margin_secs,
        max_reconnect_attempts = config.stream.reconnect.max_attempts,
        metrics_port = config.metrics.port,
        "Configuration loaded"
    );
    tracing::debug!(
        auth_url = %config.api.auth_url,
        market_data_url = %config.api.market_data_url,
        stream_url = %config.stream.url,
        "Endpoints"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
