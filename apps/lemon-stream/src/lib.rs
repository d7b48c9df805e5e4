#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! Lemon Stream - Live Quote Console
//!
//! Streams live quotes for a fixed set of ISINs from the lemon.markets
//! market data live stream and keeps the short-lived streaming credentials
//! fresh without operator involvement.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: ISINs, quotes and the latest-quote store, credentials and
//!   their refresh schedule
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Interfaces for the credential source, broker connection and
//!     quote snapshot
//!   - `services`: Orchestrator, reconnect policy, console rendering
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `ably`: Realtime WebSocket client
//!   - `lemon`: HTTP clients for credentials and latest quotes
//!   - `config`: Environment / secrets file / YAML configuration
//!   - `metrics`, `telemetry`: Prometheus and tracing setup
//!
//! # Data Flow
//!
//! ```text
//!  auth API ──credentials──► Orchestrator ◄──mpsc── Ably WS pump task
//!                               │
//!                               ├─► QuoteStore (isin → latest quote)
//!                               └─► ConsoleRenderer (log line / status line)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core quote streaming types with no external dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::credentials::{Credentials, RefreshSchedule};
pub use domain::instrument::{Isin, IsinError};
pub use domain::quote::{ApplyOutcome, Quote, QuoteStore};

// Ports
pub use application::ports::{
    ConnectionError, CredentialFetchError, CredentialSource, QuoteSeeder, SeedError,
    StreamConnection, StreamConnector, StreamEvent, StreamState,
};

// Services
pub use application::services::{
    ConsoleRenderer, DisplayMode, Orchestrator, OrchestratorConfig, OrchestratorError,
    ReconnectConfig, RunSummary, format_quote, render,
};

// Infrastructure
pub use infrastructure::ably::{AblyConnector, StreamClientConfig, WireFormat};
pub use infrastructure::config::{ConfigError, ConfigLoader, KeySource, StreamerConfig};
pub use infrastructure::lemon::{CredentialClient, LatestQuotesClient, LemonApiConfig};
pub use infrastructure::metrics::init_metrics;
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
