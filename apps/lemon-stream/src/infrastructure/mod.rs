//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus process-wide concerns.

/// Ably realtime WebSocket client (live quote stream).
pub mod ably;

/// Layered configuration loading.
pub mod config;

/// lemon.markets HTTP adapters (credentials, latest quotes).
pub mod lemon;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Logging and OpenTelemetry tracing.
pub mod telemetry;
