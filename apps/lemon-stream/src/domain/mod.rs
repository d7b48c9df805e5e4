//! Domain Layer - Core quote streaming types.
//!
//! This layer contains the instrument, quote and credential types with no
//! I/O. Everything here is deterministic and testable in isolation.

/// Streaming credentials and refresh scheduling.
pub mod credentials;

/// Instrument identifiers (ISIN).
pub mod instrument;

/// Quotes and the latest-quote store.
pub mod quote;
