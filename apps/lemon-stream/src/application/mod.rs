//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the orchestration of the streaming lifecycle and the
//! port interfaces that define how it talks to external systems.

/// Port interfaces for external systems (auth API, broker, quote snapshot).
pub mod ports;

/// Application services: orchestrator and console rendering.
pub mod services;
