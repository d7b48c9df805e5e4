//! Application Services
//!
//! Services that drive the domain through the ports.
//!
//! - `Orchestrator`: credential fetch, connect, subscribe, scheduled refresh
//! - `ReconnectPolicy`: bounded backoff between reconnect attempts
//! - `ConsoleRenderer`: quote lines and the status line

pub mod orchestrator;
pub mod reconnect;
pub mod renderer;

pub use orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorError, RunSummary};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use renderer::{ConsoleRenderer, DisplayMode, format_quote, render};
