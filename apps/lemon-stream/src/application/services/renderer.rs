//! Console Rendering
//!
//! Formats quotes for the terminal. Two display modes exist:
//!
//! - **Log**: one `tracing` line per update,
//!   `ISIN (exc=MIC, ask=PRICE, bid=PRICE, date=TIMESTAMP)`.
//! - **Status**: a single status line with every known quote, rewritten in
//!   place with a carriage return on each update.
//!
//! Timestamps are shown in the configured display timezone.

use std::io::Write;

use chrono::SecondsFormat;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::domain::quote::{Quote, QuoteStore};

/// Separator between quotes on the status line.
const STATUS_SEPARATOR: &str = " | ";

/// How updates are shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    /// One log line per quote update.
    #[default]
    Log,
    /// One status line overwritten on every update.
    Status,
}

/// Format a single quote with its timestamp in `tz`.
#[must_use]
pub fn format_quote(quote: &Quote, tz: Tz) -> String {
    format!(
        "{} (exc={}, ask={:.4}, bid={:.4}, date={})",
        quote.isin,
        quote.exchange,
        quote.ask,
        quote.bid,
        quote
            .timestamp
            .with_timezone(&tz)
            .to_rfc3339_opts(SecondsFormat::Millis, true)
    )
}

/// Render every known quote in configured instrument order.
#[must_use]
pub fn render(store: &QuoteStore, tz: Tz) -> String {
    if store.is_empty() {
        return format!(
            "waiting for quotes ({} instruments)",
            store.instruments().len()
        );
    }

    store
        .iter()
        .map(|quote| format_quote(quote, tz))
        .collect::<Vec<_>>()
        .join(STATUS_SEPARATOR)
}

/// Writes quote updates to the console.
#[derive(Debug)]
pub struct ConsoleRenderer<W> {
    mode: DisplayMode,
    timezone: Tz,
    out: W,
}

impl ConsoleRenderer<std::io::Stdout> {
    /// Renderer writing to standard output.
    #[must_use]
    pub fn stdout(mode: DisplayMode) -> Self {
        Self::new(mode, std::io::stdout())
    }
}

impl<W: Write> ConsoleRenderer<W> {
    /// Renderer writing status lines to `out`, showing times in UTC.
    pub const fn new(mode: DisplayMode, out: W) -> Self {
        Self {
            mode,
            timezone: Tz::UTC,
            out,
        }
    }

    /// Show timestamps in `timezone`.
    #[must_use]
    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    /// Display timezone.
    pub const fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Show `quote`, which has just been applied to `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if writing the status line fails.
    pub fn emit(&mut self, store: &QuoteStore, quote: &Quote) -> std::io::Result<()> {
        match self.mode {
            DisplayMode::Log => {
                tracing::info!("{}", format_quote(quote, self.timezone));
                Ok(())
            }
            DisplayMode::Status => {
                write!(self.out, "\r{}", render(store, self.timezone))?;
                self.out.flush()
            }
        }
    }

    /// Terminate the status line so subsequent output starts on a fresh line.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub fn finish(&mut self) -> std::io::Result<()> {
        if self.mode == DisplayMode::Status {
            writeln!(self.out)?;
            self.out.flush()?;
        }
        Ok(())
    }

    /// Consume the renderer, returning the writer.
    pub fn into_inner(self) -> W {
        self.out
    }
}
