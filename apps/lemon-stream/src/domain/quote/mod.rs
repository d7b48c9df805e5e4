//! Quotes and the Latest-Quote Store
//!
//! A [`Quote`] is the latest ask/bid pair observed for one ISIN on one
//! exchange. The [`QuoteStore`] keeps exactly one quote per configured ISIN
//! and is overwritten in message arrival order; the embedded timestamp is
//! never used to reject an update.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::instrument::Isin;

// =============================================================================
// Quote
// =============================================================================

/// Latest observed prices for one instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    /// Instrument identifier.
    pub isin: Isin,
    /// Market identifier code of the quoting exchange (e.g. `XMUN`).
    pub exchange: String,
    /// Best ask price.
    pub ask: Decimal,
    /// Best bid price.
    pub bid: Decimal,
    /// Exchange timestamp of the quote.
    pub timestamp: DateTime<Utc>,
}

impl Quote {
    /// Create a new quote.
    #[must_use]
    pub fn new(
        isin: Isin,
        exchange: impl Into<String>,
        ask: Decimal,
        bid: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            isin,
            exchange: exchange.into(),
            ask,
            bid,
            timestamp,
        }
    }
}

// =============================================================================
// Quote Store
// =============================================================================

/// Outcome of [`QuoteStore::apply_quote`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// First quote for this ISIN.
    Inserted,
    /// Replaced an earlier quote.
    Updated,
    /// ISIN is not part of the tracked set.
    Ignored,
}

impl ApplyOutcome {
    /// Whether the store changed.
    #[must_use]
    pub const fn is_applied(self) -> bool {
        !matches!(self, Self::Ignored)
    }
}

/// In-memory map from ISIN to the latest quote.
///
/// Iteration follows the configured instrument order, not arrival order, so
/// rendering the same contents always produces the same output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteStore {
    instruments: Vec<Isin>,
    quotes: HashMap<Isin, Quote>,
}

impl QuoteStore {
    /// Create an empty store tracking `instruments` in the given order.
    ///
    /// Duplicates are dropped, keeping the first occurrence.
    #[must_use]
    pub fn new(instruments: impl IntoIterator<Item = Isin>) -> Self {
        let mut ordered: Vec<Isin> = Vec::new();
        for isin in instruments {
            if !ordered.contains(&isin) {
                ordered.push(isin);
            }
        }

        Self {
            quotes: HashMap::with_capacity(ordered.len()),
            instruments: ordered,
        }
    }

    /// Insert or overwrite the quote for its ISIN.
    pub fn apply_quote(&mut self, quote: Quote) -> ApplyOutcome {
        if !self.instruments.contains(&quote.isin) {
            return ApplyOutcome::Ignored;
        }

        match self.quotes.insert(quote.isin.clone(), quote) {
            Some(_) => ApplyOutcome::Updated,
            None => ApplyOutcome::Inserted,
        }
    }

    /// Latest quote for `isin`, if one has arrived.
    #[must_use]
    pub fn get(&self, isin: &Isin) -> Option<&Quote> {
        self.quotes.get(isin)
    }

    /// Tracked instruments in configured order.
    #[must_use]
    pub fn instruments(&self) -> &[Isin] {
        &self.instruments
    }

    /// Known quotes in configured instrument order.
    pub fn iter(&self) -> impl Iterator<Item = &Quote> {
        self.instruments
            .iter()
            .filter_map(|isin| self.quotes.get(isin))
    }

    /// Number of instruments with at least one quote.
    #[must_use]
    pub fn len(&self) -> usize {
        self.quotes.len()
    }

    /// Whether no quote has arrived yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }
}
