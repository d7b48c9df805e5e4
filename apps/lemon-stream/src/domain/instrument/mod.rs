//! Instrument Identifiers
//!
//! Instruments are tracked by ISIN. An ISIN is 12 characters: a two letter
//! country prefix, nine alphanumeric characters and a check digit computed
//! with the Luhn algorithm over the base-36 expansion of the first eleven.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

/// Length of every ISIN.
pub const ISIN_LEN: usize = 12;

/// Reasons an identifier is not a well-formed ISIN.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IsinError {
    /// Identifier has the wrong length.
    #[error("ISIN '{value}' must be {ISIN_LEN} characters, got {len}")]
    Length {
        /// Offending input.
        value: String,
        /// Observed length in characters.
        len: usize,
    },

    /// Country prefix is not two uppercase ASCII letters.
    #[error("ISIN '{0}' must start with a two letter country code")]
    CountryCode(String),

    /// Body contains a character outside `[A-Z0-9]`.
    #[error("ISIN '{0}' contains characters outside A-Z and 0-9")]
    Charset(String),

    /// Check digit does not match.
    #[error("ISIN '{0}' has an invalid check digit")]
    CheckDigit(String),
}

/// A validated ISIN.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Isin(String);

impl Isin {
    /// Parse and validate an ISIN.
    ///
    /// Surrounding whitespace is ignored; lowercase input is rejected rather
    /// than normalised so configuration typos surface early.
    ///
    /// # Errors
    ///
    /// Returns an [`IsinError`] describing the first rule the input violates.
    pub fn parse(value: &str) -> Result<Self, IsinError> {
        let value = value.trim();
        let len = value.chars().count();
        if len != ISIN_LEN {
            return Err(IsinError::Length {
                value: value.to_string(),
                len,
            });
        }

        let bytes = value.as_bytes();
        if !bytes[..2].iter().all(u8::is_ascii_uppercase) {
            return Err(IsinError::CountryCode(value.to_string()));
        }
        if !bytes
            .iter()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
        {
            return Err(IsinError::Charset(value.to_string()));
        }
        if !bytes[ISIN_LEN - 1].is_ascii_digit() || !has_valid_check_digit(bytes) {
            return Err(IsinError::CheckDigit(value.to_string()));
        }

        Ok(Self(value.to_string()))
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Isin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Isin {
    type Err = IsinError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for Isin {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for Isin {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Expects `bytes` to be 12 uppercase alphanumerics.
fn has_valid_check_digit(bytes: &[u8]) -> bool {
    let mut digits: Vec<u32> = Vec::with_capacity(22);
    for &b in &bytes[..ISIN_LEN - 1] {
        let value = if b.is_ascii_digit() {
            u32::from(b - b'0')
        } else {
            u32::from(b - b'A') + 10
        };
        if value >= 10 {
            digits.push(value / 10);
            digits.push(value % 10);
        } else {
            digits.push(value);
        }
    }

    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 0 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();

    let expected = (10 - sum % 10) % 10;
    u32::from(bytes[ISIN_LEN - 1] - b'0') == expected
}
