//! Identifier types for instruments and book levels
//!
//! `Symbol` names an exchange instrument as the exchange spells it
//! (`BTCUSDT`). `LevelId` is the opaque key of one price level in a book.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::TypeError;
use crate::numeric::Price;
use crate::order::Side;

/// Exchange instrument name (e.g., "BTCUSDT", "BTC-27DEC24")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    /// Create a new Symbol from a string
    ///
    /// # Panics
    /// Panics if the symbol is empty or contains characters other than
    /// ASCII alphanumerics, `-` and `_`
    pub fn new(symbol: impl Into<String>) -> Self {
        let s = symbol.into();
        assert!(Self::is_valid(&s), "Symbol must be non-empty alphanumeric");
        Self(s)
    }

    /// Try to create a Symbol, returning None if invalid
    pub fn try_new(symbol: impl Into<String>) -> Option<Self> {
        let s = symbol.into();
        if Self::is_valid(&s) {
            Some(Self(s))
        } else {
            None
        }
    }

    /// Get the symbol string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn is_valid(s: &str) -> bool {
        !s.is_empty()
            && s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl FromStr for Symbol {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_new(s).ok_or_else(|| TypeError::InvalidSymbol(s.to_string()))
    }
}

/// Opaque key of a price level.
///
/// Feeds that assign level ids use them verbatim. Price-keyed feeds derive
/// the id from side and normalized price via [`LevelId::for_price`], so the
/// same price on the same side always lands on the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LevelId(String);

impl LevelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Key for a price-keyed level.
    pub fn for_price(side: Side, price: Price) -> Self {
        Self(format!("{}@{}", side.as_str(), price.normalized()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LevelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for LevelId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for LevelId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}
