//! Fixed-point decimal types for prices and quantities
//!
//! Uses rust_decimal for deterministic arithmetic (no floating-point errors).
//! Wire values arrive as decimal strings and are parsed without going
//! through a binary float.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::TypeError;

/// A strictly positive price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Price(Decimal);

impl Price {
    /// Wrap a decimal, returning None unless it is strictly positive.
    pub fn try_new(value: Decimal) -> Option<Self> {
        if value > Decimal::ZERO {
            Some(Self(value))
        } else {
            None
        }
    }

    /// Build a whole-number price.
    ///
    /// # Panics
    /// Panics if `value` is zero.
    pub fn from_u64(value: u64) -> Self {
        assert!(value > 0, "Price must be positive");
        Self(Decimal::from(value))
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    /// Same price with trailing zeros stripped (`100.50` → `100.5`).
    pub fn normalized(&self) -> Self {
        Self(self.0.normalize())
    }
}

impl FromStr for Price {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = Decimal::from_str(s.trim()).map_err(|_| TypeError::InvalidPrice(s.to_string()))?;
        Self::try_new(value).ok_or_else(|| TypeError::InvalidPrice(s.to_string()))
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.normalize())
    }
}

/// A non-negative size. Zero is meaningful on the wire (level removed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quantity(Decimal);

impl Quantity {
    pub const ZERO: Quantity = Quantity(Decimal::ZERO);

    /// Wrap a decimal, returning None if it is negative.
    pub fn try_new(value: Decimal) -> Option<Self> {
        if value >= Decimal::ZERO {
            Some(Self(value))
        } else {
            None
        }
    }

    pub fn from_u64(value: u64) -> Self {
        Self(Decimal::from(value))
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl FromStr for Quantity {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value =
            Decimal::from_str(s.trim()).map_err(|_| TypeError::InvalidQuantity(s.to_string()))?;
        Self::try_new(value).ok_or_else(|| TypeError::InvalidQuantity(s.to_string()))
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.normalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_price_from_str() {
        let price = Price::from_str("100.50").unwrap();
        assert_eq!(price.as_decimal(), Decimal::from_str_exact("100.50").unwrap());
        assert_eq!(price.to_string(), "100.5");
    }

    #[test]
    fn test_price_rejects_zero_and_negative() {
        assert!(Price::from_str("0").is_err());
        assert!(Price::from_str("-1.5").is_err());
        assert!(Price::try_new(Decimal::ZERO).is_none());
    }

    #[test]
    fn test_price_rejects_garbage() {
        assert_eq!(
            Price::from_str("abc"),
            Err(TypeError::InvalidPrice("abc".to_string()))
        );
    }

    #[test]
    #[should_panic(expected = "Price must be positive")]
    fn test_price_from_u64_zero_panics() {
        Price::from_u64(0);
    }

    #[test]
    fn test_price_normalized_equality() {
        let a = Price::from_str("100.50").unwrap().normalized();
        let b = Price::from_str("100.5").unwrap().normalized();
        assert_eq!(a.to_string(), b.to_string());
        assert_eq!(a, b);
    }

    #[test]
    fn test_quantity_zero_allowed() {
        let q = Quantity::from_str("0").unwrap();
        assert!(q.is_zero());
        assert_eq!(q, Quantity::ZERO);
    }

    #[test]
    fn test_quantity_rejects_negative() {
        assert!(Quantity::from_str("-0.1").is_err());
    }

    #[test]
    fn test_serialization_as_string() {
        let price = Price::from_str("0.06824").unwrap();
        let json = serde_json::to_string(&price).unwrap();
        assert_eq!(json, "\"0.06824\"");
        let back: Price = serde_json::from_str(&json).unwrap();
        assert_eq!(price, back);
    }

    proptest! {
        #[test]
        fn prop_price_ordering_matches_decimal(a in 1u64..1_000_000, b in 1u64..1_000_000) {
            let pa = Price::from_u64(a);
            let pb = Price::from_u64(b);
            prop_assert_eq!(pa.cmp(&pb), a.cmp(&b));
        }
    }
}
