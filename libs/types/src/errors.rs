//! Error types for the shared vocabulary
//!
//! Validation failures raised while constructing domain values.

use thiserror::Error;

/// Raised when a raw value cannot become a domain type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    #[error("Invalid symbol: {0:?}")]
    InvalidSymbol(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_error_display() {
        let err = TypeError::InvalidPrice("negative".to_string());
        assert_eq!(err.to_string(), "Invalid price: negative");
    }

    #[test]
    fn test_symbol_error_quotes_input() {
        let err = TypeError::InvalidSymbol("".to_string());
        assert_eq!(err.to_string(), "Invalid symbol: \"\"");
    }
}
