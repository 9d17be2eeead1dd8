//! View Builder
//!
//! Derives sorted depth and the top-of-book ticker from a point-in-time
//! copy of a book. Nothing here is stored; every call reads the store once
//! and works on the copy.
//!
//! Bids are returned in descending price order (best first), asks in
//! ascending price order (best first). Equal prices keep insertion order.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use types::ids::Symbol;
use types::numeric::{Price, Quantity};
use types::order::Side;

use crate::level::SequenceState;
use crate::store::{BookStore, BookView};

/// Errors from read-side queries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ViewError {
    #[error("symbol {0} is not mirrored")]
    UnknownSymbol(Symbol),

    #[error("no liquidity for {symbol}: bids empty={bids_empty}, asks empty={asks_empty}")]
    NoLiquidity {
        symbol: Symbol,
        bids_empty: bool,
        asks_empty: bool,
    },
}

/// One row of a depth view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: Price,
    pub size: Quantity,
}

/// Sorted depth of one symbol at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBook {
    pub symbol: Symbol,
    /// Bids in descending price order (best first).
    pub bids: Vec<DepthLevel>,
    /// Asks in ascending price order (best first).
    pub asks: Vec<DepthLevel>,
    pub sequence: Option<SequenceState>,
    /// True while a resync is pending and this is the last consistent state.
    pub stale: bool,
    pub as_of: DateTime<Utc>,
}

impl OrderBook {
    /// Sort a book copy into bid/ask depth.
    pub fn from_view(view: &BookView) -> Self {
        let mut bids: Vec<DepthLevel> = side_levels(view, Side::Buy);
        let mut asks: Vec<DepthLevel> = side_levels(view, Side::Sell);

        // Stable sorts: ties stay in insertion order.
        bids.sort_by(|a, b| b.price.cmp(&a.price));
        asks.sort_by(|a, b| a.price.cmp(&b.price));

        Self {
            symbol: view.symbol.clone(),
            bids,
            asks,
            sequence: view.sequence,
            stale: view.stale,
            as_of: as_of(view.sequence),
        }
    }

    pub fn best_bid(&self) -> Option<&DepthLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&DepthLevel> {
        self.asks.first()
    }

    /// Mid-market price (average of best bid and best ask).
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => {
                Some((bid.price.as_decimal() + ask.price.as_decimal()) / Decimal::from(2))
            }
            _ => None,
        }
    }

    /// Best ask minus best bid.
    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask.price.as_decimal() - bid.price.as_decimal()),
            _ => None,
        }
    }

    /// Keep at most `max_levels` per side.
    pub fn truncated(mut self, max_levels: usize) -> Self {
        self.bids.truncate(max_levels);
        self.asks.truncate(max_levels);
        self
    }

    /// SHA-256 over the sorted levels and the update id.
    ///
    /// Two mirrors holding the same book at the same update agree on it.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();

        for level in &self.bids {
            hasher.update(level.price.to_string().as_bytes());
            hasher.update(b":");
            hasher.update(level.size.to_string().as_bytes());
            hasher.update(b"|");
        }
        hasher.update(b"---");

        for level in &self.asks {
            hasher.update(level.price.to_string().as_bytes());
            hasher.update(b":");
            hasher.update(level.size.to_string().as_bytes());
            hasher.update(b"|");
        }
        hasher.update(b"---");

        let update_id = self.sequence.map(|s| s.update_id).unwrap_or_default();
        hasher.update(update_id.to_le_bytes());

        format!("{:x}", hasher.finalize())
    }
}

/// Best level on each side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: Symbol,
    pub bid_price: Price,
    pub bid_size: Quantity,
    pub ask_price: Price,
    pub ask_size: Quantity,
    pub as_of: DateTime<Utc>,
}

impl Ticker {
    pub fn spread(&self) -> Decimal {
        self.ask_price.as_decimal() - self.bid_price.as_decimal()
    }

    pub fn mid_price(&self) -> Decimal {
        (self.bid_price.as_decimal() + self.ask_price.as_decimal()) / Decimal::from(2)
    }
}

/// Read-side entry point over the shared store.
#[derive(Debug, Clone)]
pub struct ViewBuilder {
    store: Arc<BookStore>,
}

impl ViewBuilder {
    pub fn new(store: Arc<BookStore>) -> Self {
        Self { store }
    }

    /// Full sorted depth for `symbol`.
    pub fn build_book(&self, symbol: &Symbol) -> Result<OrderBook, ViewError> {
        let view = self
            .store
            .snapshot_view(symbol)
            .ok_or_else(|| ViewError::UnknownSymbol(symbol.clone()))?;
        Ok(OrderBook::from_view(&view))
    }

    /// Sorted depth limited to `max_levels` per side.
    pub fn build_depth(&self, symbol: &Symbol, max_levels: usize) -> Result<OrderBook, ViewError> {
        Ok(self.build_book(symbol)?.truncated(max_levels))
    }

    /// Top of book. `NoLiquidity` when either side is empty.
    pub fn build_ticker(&self, symbol: &Symbol) -> Result<Ticker, ViewError> {
        let book = self.build_book(symbol)?;
        ticker_from(&book)
    }
}

/// Top of book from an already sorted depth view.
pub fn ticker_from(book: &OrderBook) -> Result<Ticker, ViewError> {
    match (book.best_bid(), book.best_ask()) {
        (Some(bid), Some(ask)) => Ok(Ticker {
            symbol: book.symbol.clone(),
            bid_price: bid.price,
            bid_size: bid.size,
            ask_price: ask.price,
            ask_size: ask.size,
            as_of: book.as_of,
        }),
        (bid, ask) => Err(ViewError::NoLiquidity {
            symbol: book.symbol.clone(),
            bids_empty: bid.is_none(),
            asks_empty: ask.is_none(),
        }),
    }
}

fn side_levels(view: &BookView, side: Side) -> Vec<DepthLevel> {
    view.side(side)
        .map(|level| DepthLevel {
            price: level.price,
            size: level.size,
        })
        .collect()
}

// Exchange time of the last applied message; wall clock before any.
fn as_of(sequence: Option<SequenceState>) -> DateTime<Utc> {
    sequence
        .and_then(|s| DateTime::from_timestamp_millis(s.ts_ms))
        .unwrap_or_else(Utc::now)
}
