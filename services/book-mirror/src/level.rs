//! Book data model
//!
//! A `PriceLevel` is one row of a symbol's book. Its `id` is the identity;
//! `price` never changes for a given id once inserted, only `size` and
//! `side` are mutated in place.
//!
//! Two delta shapes reach the engine:
//! - `Delta`: explicit insert/update/delete lists, for feeds that assign ids.
//! - `LevelChange`: absolute `[price, size]` entries, for price-keyed feeds.
//!   A zero size means the level is gone.

use serde::{Deserialize, Serialize};
use types::ids::{LevelId, Symbol};
use types::numeric::{Price, Quantity};
use types::order::Side;

/// A single price level in the order book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub id: LevelId,
    pub symbol: Symbol,
    pub side: Side,
    pub price: Price,
    pub size: Quantity,
}

impl PriceLevel {
    /// Price-keyed level; the id is derived from side and price.
    pub fn new(symbol: Symbol, side: Side, price: Price, size: Quantity) -> Self {
        Self {
            id: LevelId::for_price(side, price),
            symbol,
            side,
            price,
            size,
        }
    }

    /// Level carrying an exchange-assigned id.
    pub fn with_id(
        id: impl Into<LevelId>,
        symbol: Symbol,
        side: Side,
        price: Price,
        size: Quantity,
    ) -> Self {
        Self {
            id: id.into(),
            symbol,
            side,
            price,
            size,
        }
    }

    /// Levels with zero size are logically deleted.
    pub fn is_empty(&self) -> bool {
        self.size.is_zero()
    }
}

/// An absolute level change from a price-keyed feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelChange {
    pub side: Side,
    pub price: Price,
    /// New total size at this price (0 = level removed).
    pub size: Quantity,
}

impl LevelChange {
    pub fn new(side: Side, price: Price, size: Quantity) -> Self {
        Self { side, price, size }
    }

    pub fn level_id(&self) -> LevelId {
        LevelId::for_price(self.side, self.price)
    }

    pub fn is_removal(&self) -> bool {
        self.size.is_zero()
    }

    pub fn into_level(self, symbol: Symbol) -> PriceLevel {
        PriceLevel::new(symbol, self.side, self.price, self.size)
    }
}

/// Incremental batch with disjoint insert/update/delete lists.
///
/// Applied deletes first, then updates, then inserts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    /// New ids; must not already exist.
    pub insert: Vec<PriceLevel>,
    /// Existing ids; only size and side are taken from these entries.
    pub update: Vec<PriceLevel>,
    /// Existing ids to remove.
    pub delete: Vec<LevelId>,
}

impl Delta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(mut self, level: PriceLevel) -> Self {
        self.insert.push(level);
        self
    }

    pub fn update(mut self, level: PriceLevel) -> Self {
        self.update.push(level);
        self
    }

    pub fn delete(mut self, id: impl Into<LevelId>) -> Self {
        self.delete.push(id.into());
        self
    }

    /// Total number of entries across the three lists.
    pub fn len(&self) -> usize {
        self.insert.len() + self.update.len() + self.delete.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Last applied position in a symbol's feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceState {
    /// Exchange update id (`u`). Consecutive deltas increase it by exactly one.
    pub update_id: u64,
    /// Exchange cross sequence (`seq`); informational, not contiguous.
    pub cross_seq: u64,
    /// Exchange timestamp of the message, Unix milliseconds.
    pub ts_ms: i64,
}

impl SequenceState {
    pub fn new(update_id: u64, cross_seq: u64, ts_ms: i64) -> Self {
        Self {
            update_id,
            cross_seq,
            ts_ms,
        }
    }

    /// The only update id a following delta may carry.
    pub fn expected_next(&self) -> Option<u64> {
        self.update_id.checked_add(1)
    }

    pub fn is_successor(&self, next: &SequenceState) -> bool {
        self.expected_next() == Some(next.update_id)
    }
}
