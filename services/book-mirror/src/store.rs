//! PriceLevel Store
//!
//! Keeps the live levels of every mirrored symbol. Each symbol's `Book`
//! sits behind its own `RwLock`, so writers on one symbol never block
//! readers or writers on another, and a reader holding the lock always sees
//! a book between two complete mutations.
//!
//! Reads hand out `BookView`, an owned copy taken under the read lock;
//! later writes cannot change it.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use dashmap::DashMap;
use serde::Serialize;
use types::ids::{LevelId, Symbol};
use types::order::Side;

use crate::level::{PriceLevel, SequenceState};

/// A stored level plus its insertion ordinal, used to break price ties.
#[derive(Debug, Clone)]
struct Slot {
    level: PriceLevel,
    ordinal: u64,
}

/// The live levels of one symbol and its sequencing state.
#[derive(Debug)]
pub struct Book {
    symbol: Symbol,
    levels: BTreeMap<LevelId, Slot>,
    next_ordinal: u64,
    sequence: Option<SequenceState>,
    /// Set while a resync is pending; the levels are the last consistent state.
    stale: bool,
    /// Consecutive deltas that carried at least one precondition violation.
    anomaly_streak: u32,
}

impl Book {
    pub fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            levels: BTreeMap::new(),
            next_ordinal: 0,
            sequence: None,
            stale: false,
            anomaly_streak: 0,
        }
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn get(&self, id: &LevelId) -> Option<&PriceLevel> {
        self.levels.get(id).map(|slot| &slot.level)
    }

    pub fn contains(&self, id: &LevelId) -> bool {
        self.levels.contains_key(id)
    }

    /// Insert a new level, or overwrite size and side of an existing one.
    ///
    /// An existing level keeps its original price and insertion position.
    pub fn put(&mut self, level: PriceLevel) {
        match self.levels.get_mut(&level.id) {
            Some(slot) => {
                slot.level.size = level.size;
                slot.level.side = level.side;
            }
            None => {
                let ordinal = self.next_ordinal;
                self.next_ordinal += 1;
                self.levels.insert(level.id.clone(), Slot { level, ordinal });
            }
        }
    }

    pub fn remove(&mut self, id: &LevelId) -> Option<PriceLevel> {
        self.levels.remove(id).map(|slot| slot.level)
    }

    /// Discard every level and install `levels` in the given order.
    pub fn replace_all(&mut self, levels: impl IntoIterator<Item = PriceLevel>) {
        self.levels.clear();
        self.next_ordinal = 0;
        for level in levels {
            self.put(level);
        }
    }

    /// Empty the book and forget its sequencing state.
    pub fn clear(&mut self) {
        self.levels.clear();
        self.next_ordinal = 0;
        self.sequence = None;
        self.stale = false;
        self.anomaly_streak = 0;
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn side_count(&self, side: Side) -> usize {
        self.levels
            .values()
            .filter(|slot| slot.level.side == side)
            .count()
    }

    pub fn sequence(&self) -> Option<SequenceState> {
        self.sequence
    }

    pub fn set_sequence(&mut self, sequence: SequenceState) {
        self.sequence = Some(sequence);
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn set_stale(&mut self, stale: bool) {
        self.stale = stale;
    }

    /// Record whether the latest delta hit precondition violations.
    /// Returns the updated streak.
    pub fn record_anomalies(&mut self, had_anomalies: bool) -> u32 {
        if had_anomalies {
            self.anomaly_streak += 1;
        } else {
            self.anomaly_streak = 0;
        }
        self.anomaly_streak
    }

    pub fn reset_anomalies(&mut self) {
        self.anomaly_streak = 0;
    }

    /// Immutable copy of the current state, levels in insertion order.
    pub fn view(&self) -> BookView {
        let mut slots: Vec<&Slot> = self.levels.values().collect();
        slots.sort_by_key(|slot| slot.ordinal);

        BookView {
            symbol: self.symbol.clone(),
            levels: slots.into_iter().map(|slot| slot.level.clone()).collect(),
            sequence: self.sequence,
            stale: self.stale,
        }
    }
}

/// Point-in-time copy of a book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookView {
    pub symbol: Symbol,
    /// All live levels, both sides, in insertion order.
    pub levels: Vec<PriceLevel>,
    pub sequence: Option<SequenceState>,
    pub stale: bool,
}

impl BookView {
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn side(&self, side: Side) -> impl Iterator<Item = &PriceLevel> {
        self.levels.iter().filter(move |level| level.side == side)
    }
}

type SharedBook = Arc<RwLock<Book>>;

/// All mirrored books, one lock per symbol.
#[derive(Debug, Default)]
pub struct BookStore {
    books: DashMap<Symbol, SharedBook>,
}

impl BookStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty book for `symbol` if none exists.
    pub fn ensure(&self, symbol: &Symbol) {
        self.shared_or_create(symbol);
    }

    pub fn contains(&self, symbol: &Symbol) -> bool {
        self.books.contains_key(symbol)
    }

    /// Registered symbols, sorted.
    pub fn symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = self.books.iter().map(|e| e.key().clone()).collect();
        symbols.sort();
        symbols
    }

    pub fn get(&self, symbol: &Symbol, id: &LevelId) -> Option<PriceLevel> {
        self.read(symbol, |book| book.get(id).cloned()).flatten()
    }

    pub fn put(&self, symbol: &Symbol, level: PriceLevel) {
        self.write(symbol, |book| book.put(level));
    }

    pub fn remove(&self, symbol: &Symbol, id: &LevelId) -> Option<PriceLevel> {
        self.write(symbol, |book| book.remove(id))
    }

    pub fn replace_all(&self, symbol: &Symbol, levels: Vec<PriceLevel>) {
        self.write(symbol, |book| book.replace_all(levels));
    }

    /// Owned copy of the symbol's book, or None if it is not mirrored.
    pub fn snapshot_view(&self, symbol: &Symbol) -> Option<BookView> {
        self.read(symbol, Book::view)
    }

    /// Empty the book but keep the symbol registered.
    pub fn reset(&self, symbol: &Symbol) {
        self.write(symbol, Book::clear);
    }

    /// Drop the symbol's book entirely. Returns whether it existed.
    pub fn discard(&self, symbol: &Symbol) -> bool {
        self.books.remove(symbol).is_some()
    }

    /// Run `f` under the symbol's write lock, creating the book if needed.
    ///
    /// Everything `f` does is observed by readers as one step.
    pub fn write<R>(&self, symbol: &Symbol, f: impl FnOnce(&mut Book) -> R) -> R {
        let shared = self.shared_or_create(symbol);
        let mut book = write_lock(&shared);
        f(&mut book)
    }

    /// Run `f` under the symbol's read lock. None if the symbol is unknown.
    pub fn read<R>(&self, symbol: &Symbol, f: impl FnOnce(&Book) -> R) -> Option<R> {
        let shared = self.shared(symbol)?;
        let book = read_lock(&shared);
        Some(f(&book))
    }

    // The map guard is released before the book lock is taken, so a slow
    // book never holds up lookups for other symbols.
    fn shared(&self, symbol: &Symbol) -> Option<SharedBook> {
        self.books.get(symbol).map(|entry| Arc::clone(entry.value()))
    }

    fn shared_or_create(&self, symbol: &Symbol) -> SharedBook {
        if let Some(shared) = self.shared(symbol) {
            return shared;
        }
        let entry = self
            .books
            .entry(symbol.clone())
            .or_insert_with(|| Arc::new(RwLock::new(Book::new(symbol.clone()))));
        Arc::clone(entry.value())
    }
}

fn read_lock(book: &RwLock<Book>) -> RwLockReadGuard<'_, Book> {
    book.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock(book: &RwLock<Book>) -> RwLockWriteGuard<'_, Book> {
    book.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::numeric::{Price, Quantity};

    fn btc() -> Symbol {
        Symbol::new("BTCUSDT")
    }

    fn level(id: u64, side: Side, price: u64, size: u64) -> PriceLevel {
        PriceLevel::with_id(
            id,
            btc(),
            side,
            Price::from_u64(price),
            Quantity::from_u64(size),
        )
    }

    #[test]
    fn test_empty_store() {
        let store = BookStore::new();
        assert!(store.snapshot_view(&btc()).is_none());
        assert!(store.get(&btc(), &LevelId::from(1u64)).is_none());
        assert!(store.symbols().is_empty());
    }

    #[test]
    fn test_put_and_get() {
        let store = BookStore::new();
        store.put(&btc(), level(1, Side::Buy, 100, 2));

        let got = store.get(&btc(), &LevelId::from(1u64)).unwrap();
        assert_eq!(got.price, Price::from_u64(100));
        assert_eq!(got.size, Quantity::from_u64(2));
        assert_eq!(store.symbols(), vec![btc()]);
    }

    #[test]
    fn test_put_existing_keeps_price() {
        let store = BookStore::new();
        store.put(&btc(), level(1, Side::Buy, 100, 2));
        store.put(&btc(), level(1, Side::Sell, 999, 5));

        let got = store.get(&btc(), &LevelId::from(1u64)).unwrap();
        assert_eq!(got.price, Price::from_u64(100));
        assert_eq!(got.side, Side::Sell);
        assert_eq!(got.size, Quantity::from_u64(5));
    }

    #[test]
    fn test_remove() {
        let store = BookStore::new();
        store.put(&btc(), level(1, Side::Buy, 100, 2));

        assert!(store.remove(&btc(), &LevelId::from(1u64)).is_some());
        assert!(store.remove(&btc(), &LevelId::from(1u64)).is_none());
        assert!(store.snapshot_view(&btc()).unwrap().is_empty());
    }

    #[test]
    fn test_replace_all_discards_previous() {
        let store = BookStore::new();
        store.put(&btc(), level(1, Side::Buy, 100, 2));
        store.replace_all(
            &btc(),
            vec![level(7, Side::Sell, 101, 1), level(8, Side::Buy, 99, 1)],
        );

        let view = store.snapshot_view(&btc()).unwrap();
        assert_eq!(view.len(), 2);
        assert!(store.get(&btc(), &LevelId::from(1u64)).is_none());
        assert_eq!(view.levels[0].id, LevelId::from(7u64));
        assert_eq!(view.levels[1].id, LevelId::from(8u64));
    }

    #[test]
    fn test_view_is_detached_from_later_writes() {
        let store = BookStore::new();
        store.put(&btc(), level(1, Side::Buy, 100, 2));
        let view = store.snapshot_view(&btc()).unwrap();

        store.put(&btc(), level(2, Side::Buy, 99, 1));
        store.remove(&btc(), &LevelId::from(1u64));

        assert_eq!(view.len(), 1);
        assert_eq!(view.levels[0].id, LevelId::from(1u64));
    }

    #[test]
    fn test_view_preserves_insertion_order() {
        let store = BookStore::new();
        for id in [5u64, 3, 9, 1] {
            store.put(&btc(), level(id, Side::Buy, 100, 1));
        }
        let ids: Vec<String> = store
            .snapshot_view(&btc())
            .unwrap()
            .levels
            .iter()
            .map(|l| l.id.to_string())
            .collect();
        assert_eq!(ids, vec!["5", "3", "9", "1"]);
    }

    #[test]
    fn test_reset_clears_sequence() {
        let store = BookStore::new();
        store.write(&btc(), |book| {
            book.put(level(1, Side::Buy, 100, 2));
            book.set_sequence(SequenceState::new(4, 10, 0));
            book.set_stale(true);
        });

        store.reset(&btc());
        let view = store.snapshot_view(&btc()).unwrap();
        assert!(view.is_empty());
        assert!(view.sequence.is_none());
        assert!(!view.stale);
    }

    #[test]
    fn test_discard() {
        let store = BookStore::new();
        store.ensure(&btc());
        assert!(store.contains(&btc()));
        assert!(store.discard(&btc()));
        assert!(!store.discard(&btc()));
        assert!(store.snapshot_view(&btc()).is_none());
    }

    #[test]
    fn test_side_counts() {
        let store = BookStore::new();
        store.put(&btc(), level(1, Side::Buy, 100, 1));
        store.put(&btc(), level(2, Side::Buy, 99, 1));
        store.put(&btc(), level(3, Side::Sell, 101, 1));

        let (bids, asks) = store
            .read(&btc(), |book| (book.side_count(Side::Buy), book.side_count(Side::Sell)))
            .unwrap();
        assert_eq!((bids, asks), (2, 1));
    }

    #[test]
    fn test_symbols_are_independent() {
        let store = BookStore::new();
        let eth = Symbol::new("ETHUSDT");
        store.put(&btc(), level(1, Side::Buy, 100, 1));
        store.put(&eth, level(1, Side::Sell, 2000, 3));

        store.reset(&btc());
        assert!(store.snapshot_view(&btc()).unwrap().is_empty());
        assert_eq!(store.snapshot_view(&eth).unwrap().len(), 1);
        assert_eq!(store.symbols(), vec![btc(), eth]);
    }

    #[test]
    fn test_anomaly_streak() {
        let mut book = Book::new(btc());
        assert_eq!(book.record_anomalies(true), 1);
        assert_eq!(book.record_anomalies(true), 2);
        assert_eq!(book.record_anomalies(false), 0);
    }
}
