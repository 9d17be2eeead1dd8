//! Synchronization engine tests
//!
//! Exercises the decoder → session → reconciler → store → view path:
//! - Depth ordering with price ties
//! - Top-of-book before and after a zero-size update
//! - Out-of-order rejection and resync
//! - Concurrent readers never observing a half-applied delta

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use book_mirror::decoder::decode;
use book_mirror::level::{Delta, LevelChange, PriceLevel, SequenceState};
use book_mirror::metrics::FeedMetrics;
use book_mirror::protocol::{Op, Topic};
use book_mirror::reconciler::{ReconcileError, Reconciler};
use book_mirror::view::ViewError;
use book_mirror::{BookStore, FeedSession, FeedState, ViewBuilder};
use serde_json::json;
use types::ids::{LevelId, Symbol};
use types::numeric::{Price, Quantity};
use types::order::Side;

fn btc() -> Symbol {
    Symbol::new("BTCUSDT")
}

fn price(s: &str) -> Price {
    Price::from_str(s).unwrap()
}

fn qty(s: &str) -> Quantity {
    Quantity::from_str(s).unwrap()
}

fn frame(kind: &str, update_id: u64, bids: &[(&str, &str)], asks: &[(&str, &str)]) -> String {
    json!({
        "topic": "orderbook.50.BTCUSDT",
        "type": kind,
        "ts": 1_700_000_000_000i64 + update_id as i64,
        "data": {
            "s": "BTCUSDT",
            "b": bids.iter().map(|(p, s)| [*p, *s]).collect::<Vec<_>>(),
            "a": asks.iter().map(|(p, s)| [*p, *s]).collect::<Vec<_>>(),
            "u": update_id,
            "seq": update_id * 7,
        }
    })
    .to_string()
}

fn subscribed_session() -> (FeedSession, Arc<BookStore>) {
    let store = Arc::new(BookStore::new());
    let mut session = FeedSession::new(
        Reconciler::new(Arc::clone(&store), 3),
        Arc::new(FeedMetrics::new()),
    );
    session.subscribe(Topic::order_book(50, btc()), true);
    (session, store)
}

fn feed(session: &mut FeedSession, text: &str) -> Vec<book_mirror::protocol::Request> {
    session.handle(decode(text).unwrap())
}

// ============================================================================
// Ordering
// ============================================================================

#[test]
fn test_snapshot_sorted_bids_desc_asks_asc() {
    let (mut session, store) = subscribed_session();
    feed(
        &mut session,
        &frame(
            "snapshot",
            1,
            &[("99.5", "1"), ("101", "2"), ("100", "3"), ("98.25", "4")],
            &[("103", "1"), ("101.5", "2"), ("102", "3")],
        ),
    );

    let book = ViewBuilder::new(store).build_book(&btc()).unwrap();
    let bids: Vec<Price> = book.bids.iter().map(|l| l.price).collect();
    let asks: Vec<Price> = book.asks.iter().map(|l| l.price).collect();

    assert_eq!(bids, vec![price("101"), price("100"), price("99.5"), price("98.25")]);
    assert_eq!(asks, vec![price("101.5"), price("102"), price("103")]);
    assert!(bids.windows(2).all(|w| w[0] > w[1]));
    assert!(asks.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_equal_prices_keep_insertion_order() {
    // Exchange-assigned ids can share a price; order falls back to arrival.
    let store = Arc::new(BookStore::new());
    let reconciler = Reconciler::new(Arc::clone(&store), 0);
    let level = |id: u64, size: &str| {
        PriceLevel::with_id(id, btc(), Side::Sell, price("200"), qty(size))
    };
    reconciler.apply_snapshot(
        &btc(),
        vec![level(30, "1"), level(10, "2")],
        SequenceState::new(1, 1, 0),
    );
    reconciler
        .apply_delta(&btc(), &Delta::new().insert(level(20, "3")), SequenceState::new(2, 2, 0))
        .unwrap();

    let book = ViewBuilder::new(store).build_book(&btc()).unwrap();
    let sizes: Vec<Quantity> = book.asks.iter().map(|l| l.size).collect();
    assert_eq!(sizes, vec![qty("1"), qty("2"), qty("3")]);
}

// ============================================================================
// Top of book
// ============================================================================

#[test]
fn test_ticker_then_zero_size_update_removes_best_bid() {
    let store = Arc::new(BookStore::new());
    let reconciler = Reconciler::new(Arc::clone(&store), 3);
    let views = ViewBuilder::new(Arc::clone(&store));

    reconciler.apply_snapshot(
        &btc(),
        vec![
            PriceLevel::new(btc(), Side::Buy, price("100.0"), qty("2")),
            PriceLevel::new(btc(), Side::Buy, price("99.5"), qty("1")),
            PriceLevel::new(btc(), Side::Sell, price("100.5"), qty("3")),
        ],
        SequenceState::new(1, 1, 0),
    );

    let ticker = views.build_ticker(&btc()).unwrap();
    assert_eq!(ticker.bid_price, price("100.0"));
    assert_eq!(ticker.bid_size, qty("2"));
    assert_eq!(ticker.ask_price, price("100.5"));
    assert_eq!(ticker.ask_size, qty("3"));

    let id = LevelId::for_price(Side::Buy, price("100.0"));
    let delta = Delta::new().update(PriceLevel::with_id(
        id.clone(),
        btc(),
        Side::Buy,
        price("100.0"),
        qty("0"),
    ));
    let outcome = reconciler
        .apply_delta(&btc(), &delta, SequenceState::new(2, 2, 0))
        .unwrap();
    assert_eq!(outcome.deleted, 1);
    assert!(store.get(&btc(), &id).is_none());

    let ticker = views.build_ticker(&btc()).unwrap();
    assert_eq!(ticker.bid_price, price("99.5"));
    assert_eq!(ticker.bid_size, qty("1"));
    assert_eq!(ticker.ask_price, price("100.5"));
}

#[test]
fn test_same_example_over_the_wire() {
    let (mut session, store) = subscribed_session();
    let views = ViewBuilder::new(store);

    feed(
        &mut session,
        &frame("snapshot", 10, &[("100.0", "2"), ("99.5", "1")], &[("100.5", "3")]),
    );
    let ticker = views.build_ticker(&btc()).unwrap();
    assert_eq!((ticker.bid_price, ticker.bid_size), (price("100.0"), qty("2")));
    assert_eq!((ticker.ask_price, ticker.ask_size), (price("100.5"), qty("3")));

    feed(&mut session, &frame("delta", 11, &[("100", "0")], &[]));
    let ticker = views.build_ticker(&btc()).unwrap();
    assert_eq!((ticker.bid_price, ticker.bid_size), (price("99.5"), qty("1")));
}

#[test]
fn test_ticker_reports_no_liquidity() {
    let (mut session, store) = subscribed_session();
    let views = ViewBuilder::new(store);

    // Subscribed but nothing received yet.
    assert!(matches!(
        views.build_ticker(&btc()),
        Err(ViewError::NoLiquidity { .. })
    ));

    feed(&mut session, &frame("snapshot", 1, &[("100", "1")], &[]));
    assert!(matches!(
        views.build_ticker(&btc()),
        Err(ViewError::NoLiquidity { asks_empty: true, bids_empty: false, .. })
    ));
    assert!(matches!(
        views.build_ticker(&Symbol::new("ETHUSDT")),
        Err(ViewError::UnknownSymbol(_))
    ));
}

// ============================================================================
// Sequencing
// ============================================================================

#[test]
fn test_gap_rejected_store_unchanged_and_resyncing() {
    let (mut session, store) = subscribed_session();
    feed(&mut session, &frame("snapshot", 10, &[("100", "1")], &[("101", "1")]));
    feed(&mut session, &frame("delta", 11, &[("99", "1")], &[]));
    let before = store.snapshot_view(&btc()).unwrap();

    let requests = feed(&mut session, &frame("delta", 13, &[("98", "1")], &[("101", "0")]));

    let after = store.snapshot_view(&btc()).unwrap();
    assert_eq!(after.levels, before.levels);
    assert_eq!(after.sequence, before.sequence);
    assert!(after.stale);
    assert_eq!(session.state(&btc()), FeedState::Resyncing);

    let ops: Vec<Op> = requests.iter().map(|r| r.op).collect();
    assert_eq!(ops, vec![Op::Unsubscribe, Op::Subscribe]);
    assert!(requests.iter().all(|r| r.args == vec!["orderbook.50.BTCUSDT".to_string()]));
}

#[test]
fn test_reconciler_rejects_duplicate_and_stale_ids() {
    let store = Arc::new(BookStore::new());
    let reconciler = Reconciler::new(Arc::clone(&store), 0);
    let change = [LevelChange::new(Side::Buy, price("1"), qty("1"))];

    let err = reconciler
        .apply_changes(&btc(), &change, SequenceState::new(5, 0, 0))
        .unwrap_err();
    assert_eq!(
        err,
        ReconcileError::OutOfOrder {
            symbol: btc(),
            expected: None,
            received: 5
        }
    );

    reconciler.apply_snapshot(&btc(), vec![], SequenceState::new(5, 0, 0));
    for stale in [3, 5] {
        assert!(matches!(
            reconciler.apply_changes(&btc(), &change, SequenceState::new(stale, 0, 0)),
            Err(ReconcileError::OutOfOrder { expected: Some(6), .. })
        ));
    }
    assert!(reconciler
        .apply_changes(&btc(), &change, SequenceState::new(6, 0, 0))
        .is_ok());
}

#[test]
fn test_resync_serves_last_book_until_snapshot() {
    let (mut session, store) = subscribed_session();
    let views = ViewBuilder::new(store);
    feed(&mut session, &frame("snapshot", 1, &[("100", "1")], &[("101", "1")]));
    feed(&mut session, &frame("delta", 5, &[], &[]));

    let stale = views.build_book(&btc()).unwrap();
    assert!(stale.stale);
    assert_eq!(stale.bids.len(), 1);

    feed(&mut session, &frame("snapshot", 9, &[("90", "1")], &[("91", "1")]));
    let fresh = views.build_book(&btc()).unwrap();
    assert!(!fresh.stale);
    assert_eq!(fresh.best_bid().unwrap().price, price("90"));
    assert_eq!(session.state(&btc()), FeedState::Synced);
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_concurrent_readers_never_see_torn_deltas() {
    const DELTAS: u64 = 2_000;
    const READERS: usize = 6;

    let store = Arc::new(BookStore::new());
    let reconciler = Reconciler::new(Arc::clone(&store), 0);
    reconciler.apply_snapshot(
        &btc(),
        vec![
            PriceLevel::new(btc(), Side::Buy, price("100"), qty("1")),
            PriceLevel::new(btc(), Side::Sell, price("101"), qty("1")),
        ],
        SequenceState::new(0, 0, 0),
    );

    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let views = ViewBuilder::new(Arc::clone(&store));
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut reads = 0u64;
                while !done.load(Ordering::Acquire) {
                    let book = views.build_book(&btc()).unwrap();
                    let best_bid = book.best_bid().unwrap();
                    let best_ask = book.best_ask().unwrap();

                    // Each delta moves both sides together.
                    assert_eq!(book.bids.len(), book.asks.len());
                    assert!(best_bid.price < best_ask.price);
                    assert_eq!(best_bid.size, best_ask.size);
                    reads += 1;
                }
                reads
            })
        })
        .collect();

    let writer = {
        let reconciler = reconciler.clone();
        thread::spawn(move || {
            for k in 1..=DELTAS {
                let mut changes = vec![
                    LevelChange::new(Side::Buy, Price::from_u64(100), Quantity::from_u64(k + 1)),
                    LevelChange::new(Side::Sell, Price::from_u64(101), Quantity::from_u64(k + 1)),
                    LevelChange::new(Side::Buy, Price::from_u64(50 + k % 40), Quantity::from_u64(1)),
                    LevelChange::new(Side::Sell, Price::from_u64(150 + k % 40), Quantity::from_u64(1)),
                ];
                if k > 1 {
                    let prev = k - 1;
                    changes.push(LevelChange::new(
                        Side::Buy,
                        Price::from_u64(50 + prev % 40),
                        Quantity::ZERO,
                    ));
                    changes.push(LevelChange::new(
                        Side::Sell,
                        Price::from_u64(150 + prev % 40),
                        Quantity::ZERO,
                    ));
                }
                reconciler
                    .apply_changes(&btc(), &changes, SequenceState::new(k, k, k as i64))
                    .unwrap();
            }
        })
    };

    writer.join().unwrap();
    done.store(true, Ordering::Release);
    let total_reads: u64 = readers.into_iter().map(|r| r.join().unwrap()).sum();
    assert!(total_reads > 0);

    let book = ViewBuilder::new(Arc::clone(&store)).build_book(&btc()).unwrap();
    assert_eq!(book.sequence.unwrap().update_id, DELTAS);
    assert_eq!(book.bids.len(), 2);
    assert_eq!(book.asks.len(), 2);
    assert_eq!(book.best_bid().unwrap().size, Quantity::from_u64(DELTAS + 1));
}

#[test]
fn test_symbols_are_independent() {
    let store = Arc::new(BookStore::new());
    let reconciler = Reconciler::new(Arc::clone(&store), 0);
    let eth = Symbol::new("ETHUSDT");

    reconciler.apply_snapshot(&btc(), vec![], SequenceState::new(100, 0, 0));
    reconciler.apply_snapshot(&eth, vec![], SequenceState::new(7, 0, 0));

    // A gap on one symbol leaves the other untouched.
    assert!(reconciler
        .apply_changes(&btc(), &[], SequenceState::new(200, 0, 0))
        .is_err());
    assert!(reconciler
        .apply_changes(&eth, &[], SequenceState::new(8, 0, 0))
        .is_ok());
    assert_eq!(store.symbols(), vec![btc(), eth]);
}
