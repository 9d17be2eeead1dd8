//! Feed Session: per-symbol synchronization state machine
//!
//! ```text
//! Idle ──subscribe sent──▶ AwaitingSnapshot ──snapshot──▶ Synced
//!                               ▲                           │
//!                          ack  │        gap / anomalies /  │
//!                               │        reconnect          ▼
//!                               └────────────────────── Resyncing
//! any ──unsubscribe / shutdown──▶ Closed
//! ```
//!
//! The session is driven by the single feed loop. It owns the subscription
//! registry and turns decoded messages into reconciler calls plus the
//! requests the supervisor must send. Every state change happens on the
//! feed loop between two messages, so no delta can be applied after a gap
//! is detected and before the symbol leaves `Synced`.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};
use types::ids::Symbol;

use crate::decoder::{Ack, BookKind, BookMessage, FeedMessage};
use crate::level::PriceLevel;
use crate::metrics::FeedMetrics;
use crate::protocol::{Request, Topic};
use crate::reconciler::{ReconcileError, Reconciler};

/// Synchronization state of one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FeedState {
    /// Known but nothing requested or received yet.
    Idle,
    /// Subscribe sent; deltas are discarded until a snapshot lands.
    AwaitingSnapshot,
    /// Snapshot applied; deltas go to the reconciler in arrival order.
    Synced,
    /// Book no longer trusted; waiting for the re-subscribe to be acked.
    Resyncing,
    /// Unsubscribed or shut down.
    Closed,
}

impl FeedState {
    pub fn accepts_snapshot(&self) -> bool {
        !matches!(self, FeedState::Closed)
    }
}

impl fmt::Display for FeedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FeedState::Idle => "idle",
            FeedState::AwaitingSnapshot => "awaiting_snapshot",
            FeedState::Synced => "synced",
            FeedState::Resyncing => "resyncing",
            FeedState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Read-only view of every symbol's state, shareable across tasks.
#[derive(Debug, Clone, Default)]
pub struct SessionStates {
    inner: Arc<DashMap<Symbol, FeedState>>,
}

impl SessionStates {
    /// `Idle` for symbols never seen.
    pub fn get(&self, symbol: &Symbol) -> FeedState {
        self.inner
            .get(symbol)
            .map(|entry| *entry.value())
            .unwrap_or(FeedState::Idle)
    }

    /// All known symbols and their states, sorted by symbol.
    pub fn all(&self) -> Vec<(Symbol, FeedState)> {
        let mut states: Vec<(Symbol, FeedState)> = self
            .inner
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    fn set(&self, symbol: &Symbol, state: FeedState) -> FeedState {
        let previous = self.inner.insert(symbol.clone(), state);
        previous.unwrap_or(FeedState::Idle)
    }
}

/// Drives the reconciler from decoded feed messages.
pub struct FeedSession {
    reconciler: Reconciler,
    metrics: Arc<FeedMetrics>,
    states: SessionStates,
    /// Every active topic, replayed on reconnect.
    topics: BTreeSet<Topic>,
}

impl FeedSession {
    pub fn new(reconciler: Reconciler, metrics: Arc<FeedMetrics>) -> Self {
        Self {
            reconciler,
            metrics,
            states: SessionStates::default(),
            topics: BTreeSet::new(),
        }
    }

    pub fn states(&self) -> SessionStates {
        self.states.clone()
    }

    pub fn state(&self, symbol: &Symbol) -> FeedState {
        self.states.get(symbol)
    }

    pub fn metrics(&self) -> &Arc<FeedMetrics> {
        &self.metrics
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Active topics in a stable order.
    pub fn topics(&self) -> impl Iterator<Item = &Topic> {
        self.topics.iter()
    }

    /// Register `topic`. Returns the request to send when connected and the
    /// topic is new; while disconnected the topic waits for the next replay.
    pub fn subscribe(&mut self, topic: Topic, connected: bool) -> Option<Request> {
        if let Some(symbol) = topic.book_symbol() {
            if let Some(existing) = self.book_topic(symbol) {
                if existing != &topic {
                    warn!(
                        symbol = %symbol,
                        existing = %existing,
                        requested = %topic,
                        "Symbol already mirrored at another depth"
                    );
                }
                return None;
            }
        }
        if !self.topics.insert(topic.clone()) {
            return None;
        }

        if let Some(symbol) = topic.book_symbol() {
            self.reconciler.store().reset(symbol);
            let state = if connected {
                FeedState::AwaitingSnapshot
            } else {
                FeedState::Idle
            };
            self.states.set(symbol, state);
        }
        info!(topic = %topic, connected, "Topic subscribed");

        connected.then(|| Request::subscribe([&topic]))
    }

    /// Drop `topic`; its book is discarded and the symbol closed.
    pub fn unsubscribe(&mut self, topic: &Topic, connected: bool) -> Option<Request> {
        if !self.topics.remove(topic) {
            return None;
        }
        if let Some(symbol) = topic.book_symbol() {
            self.reconciler.store().discard(symbol);
            self.states.set(symbol, FeedState::Closed);
        }
        info!(topic = %topic, "Topic unsubscribed");

        connected.then(|| Request::unsubscribe([topic]))
    }

    /// A new connection is up: every book restarts from a fresh snapshot.
    ///
    /// Returns one subscribe request per active topic.
    pub fn on_connected(&mut self) -> Vec<Request> {
        let symbols: Vec<Symbol> = self.book_symbols().cloned().collect();
        for symbol in &symbols {
            self.reconciler.store().reset(symbol);
            let previous = self.states.get(symbol);
            let next = match previous {
                FeedState::Idle => FeedState::AwaitingSnapshot,
                _ => {
                    self.metrics.record_resync();
                    FeedState::Resyncing
                }
            };
            self.states.set(symbol, next);
            debug!(symbol = %symbol, from = %previous, to = %next, "Reset on connect");
        }

        self.topics
            .iter()
            .map(|topic| Request::subscribe([topic]))
            .collect()
    }

    /// The connection dropped: books stop updating until the next snapshot.
    ///
    /// Levels stay readable but are flagged stale.
    pub fn on_disconnected(&mut self) {
        let symbols: Vec<Symbol> = self.book_symbols().cloned().collect();
        for symbol in &symbols {
            if self.reconciler.store().contains(symbol) {
                self.reconciler
                    .store()
                    .write(symbol, |book| book.set_stale(true));
            }
        }
        debug!(books = symbols.len(), "Books marked stale on disconnect");
    }

    /// True while some book is waiting on a subscribe to be answered.
    pub fn awaiting_subscription(&self) -> bool {
        self.book_symbols().any(|symbol| {
            matches!(
                self.states.get(symbol),
                FeedState::AwaitingSnapshot | FeedState::Resyncing
            )
        })
    }

    /// Permanent shutdown: every tracked symbol is closed.
    pub fn close(&mut self) {
        for (symbol, _) in self.states.all() {
            self.states.set(&symbol, FeedState::Closed);
        }
    }

    /// Process one decoded message. Returns requests to send, in order.
    pub fn handle(&mut self, message: FeedMessage) -> Vec<Request> {
        match message {
            FeedMessage::Book(book) => self.handle_book(book),
            FeedMessage::Ack(ack) => {
                self.handle_ack(&ack);
                Vec::new()
            }
            FeedMessage::Pong => Vec::new(),
            FeedMessage::Other { topic } => {
                debug!(topic = %topic, "Ignoring non-book message");
                Vec::new()
            }
        }
    }

    fn handle_book(&mut self, message: BookMessage) -> Vec<Request> {
        let symbol = message.symbol.clone();
        if self.book_topic(&symbol).is_none() {
            debug!(symbol = %symbol, "Book message for unsubscribed symbol");
            self.metrics.record_discarded();
            return Vec::new();
        }

        let state = self.states.get(&symbol);
        match message.kind {
            BookKind::Snapshot if state.accepts_snapshot() => {
                let levels: Vec<PriceLevel> = message
                    .changes
                    .iter()
                    .map(|change| change.into_level(symbol.clone()))
                    .collect();
                self.reconciler
                    .apply_snapshot(&symbol, levels, message.sequence);
                self.metrics.record_snapshot();
                self.states.set(&symbol, FeedState::Synced);
                if state != FeedState::Synced {
                    info!(symbol = %symbol, from = %state, "Book synced");
                }
                Vec::new()
            }
            BookKind::Delta if state == FeedState::Synced => {
                let started = Instant::now();
                match self
                    .reconciler
                    .apply_changes(&symbol, &message.changes, message.sequence)
                {
                    Ok(outcome) => {
                        self.metrics
                            .record_delta(started.elapsed(), outcome.anomalies.len());
                        if outcome.resync_recommended {
                            warn!(symbol = %symbol, "Repeated anomalies, resyncing");
                            return self.begin_resync(&symbol, &message.topic);
                        }
                        Vec::new()
                    }
                    Err(ReconcileError::OutOfOrder { .. }) => {
                        self.metrics.record_out_of_order();
                        self.begin_resync(&symbol, &message.topic)
                    }
                }
            }
            _ => {
                debug!(
                    symbol = %symbol,
                    state = %state,
                    update_id = message.sequence.update_id,
                    "Discarding book message"
                );
                self.metrics.record_discarded();
                Vec::new()
            }
        }
    }

    fn handle_ack(&mut self, ack: &Ack) {
        if !ack.success {
            warn!(op = %ack.op, ret_msg = %ack.ret_msg, "Request rejected");
            return;
        }
        if ack.op != "subscribe" {
            return;
        }
        for (symbol, state) in self.states.all() {
            if state == FeedState::Resyncing {
                self.states.set(&symbol, FeedState::AwaitingSnapshot);
                debug!(symbol = %symbol, "Resubscribe acknowledged");
            }
        }
    }

    /// Leave `Synced`: keep the book readable but stale, and ask the
    /// exchange for a fresh snapshot by re-subscribing.
    fn begin_resync(&mut self, symbol: &Symbol, topic: &Topic) -> Vec<Request> {
        self.reconciler
            .store()
            .write(symbol, |book| book.set_stale(true));
        self.states.set(symbol, FeedState::Resyncing);
        self.metrics.record_resync();
        info!(symbol = %symbol, topic = %topic, "Resync requested");

        vec![Request::unsubscribe([topic]), Request::subscribe([topic])]
    }

    fn book_topic(&self, symbol: &Symbol) -> Option<&Topic> {
        self.topics
            .iter()
            .find(|topic| topic.book_symbol() == Some(symbol))
    }

    fn book_symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.topics.iter().filter_map(Topic::book_symbol)
    }
}
