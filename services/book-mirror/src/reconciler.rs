//! Reconciler: the only writer of the PriceLevel Store
//!
//! Applies decoded snapshots and deltas to the store under the symbol's
//! write lock, so a reader sees either the whole message applied or none of
//! it.
//!
//! Sequencing rule: a delta is accepted only if its update id is exactly the
//! stored update id plus one. Any other id (gap, duplicate, replay of an
//! older message) is `OutOfOrder` and leaves the book untouched. A snapshot
//! is authoritative and always accepted.
//!
//! Within a delta, deletes are applied first, then updates, then inserts.
//! Entries that violate their precondition are skipped and reported as
//! anomalies; the rest of the delta still applies.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};
use types::ids::{LevelId, Symbol};

use crate::level::{Delta, LevelChange, PriceLevel, SequenceState};
use crate::store::{Book, BookStore};

/// Errors that reject a whole message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    #[error("out-of-order delta for {symbol}: expected update {expected:?}, got {received}")]
    OutOfOrder {
        symbol: Symbol,
        /// None when no snapshot has been applied yet.
        expected: Option<u64>,
        received: u64,
    },
}

/// A delta entry skipped because its precondition did not hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Anomaly {
    /// Update for an id that is not in the book.
    UpdateUnknown(LevelId),
    /// Delete for an id that is not in the book.
    DeleteUnknown(LevelId),
    /// Insert for an id that is already in the book.
    InsertExisting(LevelId),
}

/// What a successfully sequenced delta did to the book.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub anomalies: Vec<Anomaly>,
    /// Set once anomalies have recurred on enough consecutive deltas that
    /// the book should no longer be trusted.
    pub resync_recommended: bool,
}

impl DeltaOutcome {
    /// Net change in level count.
    pub fn net_levels(&self) -> isize {
        self.inserted as isize - self.deleted as isize
    }
}

/// Applies snapshots and deltas to the shared store.
#[derive(Debug, Clone)]
pub struct Reconciler {
    store: Arc<BookStore>,
    /// Consecutive anomalous deltas before a resync is recommended (0 = never).
    anomaly_resync_threshold: u32,
}

impl Reconciler {
    pub fn new(store: Arc<BookStore>, anomaly_resync_threshold: u32) -> Self {
        Self {
            store,
            anomaly_resync_threshold,
        }
    }

    pub fn store(&self) -> &Arc<BookStore> {
        &self.store
    }

    /// Replace the symbol's book with `levels` and reset its sequence.
    ///
    /// Zero-size entries are dropped. Returns the number of levels installed.
    pub fn apply_snapshot(
        &self,
        symbol: &Symbol,
        levels: Vec<PriceLevel>,
        sequence: SequenceState,
    ) -> usize {
        let installed = self.store.write(symbol, |book| {
            book.replace_all(levels.into_iter().filter(|level| !level.is_empty()));
            book.set_sequence(sequence);
            book.set_stale(false);
            book.reset_anomalies();
            book.len()
        });

        info!(
            symbol = %symbol,
            update_id = sequence.update_id,
            cross_seq = sequence.cross_seq,
            levels = installed,
            "Snapshot applied"
        );
        installed
    }

    /// Apply an explicit insert/update/delete batch.
    pub fn apply_delta(
        &self,
        symbol: &Symbol,
        delta: &Delta,
        sequence: SequenceState,
    ) -> Result<DeltaOutcome, ReconcileError> {
        self.store.write(symbol, |book| -> Result<DeltaOutcome, ReconcileError> {
            check_sequence(book, symbol, &sequence)?;
            Ok(self.commit(book, symbol, delta, sequence))
        })
    }

    /// Apply absolute price-keyed changes.
    ///
    /// Each change is classified against the book under the same write lock:
    /// zero size deletes, a known level is updated, an unknown one inserted.
    pub fn apply_changes(
        &self,
        symbol: &Symbol,
        changes: &[LevelChange],
        sequence: SequenceState,
    ) -> Result<DeltaOutcome, ReconcileError> {
        self.store.write(symbol, |book| -> Result<DeltaOutcome, ReconcileError> {
            check_sequence(book, symbol, &sequence)?;
            let delta = classify(book, symbol, changes);
            Ok(self.commit(book, symbol, &delta, sequence))
        })
    }

    fn commit(
        &self,
        book: &mut Book,
        symbol: &Symbol,
        delta: &Delta,
        sequence: SequenceState,
    ) -> DeltaOutcome {
        let mut outcome = apply_lists(book, delta);
        book.set_sequence(sequence);

        let streak = book.record_anomalies(!outcome.anomalies.is_empty());
        if !outcome.anomalies.is_empty() {
            warn!(
                symbol = %symbol,
                update_id = sequence.update_id,
                anomalies = outcome.anomalies.len(),
                streak,
                "Delta entries skipped on precondition violation"
            );
        }
        outcome.resync_recommended =
            self.anomaly_resync_threshold > 0 && streak >= self.anomaly_resync_threshold;

        debug!(
            symbol = %symbol,
            update_id = sequence.update_id,
            inserted = outcome.inserted,
            updated = outcome.updated,
            deleted = outcome.deleted,
            "Delta applied"
        );
        outcome
    }
}

fn check_sequence(
    book: &Book,
    symbol: &Symbol,
    sequence: &SequenceState,
) -> Result<(), ReconcileError> {
    let expected = book.sequence().and_then(|current| current.expected_next());
    if expected == Some(sequence.update_id) {
        return Ok(());
    }

    warn!(
        symbol = %symbol,
        expected = ?expected,
        received = sequence.update_id,
        "Out-of-order delta rejected"
    );
    Err(ReconcileError::OutOfOrder {
        symbol: symbol.clone(),
        expected,
        received: sequence.update_id,
    })
}

/// Deletes, then updates, then inserts.
fn apply_lists(book: &mut Book, delta: &Delta) -> DeltaOutcome {
    let mut outcome = DeltaOutcome::default();

    for id in &delta.delete {
        match book.remove(id) {
            Some(_) => outcome.deleted += 1,
            None => outcome.anomalies.push(Anomaly::DeleteUnknown(id.clone())),
        }
    }

    for level in &delta.update {
        if !book.contains(&level.id) {
            let anomaly = if level.is_empty() {
                Anomaly::DeleteUnknown(level.id.clone())
            } else {
                Anomaly::UpdateUnknown(level.id.clone())
            };
            outcome.anomalies.push(anomaly);
            continue;
        }

        if level.is_empty() {
            book.remove(&level.id);
            outcome.deleted += 1;
        } else {
            book.put(level.clone());
            outcome.updated += 1;
        }
    }

    for level in &delta.insert {
        if level.is_empty() {
            continue;
        }
        if book.contains(&level.id) {
            outcome.anomalies.push(Anomaly::InsertExisting(level.id.clone()));
            continue;
        }
        book.put(level.clone());
        outcome.inserted += 1;
    }

    outcome
}

/// Split price-keyed changes into delta lists against the current book.
///
/// Repeated entries for the same price collapse to the last one, which is
/// the absolute size the exchange ended the batch with. A price added and
/// then removed within the batch nets out to nothing.
fn classify(book: &Book, symbol: &Symbol, changes: &[LevelChange]) -> Delta {
    let mut order: Vec<LevelId> = Vec::with_capacity(changes.len());
    let mut latest: HashMap<LevelId, LevelChange> = HashMap::with_capacity(changes.len());
    let mut added: HashSet<LevelId> = HashSet::new();
    for change in changes {
        let id = change.level_id();
        if !change.is_removal() {
            added.insert(id.clone());
        }
        if latest.insert(id.clone(), *change).is_none() {
            order.push(id);
        }
    }

    let mut delta = Delta::new();
    for id in order {
        let Some(change) = latest.remove(&id) else {
            continue;
        };
        if change.is_removal() {
            if book.contains(&id) || !added.contains(&id) {
                delta.delete.push(id);
            }
        } else if book.contains(&id) {
            delta.update.push(change.into_level(symbol.clone()));
        } else {
            delta.insert.push(change.into_level(symbol.clone()));
        }
    }
    delta
}
