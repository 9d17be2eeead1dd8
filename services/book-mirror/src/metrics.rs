//! Feed loop counters
//!
//! Updated by the single feed loop, readable from any task. Counters are
//! relaxed atomics; the latency window sits behind a mutex.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;

const LATENCY_WINDOW: usize = 1024;

/// Counters for one connection's feed loop.
#[derive(Debug)]
pub struct FeedMetrics {
    pub snapshots_applied: AtomicU64,
    pub deltas_applied: AtomicU64,
    /// Deltas dropped while a symbol was waiting for a snapshot.
    pub deltas_discarded: AtomicU64,
    pub out_of_order: AtomicU64,
    pub anomalies: AtomicU64,
    pub resyncs: AtomicU64,
    pub decode_errors: AtomicU64,
    pub reconnects: AtomicU64,
    apply_latency_ns: Mutex<LatencyTracker>,
}

impl FeedMetrics {
    pub fn new() -> Self {
        Self {
            snapshots_applied: AtomicU64::new(0),
            deltas_applied: AtomicU64::new(0),
            deltas_discarded: AtomicU64::new(0),
            out_of_order: AtomicU64::new(0),
            anomalies: AtomicU64::new(0),
            resyncs: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            apply_latency_ns: Mutex::new(LatencyTracker::new(LATENCY_WINDOW)),
        }
    }

    pub fn record_snapshot(&self) {
        self.snapshots_applied.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an applied delta and how long the write took.
    pub fn record_delta(&self, elapsed: Duration, anomalies: usize) {
        self.deltas_applied.fetch_add(1, Ordering::Relaxed);
        self.anomalies.fetch_add(anomalies as u64, Ordering::Relaxed);
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.apply_latency_ns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(nanos);
    }

    pub fn record_discarded(&self) {
        self.deltas_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_out_of_order(&self) {
        self.out_of_order.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resync(&self) {
        self.resyncs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Delta apply latency over the recent window.
    pub fn apply_latency(&self) -> LatencySummary {
        self.apply_latency_ns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .summary()
    }

    /// Flat name → value map of every counter.
    pub fn export(&self) -> BTreeMap<&'static str, u64> {
        let counters = [
            ("snapshots_applied", &self.snapshots_applied),
            ("deltas_applied", &self.deltas_applied),
            ("deltas_discarded", &self.deltas_discarded),
            ("out_of_order", &self.out_of_order),
            ("anomalies", &self.anomalies),
            ("resyncs", &self.resyncs),
            ("decode_errors", &self.decode_errors),
            ("reconnects", &self.reconnects),
        ];
        counters
            .into_iter()
            .map(|(name, counter)| (name, counter.load(Ordering::Relaxed)))
            .collect()
    }
}

impl Default for FeedMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time latency figures, nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LatencySummary {
    pub count: usize,
    pub mean: u64,
    pub p50: u64,
    pub p99: u64,
    pub max: u64,
}

/// Sliding window of latency samples.
#[derive(Debug)]
pub struct LatencyTracker {
    samples: VecDeque<u64>,
    max_samples: usize,
}

impl LatencyTracker {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples: max_samples.max(1),
        }
    }

    pub fn record(&mut self, value: u64) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Percentile (0-100) by nearest rank over the window.
    pub fn percentile(&self, p: usize) -> Option<u64> {
        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_unstable();
        let idx = (p.min(100) as f64 / 100.0 * (sorted.len() - 1) as f64) as usize;
        sorted.get(idx).copied()
    }

    pub fn average(&self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: u128 = self.samples.iter().map(|&s| s as u128).sum();
        Some((sum / self.samples.len() as u128) as u64)
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }

    pub fn summary(&self) -> LatencySummary {
        LatencySummary {
            count: self.count(),
            mean: self.average().unwrap_or(0),
            p50: self.percentile(50).unwrap_or(0),
            p99: self.percentile(99).unwrap_or(0),
            max: self.samples.iter().copied().max().unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_export() {
        let metrics = FeedMetrics::new();
        metrics.record_snapshot();
        metrics.record_delta(Duration::from_micros(3), 2);
        metrics.record_delta(Duration::from_micros(5), 0);
        metrics.record_discarded();
        metrics.record_out_of_order();
        metrics.record_resync();
        metrics.record_decode_error();
        metrics.record_reconnect();

        let exported = metrics.export();
        assert_eq!(exported["snapshots_applied"], 1);
        assert_eq!(exported["deltas_applied"], 2);
        assert_eq!(exported["anomalies"], 2);
        assert_eq!(exported["deltas_discarded"], 1);
        assert_eq!(exported["out_of_order"], 1);
        assert_eq!(exported["resyncs"], 1);
        assert_eq!(exported["decode_errors"], 1);
        assert_eq!(exported["reconnects"], 1);
        assert_eq!(exported.len(), 8);
    }

    #[test]
    fn test_apply_latency_summary() {
        let metrics = FeedMetrics::new();
        assert_eq!(metrics.apply_latency(), LatencySummary::default());

        for micros in [1, 2, 3] {
            metrics.record_delta(Duration::from_micros(micros), 0);
        }
        let summary = metrics.apply_latency();
        assert_eq!(summary.count, 3);
        assert_eq!(summary.mean, 2_000);
        assert_eq!(summary.p50, 2_000);
        assert_eq!(summary.max, 3_000);
    }

    #[test]
    fn test_latency_tracker_percentile() {
        let mut tracker = LatencyTracker::new(100);
        for i in 1..=100 {
            tracker.record(i);
        }
        let p50 = tracker.percentile(50).unwrap();
        assert!((49..=51).contains(&p50));
        let p99 = tracker.percentile(99).unwrap();
        assert!((98..=100).contains(&p99));
        assert_eq!(tracker.percentile(250), Some(100));
    }

    #[test]
    fn test_latency_tracker_window_eviction() {
        let mut tracker = LatencyTracker::new(3);
        for v in [10, 20, 30, 40] {
            tracker.record(v);
        }
        assert_eq!(tracker.count(), 3);
        assert_eq!(tracker.average(), Some(30));
        assert_eq!(tracker.summary().max, 40);
    }

    #[test]
    fn test_empty_tracker() {
        let tracker = LatencyTracker::new(0);
        assert_eq!(tracker.percentile(50), None);
        assert_eq!(tracker.average(), None);
    }
}
