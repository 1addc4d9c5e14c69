//! Subscription runtime metrics.
//!
//! Counters maintained by the subscription actor and shared with the
//! handle for monitoring.

use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics tracked for one subscription.
#[derive(Debug, Default)]
pub struct FeedMetrics {
    /// Total batches dispatched to the handler.
    pub batches_total: AtomicU64,

    /// Total change records dispatched to the handler.
    pub records_total: AtomicU64,

    /// Total successful connects (including reconnects).
    pub connects_total: AtomicU64,

    /// Total reconnect retries scheduled.
    pub retries_total: AtomicU64,

    /// Total source errors observed.
    pub errors_total: AtomicU64,
}

impl FeedMetrics {
    /// Creates a zeroed metrics instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a dispatched batch.
    pub fn record_batch(&self, record_count: u64) {
        self.batches_total.fetch_add(1, Ordering::Relaxed);
        self.records_total.fetch_add(record_count, Ordering::Relaxed);
    }

    /// Records a successful connect.
    pub fn record_connect(&self) {
        self.connects_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a scheduled reconnect retry.
    pub fn record_retry(&self) {
        self.retries_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a source error.
    pub fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time snapshot.
    #[must_use]
    pub fn snapshot(&self) -> FeedMetricsSnapshot {
        FeedMetricsSnapshot {
            batches_total: self.batches_total.load(Ordering::Relaxed),
            records_total: self.records_total.load(Ordering::Relaxed),
            connects_total: self.connects_total.load(Ordering::Relaxed),
            retries_total: self.retries_total.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of [`FeedMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedMetricsSnapshot {
    /// Total batches dispatched to the handler.
    pub batches_total: u64,

    /// Total change records dispatched to the handler.
    pub records_total: u64,

    /// Total successful connects.
    pub connects_total: u64,

    /// Total reconnect retries scheduled.
    pub retries_total: u64,

    /// Total source errors observed.
    pub errors_total: u64,
}
