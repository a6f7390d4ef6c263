//! Metrics collection for the supervisor and its workers

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Point-in-time copy of all counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Ticks published to the price broadcast
    pub ticks_received: u64,
    /// Ticks workers skipped: stale, out of order, or lost to lag
    pub ticks_dropped: u64,
    pub orders_submitted: u64,
    /// Submissions retried after a transient port failure
    pub order_retries: u64,
    pub orders_filled: u64,
    pub orders_rejected: u64,
    pub orders_cancelled: u64,
    /// Snapshot writes that lost an optimistic version check
    pub snapshot_conflicts: u64,
    /// Bots moved to `error`
    pub bot_errors: u64,
    pub feed_reconnects: u64,
}

/// Thread-safe metrics collector
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    ticks_received: AtomicU64,
    ticks_dropped: AtomicU64,
    orders_submitted: AtomicU64,
    order_retries: AtomicU64,
    orders_filled: AtomicU64,
    orders_rejected: AtomicU64,
    orders_cancelled: AtomicU64,
    snapshot_conflicts: AtomicU64,
    bot_errors: AtomicU64,
    feed_reconnects: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_ticks_received(&self) {
        self.inner.ticks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_ticks_dropped(&self, count: u64) {
        self.inner.ticks_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_orders_submitted(&self) {
        self.inner.orders_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_order_retries(&self) {
        self.inner.order_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_orders_filled(&self) {
        self.inner.orders_filled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_orders_rejected(&self) {
        self.inner.orders_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_orders_cancelled(&self, count: u64) {
        self.inner.orders_cancelled.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_snapshot_conflicts(&self) {
        self.inner.snapshot_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_bot_errors(&self) {
        self.inner.bot_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_feed_reconnects(&self) {
        self.inner.feed_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let i = &self.inner;
        MetricsSnapshot {
            ticks_received: i.ticks_received.load(Ordering::Relaxed),
            ticks_dropped: i.ticks_dropped.load(Ordering::Relaxed),
            orders_submitted: i.orders_submitted.load(Ordering::Relaxed),
            order_retries: i.order_retries.load(Ordering::Relaxed),
            orders_filled: i.orders_filled.load(Ordering::Relaxed),
            orders_rejected: i.orders_rejected.load(Ordering::Relaxed),
            orders_cancelled: i.orders_cancelled.load(Ordering::Relaxed),
            snapshot_conflicts: i.snapshot_conflicts.load(Ordering::Relaxed),
            bot_errors: i.bot_errors.load(Ordering::Relaxed),
            feed_reconnects: i.feed_reconnects.load(Ordering::Relaxed),
        }
    }
}
