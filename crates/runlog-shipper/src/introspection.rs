//! Counters and the queue-depth snapshot a health endpoint reads.

use std::sync::atomic::{AtomicU64, Ordering};

use runlog_core::Category;
use serde::Serialize;

use crate::circuit::CircuitSnapshot;

/// Records lost per category, either dropped under backpressure or given up
/// on after a failed write.
#[derive(Debug, Default)]
pub struct LostCounters {
    counts: [AtomicU64; Category::ALL.len()],
}

impl LostCounters {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `count` lost records to `category`.
    pub fn add(&self, category: Category, count: u64) {
        self.counts[category.index()].fetch_add(count, Ordering::Relaxed);
    }

    /// Lost records for `category`.
    pub fn get(&self, category: Category) -> u64 {
        self.counts[category.index()].load(Ordering::Relaxed)
    }

    /// Lost records across all categories.
    pub fn total(&self) -> u64 {
        Category::ALL.iter().map(|category| self.get(*category)).sum()
    }
}

/// Throughput counters, updated lock-free by producers and workers.
#[derive(Debug, Default)]
pub struct ShipperStats {
    pub(crate) records_enqueued: AtomicU64,
    pub(crate) records_written: AtomicU64,
    pub(crate) batches_written: AtomicU64,
    pub(crate) batches_failed: AtomicU64,
    pub(crate) flush_cycles: AtomicU64,
    pub(crate) flushes_abandoned: AtomicU64,
}

impl ShipperStats {
    pub(crate) fn incr(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    /// Copies the current values.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            records_enqueued: self.records_enqueued.load(Ordering::Relaxed),
            records_written: self.records_written.load(Ordering::Relaxed),
            batches_written: self.batches_written.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            flush_cycles: self.flush_cycles.load(Ordering::Relaxed),
            flushes_abandoned: self.flushes_abandoned.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`ShipperStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Records accepted into a queue.
    pub records_enqueued: u64,
    /// Records the sink accepted.
    pub records_written: u64,
    /// Batches the sink accepted.
    pub batches_written: u64,
    /// Batches given up on.
    pub batches_failed: u64,
    /// Completed flush cycles.
    pub flush_cycles: u64,
    /// Worker flushes that exceeded the flush timeout.
    pub flushes_abandoned: u64,
}

/// Depth of one category queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueDepth {
    /// Category the queue buffers.
    pub category: Category,
    /// Buffered records.
    pub size: usize,
    /// Maximum buffered records.
    pub capacity: usize,
    /// `size / capacity` as a percentage.
    pub utilization_pct: f64,
    /// Records lost from this category.
    pub lost_count: u64,
}

/// Snapshot returned by `Shipper::queue_depths`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueDepths {
    /// One entry per category, in flush order.
    pub queues: Vec<QueueDepth>,
    /// Sum of every category's lost count.
    pub total_lost: u64,
    /// Breaker state at snapshot time.
    pub circuit: CircuitSnapshot,
    /// Whether workers are running.
    pub running: bool,
    /// Throughput counters.
    pub stats: StatsSnapshot,
}

impl QueueDepths {
    /// Entry for `category`.
    pub fn queue(&self, category: Category) -> Option<&QueueDepth> {
        self.queues.iter().find(|depth| depth.category == category)
    }

    /// Lost records for `category`.
    pub fn lost(&self, category: Category) -> u64 {
        self.queue(category).map_or(0, |depth| depth.lost_count)
    }

    /// Records buffered across all queues.
    pub fn total_buffered(&self) -> usize {
        self.queues.iter().map(|depth| depth.size).sum()
    }
}
