use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Monotonically increasing counter
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Gauge refreshed from region bookkeeping
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Gauge {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-pond statistics sink.
///
/// Counters live in process memory, not in the region, so two processes
/// attached to the same region count independently. Updating them never
/// blocks. Tier sizes are refreshed from the region bookkeeping by
/// [`crate::Pond::refresh_gauges`].
pub struct PondMetrics {
    // Record operations
    pub insert: Counter,
    pub insert_no_memory: Counter,
    pub update: Counter,
    pub find_hit: Counter,
    pub find_miss: Counter,

    // Purge activity
    pub purge: Counter,
    pub purge_dirty: Counter,
    pub purge_empty: Counter,
    pub purge_bytes: Counter,
    pub purge_by_time: Counter,
    pub purge_alert: Counter,
    pub purge_sweep: Counter,
    pub delay_purge: Counter,

    // Write-back
    pub journal_write: Counter,
    pub journal_write_fail: Counter,
    pub flush: Counter,

    // Hash table
    pub rehash: Counter,
    pub hash_migrated: Counter,

    // Current state gauges
    pub nodes_used: Gauge,
    pub nodes_dirty: Gauge,
    pub nodes_empty: Gauge,
    pub node_groups: Gauge,
    pub buckets_free: Gauge,
    pub bytes_used: Gauge,
}

impl PondMetrics {
    pub fn new() -> Self {
        Self {
            insert: Counter::new(),
            insert_no_memory: Counter::new(),
            update: Counter::new(),
            find_hit: Counter::new(),
            find_miss: Counter::new(),
            purge: Counter::new(),
            purge_dirty: Counter::new(),
            purge_empty: Counter::new(),
            purge_bytes: Counter::new(),
            purge_by_time: Counter::new(),
            purge_alert: Counter::new(),
            purge_sweep: Counter::new(),
            delay_purge: Counter::new(),
            journal_write: Counter::new(),
            journal_write_fail: Counter::new(),
            flush: Counter::new(),
            rehash: Counter::new(),
            hash_migrated: Counter::new(),
            nodes_used: Gauge::new(),
            nodes_dirty: Gauge::new(),
            nodes_empty: Gauge::new(),
            node_groups: Gauge::new(),
            buckets_free: Gauge::new(),
            bytes_used: Gauge::new(),
        }
    }
}

impl Default for PondMetrics {
    fn default() -> Self {
        Self::new()
    }
}
