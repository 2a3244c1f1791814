//! Process-wide query metrics. All counters are relaxed atomics; the host's
//! info surface reads them without coordination.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use once_cell::sync::Lazy;

#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct Stats {
    pub query_requests: Counter,
    pub query_failed_requests: Counter,
    pub query_prefiltering_requests: Counter,
    pub query_inline_filtering_requests: Counter,
    pub query_text_requests: Counter,
    pub query_numeric_requests: Counter,
    pub query_tag_requests: Counter,
    pub query_text_term: Counter,
    pub query_text_prefix: Counter,
    pub query_text_suffix: Counter,
    pub query_text_fuzzy: Counter,
    pub query_text_proximity: Counter,
    pub cancellation_timeouts: Counter,
    pub predicate_revalidations: Counter,
    pub result_records_dropped: Counter,
    pub fanout_retries: Counter,
    pub time_slice_queries: Counter,
}

static STATS: Lazy<Stats> = Lazy::new(Stats::default);

pub fn stats() -> &'static Stats {
    &STATS
}

/// Bytes currently held by core-owned data structures (radix trees,
/// postings). Reported into the host memory counter so `used_memory`
/// reflects the module footprint.
static USED_MEMORY: AtomicUsize = AtomicUsize::new(0);

pub fn track_allocation(bytes: usize) {
    USED_MEMORY.fetch_add(bytes, Ordering::Relaxed);
}

pub fn track_deallocation(bytes: usize) {
    USED_MEMORY.fetch_sub(bytes, Ordering::Relaxed);
}

pub fn used_memory() -> usize {
    USED_MEMORY.load(Ordering::Relaxed)
}
