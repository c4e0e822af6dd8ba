//! In-process counters for the pipeline.
//!
//! `feed-service::metrics::feed_cleaner` exposes Prometheus registries
//! scraped over HTTP; since this crate has no HTTP surface, the same named
//! counters are kept as plain atomics behind a snapshot struct instead of a
//! registry.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub cache_hits_total: AtomicU64,
    pub cache_misses_total: AtomicU64,
    pub cache_evictions_total: AtomicU64,
    pub rate_limited_total: AtomicU64,
    pub ranker_fallback_total: AtomicU64,
    pub fanout_tasks_dropped_total: AtomicU64,
    pub fanout_tasks_processed_total: AtomicU64,
    pub stream_messages_dropped_total: AtomicU64,
    pub stream_messages_delivered_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_cache_hit(&self) {
        self.cache_hits_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_miss(&self) {
        self.cache_misses_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_eviction(&self) {
        self.cache_evictions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rate_limited(&self) {
        self.rate_limited_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_ranker_fallback(&self) {
        self.ranker_fallback_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_fanout_dropped(&self) {
        self.fanout_tasks_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_fanout_processed(&self) {
        self.fanout_tasks_processed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_stream_dropped(&self) {
        self.stream_messages_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_stream_delivered(&self) {
        self.stream_messages_delivered_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cache_hits_total: self.cache_hits_total.load(Ordering::Relaxed),
            cache_misses_total: self.cache_misses_total.load(Ordering::Relaxed),
            cache_evictions_total: self.cache_evictions_total.load(Ordering::Relaxed),
            rate_limited_total: self.rate_limited_total.load(Ordering::Relaxed),
            ranker_fallback_total: self.ranker_fallback_total.load(Ordering::Relaxed),
            fanout_tasks_dropped_total: self.fanout_tasks_dropped_total.load(Ordering::Relaxed),
            fanout_tasks_processed_total: self
                .fanout_tasks_processed_total
                .load(Ordering::Relaxed),
            stream_messages_dropped_total: self
                .stream_messages_dropped_total
                .load(Ordering::Relaxed),
            stream_messages_delivered_total: self
                .stream_messages_delivered_total
                .load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters, cheap to hand to a caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub cache_hits_total: u64,
    pub cache_misses_total: u64,
    pub cache_evictions_total: u64,
    pub rate_limited_total: u64,
    pub ranker_fallback_total: u64,
    pub fanout_tasks_dropped_total: u64,
    pub fanout_tasks_processed_total: u64,
    pub stream_messages_dropped_total: u64,
    pub stream_messages_delivered_total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment_independently() {
        let m = Metrics::new();
        m.inc_cache_hit();
        m.inc_cache_hit();
        m.inc_cache_miss();
        let snap = m.snapshot();
        assert_eq!(snap.cache_hits_total, 2);
        assert_eq!(snap.cache_misses_total, 1);
        assert_eq!(snap.cache_evictions_total, 0);
    }
}
