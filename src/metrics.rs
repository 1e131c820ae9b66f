//! Lightweight in-memory metrics for the join engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use serde::Serialize;

#[derive(Default)]
struct DurationStats {
    total: AtomicU64,
    failed: AtomicU64,
    duration_total_ms: AtomicU64,
    duration_max_ms: AtomicU64,
}

impl DurationStats {
    fn record(&self, duration_ms: f64, success: bool) {
        let duration_ms = duration_ms.max(0.0) as u64;
        self.total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.duration_total_ms
            .fetch_add(duration_ms, Ordering::Relaxed);

        let mut current = self.duration_max_ms.load(Ordering::Relaxed);
        while duration_ms > current {
            match self.duration_max_ms.compare_exchange(
                current,
                duration_ms,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(next) => current = next,
            }
        }
    }

    fn snapshot(&self) -> DurationSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let duration_total = self.duration_total_ms.load(Ordering::Relaxed);
        let max_ms = self.duration_max_ms.load(Ordering::Relaxed);

        DurationSnapshot {
            total,
            failed: self.failed.load(Ordering::Relaxed),
            avg_ms: if total > 0 {
                Some(duration_total as f64 / total as f64)
            } else {
                None
            },
            max_ms: if max_ms > 0 { Some(max_ms) } else { None },
        }
    }
}

#[derive(Default)]
struct EngineMetrics {
    backend: DurationStats,
    joins: DurationStats,
    timeouts: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_errors: AtomicU64,
}

static ENGINE_METRICS: OnceLock<EngineMetrics> = OnceLock::new();

fn metrics() -> &'static EngineMetrics {
    ENGINE_METRICS.get_or_init(EngineMetrics::default)
}

/// One backend round trip (result or activation query).
pub fn record_backend_call(duration_ms: f64, success: bool) {
    metrics().backend.record(duration_ms, success);
}

/// One relation resolution, all of its steps included.
pub fn record_join(duration_ms: f64, success: bool) {
    metrics().joins.record(duration_ms, success);
}

pub fn record_timeout() {
    metrics().timeouts.fetch_add(1, Ordering::Relaxed);
}

pub fn record_cache_hit() {
    metrics().cache_hits.fetch_add(1, Ordering::Relaxed);
}

pub fn record_cache_miss() {
    metrics().cache_misses.fetch_add(1, Ordering::Relaxed);
}

pub fn record_cache_error() {
    metrics().cache_errors.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, Serialize)]
pub struct DurationSnapshot {
    pub total: u64,
    pub failed: u64,
    pub avg_ms: Option<f64>,
    pub max_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub backend: DurationSnapshot,
    pub joins: DurationSnapshot,
    pub timeouts: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_errors: u64,
}

pub fn snapshot() -> MetricsSnapshot {
    let metrics = metrics();
    MetricsSnapshot {
        backend: metrics.backend.snapshot(),
        joins: metrics.joins.snapshot(),
        timeouts: metrics.timeouts.load(Ordering::Relaxed),
        cache_hits: metrics.cache_hits.load(Ordering::Relaxed),
        cache_misses: metrics.cache_misses.load(Ordering::Relaxed),
        cache_errors: metrics.cache_errors.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Counters are process-wide and other tests record concurrently, so only
    // lower bounds are asserted.
    #[test]
    fn test_metrics_flow() {
        let initial = snapshot();

        record_backend_call(100.0, true);
        record_backend_call(50.0, false);
        let s1 = snapshot();
        assert!(s1.backend.total >= initial.backend.total + 2);
        assert!(s1.backend.failed > initial.backend.failed);

        record_join(20.0, true);
        record_timeout();
        record_cache_hit();
        record_cache_miss();
        record_cache_error();
        let s2 = snapshot();
        assert!(s2.joins.total > initial.joins.total);
        assert!(s2.timeouts > initial.timeouts);
        assert!(s2.cache_hits > initial.cache_hits);
        assert!(s2.cache_misses > initial.cache_misses);
        assert!(s2.cache_errors > initial.cache_errors);

        record_backend_call(99999.0, true);
        assert!(snapshot().backend.max_ms.unwrap() >= 99999);
    }

    #[test]
    fn empty_stats_have_no_average() {
        let stats = DurationStats::default();
        let snap = stats.snapshot();
        assert_eq!(snap.total, 0);
        assert!(snap.avg_ms.is_none());
        assert!(snap.max_ms.is_none());

        stats.record(10.0, true);
        stats.record(30.0, true);
        assert_eq!(stats.snapshot().avg_ms, Some(20.0));
    }
}
