//! Pipeline metrics.
//!
//! Plain atomics, one owner (`Pipeline`), shared by `Arc`. Reads never lock.
//! Rendered in Prometheus text exposition format for `GET /metrics`.

use serde::Serialize;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Upper bounds (ms) of the `commit_duration_ms` histogram buckets.
pub const COMMIT_DURATION_BUCKETS_MS: [u64; 12] =
    [1, 5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000, 10000];

const BUCKETS: usize = COMMIT_DURATION_BUCKETS_MS.len();

/// Fixed-bucket histogram. Each observation lands in exactly one slot; the
/// cumulative `le` counts are computed at render time.
pub struct Histogram {
    buckets: [AtomicU64; BUCKETS],
    overflow: AtomicU64,
    count: AtomicU64,
    sum_ms: AtomicU64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Histogram {
    pub const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            buckets: [ZERO; BUCKETS],
            overflow: AtomicU64::new(0),
            count: AtomicU64::new(0),
            sum_ms: AtomicU64::new(0),
        }
    }

    pub fn observe_ms(&self, value_ms: u64) {
        match COMMIT_DURATION_BUCKETS_MS
            .iter()
            .position(|bound| value_ms <= *bound)
        {
            Some(idx) => self.buckets[idx].fetch_add(1, Ordering::Relaxed),
            None => self.overflow.fetch_add(1, Ordering::Relaxed),
        };
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(value_ms, Ordering::Relaxed);
    }

    pub fn observe(&self, elapsed: Duration) {
        self.observe_ms(elapsed.as_millis().min(u128::from(u64::MAX)) as u64);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let mut cumulative = Vec::with_capacity(BUCKETS);
        let mut running = 0;
        for (bound, bucket) in COMMIT_DURATION_BUCKETS_MS.iter().zip(&self.buckets) {
            running += bucket.load(Ordering::Relaxed);
            cumulative.push((*bound, running));
        }
        HistogramSnapshot {
            buckets: cumulative,
            count: self.count.load(Ordering::Relaxed),
            sum_ms: self.sum_ms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistogramSnapshot {
    /// `(upper bound ms, cumulative count)`
    pub buckets: Vec<(u64, u64)>,
    pub count: u64,
    pub sum_ms: u64,
}

/// Pipeline metrics - all fields are atomic for thread-safe access
#[derive(Default)]
pub struct Metrics {
    // Packet counters
    pub packets_enqueued: AtomicU64,
    pub packets_committed: AtomicU64,
    pub packets_dead_lettered: AtomicU64,
    pub packets_retried: AtomicU64,
    pub packets_rejected: AtomicU64,

    // Worker counters
    pub worker_restarts: AtomicU64,

    // Gauges
    pub queue_depth: AtomicU64,
    pub active_workers: AtomicU64,

    pub commit_duration_ms: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc_packets_enqueued(&self) {
        self.packets_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_packets_committed(&self) {
        self.packets_committed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_packets_dead_lettered(&self) {
        self.packets_dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_packets_retried(&self) {
        self.packets_retried.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_packets_rejected(&self) {
        self.packets_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_worker_restarts(&self) {
        self.worker_restarts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.store(depth as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn worker_started(&self) {
        self.active_workers.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn worker_stopped(&self) {
        let _ = self
            .active_workers
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Record one store commit call (single packet or whole batch).
    #[inline]
    pub fn record_commit_duration(&self, elapsed: Duration) {
        self.commit_duration_ms.observe(elapsed);
    }

    /// Get a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            packets_enqueued: self.packets_enqueued.load(Ordering::Relaxed),
            packets_committed: self.packets_committed.load(Ordering::Relaxed),
            packets_dead_lettered: self.packets_dead_lettered.load(Ordering::Relaxed),
            packets_retried: self.packets_retried.load(Ordering::Relaxed),
            packets_rejected: self.packets_rejected.load(Ordering::Relaxed),
            worker_restarts: self.worker_restarts.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            active_workers: self.active_workers.load(Ordering::Relaxed),
            commit_duration_ms: self.commit_duration_ms.snapshot(),
        }
    }

    /// `committed / (committed + dead_lettered)`, 1.0 before any outcome.
    pub fn success_rate(&self) -> f64 {
        self.snapshot().success_rate()
    }

    /// Format as Prometheus exposition format
    pub fn prometheus_format(&self) -> String {
        let s = self.snapshot();
        let mut out = String::with_capacity(2048);

        let counters = [
            ("packets_enqueued_total", "Packets admitted to the ingestion queue", s.packets_enqueued),
            ("packets_committed_total", "Packets durably committed to their destination", s.packets_committed),
            ("packets_dead_lettered_total", "Packets moved to the dead-letter table", s.packets_dead_lettered),
            ("packets_retried_total", "Transient failures scheduled for retry", s.packets_retried),
            ("packets_rejected_total", "Packets refused or displaced by admission control", s.packets_rejected),
            ("worker_restarts_total", "Worker loops restarted after a crash", s.worker_restarts),
        ];
        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP uplink_{} {}", name, help);
            let _ = writeln!(out, "# TYPE uplink_{} counter", name);
            let _ = writeln!(out, "uplink_{} {}\n", name, value);
        }

        let gauges = [
            ("queue_depth", "Packets waiting in the ingestion queue", s.queue_depth),
            ("active_workers", "Worker loops currently running", s.active_workers),
        ];
        for (name, help, value) in gauges {
            let _ = writeln!(out, "# HELP uplink_{} {}", name, help);
            let _ = writeln!(out, "# TYPE uplink_{} gauge", name);
            let _ = writeln!(out, "uplink_{} {}\n", name, value);
        }

        let h = &s.commit_duration_ms;
        let _ = writeln!(out, "# HELP uplink_commit_duration_ms Store commit call latency in milliseconds");
        let _ = writeln!(out, "# TYPE uplink_commit_duration_ms histogram");
        for (bound, count) in &h.buckets {
            let _ = writeln!(out, "uplink_commit_duration_ms_bucket{{le=\"{}\"}} {}", bound, count);
        }
        let _ = writeln!(out, "uplink_commit_duration_ms_bucket{{le=\"+Inf\"}} {}", h.count);
        let _ = writeln!(out, "uplink_commit_duration_ms_sum {}", h.sum_ms);
        let _ = writeln!(out, "uplink_commit_duration_ms_count {}", h.count);

        out
    }
}

/// Immutable snapshot of metrics for reading
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub packets_enqueued: u64,
    pub packets_committed: u64,
    pub packets_dead_lettered: u64,
    pub packets_retried: u64,
    pub packets_rejected: u64,
    pub worker_restarts: u64,
    pub queue_depth: u64,
    pub active_workers: u64,
    pub commit_duration_ms: HistogramSnapshot,
}

impl MetricsSnapshot {
    pub fn success_rate(&self) -> f64 {
        let finished = self.packets_committed + self.packets_dead_lettered;
        if finished == 0 {
            1.0
        } else {
            self.packets_committed as f64 / finished as f64
        }
    }

    /// Average store commit latency in milliseconds
    pub fn avg_commit_ms(&self) -> f64 {
        if self.commit_duration_ms.count == 0 {
            0.0
        } else {
            self.commit_duration_ms.sum_ms as f64 / self.commit_duration_ms.count as f64
        }
    }

    /// Format as human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "Packets: {} enqueued, {} committed, {} dead-lettered, {} retried, {} rejected | \
             Queue: {} | Workers: {} active, {} restarts | Avg commit: {:.2}ms",
            self.packets_enqueued,
            self.packets_committed,
            self.packets_dead_lettered,
            self.packets_retried,
            self.packets_rejected,
            self.queue_depth,
            self.active_workers,
            self.worker_restarts,
            self.avg_commit_ms(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_increment() {
        let metrics = Metrics::new();
        metrics.inc_packets_enqueued();
        metrics.inc_packets_enqueued();
        metrics.inc_packets_committed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.packets_enqueued, 2);
        assert_eq!(snapshot.packets_committed, 1);
    }

    #[test]
    fn test_success_rate() {
        let metrics = Metrics::new();
        assert_eq!(metrics.success_rate(), 1.0);
        metrics.inc_packets_committed();
        metrics.inc_packets_committed();
        metrics.inc_packets_committed();
        metrics.inc_packets_dead_lettered();
        assert!((metrics.success_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_active_workers_never_underflows() {
        let metrics = Metrics::new();
        metrics.worker_stopped();
        metrics.worker_started();
        metrics.worker_started();
        metrics.worker_stopped();
        assert_eq!(metrics.snapshot().active_workers, 1);
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let histogram = Histogram::new();
        histogram.observe_ms(0);
        histogram.observe_ms(7);
        histogram.observe_ms(10);
        histogram.observe_ms(20_000);

        let s = histogram.snapshot();
        assert_eq!(s.buckets[0], (1, 1));
        assert_eq!(s.buckets[1], (5, 1));
        assert_eq!(s.buckets[2], (10, 3));
        assert_eq!(s.buckets[11], (10000, 3));
        assert_eq!(s.count, 4);
        assert_eq!(s.sum_ms, 20_017);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.inc_packets_committed();
        metrics.set_queue_depth(7);
        metrics.record_commit_duration(Duration::from_millis(3));

        let output = metrics.prometheus_format();
        assert!(output.contains("# TYPE uplink_packets_committed_total counter"));
        assert!(output.contains("uplink_packets_committed_total 1"));
        assert!(output.contains("uplink_queue_depth 7"));
        assert!(output.contains("uplink_commit_duration_ms_bucket{le=\"5\"} 1"));
        assert!(output.contains("uplink_commit_duration_ms_bucket{le=\"+Inf\"} 1"));
        assert!(output.contains("uplink_commit_duration_ms_count 1"));
    }
}
