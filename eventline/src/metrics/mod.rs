//! Pipeline counters for diagnostics.
//!
//! ```text
//! Worker / Engine ─────► PipelineMetrics ─────► MetricsSnapshot ─────► CLI, host app
//!                        (atomic counters)     (point-in-time copy)
//! ```
//!
//! # Example
//!
//! ```
//! use eventline::metrics::PipelineMetrics;
//!
//! let metrics = PipelineMetrics::new();
//! metrics.record_enqueued();
//! metrics.batch_delivered(1, 128);
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.records_delivered, 1);
//! ```

mod snapshot;

pub use snapshot::MetricsSnapshot;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Lock-free counters shared by the pipeline components.
#[derive(Debug)]
pub struct PipelineMetrics {
    records_enqueued: AtomicU64,
    records_delivered: AtomicU64,
    records_dropped: AtomicU64,
    records_evicted: AtomicU64,
    records_recovered: AtomicU64,
    batches_sent: AtomicU64,
    batches_delivered: AtomicU64,
    batches_failed: AtomicU64,
    transient_failures: AtomicU64,
    permanent_failures: AtomicU64,
    rate_limited: AtomicU64,
    codec_failures: AtomicU64,
    bytes_sent: AtomicU64,
    started_at: Instant,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            records_enqueued: AtomicU64::new(0),
            records_delivered: AtomicU64::new(0),
            records_dropped: AtomicU64::new(0),
            records_evicted: AtomicU64::new(0),
            records_recovered: AtomicU64::new(0),
            batches_sent: AtomicU64::new(0),
            batches_delivered: AtomicU64::new(0),
            batches_failed: AtomicU64::new(0),
            transient_failures: AtomicU64::new(0),
            permanent_failures: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            codec_failures: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn record_enqueued(&self) {
        self.records_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// A batch left for the collector.
    pub fn batch_sent(&self, body_bytes: usize) {
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(body_bytes as u64, Ordering::Relaxed);
    }

    /// The collector acknowledged a batch.
    pub fn batch_delivered(&self, records: usize, body_bytes: usize) {
        self.batch_sent(body_bytes);
        self.batches_delivered.fetch_add(1, Ordering::Relaxed);
        self.records_delivered
            .fetch_add(records as u64, Ordering::Relaxed);
    }

    pub fn batch_failed(&self) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transient_failure(&self) {
        self.transient_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn permanent_failure(&self) {
        self.permanent_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn codec_failure(&self) {
        self.codec_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records removed after reaching the retry ceiling.
    pub fn records_dropped(&self, count: usize) {
        self.records_dropped
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Records removed to stay under the storage quota.
    pub fn records_evicted(&self, count: usize) {
        self.records_evicted
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Stale in-flight records returned to pending.
    pub fn records_recovered(&self, count: usize) {
        self.records_recovered
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_enqueued: self.records_enqueued.load(Ordering::Relaxed),
            records_delivered: self.records_delivered.load(Ordering::Relaxed),
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
            records_evicted: self.records_evicted.load(Ordering::Relaxed),
            records_recovered: self.records_recovered.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            batches_delivered: self.batches_delivered.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            transient_failures: self.transient_failures.load(Ordering::Relaxed),
            permanent_failures: self.permanent_failures.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            codec_failures: self.codec_failures.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            uptime: self.started_at.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_metrics_start_at_zero() {
        let snapshot = PipelineMetrics::new().snapshot();
        assert_eq!(snapshot.records_enqueued, 0);
        assert_eq!(snapshot.batches_sent, 0);
        assert_eq!(snapshot.bytes_sent, 0);
    }

    #[test]
    fn test_delivery_counters() {
        let metrics = PipelineMetrics::new();
        metrics.record_enqueued();
        metrics.record_enqueued();
        metrics.batch_delivered(2, 100);
        metrics.batch_sent(50);
        metrics.batch_failed();
        metrics.transient_failure();

        let s = metrics.snapshot();
        assert_eq!(s.records_enqueued, 2);
        assert_eq!(s.records_delivered, 2);
        assert_eq!(s.batches_sent, 2);
        assert_eq!(s.batches_delivered, 1);
        assert_eq!(s.batches_failed, 1);
        assert_eq!(s.transient_failures, 1);
        assert_eq!(s.bytes_sent, 150);
    }

    #[test]
    fn test_loss_counters() {
        let metrics = PipelineMetrics::new();
        metrics.records_dropped(3);
        metrics.records_evicted(4);
        metrics.records_recovered(5);
        let s = metrics.snapshot();
        assert_eq!(s.records_dropped, 3);
        assert_eq!(s.records_evicted, 4);
        assert_eq!(s.records_recovered, 5);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;

        let metrics = Arc::new(PipelineMetrics::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        m.record_enqueued();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(metrics.snapshot().records_enqueued, 4000);
    }
}
