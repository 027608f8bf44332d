use std::fmt;
use std::time::Duration;

/// Point-in-time copy of [`super::PipelineMetrics`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub records_enqueued: u64,
    pub records_delivered: u64,
    pub records_dropped: u64,
    pub records_evicted: u64,
    pub records_recovered: u64,
    pub batches_sent: u64,
    pub batches_delivered: u64,
    pub batches_failed: u64,
    pub transient_failures: u64,
    pub permanent_failures: u64,
    pub rate_limited: u64,
    pub codec_failures: u64,
    pub bytes_sent: u64,
    pub uptime: Duration,
}

impl MetricsSnapshot {
    /// Fraction of sent batches that were acknowledged, 1.0 if none were sent.
    pub fn delivery_ratio(&self) -> f64 {
        if self.batches_sent == 0 {
            1.0
        } else {
            self.batches_delivered as f64 / self.batches_sent as f64
        }
    }

    /// Records lost to the retry ceiling or to eviction.
    pub fn records_lost(&self) -> u64 {
        self.records_dropped + self.records_evicted
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Uptime:             {}s", self.uptime.as_secs())?;
        writeln!(f, "Records enqueued:   {}", self.records_enqueued)?;
        writeln!(f, "Records delivered:  {}", self.records_delivered)?;
        writeln!(
            f,
            "Records lost:       {} (dropped {}, evicted {})",
            self.records_lost(),
            self.records_dropped,
            self.records_evicted
        )?;
        writeln!(f, "Records recovered:  {}", self.records_recovered)?;
        writeln!(
            f,
            "Batches:            {} sent, {} delivered, {} failed ({:.1}% ok)",
            self.batches_sent,
            self.batches_delivered,
            self.batches_failed,
            self.delivery_ratio() * 100.0
        )?;
        writeln!(
            f,
            "Failures:           {} transient, {} permanent, {} rate limited, {} codec",
            self.transient_failures, self.permanent_failures, self.rate_limited, self.codec_failures
        )?;
        write!(f, "Bytes sent:         {}", self.bytes_sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_ratio() {
        let mut s = MetricsSnapshot::default();
        assert_eq!(s.delivery_ratio(), 1.0);
        s.batches_sent = 4;
        s.batches_delivered = 3;
        assert!((s.delivery_ratio() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_display_mentions_counters() {
        let s = MetricsSnapshot {
            records_enqueued: 12,
            records_dropped: 1,
            records_evicted: 2,
            ..Default::default()
        };
        let text = s.to_string();
        assert!(text.contains("Records enqueued:   12"));
        assert!(text.contains("Records lost:       3"));
    }
}
