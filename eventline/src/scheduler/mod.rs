//! Batching scheduler.
//!
//! Decides when accumulated records form a batch worth sending.
//!
//! # State Machine
//!
//! ```text
//! Idle --[record pending]--> Accumulating
//! Accumulating --[trigger, not paused, backoff elapsed]--> Draining
//! Draining --[batch delivered or re-queued]--> Idle
//! ```
//!
//! Triggers, checked in order:
//!
//! 1. an `Immediate` record is pending
//! 2. a flush was requested
//! 3. pending count reached `max_batch_count`
//! 4. the oldest pending record is older than `max_latency`
//!
//! Only one drain runs at a time. While draining, new records keep
//! accumulating but no second drain can begin, so two batches never race over
//! the same records or the same backoff state.

mod batch;

pub use batch::{Batch, BatchId};

use std::time::Duration;

use crate::store::StoreStats;

/// Scheduler thresholds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Pending count that triggers a drain.
    pub max_batch_count: usize,
    /// Age of the oldest pending record that triggers a drain.
    pub max_latency: Duration,
}

/// Scheduler state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    /// Nothing pending.
    Idle,
    /// Records pending, no trigger yet.
    Accumulating,
    /// A batch is being formed or sent.
    Draining,
}

/// Why a drain started.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainReason {
    Immediate,
    Flush,
    CountThreshold,
    LatencyElapsed,
}

/// Drain decision state machine. Pure: callers pass in the clock.
#[derive(Debug)]
pub struct BatchScheduler {
    config: SchedulerConfig,
    state: SchedulerState,
    paused: bool,
    flush_requested: bool,
    retry_at_ms: Option<i64>,
}

impl BatchScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            state: SchedulerState::Idle,
            paused: false,
            flush_requested: false,
            retry_at_ms: None,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Evaluate triggers against the current store counters.
    ///
    /// Returns the reason to drain, or `None` if no drain should begin now.
    /// Does not enter `Draining`; call [`BatchScheduler::begin_drain`] for that.
    pub fn observe(&mut self, stats: &StoreStats, now_ms: i64) -> Option<DrainReason> {
        if self.state == SchedulerState::Draining {
            return None;
        }

        if stats.pending == 0 {
            self.state = SchedulerState::Idle;
            self.flush_requested = false;
            return None;
        }
        self.state = SchedulerState::Accumulating;

        if self.paused {
            return None;
        }

        if let Some(retry_at) = self.retry_at_ms {
            if now_ms < retry_at {
                return None;
            }
            self.retry_at_ms = None;
        }

        if stats.immediate_pending {
            return Some(DrainReason::Immediate);
        }
        if self.flush_requested {
            return Some(DrainReason::Flush);
        }
        if stats.pending >= self.config.max_batch_count {
            return Some(DrainReason::CountThreshold);
        }
        if let Some(oldest) = stats.oldest_pending_ms {
            let age = now_ms.saturating_sub(oldest).max(0) as u128;
            if age >= self.config.max_latency.as_millis() {
                return Some(DrainReason::LatencyElapsed);
            }
        }
        None
    }

    /// Enter `Draining`. Returns false if a drain is already running.
    pub fn begin_drain(&mut self) -> bool {
        if self.state == SchedulerState::Draining {
            return false;
        }
        self.state = SchedulerState::Draining;
        self.flush_requested = false;
        true
    }

    /// Leave `Draining` once the batch outcome is known.
    ///
    /// `retry_after` holds back the next drain after a failed send.
    pub fn finish_drain(&mut self, retry_after: Option<Duration>, now_ms: i64) {
        self.state = SchedulerState::Idle;
        self.retry_at_ms = retry_after.map(|d| {
            let delay_ms = i64::try_from(d.as_millis()).unwrap_or(i64::MAX);
            now_ms.saturating_add(delay_ms)
        });
    }

    /// Ask for a drain at the next evaluation, regardless of thresholds.
    pub fn request_flush(&mut self) {
        self.flush_requested = true;
    }

    /// Stop starting drains. Recording continues.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Earliest time (Unix ms) the next drain may begin after a failure.
    pub fn retry_at_ms(&self) -> Option<i64> {
        self.retry_at_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    fn scheduler() -> BatchScheduler {
        BatchScheduler::new(SchedulerConfig {
            max_batch_count: 5,
            max_latency: Duration::from_secs(2),
        })
    }

    fn pending(count: usize, oldest_ms: i64) -> StoreStats {
        StoreStats {
            pending: count,
            oldest_pending_ms: Some(oldest_ms),
            ..Default::default()
        }
    }

    #[test]
    fn test_idle_when_empty() {
        let mut s = scheduler();
        assert_eq!(s.observe(&StoreStats::default(), NOW), None);
        assert_eq!(s.state(), SchedulerState::Idle);
    }

    #[test]
    fn test_accumulates_below_thresholds() {
        let mut s = scheduler();
        assert_eq!(s.observe(&pending(3, NOW), NOW + 500), None);
        assert_eq!(s.state(), SchedulerState::Accumulating);
    }

    #[test]
    fn test_latency_trigger() {
        // Three normal events, max count five, max latency two seconds.
        let mut s = scheduler();
        assert_eq!(s.observe(&pending(3, NOW), NOW + 1_999), None);
        assert_eq!(
            s.observe(&pending(3, NOW), NOW + 2_000),
            Some(DrainReason::LatencyElapsed)
        );
    }

    #[test]
    fn test_count_trigger() {
        let mut s = scheduler();
        assert_eq!(
            s.observe(&pending(5, NOW), NOW),
            Some(DrainReason::CountThreshold)
        );
    }

    #[test]
    fn test_immediate_trigger_ignores_thresholds() {
        let mut s = scheduler();
        let stats = StoreStats {
            pending: 1,
            immediate_pending: true,
            oldest_pending_ms: Some(NOW),
            ..Default::default()
        };
        assert_eq!(s.observe(&stats, NOW), Some(DrainReason::Immediate));
    }

    #[test]
    fn test_flush_trigger() {
        let mut s = scheduler();
        s.request_flush();
        assert_eq!(s.observe(&pending(1, NOW), NOW), Some(DrainReason::Flush));
    }

    #[test]
    fn test_flush_request_cleared_when_empty() {
        let mut s = scheduler();
        s.request_flush();
        assert_eq!(s.observe(&StoreStats::default(), NOW), None);
        assert_eq!(s.observe(&pending(1, NOW), NOW), None);
    }

    #[test]
    fn test_single_drain_at_a_time() {
        let mut s = scheduler();
        assert!(s.begin_drain());
        assert!(!s.begin_drain());
        assert_eq!(s.observe(&pending(10, NOW), NOW), None);
        assert_eq!(s.state(), SchedulerState::Draining);

        s.finish_drain(None, NOW);
        assert_eq!(s.state(), SchedulerState::Idle);
        assert!(s.begin_drain());
    }

    #[test]
    fn test_pause_blocks_drains() {
        let mut s = scheduler();
        s.pause();
        assert!(s.is_paused());
        assert_eq!(s.observe(&pending(10, NOW), NOW), None);
        assert_eq!(s.state(), SchedulerState::Accumulating);

        s.resume();
        assert_eq!(
            s.observe(&pending(10, NOW), NOW),
            Some(DrainReason::CountThreshold)
        );
    }

    #[test]
    fn test_backoff_holds_next_drain() {
        let mut s = scheduler();
        s.begin_drain();
        s.finish_drain(Some(Duration::from_secs(3)), NOW);
        assert_eq!(s.retry_at_ms(), Some(NOW + 3_000));

        let stats = StoreStats {
            pending: 10,
            immediate_pending: true,
            ..Default::default()
        };
        assert_eq!(s.observe(&stats, NOW + 2_999), None);
        assert_eq!(s.observe(&stats, NOW + 3_000), Some(DrainReason::Immediate));
        assert_eq!(s.retry_at_ms(), None);
    }

    #[test]
    fn test_huge_retry_after_saturates() {
        let mut s = scheduler();
        s.begin_drain();
        s.finish_drain(Some(Duration::from_secs(u64::MAX)), NOW);
        assert_eq!(s.retry_at_ms(), Some(i64::MAX));
        assert_eq!(s.observe(&pending(10, NOW), NOW + 1_000_000), None);
    }
}
