//! Event record model.
//!
//! An [`EventRecord`] is the canonical in-memory form of a telemetry event.
//! Payloads are opaque bytes; the pipeline never looks inside them.
//!
//! # State Machine
//!
//! ```text
//! Pending --[mark_in_flight]--> InFlight
//! InFlight --[mark_delivered]--> Delivered (row removed)
//! InFlight --[mark_failed, retries left]--> Pending
//! InFlight --[mark_failed, ceiling reached]--> Failed (row removed, reported)
//! InFlight --[stale recovery]--> Pending
//! ```

mod codec;

pub use codec::{deserialize, encoded_len, serialize, RECORD_FORMAT_V1, RECORD_OVERHEAD_BYTES};

use std::fmt;
use std::str::FromStr;

/// Local sequence number of a record. Unique within a store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId(pub u64);

impl RecordId {
    /// Returns the raw sequence value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Delivery priority of a record.
///
/// Ordered from lowest to highest, so `Priority::Immediate > Priority::Normal`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    /// Batched and sent when thresholds are reached. Persisted best-effort.
    #[default]
    Normal,
    /// Persisted before `record()` returns.
    High,
    /// Persisted before `record()` returns and triggers a drain at once.
    Immediate,
}

impl Priority {
    /// All priorities, lowest first.
    pub const ALL: [Priority; 3] = [Priority::Normal, Priority::High, Priority::Immediate];

    /// Numeric code used in storage and on the wire.
    pub fn code(&self) -> u8 {
        match self {
            Priority::Normal => 0,
            Priority::High => 1,
            Priority::Immediate => 2,
        }
    }

    /// Inverse of [`Priority::code`].
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Priority::Normal),
            1 => Some(Priority::High),
            2 => Some(Priority::Immediate),
            _ => None,
        }
    }

    /// Whether `record()` must write this priority durably before returning.
    pub fn requires_durable_write(&self) -> bool {
        *self >= Priority::High
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Immediate => write!(f, "immediate"),
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "immediate" | "realtime" => Ok(Priority::Immediate),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// Lifecycle state of a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum RecordState {
    /// Waiting to be sent.
    #[default]
    Pending,
    /// Part of a batch being transmitted.
    InFlight,
    /// Acknowledged by the collector. Never stored; used in reports.
    Delivered,
    /// Dropped after exhausting retries. Never stored; used in reports.
    Failed,
}

impl RecordState {
    /// Numeric code used in storage and on the wire.
    pub fn code(&self) -> u8 {
        match self {
            RecordState::Pending => 0,
            RecordState::InFlight => 1,
            RecordState::Delivered => 2,
            RecordState::Failed => 3,
        }
    }

    /// Inverse of [`RecordState::code`].
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(RecordState::Pending),
            1 => Some(RecordState::InFlight),
            2 => Some(RecordState::Delivered),
            3 => Some(RecordState::Failed),
            _ => None,
        }
    }
}

/// A single telemetry event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventRecord {
    /// Local sequence number, assigned by the store.
    pub id: RecordId,
    /// Capture time in Unix milliseconds.
    pub timestamp_ms: i64,
    /// Opaque serialized event data.
    pub payload: Vec<u8>,
    /// Delivery priority.
    pub priority: Priority,
    /// Number of failed delivery attempts so far.
    pub retry_count: u32,
    /// Current lifecycle state.
    pub state: RecordState,
}

impl EventRecord {
    /// Creates a pending record captured now.
    ///
    /// The id is a placeholder until the store assigns one on enqueue.
    pub fn new(payload: impl Into<Vec<u8>>, priority: Priority) -> Self {
        Self {
            id: RecordId(0),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            payload: payload.into(),
            priority,
            retry_count: 0,
            state: RecordState::Pending,
        }
    }

    /// Sets the capture timestamp.
    pub fn with_timestamp_ms(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    /// Age of the record relative to `now_ms`, saturating at zero.
    pub fn age_ms(&self, now_ms: i64) -> u64 {
        now_ms.saturating_sub(self.timestamp_ms).max(0) as u64
    }
}
