//! Error types for the telemetry pipeline.
//!
//! Errors fall into two families:
//!
//! - [`PipelineError`]: everything a caller of the pipeline can observe
//!   (corrupt records, storage failures, codec failures, shutdown timeouts).
//! - [`DeliveryError`]: the classified outcome of a failed send attempt. The
//!   delivery engine uses the classification to pick a retry strategy.

use std::time::Duration;

use thiserror::Error;

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors surfaced by the pipeline and its components.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Serialized record bytes do not match any known layout.
    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    /// The persistent store could not complete an operation.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Compression or decompression failed.
    #[error("Codec error: {0}")]
    Codec(String),

    /// A send attempt failed.
    #[error("Delivery failed: {0}")]
    Delivery(#[from] DeliveryError),

    /// Shutdown could not flush outstanding records in time.
    #[error("Shutdown timed out after {timeout_ms}ms with {outstanding} records outstanding")]
    ShutdownTimeout { timeout_ms: u64, outstanding: usize },

    /// The pipeline is shutting down and no longer accepts work.
    #[error("Pipeline is shutting down")]
    ShuttingDown,

    /// The background worker exited unexpectedly. Records can no longer be
    /// delivered by this instance.
    #[error("Pipeline worker stopped")]
    WorkerStopped,

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<rusqlite::Error> for PipelineError {
    fn from(e: rusqlite::Error) -> Self {
        PipelineError::StoreUnavailable(e.to_string())
    }
}

/// Classified failure of a single send attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Timeout, server error or dropped connection. Retried with backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The collector rejected the payload. Retried at most once.
    #[error("permanent rejection (status {status}): {reason}")]
    Permanent { status: u16, reason: String },

    /// The collector asked us to slow down.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
}

impl DeliveryError {
    /// Returns true if the failure should be retried with normal backoff.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, DeliveryError::Permanent { .. })
    }

    /// Server-suggested minimum delay, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DeliveryError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}
