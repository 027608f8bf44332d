//! Batch transport and delivery.
//!
//! # Architecture
//!
//! ```text
//! Batch + records ──► DeliveryEngine ──► encode_payload ──► Compression
//!                          │                                      │
//!                          │            OutboundBatch ◄───────────┘
//!                          ▼
//!                    dyn Transport::send ──► Ack | DeliveryError
//!                          │
//!                          ▼
//!          RecordStore::mark_delivered / mark_failed + BackoffPolicy
//! ```
//!
//! [`Transport`] is the seam for tests and alternative collectors. The
//! production implementation is [`HttpTransport`].

mod backoff;
mod engine;
mod http;
mod payload;

pub use backoff::{
    BackoffPolicy, DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_BASE_DELAY_MS, DEFAULT_JITTER,
    DEFAULT_MAX_DELAY_MS, MAX_RETRY_AFTER,
};
pub use engine::{DeliveryEngine, DeliveryOutcome, EngineConfig, PERMANENT_FAILURE_CEILING};
pub use http::{classify_status, parse_retry_after, HttpTransport};
pub use payload::{decode_payload, encode_payload};

use std::future::Future;
use std::pin::Pin;

use crate::compression::Compression;
use crate::error::{DeliveryError, PipelineError, PipelineResult};
use crate::record::EventRecord;
use crate::scheduler::BatchId;

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A batch ready to leave the process.
#[derive(Clone, Debug)]
pub struct OutboundBatch {
    /// Stable id, identical across retries of the same records.
    pub batch_id: BatchId,
    pub record_count: usize,
    /// `Content-Encoding` of `body`, `None` when uncompressed.
    pub content_encoding: Option<&'static str>,
    pub body: Vec<u8>,
}

impl OutboundBatch {
    /// Decompress and unframe the body.
    pub fn decode_records(&self) -> PipelineResult<Vec<EventRecord>> {
        let compression = match self.content_encoding {
            None => Compression::None,
            Some("deflate") => Compression::default(),
            Some(other) => {
                return Err(PipelineError::Codec(format!(
                    "unsupported content encoding '{}'",
                    other
                )))
            }
        };
        decode_payload(&compression.decompress(&self.body)?)
    }
}

/// Positive acknowledgement from the collector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ack {
    pub status: u16,
}

/// Sends batches to a collector.
///
/// Implementations classify every failure into a [`DeliveryError`]; the
/// engine decides on retries.
pub trait Transport: Send + Sync {
    fn send<'a>(&'a self, batch: &'a OutboundBatch) -> BoxFuture<'a, Result<Ack, DeliveryError>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Priority, RecordId};

    #[test]
    fn test_outbound_decode_records() {
        let mut record = EventRecord::new(b"payload".to_vec(), Priority::High);
        record.id = RecordId(9);
        let framed = encode_payload(std::slice::from_ref(&record)).unwrap();

        let batch = OutboundBatch {
            batch_id: BatchId::for_records(&[RecordId(9)]),
            record_count: 1,
            content_encoding: Some("deflate"),
            body: Compression::default().compress(&framed).unwrap(),
        };
        assert_eq!(batch.decode_records().unwrap(), vec![record]);
    }

    #[test]
    fn test_outbound_unknown_encoding() {
        let batch = OutboundBatch {
            batch_id: BatchId::for_records(&[]),
            record_count: 0,
            content_encoding: Some("br"),
            body: Vec::new(),
        };
        assert!(matches!(
            batch.decode_records(),
            Err(PipelineError::Codec(_))
        ));
    }
}
