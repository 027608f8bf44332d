//! Immutable batch of record references.

use std::fmt;
use std::time::Instant;

use sha2::{Digest, Sha256};

use crate::record::{encoded_len, EventRecord, RecordId};

/// Stable identifier of a batch.
///
/// Derived from the member record ids, so a batch re-sent with the same
/// records carries the same id and the collector can deduplicate it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BatchId(String);

impl BatchId {
    /// Compute the id for an ordered set of record ids.
    pub fn for_records(ids: &[RecordId]) -> Self {
        let mut hasher = Sha256::new();
        for id in ids {
            hasher.update(id.0.to_le_bytes());
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Hex representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form for logs.
        write!(f, "{}", &self.0[..12.min(self.0.len())])
    }
}

/// A group of records selected for one send.
///
/// The batch references records by id; the store keeps ownership until the
/// records are marked delivered.
#[derive(Clone, Debug)]
pub struct Batch {
    id: BatchId,
    record_ids: Vec<RecordId>,
    encoded_bytes: u64,
    max_count: usize,
    max_bytes: u64,
    created_at: Instant,
}

impl Batch {
    /// Form a batch from records returned by the store.
    pub fn from_records(records: &[EventRecord], max_count: usize, max_bytes: u64) -> Self {
        let record_ids: Vec<RecordId> = records.iter().map(|r| r.id).collect();
        Self {
            id: BatchId::for_records(&record_ids),
            encoded_bytes: records.iter().map(encoded_len).sum(),
            record_ids,
            max_count,
            max_bytes,
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> &BatchId {
        &self.id
    }

    pub fn record_ids(&self) -> &[RecordId] {
        &self.record_ids
    }

    pub fn len(&self) -> usize {
        self.record_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.record_ids.is_empty()
    }

    /// Sum of encoded record sizes, the measure `max_bytes` bounds.
    pub fn encoded_bytes(&self) -> u64 {
        self.encoded_bytes
    }

    pub fn max_count(&self) -> usize {
        self.max_count
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Priority, RECORD_OVERHEAD_BYTES};

    fn record(id: u64, payload: &[u8]) -> EventRecord {
        let mut r = EventRecord::new(payload.to_vec(), Priority::Normal);
        r.id = RecordId(id);
        r
    }

    #[test]
    fn test_batch_id_is_stable() {
        let a = BatchId::for_records(&[RecordId(1), RecordId(2)]);
        let b = BatchId::for_records(&[RecordId(1), RecordId(2)]);
        let c = BatchId::for_records(&[RecordId(1), RecordId(3)]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 64);
        assert_eq!(a.to_string().len(), 12);
    }

    #[test]
    fn test_batch_from_records() {
        let records = vec![record(1, b"abc"), record(2, b"de")];
        let batch = Batch::from_records(&records, 10, 1024);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.record_ids(), &[RecordId(1), RecordId(2)]);
        assert_eq!(batch.encoded_bytes(), 2 * RECORD_OVERHEAD_BYTES + 5);
        assert_eq!(batch.max_count(), 10);
        assert_eq!(batch.max_bytes(), 1024);
        assert_eq!(batch.id(), &BatchId::for_records(&[RecordId(1), RecordId(2)]));
    }

    #[test]
    fn test_empty_batch() {
        let batch = Batch::from_records(&[], 10, 1024);
        assert!(batch.is_empty());
    }
}
