//! Versioned binary layout for event records.
//!
//! ```text
//! +---------+--------------------------------------------------+
//! | tag: u8 | body (bincode, fixint, little endian)            |
//! +---------+--------------------------------------------------+
//! ```
//!
//! The tag selects the body layout. New layouts get a new tag; old tags stay
//! decodable so rows persisted by an older build remain readable.

use bincode::Options;
use serde::{Deserialize, Serialize};

use super::{EventRecord, Priority, RecordId, RecordState};
use crate::error::{PipelineError, PipelineResult};

/// Tag of the current record layout.
pub const RECORD_FORMAT_V1: u8 = 1;

/// Encoded size of a v1 record minus its payload: tag, five fixed-width
/// fields, the payload length field and the vector length prefix.
pub const RECORD_OVERHEAD_BYTES: u64 = 1 + 8 + 8 + 1 + 4 + 1 + 4 + 8;

/// Upper bound on an encoded body. Rejects absurd length prefixes before
/// allocating.
const MAX_BODY_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Serialize, Deserialize)]
struct WireRecordV1 {
    id: u64,
    timestamp_ms: i64,
    priority: u8,
    retry_count: u32,
    state: u8,
    payload_len: u32,
    payload: Vec<u8>,
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(MAX_BODY_BYTES)
        .reject_trailing_bytes()
}

/// Bytes [`serialize`] produces for `record`. This is the size the store
/// accounts for and the measure batch byte limits apply to.
pub fn encoded_len(record: &EventRecord) -> u64 {
    RECORD_OVERHEAD_BYTES + record.payload.len() as u64
}

/// Encodes a record with the current layout tag.
pub fn serialize(record: &EventRecord) -> PipelineResult<Vec<u8>> {
    let payload_len = u32::try_from(record.payload.len()).map_err(|_| {
        PipelineError::MalformedRecord(format!(
            "payload of {} bytes exceeds u32 length field",
            record.payload.len()
        ))
    })?;

    let wire = WireRecordV1 {
        id: record.id.0,
        timestamp_ms: record.timestamp_ms,
        priority: record.priority.code(),
        retry_count: record.retry_count,
        state: record.state.code(),
        payload_len,
        payload: record.payload.clone(),
    };

    let body = wire_options()
        .serialize(&wire)
        .map_err(|e| PipelineError::MalformedRecord(format!("encode failed: {}", e)))?;

    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(RECORD_FORMAT_V1);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decodes bytes produced by [`serialize`].
///
/// # Errors
///
/// Returns `MalformedRecord` for empty input, unknown tags, truncated or
/// trailing bytes, out-of-range enum codes, or a payload whose length does
/// not match its declared length.
pub fn deserialize(bytes: &[u8]) -> PipelineResult<EventRecord> {
    let (tag, body) = bytes
        .split_first()
        .ok_or_else(|| PipelineError::MalformedRecord("empty input".to_string()))?;

    match *tag {
        RECORD_FORMAT_V1 => decode_v1(body),
        other => Err(PipelineError::MalformedRecord(format!(
            "unknown format tag {}",
            other
        ))),
    }
}

fn decode_v1(body: &[u8]) -> PipelineResult<EventRecord> {
    let wire: WireRecordV1 = wire_options()
        .deserialize(body)
        .map_err(|e| PipelineError::MalformedRecord(format!("v1 body: {}", e)))?;

    if wire.payload.len() != wire.payload_len as usize {
        return Err(PipelineError::MalformedRecord(format!(
            "declared payload length {} but found {}",
            wire.payload_len,
            wire.payload.len()
        )));
    }

    let priority = Priority::from_code(wire.priority).ok_or_else(|| {
        PipelineError::MalformedRecord(format!("unknown priority code {}", wire.priority))
    })?;
    let state = RecordState::from_code(wire.state).ok_or_else(|| {
        PipelineError::MalformedRecord(format!("unknown state code {}", wire.state))
    })?;

    Ok(EventRecord {
        id: RecordId(wire.id),
        timestamp_ms: wire.timestamp_ms,
        payload: wire.payload,
        priority,
        retry_count: wire.retry_count,
        state,
    })
}
