//! Batch body framing.
//!
//! ```text
//! u32 LE  record count
//! repeat: u32 LE length, serialized record (see record::codec)
//! ```
//!
//! The framed body is then compressed as a whole.

use crate::error::{PipelineError, PipelineResult};
use crate::record::{self, EventRecord};

/// Frame `records` into one uncompressed body.
pub fn encode_payload(records: &[EventRecord]) -> PipelineResult<Vec<u8>> {
    let count = u32::try_from(records.len())
        .map_err(|_| PipelineError::Codec(format!("too many records: {}", records.len())))?;

    let mut out = Vec::with_capacity(4 + records.iter().map(|r| r.payload.len() + 48).sum::<usize>());
    out.extend_from_slice(&count.to_le_bytes());
    for r in records {
        let bytes = record::serialize(r)?;
        let len = u32::try_from(bytes.len())
            .map_err(|_| PipelineError::Codec(format!("record {} too large", r.id)))?;
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&bytes);
    }
    Ok(out)
}

/// Inverse of [`encode_payload`].
///
/// # Errors
///
/// `MalformedRecord` if the framing is truncated, has trailing bytes, or
/// contains a record that does not decode.
pub fn decode_payload(bytes: &[u8]) -> PipelineResult<Vec<EventRecord>> {
    let mut cursor = bytes;
    let count = read_u32(&mut cursor)? as usize;

    // Each frame needs at least its 4-byte length prefix.
    if count > cursor.len() / 4 {
        return Err(PipelineError::MalformedRecord(format!(
            "record count {} exceeds body size",
            count
        )));
    }

    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        let len = read_u32(&mut cursor)? as usize;
        if cursor.len() < len {
            return Err(PipelineError::MalformedRecord("truncated frame".to_string()));
        }
        let (frame, rest) = cursor.split_at(len);
        records.push(record::deserialize(frame)?);
        cursor = rest;
    }

    if !cursor.is_empty() {
        return Err(PipelineError::MalformedRecord(format!(
            "{} trailing bytes after last frame",
            cursor.len()
        )));
    }
    Ok(records)
}

fn read_u32(cursor: &mut &[u8]) -> PipelineResult<u32> {
    if cursor.len() < 4 {
        return Err(PipelineError::MalformedRecord("truncated length prefix".to_string()));
    }
    let (head, rest) = cursor.split_at(4);
    *cursor = rest;
    Ok(u32::from_le_bytes([head[0], head[1], head[2], head[3]]))
}
