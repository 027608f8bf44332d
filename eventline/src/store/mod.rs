//! Persistent record store.
//!
//! [`RecordStore`] is a durable, crash-safe queue of [`EventRecord`]s keyed by
//! [`RecordId`], built on an embedded SQLite database. It is the single source
//! of truth for record state: the scheduler and delivery engine request state
//! transitions through its API and never touch rows directly.
//!
//! # Durability
//!
//! - [`Durability::Durable`] commits the row before `enqueue` returns.
//! - [`Durability::Deferred`] assigns the id immediately but buffers the row in
//!   memory until [`RecordStore::flush_deferred`] (called by the background
//!   worker, and implicitly by reads that need to see every record).
//!
//! # Concurrency
//!
//! All statements run on one connection behind a mutex, so state transitions
//! are serialized per store. Id assignment is a lock-free atomic increment and
//! never hands out the same id twice, even across concurrent callers.
//!
//! # Crash Consistency
//!
//! A record that was `InFlight` when the process died stays `InFlight` on disk.
//! [`RecordStore::recover_stale_in_flight`] returns such rows to `Pending`,
//! which gives at-least-once delivery.

mod schema;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::record::{deserialize, serialize, EventRecord, Priority, RecordId, RecordState};

pub use schema::SCHEMA_VERSION;

/// How `enqueue` persists a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Durability {
    /// Commit to disk before returning.
    Durable,
    /// Buffer in memory; written on the next `flush_deferred`.
    Deferred,
}

impl Durability {
    /// Durability required for a record of the given priority.
    pub fn for_priority(priority: Priority) -> Self {
        if priority.requires_durable_write() {
            Durability::Durable
        } else {
            Durability::Deferred
        }
    }
}

/// Where the store keeps its rows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreLocation {
    /// SQLite database file.
    File(PathBuf),
    /// Process memory only (degraded mode, lost on exit).
    InMemory,
}

/// Result of [`RecordStore::mark_failed`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FailureOutcome {
    /// Records returned to `Pending` for another attempt.
    pub requeued: Vec<RecordId>,
    /// Records that reached the retry ceiling and were removed.
    pub dropped: Vec<RecordId>,
    /// Highest retry count among requeued records.
    pub max_retry_count: u32,
}

/// Point-in-time counters used by the scheduler and for diagnostics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Pending records, including deferred ones not yet written.
    pub pending: usize,
    /// Records currently in flight.
    pub in_flight: usize,
    /// Encoded size of every stored record.
    pub total_bytes: u64,
    /// Capture time of the oldest pending record.
    pub oldest_pending_ms: Option<i64>,
    /// Whether any pending record has `Immediate` priority.
    pub immediate_pending: bool,
    /// Records buffered by deferred enqueues.
    pub deferred: usize,
}

/// A record together with its encoded body, waiting for a deferred write.
#[derive(Debug)]
struct EncodedRecord {
    record: EventRecord,
    body: Vec<u8>,
}

const STATE_PENDING: i64 = 0;
const STATE_IN_FLIGHT: i64 = 1;

/// Durable queue of event records on SQLite.
pub struct RecordStore {
    conn: Mutex<Connection>,
    next_id: AtomicU64,
    deferred: Mutex<Vec<EncodedRecord>>,
    location: StoreLocation,
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("location", &self.location)
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl RecordStore {
    /// Open (or create) a store backed by a database file.
    ///
    /// Parent directories are created as needed.
    pub fn open(path: &Path) -> PipelineResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    PipelineError::StoreUnavailable(format!(
                        "failed to create {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        let store = Self::initialize(conn, StoreLocation::File(path.to_path_buf()))?;
        info!(
            path = %path.display(),
            next_id = store.next_id.load(Ordering::Relaxed),
            "Record store opened"
        );
        Ok(store)
    }

    /// Open a store that lives only in memory.
    pub fn open_in_memory() -> PipelineResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(conn, StoreLocation::InMemory)
    }

    fn initialize(conn: Connection, location: StoreLocation) -> PipelineResult<Self> {
        schema::apply_pragmas(&conn)?;
        schema::run_migrations(&conn)?;

        let max_id: i64 =
            conn.query_row("SELECT COALESCE(MAX(id), 0) FROM events", [], |row| {
                row.get(0)
            })?;

        Ok(Self {
            conn: Mutex::new(conn),
            next_id: AtomicU64::new(max_id as u64 + 1),
            deferred: Mutex::new(Vec::new()),
            location,
        })
    }

    /// Where this store keeps its rows.
    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    /// The most recently assigned id, or `RecordId(0)` if none.
    pub fn last_assigned_id(&self) -> RecordId {
        RecordId(self.next_id.load(Ordering::SeqCst).saturating_sub(1))
    }

    /// Assign the next sequence id to `record` and persist it.
    ///
    /// The record is stored as `Pending` with a zero retry count regardless of
    /// the fields it arrives with.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` if a durable write fails. The id is consumed either
    /// way, so ids remain unique but may have gaps.
    pub fn enqueue(
        &self,
        mut record: EventRecord,
        durability: Durability,
    ) -> PipelineResult<RecordId> {
        let id = RecordId(self.next_id.fetch_add(1, Ordering::SeqCst));
        record.id = id;
        record.state = RecordState::Pending;
        record.retry_count = 0;

        let body = serialize(&record)?;
        let encoded = EncodedRecord { record, body };

        match durability {
            Durability::Durable => {
                let mut conn = self.conn.lock();
                let tx = conn.transaction()?;
                insert_row(&tx, &encoded)?;
                tx.commit()?;
            }
            Durability::Deferred => {
                self.deferred.lock().push(encoded);
            }
        }

        debug!(id = id.0, ?durability, "Record enqueued");
        Ok(id)
    }

    /// Write all deferred records in a single transaction.
    ///
    /// Returns the number of rows written. On failure the rows stay buffered
    /// and are retried on the next call.
    pub fn flush_deferred(&self) -> PipelineResult<usize> {
        // Lock order: deferred, then conn. Holding the buffer until commit keeps
        // rows visible to `stats` and `outstanding_through` while they move.
        let mut deferred = self.deferred.lock();
        if deferred.is_empty() {
            return Ok(0);
        }

        let result = (|| -> PipelineResult<()> {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            for encoded in deferred.iter() {
                insert_row(&tx, encoded)?;
            }
            tx.commit()?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                let count = deferred.len();
                deferred.clear();
                debug!(count, "Deferred records written");
                Ok(count)
            }
            Err(e) => {
                warn!(count = deferred.len(), error = %e, "Deferred write failed, keeping rows buffered");
                Err(e)
            }
        }
    }

    /// Oldest pending records of any priority, up to `limit` records and
    /// `max_bytes` of encoded size. See [`RecordStore::peek_batch_for`].
    pub fn peek_batch(&self, limit: usize, max_bytes: u64) -> PipelineResult<Vec<EventRecord>> {
        self.peek_batch_for(limit, max_bytes, &Priority::ALL)
    }

    /// Oldest pending records whose priority is in `allowed`.
    ///
    /// Ordering is by id ascending, except that `Immediate` records come first.
    /// Record state is not changed. The first record is always returned even if
    /// it alone exceeds `max_bytes`, so an oversized record cannot block the
    /// queue. Rows that fail to decode are deleted and skipped.
    pub fn peek_batch_for(
        &self,
        limit: usize,
        max_bytes: u64,
        allowed: &[Priority],
    ) -> PipelineResult<Vec<EventRecord>> {
        if limit == 0 || allowed.is_empty() {
            return Ok(Vec::new());
        }
        self.flush_deferred()?;

        let codes = allowed
            .iter()
            .map(|p| p.code().to_string())
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "SELECT id, retry_count, state, size_bytes, body FROM events \
             WHERE state = {} AND priority IN ({}) \
             ORDER BY (priority = {}) DESC, id ASC LIMIT ?1",
            STATE_PENDING,
            codes,
            Priority::Immediate.code()
        );

        let mut conn = self.conn.lock();
        let mut batch = Vec::new();
        let mut malformed = Vec::new();
        {
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![limit as i64])?;
            let mut bytes = 0u64;

            while let Some(row) = rows.next()? {
                let id: i64 = row.get(0)?;
                let retry_count: i64 = row.get(1)?;
                let state: i64 = row.get(2)?;
                let size: i64 = row.get(3)?;
                let body: Vec<u8> = row.get(4)?;

                if !batch.is_empty() && bytes + size as u64 > max_bytes {
                    break;
                }

                match decode_row(id, retry_count, state, &body) {
                    Ok(record) => {
                        bytes += size as u64;
                        batch.push(record);
                    }
                    Err(e) => {
                        warn!(id, error = %e, "Dropping malformed record");
                        malformed.push(id);
                    }
                }
            }
        }

        if !malformed.is_empty() {
            let tx = conn.transaction()?;
            for id in &malformed {
                tx.execute("DELETE FROM events WHERE id = ?1", params![id])?;
            }
            tx.commit()?;
        }

        Ok(batch)
    }

    /// Transition `Pending` records to `InFlight`.
    ///
    /// Records already in flight are left alone, so repeating the call is a
    /// no-op. Returns the number of records that changed state.
    pub fn mark_in_flight(&self, ids: &[RecordId]) -> PipelineResult<usize> {
        let since = now_ms();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut changed = 0;
        for id in ids {
            changed += tx.execute(
                "UPDATE events SET state = ?1, in_flight_since_ms = ?2 \
                 WHERE id = ?3 AND state = ?4",
                params![STATE_IN_FLIGHT, since, id.0 as i64, STATE_PENDING],
            )?;
        }
        tx.commit()?;
        Ok(changed)
    }

    /// Permanently remove delivered records. Returns the number removed.
    pub fn mark_delivered(&self, ids: &[RecordId]) -> PipelineResult<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut removed = 0;
        for id in ids {
            removed += tx.execute("DELETE FROM events WHERE id = ?1", params![id.0 as i64])?;
        }
        tx.commit()?;
        Ok(removed)
    }

    /// Record one failed delivery attempt for each of `ids`.
    ///
    /// The retry count is incremented and the record returns to `Pending`.
    /// When the new count reaches `retry_ceiling` the record becomes `Failed`
    /// and is removed; it is reported in [`FailureOutcome::dropped`] and never
    /// retried again.
    pub fn mark_failed(
        &self,
        ids: &[RecordId],
        retry_ceiling: u32,
    ) -> PipelineResult<FailureOutcome> {
        let ceiling = retry_ceiling.max(1);
        let mut outcome = FailureOutcome::default();

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for id in ids {
            let current: Option<i64> = tx
                .query_row(
                    "SELECT retry_count FROM events WHERE id = ?1",
                    params![id.0 as i64],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(current) = current else {
                continue;
            };

            let attempts = current as u32 + 1;
            if attempts >= ceiling {
                tx.execute("DELETE FROM events WHERE id = ?1", params![id.0 as i64])?;
                outcome.dropped.push(*id);
            } else {
                tx.execute(
                    "UPDATE events SET retry_count = ?1, state = ?2, in_flight_since_ms = NULL \
                     WHERE id = ?3",
                    params![attempts as i64, STATE_PENDING, id.0 as i64],
                )?;
                outcome.max_retry_count = outcome.max_retry_count.max(attempts);
                outcome.requeued.push(*id);
            }
        }
        tx.commit()?;

        if !outcome.dropped.is_empty() {
            warn!(
                dropped = outcome.dropped.len(),
                ceiling, "Records reached retry ceiling and were dropped"
            );
        }
        Ok(outcome)
    }

    /// Return records stuck `InFlight` for at least `timeout` to `Pending`.
    ///
    /// Use a zero timeout at startup: nothing can legitimately be in flight
    /// before the first send of a new process.
    pub fn recover_stale_in_flight(&self, timeout: Duration) -> PipelineResult<usize> {
        let timeout_ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_ms().saturating_sub(timeout_ms);
        let conn = self.conn.lock();
        let recovered = conn.execute(
            "UPDATE events SET state = ?1, in_flight_since_ms = NULL \
             WHERE state = ?2 AND (in_flight_since_ms IS NULL OR in_flight_since_ms <= ?3)",
            params![STATE_PENDING, STATE_IN_FLIGHT, cutoff],
        )?;
        if recovered > 0 {
            info!(recovered, "Recovered stale in-flight records");
        }
        Ok(recovered)
    }

    /// Drop pending records until the stored size fits in `quota_bytes`.
    ///
    /// Victims are chosen lowest priority first (Normal, then High, then
    /// Immediate) and oldest first within a priority. Records in flight are
    /// never evicted. Returns the number of records dropped.
    pub fn evict_oldest(&self, quota_bytes: u64) -> PipelineResult<usize> {
        self.flush_deferred()?;

        let mut conn = self.conn.lock();
        let mut total: u64 = conn.query_row(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM events",
            [],
            |row| row.get::<_, i64>(0),
        )? as u64;

        if total <= quota_bytes {
            return Ok(0);
        }

        let mut victims = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT id, size_bytes FROM events WHERE state = ?1 \
                 ORDER BY priority ASC, id ASC",
            )?;
            let mut rows = stmt.query(params![STATE_PENDING])?;
            while total > quota_bytes {
                let Some(row) = rows.next()? else {
                    break;
                };
                let id: i64 = row.get(0)?;
                let size: i64 = row.get(1)?;
                victims.push(id);
                total = total.saturating_sub(size as u64);
            }
        }

        let tx = conn.transaction()?;
        for id in &victims {
            tx.execute("DELETE FROM events WHERE id = ?1", params![id])?;
        }
        tx.commit()?;

        warn!(
            evicted = victims.len(),
            quota_bytes,
            remaining_bytes = total,
            "Storage quota exceeded, evicted records"
        );
        Ok(victims.len())
    }

    /// Current queue counters, including deferred records.
    pub fn stats(&self) -> PipelineResult<StoreStats> {
        let deferred = self.deferred.lock();
        let mut stats = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT \
                    COALESCE(SUM(CASE WHEN state = ?1 THEN 1 ELSE 0 END), 0), \
                    COALESCE(SUM(CASE WHEN state = ?2 THEN 1 ELSE 0 END), 0), \
                    COALESCE(SUM(size_bytes), 0), \
                    MIN(CASE WHEN state = ?1 THEN timestamp_ms END), \
                    COALESCE(MAX(CASE WHEN state = ?1 AND priority = ?3 THEN 1 ELSE 0 END), 0) \
                 FROM events",
                params![
                    STATE_PENDING,
                    STATE_IN_FLIGHT,
                    Priority::Immediate.code() as i64
                ],
                |row| {
                    Ok(StoreStats {
                        pending: row.get::<_, i64>(0)? as usize,
                        in_flight: row.get::<_, i64>(1)? as usize,
                        total_bytes: row.get::<_, i64>(2)? as u64,
                        oldest_pending_ms: row.get(3)?,
                        immediate_pending: row.get::<_, i64>(4)? != 0,
                        deferred: 0,
                    })
                },
            )?
        };

        for encoded in deferred.iter() {
            stats.pending += 1;
            stats.deferred += 1;
            stats.total_bytes += encoded.body.len() as u64;
            stats.immediate_pending |= encoded.record.priority == Priority::Immediate;
            let ts = encoded.record.timestamp_ms;
            stats.oldest_pending_ms = Some(stats.oldest_pending_ms.map_or(ts, |o| o.min(ts)));
        }

        Ok(stats)
    }

    /// Number of pending or in-flight records with `id <= watermark`.
    pub fn outstanding_through(&self, watermark: RecordId) -> PipelineResult<usize> {
        let deferred = self.deferred.lock();
        let stored: i64 = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT COUNT(*) FROM events WHERE id <= ?1 AND state IN (?2, ?3)",
                params![watermark.0 as i64, STATE_PENDING, STATE_IN_FLIGHT],
                |row| row.get(0),
            )?
        };
        let buffered = deferred
            .iter()
            .filter(|e| e.record.id <= watermark)
            .count();
        Ok(stored as usize + buffered)
    }

    /// Look up a single stored record.
    pub fn get(&self, id: RecordId) -> PipelineResult<Option<EventRecord>> {
        if let Some(encoded) = self.deferred.lock().iter().find(|e| e.record.id == id) {
            return Ok(Some(encoded.record.clone()));
        }

        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, retry_count, state, body FROM events WHERE id = ?1",
                params![id.0 as i64],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Vec<u8>>(3)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(id, retry_count, state, body)| decode_row(id, retry_count, state, &body))
            .transpose()
    }
}

fn insert_row(conn: &Connection, encoded: &EncodedRecord) -> PipelineResult<()> {
    let record = &encoded.record;
    conn.execute(
        "INSERT INTO events (id, timestamp_ms, priority, retry_count, state, size_bytes, body) \
         VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6)",
        params![
            record.id.0 as i64,
            record.timestamp_ms,
            record.priority.code() as i64,
            STATE_PENDING,
            encoded.body.len() as i64,
            encoded.body,
        ],
    )?;
    Ok(())
}

/// Decode a row body, with the row's columns taking precedence over the
/// state captured in the body at insert time.
fn decode_row(id: i64, retry_count: i64, state: i64, body: &[u8]) -> PipelineResult<EventRecord> {
    let mut record = deserialize(body)?;
    if record.id.0 != id as u64 {
        return Err(PipelineError::MalformedRecord(format!(
            "row {} holds body for record {}",
            id, record.id.0
        )));
    }
    record.retry_count = retry_count as u32;
    record.state = RecordState::from_code(state as u8).ok_or_else(|| {
        PipelineError::MalformedRecord(format!("row {} has unknown state {}", id, state))
    })?;
    Ok(record)
}
