//! Connection pragmas and schema migrations for the record store.

use rusqlite::Connection;

use crate::error::PipelineResult;

/// Current schema version, stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i32 = 1;

/// Apply durability and performance pragmas.
///
/// `synchronous = FULL` so a committed enqueue survives a crash of the
/// process or the machine.
pub fn apply_pragmas(conn: &Connection) -> PipelineResult<()> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = FULL;
        PRAGMA busy_timeout = 5000;
        PRAGMA temp_store = MEMORY;
        ",
    )?;
    Ok(())
}

/// Bring the schema up to [`SCHEMA_VERSION`].
pub fn run_migrations(conn: &Connection) -> PipelineResult<()> {
    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if version < 1 {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS events (
                id                 INTEGER PRIMARY KEY,
                timestamp_ms       INTEGER NOT NULL,
                priority           INTEGER NOT NULL,
                retry_count        INTEGER NOT NULL DEFAULT 0,
                state              INTEGER NOT NULL DEFAULT 0,
                in_flight_since_ms INTEGER,
                size_bytes         INTEGER NOT NULL,
                body               BLOB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_state_priority
                ON events (state, priority, id);
            PRAGMA user_version = 1;
            ",
        )?;
        tracing::debug!(from = version, to = 1, "Record store schema migrated");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version: i32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_pragmas_apply_to_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(dir.path().join("events.db")).unwrap();
        apply_pragmas(&conn).unwrap();

        let mode: String = conn
            .pragma_query_value(None, "journal_mode", |row| row.get(0))
            .unwrap();
        assert!(mode.eq_ignore_ascii_case("wal"));
    }
}
