use std::{path::Path, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::Result;

/// Every job execution unit writes to the same file, so writers wait rather
/// than fail when the database is briefly locked.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `jobs`, `job_dependencies` and `logs` tables (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id                       INTEGER NOT NULL PRIMARY KEY,
            name                     TEXT    NOT NULL,
            command                  TEXT    NOT NULL,
            args                     TEXT    NOT NULL DEFAULT '',
            schedule                 TEXT    NOT NULL,   -- JSON-encoded Schedule enum
            enabled                  INTEGER NOT NULL DEFAULT 1,
            next_run                 TEXT,               -- RFC 3339 (micros, Z) or NULL
            timeout_seconds          INTEGER NOT NULL DEFAULT 0,
            is_running               INTEGER NOT NULL DEFAULT 0,
            force_run                INTEGER NOT NULL DEFAULT 0,
            force_stop               INTEGER NOT NULL DEFAULT 0,
            last_run_start_timestamp TEXT,
            last_run_successful      INTEGER,
            last_heartbeat           TEXT,
            current_pid              INTEGER,
            created_at               TEXT    NOT NULL,
            updated_at               TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_jobs_next_run ON jobs (next_run);

        CREATE TABLE IF NOT EXISTS job_dependencies (
            dependent_id        INTEGER NOT NULL,
            dependee_id         INTEGER NOT NULL,
            wait_for_completion INTEGER NOT NULL DEFAULT 1,
            wait_for_success    INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (dependent_id, dependee_id)
        ) STRICT;

        CREATE TABLE IF NOT EXISTS logs (
            id                 INTEGER NOT NULL PRIMARY KEY,
            job_id             INTEGER NOT NULL,
            run_start_datetime TEXT    NOT NULL,
            run_end_datetime   TEXT    NOT NULL,
            duration_seconds   REAL    NOT NULL,
            success            INTEGER NOT NULL,
            on_time            INTEGER NOT NULL,
            hostname           TEXT    NOT NULL,
            stdout             TEXT    NOT NULL,
            stderr             TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_logs_job_id ON logs (job_id);
        ",
    )?;
    Ok(())
}

/// Open (creating if needed) the database file at `path` and apply the
/// connection pragmas and schema.
pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    init_db(&conn)?;
    Ok(conn)
}

/// Fixed-width timestamp format so text comparison in SQL orders correctly.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
