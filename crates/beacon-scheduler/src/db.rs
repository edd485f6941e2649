use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{types::Type, Connection};

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `jobs` and `instances` tables (idempotent), the
/// `(status, run_at)` index the due-work scan relies on, and a partial unique
/// index that allows at most one live (pending or running) instance per job
/// generation.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id          TEXT    NOT NULL PRIMARY KEY,  -- UUID v7 generation id
            path        TEXT    NOT NULL UNIQUE,
            body        BLOB    NOT NULL,
            interval_ms INTEGER,                       -- NULL for one-off jobs
            one_off     INTEGER NOT NULL,
            created_at  TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS instances (
            id          TEXT    NOT NULL PRIMARY KEY,
            job_id      TEXT    NOT NULL,              -- no FK: running rows outlive their job
            job_path    TEXT    NOT NULL,
            run_at      TEXT    NOT NULL,              -- next attempt; moves with retry backoff
            scheduled_at TEXT   NOT NULL,              -- firing slot; retries never move it
            status      TEXT    NOT NULL DEFAULT 'pending',
            locked_by   TEXT,
            locked_at   TEXT,
            attempt     INTEGER NOT NULL DEFAULT 0,
            last_error  TEXT,
            created_at  TEXT    NOT NULL,
            updated_at  TEXT    NOT NULL
        ) STRICT;

        -- Due-work scan: WHERE status = 'pending' AND run_at <= ? ORDER BY run_at
        CREATE INDEX IF NOT EXISTS idx_instances_status_run_at
            ON instances (status, run_at);

        CREATE INDEX IF NOT EXISTS idx_instances_job_id
            ON instances (job_id);

        CREATE UNIQUE INDEX IF NOT EXISTS idx_instances_one_live_per_job
            ON instances (job_id) WHERE status IN ('pending', 'running');
        ",
    )?;
    Ok(())
}

/// Fixed-width RFC 3339 rendering, so lexical order in SQL equals time order.
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a timestamp column written by [`ts`].
pub(crate) fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
