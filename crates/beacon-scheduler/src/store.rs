use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use beacon_core::config::DEFAULT_BUSY_TIMEOUT_MS;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use tracing::debug;
use uuid::Uuid;

use crate::{
    db::{init_db, parse_ts, ts},
    error::{Result, SchedulerError},
    schedule::first_run,
    types::{DueInstance, Instance, InstanceStatus, Job, JobPath, Registration},
};

/// How long a writer waits for another process to release the database lock.
const BUSY_TIMEOUT: Duration = Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS);

const INSTANCE_COLUMNS: &str = "id, job_id, job_path, run_at, status, locked_by, locked_at,
                                attempt, last_error, created_at, updated_at, scheduled_at";

const JOB_COLUMNS: &str = "id, path, body, interval_ms, one_off, created_at";

/// Result of an attempt to claim an instance.
#[derive(Debug)]
pub enum Claim {
    /// This worker now exclusively owns the dispatch; carries the updated row.
    Won(Instance),
    /// Another worker got there first, or the row is no longer claimable.
    Lost,
}

/// Result of recording a successful dispatch.
#[derive(Debug)]
pub enum Completion {
    /// Marked done; no further firing.
    Done,
    /// Marked done and the next firing was inserted.
    Rescheduled(Instance),
    /// Our claim expired and was taken over; nothing was written.
    ClaimLost,
}

/// What to do with an instance whose dispatch failed.
#[derive(Debug, Clone, Copy)]
pub enum FailureAction {
    Retry { run_at: DateTime<Utc> },
    Fail,
}

/// Result of recording a failed dispatch.
#[derive(Debug)]
pub enum FailureRecord {
    Retrying { run_at: DateTime<Utc> },
    Failed,
    /// The job generation is gone; the instance was dropped instead of retried.
    Orphaned,
    ClaimLost,
}

/// Handle on the shared SQLite store.
///
/// Cloning is cheap and every clone shares one connection. Separate processes
/// (or separate `Store::open` calls) get separate connections to the same
/// file and coordinate purely through SQLite's locking.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (creating if necessary) the database at `path` and bootstrap the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_busy_timeout(path, BUSY_TIMEOUT)
    }

    /// [`open`](Self::open) with an explicit wait for locks held by other connections.
    pub fn open_with_busy_timeout(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::init(conn)
    }

    /// Wrap an already-open connection, initialising the schema if needed.
    pub fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // Open transactions roll back on drop, so a poisoned guard is still consistent.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // --- registry primitives ----------------------------------------------

    /// Insert a job and its first instance in one transaction.
    pub fn insert_job(&self, reg: &Registration, now: DateTime<Utc>) -> Result<(Job, Instance)> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM jobs WHERE path = ?1",
                [reg.path.as_str()],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(old_id) = existing {
            if !reg.replace {
                return Err(SchedulerError::Conflict {
                    path: reg.path.to_string(),
                });
            }
            let dropped = tx.execute(
                "DELETE FROM instances WHERE job_id = ?1 AND status = 'pending'",
                [&old_id],
            )?;
            tx.execute("DELETE FROM jobs WHERE id = ?1", [&old_id])?;
            debug!(job_path = %reg.path, old_job_id = %old_id, dropped, "replacing job");
        }

        let job = Job {
            id: Uuid::now_v7().to_string(),
            path: reg.path.clone(),
            body: reg.body.clone(),
            interval_ms: reg.schedule.interval().map(|d| d.num_milliseconds()),
            one_off: reg.schedule.is_one_off(),
            created_at: now,
        };
        tx.execute(
            "INSERT INTO jobs (id, path, body, interval_ms, one_off, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                job.id,
                job.path.as_str(),
                job.body,
                job.interval_ms,
                job.one_off,
                ts(now)
            ],
        )
        .map_err(|e| conflict_or(e, &reg.path))?;

        let instance = insert_instance(&tx, &job, first_run(&reg.schedule, now), now)?;
        tx.commit()?;
        Ok((job, instance))
    }

    /// Delete the job at `path` together with its pending instances.
    ///
    /// Running instances are left alone. Returns the number of pending
    /// instances removed.
    pub fn delete_job(&self, path: &JobPath) -> Result<usize> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let job_id: String = tx
            .query_row("SELECT id FROM jobs WHERE path = ?1", [path.as_str()], |r| {
                r.get(0)
            })
            .optional()?
            .ok_or_else(|| SchedulerError::JobNotFound {
                path: path.to_string(),
            })?;
        let dropped = tx.execute(
            "DELETE FROM instances WHERE job_id = ?1 AND status = 'pending'",
            [&job_id],
        )?;
        tx.execute("DELETE FROM jobs WHERE id = ?1", [&job_id])?;
        tx.commit()?;
        Ok(dropped)
    }

    pub fn get_job(&self, path: &JobPath) -> Result<Option<Job>> {
        let conn = self.lock();
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE path = ?1"),
                [path.as_str()],
                |row| row_to_job(row, 0),
            )
            .optional()?;
        Ok(job)
    }

    /// All instances of one job generation, oldest first.
    pub fn instances_for_job(&self, job_id: &str) -> Result<Vec<Instance>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM instances WHERE job_id = ?1 ORDER BY run_at, id"
        ))?;
        let rows = stmt.query_map([job_id], |row| row_to_instance(row, 0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_instance(&self, id: &str) -> Result<Option<Instance>> {
        let conn = self.lock();
        Ok(select_instance(&conn, id)?)
    }

    /// Most recently updated instances with the given status.
    pub fn instances_with_status(
        &self,
        status: InstanceStatus,
        limit: usize,
    ) -> Result<Vec<Instance>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM instances
             WHERE status = ?1
             ORDER BY updated_at DESC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![status.as_str(), limit as i64], |row| {
            row_to_instance(row, 0)
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Operator reset: a `failed` instance of a live job becomes `pending`
    /// again with a fresh attempt budget and `run_at = now`.
    pub fn reset_instance(&self, id: &str, now: DateTime<Utc>) -> Result<Instance> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let n = tx
            .execute(
                "UPDATE instances
                 SET status = 'pending', attempt = 0, run_at = ?2, last_error = NULL,
                     locked_by = NULL, locked_at = NULL, updated_at = ?2
                 WHERE id = ?1 AND status = 'failed'
                   AND job_id IN (SELECT id FROM jobs)",
                params![id, ts(now)],
            )
            .map_err(|e| match e.sqlite_error_code() {
                // another firing of the same job is already live
                Some(ErrorCode::ConstraintViolation) => SchedulerError::Conflict {
                    path: format!("instance {id}"),
                },
                _ => SchedulerError::Database(e),
            })?;
        if n == 0 {
            return Err(SchedulerError::InstanceNotFound { id: id.to_string() });
        }
        let instance = select_instance(&tx, id)?
            .ok_or_else(|| SchedulerError::InstanceNotFound { id: id.to_string() })?;
        tx.commit()?;
        Ok(instance)
    }

    /// Number of instances per status. Statuses with no rows report zero.
    pub fn status_counts(&self) -> Result<Vec<(InstanceStatus, u64)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM instances GROUP BY status")?;
        let mut counts: Vec<(InstanceStatus, u64)> =
            InstanceStatus::ALL.iter().map(|s| (*s, 0)).collect();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, n) = row?;
            if let Some(slot) = counts.iter_mut().find(|(s, _)| s.as_str() == status) {
                slot.1 = n as u64;
            }
        }
        Ok(counts)
    }

    // --- poller primitives --------------------------------------------------

    /// Claimable instances of live jobs, oldest `run_at` first, ties by path.
    ///
    /// A `pending` row is due once `run_at <= now`; a `running` row is
    /// claimable again once its `locked_at <= stale_before`.
    pub fn due_instances(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<DueInstance>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT i.id, i.job_id, i.job_path, i.run_at, i.status, i.locked_by, i.locked_at,
                    i.attempt, i.last_error, i.created_at, i.updated_at, i.scheduled_at,
                    j.id, j.path, j.body, j.interval_ms, j.one_off, j.created_at
             FROM instances i
             JOIN jobs j ON j.id = i.job_id
             WHERE (i.status = 'pending' AND i.run_at <= ?1)
                OR (i.status = 'running' AND i.locked_at <= ?2 AND i.attempt < ?3)
             ORDER BY i.run_at, i.job_path
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![ts(now), ts(stale_before), max_attempts, limit as i64],
            |row| {
                Ok(DueInstance {
                    instance: row_to_instance(row, 0)?,
                    job: row_to_job(row, 12)?,
                })
            },
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Fail stale `running` rows that already used their last attempt.
    ///
    /// Their worker died mid-dispatch on the final try; re-claiming would
    /// exceed the retry ceiling.
    pub fn fail_exhausted_stale(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<usize> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE instances
             SET status = 'failed', locked_by = NULL, locked_at = NULL,
                 last_error = COALESCE(last_error, 'claim expired on final attempt'),
                 updated_at = ?1
             WHERE status = 'running' AND locked_at <= ?2 AND attempt >= ?3",
            params![ts(now), ts(stale_before), max_attempts],
        )?;
        Ok(n)
    }

    /// Drop live instances whose job generation was unregistered.
    ///
    /// Pending orphans can only appear when a retry raced an unregister;
    /// running orphans are removed once their claim has gone stale.
    pub fn purge_orphans(&self, stale_before: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock();
        let n = conn.execute(
            "DELETE FROM instances
             WHERE (status = 'pending' OR (status = 'running' AND locked_at <= ?1))
               AND job_id NOT IN (SELECT id FROM jobs)",
            [ts(stale_before)],
        )?;
        Ok(n)
    }

    // --- executor primitives ------------------------------------------------

    /// Atomically claim `instance_id` for `worker`.
    ///
    /// The single conditional `UPDATE` is the whole mutual-exclusion story:
    /// it matches at most one row, and only while the row is still due
    /// (`pending`) or its previous claim has gone stale.
    pub fn claim(
        &self,
        instance_id: &str,
        worker: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Claim> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now_s = ts(now);
        let n = tx.execute(
            "UPDATE instances
             SET status = 'running', locked_by = ?2, locked_at = ?3,
                 attempt = attempt + 1, updated_at = ?3
             WHERE id = ?1
               AND ((status = 'pending' AND run_at <= ?3)
                 OR (status = 'running' AND locked_at <= ?4 AND attempt < ?5))",
            params![instance_id, worker, now_s, ts(stale_before), max_attempts],
        )?;
        if n == 0 {
            return Ok(Claim::Lost);
        }
        let instance = select_instance(&tx, instance_id)?.ok_or(SchedulerError::InstanceNotFound {
            id: instance_id.to_string(),
        })?;
        tx.commit()?;
        Ok(Claim::Won(instance))
    }

    /// Mark a claimed instance done and, if `next_run_at` is set and the job
    /// generation still exists, insert the next firing.
    ///
    /// Completing a one-off job removes the job row; the done instance stays
    /// as history.
    pub fn complete(
        &self,
        claimed: &Instance,
        worker: &str,
        now: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<Completion> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let n = tx.execute(
            "UPDATE instances
             SET status = 'done', locked_by = NULL, locked_at = NULL, updated_at = ?3
             WHERE id = ?1 AND status = 'running' AND locked_by = ?2",
            params![claimed.id, worker, ts(now)],
        )?;
        if n == 0 {
            return Ok(Completion::ClaimLost);
        }

        let outcome = match (select_job_by_id(&tx, &claimed.job_id)?, next_run_at) {
            // a delivered one-off job is finished; its path is free again
            (Some(job), _) if job.one_off => {
                tx.execute("DELETE FROM jobs WHERE id = ?1", [&job.id])?;
                Completion::Done
            }
            (Some(job), Some(run_at)) => {
                Completion::Rescheduled(insert_instance(&tx, &job, run_at, now)?)
            }
            _ => Completion::Done,
        };
        tx.commit()?;
        Ok(outcome)
    }

    /// Record a failed dispatch on a claimed instance.
    pub fn record_failure(
        &self,
        claimed: &Instance,
        worker: &str,
        now: DateTime<Utc>,
        error: &str,
        action: FailureAction,
    ) -> Result<FailureRecord> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now_s = ts(now);

        let job_alive = select_job_by_id(&tx, &claimed.job_id)?.is_some();
        let (n, record) = match action {
            FailureAction::Retry { .. } if !job_alive => {
                let n = tx.execute(
                    "DELETE FROM instances WHERE id = ?1 AND status = 'running' AND locked_by = ?2",
                    params![claimed.id, worker],
                )?;
                (n, FailureRecord::Orphaned)
            }
            FailureAction::Retry { run_at } => {
                let n = tx.execute(
                    "UPDATE instances
                     SET status = 'pending', run_at = ?3, locked_by = NULL, locked_at = NULL,
                         last_error = ?4, updated_at = ?5
                     WHERE id = ?1 AND status = 'running' AND locked_by = ?2",
                    params![claimed.id, worker, ts(run_at), error, now_s],
                )?;
                (n, FailureRecord::Retrying { run_at })
            }
            FailureAction::Fail => {
                let n = tx.execute(
                    "UPDATE instances
                     SET status = 'failed', locked_by = NULL, locked_at = NULL,
                         last_error = ?3, updated_at = ?4
                     WHERE id = ?1 AND status = 'running' AND locked_by = ?2",
                    params![claimed.id, worker, error, now_s],
                )?;
                (n, FailureRecord::Failed)
            }
        };
        if n == 0 {
            return Ok(FailureRecord::ClaimLost);
        }
        tx.commit()?;
        Ok(record)
    }
}

fn insert_instance(
    conn: &Connection,
    job: &Job,
    run_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Instance> {
    let instance = Instance {
        id: Uuid::now_v7().to_string(),
        job_id: job.id.clone(),
        job_path: job.path.to_string(),
        run_at,
        scheduled_at: run_at,
        status: InstanceStatus::Pending,
        locked_by: None,
        locked_at: None,
        attempt: 0,
        last_error: None,
        created_at: now,
        updated_at: now,
    };
    conn.execute(
        "INSERT INTO instances
         (id, job_id, job_path, run_at, scheduled_at, status, locked_by, locked_at,
          attempt, last_error, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4, 'pending', NULL, NULL, 0, NULL, ?5, ?5)",
        params![
            instance.id,
            instance.job_id,
            instance.job_path,
            ts(run_at),
            ts(now)
        ],
    )?;
    Ok(instance)
}

fn select_instance(conn: &Connection, id: &str) -> rusqlite::Result<Option<Instance>> {
    conn.query_row(
        &format!("SELECT {INSTANCE_COLUMNS} FROM instances WHERE id = ?1"),
        [id],
        |row| row_to_instance(row, 0),
    )
    .optional()
}

fn select_job_by_id(conn: &Connection, id: &str) -> rusqlite::Result<Option<Job>> {
    conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
        [id],
        |row| row_to_job(row, 0),
    )
    .optional()
}

fn conflict_or(e: rusqlite::Error, path: &JobPath) -> SchedulerError {
    match e.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => SchedulerError::Conflict {
            path: path.to_string(),
        },
        _ => SchedulerError::Database(e),
    }
}

/// Map columns `base..base+12` (order of `INSTANCE_COLUMNS`) to an `Instance`.
fn row_to_instance(row: &Row<'_>, base: usize) -> rusqlite::Result<Instance> {
    let status_str: String = row.get(base + 4)?;
    let status = status_str.parse::<InstanceStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(base + 4, rusqlite::types::Type::Text, e.into())
    })?;
    let locked_at = match row.get::<_, Option<String>>(base + 6)? {
        Some(raw) => Some(parse_ts(base + 6, &raw)?),
        None => None,
    };
    Ok(Instance {
        id: row.get(base)?,
        job_id: row.get(base + 1)?,
        job_path: row.get(base + 2)?,
        run_at: parse_ts(base + 3, &row.get::<_, String>(base + 3)?)?,
        status,
        locked_by: row.get(base + 5)?,
        locked_at,
        attempt: row.get(base + 7)?,
        last_error: row.get(base + 8)?,
        created_at: parse_ts(base + 9, &row.get::<_, String>(base + 9)?)?,
        updated_at: parse_ts(base + 10, &row.get::<_, String>(base + 10)?)?,
        scheduled_at: parse_ts(base + 11, &row.get::<_, String>(base + 11)?)?,
    })
}

/// Map columns `base..base+6` (order of `JOB_COLUMNS`) to a `Job`.
fn row_to_job(row: &Row<'_>, base: usize) -> rusqlite::Result<Job> {
    let path_str: String = row.get(base + 1)?;
    let path = JobPath::parse(&path_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(base + 1, rusqlite::types::Type::Text, e.into())
    })?;
    Ok(Job {
        id: row.get(base)?,
        path,
        body: row.get(base + 2)?,
        interval_ms: row.get(base + 3)?,
        one_off: row.get(base + 4)?,
        created_at: parse_ts(base + 5, &row.get::<_, String>(base + 5)?)?,
    })
}
