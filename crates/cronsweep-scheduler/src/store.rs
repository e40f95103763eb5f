//! Job store: the persisted view of jobs, dependencies and logs.
//!
//! The scheduler loop only talks to the [`JobStore`] trait. [`SqliteJobStore`]
//! is the production implementation; every process (coordinator and each
//! execution unit) opens its own instance.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use tracing::{debug, info, instrument, warn};

use crate::{
    db::{self, fmt_ts, parse_ts},
    error::{Result, SchedulerError},
    lock::pid_exists,
    schedule::{compute_next_run, validate},
    types::{Job, JobDependency, JobId, Log, NewJob, Schedule},
};

/// Operations the scheduler loop needs from persistent storage.
///
/// An empty `filter` slice means "no filter".
pub trait JobStore {
    /// Jobs that are due and whose dependencies are currently satisfied.
    fn select_due(&self, filter: &[JobId]) -> Result<Vec<Job>>;

    /// Every job, regardless of schedule.
    fn select_all(&self, filter: &[JobId]) -> Result<Vec<Job>>;

    /// Re-evaluate `job`'s dependencies against the persisted dependee rows.
    fn dependencies_met(&self, job: &Job) -> Result<bool>;

    fn count_running(&self) -> Result<usize>;

    /// Clear running flags on jobs whose execution unit is gone. Returns the
    /// number of jobs ended.
    fn end_all_stale(&self) -> Result<usize>;

    /// Write back the mutable state of `job`.
    fn persist(&self, job: &Job) -> Result<()>;

    /// Re-read the authoritative row for `id`.
    fn reload(&self, id: JobId) -> Result<Job>;

    /// Insert a terminal log record, returning its id.
    fn create_log(&self, log: &Log) -> Result<i64>;

    /// Write back `job` and insert its terminal `log` as one atomic unit, so
    /// a job is never cleared without its log or logged while still running.
    fn record_outcome(&self, job: &Job, log: &Log) -> Result<i64>;

    /// Record the pid of a just-launched execution unit, unless the job has
    /// already finished.
    fn set_running_pid(&self, id: JobId, pid: u32) -> Result<()>;

    /// Close the current handle and acquire a fresh one.
    fn reset(&mut self) -> Result<()>;
}

const JOB_COLUMNS: &str = "id, name, command, args, schedule, enabled, next_run, timeout_seconds,
     is_running, force_run, force_stop, last_run_start_timestamp, last_run_successful,
     last_heartbeat, current_pid";

const LOG_COLUMNS: &str = "id, job_id, run_start_datetime, run_end_datetime, success, on_time,
     hostname, stdout, stderr";

/// [`JobStore`] backed by a single SQLite connection.
pub struct SqliteJobStore {
    conn: Connection,
    /// `None` for in-memory stores, which cannot be reopened.
    path: Option<PathBuf>,
}

impl SqliteJobStore {
    /// Open the database file at `path`, creating the schema if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = db::open(&path)?;
        Ok(Self {
            conn,
            path: Some(path),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        db::init_db(&conn)?;
        Ok(Self { conn, path: None })
    }

    // --- management --------------------------------------------------------

    /// Insert a new job, computing its first `next_run`.
    #[instrument(skip(self, new), fields(name = %new.name))]
    pub fn add_job(&self, new: NewJob) -> Result<Job> {
        validate(&new.schedule)?;
        let now = Utc::now();
        let now_str = fmt_ts(now);
        let next_run = compute_next_run(&new.schedule, now);
        let schedule_json = serde_json::to_string(&new.schedule)
            .map_err(|e| SchedulerError::InvalidSchedule(e.to_string()))?;

        self.conn.execute(
            "INSERT INTO jobs
             (name, command, args, schedule, enabled, next_run, timeout_seconds,
              created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                new.name,
                new.command,
                new.args,
                schedule_json,
                new.enabled,
                next_run.map(fmt_ts),
                timeout_to_sql(new.timeout_seconds),
                now_str
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        info!(job_id = id, "job added");
        self.reload(id)
    }

    /// Make `dependent` wait on `dependency.dependee_id`. Re-adding an edge
    /// replaces its flags.
    pub fn add_dependency(&self, dependent: JobId, dependency: &JobDependency) -> Result<()> {
        for id in [dependent, dependency.dependee_id] {
            if !self.exists(id)? {
                return Err(SchedulerError::JobNotFound { id });
            }
        }
        self.conn.execute(
            "INSERT OR REPLACE INTO job_dependencies
             (dependent_id, dependee_id, wait_for_completion, wait_for_success)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                dependent,
                dependency.dependee_id,
                dependency.wait_for_completion,
                dependency.wait_for_success
            ],
        )?;
        debug!(dependent, dependee = dependency.dependee_id, "dependency added");
        Ok(())
    }

    /// Remove a job and every dependency edge touching it. Its logs are kept.
    pub fn remove_job(&self, id: JobId) -> Result<()> {
        self.conn.execute(
            "DELETE FROM job_dependencies WHERE dependent_id = ?1 OR dependee_id = ?1",
            [id],
        )?;
        let n = self.conn.execute("DELETE FROM jobs WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id });
        }
        info!(job_id = id, "job removed");
        Ok(())
    }

    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        self.select_all(&[])
    }

    /// Most recent logs for `job_id`, newest first.
    pub fn list_logs(&self, job_id: JobId, limit: usize) -> Result<Vec<Log>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {LOG_COLUMNS} FROM logs WHERE job_id = ?1 ORDER BY id DESC LIMIT ?2"
        ))?;
        let logs = stmt
            .query_map(params![job_id, limit as i64], row_to_log)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(logs)
    }

    /// Ask the scheduler to run `id` on its next sweep regardless of schedule.
    pub fn request_run(&self, id: JobId) -> Result<()> {
        self.set_flag(id, "force_run")
    }

    /// Ask a running job's execution unit to stop at its next heartbeat.
    pub fn request_stop(&self, id: JobId) -> Result<()> {
        self.set_flag(id, "force_stop")
    }

    /// Record a heartbeat for `id`. Returns `true` when a stop was requested.
    pub fn heartbeat(&self, id: JobId) -> Result<bool> {
        let now = fmt_ts(Utc::now());
        let n = self.conn.execute(
            "UPDATE jobs SET last_heartbeat = ?1, updated_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id });
        }
        let stop: bool =
            self.conn
                .query_row("SELECT force_stop FROM jobs WHERE id = ?1", [id], |r| {
                    r.get(0)
                })?;
        Ok(stop)
    }

    // --- private helpers ---------------------------------------------------

    fn set_flag(&self, id: JobId, column: &'static str) -> Result<()> {
        let n = self.conn.execute(
            &format!("UPDATE jobs SET {column} = 1, updated_at = ?1 WHERE id = ?2"),
            params![fmt_ts(Utc::now()), id],
        )?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id });
        }
        Ok(())
    }

    fn exists(&self, id: JobId) -> Result<bool> {
        Ok(self
            .conn
            .query_row("SELECT 1 FROM jobs WHERE id = ?1", [id], |_| Ok(()))
            .optional()?
            .is_some())
    }

    fn query_jobs(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<Job>> {
        // Collect eagerly so `stmt` is dropped before the dependency queries.
        let mut jobs = {
            let mut stmt = self.conn.prepare_cached(sql)?;
            let rows = stmt
                .query_map(args, row_to_job)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        for job in &mut jobs {
            job.dependencies = self.load_dependencies(job.id)?;
        }
        Ok(jobs)
    }

    fn load_dependencies(&self, id: JobId) -> Result<Vec<JobDependency>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT dependee_id, wait_for_completion, wait_for_success
             FROM job_dependencies WHERE dependent_id = ?1 ORDER BY dependee_id",
        )?;
        let deps = stmt
            .query_map([id], |row| {
                Ok(JobDependency {
                    dependee_id: row.get(0)?,
                    wait_for_completion: row.get(1)?,
                    wait_for_success: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(deps)
    }
}

impl JobStore for SqliteJobStore {
    fn select_due(&self, filter: &[JobId]) -> Result<Vec<Job>> {
        let now = fmt_ts(Utc::now());
        let candidates = self.query_jobs(
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE enabled = 1 AND is_running = 0
                   AND (force_run = 1 OR (next_run IS NOT NULL AND next_run <= ?1))
                 ORDER BY id"
            ),
            [&now],
        )?;

        let mut due = Vec::with_capacity(candidates.len());
        for job in candidates {
            if !matches_filter(filter, job.id) {
                continue;
            }
            if self.dependencies_met(&job)? {
                due.push(job);
            } else {
                debug!(job_id = job.id, "due but dependencies unmet");
            }
        }
        Ok(due)
    }

    fn select_all(&self, filter: &[JobId]) -> Result<Vec<Job>> {
        let jobs = self.query_jobs(&format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY id"), [])?;
        Ok(jobs
            .into_iter()
            .filter(|j| matches_filter(filter, j.id))
            .collect())
    }

    fn dependencies_met(&self, job: &Job) -> Result<bool> {
        for dep in &job.dependencies {
            let state: Option<(bool, Option<bool>)> = self
                .conn
                .query_row(
                    "SELECT is_running, last_run_successful FROM jobs WHERE id = ?1",
                    [dep.dependee_id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            let Some((running, last_ok)) = state else {
                // Deleted dependees never block.
                continue;
            };
            if dep.wait_for_completion && running {
                return Ok(false);
            }
            if dep.wait_for_success && last_ok == Some(false) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn count_running(&self) -> Result<usize> {
        let n: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM jobs WHERE is_running = 1", [], |r| {
                    r.get(0)
                })?;
        Ok(n as usize)
    }

    fn end_all_stale(&self) -> Result<usize> {
        let running: Vec<(JobId, Option<u32>)> = {
            let mut stmt = self
                .conn
                .prepare_cached("SELECT id, current_pid FROM jobs WHERE is_running = 1")?;
            let rows = stmt
                .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let now = fmt_ts(Utc::now());
        let mut ended = 0;
        for (id, pid) in running {
            if pid.is_some_and(pid_exists) {
                continue;
            }
            self.conn.execute(
                "UPDATE jobs SET is_running = 0, force_run = 0, force_stop = 0,
                                 current_pid = NULL, updated_at = ?1
                 WHERE id = ?2",
                params![now, id],
            )?;
            warn!(job_id = id, pid = ?pid, "ended stale running job");
            ended += 1;
        }
        Ok(ended)
    }

    fn persist(&self, job: &Job) -> Result<()> {
        let schedule_json = serde_json::to_string(&job.schedule)
            .map_err(|e| SchedulerError::InvalidSchedule(e.to_string()))?;
        let n = self.conn.execute(
            "UPDATE jobs SET
                name = ?1, command = ?2, args = ?3, schedule = ?4, enabled = ?5,
                next_run = ?6, timeout_seconds = ?7, is_running = ?8, force_run = ?9,
                force_stop = ?10, last_run_start_timestamp = ?11,
                last_run_successful = ?12, last_heartbeat = ?13, current_pid = ?14,
                updated_at = ?15
             WHERE id = ?16",
            params![
                job.name,
                job.command,
                job.args,
                schedule_json,
                job.enabled,
                job.next_run.map(fmt_ts),
                timeout_to_sql(job.timeout_seconds),
                job.is_running,
                job.force_run,
                job.force_stop,
                job.last_run_start_timestamp.map(fmt_ts),
                job.last_run_successful,
                job.last_heartbeat.map(fmt_ts),
                job.current_pid,
                fmt_ts(Utc::now()),
                job.id
            ],
        )?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id: job.id });
        }
        Ok(())
    }

    fn reload(&self, id: JobId) -> Result<Job> {
        self.query_jobs(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"), [id])?
            .pop()
            .ok_or(SchedulerError::JobNotFound { id })
    }

    fn create_log(&self, log: &Log) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO logs
             (job_id, run_start_datetime, run_end_datetime, duration_seconds,
              success, on_time, hostname, stdout, stderr)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                log.job_id,
                fmt_ts(log.run_start_datetime),
                fmt_ts(log.run_end_datetime),
                log.duration_seconds(),
                log.success,
                log.on_time,
                log.hostname,
                log.stdout,
                log.stderr
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        debug!(job_id = log.job_id, log_id = id, success = log.success, "log created");
        Ok(id)
    }

    fn record_outcome(&self, job: &Job, log: &Log) -> Result<i64> {
        let tx = self.conn.unchecked_transaction()?;
        self.persist(job)?;
        let id = self.create_log(log)?;
        tx.commit()?;
        Ok(id)
    }

    fn set_running_pid(&self, id: JobId, pid: u32) -> Result<()> {
        self.conn.execute(
            "UPDATE jobs SET current_pid = ?1, updated_at = ?2 WHERE id = ?3 AND is_running = 1",
            params![pid, fmt_ts(Utc::now()), id],
        )?;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        let fresh = db::open(&path)?;
        let stale = std::mem::replace(&mut self.conn, fresh);
        if let Err((_, e)) = stale.close() {
            warn!("closing previous store connection failed: {e}");
        }
        Ok(())
    }
}

fn matches_filter(filter: &[JobId], id: JobId) -> bool {
    filter.is_empty() || filter.contains(&id)
}

fn timeout_to_sql(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}

fn ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    Ok(raw.as_deref().and_then(parse_ts))
}

fn required_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    ts_column(row, idx)?.ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, "bad timestamp".into())
    })
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let schedule_json: String = row.get(4)?;
    let schedule: Schedule = serde_json::from_str(&schedule_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;
    let timeout: i64 = row.get(7)?;
    Ok(Job {
        id: row.get(0)?,
        name: row.get(1)?,
        command: row.get(2)?,
        args: row.get(3)?,
        schedule,
        enabled: row.get(5)?,
        next_run: ts_column(row, 6)?,
        dependencies: Vec::new(),
        timeout_seconds: timeout.max(0) as u64,
        is_running: row.get(8)?,
        force_run: row.get(9)?,
        force_stop: row.get(10)?,
        last_run_start_timestamp: ts_column(row, 11)?,
        last_run_successful: row.get(12)?,
        last_heartbeat: ts_column(row, 13)?,
        current_pid: row.get(14)?,
    })
}

fn row_to_log(row: &Row<'_>) -> rusqlite::Result<Log> {
    Ok(Log {
        id: Some(row.get(0)?),
        job_id: row.get(1)?,
        run_start_datetime: required_ts(row, 2)?,
        run_end_datetime: required_ts(row, 3)?,
        success: row.get(4)?,
        on_time: row.get(5)?,
        hostname: row.get(6)?,
        stdout: row.get(7)?,
        stderr: row.get(8)?,
    })
}
