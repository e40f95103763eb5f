use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Primary key of a job row.
pub type JobId = i64;

/// Defines when and how often a job should run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Run exactly once at the given UTC instant.
    Once { at: DateTime<Utc> },

    /// Run repeatedly with a fixed interval in seconds.
    Interval { every_secs: u64 },

    /// Run every day at the given hour and minute (UTC).
    Daily { hour: u8, minute: u8 },

    /// Run on a specific weekday (0 = Monday … 6 = Sunday) at the given time (UTC).
    Weekly { day: u8, hour: u8, minute: u8 },
}

/// Edge in the dependency graph: the owning job waits on `dependee_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDependency {
    pub dependee_id: JobId,
    /// The dependee must not be running.
    pub wait_for_completion: bool,
    /// The dependee's most recent run must not have failed.
    pub wait_for_success: bool,
}

impl JobDependency {
    pub fn on(dependee_id: JobId) -> Self {
        Self {
            dependee_id,
            wait_for_completion: true,
            wait_for_success: false,
        }
    }
}

/// A persisted job definition plus its mutable running state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Human-readable label.
    pub name: String,
    /// Shell command line run by the execution unit.
    pub command: String,
    /// Extra arguments appended to `command`.
    pub args: String,
    pub schedule: Schedule,
    /// Disabled jobs are never due, but may still be force-run.
    pub enabled: bool,
    pub next_run: Option<DateTime<Utc>>,
    pub dependencies: Vec<JobDependency>,
    /// Wall-clock budget; `0` means unbounded.
    pub timeout_seconds: u64,
    pub is_running: bool,
    pub force_run: bool,
    pub force_stop: bool,
    /// Written by the execution unit when it starts.
    pub last_run_start_timestamp: Option<DateTime<Utc>>,
    pub last_run_successful: Option<bool>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// PID of the execution unit while the job is running.
    pub current_pid: Option<u32>,
}

impl Job {
    pub fn dependency_ids(&self) -> impl Iterator<Item = JobId> + '_ {
        self.dependencies.iter().map(|d| d.dependee_id)
    }

    /// `None` when the job may run forever.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_seconds > 0).then(|| Duration::from_secs(self.timeout_seconds))
    }

    /// The full shell command line: `command` followed by `args`.
    pub fn command_line(&self) -> String {
        let args = self.args.trim();
        if args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, args)
        }
    }

    /// Clear the running-state flags after a terminal outcome.
    pub fn mark_ended(&mut self) {
        self.is_running = false;
        self.force_run = false;
        self.force_stop = false;
        self.current_pid = None;
    }
}

/// Input for [`crate::store::SqliteJobStore::add_job`].
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub command: String,
    pub args: String,
    pub schedule: Schedule,
    pub timeout_seconds: u64,
    pub enabled: bool,
}

impl NewJob {
    pub fn new(name: impl Into<String>, command: impl Into<String>, schedule: Schedule) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: String::new(),
            schedule,
            timeout_seconds: 0,
            enabled: true,
        }
    }

    pub fn with_args(mut self, args: impl Into<String>) -> Self {
        self.args = args.into();
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_seconds = secs;
        self
    }
}

/// Terminal record of one job execution. Written once, never updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log {
    /// Assigned by the store; `None` until persisted.
    pub id: Option<i64>,
    pub job_id: JobId,
    pub run_start_datetime: DateTime<Utc>,
    pub run_end_datetime: DateTime<Utc>,
    pub success: bool,
    /// `false` when the run was killed for exceeding its timeout.
    pub on_time: bool,
    pub hostname: String,
    pub stdout: String,
    pub stderr: String,
}

impl Log {
    pub fn duration_seconds(&self) -> f64 {
        (self.run_end_datetime - self.run_start_datetime)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// Name of this host as recorded in [`Log::hostname`].
pub fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
pub(crate) fn sample_job(id: JobId) -> Job {
    Job {
        id,
        name: format!("job-{id}"),
        command: "true".to_string(),
        args: String::new(),
        schedule: Schedule::Interval { every_secs: 60 },
        enabled: true,
        next_run: None,
        dependencies: Vec::new(),
        timeout_seconds: 0,
        is_running: false,
        force_run: false,
        force_stop: false,
        last_run_start_timestamp: None,
        last_run_successful: None,
        last_heartbeat: None,
        current_pid: None,
    }
}
