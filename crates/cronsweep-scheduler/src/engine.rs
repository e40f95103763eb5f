use std::{path::PathBuf, time::Duration};

use chrono::{DateTime, Utc};
use cronsweep_core::config::SchedulerConfig;
use tracing::{error, info, warn};

use crate::{
    error::{Result, SchedulerError},
    lock::{InstanceLock, LockOutcome},
    order::order_by_dependencies,
    output::{OutputCollector, OutputSink, RunSnapshot},
    runner::{JobRunner, Launcher},
    schedule::compute_next_run,
    store::JobStore,
    types::{local_hostname, Job, JobId, Log},
};

/// Parameters for one sweep.
#[derive(Debug, Clone)]
pub struct SweepOptions {
    /// Select every job (optionally filtered) instead of only due ones.
    pub force_run: bool,
    /// Restrict the sweep to these ids; empty means all.
    pub job_ids: Vec<JobId>,
    pub use_pid: bool,
    pub pid_file: PathBuf,
    pub auto_end_stale: bool,
    pub poll_interval: Duration,
    pub timeout_message: String,
}

impl SweepOptions {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            force_run: false,
            job_ids: Vec::new(),
            use_pid: config.use_pid,
            pid_file: PathBuf::from(&config.pid_file),
            auto_end_stale: config.auto_end_stale_jobs,
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            timeout_message: config.timeout_message.clone(),
        }
    }

    pub fn with_force_run(mut self, force_run: bool) -> Self {
        self.force_run = force_run;
        self
    }

    pub fn with_job_ids(mut self, job_ids: Vec<JobId>) -> Self {
        self.job_ids = job_ids;
        self
    }
}

/// What happened to each job touched by a sweep.
#[derive(Debug, Default, Clone)]
pub struct SweepReport {
    /// Launch order.
    pub launched: Vec<JobId>,
    pub completed: Vec<JobId>,
    pub expired: Vec<JobId>,
    /// Selected, but a dependency was running by the time it came up.
    pub skipped: Vec<JobId>,
    pub spawn_failed: Vec<JobId>,
}

#[derive(Debug)]
pub enum SweepOutcome {
    Finished(SweepReport),
    /// Another live sweep holds the instance lock; nothing was launched.
    AlreadyRunning { pid: u32 },
}

enum Terminal {
    Completed { success: bool },
    Expired,
    SpawnFailed(String),
}

/// One scheduler invocation: select due jobs, launch them in dependency
/// order, supervise them to completion or expiry.
pub struct SchedulerLoop<S, L> {
    store: S,
    launcher: L,
    options: SweepOptions,
    hostname: String,
}

impl<S: JobStore, L: Launcher> SchedulerLoop<S, L> {
    pub fn new(store: S, launcher: L, options: SweepOptions) -> Self {
        Self {
            store,
            launcher,
            options,
            hostname: local_hostname(),
        }
    }

    /// Run a full sweep. The instance lock, when enabled, is held for the
    /// whole sweep and released on every exit path.
    pub async fn run(&mut self) -> Result<SweepOutcome> {
        let _lock = if self.options.use_pid {
            let running = self.store.count_running()?;
            match InstanceLock::acquire(&self.options.pid_file, running)? {
                LockOutcome::Acquired(lock) => Some(lock),
                LockOutcome::Held { pid } => {
                    info!(pid, "another sweep is running, exiting");
                    return Ok(SweepOutcome::AlreadyRunning { pid });
                }
            }
        } else {
            None
        };

        self.sweep().await.map(SweepOutcome::Finished)
    }

    async fn sweep(&mut self) -> Result<SweepReport> {
        if self.options.auto_end_stale {
            let ended = self.store.end_all_stale()?;
            if ended > 0 {
                info!(count = ended, "ended stale running jobs");
            }
        }

        let selected = if self.options.force_run {
            self.store.select_all(&self.options.job_ids)?
        } else {
            self.store.select_due(&self.options.job_ids)?
        };
        let ordered = order_by_dependencies(selected);

        let mut collector = OutputCollector::new();
        let sink = collector.sink();
        let mut snapshot = RunSnapshot::new();
        let mut report = SweepReport::default();
        let mut failures: Vec<(JobId, String)> = Vec::new();
        let mut active: Vec<JobRunner> = Vec::with_capacity(ordered.len());

        // A store error here stops further launches, but jobs already
        // launched are still supervised to a terminal log below.
        let mut launch_error = None;
        for job in ordered {
            match self.launch(job, &sink, &mut report, &mut failures) {
                Ok(Some(runner)) => active.push(runner),
                Ok(None) => {}
                Err(e) => {
                    error!("aborting launches: {e}");
                    launch_error = Some(e);
                    break;
                }
            }
        }
        info!(count = active.len(), "jobs are due");

        while !active.is_empty() {
            collector.drain_into(&mut snapshot);

            let mut still_running = Vec::with_capacity(active.len());
            for mut runner in active {
                let id = runner.job_id();
                if !runner.is_alive() {
                    info!(job_id = id, "job process ended");
                    report.completed.push(id);
                    self.retire(&mut runner, &mut collector, &mut snapshot, &mut failures)
                        .await;
                } else if runner.is_expired() {
                    warn!(job_id = id, "job expired");
                    if let Err(e) = runner.expire().await {
                        warn!(job_id = id, "kill did not complete cleanly: {e}");
                    }
                    runner.flush_output(self.options.poll_interval).await;
                    collector.drain_into(&mut snapshot);
                    report.expired.push(id);
                    self.finalize_or_record(&runner, Terminal::Expired, &mut snapshot, &mut failures);
                } else {
                    still_running.push(runner);
                }
            }
            active = still_running;

            if !active.is_empty() {
                tokio::time::sleep(self.options.poll_interval).await;
            }
        }

        if let Some(e) = launch_error {
            return Err(e);
        }
        if !failures.is_empty() {
            return Err(SchedulerError::Finalize { failures });
        }
        Ok(report)
    }

    /// Commit `job` as running and spawn its runner. `Ok(None)` means the
    /// job was skipped or failed to spawn (and has already been finalized).
    fn launch(
        &mut self,
        mut job: Job,
        sink: &OutputSink,
        report: &mut SweepReport,
        failures: &mut Vec<(JobId, String)>,
    ) -> Result<Option<JobRunner>> {
        // Jobs launched earlier in this sweep are already persisted as
        // running, so this sees them.
        if !self.options.force_run && !self.store.dependencies_met(&job)? {
            info!(job_id = job.id, "dependencies no longer satisfied, skipping");
            report.skipped.push(job.id);
            return Ok(None);
        }

        // Execution units open their own handles; never share ours.
        self.store.reset()?;
        job.is_running = true;
        self.store.persist(&job)?;

        let mut runner = JobRunner::new(job);
        match runner.start(&self.launcher, sink) {
            Ok(()) => {
                let id = runner.job_id();
                if let Some(pid) = runner.pid() {
                    // Without a pid the row looks orphaned to other sweeps.
                    if let Err(e) = self.store.set_running_pid(id, pid) {
                        warn!(job_id = id, pid, "could not record launched pid: {e}");
                    }
                }
                report.launched.push(id);
                Ok(Some(runner))
            }
            Err(e) => {
                error!(job_id = runner.job_id(), "launch failed: {e}");
                report.spawn_failed.push(runner.job_id());
                let mut snapshot = RunSnapshot::new();
                self.finalize_or_record(
                    &runner,
                    Terminal::SpawnFailed(e.to_string()),
                    &mut snapshot,
                    failures,
                );
                Ok(None)
            }
        }
    }

    /// Settle a runner whose execution unit exited on its own. Its output is
    /// flushed first so no fragment outlives the job in `snapshot`.
    async fn retire(
        &mut self,
        runner: &mut JobRunner,
        collector: &mut OutputCollector,
        snapshot: &mut RunSnapshot,
        failures: &mut Vec<(JobId, String)>,
    ) {
        let id = runner.job_id();
        let success = runner.exit_status().is_some_and(|s| s.success());
        runner.flush_output(self.options.poll_interval).await;
        collector.drain_into(snapshot);

        if self.launcher.records_own_outcome() && !self.abandoned(id, success) {
            snapshot.discard(id);
        } else {
            self.finalize_or_record(runner, Terminal::Completed { success }, snapshot, failures);
        }
    }

    /// A self-recording unit that failed and left its job flagged running
    /// never reached its own log write.
    fn abandoned(&mut self, id: JobId, success: bool) -> bool {
        if success {
            return false;
        }
        let still_running = self
            .store
            .reset()
            .and_then(|()| self.store.reload(id))
            .map(|job| job.is_running);
        match still_running {
            Ok(running) => {
                if running {
                    warn!(job_id = id, "execution unit failed without recording its run");
                }
                running
            }
            Err(e) => {
                warn!(job_id = id, "could not check job after unit failure: {e}");
                false
            }
        }
    }

    fn finalize_or_record(
        &mut self,
        runner: &JobRunner,
        terminal: Terminal,
        snapshot: &mut RunSnapshot,
        failures: &mut Vec<(JobId, String)>,
    ) {
        let id = runner.job_id();
        if let Err(e) = self.finalize(runner, terminal, snapshot) {
            error!(job_id = id, "failed to finalize job: {e}");
            failures.push((id, e.to_string()));
        }
    }

    /// Clear the job's running flags and write its terminal log.
    fn finalize(
        &mut self,
        runner: &JobRunner,
        terminal: Terminal,
        snapshot: &mut RunSnapshot,
    ) -> Result<()> {
        let id = runner.job_id();
        let run_end = Utc::now();
        let (stdout, mut stderr) = snapshot.take(id);
        let (success, on_time) = match terminal {
            Terminal::Completed { success } => (success, true),
            Terminal::Expired => {
                stderr.push_str(&self.options.timeout_message);
                (false, false)
            }
            Terminal::SpawnFailed(reason) => {
                stderr.push_str(&reason);
                stderr.push('\n');
                (false, true)
            }
        };

        self.store.reset()?;
        let mut job = self.store.reload(id)?;
        let run_start = run_start(job.last_run_start_timestamp, runner.started_at(), run_end);
        job.mark_ended();
        job.last_run_successful = Some(success);
        job.next_run = compute_next_run(&job.schedule, run_end);
        self.store.record_outcome(
            &job,
            &Log {
                id: None,
                job_id: id,
                run_start_datetime: run_start,
                run_end_datetime: run_end,
                success,
                on_time,
                hostname: self.hostname.clone(),
                stdout,
                stderr,
            },
        )?;
        Ok(())
    }
}

/// The stored start time belongs to this run only if it is not older than
/// the spawn; otherwise the unit died before recording its own start.
fn run_start(
    stored: Option<DateTime<Utc>>,
    spawned: Option<DateTime<Utc>>,
    fallback: DateTime<Utc>,
) -> DateTime<Utc> {
    match (stored, spawned) {
        (Some(s), Some(p)) if s >= p => s,
        (_, Some(p)) => p,
        (Some(s), None) => s,
        (None, None) => fallback,
    }
}
