//! `JobRunner` — supervises one job's execution unit against its deadline.
//!
//! The runner is polled, never awaited: the scheduler loop asks
//! [`JobRunner::is_alive`] and [`JobRunner::is_expired`] on every tick and
//! calls [`JobRunner::expire`] once the deadline has passed.

use std::{
    path::PathBuf,
    process::{Command as StdCommand, ExitStatus, Stdio},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    error::{Result, SchedulerError},
    output::{OutputSink, Stream},
    types::{Job, JobId},
};

/// Builds the command that becomes a job's execution unit.
pub trait Launcher: Send + Sync {
    fn command(&self, job: &Job) -> StdCommand;

    /// Whether the execution unit writes its own log and clears its running
    /// flags when it exits normally. When `false` the scheduler loop does it.
    fn records_own_outcome(&self) -> bool {
        true
    }
}

/// Re-invokes a cronsweep binary as `exec-job --id <id>`, so the execution
/// unit opens its own store handle and records its own log.
#[derive(Debug, Clone)]
pub struct SelfExecLauncher {
    program: PathBuf,
    config_path: Option<String>,
    update_heartbeat: bool,
}

impl SelfExecLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            config_path: None,
            update_heartbeat: true,
        }
    }

    /// Launch the currently running executable.
    pub fn current_exe() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn with_config(mut self, config_path: Option<String>) -> Self {
        self.config_path = config_path;
        self
    }

    pub fn with_heartbeat(mut self, update_heartbeat: bool) -> Self {
        self.update_heartbeat = update_heartbeat;
        self
    }
}

impl Launcher for SelfExecLauncher {
    fn command(&self, job: &Job) -> StdCommand {
        let mut cmd = StdCommand::new(&self.program);
        if let Some(ref path) = self.config_path {
            cmd.arg("--config").arg(path);
        }
        cmd.arg("exec-job")
            .arg("--id")
            .arg(job.id.to_string())
            .arg("--update-heartbeat")
            .arg(if self.update_heartbeat { "1" } else { "0" });
        cmd
    }
}

/// Runs the job's command line directly under `sh -c`. Nothing inside the
/// unit writes a log, so the caller owns the whole record.
#[derive(Debug, Clone, Default)]
pub struct ShellLauncher;

impl Launcher for ShellLauncher {
    fn command(&self, job: &Job) -> StdCommand {
        let mut cmd = StdCommand::new("sh");
        cmd.arg("-c").arg(job.command_line());
        cmd
    }

    fn records_own_outcome(&self) -> bool {
        false
    }
}

/// Lifecycle of a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Pending,
    Running,
    /// The execution unit exited on its own.
    Completed,
    /// The deadline passed and the execution unit was killed.
    Expired,
}

pub struct JobRunner {
    job: Job,
    state: RunnerState,
    child: Option<Child>,
    pid: Option<u32>,
    exit_status: Option<ExitStatus>,
    readers: Vec<JoinHandle<()>>,
    started: Option<Instant>,
    started_at: Option<DateTime<Utc>>,
}

impl JobRunner {
    pub fn new(job: Job) -> Self {
        Self {
            job,
            state: RunnerState::Pending,
            child: None,
            pid: None,
            exit_status: None,
            readers: Vec::new(),
            started: None,
            started_at: None,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit status observed by [`is_alive`](Self::is_alive) or
    /// [`expire`](Self::expire).
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Wall-clock time of the spawn, if it happened.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Spawn the execution unit and forward its stdout/stderr into `sink`.
    ///
    /// The child leads its own process group so [`expire`](Self::expire)
    /// also takes down anything it started.
    pub fn start(&mut self, launcher: &dyn Launcher, sink: &OutputSink) -> Result<()> {
        if self.state != RunnerState::Pending {
            return Err(SchedulerError::Spawn {
                job_id: self.job.id,
                reason: format!("runner already {:?}", self.state),
            });
        }

        let mut std_cmd = launcher.command(&self.job);
        std_cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(0);
        }
        let mut cmd = Command::from(std_cmd);
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| SchedulerError::Spawn {
            job_id: self.job.id,
            reason: e.to_string(),
        })?;

        if let Some(stdout) = child.stdout.take() {
            self.readers
                .push(forward(stdout, Stream::Stdout, self.job.id, sink.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            self.readers
                .push(forward(stderr, Stream::Stderr, self.job.id, sink.clone()));
        }

        self.pid = child.id();
        self.child = Some(child);
        self.started = Some(Instant::now());
        self.started_at = Some(Utc::now());
        self.state = RunnerState::Running;
        info!(
            job_id = self.job.id,
            pid = ?self.pid,
            timeout_secs = self.job.timeout_seconds,
            "job launched"
        );
        Ok(())
    }

    /// Whether the execution unit is still running. Observing an exit moves
    /// the runner to `Completed`.
    pub fn is_alive(&mut self) -> bool {
        if self.state != RunnerState::Running {
            return false;
        }
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(job_id = self.job.id, %status, "execution unit exited");
                self.exit_status = Some(status);
                self.child = None;
                self.state = RunnerState::Completed;
                false
            }
            Err(e) => {
                warn!(job_id = self.job.id, "try_wait failed, treating as exited: {e}");
                self.state = RunnerState::Completed;
                false
            }
        }
    }

    /// Whether the job has outlived its timeout. Jobs without a timeout
    /// never expire.
    pub fn is_expired(&self) -> bool {
        match self.state {
            RunnerState::Expired => true,
            RunnerState::Running => match (self.job.timeout(), self.started) {
                (Some(limit), Some(started)) => started.elapsed() > limit,
                _ => false,
            },
            _ => false,
        }
    }

    /// Time spent running so far.
    pub fn elapsed(&self) -> Duration {
        self.started.map(|s| s.elapsed()).unwrap_or_default()
    }

    /// Kill the execution unit's process group and reap it.
    pub async fn expire(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            self.state = RunnerState::Expired;
            return Ok(());
        };

        if let Some(pid) = self.pid {
            #[cfg(unix)]
            // Safety: `pid` leads a process group we created and have not reaped.
            unsafe {
                libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
            }
            #[cfg(not(unix))]
            let _ = pid;
        }
        // Covers non-unix targets and a group kill that raced with exit.
        if let Err(e) = child.start_kill() {
            debug!(job_id = self.job.id, "start_kill: {e}");
        }
        let status = child.wait().await?;
        self.exit_status = Some(status);
        self.state = RunnerState::Expired;
        warn!(
            job_id = self.job.id,
            pid = ?self.pid,
            %status,
            elapsed_ms = self.elapsed().as_millis() as u64,
            "job killed after exceeding its timeout"
        );
        Ok(())
    }

    /// Wait up to `grace` for the pipe readers to reach EOF so every line the
    /// unit wrote has been pushed. Readers still blocked afterwards (a
    /// detached grandchild holding the pipe) are abandoned.
    pub async fn flush_output(&mut self, grace: Duration) {
        for reader in self.readers.drain(..) {
            let abort = reader.abort_handle();
            if tokio::time::timeout(grace, reader).await.is_err() {
                debug!(job_id = self.job.id, "output reader still busy; abandoning");
                abort.abort();
            }
        }
    }
}

/// Push each line read from `reader` into `sink` until EOF.
fn forward<R>(reader: R, stream: Stream, job_id: JobId, sink: OutputSink) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf).into_owned();
                    if !sink.push(stream, job_id, text) {
                        break;
                    }
                }
                Err(e) => {
                    debug!(job_id, ?stream, "output pipe closed: {e}");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        output::{OutputCollector, RunSnapshot},
        types::sample_job,
    };

    fn shell_job(id: JobId, command: &str, timeout_seconds: u64) -> Job {
        let mut job = sample_job(id);
        job.command = command.to_string();
        job.timeout_seconds = timeout_seconds;
        job
    }

    async fn wait_until_dead(runner: &mut JobRunner) {
        for _ in 0..100 {
            if !runner.is_alive() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("runner never exited");
    }

    #[tokio::test]
    async fn quick_job_completes_without_expiring() {
        let collector = OutputCollector::new();
        let mut runner = JobRunner::new(shell_job(1, "echo hi", 5));
        assert_eq!(runner.state(), RunnerState::Pending);

        runner.start(&ShellLauncher, &collector.sink()).unwrap();
        assert!(runner.pid().is_some());
        wait_until_dead(&mut runner).await;

        assert_eq!(runner.state(), RunnerState::Completed);
        assert!(runner.exit_status().unwrap().success());
        assert!(!runner.is_expired());
    }

    #[tokio::test]
    async fn failing_job_reports_exit_status() {
        let collector = OutputCollector::new();
        let mut runner = JobRunner::new(shell_job(5, "exit 3", 0));
        runner.start(&ShellLauncher, &collector.sink()).unwrap();
        wait_until_dead(&mut runner).await;
        assert_eq!(runner.exit_status().unwrap().code(), Some(3));
        assert!(!ShellLauncher.records_own_outcome());
        assert!(SelfExecLauncher::new("x").records_own_outcome());
    }

    #[tokio::test]
    async fn output_is_forwarded_tagged_with_job_id() {
        let mut collector = OutputCollector::new();
        let mut runner = JobRunner::new(shell_job(9, "echo one; echo two >&2; echo three", 5));
        runner.start(&ShellLauncher, &collector.sink()).unwrap();
        wait_until_dead(&mut runner).await;
        runner.flush_output(Duration::from_secs(1)).await;

        let mut snap = RunSnapshot::new();
        collector.drain_into(&mut snap);
        let (out, err) = snap.take(9);
        assert_eq!(out, "one\nthree\n");
        assert_eq!(err, "two\n");
    }

    #[tokio::test]
    async fn hung_job_expires_and_is_killed() {
        let collector = OutputCollector::new();
        let mut runner = JobRunner::new(shell_job(2, "sleep 10", 1));
        runner.start(&ShellLauncher, &collector.sink()).unwrap();

        assert!(!runner.is_expired());
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(runner.is_alive());
        assert!(runner.is_expired());

        let begun = Instant::now();
        runner.expire().await.unwrap();
        assert!(begun.elapsed() < Duration::from_secs(2));
        assert_eq!(runner.state(), RunnerState::Expired);
        assert!(!runner.is_alive());
        // Reaped by `expire`, so the pid is gone.
        assert!(!crate::lock::pid_exists(runner.pid().unwrap()));
    }

    #[tokio::test]
    async fn unbounded_job_never_expires() {
        let collector = OutputCollector::new();
        let mut runner = JobRunner::new(shell_job(3, "sleep 1", 0));
        runner.start(&ShellLauncher, &collector.sink()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!runner.is_expired());
        runner.expire().await.unwrap();
    }

    #[tokio::test]
    async fn start_twice_is_an_error() {
        let collector = OutputCollector::new();
        let mut runner = JobRunner::new(shell_job(4, "true", 0));
        runner.start(&ShellLauncher, &collector.sink()).unwrap();
        let err = runner.start(&ShellLauncher, &collector.sink()).unwrap_err();
        assert!(matches!(err, SchedulerError::Spawn { job_id: 4, .. }));
    }

    #[test]
    fn self_exec_command_carries_job_id_and_flags() {
        let launcher = SelfExecLauncher::new("/usr/bin/cronsweep")
            .with_config(Some("/etc/cronsweep.toml".to_string()))
            .with_heartbeat(false);
        let cmd = launcher.command(&sample_job(17));
        assert_eq!(cmd.get_program(), "/usr/bin/cronsweep");
        let args: Vec<_> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            [
                "--config",
                "/etc/cronsweep.toml",
                "exec-job",
                "--id",
                "17",
                "--update-heartbeat",
                "0"
            ]
        );
    }
}
