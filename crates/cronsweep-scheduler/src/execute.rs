//! The execution unit: what runs inside the per-job process.
//!
//! It opens its own store handle, records the start, runs the job's command
//! line under `sh -c` while echoing its output, and finishes by writing the
//! job's log and clearing its running flags.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use chrono::Utc;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    process::Command,
    sync::watch,
    task::JoinHandle,
};
use tracing::{info, instrument, warn};

use crate::{
    error::Result,
    schedule::compute_next_run,
    store::{JobStore, SqliteJobStore},
    types::{local_hostname, Job, JobId, Log},
};

/// Appended to stderr when a stop request ended the run.
const STOPPED_MESSAGE: &str = "Job stopped on request\n";

/// How long output readers may lag behind the command's exit. Anything a
/// detached grandchild writes after that is dropped.
const OUTPUT_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Periodically write `last_heartbeat` and watch for stop requests.
    pub update_heartbeat: bool,
    pub heartbeat_interval: Duration,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            update_heartbeat: true,
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

struct RunOutput {
    success: bool,
    stopped: bool,
    stdout: String,
    stderr: String,
}

/// Run job `job_id` to completion and record exactly one log for it.
#[instrument(skip(db_path, options))]
pub async fn execute_job(db_path: &Path, job_id: JobId, options: &ExecOptions) -> Result<Log> {
    let store = SqliteJobStore::open(db_path)?;

    let mut job = store.reload(job_id)?;
    let run_start = Utc::now();
    job.is_running = true;
    job.last_run_start_timestamp = Some(run_start);
    job.current_pid = Some(std::process::id());
    store.persist(&job)?;
    info!(command = %job.command_line(), "running job");

    let output = match run_command(&job, db_path, options).await {
        Ok(out) => out,
        Err(e) => {
            warn!("job command could not run: {e}");
            RunOutput {
                success: false,
                stopped: false,
                stdout: String::new(),
                stderr: format!("{e}\n"),
            }
        }
    };
    let run_end = Utc::now();

    // Re-read so flags set while the job ran are seen before clearing them.
    let mut job = store.reload(job_id)?;
    job.mark_ended();
    job.last_run_successful = Some(output.success);
    job.next_run = compute_next_run(&job.schedule, run_end);

    let mut stderr = output.stderr;
    if output.stopped {
        stderr.push_str(STOPPED_MESSAGE);
    }
    let mut log = Log {
        id: None,
        job_id,
        run_start_datetime: run_start,
        run_end_datetime: run_end,
        success: output.success,
        on_time: true,
        hostname: local_hostname(),
        stdout: output.stdout,
        stderr,
    };
    log.id = Some(store.record_outcome(&job, &log)?);
    info!(
        success = log.success,
        duration_secs = log.duration_seconds(),
        "job finished"
    );
    Ok(log)
}

async fn run_command(job: &Job, db_path: &Path, options: &ExecOptions) -> Result<RunOutput> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(job.command_line())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let out_task = child
        .stdout
        .take()
        .map(|r| tokio::spawn(pump(r, tokio::io::stdout())));
    let err_task = child
        .stderr
        .take()
        .map(|r| tokio::spawn(pump(r, tokio::io::stderr())));

    let (stop_tx, stop_rx) = watch::channel(false);
    let heartbeat = options.update_heartbeat.then(|| {
        tokio::spawn(heartbeat_loop(
            db_path.to_path_buf(),
            job.id,
            options.heartbeat_interval,
            stop_tx,
        ))
    });

    let (success, stopped) = tokio::select! {
        status = child.wait() => (status?.success(), false),
        _ = stop_requested(stop_rx) => {
            warn!(job_id = job.id, "stop requested; killing job command");
            terminate_own_group();
            child.start_kill()?;
            child.wait().await?;
            (false, true)
        }
    };
    if let Some(handle) = heartbeat {
        handle.abort();
    }

    let stdout = collect(out_task).await;
    let stderr = collect(err_task).await;

    Ok(RunOutput {
        success,
        stopped,
        stdout,
        stderr,
    })
}

/// Send SIGTERM to every process the job command left in our process group,
/// while this process ignores it. Only done when we lead the group, as the
/// scheduler's launcher arranges.
#[cfg(unix)]
fn terminate_own_group() {
    // Safety: plain syscalls with no pointers. SIGTERM is ignored here before
    // the group is signalled, so only our descendants receive it.
    unsafe {
        if libc::getpgrp() != libc::getpid() {
            return;
        }
        libc::signal(libc::SIGTERM, libc::SIG_IGN);
        libc::kill(0, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate_own_group() {}

async fn collect(task: Option<JoinHandle<String>>) -> String {
    let Some(task) = task else {
        return String::new();
    };
    let abort = task.abort_handle();
    match tokio::time::timeout(OUTPUT_GRACE, task).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => {
            abort.abort();
            warn!("job output still open after exit; truncating");
            String::new()
        }
    }
}

/// Copy `reader` line by line to `echo`, returning everything read.
async fn pump<R, W>(reader: R, mut echo: W) -> String
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut captured = String::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                // The echo is best-effort; the captured copy is authoritative.
                let _ = echo.write_all(&line).await;
                let _ = echo.flush().await;
                captured.push_str(&String::from_utf8_lossy(&line));
            }
            Err(e) => {
                warn!("reading job output failed: {e}");
                break;
            }
        }
    }
    captured
}

async fn heartbeat_loop(
    db_path: PathBuf,
    job_id: JobId,
    every: Duration,
    stop_tx: watch::Sender<bool>,
) {
    let store = match SqliteJobStore::open(&db_path) {
        Ok(s) => s,
        Err(e) => {
            warn!(job_id, "heartbeat disabled, store unavailable: {e}");
            return;
        }
    };
    let mut ticker = tokio::time::interval(every.max(Duration::from_millis(100)));
    loop {
        ticker.tick().await;
        match store.heartbeat(job_id) {
            Ok(true) => {
                let _ = stop_tx.send(true);
                return;
            }
            Ok(false) => {}
            Err(e) => warn!(job_id, "heartbeat write failed: {e}"),
        }
    }
}

/// Resolves once `true` is published. A closed channel never resolves.
async fn stop_requested(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
