//! Subcommand handlers. Each opens its own store handle from config.

use std::{path::Path, time::Duration};

use anyhow::Context;
use clap::Args;
use cronsweep_core::CronsweepConfig;
use cronsweep_scheduler::{
    execute_job, ExecOptions, JobDependency, JobId, JobStore, Launcher, NewJob, Schedule,
    SchedulerLoop, SelfExecLauncher, ShellLauncher, SqliteJobStore, SweepOptions, SweepOutcome,
};
use tracing::{info, warn};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Run every selected job now, ignoring schedules and dependency state.
    #[arg(long)]
    force_run: bool,

    /// Comma-separated job ids to restrict the sweep to.
    #[arg(long, value_name = "IDS")]
    jobs: Option<String>,

    /// Whether execution units write heartbeats (and honour stop requests).
    #[arg(long, value_name = "0|1", default_value_t = 1,
          value_parser = clap::value_parser!(u8).range(0..=1))]
    update_heartbeat: u8,

    /// Run job commands directly instead of through `exec-job` units.
    #[arg(long)]
    inline: bool,
}

#[derive(Args, Debug)]
pub struct ExecJobArgs {
    #[arg(long)]
    id: JobId,

    #[arg(long, value_name = "0|1", default_value_t = 1,
          value_parser = clap::value_parser!(u8).range(0..=1))]
    update_heartbeat: u8,
}

#[derive(Args, Debug)]
pub struct AddArgs {
    #[arg(long)]
    name: String,

    /// Shell command line.
    #[arg(long)]
    command: String,

    /// Schedule as JSON, e.g. '{"kind":"interval","every_secs":300}'.
    #[arg(long)]
    schedule: String,

    /// Extra arguments appended to the command.
    #[arg(long, default_value = "")]
    args: String,

    /// Kill the job after this many seconds; 0 means never.
    #[arg(long, default_value_t = 0)]
    timeout: u64,

    /// Job id this job must wait for. Repeatable.
    #[arg(long = "depends-on", value_name = "ID")]
    depends_on: Vec<JobId>,

    /// Also wait until each dependency's last run succeeded.
    #[arg(long)]
    require_success: bool,

    /// Register the job disabled; it then only runs when forced.
    #[arg(long)]
    disabled: bool,
}

pub async fn run(
    config: &CronsweepConfig,
    config_path: Option<String>,
    args: RunArgs,
) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let options = SweepOptions::from_config(&config.scheduler)
        .with_force_run(args.force_run)
        .with_job_ids(args.jobs.as_deref().map(parse_job_ids).unwrap_or_default());

    if args.inline {
        sweep(store, ShellLauncher, options).await
    } else {
        let launcher = SelfExecLauncher::current_exe()?
            .with_config(config_path)
            .with_heartbeat(args.update_heartbeat == 1);
        sweep(store, launcher, options).await
    }
}

async fn sweep<L: Launcher>(
    store: SqliteJobStore,
    launcher: L,
    options: SweepOptions,
) -> anyhow::Result<()> {
    let mut scheduler = SchedulerLoop::new(store, launcher, options);
    match scheduler.run().await? {
        SweepOutcome::AlreadyRunning { pid } => {
            warn!(pid, "sweep skipped: another instance is running");
        }
        SweepOutcome::Finished(report) => {
            info!(
                launched = report.launched.len(),
                completed = report.completed.len(),
                expired = report.expired.len(),
                skipped = report.skipped.len(),
                spawn_failed = report.spawn_failed.len(),
                "sweep finished"
            );
        }
    }
    Ok(())
}

pub async fn exec_job(config: &CronsweepConfig, args: ExecJobArgs) -> anyhow::Result<()> {
    let options = ExecOptions {
        update_heartbeat: args.update_heartbeat == 1,
        heartbeat_interval: Duration::from_secs(config.scheduler.heartbeat_interval_secs.max(1)),
    };
    execute_job(Path::new(&config.database.path), args.id, &options)
        .await
        .with_context(|| format!("executing job {}", args.id))?;
    Ok(())
}

pub fn add(config: &CronsweepConfig, args: AddArgs) -> anyhow::Result<()> {
    let schedule: Schedule =
        serde_json::from_str(&args.schedule).context("--schedule is not a valid schedule")?;
    let store = open_store(config)?;

    let mut new = NewJob::new(args.name, args.command, schedule)
        .with_args(args.args)
        .with_timeout(args.timeout);
    new.enabled = !args.disabled;
    let job = store.add_job(new)?;

    for dependee in args.depends_on {
        let mut dep = JobDependency::on(dependee);
        dep.wait_for_success = args.require_success;
        store.add_dependency(job.id, &dep)?;
    }

    let job = store.reload(job.id)?;
    println!("{}", serde_json::to_string(&job)?);
    Ok(())
}

pub fn remove(config: &CronsweepConfig, id: JobId) -> anyhow::Result<()> {
    open_store(config)?.remove_job(id)?;
    println!("removed job {id}");
    Ok(())
}

pub fn list(config: &CronsweepConfig) -> anyhow::Result<()> {
    for job in open_store(config)?.list_jobs()? {
        println!("{}", serde_json::to_string(&job)?);
    }
    Ok(())
}

pub fn logs(config: &CronsweepConfig, id: JobId, limit: usize) -> anyhow::Result<()> {
    for log in open_store(config)?.list_logs(id, limit)? {
        println!("{}", serde_json::to_string(&log)?);
    }
    Ok(())
}

pub fn trigger(config: &CronsweepConfig, id: JobId) -> anyhow::Result<()> {
    open_store(config)?.request_run(id)?;
    println!("job {id} will run on the next sweep");
    Ok(())
}

pub fn stop(config: &CronsweepConfig, id: JobId) -> anyhow::Result<()> {
    open_store(config)?.request_stop(id)?;
    println!("stop requested for job {id}");
    Ok(())
}

fn open_store(config: &CronsweepConfig) -> anyhow::Result<SqliteJobStore> {
    let path = Path::new(&config.database.path);
    ensure_parent_dir(path)?;
    info!(path = %path.display(), "opening SQLite database");
    SqliteJobStore::open(path).with_context(|| format!("opening {}", path.display()))
}

fn ensure_parent_dir(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    Ok(())
}

/// Parse `--jobs`. Entries that are not integers are ignored.
fn parse_job_ids(raw: &str) -> Vec<JobId> {
    raw.split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect()
}
