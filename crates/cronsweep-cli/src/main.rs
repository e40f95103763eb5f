use std::io::IsTerminal;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

/// cronsweep — run due jobs once, in dependency order, under hard timeouts.
#[derive(Parser, Debug)]
#[command(name = "cronsweep", version, about)]
struct Cli {
    /// Path to cronsweep.toml (defaults to ~/.cronsweep/cronsweep.toml).
    #[arg(long, global = true, env = "CRONSWEEP_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Sweep once: launch every due job and wait for all of them.
    Run(commands::RunArgs),
    /// Execute a single job in this process (used by `run`).
    ExecJob(commands::ExecJobArgs),
    /// Register a new job.
    Add(commands::AddArgs),
    /// Delete a job and its dependency edges.
    Remove { id: i64 },
    /// Print every job as JSON lines.
    List,
    /// Print a job's most recent logs as JSON lines.
    Logs {
        id: i64,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Make a job run on the next sweep regardless of its schedule.
    Trigger { id: i64 },
    /// Ask a running job to stop at its next heartbeat.
    Stop { id: i64 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // An execution unit's stderr is captured as job output, so keep it quiet
    // unless asked otherwise.
    let filter = if matches!(cli.command, Cmd::ExecJob(_)) {
        EnvFilter::try_from_env("CRONSWEEP_EXEC_LOG").unwrap_or_else(|_| "warn".into())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "cronsweep=info,cronsweep_scheduler=info".into())
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .init();

    // load config: --config / CRONSWEEP_CONFIG > ~/.cronsweep/cronsweep.toml
    let config = cronsweep_core::CronsweepConfig::load_or_default(cli.config.as_deref());

    match cli.command {
        Cmd::Run(args) => commands::run(&config, cli.config, args).await,
        Cmd::ExecJob(args) => commands::exec_job(&config, args).await,
        Cmd::Add(args) => commands::add(&config, args),
        Cmd::Remove { id } => commands::remove(&config, id),
        Cmd::List => commands::list(&config),
        Cmd::Logs { id, limit } => commands::logs(&config, id, limit),
        Cmd::Trigger { id } => commands::trigger(&config, id),
        Cmd::Stop { id } => commands::stop(&config, id),
    }
}
