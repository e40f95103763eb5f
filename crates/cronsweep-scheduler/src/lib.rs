//! `cronsweep-scheduler` — one-shot job sweeps over a SQLite job table.
//!
//! # Overview
//!
//! Each invocation of [`engine::SchedulerLoop::run`] is a single sweep:
//!
//! 1. take the instance lock (a PID marker file) if enabled,
//! 2. end stale running jobs,
//! 3. select due jobs and order them so dependencies launch first,
//! 4. launch every job as its own process group via a [`runner::Launcher`],
//! 5. poll until each one has exited or been killed for exceeding its
//!    timeout, recording a log for every expired job.
//!
//! The per-job process is normally the same binary re-invoked as
//! `exec-job`; see [`execute::execute_job`].
//!
//! # Schedule variants
//!
//! | Variant    | Behaviour                                  |
//! |------------|--------------------------------------------|
//! | `Once`     | Single fire at an absolute UTC instant     |
//! | `Interval` | Repeat every N seconds                     |
//! | `Daily`    | Fire at HH:MM UTC every day                |
//! | `Weekly`   | Fire at HH:MM UTC on a specific weekday    |

pub mod db;
pub mod engine;
pub mod error;
pub mod execute;
pub mod lock;
pub mod order;
pub mod output;
pub mod runner;
pub mod schedule;
pub mod store;
pub mod types;

pub use engine::{SchedulerLoop, SweepOptions, SweepOutcome, SweepReport};
pub use error::{Result, SchedulerError};
pub use execute::{execute_job, ExecOptions};
pub use runner::{Launcher, SelfExecLauncher, ShellLauncher};
pub use store::{JobStore, SqliteJobStore};
pub use types::{Job, JobDependency, JobId, Log, NewJob, Schedule};
