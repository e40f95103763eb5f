//! `cronsweep-core` — configuration and error types shared by every
//! cronsweep crate.

pub mod config;
pub mod error;

pub use config::CronsweepConfig;
pub use error::{CronsweepError, Result};
