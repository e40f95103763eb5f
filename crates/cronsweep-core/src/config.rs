use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_TIMEOUT_MESSAGE: &str = "Job exceeded timeout\n";

/// Top-level config (cronsweep.toml + CRONSWEEP_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronsweepConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Knobs for a single scheduler sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Guard against overlapping sweeps with a PID marker file.
    #[serde(default = "bool_true")]
    pub use_pid: bool,
    /// Location of the PID marker file.
    #[serde(default = "default_pid_file")]
    pub pid_file: String,
    /// Clear orphaned `is_running` flags before selecting new work.
    #[serde(default = "bool_true")]
    pub auto_end_stale_jobs: bool,
    /// Sleep between liveness/expiry polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Cadence of heartbeat writes from each execution unit.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Appended to the stderr of a job killed for exceeding its timeout.
    #[serde(default = "default_timeout_message")]
    pub timeout_message: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            use_pid: true,
            pid_file: default_pid_file(),
            auto_end_stale_jobs: true,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            timeout_message: default_timeout_message(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_heartbeat_interval_secs() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}
fn default_timeout_message() -> String {
    DEFAULT_TIMEOUT_MESSAGE.to_string()
}

fn cronsweep_home() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cronsweep", home)
}
fn default_db_path() -> String {
    format!("{}/cronsweep.db", cronsweep_home())
}
fn default_pid_file() -> String {
    format!("{}/cronsweep.pid", cronsweep_home())
}
fn default_config_path() -> String {
    format!("{}/cronsweep.toml", cronsweep_home())
}

impl CronsweepConfig {
    /// Load config from a TOML file with CRONSWEEP_* env var overrides.
    ///
    /// Nested keys are separated by a double underscore so snake_case field
    /// names survive, e.g. `CRONSWEEP_SCHEDULER__POLL_INTERVAL_MS=250`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CronsweepConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CRONSWEEP_").split("__"))
            .extract()
            .map_err(|e| crate::error::CronsweepError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Like [`load`](Self::load), but falls back to defaults when the file is
    /// unreadable or malformed.
    pub fn load_or_default(config_path: Option<&str>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            tracing::warn!(code = e.code(), "Config load failed ({}), using defaults", e);
            Self::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = CronsweepConfig::load(Some("/nonexistent/cronsweep.toml")).unwrap();
        assert!(cfg.scheduler.use_pid);
        assert!(cfg.scheduler.auto_end_stale_jobs);
        assert_eq!(cfg.scheduler.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
        assert_eq!(cfg.scheduler.timeout_message, "Job exceeded timeout\n");
        assert!(cfg.database.path.ends_with("cronsweep.db"));
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[database]\npath = \"/tmp/x.db\"\n\n[scheduler]\nuse_pid = false\npoll_interval_ms = 250"
        )
        .unwrap();

        let cfg = CronsweepConfig::load(file.path().to_str()).unwrap();
        assert_eq!(cfg.database.path, "/tmp/x.db");
        assert!(!cfg.scheduler.use_pid);
        assert_eq!(cfg.scheduler.poll_interval_ms, 250);
        // untouched fields keep their defaults
        assert!(cfg.scheduler.auto_end_stale_jobs);
        assert_eq!(
            cfg.scheduler.heartbeat_interval_secs,
            DEFAULT_HEARTBEAT_INTERVAL_SECS
        );
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[scheduler]\npoll_interval_ms = \"soon\"").unwrap();

        assert!(CronsweepConfig::load(file.path().to_str()).is_err());
        let cfg = CronsweepConfig::load_or_default(file.path().to_str());
        assert_eq!(cfg.scheduler.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
    }
}
