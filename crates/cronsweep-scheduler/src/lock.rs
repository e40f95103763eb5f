//! Advisory single-instance guard backed by a PID marker file.
//!
//! The marker only prevents two full sweeps from overlapping on one host.
//! It is tolerant of staleness: a marker whose PID is dead, or any marker
//! while the store reports no running jobs, is ignored and overwritten.

use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::{debug, info, warn};

use crate::error::{Result, SchedulerError};

/// Outcome of [`InstanceLock::acquire`].
#[derive(Debug)]
pub enum LockOutcome {
    /// This invocation now owns the marker.
    Acquired(InstanceLock),
    /// Another live sweep holds the marker.
    Held { pid: u32 },
}

/// Owned PID marker. Dropping it removes the marker file.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    pid: u32,
}

impl InstanceLock {
    /// Try to take the marker at `path`.
    ///
    /// `running_jobs` is the store's count of jobs flagged as running; when it
    /// is zero any existing marker must be stale and is not even read.
    pub fn acquire(path: impl AsRef<Path>, running_jobs: usize) -> Result<LockOutcome> {
        let path = path.as_ref();
        let pid = std::process::id();

        if running_jobs == 0 {
            debug!(path = %path.display(), "no running jobs; ignoring any existing marker");
        } else if let Some(old_pid) = read_marker(path)? {
            if old_pid != pid && pid_exists(old_pid) {
                info!(path = %path.display(), pid = old_pid, "another sweep is live");
                return Ok(LockOutcome::Held { pid: old_pid });
            }
            warn!(path = %path.display(), pid = old_pid, "marker holds a stale pid; continuing");
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, pid.to_string())
            .map_err(|e| SchedulerError::Lock(format!("write {}: {e}", path.display())))?;
        debug!(path = %path.display(), pid, "instance lock acquired");

        Ok(LockOutcome::Acquired(Self {
            path: path.to_path_buf(),
            pid,
        }))
    }

    /// Remove the marker now instead of at drop.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        // Leave the file alone if someone else has since claimed it.
        match read_marker(&self.path) {
            Ok(Some(pid)) if pid == self.pid => {
                if let Err(e) = fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), "failed to remove marker: {e}");
                } else {
                    debug!(path = %self.path.display(), "instance lock released");
                }
            }
            Ok(_) => debug!(path = %self.path.display(), "marker no longer ours; left in place"),
            Err(e) => warn!(path = %self.path.display(), "failed to read marker on release: {e}"),
        }
    }
}

/// Read the PID recorded in the marker. Missing or unparsable markers read
/// as `None`.
fn read_marker(path: &Path) -> Result<Option<u32>> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(raw.trim().parse().ok()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SchedulerError::Lock(format!("read {}: {e}", path.display()))),
    }
}

/// Whether a process with `pid` currently exists on this host.
pub fn pid_exists(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let Ok(raw) = libc::pid_t::try_from(pid) else {
            return false;
        };
        if raw <= 0 {
            return false;
        }
        // Signal 0 performs the existence and permission checks only.
        let rc = unsafe { libc::kill(raw, 0) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A PID that is certainly not running: spawn and reap a short child.
    fn dead_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    #[test]
    fn own_process_exists_and_reaped_child_does_not() {
        assert!(pid_exists(std::process::id()));
        assert!(!pid_exists(dead_pid()));
        assert!(!pid_exists(0));
    }

    #[test]
    fn acquire_writes_pid_and_drop_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/cronsweep.pid");

        let LockOutcome::Acquired(lock) = InstanceLock::acquire(&path, 0).unwrap() else {
            panic!("expected lock");
        };
        let recorded = fs::read_to_string(&path).unwrap();
        assert_eq!(recorded, std::process::id().to_string());

        lock.release();
        assert!(!path.exists());
    }

    #[test]
    fn live_marker_blocks_when_jobs_are_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cronsweep.pid");
        // PID 1 is always alive.
        fs::write(&path, "1").unwrap();

        match InstanceLock::acquire(&path, 3).unwrap() {
            LockOutcome::Held { pid } => assert_eq!(pid, 1),
            LockOutcome::Acquired(_) => panic!("marker should have blocked"),
        }
        // The foreign marker is untouched.
        assert_eq!(fs::read_to_string(&path).unwrap(), "1");
    }

    #[test]
    fn marker_ignored_when_no_jobs_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cronsweep.pid");
        fs::write(&path, "1").unwrap();

        let outcome = InstanceLock::acquire(&path, 0).unwrap();
        assert!(matches!(outcome, LockOutcome::Acquired(_)));
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            std::process::id().to_string()
        );
    }

    #[test]
    fn stale_or_garbage_marker_is_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cronsweep.pid");

        fs::write(&path, dead_pid().to_string()).unwrap();
        assert!(matches!(
            InstanceLock::acquire(&path, 2).unwrap(),
            LockOutcome::Acquired(_)
        ));

        fs::write(&path, "not-a-pid").unwrap();
        assert!(matches!(
            InstanceLock::acquire(&path, 2).unwrap(),
            LockOutcome::Acquired(_)
        ));
    }

    #[test]
    fn drop_leaves_foreign_marker_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cronsweep.pid");
        let LockOutcome::Acquired(lock) = InstanceLock::acquire(&path, 0).unwrap() else {
            panic!("expected lock");
        };
        fs::write(&path, "1").unwrap();
        drop(lock);
        assert_eq!(fs::read_to_string(&path).unwrap(), "1");
    }
}
