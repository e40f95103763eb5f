//! End-to-end sweeps against the real `cronsweep` binary.

use std::{
    path::PathBuf,
    process::{Command, Output, Stdio},
    time::{Duration, Instant},
};

use serde_json::Value;

struct Sandbox {
    dir: tempfile::TempDir,
}

impl Sandbox {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn db_path(&self) -> PathBuf {
        self.dir.path().join("cronsweep.db")
    }

    fn pid_file(&self) -> PathBuf {
        self.dir.path().join("cronsweep.pid")
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_cronsweep"));
        cmd.env("CRONSWEEP_CONFIG", self.dir.path().join("missing.toml"))
            .env("CRONSWEEP_DATABASE__PATH", self.db_path())
            .env("CRONSWEEP_SCHEDULER__PID_FILE", self.pid_file())
            .env("CRONSWEEP_SCHEDULER__POLL_INTERVAL_MS", "50")
            .env("RUST_LOG", "cronsweep=info,cronsweep_scheduler=info");
        cmd
    }

    fn ok(&self, args: &[&str]) -> Output {
        let out = self.cmd().args(args).output().unwrap();
        assert!(
            out.status.success(),
            "cronsweep {args:?} failed: {}",
            String::from_utf8_lossy(&out.stderr)
        );
        out
    }

    /// Register a job through the CLI and return its id.
    fn add(&self, name: &str, command: &str, extra: &[&str]) -> i64 {
        let mut args = vec![
            "add",
            "--name",
            name,
            "--command",
            command,
            "--schedule",
            r#"{"kind":"interval","every_secs":3600}"#,
        ];
        args.extend_from_slice(extra);
        let out = self.ok(&args);
        let job: Value = serde_json::from_slice(&out.stdout).unwrap();
        job["id"].as_i64().unwrap()
    }

    fn logs(&self, id: i64) -> Vec<Value> {
        let out = self.ok(&["logs", &id.to_string(), "--limit", "50"]);
        String::from_utf8_lossy(&out.stdout)
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }
}

/// Job ids in the order the sweep reported launching them.
fn launch_order(stderr: &[u8]) -> Vec<i64> {
    String::from_utf8_lossy(stderr)
        .lines()
        .filter(|l| l.contains("job launched"))
        .filter_map(|l| {
            let rest = &l[l.find("job_id=")? + "job_id=".len()..];
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse().ok()
        })
        .collect()
}

fn dead_pid() -> u32 {
    let mut child = Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

/// Live and not a zombie awaiting its reaper.
#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(") ")
            .is_some_and(|(_, rest)| !rest.starts_with('Z')),
        Err(_) => false,
    }
}

#[test]
fn force_run_launches_dependency_before_dependent() {
    let sb = Sandbox::new();
    let one = sb.add("one", "echo one", &[]);
    let two = sb.add("two", "echo two", &[]);
    let three = sb.add("three", "echo three", &["--depends-on", &one.to_string()]);

    let out = sb.ok(&["run", "--force-run"]);
    let order = launch_order(&out.stderr);
    assert_eq!(order.len(), 3, "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let pos = |id| order.iter().position(|&x| x == id).unwrap();
    assert!(pos(one) < pos(three));
    assert!(order.contains(&two));

    // Each execution unit recorded its own outcome.
    for (id, text) in [(one, "one\n"), (two, "two\n"), (three, "three\n")] {
        let logs = sb.logs(id);
        assert_eq!(logs.len(), 1, "job {id}");
        assert_eq!(logs[0]["success"], true);
        assert_eq!(logs[0]["on_time"], true);
        assert_eq!(logs[0]["stdout"], text);
    }
}

#[test]
fn hung_job_is_killed_at_its_timeout() {
    let sb = Sandbox::new();
    let id = sb.add("hang", "sleep 10", &["--timeout", "2"]);

    let begun = Instant::now();
    sb.ok(&["run", "--force-run"]);
    let elapsed = begun.elapsed();
    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_secs(6), "took {elapsed:?}");

    let logs = sb.logs(id);
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0]["success"], false);
    assert_eq!(logs[0]["on_time"], false);
    assert!(logs[0]["stderr"]
        .as_str()
        .unwrap()
        .ends_with("Job exceeded timeout\n"));

    let out = sb.ok(&["list"]);
    let job: Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(job["is_running"], false);
    assert_eq!(job["last_run_successful"], false);
}

#[test]
fn stale_marker_is_ignored_when_nothing_runs() {
    let sb = Sandbox::new();
    let id = sb.add("quick", "true", &[]);
    std::fs::write(sb.pid_file(), dead_pid().to_string()).unwrap();

    sb.ok(&["run", "--force-run"]);
    assert_eq!(sb.logs(id).len(), 1);
    assert!(!sb.pid_file().exists());
}

#[test]
fn live_marker_with_running_jobs_aborts() {
    let sb = Sandbox::new();
    let id = sb.add("busy", "true", &[]);
    {
        let conn = rusqlite::Connection::open(sb.db_path()).unwrap();
        conn.execute(
            "UPDATE jobs SET is_running = 1, current_pid = 1 WHERE id = ?1",
            [id],
        )
        .unwrap();
    }
    std::fs::write(sb.pid_file(), "1").unwrap();

    let out = sb.ok(&["run", "--force-run"]);
    assert!(launch_order(&out.stderr).is_empty());
    assert!(String::from_utf8_lossy(&out.stderr).contains("another instance"));
    assert!(sb.logs(id).is_empty());
    assert_eq!(std::fs::read_to_string(sb.pid_file()).unwrap(), "1");
}

#[test]
fn jobs_filter_ignores_non_numeric_ids() {
    let sb = Sandbox::new();
    let a = sb.add("a", "true", &[]);
    let b = sb.add("b", "true", &[]);

    let filter = format!("{b},nope");
    let out = sb.ok(&["run", "--force-run", "--jobs", &filter]);
    assert_eq!(launch_order(&out.stderr), vec![b]);
    assert!(sb.logs(a).is_empty());
    assert_eq!(sb.logs(b).len(), 1);
}

#[test]
fn triggered_job_runs_on_a_normal_sweep() {
    let sb = Sandbox::new();
    let id = sb.add("later", "echo triggered", &[]);

    // Not due for an hour.
    let out = sb.ok(&["run"]);
    assert!(launch_order(&out.stderr).is_empty());

    sb.ok(&["trigger", &id.to_string()]);
    let out = sb.ok(&["run"]);
    assert_eq!(launch_order(&out.stderr), vec![id]);

    let logs = sb.logs(id);
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0]["stdout"], "triggered\n");
}

#[test]
fn inline_mode_records_output_from_the_sweep() {
    let sb = Sandbox::new();
    let id = sb.add("inline", "echo out; echo err >&2; exit 2", &[]);

    sb.ok(&["run", "--force-run", "--inline"]);
    let logs = sb.logs(id);
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0]["success"], false);
    assert_eq!(logs[0]["on_time"], true);
    assert_eq!(logs[0]["stdout"], "out\n");
    assert_eq!(logs[0]["stderr"], "err\n");
}

#[test]
fn remove_deletes_the_job() {
    let sb = Sandbox::new();
    let id = sb.add("gone", "true", &[]);
    sb.ok(&["remove", &id.to_string()]);
    let out = sb.ok(&["list"]);
    assert!(out.stdout.is_empty());

    let out = sb.cmd().args(["remove", &id.to_string()]).output().unwrap();
    assert!(!out.status.success());
}

#[cfg(target_os = "linux")]
#[test]
fn stop_request_also_ends_background_children() {
    let sb = Sandbox::new();
    let marker = sb.dir.path().join("bg.pid");
    let command = format!("sleep 30 & echo $! > {}; echo started; wait", marker.display());
    let id = sb.add("bg", &command, &[]);

    let mut run = sb
        .cmd()
        .env("CRONSWEEP_SCHEDULER__HEARTBEAT_INTERVAL_SECS", "1")
        .args(["run", "--force-run"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let begun = Instant::now();
    let bg: u32 = loop {
        let written = std::fs::read_to_string(&marker).ok();
        if let Some(pid) = written.and_then(|s| s.trim().parse().ok()) {
            break pid;
        }
        assert!(begun.elapsed() < Duration::from_secs(5), "job never started");
        std::thread::sleep(Duration::from_millis(50));
    };

    sb.ok(&["stop", &id.to_string()]);
    assert!(run.wait().unwrap().success());
    assert!(begun.elapsed() < Duration::from_secs(10), "took {:?}", begun.elapsed());

    let deadline = Instant::now() + Duration::from_secs(2);
    while process_alive(bg) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(!process_alive(bg), "background child {bg} survived the stop");

    let logs = sb.logs(id);
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0]["success"], false);
    assert_eq!(logs[0]["stdout"], "started\n");
    assert!(logs[0]["stderr"]
        .as_str()
        .unwrap()
        .ends_with("Job stopped on request\n"));
}
