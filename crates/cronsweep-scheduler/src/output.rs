//! Output collection: fragments of job output travel from runner pipe
//! readers to the scheduler loop over two unbounded queues.
//!
//! Producers never block. The loop drains whatever is available each tick
//! into a [`RunSnapshot`], which keeps fragments per job in arrival order.

use std::collections::HashMap;

use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

use crate::types::JobId;

/// Which of a job's output streams a fragment came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// A piece of output tagged with the job that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub job_id: JobId,
    pub text: String,
}

/// Cloneable producer half of an [`OutputCollector`].
#[derive(Debug, Clone)]
pub struct OutputSink {
    stdout: UnboundedSender<Fragment>,
    stderr: UnboundedSender<Fragment>,
}

impl OutputSink {
    /// Queue a fragment. Returns `false` once the collector has been dropped.
    pub fn push(&self, stream: Stream, job_id: JobId, text: impl Into<String>) -> bool {
        let tx = match stream {
            Stream::Stdout => &self.stdout,
            Stream::Stderr => &self.stderr,
        };
        tx.send(Fragment {
            job_id,
            text: text.into(),
        })
        .is_ok()
    }
}

/// Consumer half: owned by the scheduler loop.
#[derive(Debug)]
pub struct OutputCollector {
    sink: OutputSink,
    stdout_rx: UnboundedReceiver<Fragment>,
    stderr_rx: UnboundedReceiver<Fragment>,
}

impl OutputCollector {
    pub fn new() -> Self {
        let (stdout, stdout_rx) = mpsc::unbounded_channel();
        let (stderr, stderr_rx) = mpsc::unbounded_channel();
        Self {
            sink: OutputSink { stdout, stderr },
            stdout_rx,
            stderr_rx,
        }
    }

    pub fn sink(&self) -> OutputSink {
        self.sink.clone()
    }

    /// Move every fragment currently queued into `snapshot` without waiting.
    /// Returns the number of fragments moved.
    pub fn drain_into(&mut self, snapshot: &mut RunSnapshot) -> usize {
        let mut moved = 0;
        for (stream, rx) in [
            (Stream::Stdout, &mut self.stdout_rx),
            (Stream::Stderr, &mut self.stderr_rx),
        ] {
            loop {
                match rx.try_recv() {
                    Ok(fragment) => {
                        snapshot.record(stream, fragment);
                        moved += 1;
                    }
                    // The collector holds a sender itself, so Disconnected
                    // cannot happen while it lives.
                    Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
                }
            }
        }
        moved
    }
}

impl Default for OutputCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-job accumulated output for the current sweep.
#[derive(Debug, Default)]
pub struct RunSnapshot {
    stdout: HashMap<JobId, Vec<String>>,
    stderr: HashMap<JobId, Vec<String>>,
}

impl RunSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, stream: Stream, fragment: Fragment) {
        let map = match stream {
            Stream::Stdout => &mut self.stdout,
            Stream::Stderr => &mut self.stderr,
        };
        map.entry(fragment.job_id).or_default().push(fragment.text);
    }

    /// Remove and concatenate `job_id`'s output as `(stdout, stderr)`.
    pub fn take(&mut self, job_id: JobId) -> (String, String) {
        let stdout = self.stdout.remove(&job_id).unwrap_or_default().concat();
        let stderr = self.stderr.remove(&job_id).unwrap_or_default().concat();
        (stdout, stderr)
    }

    /// Drop whatever was accumulated for `job_id`.
    pub fn discard(&mut self, job_id: JobId) {
        self.stdout.remove(&job_id);
        self.stderr.remove(&job_id);
    }

    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }
}
