//! [`ProcessHandle`] – one supervised child process.
//!
//! The child is spawned with `kill_on_drop`, stdin and stdout closed, and
//! stderr captured into a bounded tail so a failed start can be explained.
//! Stopping sends SIGTERM (unix) and escalates to a forced kill after the
//! grace period, or at once when SIGTERM cannot be delivered.  The child
//! can be taken out as a [`Stopping`] so the grace period runs without
//! holding the handle.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::SupervisorError;

/// Lines of stderr kept per process.
pub const STDERR_TAIL_LINES: usize = 40;

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Appended as `--config <path>` when set.
    pub config_path: Option<PathBuf>,
}

/// How a process ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitRecord {
    /// `None` when the process was ended by a signal.
    pub code: Option<i32>,
    pub at: DateTime<Utc>,
    pub stderr_tail: Vec<String>,
}

type Tail = Arc<Mutex<VecDeque<String>>>;

pub struct ProcessHandle {
    module_id: String,
    child: Option<Child>,
    stopping: bool,
    pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
    last_exit: Option<ExitRecord>,
    tail: Tail,
}

impl ProcessHandle {
    /// A handle that has never run anything.
    pub fn idle(module_id: impl Into<String>) -> Self {
        Self {
            module_id: module_id.into(),
            child: None,
            stopping: false,
            pid: None,
            started_at: None,
            started: None,
            last_exit: None,
            tail: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Spawn `spec`.  Any previous exit record is kept until the new child
    /// exits.
    pub fn spawn(&mut self, spec: &LaunchSpec) -> Result<u32, SupervisorError> {
        if self.child.is_some() || self.stopping {
            return Err(SupervisorError::AlreadyRunning(self.module_id.clone()));
        }
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(config) = &spec.config_path {
            cmd.arg("--config").arg(config);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| SupervisorError::StartFailed {
            module: self.module_id.clone(),
            code: None,
            stderr_tail: vec![format!("failed to spawn {}: {e}", spec.program)],
        })?;
        let pid = child.id().unwrap_or(0);

        self.tail = Arc::new(Mutex::new(VecDeque::new()));
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(collect_tail(stderr, Arc::clone(&self.tail), self.module_id.clone()));
        }
        info!(module = %self.module_id, pid, program = %spec.program, "process spawned");

        self.child = Some(child);
        self.pid = Some(pid);
        self.started_at = Some(Utc::now());
        self.started = Some(Instant::now());
        Ok(pid)
    }

    /// Reap the child if it has exited.  Returns `true` while it runs.
    pub fn is_alive(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                self.record_exit(status);
                false
            }
            Err(e) => {
                warn!(module = %self.module_id, error = %e, "failed to poll process");
                true
            }
        }
    }

    /// Take the running child out for shutdown.  Until [`end_stop`] the
    /// handle reports [`is_stopping`] and refuses to spawn.
    ///
    /// [`end_stop`]: ProcessHandle::end_stop
    /// [`is_stopping`]: ProcessHandle::is_stopping
    pub fn begin_stop(&mut self) -> Option<Stopping> {
        let child = self.child.take()?;
        self.stopping = true;
        Some(Stopping {
            module_id: self.module_id.clone(),
            child,
        })
    }

    /// Record the outcome of a [`Stopping::finish`].
    pub fn end_stop(&mut self, status: Option<ExitStatus>) -> ExitRecord {
        self.stopping = false;
        let record = match status {
            Some(status) => self.exit_record(status),
            None => ExitRecord::unknown(self.stderr_tail()),
        };
        info!(module = %self.module_id, code = ?record.code, "process stopped");
        self.last_exit = Some(record.clone());
        self.clear_running();
        record
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn uptime(&self) -> Option<Duration> {
        self.started.map(|t| t.elapsed())
    }

    pub fn last_exit(&self) -> Option<&ExitRecord> {
        self.last_exit.as_ref()
    }

    pub fn stderr_tail(&self) -> Vec<String> {
        self.tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    fn exit_record(&self, status: ExitStatus) -> ExitRecord {
        ExitRecord {
            code: status.code(),
            at: Utc::now(),
            stderr_tail: self.stderr_tail(),
        }
    }

    fn record_exit(&mut self, status: ExitStatus) {
        let record = self.exit_record(status);
        info!(module = %self.module_id, code = ?record.code, "process exited");
        self.last_exit = Some(record);
        self.clear_running();
    }

    fn clear_running(&mut self) {
        self.child = None;
        self.pid = None;
        self.started_at = None;
        self.started = None;
    }
}

impl ExitRecord {
    fn unknown(stderr_tail: Vec<String>) -> Self {
        Self {
            code: None,
            at: Utc::now(),
            stderr_tail,
        }
    }
}

/// A child on its way down, detached from its [`ProcessHandle`].
pub struct Stopping {
    module_id: String,
    child: Child,
}

impl Stopping {
    /// SIGTERM, wait up to `grace`, then force-kill.  `None` when the exit
    /// status could not be collected.
    pub async fn finish(mut self, grace: Duration) -> Option<ExitStatus> {
        let asked = match self.child.id() {
            Some(pid) => request_terminate(pid).await,
            None => false,
        };
        if asked {
            match tokio::time::timeout(grace, self.child.wait()).await {
                Ok(Ok(status)) => return Some(status),
                Ok(Err(e)) => {
                    warn!(module = %self.module_id, error = %e, "wait failed");
                    return None;
                }
                Err(_) => {
                    warn!(module = %self.module_id, grace_ms = grace.as_millis() as u64, "process ignored SIGTERM; killing");
                }
            }
        }
        if let Err(e) = self.child.start_kill() {
            warn!(module = %self.module_id, error = %e, "kill failed");
        }
        self.child.wait().await.ok()
    }
}

async fn collect_tail(stderr: ChildStderr, tail: Tail, module_id: String) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!(module = %module_id, line = %line, "child stderr");
                let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Ok(None) => break,
            Err(e) => {
                debug!(module = %module_id, error = %e, "stderr read ended");
                break;
            }
        }
    }
}

/// Send SIGTERM through `kill(1)`.  `false` means the signal was not
/// delivered and the caller should kill outright.
#[cfg(unix)]
async fn request_terminate(pid: u32) -> bool {
    let sent = Command::new("kill")
        .arg("-TERM")
        .arg(pid.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match sent {
        Ok(status) if status.success() => true,
        Ok(status) => {
            warn!(pid, code = ?status.code(), "kill -TERM failed");
            false
        }
        Err(e) => {
            warn!(pid, error = %e, "failed to send SIGTERM");
            false
        }
    }
}

#[cfg(not(unix))]
async fn request_terminate(_pid: u32) -> bool {
    false
}
