//! Stateless liveness and outcome tracking for named background operations.
//!
//! Durable state per operation is exactly one PID file and one append-only
//! log at fixed, name-keyed paths. The background script appends a sentinel
//! line, forces a filesystem sync, then removes its own PID file — in that
//! order. External tooling reads the same files, so the contract is
//! bit-for-bit: this module never writes sentinels or PID files itself.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Terminal success marker appended by the background script.
pub const SUCCESS_SENTINEL: &str = "RESTORE COMPLETED";

/// Terminal failure marker appended by the background script.
pub const FAILURE_SENTINEL: &str = "RESTORE FAILED";

/// Number of trailing log lines attached to failure diagnostics.
pub const EXCERPT_LINES: usize = 50;

/// Observed state of a named background operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessStatus {
    /// PID file present and the process is alive.
    Running,
    /// PID gone, success sentinel found.
    Success,
    /// PID gone, failure sentinel found. Carries the trailing log excerpt.
    Failed { excerpt: String },
    /// PID gone, log exists, no sentinel: the process died without
    /// reporting. Callers treat this as fatal.
    Unknown,
    /// Neither PID file nor log exists.
    NotFound,
}

/// Tracks liveness (PID marker) and terminal outcome (log sentinel) of
/// named long-running operations, safely across controller restarts.
#[derive(Debug, Clone)]
pub struct ProcessMonitor {
    run_dir: PathBuf,
    log_dir: PathBuf,
}

impl ProcessMonitor {
    pub fn new(run_dir: impl Into<PathBuf>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
            log_dir: log_dir.into(),
        }
    }

    /// Fixed, name-keyed PID file path.
    pub fn pid_path(&self, name: &str) -> PathBuf {
        self.run_dir.join(format!("{name}.pid"))
    }

    /// Fixed, name-keyed log path.
    pub fn log_path(&self, name: &str) -> PathBuf {
        self.log_dir.join(format!("{name}.log"))
    }

    /// Reads the recorded PID, if any.
    pub fn read_pid(&self, name: &str) -> Option<i32> {
        let raw = fs::read_to_string(self.pid_path(name)).ok()?;
        raw.trim().parse::<i32>().ok()
    }

    /// Liveness check: read the PID and probe it with a zero-signal
    /// syscall. A dead or unparseable PID file is stale; it is removed and
    /// the operation reported not running. No other coordination is needed
    /// for a safe restart after a controller crash.
    pub fn is_running(&self, name: &str) -> bool {
        let pid_path = self.pid_path(name);
        let Ok(raw) = fs::read_to_string(&pid_path) else {
            return false;
        };
        let Ok(pid) = raw.trim().parse::<i32>() else {
            warn!(name, "unparseable PID file, removing");
            let _ = fs::remove_file(&pid_path);
            return false;
        };
        if pid_alive(pid) {
            return true;
        }
        debug!(name, pid, "stale PID file, removing");
        let _ = fs::remove_file(&pid_path);
        false
    }

    /// Derives the operation's state from its on-disk markers.
    pub fn status(&self, name: &str) -> ProcessStatus {
        if self.is_running(name) {
            return ProcessStatus::Running;
        }

        let log_path = self.log_path(name);
        let Ok(log) = fs::read_to_string(&log_path) else {
            return ProcessStatus::NotFound;
        };

        // Last sentinel wins; a retried operation appends to the same log.
        let mut outcome = None;
        for line in log.lines() {
            let line = line.trim();
            if line == SUCCESS_SENTINEL {
                outcome = Some(true);
            } else if line == FAILURE_SENTINEL {
                outcome = Some(false);
            }
        }

        match outcome {
            Some(true) => ProcessStatus::Success,
            Some(false) => ProcessStatus::Failed {
                excerpt: tail_lines(&log, EXCERPT_LINES),
            },
            // Exited without a sentinel: crash evidence, not a pending
            // write — the script syncs before removing its PID file.
            None => ProcessStatus::Unknown,
        }
    }

    /// Trailing `n` lines of the operation log, for diagnostics.
    pub fn last_log_lines(&self, name: &str, n: usize) -> String {
        match fs::read_to_string(self.log_path(name)) {
            Ok(log) => tail_lines(&log, n),
            Err(_) => String::new(),
        }
    }

    /// Removes both markers. Used by delete after cleanup has finished.
    pub fn clear(&self, name: &str) {
        let _ = fs::remove_file(self.pid_path(name));
        let _ = fs::remove_file(self.log_path(name));
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }
}

/// Zero-signal probe. EPERM means the process exists but belongs to
/// someone else, which still counts as alive.
fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn tail_lines(log: &str, n: usize) -> String {
    let lines: Vec<&str> = log.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
