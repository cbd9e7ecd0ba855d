//! Runner for short-lived administrative commands (zfs, systemctl, ufw,
//! fuser, psql). Every invocation is bounded by a timeout; the retryable
//! class gets a small exponential backoff. The long-running restore
//! operation itself never goes through here.

use std::process::Stdio;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{BranchError, IsRetryable};

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone)]
pub struct AdminRunner {
    timeout: Duration,
    retry_policy: ExponentialBuilder,
}

impl AdminRunner {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs),
            retry_policy: ExponentialBuilder::default()
                .with_min_delay(Duration::from_millis(250))
                .with_max_delay(Duration::from_secs(5))
                .with_max_times(3),
        }
    }

    /// Runs a command once with the bounded timeout. Non-zero exit is an
    /// error carrying the captured stderr.
    pub async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, BranchError> {
        let rendered = render(program, args);
        debug!(command = %rendered, "running admin command");

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| BranchError::CommandTimeout {
                command: rendered.clone(),
                secs: self.timeout.as_secs(),
            })??;

        let out = CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if out.status != 0 {
            return Err(BranchError::CommandFailed {
                command: rendered,
                status: out.status,
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(out)
    }

    /// Runs with backoff for the retryable error class.
    pub async fn run_retry(
        &self,
        program: &str,
        args: &[&str],
    ) -> Result<CommandOutput, BranchError> {
        let policy = self.retry_policy.clone();
        (|| async { self.run(program, args).await })
            .retry(policy)
            .when(|e: &BranchError| e.is_retryable())
            .notify(|err, dur: Duration| {
                warn!("admin command retrying after {:?}: {}", dur, err);
            })
            .await
    }

    /// Best-effort variant: failures are logged as warnings and swallowed.
    /// Used for the cleanup steps that must not abort the sequence.
    pub async fn run_best_effort(&self, program: &str, args: &[&str]) {
        if let Err(e) = self.run(program, args).await {
            warn!(command = %render(program, args), error = %e, "best-effort command failed, continuing");
        }
    }
}

fn render(program: &str, args: &[&str]) -> String {
    let mut s = String::from(program);
    for a in args {
        s.push(' ');
        s.push_str(a);
    }
    s
}
