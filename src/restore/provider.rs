//! Restore strategy selection and the shared background-operation launch
//! protocol.
//!
//! The provider set is a closed, two-member union with exhaustive dispatch:
//! the two strategies differ enough (schema-only support, config shape)
//! that explicit handling beats an open registry.

use std::fmt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use tracing::info;

use crate::config::Config;
use crate::db::DbConfig;
use crate::error::BranchError;
use crate::process::{FAILURE_SENTINEL, SUCCESS_SENTINEL};
use crate::resource::cmd::AdminRunner;
use crate::restore::logical::LogicalProvider;
use crate::restore::snapshot::SnapshotProvider;

/// Logging discriminator only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Logical,
    Snapshot,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Logical => write!(f, "logical"),
            Self::Snapshot => write!(f, "snapshot"),
        }
    }
}

/// Everything a provider needs to materialize one restore.
#[derive(Debug, Clone)]
pub struct RestoreSpec {
    pub name: String,
    pub port: u16,
    pub schema_only: bool,
    pub dataset: String,
    pub mountpoint: PathBuf,
}

/// The two restore strategies.
pub enum RestoreProvider {
    Logical(LogicalProvider),
    Snapshot(SnapshotProvider),
}

impl RestoreProvider {
    /// Picks a strategy from the stored configuration: snapshot whenever
    /// remote-backup credentials are configured, else logical, else a
    /// configuration error.
    pub fn select(
        cfg: Arc<Config>,
        db_cfg: &DbConfig,
        admin: AdminRunner,
    ) -> Result<Self, BranchError> {
        if db_cfg.repo_stanza.is_some()
            || db_cfg.repo_endpoint.is_some()
            || db_cfg.repo_api_key.is_some()
        {
            let provider = SnapshotProvider::new(
                cfg,
                db_cfg.repo_stanza.clone(),
                db_cfg.repo_endpoint.clone(),
                db_cfg.repo_api_key.clone(),
                admin,
            );
            return Ok(Self::Snapshot(provider));
        }
        if db_cfg.source_dsn.is_some() {
            return Ok(Self::Logical(LogicalProvider::new(
                cfg,
                db_cfg.source_dsn.clone(),
            )));
        }
        Err(BranchError::Config(
            "neither a source connection string nor backup-repository credentials are configured"
                .to_string(),
        ))
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::Logical(_) => ProviderKind::Logical,
            Self::Snapshot(_) => ProviderKind::Snapshot,
        }
    }

    /// Whether the caller-visible schema-only flag is honored. Snapshot
    /// restores are always full; the flag is forced false for them.
    pub fn supports_schema_only(&self) -> bool {
        matches!(self, Self::Logical(_))
    }

    /// Fails fast when strategy-required fields are missing, before any
    /// resource is touched.
    pub fn validate_config(&self) -> Result<(), BranchError> {
        match self {
            Self::Logical(p) => p.validate(),
            Self::Snapshot(p) => p.validate(),
        }
    }

    /// Launches the detached background operation and returns without
    /// waiting. The caller guarantees no other operation is running for
    /// this name.
    pub async fn start_restore(&self, spec: &RestoreSpec) -> Result<(), BranchError> {
        info!(name = %spec.name, kind = %self.kind(), port = spec.port, "starting restore operation");
        match self {
            Self::Logical(p) => p.start(spec).await,
            Self::Snapshot(p) => p.start(spec).await,
        }
    }
}

/// Shared script preamble: redirect all output to the durable log and
/// record the PID marker. `rollback_cmds` run inside `fail` before the
/// sentinel is written (logical rolls back, snapshot deliberately leaves
/// its dataset for debugging).
pub(crate) fn script_preamble(log: &Path, pid_file: &Path, rollback_cmds: &str) -> String {
    format!(
        "#!/usr/bin/env bash\n\
         set -uo pipefail\n\
         \n\
         LOG=\"{log}\"\n\
         PID_FILE=\"{pid}\"\n\
         exec >>\"$LOG\" 2>&1\n\
         echo $$ > \"$PID_FILE\"\n\
         \n\
         fail() {{\n\
         {rollback_cmds}    echo \"{failure}\"\n\
         \x20   sync\n\
         \x20   rm -f \"$PID_FILE\"\n\
         \x20   exit 1\n\
         }}\n\
         \n\
         must() {{\n\
         \x20   \"$@\" || fail\n\
         }}\n\
         \n\
         # exit code 0 or 1 is completed-with-warnings; anything above aborts\n\
         phase() {{\n\
         \x20   \"$@\"\n\
         \x20   local rc=$?\n\
         \x20   if [ \"$rc\" -gt 1 ]; then\n\
         \x20       echo \"phase '$*' failed with exit code $rc\"\n\
         \x20       fail\n\
         \x20   fi\n\
         }}\n",
        log = log.display(),
        pid = pid_file.display(),
        failure = FAILURE_SENTINEL,
    )
}

/// Shared script epilogue: sentinel, forced sync, then the script removes
/// its own PID file — in exactly that order.
pub(crate) fn script_epilogue() -> String {
    format!(
        "\necho \"{success}\"\n\
         sync\n\
         rm -f \"$PID_FILE\"\n",
        success = SUCCESS_SENTINEL,
    )
}

/// Writes the generated script and launches it in its own session,
/// detached from the worker pool entirely.
pub(crate) async fn launch_detached(
    script_dir: &Path,
    name: &str,
    script: &str,
) -> Result<(), BranchError> {
    tokio::fs::create_dir_all(script_dir).await?;
    let path = script_dir.join(format!("{name}.sh"));
    tokio::fs::write(&path, script).await?;
    tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).await?;

    Command::new("setsid")
        .arg("bash")
        .arg(&path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    Ok(())
}
