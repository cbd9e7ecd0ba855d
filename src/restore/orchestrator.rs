//! Restore lifecycle control-plane.
//!
//! Picks a provider from configuration, allocates a port, starts the
//! provider and exposes start/poll/complete/delete plus the stale-restore
//! sweep. States: `pending → running → {success, failed, unknown,
//! not_found}`; pending/running mean "still going", the rest are terminal
//! and reached exactly once.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::anonymize::Anonymizer;
use crate::config::Config;
use crate::db::{DbHandle, Restore, Task};
use crate::error::BranchError;
use crate::process::{EXCERPT_LINES, ProcessMonitor, ProcessStatus};
use crate::resource::cleanup::CleanupManager;
use crate::resource::ports::find_free_port;
use crate::restore::provider::{RestoreProvider, RestoreSpec};
use crate::restore::retention::retention_candidates;
use crate::scheduler::next_fire;
use crate::queue::TaskKind;

/// Observable lifecycle state of one restore operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreState {
    /// Created but the background operation has not started yet.
    Pending,
    Running,
    Success,
    Failed { excerpt: String },
    /// Exited without a sentinel: crash evidence, fatal.
    Unknown,
    /// No trace of the operation on disk.
    NotFound,
}

impl RestoreState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

#[derive(Clone)]
pub struct RestoreService {
    cfg: Arc<Config>,
    db: DbHandle,
    monitor: ProcessMonitor,
    cleanup: CleanupManager,
    anonymizer: Anonymizer,
}

impl RestoreService {
    pub fn new(
        cfg: Arc<Config>,
        db: DbHandle,
        monitor: ProcessMonitor,
        cleanup: CleanupManager,
        anonymizer: Anonymizer,
    ) -> Self {
        Self {
            cfg,
            db,
            monitor,
            cleanup,
            anonymizer,
        }
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    pub fn monitor(&self) -> &ProcessMonitor {
        &self.monitor
    }

    /// Unique timestamp-derived restore name.
    pub fn restore_name(at: DateTime<Utc>) -> String {
        format!("restore_{}", at.format("%Y%m%d%H%M%S"))
    }

    /// Creates the restore record and enqueues the start task. Returns
    /// immediately; the worker pool drives the rest.
    pub async fn start(&self, schema_only: Option<bool>) -> Result<Restore, BranchError> {
        let db_cfg = self.db.get_config().await?;
        let provider = RestoreProvider::select(
            self.cfg.clone(),
            &db_cfg,
            crate::resource::cmd::AdminRunner::new(self.cfg.admin_cmd_timeout_secs),
        )?;
        provider.validate_config()?;

        let requested = schema_only.unwrap_or(db_cfg.schema_only_default);
        // The snapshot strategy is always full; the flag is forced false.
        let schema_only = requested && provider.supports_schema_only();
        if requested && !provider.supports_schema_only() {
            warn!("schema-only requested but the snapshot strategy is always full; forcing off");
        }

        let port = find_free_port(self.cfg.restore_port_start, self.cfg.restore_port_end)?;
        let name = Self::restore_name(Utc::now());
        let restore = self.db.create_restore(&name, schema_only, port).await?;

        self.db
            .enqueue_task(TaskKind::RestoreStart.as_str(), restore.id, 0, Utc::now())
            .await?;
        info!(
            restore_id = restore.id,
            name = %restore.name,
            kind = %provider.kind(),
            schema_only,
            "restore created and start task enqueued"
        );
        Ok(restore)
    }

    /// Start-task handler. Within one restore name at most one background
    /// operation exists: when the operation is already running this only
    /// schedules monitoring.
    pub async fn launch(&self, restore_id: i64) -> Result<(), BranchError> {
        let restore = self.db.get_restore(restore_id).await?;
        if restore.ready_at.is_some() {
            info!(restore_id, "restore already ready; nothing to launch");
            return Ok(());
        }
        if self.monitor.is_running(&restore.name) {
            info!(
                restore_id,
                name = %restore.name,
                "operation already running; scheduling monitoring only"
            );
            self.enqueue_wait(restore_id, 0).await?;
            return Ok(());
        }

        let db_cfg = self.db.get_config().await?;
        let provider = RestoreProvider::select(
            self.cfg.clone(),
            &db_cfg,
            crate::resource::cmd::AdminRunner::new(self.cfg.admin_cmd_timeout_secs),
        )?;
        provider.validate_config()?;

        let spec = RestoreSpec {
            name: restore.name.clone(),
            port: restore.port,
            schema_only: restore.schema_only,
            dataset: self.cleanup.dataset(&restore.name),
            mountpoint: self.cleanup.mountpoint(&restore.name),
        };
        provider.start_restore(&spec).await?;
        self.enqueue_wait(restore_id, 0).await
    }

    /// Maps the on-disk process markers onto the state machine.
    pub async fn poll(&self, restore_id: i64) -> Result<RestoreState, BranchError> {
        let restore = self.db.get_restore(restore_id).await?;
        if restore.ready_at.is_some() {
            return Ok(RestoreState::Success);
        }
        Ok(match self.monitor.status(&restore.name) {
            ProcessStatus::Running => RestoreState::Running,
            ProcessStatus::Success => RestoreState::Success,
            ProcessStatus::Failed { excerpt } => RestoreState::Failed { excerpt },
            ProcessStatus::Unknown => RestoreState::Unknown,
            ProcessStatus::NotFound => RestoreState::NotFound,
        })
    }

    /// Wait-task handler: polls once and either finishes the lifecycle or
    /// re-enqueues itself. Each poll reschedules the next one, so a worker
    /// crash between polls only delays detection.
    pub async fn handle_wait(&self, task: &Task) -> Result<(), BranchError> {
        let restore = match self.db.get_restore(task.restore_id).await {
            Ok(r) => r,
            Err(BranchError::RestoreNotFound(_)) => {
                // Deleted mid-flight; monitoring stops with it.
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if restore.ready_at.is_some() {
            return Ok(());
        }

        match self.poll(task.restore_id).await? {
            RestoreState::Pending | RestoreState::Running => {
                let next_attempt = task.attempt + 1;
                if next_attempt > i64::from(self.cfg.poll_max_attempts) {
                    error!(
                        restore_id = restore.id,
                        name = %restore.name,
                        attempts = task.attempt,
                        "restore exceeded its polling ceiling; giving up"
                    );
                    return Ok(());
                }
                self.enqueue_wait(task.restore_id, next_attempt).await
            }
            RestoreState::Success => {
                if let Err(e) = self.complete(&restore).await {
                    // The backing process already succeeded; the restore is
                    // left not-ready, never partially ready.
                    error!(
                        restore_id = restore.id,
                        name = %restore.name,
                        error = %e,
                        "post-success completion failed; restore left not-ready"
                    );
                    return Err(e);
                }
                Ok(())
            }
            RestoreState::Failed { excerpt } => {
                // Propagated with its trailing log excerpt, never
                // auto-retried by re-triggering.
                error!(
                    restore_id = restore.id,
                    name = %restore.name,
                    "restore operation failed:\n{excerpt}"
                );
                Err(BranchError::ProcessFailed {
                    name: restore.name,
                    excerpt,
                })
            }
            RestoreState::Unknown | RestoreState::NotFound => {
                let excerpt = self.monitor.last_log_lines(&restore.name, EXCERPT_LINES);
                error!(
                    restore_id = restore.id,
                    name = %restore.name,
                    "restore operation vanished without reporting an outcome:\n{excerpt}"
                );
                Err(BranchError::ProcessUnknown { name: restore.name })
            }
        }
    }

    /// Post-success sequence: anonymize if rules exist, flip readiness in
    /// one transaction, update the refresh timestamps once a second restore
    /// exists, then sweep stale restores excluding this one.
    ///
    /// Idempotent: an already-ready restore returns unchanged, so this is
    /// also the anonymization-only retry path.
    pub async fn complete(&self, restore: &Restore) -> Result<Restore, BranchError> {
        if restore.ready_at.is_some() {
            return Ok(restore.clone());
        }

        let rules = self.db.list_rules().await?;
        if !rules.is_empty() {
            self.anonymizer.apply(restore.port, &rules).await?;
        }

        let updated = self.db.mark_restore_ready(restore.id, Utc::now()).await?;
        info!(restore_id = updated.id, name = %updated.name, "restore ready");

        if self.db.count_restores().await? > 1 {
            let db_cfg = self.db.get_config().await?;
            let now = Utc::now();
            let next = next_fire(&db_cfg.cron_expression, now);
            self.db.update_refresh_timestamps(now, next).await?;
        }

        self.sweep_stale(Some(updated.id)).await?;
        Ok(updated)
    }

    /// Deletes a restore. Refuses while it owns branches; force-kills a
    /// running operation first, then walks the ordered cleanup. There is no
    /// mid-flight cancellation — deletion is destructive, not cooperative.
    pub async fn delete(&self, restore_id: i64) -> Result<(), BranchError> {
        let restore = self.db.get_restore(restore_id).await?;
        let branches = self.db.list_branches(Some(restore_id)).await?;
        if !branches.is_empty() {
            return Err(BranchError::RestoreHasBranches {
                id: restore_id,
                count: i64::try_from(branches.len()).unwrap_or(i64::MAX),
            });
        }

        self.cleanup.cleanup_instance(&restore.name).await?;
        self.monitor.clear(&restore.name);
        let script = self.cfg.script_dir.join(format!("{}.sh", restore.name));
        let _ = std::fs::remove_file(script);

        self.db.delete_restore(restore_id).await?;
        info!(restore_id, name = %restore.name, "restore deleted");
        Ok(())
    }

    /// Retention sweep. Candidates never include restores owning branches
    /// or the excluded id.
    pub async fn sweep_stale(&self, exclude_id: Option<i64>) -> Result<usize, BranchError> {
        let rows = self.db.restores_with_branch_counts().await?;
        let db_cfg = self.db.get_config().await?;
        let doomed = retention_candidates(&rows, db_cfg.max_restores, exclude_id);

        let mut deleted = 0usize;
        let mut first_error = None;
        for id in doomed {
            match self.delete(id).await {
                Ok(()) => deleted += 1,
                Err(e) => {
                    warn!(restore_id = id, error = %e, "sweep failed to delete restore");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(deleted),
        }
    }

    async fn enqueue_wait(&self, restore_id: i64, attempt: i64) -> Result<(), BranchError> {
        let due = Utc::now() + chrono::Duration::seconds(i64::try_from(self.cfg.poll_interval_secs).unwrap_or(10));
        self.db
            .enqueue_task(TaskKind::RestoreWait.as_str(), restore_id, attempt, due)
            .await?;
        Ok(())
    }
}
