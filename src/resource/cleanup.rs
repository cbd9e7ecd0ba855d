//! Ordered reclamation of a restore's host resources.
//!
//! Steps: kill the tracked process, stop and disable its service unit,
//! remove the unit file, kill whatever still holds the dataset open, then
//! destroy the dataset recursively. Every step but the last is
//! best-effort; dataset destruction failure is fatal because a
//! still-mounted dataset must never be treated as deleted.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Config;
use crate::error::BranchError;
use crate::process::ProcessMonitor;
use crate::resource::cmd::AdminRunner;

#[derive(Clone)]
pub struct CleanupManager {
    cfg: Arc<Config>,
    admin: AdminRunner,
    monitor: ProcessMonitor,
}

impl CleanupManager {
    pub fn new(cfg: Arc<Config>, admin: AdminRunner, monitor: ProcessMonitor) -> Self {
        Self {
            cfg,
            admin,
            monitor,
        }
    }

    /// ZFS dataset backing an instance.
    pub fn dataset(&self, name: &str) -> String {
        format!("{}/{}", self.cfg.data_root, name)
    }

    /// Mountpoint of an instance's dataset.
    pub fn mountpoint(&self, name: &str) -> PathBuf {
        self.cfg.mount_root.join(name)
    }

    /// Per-instance systemd unit name.
    pub fn unit_name(&self, name: &str) -> String {
        format!("pgbranch-{name}.service")
    }

    /// Reclaims everything a restore (or branch) instance holds, in order.
    pub async fn cleanup_instance(&self, name: &str) -> Result<(), BranchError> {
        // 1. Kill the tracked process, if its PID marker is still live.
        if let Some(pid) = self.monitor.read_pid(name) {
            let result = unsafe { libc::kill(pid, libc::SIGKILL) };
            if result != 0 {
                warn!(name, pid, "kill of tracked process failed, continuing");
            }
        }

        // 2. Stop and disable the service unit.
        let unit = self.unit_name(name);
        self.admin
            .run_best_effort(&self.cfg.systemctl_bin, &["stop", &unit])
            .await;
        self.admin
            .run_best_effort(&self.cfg.systemctl_bin, &["disable", &unit])
            .await;

        // 3. Remove the unit file and reload.
        let unit_path = self.cfg.unit_dir.join(&unit);
        if unit_path.exists() {
            if let Err(e) = std::fs::remove_file(&unit_path) {
                warn!(name, error = %e, "unit file removal failed, continuing");
            }
            self.admin
                .run_best_effort(&self.cfg.systemctl_bin, &["daemon-reload"])
                .await;
        }

        // 4. Kill anything still holding the mountpoint open.
        let mountpoint = self.mountpoint(name);
        if mountpoint.exists() {
            let mp = mountpoint.to_string_lossy().into_owned();
            self.admin
                .run_best_effort(&self.cfg.fuser_bin, &["-k", "-m", &mp])
                .await;
        }

        // 5. Destroy the dataset. The one step that must not be shrugged
        // off.
        self.destroy_dataset(&self.dataset(name)).await?;

        info!(name, "instance resources reclaimed");
        Ok(())
    }

    /// Recursively destroys a dataset. Missing datasets are fine (already
    /// gone); any other failure is fatal.
    pub async fn destroy_dataset(&self, dataset: &str) -> Result<(), BranchError> {
        match self
            .admin
            .run_retry(&self.cfg.zfs_bin, &["destroy", "-r", dataset])
            .await
        {
            Ok(_) => Ok(()),
            Err(BranchError::CommandFailed { stderr, .. })
                if stderr.contains("does not exist") =>
            {
                Ok(())
            }
            Err(e) => Err(BranchError::DatasetDestroy {
                dataset: dataset.to_string(),
                detail: e.to_string(),
            }),
        }
    }
}
