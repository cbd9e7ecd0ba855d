//! Dump-and-restore strategy.
//!
//! Dumps the source into one compressed archive, initializes a fresh
//! cluster on the allocated port, then restores in three ordered phases:
//! schema, data (parallel), indexes/constraints (parallel). Building
//! indexes after bulk load beats incremental maintenance.

use std::sync::Arc;

use crate::config::Config;
use crate::error::BranchError;
use crate::restore::READY_SNAPSHOT;
use crate::restore::provider::{RestoreSpec, launch_detached, script_epilogue, script_preamble};
use crate::restore::tuning::{RestoreTuning, compute_tuning, free_disk_bytes};

const GIB: u64 = 1024 * 1024 * 1024;

pub struct LogicalProvider {
    cfg: Arc<Config>,
    source_dsn: Option<String>,
}

impl LogicalProvider {
    pub fn new(cfg: Arc<Config>, source_dsn: Option<String>) -> Self {
        Self { cfg, source_dsn }
    }

    pub fn validate(&self) -> Result<(), BranchError> {
        match self.source_dsn.as_deref() {
            Some(dsn) if !dsn.trim().is_empty() => Ok(()),
            _ => Err(BranchError::Config(
                "logical restore requires a source connection string".to_string(),
            )),
        }
    }

    pub async fn start(&self, spec: &RestoreSpec) -> Result<(), BranchError> {
        self.validate()?;

        let free = free_disk_bytes(&self.cfg.mount_root);
        if free < self.cfg.free_disk_floor_gib * GIB {
            return Err(BranchError::Validation(format!(
                "free disk below floor: {} GiB available, {} GiB required",
                free / GIB,
                self.cfg.free_disk_floor_gib
            )));
        }

        let tuning = compute_tuning();
        let script = self.render_script(spec, &tuning);
        launch_detached(&self.cfg.script_dir, &spec.name, &script).await
    }

    /// Full restore script. Pure so the generated phases can be asserted
    /// without touching a host.
    pub fn render_script(&self, spec: &RestoreSpec, tuning: &RestoreTuning) -> String {
        let cfg = &self.cfg;
        let log = cfg.log_dir.join(format!("{}.log", spec.name));
        let pid = cfg.run_dir.join(format!("{}.pid", spec.name));
        let pgdata = spec.mountpoint.join("pgdata");
        let archive = spec.mountpoint.join("source.dump");
        let unit = format!("pgbranch-{}.service", spec.name);
        let unit_path = cfg.unit_dir.join(&unit);
        let dsn = self.source_dsn.as_deref().unwrap_or_default();

        // Logical restores roll back their partial cluster on failure.
        let rollback = format!(
            "\x20   echo \"rolling back partial restore\"\n\
             \x20   runuser -u postgres -- {pg_ctl} --pgdata=\"{pgdata}\" --mode=immediate stop || true\n\
             \x20   {zfs} destroy -r \"{dataset}\" || true\n",
            pg_ctl = cfg.pg_ctl_bin,
            pgdata = pgdata.display(),
            zfs = cfg.zfs_bin,
            dataset = spec.dataset,
        );

        let mut s = script_preamble(&log, &pid, &rollback);

        s.push_str(&format!(
            "\nNAME=\"{name}\"\n\
             DATASET=\"{dataset}\"\n\
             PGDATA=\"{pgdata}\"\n\
             ARCHIVE=\"{archive}\"\n\
             DB=\"postgresql://postgres@127.0.0.1:{port}/{database}\"\n\
             AS_PG=\"runuser -u postgres --\"\n\
             \n\
             echo \"logical restore $NAME starting (jobs={jobs}, schema_only={schema_only})\"\n\
             must {zfs} create \"$DATASET\"\n\
             must chown postgres:postgres \"{mountpoint}\"\n",
            name = spec.name,
            dataset = spec.dataset,
            pgdata = pgdata.display(),
            archive = archive.display(),
            port = spec.port,
            database = cfg.restore_database,
            jobs = tuning.jobs,
            schema_only = spec.schema_only,
            zfs = cfg.zfs_bin,
            mountpoint = spec.mountpoint.display(),
        ));

        // One compressed archive of the source.
        let schema_flag = if spec.schema_only { " --schema-only" } else { "" };
        s.push_str(&format!(
            "must $AS_PG {pg_dump} --format=custom --compress=6{schema_flag} --file=\"$ARCHIVE\" --dbname=\"{dsn}\"\n",
            pg_dump = cfg.pg_dump_bin,
        ));

        // Fresh cluster with allow-listed tunables.
        s.push_str(&format!(
            "must $AS_PG {initdb} --pgdata=\"$PGDATA\" --username=postgres\n\
             {{\n\
             \x20   echo \"port = {port}\"\n\
             \x20   echo \"listen_addresses = '*'\"\n\
             \x20   echo \"maintenance_work_mem = {mwm}MB\"\n",
            initdb = cfg.initdb_bin,
            port = spec.port,
            mwm = tuning.maintenance_work_mem_mb,
        ));
        for tunable in &cfg.pg_tunables {
            let (key, value) = tunable.split_once('=').unwrap_or((tunable.as_str(), "on"));
            s.push_str(&format!("\x20   echo \"{key} = {value}\"\n"));
        }
        s.push_str("} >> \"$PGDATA/postgresql.auto.conf\"\n");

        s.push_str(&format!(
            "must $AS_PG {pg_ctl} --pgdata=\"$PGDATA\" --wait start\n",
            pg_ctl = cfg.pg_ctl_bin,
        ));

        // Three ordered phases; 0 or 1 is completed-with-warnings.
        s.push_str(&format!(
            "phase $AS_PG {pg_restore} --section=pre-data --dbname=\"$DB\" \"$ARCHIVE\"\n",
            pg_restore = cfg.pg_restore_bin,
        ));
        if !spec.schema_only {
            s.push_str(&format!(
                "phase $AS_PG {pg_restore} --section=data --jobs={jobs} --dbname=\"$DB\" \"$ARCHIVE\"\n",
                pg_restore = cfg.pg_restore_bin,
                jobs = tuning.jobs,
            ));
        }
        s.push_str(&format!(
            "phase $AS_PG {pg_restore} --section=post-data --jobs={jobs} --dbname=\"$DB\" \"$ARCHIVE\"\n\
             rm -f \"$ARCHIVE\"\n",
            pg_restore = cfg.pg_restore_bin,
            jobs = tuning.jobs,
        ));

        // Hand the instance over to its service unit and snapshot the
        // dataset for branch cloning.
        s.push_str(&format!(
            "must $AS_PG {pg_ctl} --pgdata=\"$PGDATA\" --mode=fast --wait stop\n\
             must tee \"{unit_path}\" > /dev/null <<UNIT\n\
             [Unit]\n\
             Description=pgbranch instance {name}\n\
             After=network.target\n\
             \n\
             [Service]\n\
             Type=forking\n\
             User=postgres\n\
             ExecStart={pg_ctl} --pgdata={pgdata} --wait start\n\
             ExecStop={pg_ctl} --pgdata={pgdata} --mode=fast stop\n\
             \n\
             [Install]\n\
             WantedBy=multi-user.target\n\
             UNIT\n\
             must {systemctl} daemon-reload\n\
             must {systemctl} enable --now \"{unit}\"\n\
             must {zfs} snapshot \"$DATASET@{snap}\"\n",
            unit_path = unit_path.display(),
            name = spec.name,
            pg_ctl = cfg.pg_ctl_bin,
            pgdata = pgdata.display(),
            systemctl = cfg.systemctl_bin,
            unit = unit,
            zfs = cfg.zfs_bin,
            snap = READY_SNAPSHOT,
        ));

        s.push_str(&script_epilogue());
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{FAILURE_SENTINEL, SUCCESS_SENTINEL};
    use std::path::PathBuf;

    fn provider() -> LogicalProvider {
        LogicalProvider::new(
            Arc::new(Config::default()),
            Some("postgresql://app@db.internal/app".to_string()),
        )
    }

    fn spec(schema_only: bool) -> RestoreSpec {
        RestoreSpec {
            name: "restore_20250101120000".to_string(),
            port: 50001,
            schema_only,
            dataset: "tank/pgbranch/restore_20250101120000".to_string(),
            mountpoint: PathBuf::from("/var/lib/pgbranch/data/restore_20250101120000"),
        }
    }

    #[test]
    fn validate_requires_source_dsn() {
        let p = LogicalProvider::new(Arc::new(Config::default()), None);
        assert!(p.validate().is_err());
        assert!(provider().validate().is_ok());
    }

    #[test]
    fn script_runs_three_phases_in_order() {
        let tuning = RestoreTuning {
            jobs: 4,
            maintenance_work_mem_mb: 1024,
        };
        let script = provider().render_script(&spec(false), &tuning);

        let pre = script.find("--section=pre-data").unwrap();
        let data = script.find("--section=data").unwrap();
        let post = script.find("--section=post-data").unwrap();
        assert!(pre < data && data < post, "phases out of order");
        assert!(script.contains("--section=data --jobs=4"));
        assert!(script.contains("--section=post-data --jobs=4"));
    }

    #[test]
    fn schema_only_skips_the_data_phase() {
        let tuning = RestoreTuning {
            jobs: 2,
            maintenance_work_mem_mb: 256,
        };
        let script = provider().render_script(&spec(true), &tuning);
        assert!(script.contains("--schema-only"));
        assert!(!script.contains("--section=data "));
        assert!(script.contains("--section=pre-data"));
        assert!(script.contains("--section=post-data"));
    }

    #[test]
    fn script_follows_the_sentinel_protocol() {
        let tuning = RestoreTuning {
            jobs: 2,
            maintenance_work_mem_mb: 256,
        };
        let script = provider().render_script(&spec(false), &tuning);

        assert!(script.contains(&format!("echo \"{SUCCESS_SENTINEL}\"")));
        assert!(script.contains(&format!("echo \"{FAILURE_SENTINEL}\"")));
        // Sentinel, then sync, then the script removes its own PID file.
        let sentinel = script.rfind(SUCCESS_SENTINEL).unwrap();
        let tail = &script[sentinel..];
        let sync_pos = tail.find("\nsync").unwrap();
        let rm_pos = tail.find("rm -f \"$PID_FILE\"").unwrap();
        assert!(sync_pos < rm_pos);
    }

    #[test]
    fn failure_path_rolls_back_the_dataset() {
        let tuning = RestoreTuning {
            jobs: 2,
            maintenance_work_mem_mb: 256,
        };
        let script = provider().render_script(&spec(false), &tuning);
        assert!(script.contains("rolling back partial restore"));
        assert!(script.contains("destroy -r"));
    }
}
