//! Restore from a remote incremental backup repository.
//!
//! Looks up the configured stanza, mints a scoped repository token, writes
//! the restore-tool configuration to transient storage, and restores in
//! "immediate, promote" mode so the clone becomes its own independent
//! primary instead of continuing WAL replay. Never supports schema-only.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::info;

use crate::config::Config;
use crate::error::BranchError;
use crate::resource::cmd::AdminRunner;
use crate::restore::READY_SNAPSHOT;
use crate::restore::provider::{RestoreSpec, launch_detached, script_epilogue, script_preamble};

type HmacSha256 = Hmac<Sha256>;

/// Scoped-token validity window, seconds.
const TOKEN_TTL_SECS: i64 = 900;

pub struct SnapshotProvider {
    cfg: Arc<Config>,
    stanza: Option<String>,
    endpoint: Option<String>,
    api_key: Option<String>,
    admin: AdminRunner,
}

impl SnapshotProvider {
    pub fn new(
        cfg: Arc<Config>,
        stanza: Option<String>,
        endpoint: Option<String>,
        api_key: Option<String>,
        admin: AdminRunner,
    ) -> Self {
        Self {
            cfg,
            stanza,
            endpoint,
            api_key,
            admin,
        }
    }

    pub fn validate(&self) -> Result<(), BranchError> {
        for (field, value) in [
            ("repo_stanza", &self.stanza),
            ("repo_endpoint", &self.endpoint),
            ("repo_api_key", &self.api_key),
        ] {
            match value.as_deref() {
                Some(v) if !v.trim().is_empty() => {}
                _ => {
                    return Err(BranchError::Config(format!(
                        "snapshot restore requires `{field}`"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Mints a time-scoped repository secret: HMAC-SHA256 over
    /// `stanza:expiry` with the injected signing key.
    pub fn mint_token(&self, stanza: &str, expiry_unix: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(self.cfg.signing_key.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(format!("{stanza}:{expiry_unix}").as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Transient restore-tool configuration path. Deliberately on tmpfs: a
    /// later filesystem clone would overwrite a durable copy.
    fn transient_conf_path(&self, name: &str) -> PathBuf {
        self.cfg.run_dir.join(format!("{name}.backrest.conf"))
    }

    pub async fn start(&self, spec: &RestoreSpec) -> Result<(), BranchError> {
        self.validate()?;
        let stanza = self.stanza.as_deref().unwrap_or_default();
        let endpoint = self.endpoint.as_deref().unwrap_or_default();
        let api_key = self.api_key.as_deref().unwrap_or_default();

        let expiry = Utc::now().timestamp() + TOKEN_TTL_SECS;
        let token = self.mint_token(stanza, expiry);

        let conf_path = self.transient_conf_path(&spec.name);
        let conf = format!(
            "[global]\n\
             repo1-type=s3\n\
             repo1-path=/\n\
             repo1-s3-endpoint={endpoint}\n\
             repo1-s3-bucket=backups\n\
             repo1-s3-region=auto\n\
             repo1-s3-key={api_key}\n\
             repo1-s3-key-secret={token}\n\
             \n\
             [{stanza}]\n\
             pg1-path={pgdata}\n",
            pgdata = spec.mountpoint.join("pgdata").display(),
        );
        tokio::fs::create_dir_all(&self.cfg.run_dir).await?;
        tokio::fs::write(&conf_path, conf).await?;
        tokio::fs::set_permissions(&conf_path, std::fs::Permissions::from_mode(0o600)).await?;

        // Repository and stanza lookup is a bounded administrative command;
        // a missing stanza fails here, before any dataset exists.
        let conf_arg = format!("--config={}", conf_path.display());
        let stanza_arg = format!("--stanza={stanza}");
        self.admin
            .run(&self.cfg.pgbackrest_bin, &[&conf_arg, &stanza_arg, "info"])
            .await?;
        info!(stanza, "backup repository stanza resolved");

        let script = self.render_script(spec, &conf_path);
        launch_detached(&self.cfg.script_dir, &spec.name, &script).await
    }

    /// Restore script. On failure the dataset and the transient credential
    /// file are left intact for debugging; only the logical strategy rolls
    /// back.
    pub fn render_script(&self, spec: &RestoreSpec, conf_path: &std::path::Path) -> String {
        let cfg = &self.cfg;
        let log = cfg.log_dir.join(format!("{}.log", spec.name));
        let pid = cfg.run_dir.join(format!("{}.pid", spec.name));
        let pgdata = spec.mountpoint.join("pgdata");
        let unit = format!("pgbranch-{}.service", spec.name);
        let unit_path = cfg.unit_dir.join(&unit);
        let stanza = self.stanza.as_deref().unwrap_or_default();

        let mut s = script_preamble(&log, &pid, "");

        s.push_str(&format!(
            "\nNAME=\"{name}\"\n\
             DATASET=\"{dataset}\"\n\
             PGDATA=\"{pgdata}\"\n\
             CONF=\"{conf}\"\n\
             AS_PG=\"runuser -u postgres --\"\n\
             \n\
             echo \"snapshot restore $NAME starting (stanza={stanza})\"\n\
             must {zfs} create \"$DATASET\"\n\
             must mkdir -p \"$PGDATA\"\n\
             must chown -R postgres:postgres \"{mountpoint}\"\n\
             must $AS_PG {pgbackrest} --config=\"$CONF\" --stanza={stanza} --type=immediate --target-action=promote restore\n",
            name = spec.name,
            dataset = spec.dataset,
            pgdata = pgdata.display(),
            conf = conf_path.display(),
            stanza = stanza,
            zfs = cfg.zfs_bin,
            mountpoint = spec.mountpoint.display(),
            pgbackrest = cfg.pgbackrest_bin,
        ));

        // Port and tunables, then start and wait for the promote to finish.
        s.push_str(&format!(
            "{{\n\
             \x20   echo \"port = {port}\"\n\
             \x20   echo \"listen_addresses = '*'\"\n",
            port = spec.port,
        ));
        for tunable in &cfg.pg_tunables {
            let (key, value) = tunable.split_once('=').unwrap_or((tunable.as_str(), "on"));
            s.push_str(&format!("\x20   echo \"{key} = {value}\"\n"));
        }
        s.push_str("} >> \"$PGDATA/postgresql.auto.conf\"\n");

        s.push_str(&format!(
            "must $AS_PG {pg_ctl} --pgdata=\"$PGDATA\" --wait start\n\
             for _ in $(seq 1 300); do\n\
             \x20   in_recovery=$($AS_PG {psql} -p {port} -d {database} -At -c 'SELECT pg_is_in_recovery()') || in_recovery=t\n\
             \x20   [ \"$in_recovery\" = \"f\" ] && break\n\
             \x20   sleep 2\n\
             done\n\
             [ \"$in_recovery\" = \"f\" ] || fail\n",
            pg_ctl = cfg.pg_ctl_bin,
            psql = cfg.psql_bin,
            port = spec.port,
            database = cfg.restore_database,
        ));

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

    fn provider() -> SnapshotProvider {
        let cfg = Config {
            signing_key: "test-signing-key".to_string(),
            ..Config::default()
        };
        SnapshotProvider::new(
            Arc::new(cfg),
            Some("prod-main".to_string()),
            Some("backups.internal:9000".to_string()),
            Some("AKIDEXAMPLE".to_string()),
            AdminRunner::new(5),
        )
    }

    #[test]
    fn validate_requires_all_repo_fields() {
        let cfg = Arc::new(Config::default());
        let missing = SnapshotProvider::new(
            cfg,
            Some("prod-main".to_string()),
            None,
            Some("AKIDEXAMPLE".to_string()),
            AdminRunner::new(5),
        );
        assert!(missing.validate().is_err());
        assert!(provider().validate().is_ok());
    }

    #[test]
    fn minted_tokens_are_scoped_and_deterministic() {
        let p = provider();
        let a = p.mint_token("prod-main", 1_700_000_000);
        let b = p.mint_token("prod-main", 1_700_000_000);
        assert_eq!(a, b);
        assert_ne!(a, p.mint_token("prod-main", 1_700_000_900));
        assert_ne!(a, p.mint_token("other", 1_700_000_000));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn script_restores_in_immediate_promote_mode() {
        let p = provider();
        let spec = RestoreSpec {
            name: "restore_20250101120000".to_string(),
            port: 50002,
            schema_only: false,
            dataset: "tank/pgbranch/restore_20250101120000".to_string(),
            mountpoint: "/var/lib/pgbranch/data/restore_20250101120000".into(),
        };
        let script = p.render_script(&spec, &p.transient_conf_path(&spec.name));
        assert!(script.contains("--type=immediate --target-action=promote restore"));
        assert!(script.contains("pg_is_in_recovery()"));
        // No rollback on failure: dataset stays for debugging.
        assert!(!script.contains("destroy -r"));
    }
}
