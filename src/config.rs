use figment::{
    Figment,
    providers::{Env, Serialized},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Application configuration managed by Figment.
///
/// Loaded once at startup and injected into component constructors as
/// `Arc<Config>`; components never read process-wide state themselves, so
/// tests can vary every knob per case.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Database URL for SQLite.
    /// Env: `DATABASE_URL`. Default: `sqlite://pgbranch.db`.
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Log level for tracing subscriber initialization (e.g., "error", "warn", "info", "debug", "trace").
    /// Env: `LOGLEVEL`. Default: `info`.
    #[serde(default = "default_loglevel")]
    pub loglevel: String,

    /// Directory for PID files, the branch-port lock file and transient
    /// restore-tool configuration. Expected to live on tmpfs.
    /// Env: `RUN_DIR`. Default: `/run/pgbranch`.
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,

    /// Directory for background-operation logs.
    /// Env: `LOG_DIR`. Default: `/var/log/pgbranch`.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Directory where generated restore scripts are written.
    /// Env: `SCRIPT_DIR`. Default: `/var/lib/pgbranch/scripts`.
    #[serde(default = "default_script_dir")]
    pub script_dir: PathBuf,

    /// ZFS dataset under which restore and branch datasets are created,
    /// e.g. `tank/pgbranch`.
    /// Env: `DATA_ROOT`. Default: `tank/pgbranch`.
    #[serde(default = "default_data_root")]
    pub data_root: String,

    /// Filesystem mountpoint root of `data_root`.
    /// Env: `MOUNT_ROOT`. Default: `/var/lib/pgbranch/data`.
    #[serde(default = "default_mount_root")]
    pub mount_root: PathBuf,

    /// Directory holding the per-instance systemd unit files.
    /// Env: `UNIT_DIR`. Default: `/etc/systemd/system`.
    #[serde(default = "default_unit_dir")]
    pub unit_dir: PathBuf,

    /// Clone-and-start helper invoked by the branch service.
    /// Env: `CLONE_SCRIPT`. Default: `/usr/local/lib/pgbranch/clone_branch.sh`.
    #[serde(default = "default_clone_script")]
    pub clone_script: PathBuf,

    /// First port of the restore allocation range.
    /// Env: `RESTORE_PORT_START`. Default: `50000`.
    #[serde(default = "default_restore_port_start")]
    pub restore_port_start: u16,

    /// Last port (inclusive) of the restore allocation range.
    /// Env: `RESTORE_PORT_END`. Default: `59999`.
    #[serde(default = "default_restore_port_end")]
    pub restore_port_end: u16,

    /// First port of the firewall-reserved branch range.
    /// Env: `BRANCH_PORT_START`. Default: `15432`.
    #[serde(default = "default_branch_port_start")]
    pub branch_port_start: u16,

    /// Last port (inclusive) of the firewall-reserved branch range.
    /// Env: `BRANCH_PORT_END`. Default: `16432`.
    #[serde(default = "default_branch_port_end")]
    pub branch_port_end: u16,

    /// Major version of the source PostgreSQL cluster (14..=17).
    /// Env: `SOURCE_VERSION`. Default: `17`.
    #[serde(default = "default_source_version")]
    pub source_version: u32,

    /// Max concurrent task handlers in the worker pool.
    /// Env: `WORKER_CONCURRENCY`. Default: `4`.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Seconds between completion polls of a running restore.
    /// Env: `POLL_INTERVAL_SECS`. Default: `10`.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Poll attempts before a restore is declared lost (~12h at 10s).
    /// Env: `POLL_MAX_ATTEMPTS`. Default: `4320`.
    #[serde(default = "default_poll_max_attempts")]
    pub poll_max_attempts: u32,

    /// Timeout applied to short-lived administrative commands. Never applied
    /// to the long-running restore operation itself.
    /// Env: `ADMIN_CMD_TIMEOUT_SECS`. Default: `60`.
    #[serde(default = "default_admin_cmd_timeout_secs")]
    pub admin_cmd_timeout_secs: u64,

    /// Minimum free disk on the mount root before a logical restore may
    /// start, in GiB.
    /// Env: `FREE_DISK_FLOOR_GIB`. Default: `10`.
    #[serde(default = "default_free_disk_floor_gib")]
    pub free_disk_floor_gib: u64,

    /// Database name exposed by materialized restores.
    /// Env: `RESTORE_DATABASE`. Default: `postgres`.
    #[serde(default = "default_restore_database")]
    pub restore_database: String,

    /// Key used to mint scoped backup-repository tokens (required, non-empty).
    /// Env: `SIGNING_KEY`. Must be provided.
    #[serde(default)]
    pub signing_key: String,

    /// Allow-listed `key=value` server settings applied to restored clusters.
    /// Env: `PG_TUNABLES`. Default: a small conservative set.
    #[serde(default = "default_pg_tunables")]
    pub pg_tunables: Vec<String>,

    /// External binaries, overridable for tests and exotic hosts.
    #[serde(default = "default_psql_bin")]
    pub psql_bin: String,
    #[serde(default = "default_pg_dump_bin")]
    pub pg_dump_bin: String,
    #[serde(default = "default_pg_restore_bin")]
    pub pg_restore_bin: String,
    #[serde(default = "default_initdb_bin")]
    pub initdb_bin: String,
    #[serde(default = "default_pg_ctl_bin")]
    pub pg_ctl_bin: String,
    #[serde(default = "default_pgbackrest_bin")]
    pub pgbackrest_bin: String,
    #[serde(default = "default_zfs_bin")]
    pub zfs_bin: String,
    #[serde(default = "default_systemctl_bin")]
    pub systemctl_bin: String,
    #[serde(default = "default_ufw_bin")]
    pub ufw_bin: String,
    #[serde(default = "default_fuser_bin")]
    pub fuser_bin: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            loglevel: default_loglevel(),
            run_dir: default_run_dir(),
            log_dir: default_log_dir(),
            script_dir: default_script_dir(),
            data_root: default_data_root(),
            mount_root: default_mount_root(),
            unit_dir: default_unit_dir(),
            clone_script: default_clone_script(),
            restore_port_start: default_restore_port_start(),
            restore_port_end: default_restore_port_end(),
            branch_port_start: default_branch_port_start(),
            branch_port_end: default_branch_port_end(),
            source_version: default_source_version(),
            worker_concurrency: default_worker_concurrency(),
            poll_interval_secs: default_poll_interval_secs(),
            poll_max_attempts: default_poll_max_attempts(),
            admin_cmd_timeout_secs: default_admin_cmd_timeout_secs(),
            free_disk_floor_gib: default_free_disk_floor_gib(),
            restore_database: default_restore_database(),
            signing_key: String::new(),
            pg_tunables: default_pg_tunables(),
            psql_bin: default_psql_bin(),
            pg_dump_bin: default_pg_dump_bin(),
            pg_restore_bin: default_pg_restore_bin(),
            initdb_bin: default_initdb_bin(),
            pg_ctl_bin: default_pg_ctl_bin(),
            pgbackrest_bin: default_pgbackrest_bin(),
            zfs_bin: default_zfs_bin(),
            systemctl_bin: default_systemctl_bin(),
            ufw_bin: default_ufw_bin(),
            fuser_bin: default_fuser_bin(),
        }
    }
}

impl Config {
    /// Builds a Figment that merges defaults and environment variables.
    /// Uses raw env mapping, so field names map to env vars in UPPER_SNAKE_CASE.
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Env::raw())
    }

    /// Loads configuration from the environment (with defaults) and validates required fields.
    pub fn from_env() -> Self {
        let cfg: Self = Self::figment()
            .extract()
            .expect("failed to extract configuration via Figment");
        if cfg.signing_key.trim().is_empty() {
            panic!("SIGNING_KEY must be set and non-empty");
        }
        cfg
    }
}

fn default_database_url() -> String {
    "sqlite://pgbranch.db".to_string()
}

fn default_loglevel() -> String {
    "info".to_string()
}

fn default_run_dir() -> PathBuf {
    PathBuf::from("/run/pgbranch")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/pgbranch")
}

fn default_script_dir() -> PathBuf {
    PathBuf::from("/var/lib/pgbranch/scripts")
}

fn default_data_root() -> String {
    "tank/pgbranch".to_string()
}

fn default_mount_root() -> PathBuf {
    PathBuf::from("/var/lib/pgbranch/data")
}

fn default_unit_dir() -> PathBuf {
    PathBuf::from("/etc/systemd/system")
}

fn default_clone_script() -> PathBuf {
    PathBuf::from("/usr/local/lib/pgbranch/clone_branch.sh")
}

fn default_restore_port_start() -> u16 {
    50000
}

fn default_restore_port_end() -> u16 {
    59999
}

fn default_branch_port_start() -> u16 {
    15432
}

fn default_branch_port_end() -> u16 {
    16432
}

fn default_source_version() -> u32 {
    17
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_poll_max_attempts() -> u32 {
    4320
}

fn default_admin_cmd_timeout_secs() -> u64 {
    60
}

fn default_free_disk_floor_gib() -> u64 {
    10
}

fn default_pg_tunables() -> Vec<String> {
    vec![
        "fsync=off".to_string(),
        "full_page_writes=off".to_string(),
        "autovacuum=off".to_string(),
        "checkpoint_timeout=30min".to_string(),
    ]
}

fn default_restore_database() -> String {
    "postgres".to_string()
}

fn default_psql_bin() -> String {
    "psql".to_string()
}

fn default_pg_dump_bin() -> String {
    "pg_dump".to_string()
}

fn default_pg_restore_bin() -> String {
    "pg_restore".to_string()
}

fn default_initdb_bin() -> String {
    "initdb".to_string()
}

fn default_pg_ctl_bin() -> String {
    "pg_ctl".to_string()
}

fn default_pgbackrest_bin() -> String {
    "pgbackrest".to_string()
}

fn default_zfs_bin() -> String {
    "zfs".to_string()
}

fn default_systemctl_bin() -> String {
    "systemctl".to_string()
}

fn default_ufw_bin() -> String {
    "ufw".to_string()
}

fn default_fuser_bin() -> String {
    "fuser".to_string()
}
