//! Shared scaffolding for integration tests: a temp directory tree, a temp
//! SQLite database and stub host binaries so no test touches zfs, systemd
//! or a real cluster.

use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use pgbranch::config::Config;

pub struct TestEnv {
    pub cfg: Arc<Config>,
    pub dir: PathBuf,
    pub database_url: String,
}

/// Writes an executable stub into `bin_dir` and returns its path as a
/// string.
pub fn write_stub(bin_dir: &Path, name: &str, body: &str) -> String {
    let path = bin_dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

/// Builds an isolated environment: every path under one temp directory,
/// every external binary a harmless stub.
pub fn test_env(tag: &str) -> TestEnv {
    let mut hasher = DefaultHasher::new();
    SystemTime::now().hash(&mut hasher);
    tag.hash(&mut hasher);
    let dir = std::env::temp_dir().join(format!("pgbranch_it_{}_{}", tag, hasher.finish()));

    let run_dir = dir.join("run");
    let log_dir = dir.join("log");
    let script_dir = dir.join("scripts");
    let unit_dir = dir.join("units");
    let mount_root = dir.join("mnt");
    let bin_dir = dir.join("bin");
    for d in [&run_dir, &log_dir, &script_dir, &unit_dir, &mount_root, &bin_dir] {
        fs::create_dir_all(d).unwrap();
    }

    let ok = |name: &str| write_stub(&bin_dir, name, "exit 0");
    let zfs_bin = ok("zfs");
    let systemctl_bin = ok("systemctl");
    let fuser_bin = ok("fuser");
    let psql_bin = write_stub(&bin_dir, "psql", "echo f\nexit 0");
    let ufw_bin = write_stub(&bin_dir, "ufw", "exit 0");

    // Clone helper announcing the port it was asked to bind.
    let clone_script = write_stub(
        &bin_dir,
        "clone_branch.sh",
        "while [ $# -gt 0 ]; do\n\
         \x20 case \"$1\" in\n\
         \x20   --port) PORT=$2; shift 2;;\n\
         \x20   *) shift;;\n\
         \x20 esac\n\
         done\n\
         echo \"PORT: $PORT\"",
    );

    let db_path = dir.join("state.sqlite");
    let database_url = format!("sqlite:{}", db_path.to_str().unwrap());

    let cfg = Config {
        database_url: database_url.clone(),
        run_dir,
        log_dir,
        script_dir,
        unit_dir,
        mount_root,
        data_root: "testpool/pgbranch".to_string(),
        clone_script: PathBuf::from(clone_script),
        signing_key: "integration-test-key".to_string(),
        admin_cmd_timeout_secs: 10,
        poll_interval_secs: 1,
        poll_max_attempts: 5,
        zfs_bin,
        systemctl_bin,
        fuser_bin,
        psql_bin,
        ufw_bin,
        ..Config::default()
    };

    TestEnv {
        cfg: Arc::new(cfg),
        dir,
        database_url,
    }
}

pub fn remove_env(env: &TestEnv) {
    let _ = fs::remove_dir_all(&env.dir);
}
