//! Port allocation.
//!
//! Restore ports come from a high ephemeral range and are scanned
//! sequentially; a port is available iff nothing listens on it. The scan is
//! racy but self-correcting: a collision surfaces as a provider start
//! failure and forces a retry.
//!
//! Branch ports come from a separate firewall-reserved range. The firewall
//! doubles as a cross-request lock: a candidate must be unreserved, and is
//! reserved immediately on selection. The scan-then-reserve critical
//! section is serialized with a local file lock.

use std::fs::{File, OpenOptions};
use std::net::TcpListener;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info};

use crate::error::BranchError;
use crate::resource::cmd::AdminRunner;

/// Poll interval while waiting for the branch-port lock.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Max jitter added to each lock poll.
const LOCK_POLL_JITTER_MS: u64 = 50;
/// Bounded wait for the branch-port lock.
const LOCK_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Fixed administrative port for each supported source major version.
pub fn admin_port_for_version(major: u32) -> Result<u16, BranchError> {
    match major {
        14 => Ok(5414),
        15 => Ok(5415),
        16 => Ok(5416),
        17 => Ok(5417),
        other => Err(BranchError::Validation(format!(
            "unsupported source major version {other} (supported: 14-17)"
        ))),
    }
}

/// True iff nothing listens on the port (bind probe on the wildcard
/// address).
pub fn port_is_free(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}

/// Sequentially scans `[start, end]` and returns the first free port.
/// Fails explicitly when the range is exhausted; never wraps around.
pub fn find_free_port(start: u16, end: u16) -> Result<u16, BranchError> {
    for port in start..=end {
        if port_is_free(port) {
            return Ok(port);
        }
    }
    Err(BranchError::PortsExhausted { start, end })
}

/// RAII guard over `flock(LOCK_EX)`; the OS releases the lock when the
/// descriptor closes.
#[derive(Debug)]
pub struct FileLockGuard {
    _lock_file: File,
}

/// Acquires an exclusive lock on `path` with non-blocking attempts,
/// jittered polling and a bounded total wait.
pub async fn acquire_file_lock(path: &Path) -> Result<FileLockGuard, BranchError> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;
    let fd = file.as_raw_fd();

    let deadline = tokio::time::Instant::now() + LOCK_ACQUIRE_TIMEOUT;
    loop {
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            return Ok(FileLockGuard { _lock_file: file });
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(BranchError::PortLockTimeout);
        }
        let jitter = rand::rng().random_range(0..LOCK_POLL_JITTER_MS);
        tokio::time::sleep(LOCK_POLL_INTERVAL + Duration::from_millis(jitter)).await;
    }
}

/// Allocates branch ports under the file lock, reserving each selection in
/// the host firewall before the lock is released.
#[derive(Debug, Clone)]
pub struct BranchPortAllocator {
    start: u16,
    end: u16,
    lock_path: PathBuf,
    ufw_bin: String,
    admin: AdminRunner,
}

impl BranchPortAllocator {
    pub fn new(
        start: u16,
        end: u16,
        run_dir: &Path,
        ufw_bin: &str,
        admin: AdminRunner,
    ) -> Self {
        Self {
            start,
            end,
            lock_path: run_dir.join("branch_ports.lock"),
            ufw_bin: ufw_bin.to_string(),
            admin,
        }
    }

    /// Scans for a port that is both unlistened and unreserved, then
    /// reserves it before returning. The whole scan-then-reserve step runs
    /// under the file lock.
    pub async fn allocate(&self) -> Result<u16, BranchError> {
        let _guard = acquire_file_lock(&self.lock_path).await?;
        let reserved = self.reserved_ports().await?;

        for port in self.start..=self.end {
            if !port_is_free(port) {
                continue;
            }
            if reserved.contains(&port) {
                continue;
            }
            self.reserve(port).await?;
            info!(port, "branch port allocated and reserved");
            return Ok(port);
        }
        Err(BranchError::PortsExhausted {
            start: self.start,
            end: self.end,
        })
    }

    /// Reserves a specific port (forced-port path used by refresh). Fails
    /// when the port is taken by a listener; an existing firewall
    /// reservation is accepted as ours.
    pub async fn reserve_exact(&self, port: u16) -> Result<(), BranchError> {
        if port < self.start || port > self.end {
            return Err(BranchError::Validation(format!(
                "port {port} outside branch range {}-{}",
                self.start, self.end
            )));
        }
        let _guard = acquire_file_lock(&self.lock_path).await?;
        if !port_is_free(port) {
            return Err(BranchError::Validation(format!(
                "port {port} already has a listener"
            )));
        }
        if !self.reserved_ports().await?.contains(&port) {
            self.reserve(port).await?;
        }
        Ok(())
    }

    /// Drops the firewall reservation. Best-effort; called on branch delete.
    pub async fn release(&self, port: u16) {
        let rule = format!("{port}/tcp");
        self.admin
            .run_best_effort(&self.ufw_bin, &["delete", "allow", &rule])
            .await;
        debug!(port, "branch port reservation released");
    }

    async fn reserve(&self, port: u16) -> Result<(), BranchError> {
        let rule = format!("{port}/tcp");
        self.admin
            .run_retry(&self.ufw_bin, &["allow", &rule])
            .await?;
        Ok(())
    }

    /// Ports currently reserved in the firewall, parsed from `ufw status`.
    async fn reserved_ports(&self) -> Result<Vec<u16>, BranchError> {
        let out = self.admin.run_retry(&self.ufw_bin, &["status"]).await?;
        let mut ports = Vec::new();
        for line in out.stdout.lines() {
            let Some(first) = line.split_whitespace().next() else {
                continue;
            };
            if let Some(spec) = first.strip_suffix("/tcp")
                && let Ok(port) = spec.parse::<u16>()
            {
                ports.push(port);
            }
        }
        Ok(ports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_port_map_is_fixed() {
        assert_eq!(admin_port_for_version(14).unwrap(), 5414);
        assert_eq!(admin_port_for_version(17).unwrap(), 5417);
        assert!(admin_port_for_version(13).is_err());
        assert!(admin_port_for_version(18).is_err());
    }

    #[test]
    fn scan_skips_taken_ports_and_fails_when_exhausted() {
        // Anchor the range at test-local listeners so the scan is
        // deterministic regardless of what else runs on the host.
        let base = 47000 + (std::process::id() % 500) as u16 * 3;
        let _a = TcpListener::bind(("0.0.0.0", base)).unwrap();
        let _b = TcpListener::bind(("0.0.0.0", base + 1)).unwrap();

        assert_eq!(find_free_port(base, base + 2).unwrap(), base + 2);

        let _c = TcpListener::bind(("0.0.0.0", base + 2)).unwrap();
        match find_free_port(base, base + 2) {
            Err(BranchError::PortsExhausted { start, end }) => {
                assert_eq!((start, end), (base, base + 2));
            }
            other => panic!("expected PortsExhausted, got {other:?}"),
        }
    }
}
