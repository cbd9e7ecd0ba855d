//! Parallelism and memory tuning for logical restores, derived from live
//! host metrics.

use std::path::Path;

use sysinfo::{Disks, System};

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

/// Knobs fed into the generated restore script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreTuning {
    /// Worker count for the parallel data and index phases.
    pub jobs: usize,
    /// `maintenance_work_mem` in MiB.
    pub maintenance_work_mem_mb: u64,
}

/// Fixed heuristic over core count and total memory.
///
/// Workers scale with cores but leave one for the server itself; hosts
/// under 8 GiB get half the workers since each pg_restore worker holds a
/// sort buffer.
pub fn tuning_from_metrics(cores: usize, total_memory_bytes: u64) -> RestoreTuning {
    let mut jobs = cores.saturating_sub(1).clamp(1, 8);
    if total_memory_bytes < 8 * GIB {
        jobs = (jobs / 2).max(1);
    }

    let mwm = (total_memory_bytes / 8).clamp(64 * MIB, 2 * GIB);

    RestoreTuning {
        jobs,
        maintenance_work_mem_mb: mwm / MIB,
    }
}

/// Samples the live host.
pub fn compute_tuning() -> RestoreTuning {
    let mut sys = System::new_all();
    sys.refresh_all();
    tuning_from_metrics(sys.cpus().len(), sys.total_memory())
}

/// Free bytes on the filesystem holding `path` (longest mount-point
/// prefix wins).
pub fn free_disk_bytes(path: &Path) -> u64 {
    let disks = Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map_or(0, sysinfo::Disk::available_space)
}
