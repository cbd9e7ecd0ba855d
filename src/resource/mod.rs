pub mod cleanup;
pub mod cmd;
pub mod ports;

pub use cleanup::CleanupManager;
pub use cmd::{AdminRunner, CommandOutput};
pub use ports::{
    BranchPortAllocator, FileLockGuard, acquire_file_lock, admin_port_for_version,
    find_free_port, port_is_free,
};
