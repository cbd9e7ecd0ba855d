//! pgbranch: disposable PostgreSQL branches cloned from ZFS-backed
//! restores.
//!
//! The crate is the control plane only: it drives long-running external
//! restore processes to completion, allocates and reclaims host resources,
//! applies the anonymization pass, and enforces retention. The HTTP
//! surface, auth and dashboard live elsewhere.

pub mod anonymize;
pub mod branch;
pub mod config;
pub mod db;
pub mod error;
pub mod process;
pub mod queue;
pub mod resource;
pub mod restore;
pub mod scheduler;

pub use branch::BranchService;
pub use config::Config;
pub use error::{BranchError, IsRetryable};
pub use process::{ProcessMonitor, ProcessStatus};
pub use restore::{RestoreService, RestoreState};
pub use scheduler::RefreshScheduler;
