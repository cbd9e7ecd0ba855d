pub mod logical;
pub mod orchestrator;
pub mod provider;
pub mod retention;
pub mod snapshot;
pub mod tuning;

pub use orchestrator::{RestoreService, RestoreState};
pub use provider::{ProviderKind, RestoreProvider, RestoreSpec};

/// Name of the ZFS snapshot taken on a ready restore; branches clone it.
pub const READY_SNAPSHOT: &str = "ready";
