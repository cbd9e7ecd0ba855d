pub mod actor;
pub mod models;
pub mod schema;

pub use actor::{DbActorMessage, DbHandle, spawn};
pub use models::{
    AnonymizationRule, Branch, ConfigPatch, DbConfig, Restore, RestoreWithBranches, RuleCreate,
    Task,
};
