use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One materialized copy of the source database; the unit branches are
/// cloned from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct Restore {
    pub id: i64,
    /// Timestamp-derived, unique (`restore_YYYYMMDDHHMMSS`).
    pub name: String,
    pub schema_only: bool,
    pub schema_ready: bool,
    pub data_ready: bool,
    /// Set exactly once, after the backing process succeeds and
    /// anonymization (if any rules exist) has been applied.
    pub ready_at: Option<DateTime<Utc>>,
    pub port: u16,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A restore together with the number of branches it currently owns.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoreWithBranches {
    pub restore: Restore,
    pub branch_count: i64,
}

/// An independently running, disposable clone of a ready restore.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct Branch {
    pub id: i64,
    pub name: String,
    pub restore_id: i64,
    pub username: String,
    pub password: String,
    pub port: u16,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Process-wide configuration singleton (row id = 1).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct DbConfig {
    pub id: i64,
    /// Connection string of the source database (logical strategy input).
    pub source_dsn: Option<String>,
    /// Backup-repository stanza (snapshot strategy input). Snapshot wins
    /// whenever the repository fields are present.
    pub repo_stanza: Option<String>,
    pub repo_endpoint: Option<String>,
    pub repo_api_key: Option<String>,
    pub schema_only_default: bool,
    pub cron_expression: String,
    pub last_refresh_at: Option<DateTime<Utc>>,
    pub next_refresh_at: Option<DateTime<Utc>>,
    pub max_restores: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Declarative per-column anonymization rule. `kind` is one of
/// `text`, `integer`, `boolean`, `null` and governs SQL rendering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct AnonymizationRule {
    pub id: i64,
    pub table_name: String,
    pub column_name: String,
    pub template: String,
    pub kind: String,
    pub created_at: DateTime<Utc>,
}

/// A durable queue entry. `kind` is `restore_start` or `restore_wait`;
/// the payload is a single opaque restore identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct Task {
    pub id: String,
    pub kind: String,
    pub restore_id: i64,
    pub attempt: i64,
    pub scheduled_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Field set for inserting a new anonymization rule.
#[derive(Debug, Clone)]
pub struct RuleCreate {
    pub table_name: String,
    pub column_name: String,
    pub template: String,
    pub kind: String,
}

/// Patchable subset of the configuration singleton.
#[derive(Debug, Clone, Default)]
pub struct ConfigPatch {
    pub source_dsn: Option<Option<String>>,
    pub repo_stanza: Option<Option<String>>,
    pub repo_endpoint: Option<Option<String>>,
    pub repo_api_key: Option<Option<String>>,
    pub schema_only_default: Option<bool>,
    pub cron_expression: Option<String>,
    pub max_restores: Option<i64>,
}
