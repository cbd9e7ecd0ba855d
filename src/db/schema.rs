//! SQL DDL for initializing the database schema.
//! SQLite-first design; can be adapted for other RDBMS.

/// SQLite schema includes:
/// - `restores` table (one materialized copy of the source database per row)
/// - `branches` table (one running clone of a ready restore per row)
/// - `config` table (process-wide singleton, id = 1)
/// - `anonymization_rules` table (global (table, column, template) triples)
/// - `tasks` table (durable task queue drained by the worker pool)
pub const SQLITE_INIT: &str = r#"
-- ---------------------------------------------------------------------------
-- Restores
-- ---------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS restores (
    id INTEGER PRIMARY KEY NOT NULL,
    name TEXT NOT NULL UNIQUE,
    schema_only INTEGER NOT NULL DEFAULT 0,
    schema_ready INTEGER NOT NULL DEFAULT 0,
    data_ready INTEGER NOT NULL DEFAULT 0,
    ready_at TEXT NULL, -- RFC3339, set exactly once
    port INTEGER NOT NULL,
    created_at TEXT NOT NULL, -- RFC3339
    updated_at TEXT NOT NULL -- RFC3339
);

CREATE INDEX IF NOT EXISTS idx_restores_ready_at ON restores(ready_at);

-- ---------------------------------------------------------------------------
-- Branches
-- ---------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS branches (
    id INTEGER PRIMARY KEY NOT NULL,
    name TEXT NOT NULL UNIQUE,
    restore_id INTEGER NOT NULL REFERENCES restores(id),
    username TEXT NOT NULL,
    password TEXT NOT NULL,
    port INTEGER NOT NULL,
    created_at TEXT NOT NULL, -- RFC3339
    updated_at TEXT NOT NULL -- RFC3339
);

CREATE INDEX IF NOT EXISTS idx_branches_restore_id ON branches(restore_id);

-- ---------------------------------------------------------------------------
-- Configuration singleton (id = 1)
-- ---------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS config (
    id INTEGER PRIMARY KEY NOT NULL CHECK (id = 1),
    source_dsn TEXT NULL,
    repo_stanza TEXT NULL,
    repo_endpoint TEXT NULL,
    repo_api_key TEXT NULL,
    schema_only_default INTEGER NOT NULL DEFAULT 0,
    cron_expression TEXT NOT NULL DEFAULT '0 0 2 * * * *',
    last_refresh_at TEXT NULL, -- RFC3339
    next_refresh_at TEXT NULL, -- RFC3339
    max_restores INTEGER NOT NULL DEFAULT 2,
    created_at TEXT NOT NULL, -- RFC3339
    updated_at TEXT NOT NULL -- RFC3339
);

-- ---------------------------------------------------------------------------
-- Anonymization rules
-- ---------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS anonymization_rules (
    id INTEGER PRIMARY KEY NOT NULL,
    table_name TEXT NOT NULL,
    column_name TEXT NOT NULL,
    template TEXT NOT NULL,
    kind TEXT NOT NULL DEFAULT 'text',
    created_at TEXT NOT NULL, -- RFC3339
    UNIQUE(table_name, column_name)
);

-- ---------------------------------------------------------------------------
-- Durable task queue
-- ---------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY NOT NULL,
    kind TEXT NOT NULL,
    restore_id INTEGER NOT NULL,
    attempt INTEGER NOT NULL DEFAULT 0,
    scheduled_at TEXT NOT NULL, -- RFC3339
    claimed_at TEXT NULL, -- RFC3339, lease marker
    created_at TEXT NOT NULL -- RFC3339
);

CREATE INDEX IF NOT EXISTS idx_tasks_scheduled_at ON tasks(scheduled_at);
"#;
