use crate::db::models::{
    AnonymizationRule, Branch, ConfigPatch, DbConfig, Restore, RestoreWithBranches, RuleCreate,
    Task,
};
use crate::db::schema::SQLITE_INIT;
use crate::error::BranchError;
use chrono::{DateTime, Duration, Utc};
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::{collections::HashMap, str::FromStr};
use tracing::info;
use uuid::Uuid;

#[derive(Debug)]
pub enum DbActorMessage {
    /// Create a restore record and return the stored row.
    CreateRestore {
        name: String,
        schema_only: bool,
        port: u16,
        reply: RpcReplyPort<Result<Restore, BranchError>>,
    },

    /// Get a restore by id.
    GetRestore(i64, RpcReplyPort<Result<Restore, BranchError>>),

    /// List every restore, oldest first.
    ListRestores(RpcReplyPort<Result<Vec<Restore>, BranchError>>),

    /// List every restore together with its owned branch count.
    RestoresWithBranchCounts(RpcReplyPort<Result<Vec<RestoreWithBranches>, BranchError>>),

    /// Count restores.
    CountRestores(RpcReplyPort<Result<i64, BranchError>>),

    /// Most recently ready restore (by ready_at, descending).
    LatestReadyRestore(RpcReplyPort<Result<Option<Restore>, BranchError>>),

    /// Transactionally flip readiness flags and stamp ready_at (once).
    MarkRestoreReady {
        id: i64,
        ready_at: DateTime<Utc>,
        reply: RpcReplyPort<Result<Restore, BranchError>>,
    },

    /// Delete a restore; refuses while it owns branches.
    DeleteRestore(i64, RpcReplyPort<Result<(), BranchError>>),

    /// Create a branch record and return the stored row.
    CreateBranch {
        name: String,
        restore_id: i64,
        username: String,
        password: String,
        port: u16,
        reply: RpcReplyPort<Result<Branch, BranchError>>,
    },

    /// Get a branch by unique name.
    GetBranchByName(String, RpcReplyPort<Result<Option<Branch>, BranchError>>),

    /// List branches, optionally restricted to one restore.
    ListBranches(
        Option<i64>,
        RpcReplyPort<Result<Vec<Branch>, BranchError>>,
    ),

    /// Delete a branch by name.
    DeleteBranch(String, RpcReplyPort<Result<(), BranchError>>),

    /// Get the configuration singleton.
    GetConfig(RpcReplyPort<Result<DbConfig, BranchError>>),

    /// Patch the configuration singleton and return the stored row.
    PatchConfig(ConfigPatch, RpcReplyPort<Result<DbConfig, BranchError>>),

    /// Stamp last/next refresh after a completed restore.
    UpdateRefreshTimestamps {
        last: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
        reply: RpcReplyPort<Result<(), BranchError>>,
    },

    /// List all anonymization rules.
    ListRules(RpcReplyPort<Result<Vec<AnonymizationRule>, BranchError>>),

    /// Insert an anonymization rule.
    CreateRule(RuleCreate, RpcReplyPort<Result<i64, BranchError>>),

    /// Enqueue a task; returns its id.
    EnqueueTask {
        kind: String,
        restore_id: i64,
        attempt: i64,
        scheduled_at: DateTime<Utc>,
        reply: RpcReplyPort<Result<String, BranchError>>,
    },

    /// Claim due tasks under a lease so an abandoned claim becomes due again.
    ClaimDueTasks {
        now: DateTime<Utc>,
        lease_secs: i64,
        limit: i64,
        reply: RpcReplyPort<Result<Vec<Task>, BranchError>>,
    },

    /// Remove a finished task.
    CompleteTask(String, RpcReplyPort<Result<(), BranchError>>),
}

#[derive(Clone)]
pub struct DbHandle {
    actor: ActorRef<DbActorMessage>,
}

impl DbHandle {
    pub async fn create_restore(
        &self,
        name: &str,
        schema_only: bool,
        port: u16,
    ) -> Result<Restore, BranchError> {
        ractor::call!(self.actor, |reply| DbActorMessage::CreateRestore {
            name: name.to_string(),
            schema_only,
            port,
            reply,
        })
        .map_err(|e| BranchError::Ractor(format!("DbActor CreateRestore RPC failed: {e}")))?
    }

    pub async fn get_restore(&self, id: i64) -> Result<Restore, BranchError> {
        ractor::call!(self.actor, DbActorMessage::GetRestore, id)
            .map_err(|e| BranchError::Ractor(format!("DbActor GetRestore RPC failed: {e}")))?
    }

    pub async fn list_restores(&self) -> Result<Vec<Restore>, BranchError> {
        ractor::call!(self.actor, DbActorMessage::ListRestores)
            .map_err(|e| BranchError::Ractor(format!("DbActor ListRestores RPC failed: {e}")))?
    }

    pub async fn restores_with_branch_counts(
        &self,
    ) -> Result<Vec<RestoreWithBranches>, BranchError> {
        ractor::call!(self.actor, DbActorMessage::RestoresWithBranchCounts).map_err(|e| {
            BranchError::Ractor(format!("DbActor RestoresWithBranchCounts RPC failed: {e}"))
        })?
    }

    pub async fn count_restores(&self) -> Result<i64, BranchError> {
        ractor::call!(self.actor, DbActorMessage::CountRestores)
            .map_err(|e| BranchError::Ractor(format!("DbActor CountRestores RPC failed: {e}")))?
    }

    pub async fn latest_ready_restore(&self) -> Result<Option<Restore>, BranchError> {
        ractor::call!(self.actor, DbActorMessage::LatestReadyRestore).map_err(|e| {
            BranchError::Ractor(format!("DbActor LatestReadyRestore RPC failed: {e}"))
        })?
    }

    pub async fn mark_restore_ready(
        &self,
        id: i64,
        ready_at: DateTime<Utc>,
    ) -> Result<Restore, BranchError> {
        ractor::call!(self.actor, |reply| DbActorMessage::MarkRestoreReady {
            id,
            ready_at,
            reply,
        })
        .map_err(|e| BranchError::Ractor(format!("DbActor MarkRestoreReady RPC failed: {e}")))?
    }

    pub async fn delete_restore(&self, id: i64) -> Result<(), BranchError> {
        ractor::call!(self.actor, DbActorMessage::DeleteRestore, id)
            .map_err(|e| BranchError::Ractor(format!("DbActor DeleteRestore RPC failed: {e}")))?
    }

    pub async fn create_branch(
        &self,
        name: &str,
        restore_id: i64,
        username: &str,
        password: &str,
        port: u16,
    ) -> Result<Branch, BranchError> {
        ractor::call!(self.actor, |reply| DbActorMessage::CreateBranch {
            name: name.to_string(),
            restore_id,
            username: username.to_string(),
            password: password.to_string(),
            port,
            reply,
        })
        .map_err(|e| BranchError::Ractor(format!("DbActor CreateBranch RPC failed: {e}")))?
    }

    pub async fn get_branch_by_name(&self, name: &str) -> Result<Option<Branch>, BranchError> {
        ractor::call!(
            self.actor,
            DbActorMessage::GetBranchByName,
            name.to_string()
        )
        .map_err(|e| BranchError::Ractor(format!("DbActor GetBranchByName RPC failed: {e}")))?
    }

    pub async fn list_branches(
        &self,
        restore_id: Option<i64>,
    ) -> Result<Vec<Branch>, BranchError> {
        ractor::call!(self.actor, DbActorMessage::ListBranches, restore_id)
            .map_err(|e| BranchError::Ractor(format!("DbActor ListBranches RPC failed: {e}")))?
    }

    pub async fn delete_branch(&self, name: &str) -> Result<(), BranchError> {
        ractor::call!(self.actor, DbActorMessage::DeleteBranch, name.to_string())
            .map_err(|e| BranchError::Ractor(format!("DbActor DeleteBranch RPC failed: {e}")))?
    }

    pub async fn get_config(&self) -> Result<DbConfig, BranchError> {
        ractor::call!(self.actor, DbActorMessage::GetConfig)
            .map_err(|e| BranchError::Ractor(format!("DbActor GetConfig RPC failed: {e}")))?
    }

    pub async fn patch_config(&self, patch: ConfigPatch) -> Result<DbConfig, BranchError> {
        ractor::call!(self.actor, DbActorMessage::PatchConfig, patch)
            .map_err(|e| BranchError::Ractor(format!("DbActor PatchConfig RPC failed: {e}")))?
    }

    pub async fn update_refresh_timestamps(
        &self,
        last: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
    ) -> Result<(), BranchError> {
        ractor::call!(self.actor, |reply| {
            DbActorMessage::UpdateRefreshTimestamps { last, next, reply }
        })
        .map_err(|e| {
            BranchError::Ractor(format!("DbActor UpdateRefreshTimestamps RPC failed: {e}"))
        })?
    }

    pub async fn list_rules(&self) -> Result<Vec<AnonymizationRule>, BranchError> {
        ractor::call!(self.actor, DbActorMessage::ListRules)
            .map_err(|e| BranchError::Ractor(format!("DbActor ListRules RPC failed: {e}")))?
    }

    pub async fn create_rule(&self, rule: RuleCreate) -> Result<i64, BranchError> {
        ractor::call!(self.actor, DbActorMessage::CreateRule, rule)
            .map_err(|e| BranchError::Ractor(format!("DbActor CreateRule RPC failed: {e}")))?
    }

    pub async fn enqueue_task(
        &self,
        kind: &str,
        restore_id: i64,
        attempt: i64,
        scheduled_at: DateTime<Utc>,
    ) -> Result<String, BranchError> {
        ractor::call!(self.actor, |reply| DbActorMessage::EnqueueTask {
            kind: kind.to_string(),
            restore_id,
            attempt,
            scheduled_at,
            reply,
        })
        .map_err(|e| BranchError::Ractor(format!("DbActor EnqueueTask RPC failed: {e}")))?
    }

    pub async fn claim_due_tasks(
        &self,
        now: DateTime<Utc>,
        lease_secs: i64,
        limit: i64,
    ) -> Result<Vec<Task>, BranchError> {
        ractor::call!(self.actor, |reply| DbActorMessage::ClaimDueTasks {
            now,
            lease_secs,
            limit,
            reply,
        })
        .map_err(|e| BranchError::Ractor(format!("DbActor ClaimDueTasks RPC failed: {e}")))?
    }

    pub async fn complete_task(&self, id: &str) -> Result<(), BranchError> {
        ractor::call!(self.actor, DbActorMessage::CompleteTask, id.to_string())
            .map_err(|e| BranchError::Ractor(format!("DbActor CompleteTask RPC failed: {e}")))?
    }
}

struct DbActorState {
    pool: SqlitePool,
}

struct DbActor;

#[ractor::async_trait]
impl Actor for DbActor {
    type Msg = DbActorMessage;
    type State = DbActorState;
    type Arguments = String;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        database_url: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let connect_opts = SqliteConnectOptions::from_str(database_url.as_str())
            .map_err(|e| ActorProcessingErr::from(format!("invalid database url: {e}")))?
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_secs(5))
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .connect_with(connect_opts)
            .await
            .map_err(|e| ActorProcessingErr::from(format!("db connect failed: {e}")))?;

        apply_schema(&pool)
            .await
            .map_err(|e| ActorProcessingErr::from(format!("db schema init failed: {e}")))?;

        info!("DbActor initialized");
        Ok(DbActorState { pool })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            DbActorMessage::CreateRestore {
                name,
                schema_only,
                port,
                reply,
            } => {
                let res = self
                    .create_restore(&state.pool, &name, schema_only, port)
                    .await;
                let _ = reply.send(res);
            }
            DbActorMessage::GetRestore(id, reply) => {
                let _ = reply.send(self.get_restore(&state.pool, id).await);
            }
            DbActorMessage::ListRestores(reply) => {
                let _ = reply.send(self.list_restores(&state.pool).await);
            }
            DbActorMessage::RestoresWithBranchCounts(reply) => {
                let _ = reply.send(self.restores_with_branch_counts(&state.pool).await);
            }
            DbActorMessage::CountRestores(reply) => {
                let res = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM restores")
                    .fetch_one(&state.pool)
                    .await
                    .map_err(BranchError::from);
                let _ = reply.send(res);
            }
            DbActorMessage::LatestReadyRestore(reply) => {
                let _ = reply.send(self.latest_ready_restore(&state.pool).await);
            }
            DbActorMessage::MarkRestoreReady {
                id,
                ready_at,
                reply,
            } => {
                let _ = reply.send(self.mark_restore_ready(&state.pool, id, ready_at).await);
            }
            DbActorMessage::DeleteRestore(id, reply) => {
                let _ = reply.send(self.delete_restore(&state.pool, id).await);
            }
            DbActorMessage::CreateBranch {
                name,
                restore_id,
                username,
                password,
                port,
                reply,
            } => {
                let res = self
                    .create_branch(&state.pool, &name, restore_id, &username, &password, port)
                    .await;
                let _ = reply.send(res);
            }
            DbActorMessage::GetBranchByName(name, reply) => {
                let _ = reply.send(self.get_branch_by_name(&state.pool, &name).await);
            }
            DbActorMessage::ListBranches(restore_id, reply) => {
                let _ = reply.send(self.list_branches(&state.pool, restore_id).await);
            }
            DbActorMessage::DeleteBranch(name, reply) => {
                let _ = reply.send(self.delete_branch(&state.pool, &name).await);
            }
            DbActorMessage::GetConfig(reply) => {
                let _ = reply.send(self.get_config(&state.pool).await);
            }
            DbActorMessage::PatchConfig(patch, reply) => {
                let _ = reply.send(self.patch_config(&state.pool, patch).await);
            }
            DbActorMessage::UpdateRefreshTimestamps { last, next, reply } => {
                let _ = reply.send(
                    self.update_refresh_timestamps(&state.pool, last, next)
                        .await,
                );
            }
            DbActorMessage::ListRules(reply) => {
                let _ = reply.send(self.list_rules(&state.pool).await);
            }
            DbActorMessage::CreateRule(rule, reply) => {
                let _ = reply.send(self.create_rule(&state.pool, rule).await);
            }
            DbActorMessage::EnqueueTask {
                kind,
                restore_id,
                attempt,
                scheduled_at,
                reply,
            } => {
                let res = self
                    .enqueue_task(&state.pool, &kind, restore_id, attempt, scheduled_at)
                    .await;
                let _ = reply.send(res);
            }
            DbActorMessage::ClaimDueTasks {
                now,
                lease_secs,
                limit,
                reply,
            } => {
                let _ = reply.send(
                    self.claim_due_tasks(&state.pool, now, lease_secs, limit)
                        .await,
                );
            }
            DbActorMessage::CompleteTask(id, reply) => {
                let res = sqlx::query("DELETE FROM tasks WHERE id = ?")
                    .bind(id)
                    .execute(&state.pool)
                    .await
                    .map(|_| ())
                    .map_err(BranchError::from);
                let _ = reply.send(res);
            }
        }
        Ok(())
    }
}

impl DbActor {
    async fn create_restore(
        &self,
        pool: &SqlitePool,
        name: &str,
        schema_only: bool,
        port: u16,
    ) -> Result<Restore, BranchError> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, Restore>(
            r#"
        INSERT INTO restores (name, schema_only, schema_ready, data_ready, ready_at, port, created_at, updated_at)
        VALUES (?, ?, 0, 0, NULL, ?, ?, ?)
        RETURNING id, name, schema_only, schema_ready, data_ready, ready_at, port, created_at, updated_at
        "#,
        )
        .bind(name)
        .bind(schema_only)
        .bind(port)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await?;

        Ok(row)
    }

    async fn get_restore(&self, pool: &SqlitePool, id: i64) -> Result<Restore, BranchError> {
        sqlx::query_as::<_, Restore>(
            r#"
        SELECT id, name, schema_only, schema_ready, data_ready, ready_at, port, created_at, updated_at
        FROM restores
        WHERE id = ?
        "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(BranchError::RestoreNotFound(id))
    }

    async fn list_restores(&self, pool: &SqlitePool) -> Result<Vec<Restore>, BranchError> {
        let rows = sqlx::query_as::<_, Restore>(
            r#"
        SELECT id, name, schema_only, schema_ready, data_ready, ready_at, port, created_at, updated_at
        FROM restores
        ORDER BY created_at ASC, id ASC
        "#,
        )
        .fetch_all(pool)
        .await?;

        Ok(rows)
    }

    async fn restores_with_branch_counts(
        &self,
        pool: &SqlitePool,
    ) -> Result<Vec<RestoreWithBranches>, BranchError> {
        let restores = self.list_restores(pool).await?;
        let counts: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT restore_id, COUNT(*) FROM branches GROUP BY restore_id",
        )
        .fetch_all(pool)
        .await?;
        let counts: HashMap<i64, i64> = counts.into_iter().collect();

        Ok(restores
            .into_iter()
            .map(|r| {
                let branch_count = counts.get(&r.id).copied().unwrap_or(0);
                RestoreWithBranches {
                    restore: r,
                    branch_count,
                }
            })
            .collect())
    }

    async fn latest_ready_restore(
        &self,
        pool: &SqlitePool,
    ) -> Result<Option<Restore>, BranchError> {
        let row = sqlx::query_as::<_, Restore>(
            r#"
        SELECT id, name, schema_only, schema_ready, data_ready, ready_at, port, created_at, updated_at
        FROM restores
        WHERE ready_at IS NOT NULL
        ORDER BY ready_at DESC
        LIMIT 1
        "#,
        )
        .fetch_optional(pool)
        .await?;

        Ok(row)
    }

    /// Flips both readiness flags in one transaction. `ready_at` is written
    /// only when still NULL; a second call returns the row unchanged.
    async fn mark_restore_ready(
        &self,
        pool: &SqlitePool,
        id: i64,
        ready_at: DateTime<Utc>,
    ) -> Result<Restore, BranchError> {
        let mut tx = pool.begin().await?;
        sqlx::query(
            r#"
        UPDATE restores
        SET schema_ready = 1,
            data_ready = CASE WHEN schema_only = 1 THEN 0 ELSE 1 END,
            ready_at = ?,
            updated_at = ?
        WHERE id = ? AND ready_at IS NULL
        "#,
        )
        .bind(ready_at)
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.get_restore(pool, id).await
    }

    async fn delete_restore(&self, pool: &SqlitePool, id: i64) -> Result<(), BranchError> {
        let mut tx = pool.begin().await?;
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM branches WHERE restore_id = ?")
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;
        if count > 0 {
            return Err(BranchError::RestoreHasBranches { id, count });
        }
        sqlx::query("DELETE FROM restores WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn create_branch(
        &self,
        pool: &SqlitePool,
        name: &str,
        restore_id: i64,
        username: &str,
        password: &str,
        port: u16,
    ) -> Result<Branch, BranchError> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, Branch>(
            r#"
        INSERT INTO branches (name, restore_id, username, password, port, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        RETURNING id, name, restore_id, username, password, port, created_at, updated_at
        "#,
        )
        .bind(name)
        .bind(restore_id)
        .bind(username)
        .bind(password)
        .bind(port)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await?;

        Ok(row)
    }

    async fn get_branch_by_name(
        &self,
        pool: &SqlitePool,
        name: &str,
    ) -> Result<Option<Branch>, BranchError> {
        let row = sqlx::query_as::<_, Branch>(
            r#"
        SELECT id, name, restore_id, username, password, port, created_at, updated_at
        FROM branches
        WHERE name = ?
        "#,
        )
        .bind(name)
        .fetch_optional(pool)
        .await?;

        Ok(row)
    }

    async fn list_branches(
        &self,
        pool: &SqlitePool,
        restore_id: Option<i64>,
    ) -> Result<Vec<Branch>, BranchError> {
        let rows = match restore_id {
            Some(rid) => {
                sqlx::query_as::<_, Branch>(
                    r#"
                SELECT id, name, restore_id, username, password, port, created_at, updated_at
                FROM branches
                WHERE restore_id = ?
                ORDER BY id
                "#,
                )
                .bind(rid)
                .fetch_all(pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Branch>(
                    r#"
                SELECT id, name, restore_id, username, password, port, created_at, updated_at
                FROM branches
                ORDER BY id
                "#,
                )
                .fetch_all(pool)
                .await?
            }
        };

        Ok(rows)
    }

    async fn delete_branch(&self, pool: &SqlitePool, name: &str) -> Result<(), BranchError> {
        let res = sqlx::query("DELETE FROM branches WHERE name = ?")
            .bind(name)
            .execute(pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(BranchError::BranchNotFound(name.to_string()));
        }
        Ok(())
    }

    async fn get_config(&self, pool: &SqlitePool) -> Result<DbConfig, BranchError> {
        let row = sqlx::query_as::<_, DbConfig>(
            r#"
        SELECT id, source_dsn, repo_stanza, repo_endpoint, repo_api_key, schema_only_default,
               cron_expression, last_refresh_at, next_refresh_at, max_restores, created_at, updated_at
        FROM config
        WHERE id = 1
        "#,
        )
        .fetch_one(pool)
        .await?;

        Ok(row)
    }

    async fn patch_config(
        &self,
        pool: &SqlitePool,
        patch: ConfigPatch,
    ) -> Result<DbConfig, BranchError> {
        let mut tx = pool.begin().await?;
        let mut cfg = sqlx::query_as::<_, DbConfig>(
            r#"
        SELECT id, source_dsn, repo_stanza, repo_endpoint, repo_api_key, schema_only_default,
               cron_expression, last_refresh_at, next_refresh_at, max_restores, created_at, updated_at
        FROM config
        WHERE id = 1
        "#,
        )
        .fetch_one(&mut *tx)
        .await?;

        if let Some(v) = patch.source_dsn {
            cfg.source_dsn = v;
        }
        if let Some(v) = patch.repo_stanza {
            cfg.repo_stanza = v;
        }
        if let Some(v) = patch.repo_endpoint {
            cfg.repo_endpoint = v;
        }
        if let Some(v) = patch.repo_api_key {
            cfg.repo_api_key = v;
        }
        if let Some(v) = patch.schema_only_default {
            cfg.schema_only_default = v;
        }
        if let Some(v) = patch.cron_expression {
            cfg.cron_expression = v;
        }
        if let Some(v) = patch.max_restores {
            cfg.max_restores = v;
        }

        sqlx::query(
            r#"
        UPDATE config
        SET source_dsn = ?, repo_stanza = ?, repo_endpoint = ?, repo_api_key = ?,
            schema_only_default = ?, cron_expression = ?, max_restores = ?, updated_at = ?
        WHERE id = 1
        "#,
        )
        .bind(&cfg.source_dsn)
        .bind(&cfg.repo_stanza)
        .bind(&cfg.repo_endpoint)
        .bind(&cfg.repo_api_key)
        .bind(cfg.schema_only_default)
        .bind(&cfg.cron_expression)
        .bind(cfg.max_restores)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.get_config(pool).await
    }

    async fn update_refresh_timestamps(
        &self,
        pool: &SqlitePool,
        last: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
    ) -> Result<(), BranchError> {
        sqlx::query(
            "UPDATE config SET last_refresh_at = ?, next_refresh_at = ?, updated_at = ? WHERE id = 1",
        )
        .bind(last)
        .bind(next)
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(())
    }

    async fn list_rules(
        &self,
        pool: &SqlitePool,
    ) -> Result<Vec<AnonymizationRule>, BranchError> {
        let rows = sqlx::query_as::<_, AnonymizationRule>(
            r#"
        SELECT id, table_name, column_name, template, kind, created_at
        FROM anonymization_rules
        ORDER BY table_name, column_name
        "#,
        )
        .fetch_all(pool)
        .await?;

        Ok(rows)
    }

    async fn create_rule(
        &self,
        pool: &SqlitePool,
        rule: RuleCreate,
    ) -> Result<i64, BranchError> {
        let id: i64 = sqlx::query_scalar(
            r#"
        INSERT INTO anonymization_rules (table_name, column_name, template, kind, created_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(table_name, column_name) DO UPDATE SET
            template = excluded.template,
            kind = excluded.kind
        RETURNING id
        "#,
        )
        .bind(rule.table_name)
        .bind(rule.column_name)
        .bind(rule.template)
        .bind(rule.kind)
        .bind(Utc::now())
        .fetch_one(pool)
        .await?;

        Ok(id)
    }

    async fn enqueue_task(
        &self,
        pool: &SqlitePool,
        kind: &str,
        restore_id: i64,
        attempt: i64,
        scheduled_at: DateTime<Utc>,
    ) -> Result<String, BranchError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
        INSERT INTO tasks (id, kind, restore_id, attempt, scheduled_at, claimed_at, created_at)
        VALUES (?, ?, ?, ?, ?, NULL, ?)
        "#,
        )
        .bind(&id)
        .bind(kind)
        .bind(restore_id)
        .bind(attempt)
        .bind(scheduled_at)
        .bind(Utc::now())
        .execute(pool)
        .await?;

        Ok(id)
    }

    /// Claims due tasks inside one transaction. A claim is a lease: tasks
    /// whose lease expired become due again, so a worker crash between
    /// claim and completion only delays the work.
    async fn claim_due_tasks(
        &self,
        pool: &SqlitePool,
        now: DateTime<Utc>,
        lease_secs: i64,
        limit: i64,
    ) -> Result<Vec<Task>, BranchError> {
        let lease_cutoff = now - Duration::seconds(lease_secs);
        let mut tx = pool.begin().await?;
        let rows = sqlx::query_as::<_, Task>(
            r#"
        SELECT id, kind, restore_id, attempt, scheduled_at, claimed_at, created_at
        FROM tasks
        WHERE scheduled_at <= ? AND (claimed_at IS NULL OR claimed_at <= ?)
        ORDER BY scheduled_at ASC
        LIMIT ?
        "#,
        )
        .bind(now)
        .bind(lease_cutoff)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        for task in &rows {
            sqlx::query("UPDATE tasks SET claimed_at = ? WHERE id = ?")
                .bind(now)
                .bind(&task.id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(rows)
    }
}

/// Spawn the database actor and return a cloneable handle. Registered
/// names are process-global in ractor, so each actor gets a unique one.
pub async fn spawn(database_url: &str) -> DbHandle {
    let (actor, _jh) = ractor::Actor::spawn(
        Some(format!("DbActor-{}", Uuid::new_v4())),
        DbActor,
        database_url.to_string(),
    )
    .await
    .expect("failed to spawn DbActor");

    DbHandle { actor }
}

async fn apply_schema(pool: &SqlitePool) -> Result<(), BranchError> {
    for stmt in SQLITE_INIT.split(';') {
        let s = stmt.trim();
        if s.is_empty() {
            continue;
        }
        sqlx::query(s).execute(pool).await?;
    }

    // Seed the configuration singleton on first boot.
    let now = Utc::now();
    sqlx::query(
        "INSERT OR IGNORE INTO config (id, created_at, updated_at) VALUES (1, ?, ?)",
    )
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}
