use chrono::{Duration, Utc};
use pgbranch::db::{ConfigPatch, RuleCreate};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::SystemTime;
use tokio::fs;

fn temp_database_url(tag: &str) -> (String, std::path::PathBuf) {
    let tmp_dir = std::env::temp_dir();
    let mut hasher = DefaultHasher::new();
    SystemTime::now().hash(&mut hasher);
    tag.hash(&mut hasher);
    let db_path = tmp_dir.join(format!("test_db_{}_{}.sqlite", tag, hasher.finish()));
    (
        format!("sqlite:{}", db_path.to_str().unwrap()),
        db_path,
    )
}

async fn remove_database(db_path: &std::path::Path) {
    let wal_path = std::path::PathBuf::from(format!("{}-wal", db_path.to_string_lossy()));
    let shm_path = std::path::PathBuf::from(format!("{}-shm", db_path.to_string_lossy()));
    let _ = fs::remove_file(&wal_path).await;
    let _ = fs::remove_file(&shm_path).await;
    fs::remove_file(db_path).await.unwrap();
}

#[tokio::test]
async fn test_restore_lifecycle_baseline() {
    let (database_url, db_path) = temp_database_url("restores");
    let db = pgbranch::db::spawn(&database_url).await;

    // 1. Fresh database has no restores.
    assert!(db.list_restores().await.unwrap().is_empty());
    assert_eq!(db.count_restores().await.unwrap(), 0);
    assert!(db.latest_ready_restore().await.unwrap().is_none());

    // 2. Create one and read it back.
    let restore = db
        .create_restore("restore_20250601020000", false, 50001)
        .await
        .unwrap();
    assert!(restore.id > 0);
    assert!(!restore.schema_ready);
    assert!(!restore.data_ready);
    assert!(restore.ready_at.is_none());
    assert_eq!(restore.port, 50001);

    let fetched = db.get_restore(restore.id).await.unwrap();
    assert_eq!(fetched, restore);

    // 3. Not ready yet, so it is not the latest ready restore.
    assert!(db.latest_ready_restore().await.unwrap().is_none());

    // 4. Mark ready: both flags flip in one transaction and ready_at is
    //    stamped once.
    let ready_at = Utc::now();
    let ready = db.mark_restore_ready(restore.id, ready_at).await.unwrap();
    assert!(ready.schema_ready);
    assert!(ready.data_ready);
    assert_eq!(
        ready.ready_at.unwrap().timestamp(),
        ready_at.timestamp()
    );

    // A second mark leaves the original timestamp untouched.
    let again = db
        .mark_restore_ready(restore.id, ready_at + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(again.ready_at, ready.ready_at);

    // 5. A schema-only restore never reports data_ready.
    let schema_only = db
        .create_restore("restore_20250601030000", true, 50002)
        .await
        .unwrap();
    let ready2 = db
        .mark_restore_ready(schema_only.id, Utc::now())
        .await
        .unwrap();
    assert!(ready2.schema_ready);
    assert!(!ready2.data_ready);

    // 6. Latest ready restore orders by ready_at descending.
    let latest = db.latest_ready_restore().await.unwrap().unwrap();
    assert_eq!(latest.id, schema_only.id);

    // 7. Duplicate names are rejected by the unique constraint.
    assert!(
        db.create_restore("restore_20250601020000", false, 50003)
            .await
            .is_err()
    );

    remove_database(&db_path).await;
}

#[tokio::test]
async fn test_branch_ownership_blocks_restore_delete() {
    let (database_url, db_path) = temp_database_url("branches");
    let db = pgbranch::db::spawn(&database_url).await;

    let restore = db
        .create_restore("restore_20250601040000", false, 50010)
        .await
        .unwrap();
    let branch = db
        .create_branch("feature-x", restore.id, "u_abcdef", "s3cr3tpassword00", 15433)
        .await
        .unwrap();
    assert_eq!(branch.restore_id, restore.id);

    // Owning a branch refuses deletion.
    let err = db.delete_restore(restore.id).await.unwrap_err();
    assert!(matches!(
        err,
        pgbranch::BranchError::RestoreHasBranches { count: 1, .. }
    ));

    // Branch counts surface through the combined listing.
    let rows = db.restores_with_branch_counts().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].branch_count, 1);

    // Branch lookup by name; a missing name is None, not an error.
    let by_name = db.get_branch_by_name("feature-x").await.unwrap().unwrap();
    assert_eq!(by_name.id, branch.id);
    assert!(db.get_branch_by_name("missing").await.unwrap().is_none());

    // After the branch goes, the restore can too.
    db.delete_branch("feature-x").await.unwrap();
    db.delete_restore(restore.id).await.unwrap();
    assert!(db.list_restores().await.unwrap().is_empty());

    // Deleting twice reports the branch as missing.
    assert!(matches!(
        db.delete_branch("feature-x").await.unwrap_err(),
        pgbranch::BranchError::BranchNotFound(_)
    ));

    remove_database(&db_path).await;
}

#[tokio::test]
async fn test_config_singleton_and_rules() {
    let (database_url, db_path) = temp_database_url("config");
    let db = pgbranch::db::spawn(&database_url).await;

    // Seeded on first boot.
    let cfg = db.get_config().await.unwrap();
    assert_eq!(cfg.id, 1);
    assert!(cfg.source_dsn.is_none());
    assert_eq!(cfg.max_restores, 2);

    // Patch strategy inputs and the ceiling.
    let patched = db
        .patch_config(ConfigPatch {
            source_dsn: Some(Some("postgresql://app@db/app".to_string())),
            max_restores: Some(4),
            cron_expression: Some("0 30 1 * * * *".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(patched.source_dsn.as_deref(), Some("postgresql://app@db/app"));
    assert_eq!(patched.max_restores, 4);
    assert_eq!(patched.cron_expression, "0 30 1 * * * *");

    // Refresh timestamps update transactionally.
    let last = Utc::now();
    let next = last + Duration::days(1);
    db.update_refresh_timestamps(last, Some(next)).await.unwrap();
    let cfg = db.get_config().await.unwrap();
    assert_eq!(cfg.last_refresh_at.unwrap().timestamp(), last.timestamp());
    assert_eq!(cfg.next_refresh_at.unwrap().timestamp(), next.timestamp());

    // Rules upsert on (table, column).
    let id = db
        .create_rule(RuleCreate {
            table_name: "users".to_string(),
            column_name: "email".to_string(),
            template: "user_${i}@x.com".to_string(),
            kind: "text".to_string(),
        })
        .await
        .unwrap();
    let id2 = db
        .create_rule(RuleCreate {
            table_name: "users".to_string(),
            column_name: "email".to_string(),
            template: "member_${i}@x.com".to_string(),
            kind: "text".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(id, id2);

    let rules = db.list_rules().await.unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].template, "member_${i}@x.com");

    remove_database(&db_path).await;
}

#[tokio::test]
async fn test_task_queue_claim_lease() {
    let (database_url, db_path) = temp_database_url("tasks");
    let db = pgbranch::db::spawn(&database_url).await;

    let now = Utc::now();

    // A future task is not due.
    db.enqueue_task("restore_wait", 7, 0, now + Duration::seconds(600))
        .await
        .unwrap();
    assert!(db.claim_due_tasks(now, 300, 10).await.unwrap().is_empty());

    // A due task is claimed exactly once while its lease holds.
    let id = db
        .enqueue_task("restore_start", 7, 0, now - Duration::seconds(5))
        .await
        .unwrap();
    let claimed = db.claim_due_tasks(now, 300, 10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, id);
    assert_eq!(claimed[0].kind, "restore_start");
    assert_eq!(claimed[0].restore_id, 7);
    assert!(db.claim_due_tasks(now, 300, 10).await.unwrap().is_empty());

    // An abandoned claim becomes due again after the lease expires.
    let later = now + Duration::seconds(301);
    let reclaimed = db.claim_due_tasks(later, 300, 10).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, id);

    // Completion removes the entry for good; only the future wait task
    // remains once its time comes.
    db.complete_task(&id).await.unwrap();
    let much_later = now + Duration::seconds(1000);
    let remaining = db.claim_due_tasks(much_later, 300, 10).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].kind, "restore_wait");

    remove_database(&db_path).await;
}
