mod common;

use chrono::Utc;
use common::{remove_env, test_env};
use pgbranch::anonymize::Anonymizer;
use pgbranch::process::{ProcessMonitor, SUCCESS_SENTINEL};
use pgbranch::resource::cleanup::CleanupManager;
use pgbranch::resource::cmd::AdminRunner;
use pgbranch::restore::RestoreService;
use std::fs;
use std::time::Duration;

/// End-to-end through the durable queue: a claimed wait task drives a
/// succeeded background operation to readiness without anyone blocking on
/// it.
#[tokio::test]
async fn worker_pool_drains_the_durable_queue() {
    let env = test_env("workers");
    let db = pgbranch::db::spawn(&env.database_url).await;
    let admin = AdminRunner::new(env.cfg.admin_cmd_timeout_secs);
    let monitor = ProcessMonitor::new(env.cfg.run_dir.clone(), env.cfg.log_dir.clone());
    let cleanup = CleanupManager::new(env.cfg.clone(), admin.clone(), monitor.clone());
    let anonymizer = Anonymizer::new(env.cfg.clone(), admin);
    let service = RestoreService::new(
        env.cfg.clone(),
        db.clone(),
        monitor.clone(),
        cleanup,
        anonymizer,
    );

    let restore = db
        .create_restore("restore_20250601020000", false, 50050)
        .await
        .unwrap();
    fs::write(
        monitor.log_path(&restore.name),
        format!("all phases done\n{SUCCESS_SENTINEL}\n"),
    )
    .unwrap();

    db.enqueue_task("restore_wait", restore.id, 0, Utc::now())
        .await
        .unwrap();

    let _workers = pgbranch::queue::spawn_workers(env.cfg.clone(), db.clone(), service);

    // The dispatcher polls every second; give it a few rounds.
    let mut ready = false;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        if db.get_restore(restore.id).await.unwrap().ready_at.is_some() {
            ready = true;
            break;
        }
    }
    assert!(ready, "worker pool never completed the restore");

    // The queue drained: nothing is left to claim.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(
        db.claim_due_tasks(Utc::now(), 300, 10).await.unwrap().is_empty()
    );

    remove_env(&env);
}
