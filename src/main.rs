use std::sync::Arc;

use mimalloc::MiMalloc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use pgbranch::anonymize::Anonymizer;
use pgbranch::branch::BranchService;
use pgbranch::config::Config;
use pgbranch::process::ProcessMonitor;
use pgbranch::resource::cleanup::CleanupManager;
use pgbranch::resource::cmd::AdminRunner;
use pgbranch::resource::ports::{BranchPortAllocator, admin_port_for_version};
use pgbranch::restore::RestoreService;
use pgbranch::scheduler::{RefreshScheduler, validate_cron};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let cfg = Arc::new(Config::from_env());

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cfg.loglevel.clone()));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_level(true)
                .with_target(false),
        )
        .init();

    info!(
        database_url = %cfg.database_url,
        data_root = %cfg.data_root,
        run_dir = %cfg.run_dir.display(),
        log_dir = %cfg.log_dir.display(),
        restore_ports = %format!("{}-{}", cfg.restore_port_start, cfg.restore_port_end),
        branch_ports = %format!("{}-{}", cfg.branch_port_start, cfg.branch_port_end),
        source_version = cfg.source_version,
        loglevel = %cfg.loglevel,
    );

    // Fail fast on host-level misconfiguration.
    admin_port_for_version(cfg.source_version)?;
    tokio::fs::create_dir_all(&cfg.run_dir).await?;
    tokio::fs::create_dir_all(&cfg.log_dir).await?;
    tokio::fs::create_dir_all(&cfg.script_dir).await?;

    let db = pgbranch::db::spawn(&cfg.database_url).await;
    validate_cron(&db.get_config().await?.cron_expression)?;

    let admin = AdminRunner::new(cfg.admin_cmd_timeout_secs);
    let monitor = ProcessMonitor::new(cfg.run_dir.clone(), cfg.log_dir.clone());
    let cleanup = CleanupManager::new(cfg.clone(), admin.clone(), monitor.clone());
    let anonymizer = Anonymizer::new(cfg.clone(), admin.clone());
    let restore_service = RestoreService::new(
        cfg.clone(),
        db.clone(),
        monitor.clone(),
        cleanup.clone(),
        anonymizer,
    );

    let branch_ports = BranchPortAllocator::new(
        cfg.branch_port_start,
        cfg.branch_port_end,
        &cfg.run_dir,
        &cfg.ufw_bin,
        admin.clone(),
    );
    let _branch_service = BranchService::new(
        cfg.clone(),
        db.clone(),
        admin,
        branch_ports,
        cleanup.clone(),
    );

    let _workers = pgbranch::queue::spawn_workers(cfg.clone(), db.clone(), restore_service.clone());
    let _scheduler = RefreshScheduler::new(db.clone(), restore_service).spawn();

    info!("pgbranch control plane running");
    shutdown_signal().await;
    info!("Server has shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { /* ... */ },
        _ = terminate => { /* ... */ },
    }
}
