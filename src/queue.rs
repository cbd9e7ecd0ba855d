//! Bounded worker pool draining the durable task queue.
//!
//! Handlers run independently of whatever triggered them, so no caller
//! blocks on a multi-hour operation. Long-running restores execute as
//! detached OS processes outside the pool entirely; workers only launch or
//! poll them. Two task kinds exist per flow: start, and wait-for-completion
//! which re-enqueues itself until terminal. Claims are leases, so a worker
//! crash between claim and completion only delays the work.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::{DbHandle, Task};
use crate::error::BranchError;
use crate::restore::RestoreService;

/// Bounded trigger-step timeout. Applies to task handlers only, never to
/// the detached restore operation itself.
const TASK_TIMEOUT: Duration = Duration::from_secs(300);

/// Claim lease; an abandoned claim becomes due again after this long.
const CLAIM_LEASE_SECS: i64 = 300;

/// Dispatcher poll cadence against the durable queue.
const DISPATCH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    RestoreStart,
    RestoreWait,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RestoreStart => "restore_start",
            Self::RestoreWait => "restore_wait",
        }
    }

    pub fn parse(s: &str) -> Result<Self, BranchError> {
        match s {
            "restore_start" => Ok(Self::RestoreStart),
            "restore_wait" => Ok(Self::RestoreWait),
            other => Err(BranchError::Validation(format!(
                "unknown task kind `{other}`"
            ))),
        }
    }
}

/// Executes one claimed task. Completion deletes the queue entry; on error
/// the entry is left claimed and becomes due again when the lease expires.
pub async fn handle_task(service: &RestoreService, task: &Task) -> Result<(), BranchError> {
    match TaskKind::parse(&task.kind)? {
        TaskKind::RestoreStart => service.launch(task.restore_id).await,
        TaskKind::RestoreWait => service.handle_wait(task).await,
    }
}

/// Spawns the dispatcher and the bounded worker pipeline. The dispatcher
/// claims due tasks and feeds them into a channel; workers drain it with
/// bounded concurrency.
pub fn spawn_workers(
    cfg: Arc<Config>,
    db: DbHandle,
    service: RestoreService,
) -> tokio::task::JoinHandle<()> {
    let concurrency = cfg.worker_concurrency.max(1);
    let (task_tx, task_rx) = mpsc::channel::<Task>(concurrency * 4);

    // Worker pipeline.
    let worker_db = db.clone();
    let worker_service = service.clone();
    tokio::spawn(async move {
        info!(concurrency, "task worker pipeline started");
        let mut pipeline = ReceiverStream::new(task_rx)
            .map(|task| {
                let service = worker_service.clone();
                let db = worker_db.clone();
                async move {
                    let outcome =
                        tokio::time::timeout(TASK_TIMEOUT, handle_task(&service, &task)).await;
                    match outcome {
                        Ok(Ok(())) => {
                            if let Err(e) = db.complete_task(&task.id).await {
                                warn!(task_id = %task.id, error = %e, "task completion not recorded");
                            }
                        }
                        Ok(Err(e)) => {
                            // Left claimed; the lease expiry makes it due
                            // again unless the handler already rescheduled.
                            error!(task_id = %task.id, kind = %task.kind, error = %e, "task handler failed");
                            if !matches!(e, BranchError::Database(_) | BranchError::Ractor(_)) {
                                // Non-transient failures are final for this
                                // entry; the handler logged the outcome.
                                if let Err(e) = db.complete_task(&task.id).await {
                                    warn!(task_id = %task.id, error = %e, "task completion not recorded");
                                }
                            }
                        }
                        Err(_) => {
                            error!(task_id = %task.id, kind = %task.kind, "task handler timed out");
                        }
                    }
                }
            })
            .buffer_unordered(concurrency);

        while pipeline.next().await.is_some() {}
        info!("task worker pipeline stopped");
    });

    // Dispatcher loop.
    tokio::spawn(async move {
        let limit = i64::try_from(concurrency * 2).unwrap_or(8);
        loop {
            match db
                .claim_due_tasks(chrono::Utc::now(), CLAIM_LEASE_SECS, limit)
                .await
            {
                Ok(tasks) => {
                    for task in tasks {
                        if task_tx.send(task).await.is_err() {
                            warn!("worker pipeline gone; dispatcher stopping");
                            return;
                        }
                    }
                }
                Err(e) => warn!(error = %e, "task claim failed"),
            }
            tokio::time::sleep(DISPATCH_INTERVAL).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_kinds_round_trip() {
        assert_eq!(
            TaskKind::parse(TaskKind::RestoreStart.as_str()).unwrap(),
            TaskKind::RestoreStart
        );
        assert_eq!(
            TaskKind::parse(TaskKind::RestoreWait.as_str()).unwrap(),
            TaskKind::RestoreWait
        );
        assert!(TaskKind::parse("restore_cancel").is_err());
    }
}
