//! Cron-driven refresh loop.
//!
//! On each due tick, decides whether a new restore is due: skips while an
//! operation is still running, and respects the max-restore ceiling unless
//! a branch-less ready restore exists for the post-completion sweep to
//! reclaim.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tracing::{error, info, warn};

use crate::db::DbHandle;
use crate::error::BranchError;
use crate::restore::RestoreService;

/// Parses a cron expression or reports a configuration error. Run at
/// startup so a bad expression fails the daemon, not the first tick.
pub fn validate_cron(expression: &str) -> Result<(), BranchError> {
    Schedule::from_str(expression)
        .map(|_| ())
        .map_err(|e| BranchError::Config(format!("invalid cron expression `{expression}`: {e}")))
}

/// Next fire time strictly after `after`, or None for an unsatisfiable or
/// invalid expression.
pub fn next_fire(expression: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let schedule = Schedule::from_str(expression).ok()?;
    schedule.after(&after).next()
}

pub struct RefreshScheduler {
    db: DbHandle,
    service: RestoreService,
}

impl RefreshScheduler {
    pub fn new(db: DbHandle, service: RestoreService) -> Self {
        Self { db, service }
    }

    /// Decides whether a refresh restore should start now.
    async fn refresh_due(&self) -> Result<bool, BranchError> {
        let restores = self.db.list_restores().await?;

        // One operation at a time: an unready restore with a live process
        // means a refresh is already underway.
        for r in &restores {
            if r.ready_at.is_none() && self.service.monitor().is_running(&r.name) {
                info!(name = %r.name, "refresh skipped; restore operation still running");
                return Ok(false);
            }
        }

        let db_cfg = self.db.get_config().await?;
        let rows = self.db.restores_with_branch_counts().await?;
        let total = i64::try_from(rows.len()).unwrap_or(i64::MAX);
        if total >= db_cfg.max_restores {
            // At the ceiling a refresh is only useful when the sweep that
            // follows completion can reclaim something.
            let reclaimable = rows
                .iter()
                .any(|r| r.branch_count == 0 && r.restore.ready_at.is_some());
            if !reclaimable {
                warn!(
                    total,
                    max = db_cfg.max_restores,
                    "refresh skipped; ceiling reached and every restore owns branches"
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Runs the loop until the daemon shuts down.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("refresh scheduler started");
            loop {
                let expression = match self.db.get_config().await {
                    Ok(c) => c.cron_expression,
                    Err(e) => {
                        warn!(error = %e, "scheduler could not load configuration");
                        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                        continue;
                    }
                };

                let Some(next) = next_fire(&expression, Utc::now()) else {
                    error!(%expression, "cron expression yields no upcoming fire time");
                    tokio::time::sleep(std::time::Duration::from_secs(300)).await;
                    continue;
                };

                let wait = (next - Utc::now()).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;

                match self.refresh_due().await {
                    Ok(false) => {}
                    Ok(true) => match self.service.start(None).await {
                        Ok(restore) => {
                            info!(restore_id = restore.id, name = %restore.name, "refresh restore triggered");
                        }
                        Err(e) => error!(error = %e, "refresh restore failed to start"),
                    },
                    Err(e) => warn!(error = %e, "refresh decision failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn validate_rejects_malformed_expressions() {
        assert!(validate_cron("0 0 2 * * * *").is_ok());
        assert!(validate_cron("not a cron line").is_err());
        assert!(validate_cron("").is_err());
    }

    #[test]
    fn next_fire_is_strictly_after_the_reference() {
        let after = Utc.with_ymd_and_hms(2025, 6, 1, 2, 0, 0).unwrap();
        let next = next_fire("0 0 2 * * * *", after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 2, 2, 0, 0).unwrap());
    }

    #[test]
    fn next_fire_handles_invalid_expressions() {
        assert!(next_fire("bogus", Utc::now()).is_none());
    }
}
