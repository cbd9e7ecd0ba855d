//! Retention policy over restores and their dependent branches.
//!
//! Two independent rules, both enforced: a branch-less restore is deleted
//! once superseded, and the restore count is trimmed to the configured
//! ceiling, oldest eligible first. A restore owning branches is never a
//! candidate, nor is the explicitly excluded id; when nothing is eligible
//! the ceiling may be temporarily exceeded.

use crate::db::RestoreWithBranches;

/// Selects restore ids to delete, in deletion order. Pure; the caller
/// routes each id through the orchestrator's delete.
pub fn retention_candidates(
    restores: &[RestoreWithBranches],
    max_restores: i64,
    exclude_id: Option<i64>,
) -> Vec<i64> {
    let eligible = |r: &RestoreWithBranches| {
        r.branch_count == 0 && Some(r.restore.id) != exclude_id && r.restore.ready_at.is_some()
    };

    let newest_ready_at = restores
        .iter()
        .filter_map(|r| r.restore.ready_at)
        .max();

    let mut doomed: Vec<i64> = Vec::new();

    // Rule 1: never keep a branch-less restore once it is superseded.
    if let Some(newest) = newest_ready_at {
        for r in restores {
            if eligible(r) && r.restore.ready_at.is_some_and(|t| t < newest) {
                doomed.push(r.restore.id);
            }
        }
    }

    // Rule 2: trim to the ceiling, oldest eligible candidates first.
    let mut remaining = i64::try_from(restores.len()).unwrap_or(i64::MAX)
        - i64::try_from(doomed.len()).unwrap_or(0);
    if remaining > max_restores {
        let mut candidates: Vec<&RestoreWithBranches> = restores
            .iter()
            .filter(|r| eligible(r) && !doomed.contains(&r.restore.id))
            .collect();
        candidates.sort_by_key(|r| (r.restore.created_at, r.restore.id));
        for r in candidates {
            if remaining <= max_restores {
                break;
            }
            doomed.push(r.restore.id);
            remaining -= 1;
        }
    }

    doomed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Restore;
    use chrono::{Duration, Utc};

    fn restore(id: i64, age_hours: i64, ready: bool, branch_count: i64) -> RestoreWithBranches {
        let created_at = Utc::now() - Duration::hours(age_hours);
        RestoreWithBranches {
            restore: Restore {
                id,
                name: format!("restore_{id}"),
                schema_only: false,
                schema_ready: ready,
                data_ready: ready,
                ready_at: ready.then(|| created_at + Duration::minutes(30)),
                port: 50000 + u16::try_from(id).unwrap(),
                created_at,
                updated_at: created_at,
            },
            branch_count,
        }
    }

    #[test]
    fn superseded_branchless_restores_are_deleted() {
        let rows = vec![restore(1, 48, true, 0), restore(2, 1, true, 0)];
        assert_eq!(retention_candidates(&rows, 10, Some(2)), vec![1]);
    }

    #[test]
    fn branch_owners_survive_any_pressure() {
        let rows = vec![
            restore(1, 72, true, 2),
            restore(2, 48, true, 1),
            restore(3, 1, true, 0),
        ];
        // Ceiling of one, everything old — but only branch-less restores
        // are candidates, and the newest is excluded.
        assert!(retention_candidates(&rows, 1, Some(3)).is_empty());
    }

    #[test]
    fn excluded_id_survives_even_when_superseded() {
        let rows = vec![restore(1, 48, true, 0), restore(2, 1, true, 0)];
        assert_eq!(retention_candidates(&rows, 10, Some(1)), vec![2]);
    }

    #[test]
    fn ceiling_trims_oldest_eligible_first() {
        let rows = vec![
            restore(1, 72, true, 1),
            restore(2, 48, true, 0),
            restore(3, 24, true, 0),
            restore(4, 1, true, 0),
        ];
        // Rule 1 already removes 2 and 3 (superseded, branch-less); the
        // ceiling of 2 is then satisfied.
        let doomed = retention_candidates(&rows, 2, Some(4));
        assert_eq!(doomed, vec![2, 3]);
    }

    #[test]
    fn ceiling_may_be_exceeded_when_nothing_is_eligible() {
        let rows = vec![
            restore(1, 72, true, 1),
            restore(2, 48, true, 3),
            restore(3, 1, true, 2),
        ];
        assert!(retention_candidates(&rows, 1, None).is_empty());
    }

    #[test]
    fn unready_restores_are_never_swept() {
        let rows = vec![restore(1, 48, false, 0), restore(2, 1, true, 0)];
        assert!(retention_candidates(&rows, 10, Some(2)).is_empty());
    }
}
