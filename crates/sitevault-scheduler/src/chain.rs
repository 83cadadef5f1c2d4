//! Full/incremental lineage decisions.
//!
//! A chain is the sequence of jobs for one (site, sink) pair linked through
//! `parent_backup_id`, rooted at a full backup. Planning only ever chains onto
//! a completed job; anything else restarts the chain with a full backup.

use std::collections::HashMap;

use serde::Serialize;
use sitevault_core::types::JobId;
use tracing::{debug, warn};

use crate::types::{BackupJob, BackupSchedule, BackupType, JobKind, JobStatus};

/// Why an incremental-eligible firing was promoted to full.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "fallback", rename_all = "snake_case")]
pub enum ChainFallback {
    /// Nothing to chain onto yet.
    NoPriorJob,
    /// The intended parent did not complete.
    BrokenParent { parent_id: JobId, status: JobStatus },
}

/// The type and lineage of the job a firing should create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobPlan {
    #[serde(flatten)]
    pub kind: JobKind,
    pub fallback: Option<ChainFallback>,
}

impl JobPlan {
    pub fn full() -> Self {
        Self {
            kind: JobKind::Full,
            fallback: None,
        }
    }

    pub fn incremental(parent: JobId) -> Self {
        Self {
            kind: JobKind::Incremental {
                parent_backup_id: parent,
            },
            fallback: None,
        }
    }
}

/// True when the schedule's cadence forces firing `firing_index` (1-based)
/// to be a full backup: firings `1, N+1, 2N+1, …` for `full_backup_frequency = N`.
pub fn is_cadence_full(schedule: &BackupSchedule, firing_index: u64) -> bool {
    match schedule.backup_type {
        BackupType::Full => true,
        BackupType::Incremental => match schedule.full_backup_frequency {
            Some(n) if n > 0 => firing_index.saturating_sub(1) % n as u64 == 0,
            _ => false,
        },
    }
}

/// Decide the job for firing `firing_index` of `schedule`.
///
/// `latest` is the most recent job of the schedule's (site, sink) pair that
/// has not been removed by retention, whatever its status.
pub fn plan_job(
    schedule: &BackupSchedule,
    firing_index: u64,
    latest: Option<&BackupJob>,
) -> JobPlan {
    if is_cadence_full(schedule, firing_index) {
        debug!(schedule_id = %schedule.id, firing_index, "cadence selects full backup");
        return JobPlan::full();
    }

    match latest {
        None => {
            debug!(schedule_id = %schedule.id, firing_index, "no prior job, starting chain with full backup");
            JobPlan {
                kind: JobKind::Full,
                fallback: Some(ChainFallback::NoPriorJob),
            }
        }
        Some(parent) if parent.status != JobStatus::Completed => {
            warn!(
                schedule_id = %schedule.id,
                parent_id = %parent.id,
                parent_status = %parent.status,
                firing_index,
                "broken chain: promoting incremental firing to full"
            );
            JobPlan {
                kind: JobKind::Full,
                fallback: Some(ChainFallback::BrokenParent {
                    parent_id: parent.id.clone(),
                    status: parent.status,
                }),
            }
        }
        Some(parent) => JobPlan::incremental(parent.id.clone()),
    }
}

/// Walk the lineage of the newest live job back to its full root.
///
/// `jobs` holds the pair's jobs newest first. Returns oldest first. Stops
/// early if an ancestor is missing, so a chain whose root was pruned is
/// reported from its oldest surviving member.
pub fn assemble_chain(jobs: &[BackupJob]) -> Vec<BackupJob> {
    let Some(head) = jobs.iter().find(|j| j.is_live()) else {
        return Vec::new();
    };

    let by_id: HashMap<&JobId, &BackupJob> = jobs.iter().map(|j| (&j.id, j)).collect();
    let mut chain = vec![head.clone()];
    let mut cursor = head;
    while let Some(parent_id) = cursor.kind.parent() {
        match by_id.get(parent_id) {
            // Guard against a malformed cycle; lineage is acyclic by construction.
            Some(parent) if chain.len() <= jobs.len() => {
                chain.push((*parent).clone());
                cursor = parent;
            }
            _ => break,
        }
    }
    chain.reverse();
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Frequency, RetentionState, ScheduleTiming};
    use chrono::{Duration, Utc};
    use sitevault_core::types::{ScheduleId, SinkId, SiteId};

    fn schedule(backup_type: BackupType, every: Option<u32>) -> BackupSchedule {
        let now = Utc::now();
        BackupSchedule {
            id: ScheduleId::from("sched"),
            site_id: SiteId::from("site"),
            sink_id: SinkId::from("sink"),
            timing: ScheduleTiming {
                frequency: Frequency::Daily,
                day_of_week: None,
                hour_of_day: 2,
                minute_of_hour: 0,
            },
            backup_type,
            full_backup_frequency: every,
            retention_count: None,
            enabled: true,
            last_run: None,
            next_run: Some(now),
            firing_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn job(id: &str, n: u64, kind: JobKind, status: JobStatus) -> BackupJob {
        let base = Utc::now();
        BackupJob {
            id: JobId::from(id),
            schedule_id: ScheduleId::from("sched"),
            site_id: SiteId::from("site"),
            sink_id: SinkId::from("sink"),
            kind,
            status,
            firing_index: n,
            size: None,
            file_count: None,
            changed_files: None,
            location: None,
            error: None,
            retention: RetentionState::Retained,
            created_at: base + Duration::seconds(n as i64),
            started_at: None,
            completed_at: None,
            retention_error: None,
        }
    }

    /// Drive `firings` successful firings through the planner.
    fn simulate(s: &BackupSchedule, firings: u64) -> Vec<BackupType> {
        let mut latest: Option<BackupJob> = None;
        let mut types = Vec::new();
        for n in 1..=firings {
            let plan = plan_job(s, n, latest.as_ref());
            types.push(plan.kind.backup_type());
            latest = Some(job(&format!("j{n}"), n, plan.kind, JobStatus::Completed));
        }
        types
    }

    #[test]
    fn every_third_firing_is_full() {
        use BackupType::{Full, Incremental};
        let s = schedule(BackupType::Incremental, Some(3));
        assert_eq!(
            simulate(&s, 6),
            vec![Full, Incremental, Incremental, Full, Incremental, Incremental]
        );
    }

    #[test]
    fn incremental_without_cadence_only_first_is_full() {
        use BackupType::{Full, Incremental};
        let s = schedule(BackupType::Incremental, None);
        assert_eq!(simulate(&s, 4), vec![Full, Incremental, Incremental, Incremental]);
    }

    #[test]
    fn full_schedule_ignores_cadence() {
        let s = schedule(BackupType::Full, Some(2));
        assert!(simulate(&s, 5).iter().all(|t| *t == BackupType::Full));
    }

    #[test]
    fn incremental_chains_onto_latest_completed() {
        let s = schedule(BackupType::Incremental, None);
        let prev = job("j1", 1, JobKind::Full, JobStatus::Completed);
        let plan = plan_job(&s, 2, Some(&prev));
        assert_eq!(plan, JobPlan::incremental(JobId::from("j1")));
    }

    #[test]
    fn failed_parent_promotes_to_full() {
        let s = schedule(BackupType::Incremental, None);
        let prev = job("j2", 2, JobKind::Full, JobStatus::Failed);
        let plan = plan_job(&s, 3, Some(&prev));
        assert_eq!(plan.kind, JobKind::Full);
        assert_eq!(
            plan.fallback,
            Some(ChainFallback::BrokenParent {
                parent_id: JobId::from("j2"),
                status: JobStatus::Failed
            })
        );
    }

    #[test]
    fn in_progress_parent_promotes_to_full() {
        let s = schedule(BackupType::Incremental, Some(10));
        let prev = job("j4", 4, JobKind::Full, JobStatus::InProgress);
        assert_eq!(plan_job(&s, 5, Some(&prev)).kind, JobKind::Full);
    }

    #[test]
    fn no_prior_job_starts_with_full() {
        let s = schedule(BackupType::Incremental, Some(3));
        // Firing 2 is incremental by cadence but has nothing to chain onto.
        let plan = plan_job(&s, 2, None);
        assert_eq!(plan.kind, JobKind::Full);
        assert_eq!(plan.fallback, Some(ChainFallback::NoPriorJob));
    }

    #[test]
    fn chain_runs_from_root_to_head() {
        let root = job("a", 1, JobKind::Full, JobStatus::Completed);
        let mid = job(
            "b",
            2,
            JobKind::Incremental {
                parent_backup_id: JobId::from("a"),
            },
            JobStatus::Completed,
        );
        let head = job(
            "c",
            3,
            JobKind::Incremental {
                parent_backup_id: JobId::from("b"),
            },
            JobStatus::InProgress,
        );
        let failed = job("d", 4, JobKind::Full, JobStatus::Failed);
        let chain = assemble_chain(&[failed, head, mid, root]);
        let ids: Vec<_> = chain.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn empty_pair_has_empty_chain() {
        assert!(assemble_chain(&[]).is_empty());
    }
}
