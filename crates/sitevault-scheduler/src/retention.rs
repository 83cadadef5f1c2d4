//! Retention: keep the newest N completed backups per schedule without ever
//! deleting an ancestor of a job that is still kept or still running.

use std::collections::HashSet;
use std::sync::Arc;

use rusqlite::{params, TransactionBehavior};
use serde::Serialize;
use sitevault_core::types::{JobId, ScheduleId};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::error::Result;
use crate::jobs::pair_jobs;
use crate::sink::SinkResolver;
use crate::store::{fetch_schedule, fetch_sink, BackupStore};
use crate::types::{BackupJob, JobStatus, RetentionState};

/// Which completed jobs of a pair may go, and which were spared as ancestors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionPlan {
    /// Newest first.
    pub delete: Vec<JobId>,
    /// Beyond the keep window but still referenced by a surviving job.
    pub protected: Vec<JobId>,
}

/// Outcome of one enforcement pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetentionReport {
    pub deleted: Vec<JobId>,
    pub protected: Vec<JobId>,
    /// Jobs that could not be pruned, with the reason.
    pub orphaned: Vec<(JobId, String)>,
}

/// Choose which completed jobs to delete so that `keep` remain.
///
/// `jobs` is every job of the (site, sink) pair, newest first. Completed,
/// retained jobs are ranked by `started_at` (newest first, ties by creation
/// order); those past position `keep` are candidates. A candidate that is the
/// parent of any surviving live job (pending, in progress or completed, and
/// not itself a candidate) is protected, transitively, so a kept incremental
/// never loses part of its lineage.
pub fn select_for_deletion(jobs: &[BackupJob], keep: u32) -> RetentionPlan {
    let mut completed: Vec<&BackupJob> = jobs
        .iter()
        .filter(|j| j.status == JobStatus::Completed && j.retention == RetentionState::Retained)
        .collect();
    // Stable sort: equal start times keep the caller's newest-first order.
    completed.sort_by(|a, b| {
        let ka = a.started_at.unwrap_or(a.created_at);
        let kb = b.started_at.unwrap_or(b.created_at);
        kb.cmp(&ka)
    });

    let mut candidates: HashSet<&JobId> = completed
        .iter()
        .skip(keep as usize)
        .map(|j| &j.id)
        .collect();
    if candidates.is_empty() {
        return RetentionPlan::default();
    }

    let mut protected = Vec::new();
    loop {
        let mut changed = false;
        let survivors: Vec<&BackupJob> = jobs
            .iter()
            .filter(|j| j.is_live() && !candidates.contains(&j.id))
            .collect();
        for job in survivors {
            if let Some(parent) = job.kind.parent() {
                if candidates.remove(parent) {
                    protected.push(parent.clone());
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }

    RetentionPlan {
        delete: completed
            .iter()
            .filter(|j| candidates.contains(&j.id))
            .map(|j| j.id.clone())
            .collect(),
        protected,
    }
}

impl BackupStore {
    /// Apply the retention policy of `schedule_id` to its (site, sink) pair.
    ///
    /// Selected jobs are first marked `deleting` under the lock, so a
    /// concurrent pass or chain planning never sees them as retained. The sink
    /// deletes run without the lock; each success removes the row and each
    /// failure marks it `orphaned` with the reason in `retention_error`.
    /// Re-running over an unchanged pair deletes nothing.
    #[instrument(skip(self, resolver), fields(schedule_id = %schedule_id))]
    pub async fn enforce_retention(
        &self,
        schedule_id: &ScheduleId,
        resolver: &dyn SinkResolver,
    ) -> Result<RetentionReport> {
        let (plan, targets, sink) = {
            let mut conn = self.conn();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let schedule = fetch_schedule(&tx, schedule_id)?;
            let Some(keep) = schedule.retention_count else {
                debug!("no retention count, keeping everything");
                return Ok(RetentionReport::default());
            };
            let jobs = pair_jobs(&tx, &schedule.site_id, &schedule.sink_id)?;
            let plan = select_for_deletion(&jobs, keep);
            if plan.delete.is_empty() {
                return Ok(RetentionReport {
                    protected: plan.protected,
                    ..Default::default()
                });
            }

            let mut targets: Vec<BackupJob> = Vec::with_capacity(plan.delete.len());
            for id in &plan.delete {
                let n = tx.execute(
                    "UPDATE jobs SET retention = 'deleting'
                     WHERE id = ?1 AND status = 'completed' AND retention = 'retained'",
                    [id.as_str()],
                )?;
                if n == 1 {
                    if let Some(job) = jobs.iter().find(|j| &j.id == id) {
                        targets.push(job.clone());
                    }
                }
            }
            let sink = fetch_sink(&tx, &schedule.sink_id)?;
            tx.commit()?;
            (plan, targets, sink)
        };

        info!(
            pruning = plan.delete.len(),
            protected = plan.protected.len(),
            sink_id = %sink.id,
            "retention pruning jobs"
        );
        let storage = resolver.resolve(&sink);
        let mut report = RetentionReport {
            protected: plan.protected,
            ..Default::default()
        };

        // Settle each target on its own; a failed row update must not strand
        // the rest in `deleting`.
        for job in targets {
            let outcome = match job.location.as_deref() {
                Some(location) => storage.delete(location).await.map_err(|e| e.to_string()),
                None => Ok(()),
            };
            let outcome = match outcome {
                Ok(()) => self
                    .conn()
                    .execute(
                        "DELETE FROM jobs WHERE id = ?1 AND retention = 'deleting'",
                        [job.id.as_str()],
                    )
                    .map(|_| ())
                    .map_err(|e| format!("artifact deleted but row removal failed: {e}")),
                Err(message) => Err(message),
            };
            match outcome {
                Ok(()) => {
                    debug!(job_id = %job.id, "job pruned");
                    report.deleted.push(job.id);
                }
                Err(message) => {
                    if let Err(e) = self.mark_orphaned(&job.id, &message) {
                        error!(job_id = %job.id, "could not record orphaned job: {e}");
                    }
                    warn!(job_id = %job.id, error = %message, "job orphaned");
                    report.orphaned.push((job.id, message));
                }
            }
        }

        info!(
            deleted = report.deleted.len(),
            orphaned = report.orphaned.len(),
            "retention pass finished"
        );
        Ok(report)
    }

    /// Mark every job left `deleting` by an interrupted pass as `orphaned`.
    ///
    /// Whether the sink delete happened is unknown, so the row is kept for an
    /// operator. Returns how many rows were recovered. Run once on startup,
    /// before any pass.
    pub fn recover_interrupted_retention(&self) -> Result<usize> {
        let n = self.conn().execute(
            "UPDATE jobs SET retention = 'orphaned',
               retention_error = 'retention pass interrupted before the delete was confirmed'
             WHERE retention = 'deleting'",
            [],
        )?;
        Ok(n)
    }

    fn mark_orphaned(&self, id: &JobId, message: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE jobs SET retention = 'orphaned', retention_error = ?1
             WHERE id = ?2 AND retention = 'deleting'",
            params![message, id.as_str()],
        )?;
        Ok(())
    }
}

/// Drain retention requests queued by job completions until `shutdown`.
///
/// Requests are handled one at a time, so two passes over the same pair never
/// overlap inside this process.
pub async fn run_retention_worker(
    store: Arc<BackupStore>,
    resolver: Arc<dyn SinkResolver>,
    mut rx: mpsc::Receiver<ScheduleId>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("retention worker started");
    match store.recover_interrupted_retention() {
        Ok(n) if n > 0 => warn!(count = n, "interrupted retention jobs marked orphaned"),
        Ok(_) => {}
        Err(e) => error!("retention recovery failed: {e}"),
    }
    loop {
        tokio::select! {
            next = rx.recv() => {
                let Some(schedule_id) = next else {
                    info!("retention queue closed");
                    break;
                };
                match store.enforce_retention(&schedule_id, resolver.as_ref()).await {
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => {
                        debug!(schedule_id = %schedule_id, "schedule gone before retention ran");
                    }
                    Err(e) => error!(schedule_id = %schedule_id, "retention failed: {e}"),
                }
            }
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    info!("retention worker shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    use crate::types::JobKind;

    fn job(n: u32, kind: JobKind, status: JobStatus) -> BackupJob {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let at = t0 + Duration::hours(n as i64);
        BackupJob {
            id: format!("j{n}").into(),
            schedule_id: "sch".into(),
            site_id: "s".into(),
            sink_id: "k".into(),
            kind,
            status,
            firing_index: n as u64,
            size: None,
            file_count: None,
            changed_files: None,
            location: Some(format!("j{n}.zip")),
            error: None,
            retention: RetentionState::Retained,
            created_at: at,
            started_at: Some(at),
            completed_at: None,
            retention_error: None,
        }
    }

    fn inc(parent: u32) -> JobKind {
        JobKind::Incremental {
            parent_backup_id: format!("j{parent}").into(),
        }
    }

    fn ids(v: &[JobId]) -> Vec<&str> {
        v.iter().map(|j| j.as_str()).collect()
    }

    #[test]
    fn keeps_ancestor_of_newest_job() {
        // By recency: #1 = j5 (parent j3), #2 = j4, #3 = j3, #4 = j2, #5 = j1.
        let jobs = vec![
            job(5, inc(3), JobStatus::Completed),
            job(4, JobKind::Full, JobStatus::Completed),
            job(3, JobKind::Full, JobStatus::Completed),
            job(2, JobKind::Full, JobStatus::Completed),
            job(1, JobKind::Full, JobStatus::Completed),
        ];
        let plan = select_for_deletion(&jobs, 2);
        assert_eq!(ids(&plan.delete), vec!["j2", "j1"]);
        assert_eq!(ids(&plan.protected), vec!["j3"]);
    }

    #[test]
    fn protection_is_transitive() {
        // j4 -> j3 -> j2 -> j1 (full). Keeping one keeps the whole chain.
        let jobs = vec![
            job(4, inc(3), JobStatus::Completed),
            job(3, inc(2), JobStatus::Completed),
            job(2, inc(1), JobStatus::Completed),
            job(1, JobKind::Full, JobStatus::Completed),
        ];
        let plan = select_for_deletion(&jobs, 1);
        assert!(plan.delete.is_empty());
        assert_eq!(plan.protected.len(), 3);
    }

    #[test]
    fn in_progress_job_protects_its_parent() {
        let jobs = vec![
            job(3, inc(1), JobStatus::InProgress),
            job(2, JobKind::Full, JobStatus::Completed),
            job(1, JobKind::Full, JobStatus::Completed),
        ];
        let plan = select_for_deletion(&jobs, 1);
        assert!(plan.delete.is_empty());
        assert_eq!(ids(&plan.protected), vec!["j1"]);
    }

    #[test]
    fn failed_job_does_not_protect() {
        let jobs = vec![
            job(3, inc(1), JobStatus::Failed),
            job(2, JobKind::Full, JobStatus::Completed),
            job(1, JobKind::Full, JobStatus::Completed),
        ];
        let plan = select_for_deletion(&jobs, 1);
        assert_eq!(ids(&plan.delete), vec!["j1"]);
    }

    #[test]
    fn within_window_deletes_nothing() {
        let jobs = vec![
            job(2, inc(1), JobStatus::Completed),
            job(1, JobKind::Full, JobStatus::Completed),
        ];
        assert_eq!(select_for_deletion(&jobs, 2), RetentionPlan::default());
        assert_eq!(select_for_deletion(&jobs, 5), RetentionPlan::default());
    }

    #[test]
    fn ranks_by_start_time_not_input_order() {
        let mut late = job(1, JobKind::Full, JobStatus::Completed);
        late.started_at = Some(late.created_at + Duration::days(1));
        let jobs = vec![job(2, JobKind::Full, JobStatus::Completed), late];
        let plan = select_for_deletion(&jobs, 1);
        assert_eq!(ids(&plan.delete), vec!["j2"]);
    }

    #[test]
    fn applying_the_plan_is_idempotent() {
        let jobs = vec![
            job(5, inc(3), JobStatus::Completed),
            job(4, JobKind::Full, JobStatus::Completed),
            job(3, JobKind::Full, JobStatus::Completed),
            job(2, JobKind::Full, JobStatus::Completed),
            job(1, JobKind::Full, JobStatus::Completed),
        ];
        let plan = select_for_deletion(&jobs, 2);
        let survivors: Vec<BackupJob> = jobs
            .into_iter()
            .filter(|j| !plan.delete.contains(&j.id))
            .collect();
        assert!(select_for_deletion(&survivors, 2).delete.is_empty());
    }

    mod store {
        use super::super::*;
        use chrono::Utc;
        use rusqlite::Connection;

        use crate::chain::JobPlan;
        use crate::sink::DefaultSinkResolver;
        use crate::types::{BackupType, Frequency, NewSchedule, ScheduleTiming, SinkKind};

        fn local_store(root: &std::path::Path) -> (BackupStore, ScheduleId) {
            let store = BackupStore::new(Connection::open_in_memory().unwrap()).unwrap();
            let site = store.create_site("shop", "https://shop.example.com", "k").unwrap();
            let sink = store
                .create_sink(
                    SinkKind::Local,
                    serde_json::json!({"root": root.to_str().unwrap()}),
                    None,
                )
                .unwrap();
            let schedule = store
                .create_schedule(
                    NewSchedule {
                        site_id: site.id,
                        sink_id: sink.id,
                        timing: ScheduleTiming {
                            frequency: Frequency::Daily,
                            day_of_week: None,
                            hour_of_day: 1,
                            minute_of_hour: 0,
                        },
                        backup_type: BackupType::Full,
                        full_backup_frequency: None,
                        retention_count: Some(1),
                        enabled: true,
                    },
                    Utc::now(),
                )
                .unwrap();
            (store, schedule.id)
        }

        fn completed(store: &BackupStore, schedule_id: &ScheduleId, root: &std::path::Path) -> JobId {
            let job = store.create_job(schedule_id, &JobPlan::full(), Utc::now()).unwrap();
            let location = format!("{}.zip", job.id);
            std::fs::write(root.join(&location), b"x").unwrap();
            store.mark_started(&job.id).unwrap();
            store.mark_completed(&job.id, 1, 1, 1, Some(location)).unwrap();
            job.id
        }

        fn deleting_count(store: &BackupStore) -> i64 {
            store
                .conn()
                .query_row("SELECT COUNT(*) FROM jobs WHERE retention = 'deleting'", [], |r| {
                    r.get(0)
                })
                .unwrap()
        }

        #[tokio::test]
        async fn failed_row_removal_orphans_and_keeps_going() {
            let dir = tempfile::tempdir().unwrap();
            let (store, schedule_id) = local_store(dir.path());
            let oldest = completed(&store, &schedule_id, dir.path());
            let older = completed(&store, &schedule_id, dir.path());
            let newest = completed(&store, &schedule_id, dir.path());

            store
                .conn()
                .execute_batch(&format!(
                    "CREATE TEMP TRIGGER keep_row BEFORE DELETE ON jobs
                     WHEN OLD.id = '{older}'
                     BEGIN SELECT RAISE(ABORT, 'row locked'); END;"
                ))
                .unwrap();

            let report = store
                .enforce_retention(&schedule_id, &DefaultSinkResolver)
                .await
                .unwrap();
            assert_eq!(report.deleted, vec![oldest.clone()]);
            assert_eq!(report.orphaned.len(), 1);
            assert_eq!(report.orphaned[0].0, older);
            assert!(report.orphaned[0].1.contains("row removal failed"));

            let stuck = store.get_job(&older).unwrap();
            assert_eq!(stuck.retention, RetentionState::Orphaned);
            assert_eq!(stuck.error, None);
            assert!(stuck.retention_error.is_some());
            assert_eq!(deleting_count(&store), 0);
            assert!(store.get_job(&newest).is_ok());
        }

        #[test]
        fn interrupted_pass_is_recovered_as_orphaned() {
            let dir = tempfile::tempdir().unwrap();
            let (store, schedule_id) = local_store(dir.path());
            let stale = completed(&store, &schedule_id, dir.path());
            let kept = completed(&store, &schedule_id, dir.path());
            store
                .conn()
                .execute(
                    "UPDATE jobs SET retention = 'deleting' WHERE id = ?1",
                    [stale.as_str()],
                )
                .unwrap();

            assert_eq!(store.recover_interrupted_retention().unwrap(), 1);
            assert_eq!(store.recover_interrupted_retention().unwrap(), 0);
            let job = store.get_job(&stale).unwrap();
            assert_eq!(job.retention, RetentionState::Orphaned);
            assert!(job.retention_error.is_some());
            assert_eq!(
                store.get_job(&kept).unwrap().retention,
                RetentionState::Retained
            );
        }
    }
}
