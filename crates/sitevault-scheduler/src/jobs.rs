//! Job creation and the job state machine.
//!
//! Every transition is a single `UPDATE … WHERE status = <expected>`, so two
//! racing callbacks resolve deterministically: the first writer wins and the
//! second sees zero changed rows and gets `InvalidTransition`.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use sitevault_core::types::{format_timestamp, JobId, ScheduleId, SinkId, SiteId};
use tracing::{debug, info, instrument, warn};

use crate::chain::{assemble_chain, plan_job, JobPlan};
use crate::db::{row_to_job, JOB_COLUMNS};
use crate::error::{Result, SchedulerError};
use crate::schedule::compute_next_run;
use crate::store::{fetch_schedule, fetch_sink, fetch_site, BackupStore};
use crate::types::{
    BackupJob, BackupSchedule, Firing, JobEvent, JobKind, JobStatus, RetentionState, SkipReason,
    Trigger,
};

impl BackupStore {
    /// Fire `schedule_id` once: skip if its previous job is still open,
    /// otherwise plan the chain position and create a pending job.
    ///
    /// A scheduled firing of a schedule that is disabled, or whose `next_run`
    /// is still ahead of `now`, is skipped as [`SkipReason::NotDue`] without
    /// touching anything.
    ///
    /// Scheduled firings also advance `last_run`/`next_run` (a skipped
    /// scheduled firing advances only `next_run`). Manual firings leave the
    /// timing columns alone. Everything happens in one immediate transaction
    /// together with the firing-counter increment.
    #[instrument(skip(self), fields(schedule_id = %schedule_id))]
    pub fn create_job_for_schedule(
        &self,
        schedule_id: &ScheduleId,
        trigger: Trigger,
        now: DateTime<Utc>,
    ) -> Result<Firing> {
        let (firing, created) = {
            let mut conn = self.conn();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let schedule = fetch_schedule(&tx, schedule_id)?;
            let now_str = format_timestamp(now);

            // The schedule may have been disabled or fired since it was listed.
            if trigger == Trigger::Scheduled
                && !(schedule.enabled && schedule.next_run.is_some_and(|next| next <= now))
            {
                debug!(
                    enabled = schedule.enabled,
                    next_run = ?schedule.next_run,
                    "scheduled firing dropped: schedule not due"
                );
                return Ok(Firing::Skipped {
                    reason: SkipReason::NotDue,
                });
            }

            let next_run = match trigger {
                Trigger::Scheduled => {
                    Some(format_timestamp(compute_next_run(&schedule.timing, now)?))
                }
                Trigger::Manual => None,
            };

            if let Some(open) = open_job_for_schedule(&tx, schedule_id)? {
                if let Some(ref next) = next_run {
                    tx.execute(
                        "UPDATE schedules SET next_run = ?1, updated_at = ?2 WHERE id = ?3",
                        params![next, now_str, schedule_id.as_str()],
                    )?;
                }
                tx.commit()?;
                info!(open_job = %open, next_run = ?next_run, "firing skipped: previous job not terminal");
                return Ok(Firing::Skipped {
                    reason: SkipReason::PreviousJobNotTerminal { job_id: open },
                });
            }

            let firing_index = schedule.firing_count + 1;
            let latest = latest_pair_job(&tx, &schedule.site_id, &schedule.sink_id)?;
            let plan = plan_job(&schedule, firing_index, latest.as_ref());
            let job = insert_job(&tx, &schedule, &plan.kind, firing_index, now)?;

            match next_run {
                Some(next) => tx.execute(
                    "UPDATE schedules SET firing_count = ?1, last_run = ?2, next_run = ?3,
                      updated_at = ?2
                     WHERE id = ?4",
                    params![firing_index as i64, now_str, next, schedule_id.as_str()],
                )?,
                None => tx.execute(
                    "UPDATE schedules SET firing_count = ?1, updated_at = ?2 WHERE id = ?3",
                    params![firing_index as i64, now_str, schedule_id.as_str()],
                )?,
            };
            tx.commit()?;

            info!(
                job_id = %job.id,
                firing_index,
                job_type = %job.kind.backup_type(),
                parent = ?job.kind.parent(),
                "backup job created"
            );
            let firing = Firing::Created {
                job: job.clone(),
                fallback: plan.fallback,
            };
            (firing, job)
        };

        self.dispatch(&created);
        Ok(firing)
    }

    /// Create a pending job for `schedule_id` from an explicit plan.
    ///
    /// Enforces the lineage invariant: an incremental parent must be a
    /// completed, retained job of the same (site, sink) pair. Does not apply
    /// the one-open-job rule; use [`create_job_for_schedule`] for firings.
    ///
    /// [`create_job_for_schedule`]: BackupStore::create_job_for_schedule
    #[instrument(skip(self, plan), fields(schedule_id = %schedule_id))]
    pub fn create_job(
        &self,
        schedule_id: &ScheduleId,
        plan: &JobPlan,
        now: DateTime<Utc>,
    ) -> Result<BackupJob> {
        let job = {
            let mut conn = self.conn();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let schedule = fetch_schedule(&tx, schedule_id)?;
            if let Some(parent_id) = plan.kind.parent() {
                check_parent(&tx, parent_id, &schedule)?;
            }
            let firing_index = schedule.firing_count + 1;
            let job = insert_job(&tx, &schedule, &plan.kind, firing_index, now)?;
            tx.execute(
                "UPDATE schedules SET firing_count = ?1, updated_at = ?2 WHERE id = ?3",
                params![firing_index as i64, format_timestamp(now), schedule_id.as_str()],
            )?;
            tx.commit()?;
            job
        };
        info!(job_id = %job.id, job_type = %job.kind.backup_type(), "backup job created");
        self.dispatch(&job);
        Ok(job)
    }

    /// `pending → in_progress`.
    pub fn mark_started(&self, id: &JobId) -> Result<BackupJob> {
        self.transition(id, JobEvent::Started)
    }

    /// `in_progress → completed`; queues retention for the job's schedule.
    pub fn mark_completed(
        &self,
        id: &JobId,
        size: u64,
        file_count: u64,
        changed_files: u64,
        location: Option<String>,
    ) -> Result<BackupJob> {
        self.transition(
            id,
            JobEvent::Completed {
                size,
                file_count,
                changed_files,
                location,
            },
        )
    }

    /// `pending | in_progress → failed`. Terminal; nothing retries it.
    pub fn mark_failed(&self, id: &JobId, error: &str) -> Result<BackupJob> {
        self.transition(
            id,
            JobEvent::Failed {
                error: error.to_string(),
            },
        )
    }

    /// Apply `event` to job `id` as an atomic compare-and-set on `status`.
    #[instrument(skip(self, event), fields(job_id = %id, event = event.name()))]
    pub fn transition(&self, id: &JobId, event: JobEvent) -> Result<BackupJob> {
        let now = format_timestamp(Utc::now());
        let job = {
            let conn = self.conn();
            let changed = match &event {
                JobEvent::Started => conn.execute(
                    "UPDATE jobs SET status = 'in_progress', started_at = ?1
                     WHERE id = ?2 AND status = 'pending'",
                    params![now, id.as_str()],
                )?,
                JobEvent::Completed {
                    size,
                    file_count,
                    changed_files,
                    location,
                } => conn.execute(
                    "UPDATE jobs SET status = 'completed', size = ?1, file_count = ?2,
                      changed_files = ?3, location = ?4, completed_at = ?5
                     WHERE id = ?6 AND status = 'in_progress'",
                    params![
                        *size as i64,
                        *file_count as i64,
                        *changed_files as i64,
                        location,
                        now,
                        id.as_str()
                    ],
                )?,
                JobEvent::Failed { error } => conn.execute(
                    "UPDATE jobs SET status = 'failed', error = ?1, completed_at = ?2
                     WHERE id = ?3 AND status IN ('pending', 'in_progress')",
                    params![error, now, id.as_str()],
                )?,
            };

            let job = fetch_job(&conn, id)?;
            if changed == 0 {
                return Err(SchedulerError::InvalidTransition {
                    job_id: id.to_string(),
                    from: job.status,
                    event: event.name(),
                });
            }
            job
        };

        match &event {
            JobEvent::Started => info!("backup started"),
            JobEvent::Completed { size, .. } => {
                info!(size, "backup completed");
                self.queue_retention(&job.schedule_id);
            }
            JobEvent::Failed { error } => warn!(%error, "backup failed"),
        }
        Ok(job)
    }

    /// Queue every `pending` job for the dispatcher again.
    ///
    /// The dispatch queue only lives in memory, so jobs created before a
    /// restart would otherwise never reach a producer and would keep their
    /// schedule skipping forever. Returns how many jobs were queued. Run once
    /// on engine startup.
    pub fn redispatch_pending(&self) -> Result<usize> {
        let pending = {
            let conn = self.conn();
            let mut stmt = conn.prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'pending' ORDER BY seq"
            ))?;
            let rows = stmt
                .query_map([], row_to_job)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        Ok(pending.iter().filter(|job| self.dispatch(job)).count())
    }

    pub fn get_job(&self, id: &JobId) -> Result<BackupJob> {
        fetch_job(&self.conn(), id)
    }

    /// Jobs created by `schedule_id`, newest first.
    pub fn list_jobs(&self, schedule_id: &ScheduleId) -> Result<Vec<BackupJob>> {
        let conn = self.conn();
        fetch_schedule(&conn, schedule_id)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE schedule_id = ?1 ORDER BY seq DESC"
        ))?;
        let jobs = stmt
            .query_map([schedule_id.as_str()], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// The chain of the (site, sink) pair from its oldest surviving full
    /// ancestor to the newest live job.
    pub fn get_chain(&self, site_id: &SiteId, sink_id: &SinkId) -> Result<Vec<BackupJob>> {
        let conn = self.conn();
        fetch_site(&conn, site_id)?;
        fetch_sink(&conn, sink_id)?;
        let jobs = pair_jobs(&conn, site_id, sink_id)?;
        Ok(assemble_chain(&jobs))
    }
}

pub(crate) fn fetch_job(conn: &Connection, id: &JobId) -> Result<BackupJob> {
    conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
        [id.as_str()],
        row_to_job,
    )
    .optional()?
    .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })
}

/// Every job of the pair, newest first.
pub(crate) fn pair_jobs(
    conn: &Connection,
    site_id: &SiteId,
    sink_id: &SinkId,
) -> Result<Vec<BackupJob>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {JOB_COLUMNS} FROM jobs WHERE site_id = ?1 AND sink_id = ?2 ORDER BY seq DESC"
    ))?;
    let jobs = stmt
        .query_map([site_id.as_str(), sink_id.as_str()], row_to_job)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(jobs)
}

/// Newest pending/in-progress job of the schedule, if any.
fn open_job_for_schedule(conn: &Connection, schedule_id: &ScheduleId) -> Result<Option<JobId>> {
    let id = conn
        .query_row(
            "SELECT id FROM jobs
             WHERE schedule_id = ?1 AND status IN ('pending', 'in_progress')
             ORDER BY seq DESC LIMIT 1",
            [schedule_id.as_str()],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(id.map(JobId::from))
}

/// Newest job of the pair that retention has not touched, whatever its status.
fn latest_pair_job(
    conn: &Connection,
    site_id: &SiteId,
    sink_id: &SinkId,
) -> Result<Option<BackupJob>> {
    let job = conn
        .query_row(
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE site_id = ?1 AND sink_id = ?2 AND retention = 'retained'
                 ORDER BY seq DESC LIMIT 1"
            ),
            [site_id.as_str(), sink_id.as_str()],
            row_to_job,
        )
        .optional()?;
    Ok(job)
}

fn check_parent(conn: &Connection, parent_id: &JobId, schedule: &BackupSchedule) -> Result<()> {
    let invalid = |reason: String| SchedulerError::InvalidParent {
        parent_id: parent_id.to_string(),
        reason,
    };
    let parent = match fetch_job(conn, parent_id) {
        Ok(job) => job,
        Err(SchedulerError::JobNotFound { .. }) => return Err(invalid("no such job".into())),
        Err(e) => return Err(e),
    };
    if parent.status != JobStatus::Completed {
        return Err(invalid(format!("parent is {}, not completed", parent.status)));
    }
    if parent.site_id != schedule.site_id || parent.sink_id != schedule.sink_id {
        return Err(invalid("parent belongs to another (site, sink) pair".into()));
    }
    if parent.retention != RetentionState::Retained {
        return Err(invalid(format!("parent is {}", parent.retention)));
    }
    Ok(())
}

fn insert_job(
    conn: &Connection,
    schedule: &BackupSchedule,
    kind: &JobKind,
    firing_index: u64,
    now: DateTime<Utc>,
) -> Result<BackupJob> {
    let id = JobId::new();
    conn.execute(
        "INSERT INTO jobs
         (id, seq, schedule_id, site_id, sink_id, type, parent_backup_id, status,
          firing_index, retention, created_at)
         VALUES (?1, (SELECT COALESCE(MAX(seq), 0) + 1 FROM jobs), ?2, ?3, ?4, ?5, ?6,
                 'pending', ?7, 'retained', ?8)",
        params![
            id.as_str(),
            schedule.id.as_str(),
            schedule.site_id.as_str(),
            schedule.sink_id.as_str(),
            kind.backup_type().as_str(),
            kind.parent().map(|p| p.as_str()),
            firing_index as i64,
            format_timestamp(now),
        ],
    )?;
    fetch_job(conn, &id)
}
