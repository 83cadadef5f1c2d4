use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sitevault_core::types::{JobId, ScheduleId};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::store::BackupStore;
use crate::types::{Firing, Trigger};

/// What one scan did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub due: usize,
    pub created: Vec<JobId>,
    pub skipped: Vec<ScheduleId>,
    /// Schedules whose firing failed, with the error. They stay due and are
    /// retried on the next scan.
    pub failed: Vec<(ScheduleId, String)>,
}

/// Periodic driver: every `tick`, fire each enabled schedule whose `next_run`
/// has arrived.
pub struct SchedulerEngine {
    store: Arc<BackupStore>,
    tick: Duration,
}

impl SchedulerEngine {
    pub fn new(store: Arc<BackupStore>, tick: Duration) -> Self {
        Self { store, tick }
    }

    /// Main loop. Scans every `tick` until `shutdown` broadcasts `true`.
    ///
    /// A late scan fires an overdue schedule once, not once per missed slot:
    /// the next slot is always computed from the scan time.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(tick_secs = self.tick.as_secs(), "scheduler engine started");
        match self.store.initialize_next_runs(Utc::now()) {
            Ok(n) if n > 0 => warn!(count = n, "enabled schedules without next_run repaired"),
            Ok(_) => {}
            Err(e) => error!("next_run initialisation failed: {e}"),
        }
        match self.store.redispatch_pending() {
            Ok(n) if n > 0 => warn!(count = n, "pending jobs from a previous run redispatched"),
            Ok(_) => {}
            Err(e) => error!("pending job recovery failed: {e}"),
        }

        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.tick(Utc::now());
                    if report.due > 0 {
                        debug!(
                            due = report.due,
                            created = report.created.len(),
                            skipped = report.skipped.len(),
                            failed = report.failed.len(),
                            "scheduler tick"
                        );
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        info!("scheduler engine shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One scan at `now`. A failing schedule is logged and does not stop the
    /// others.
    pub fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let due = match self.store.list_due_schedules(now) {
            Ok(due) => due,
            Err(e) => {
                error!("due-schedule query failed: {e}");
                return TickReport::default();
            }
        };

        let mut report = TickReport {
            due: due.len(),
            ..Default::default()
        };
        for schedule in due {
            match self
                .store
                .create_job_for_schedule(&schedule.id, Trigger::Scheduled, now)
            {
                Ok(Firing::Created { job, .. }) => report.created.push(job.id),
                Ok(Firing::Skipped { .. }) => report.skipped.push(schedule.id),
                Err(e) => {
                    error!(schedule_id = %schedule.id, "schedule firing failed: {e}");
                    report.failed.push((schedule.id, e.to_string()));
                }
            }
        }
        report
    }
}
