use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sitevault_core::types::{format_timestamp, ScheduleId, SinkId, SiteId};
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use crate::db::{
    init_db, row_to_schedule, row_to_sink, row_to_site, SCHEDULE_COLUMNS, SINK_COLUMNS,
    SITE_COLUMNS,
};
use crate::error::{Result, SchedulerError};
use crate::schedule::{
    compute_next_run, full_frequency_is_inert, normalize_timing, validate_new_schedule,
};
use crate::types::{BackupJob, BackupSchedule, NewSchedule, SinkKind, SinkRef, Site};

/// Persistence for sites, sinks, schedules and jobs.
///
/// Wraps a single SQLite connection in a `Mutex`; every multi-statement
/// mutation runs inside an immediate transaction so job and schedule rows are
/// only ever changed by one writer at a time. Job lifecycle operations live in
/// `jobs.rs`, retention in `retention.rs`.
pub struct BackupStore {
    conn: Mutex<Connection>,
    /// Completed jobs push their schedule id here for the retention worker.
    retention_tx: Option<mpsc::Sender<ScheduleId>>,
    /// Newly created jobs are handed to the producer dispatcher here.
    dispatch_tx: Option<mpsc::Sender<BackupJob>>,
}

impl BackupStore {
    /// Enable foreign keys, initialise the schema, and wrap `conn`.
    pub fn new(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            retention_tx: None,
            dispatch_tx: None,
        })
    }

    /// Hand every created job to the producer dispatcher through `tx`.
    pub fn with_dispatch_queue(mut self, tx: mpsc::Sender<BackupJob>) -> Self {
        self.dispatch_tx = Some(tx);
        self
    }

    /// Queue retention enforcement through `tx` after every completion.
    pub fn with_retention_queue(mut self, tx: mpsc::Sender<ScheduleId>) -> Self {
        self.retention_tx = Some(tx);
        self
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave a half-applied
        // transaction behind (it rolls back on drop), so the data is usable.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn queue_retention(&self, schedule_id: &ScheduleId) {
        if let Some(ref tx) = self.retention_tx {
            // try_send never blocks a producer callback; enforcement catches up
            // on the next completion for the same pair.
            if tx.try_send(schedule_id.clone()).is_err() {
                warn!(schedule_id = %schedule_id, "retention queue full or closed, enforcement deferred");
            }
        }
    }

    /// Returns whether the job was queued.
    pub(crate) fn dispatch(&self, job: &BackupJob) -> bool {
        let Some(ref tx) = self.dispatch_tx else {
            return false;
        };
        if tx.try_send(job.clone()).is_err() {
            warn!(job_id = %job.id, "dispatch channel full or closed, job stays pending");
            return false;
        }
        true
    }

    // --- sites -------------------------------------------------------------

    #[instrument(skip(self, credential))]
    pub fn create_site(&self, name: &str, url: &str, credential: &str) -> Result<Site> {
        if name.trim().is_empty() {
            return Err(SchedulerError::Validation("site name must not be empty".into()));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(SchedulerError::Validation(format!(
                "site url must be http(s), got {url:?}"
            )));
        }
        validate_credential(credential)?;

        let id = SiteId::new();
        let now = format_timestamp(Utc::now());
        let conn = self.conn();
        conn.execute(
            "INSERT INTO sites (id, name, url, credential, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![id.as_str(), name, url.trim_end_matches('/'), credential, now],
        )?;
        info!(site_id = %id, %name, "site created");
        fetch_site(&conn, &id)
    }

    /// Replace the site's access credential. The only mutable site field.
    #[instrument(skip(self, credential), fields(site_id = %id))]
    pub fn rotate_site_credential(&self, id: &SiteId, credential: &str) -> Result<Site> {
        validate_credential(credential)?;
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE sites SET credential = ?1, updated_at = ?2 WHERE id = ?3",
            params![credential, format_timestamp(Utc::now()), id.as_str()],
        )?;
        if n == 0 {
            return Err(SchedulerError::SiteNotFound { id: id.to_string() });
        }
        info!("site credential rotated");
        fetch_site(&conn, id)
    }

    /// Delete a site together with its schedules and jobs.
    #[instrument(skip(self), fields(site_id = %id))]
    pub fn delete_site(&self, id: &SiteId) -> Result<()> {
        let n = self
            .conn()
            .execute("DELETE FROM sites WHERE id = ?1", [id.as_str()])?;
        if n == 0 {
            return Err(SchedulerError::SiteNotFound { id: id.to_string() });
        }
        info!("site deleted (schedules and jobs cascaded)");
        Ok(())
    }

    pub fn get_site(&self, id: &SiteId) -> Result<Site> {
        fetch_site(&self.conn(), id)
    }

    pub fn list_sites(&self) -> Result<Vec<Site>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SITE_COLUMNS} FROM sites ORDER BY created_at"
        ))?;
        let sites = stmt
            .query_map([], row_to_site)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sites)
    }

    // --- sinks -------------------------------------------------------------

    #[instrument(skip(self, credentials))]
    pub fn create_sink(
        &self,
        kind: SinkKind,
        credentials: serde_json::Value,
        quota_bytes: Option<u64>,
    ) -> Result<SinkRef> {
        if quota_bytes == Some(0) {
            return Err(SchedulerError::Validation(
                "quota_bytes must be positive when set".into(),
            ));
        }
        let id = SinkId::new();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO sinks (id, kind, credentials, quota_bytes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id.as_str(),
                kind.as_str(),
                serde_json::to_string(&credentials)?,
                quota_bytes.map(|q| q as i64),
                format_timestamp(Utc::now()),
            ],
        )?;
        info!(sink_id = %id, kind = %kind, "sink created");
        fetch_sink(&conn, &id)
    }

    /// Delete a sink together with the schedules and jobs that target it.
    #[instrument(skip(self), fields(sink_id = %id))]
    pub fn delete_sink(&self, id: &SinkId) -> Result<()> {
        let n = self
            .conn()
            .execute("DELETE FROM sinks WHERE id = ?1", [id.as_str()])?;
        if n == 0 {
            return Err(SchedulerError::SinkNotFound { id: id.to_string() });
        }
        info!("sink deleted (schedules and jobs cascaded)");
        Ok(())
    }

    pub fn get_sink(&self, id: &SinkId) -> Result<SinkRef> {
        fetch_sink(&self.conn(), id)
    }

    pub fn list_sinks(&self) -> Result<Vec<SinkRef>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SINK_COLUMNS} FROM sinks ORDER BY created_at"
        ))?;
        let sinks = stmt
            .query_map([], row_to_sink)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sinks)
    }

    // --- schedules ---------------------------------------------------------

    /// Validate and store a schedule. Enabled schedules get `next_run`
    /// computed from `now` immediately.
    #[instrument(skip(self, input), fields(site_id = %input.site_id, sink_id = %input.sink_id))]
    pub fn create_schedule(&self, input: NewSchedule, now: DateTime<Utc>) -> Result<BackupSchedule> {
        validate_new_schedule(&input)?;
        if full_frequency_is_inert(&input) {
            warn!(
                full_backup_frequency = ?input.full_backup_frequency,
                "full_backup_frequency has no effect on a full schedule"
            );
        }
        let timing = normalize_timing(input.timing);
        let next_run = if input.enabled {
            Some(format_timestamp(compute_next_run(&timing, now)?))
        } else {
            None
        };

        let conn = self.conn();
        fetch_site(&conn, &input.site_id)?;
        fetch_sink(&conn, &input.sink_id)?;

        let id = ScheduleId::new();
        let now_str = format_timestamp(now);
        conn.execute(
            "INSERT INTO schedules
             (id, site_id, sink_id, frequency, day_of_week, hour_of_day, minute_of_hour,
              backup_type, full_backup_frequency, retention_count, enabled, last_run,
              next_run, firing_count, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,NULL,?12,0,?13,?13)",
            params![
                id.as_str(),
                input.site_id.as_str(),
                input.sink_id.as_str(),
                timing.frequency.as_str(),
                timing.day_of_week,
                timing.hour_of_day,
                timing.minute_of_hour,
                input.backup_type.as_str(),
                input.full_backup_frequency,
                input.retention_count,
                input.enabled,
                next_run,
                now_str,
            ],
        )?;
        info!(schedule_id = %id, frequency = %timing.frequency, next_run = ?next_run, "schedule created");
        fetch_schedule(&conn, &id)
    }

    /// Toggle the `enabled` gate. Enabling computes a fresh `next_run` from
    /// `now`; disabling clears it.
    #[instrument(skip(self), fields(schedule_id = %id))]
    pub fn set_schedule_enabled(
        &self,
        id: &ScheduleId,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<BackupSchedule> {
        let conn = self.conn();
        let schedule = fetch_schedule(&conn, id)?;
        if schedule.enabled == enabled {
            return Ok(schedule);
        }
        let next_run = if enabled {
            Some(format_timestamp(compute_next_run(&schedule.timing, now)?))
        } else {
            None
        };
        conn.execute(
            "UPDATE schedules SET enabled = ?1, next_run = ?2, updated_at = ?3 WHERE id = ?4",
            params![enabled, next_run, format_timestamp(now), id.as_str()],
        )?;
        info!(enabled, next_run = ?next_run, "schedule toggled");
        fetch_schedule(&conn, id)
    }

    /// Delete a schedule and its job history.
    #[instrument(skip(self), fields(schedule_id = %id))]
    pub fn delete_schedule(&self, id: &ScheduleId) -> Result<()> {
        let n = self
            .conn()
            .execute("DELETE FROM schedules WHERE id = ?1", [id.as_str()])?;
        if n == 0 {
            return Err(SchedulerError::ScheduleNotFound { id: id.to_string() });
        }
        info!("schedule deleted");
        Ok(())
    }

    pub fn get_schedule(&self, id: &ScheduleId) -> Result<BackupSchedule> {
        fetch_schedule(&self.conn(), id)
    }

    pub fn list_schedules(&self) -> Result<Vec<BackupSchedule>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY created_at"
        ))?;
        let schedules = stmt
            .query_map([], row_to_schedule)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(schedules)
    }

    /// Enabled schedules whose `next_run` is at or before `now`, oldest first.
    pub fn list_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<BackupSchedule>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules
             WHERE enabled = 1 AND next_run IS NOT NULL AND next_run <= ?1
             ORDER BY next_run"
        ))?;
        let due = stmt
            .query_map([format_timestamp(now)], row_to_schedule)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(due)
    }

    /// Give every enabled schedule without a `next_run` one computed from `now`.
    ///
    /// Returns how many rows were repaired. Run once on engine startup.
    pub fn initialize_next_runs(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn();
        let missing: Vec<BackupSchedule> = {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE enabled = 1 AND next_run IS NULL"
            ))?;
            let rows = stmt
                .query_map([], row_to_schedule)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        let now_str = format_timestamp(now);
        for schedule in &missing {
            let next = format_timestamp(compute_next_run(&schedule.timing, now)?);
            conn.execute(
                "UPDATE schedules SET next_run = ?1, updated_at = ?2 WHERE id = ?3",
                params![next, now_str, schedule.id.as_str()],
            )?;
        }
        Ok(missing.len())
    }
}

fn validate_credential(credential: &str) -> Result<()> {
    if credential.trim().is_empty() {
        return Err(SchedulerError::Validation(
            "site credential must not be empty".into(),
        ));
    }
    Ok(())
}

pub(crate) fn fetch_site(conn: &Connection, id: &SiteId) -> Result<Site> {
    conn.query_row(
        &format!("SELECT {SITE_COLUMNS} FROM sites WHERE id = ?1"),
        [id.as_str()],
        row_to_site,
    )
    .optional()?
    .ok_or_else(|| SchedulerError::SiteNotFound { id: id.to_string() })
}

pub(crate) fn fetch_sink(conn: &Connection, id: &SinkId) -> Result<SinkRef> {
    conn.query_row(
        &format!("SELECT {SINK_COLUMNS} FROM sinks WHERE id = ?1"),
        [id.as_str()],
        row_to_sink,
    )
    .optional()?
    .ok_or_else(|| SchedulerError::SinkNotFound { id: id.to_string() })
}

pub(crate) fn fetch_schedule(conn: &Connection, id: &ScheduleId) -> Result<BackupSchedule> {
    conn.query_row(
        &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?1"),
        [id.as_str()],
        row_to_schedule,
    )
    .optional()?
    .ok_or_else(|| SchedulerError::ScheduleNotFound { id: id.to_string() })
}
