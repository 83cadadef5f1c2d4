use chrono::{DateTime, Utc};
use rusqlite::{types::Type, Connection, Row};
use sitevault_core::types::parse_timestamp;

use crate::error::Result;
use crate::types::{
    BackupJob, BackupSchedule, JobKind, ScheduleTiming, SinkRef, Site,
};

/// Initialise the orchestration schema in `conn`.
///
/// Safe to call on every startup: uses `IF NOT EXISTS` throughout.
/// Timestamps are RFC 3339 text at fixed precision (see
/// `sitevault_core::types::format_timestamp`) so they compare lexically.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sites (
            id          TEXT    NOT NULL PRIMARY KEY,
            name        TEXT    NOT NULL,
            url         TEXT    NOT NULL,
            credential  TEXT    NOT NULL,
            created_at  TEXT    NOT NULL,
            updated_at  TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS sinks (
            id          TEXT    NOT NULL PRIMARY KEY,
            kind        TEXT    NOT NULL,
            credentials TEXT    NOT NULL,   -- opaque JSON
            quota_bytes INTEGER,
            created_at  TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS schedules (
            id                    TEXT    NOT NULL PRIMARY KEY,
            site_id               TEXT    NOT NULL REFERENCES sites(id) ON DELETE CASCADE,
            sink_id               TEXT    NOT NULL REFERENCES sinks(id) ON DELETE CASCADE,
            frequency             TEXT    NOT NULL,
            day_of_week           INTEGER,
            hour_of_day           INTEGER NOT NULL,
            minute_of_hour        INTEGER NOT NULL,
            backup_type           TEXT    NOT NULL,
            full_backup_frequency INTEGER,            -- NULL: declared type only
            retention_count       INTEGER,            -- NULL: keep everything
            enabled               INTEGER NOT NULL DEFAULT 1,
            last_run              TEXT,
            next_run              TEXT,               -- NULL only while disabled
            firing_count          INTEGER NOT NULL DEFAULT 0,
            created_at            TEXT    NOT NULL,
            updated_at            TEXT    NOT NULL
        ) STRICT;

        -- Efficient polling: SELECT … WHERE enabled = 1 AND next_run <= ?
        CREATE INDEX IF NOT EXISTS idx_schedules_due ON schedules (enabled, next_run);

        CREATE TABLE IF NOT EXISTS jobs (
            id               TEXT    NOT NULL PRIMARY KEY,
            seq              INTEGER NOT NULL UNIQUE,  -- creation order
            schedule_id      TEXT    NOT NULL REFERENCES schedules(id) ON DELETE CASCADE,
            site_id          TEXT    NOT NULL REFERENCES sites(id) ON DELETE CASCADE,
            sink_id          TEXT    NOT NULL REFERENCES sinks(id) ON DELETE CASCADE,
            type             TEXT    NOT NULL,
            parent_backup_id TEXT,                     -- may outlive its target after pruning
            status           TEXT    NOT NULL DEFAULT 'pending',
            firing_index     INTEGER NOT NULL,
            size             INTEGER,
            file_count       INTEGER,
            changed_files    INTEGER,
            location         TEXT,
            error            TEXT,                     -- producer failure only
            retention        TEXT    NOT NULL DEFAULT 'retained',
            retention_error  TEXT,                     -- sink refusal when orphaned
            created_at       TEXT    NOT NULL,
            started_at       TEXT,
            completed_at     TEXT
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_jobs_pair ON jobs (site_id, sink_id, seq);
        CREATE INDEX IF NOT EXISTS idx_jobs_schedule ON jobs (schedule_id, status);
        ",
    )?;

    // Databases created before retention errors had their own column.
    let has_retention_error: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM pragma_table_info('jobs') WHERE name = 'retention_error'",
        [],
        |row| row.get(0),
    )?;
    if !has_retention_error {
        conn.execute_batch("ALTER TABLE jobs ADD COLUMN retention_error TEXT;")?;
    }
    Ok(())
}

pub(crate) const SITE_COLUMNS: &str = "id, name, url, credential, created_at, updated_at";

pub(crate) const SINK_COLUMNS: &str = "id, kind, credentials, quota_bytes, created_at";

pub(crate) const SCHEDULE_COLUMNS: &str =
    "id, site_id, sink_id, frequency, day_of_week, hour_of_day, minute_of_hour,
     backup_type, full_backup_frequency, retention_count, enabled, last_run,
     next_run, firing_count, created_at, updated_at";

pub(crate) const JOB_COLUMNS: &str =
    "id, schedule_id, site_id, sink_id, type, parent_backup_id, status,
     firing_index, size, file_count, changed_files, location, error, retention,
     created_at, started_at, completed_at, retention_error";

/// Map a SQLite row (selected with [`SITE_COLUMNS`]) to a `Site`.
pub(crate) fn row_to_site(row: &Row<'_>) -> rusqlite::Result<Site> {
    Ok(Site {
        id: row.get::<_, String>(0)?.into(),
        name: row.get(1)?,
        url: row.get(2)?,
        credential: row.get(3)?,
        created_at: ts_col(row, 4)?,
        updated_at: ts_col(row, 5)?,
    })
}

pub(crate) fn row_to_sink(row: &Row<'_>) -> rusqlite::Result<SinkRef> {
    let raw: String = row.get(2)?;
    let credentials = serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
    Ok(SinkRef {
        id: row.get::<_, String>(0)?.into(),
        kind: text_col(row, 1)?,
        credentials,
        quota_bytes: row.get::<_, Option<i64>>(3)?.map(|v| v as u64),
        created_at: ts_col(row, 4)?,
    })
}

pub(crate) fn row_to_schedule(row: &Row<'_>) -> rusqlite::Result<BackupSchedule> {
    Ok(BackupSchedule {
        id: row.get::<_, String>(0)?.into(),
        site_id: row.get::<_, String>(1)?.into(),
        sink_id: row.get::<_, String>(2)?.into(),
        timing: ScheduleTiming {
            frequency: text_col(row, 3)?,
            day_of_week: row.get(4)?,
            hour_of_day: row.get(5)?,
            minute_of_hour: row.get(6)?,
        },
        backup_type: text_col(row, 7)?,
        full_backup_frequency: row.get(8)?,
        retention_count: row.get(9)?,
        enabled: row.get(10)?,
        last_run: opt_ts_col(row, 11)?,
        next_run: opt_ts_col(row, 12)?,
        firing_count: row.get::<_, i64>(13)? as u64,
        created_at: ts_col(row, 14)?,
        updated_at: ts_col(row, 15)?,
    })
}

pub(crate) fn row_to_job(row: &Row<'_>) -> rusqlite::Result<BackupJob> {
    let kind = match (row.get::<_, String>(4)?.as_str(), row.get::<_, Option<String>>(5)?) {
        ("full", _) => JobKind::Full,
        ("incremental", Some(parent)) => JobKind::Incremental {
            parent_backup_id: parent.into(),
        },
        (other, parent) => {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                4,
                Type::Text,
                format!("job type {other:?} with parent {parent:?}").into(),
            ))
        }
    };
    Ok(BackupJob {
        id: row.get::<_, String>(0)?.into(),
        schedule_id: row.get::<_, String>(1)?.into(),
        site_id: row.get::<_, String>(2)?.into(),
        sink_id: row.get::<_, String>(3)?.into(),
        kind,
        status: text_col(row, 6)?,
        firing_index: row.get::<_, i64>(7)? as u64,
        size: row.get::<_, Option<i64>>(8)?.map(|v| v as u64),
        file_count: row.get::<_, Option<i64>>(9)?.map(|v| v as u64),
        changed_files: row.get::<_, Option<i64>>(10)?.map(|v| v as u64),
        location: row.get(11)?,
        error: row.get(12)?,
        retention: text_col(row, 13)?,
        created_at: ts_col(row, 14)?,
        started_at: opt_ts_col(row, 15)?,
        completed_at: opt_ts_col(row, 16)?,
        retention_error: row.get(17)?,
    })
}

/// Parse a text column through the type's `FromStr`.
fn text_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => parse_timestamp(&raw)
            .map(Some)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('sites', 'sinks', 'schedules', 'jobs')",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(tables, 4);
    }

    #[test]
    fn adds_retention_error_to_older_job_tables() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE jobs (id TEXT NOT NULL PRIMARY KEY, retention TEXT NOT NULL) STRICT;",
        )
        .unwrap();
        init_db(&conn).unwrap();
        let cols: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM pragma_table_info('jobs') WHERE name = 'retention_error'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(cols, 1);
    }
}
