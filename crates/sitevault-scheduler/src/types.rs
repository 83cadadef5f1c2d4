use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sitevault_core::types::{JobId, ScheduleId, SinkId, SiteId};

use crate::chain::ChainFallback;

/// `as_str`, `Display` and `FromStr` over the snake_case column values.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!(concat!("unknown ", stringify!($name), ": {}"), other)),
                }
            }
        }
    };
}

/// How often a schedule fires. The four kinds are closed; there is no cron.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

text_enum!(Frequency {
    Hourly => "hourly",
    Daily => "daily",
    Weekly => "weekly",
    Monthly => "monthly",
});

/// Declared backup type of a schedule, and the flat type of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    Full,
    Incremental,
}

text_enum!(BackupType {
    Full => "full",
    Incremental => "incremental",
});

/// When a schedule fires (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleTiming {
    pub frequency: Frequency,
    /// 0 = Sunday … 6 = Saturday. Only read for `weekly`.
    #[serde(default)]
    pub day_of_week: Option<u8>,
    /// Ignored for `hourly`.
    #[serde(default)]
    pub hour_of_day: u8,
    #[serde(default)]
    pub minute_of_hour: u8,
}

/// Input for creating a schedule. Validated before it reaches the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSchedule {
    pub site_id: SiteId,
    pub sink_id: SinkId,
    #[serde(flatten)]
    pub timing: ScheduleTiming,
    pub backup_type: BackupType,
    /// Every Nth firing of an incremental schedule is promoted to full.
    #[serde(default)]
    pub full_backup_frequency: Option<u32>,
    /// `None` keeps every completed job.
    #[serde(default)]
    pub retention_count: Option<u32>,
    #[serde(default = "bool_true")]
    pub enabled: bool,
}

fn bool_true() -> bool {
    true
}

/// A persisted schedule row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSchedule {
    pub id: ScheduleId,
    pub site_id: SiteId,
    pub sink_id: SinkId,
    #[serde(flatten)]
    pub timing: ScheduleTiming,
    pub backup_type: BackupType,
    pub full_backup_frequency: Option<u32>,
    pub retention_count: Option<u32>,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    /// `None` only while the schedule is disabled.
    pub next_run: Option<DateTime<Utc>>,
    /// Number of jobs this schedule has created so far.
    pub firing_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle state of a backup job.
///
/// `pending → in_progress → {completed, failed}`, plus `pending → failed`
/// when the producer never starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

text_enum!(JobStatus {
    Pending => "pending",
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
});

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Retention bookkeeping, orthogonal to [`JobStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionState {
    Retained,
    /// Marked for deletion; the sink delete is in flight.
    Deleting,
    /// The sink refused the delete. Kept for operators, never retried.
    Orphaned,
}

text_enum!(RetentionState {
    Retained => "retained",
    Deleting => "deleting",
    Orphaned => "orphaned",
});

/// Job type with its lineage. An incremental job always names its parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    Full,
    Incremental { parent_backup_id: JobId },
}

impl JobKind {
    pub fn backup_type(&self) -> BackupType {
        match self {
            JobKind::Full => BackupType::Full,
            JobKind::Incremental { .. } => BackupType::Incremental,
        }
    }

    pub fn parent(&self) -> Option<&JobId> {
        match self {
            JobKind::Full => None,
            JobKind::Incremental { parent_backup_id } => Some(parent_backup_id),
        }
    }
}

/// A persisted job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupJob {
    pub id: JobId,
    pub schedule_id: ScheduleId,
    pub site_id: SiteId,
    pub sink_id: SinkId,
    #[serde(flatten)]
    pub kind: JobKind,
    pub status: JobStatus,
    /// Schedule firing that produced this job.
    pub firing_index: u64,
    pub size: Option<u64>,
    pub file_count: Option<u64>,
    pub changed_files: Option<u64>,
    /// Artifact location reported by the producer on completion.
    pub location: Option<String>,
    /// Producer failure message. Set only when `status` is `failed`.
    pub error: Option<String>,
    pub retention: RetentionState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Why the artifact could not be pruned. Set only when `orphaned`.
    pub retention_error: Option<String>,
}

impl BackupJob {
    /// Pending, in progress or completed, and not on its way out.
    pub fn is_live(&self) -> bool {
        self.status != JobStatus::Failed && self.retention == RetentionState::Retained
    }
}

/// A backup target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub id: SiteId,
    pub name: String,
    pub url: String,
    /// Shared secret with the site's agent: bearer token for backup requests
    /// and HMAC key for its callbacks. Never serialised outward.
    #[serde(skip_serializing, default)]
    pub credential: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Storage provider behind a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    Dropbox,
    S3,
    GoogleDrive,
    OneDrive,
    Ftp,
    Local,
    Github,
}

text_enum!(SinkKind {
    Dropbox => "dropbox",
    S3 => "s3",
    GoogleDrive => "google_drive",
    OneDrive => "one_drive",
    Ftp => "ftp",
    Local => "local",
    Github => "github",
});

/// A configured storage destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkRef {
    pub id: SinkId,
    #[serde(rename = "type")]
    pub kind: SinkKind,
    /// Provider-specific, opaque to the core.
    #[serde(skip_serializing, default)]
    pub credentials: serde_json::Value,
    pub quota_bytes: Option<u64>,
    pub created_at: DateTime<Utc>,
}

/// Producer callback or operator action applied to a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Started,
    Completed {
        size: u64,
        file_count: u64,
        changed_files: u64,
        #[serde(default)]
        location: Option<String>,
    },
    Failed {
        error: String,
    },
}

impl JobEvent {
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Started => "started",
            JobEvent::Completed { .. } => "completed",
            JobEvent::Failed { .. } => "failed",
        }
    }
}

/// Who asked for a job. Only scheduled firings move `last_run`/`next_run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Scheduled,
    Manual,
}

/// Why a firing produced no job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    PreviousJobNotTerminal { job_id: JobId },
    /// Scheduled firing of a schedule that is disabled or not yet due.
    NotDue,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::PreviousJobNotTerminal { .. } => f.write_str("previous job not terminal"),
            SkipReason::NotDue => f.write_str("schedule not due"),
        }
    }
}

/// Outcome of one schedule firing.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Firing {
    Created {
        job: BackupJob,
        /// Set when the chain could not be continued and the job was promoted to full.
        fallback: Option<ChainFallback>,
    },
    Skipped {
        #[serde(flatten)]
        reason: SkipReason,
    },
}
