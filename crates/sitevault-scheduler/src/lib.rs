//! `sitevault-scheduler`: backup schedule and chain orchestration with SQLite
//! persistence.
//!
//! # Overview
//!
//! Schedules are persisted to a SQLite `schedules` table. The
//! [`engine::SchedulerEngine`] scans it every tick and fires each enabled
//! schedule whose `next_run` has arrived. A firing either creates a `pending`
//! job (full or incremental, chained onto the newest job of the same site and
//! sink) or is skipped because the schedule's previous job is still open.
//! Created jobs are handed to a [`producer::BackupProducer`]; its callbacks
//! drive the job state machine. Each completion queues a retention pass that
//! prunes old backups through a [`sink::StorageSink`] without breaking any
//! surviving chain.
//!
//! # Frequencies
//!
//! | Frequency | Next slot                                      |
//! |-----------|------------------------------------------------|
//! | `hourly`  | `:MM` of the current or next hour              |
//! | `daily`   | `HH:MM` today or tomorrow                      |
//! | `weekly`  | `HH:MM` on the next matching weekday (0 = Sun) |
//! | `monthly` | `HH:MM` on the 1st of this or next month       |
//!
//! All times are UTC; a slot equal to "now" is never returned.

pub mod chain;
pub mod db;
pub mod engine;
pub mod error;
mod jobs;
pub mod producer;
pub mod retention;
pub mod schedule;
pub mod sink;
pub mod store;
pub mod types;

pub use chain::{ChainFallback, JobPlan};
pub use engine::{SchedulerEngine, TickReport};
pub use error::{Result, SchedulerError};
pub use producer::{run_dispatcher, BackupProducer, BackupRequest, ProducerError};
pub use retention::{run_retention_worker, RetentionPlan, RetentionReport};
pub use sink::{DefaultSinkResolver, LocalSink, SinkError, SinkResolver, StorageSink};
pub use store::BackupStore;
pub use types::{
    BackupJob, BackupSchedule, BackupType, Firing, Frequency, JobEvent, JobKind, JobStatus,
    NewSchedule, RetentionState, ScheduleTiming, SinkKind, SinkRef, Site, SkipReason, Trigger,
};
