// Retention enforcement against a real local sink directory.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use rusqlite::Connection;
use sitevault_scheduler::{
    run_retention_worker, BackupJob, BackupSchedule, BackupStore, BackupType, DefaultSinkResolver,
    Frequency, JobPlan, JobStatus, NewSchedule, RetentionState, ScheduleTiming, SinkKind,
};
use tokio::sync::{mpsc, watch};

fn setup(sink_kind: SinkKind, root: &Path, keep: Option<u32>) -> (BackupStore, BackupSchedule) {
    setup_with(
        BackupStore::new(Connection::open_in_memory().unwrap()).unwrap(),
        sink_kind,
        root,
        keep,
    )
}

fn setup_with(
    store: BackupStore,
    sink_kind: SinkKind,
    root: &Path,
    keep: Option<u32>,
) -> (BackupStore, BackupSchedule) {
    let site = store
        .create_site("shop", "https://shop.example.com", "secret")
        .unwrap();
    let sink = store
        .create_sink(
            sink_kind,
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
                    frequency: Frequency::Weekly,
                    day_of_week: Some(1),
                    hour_of_day: 2,
                    minute_of_hour: 0,
                },
                backup_type: BackupType::Incremental,
                full_backup_frequency: None,
                retention_count: keep,
                enabled: true,
            },
            Utc.with_ymd_and_hms(2026, 10, 21, 10, 0, 0).unwrap(),
        )
        .unwrap();
    (store, schedule)
}

/// Create, run and complete one job from `plan`, writing its artifact.
fn run(store: &BackupStore, s: &BackupSchedule, root: &Path, plan: JobPlan) -> BackupJob {
    let job = store.create_job(&s.id, &plan, Utc::now()).unwrap();
    let location = format!("{}.tar.gz", job.id);
    fs::write(root.join(&location), b"artifact").unwrap();
    store.mark_started(&job.id).unwrap();
    store
        .mark_completed(&job.id, 8, 1, 1, Some(location))
        .unwrap()
}

fn exists(store: &BackupStore, job: &BackupJob) -> bool {
    store.get_job(&job.id).is_ok()
}

#[tokio::test]
async fn prunes_oldest_but_keeps_ancestor_of_latest() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let (store, s) = setup(SinkKind::Local, root, Some(2));

    let oldest = run(&store, &s, root, JobPlan::full());
    let older = run(&store, &s, root, JobPlan::full());
    let base = run(&store, &s, root, JobPlan::full());
    let second = run(&store, &s, root, JobPlan::full());
    let latest = run(&store, &s, root, JobPlan::incremental(base.id.clone()));

    let report = store
        .enforce_retention(&s.id, &DefaultSinkResolver)
        .await
        .unwrap();

    let mut deleted = report.deleted.clone();
    deleted.sort();
    let mut expected = vec![oldest.id.clone(), older.id.clone()];
    expected.sort();
    assert_eq!(deleted, expected);
    assert_eq!(report.protected, vec![base.id.clone()]);
    assert!(report.orphaned.is_empty());

    for kept in [&latest, &second, &base] {
        assert!(exists(&store, kept));
        assert!(root.join(kept.location.as_ref().unwrap()).exists());
    }
    for gone in [&oldest, &older] {
        assert!(!exists(&store, gone));
        assert!(!root.join(gone.location.as_ref().unwrap()).exists());
    }

    // Nothing changed since, so a second pass is a no-op.
    let again = store
        .enforce_retention(&s.id, &DefaultSinkResolver)
        .await
        .unwrap();
    assert!(again.deleted.is_empty());
    assert!(again.orphaned.is_empty());

    let chain = store.get_chain(&s.site_id, &s.sink_id).unwrap();
    let chain_ids: Vec<_> = chain.iter().map(|j| j.id.clone()).collect();
    assert_eq!(chain_ids, vec![base.id.clone(), latest.id.clone()]);
}

#[tokio::test]
async fn no_retention_count_keeps_everything() {
    let dir = tempfile::tempdir().unwrap();
    let (store, s) = setup(SinkKind::Local, dir.path(), None);
    for _ in 0..4 {
        run(&store, &s, dir.path(), JobPlan::full());
    }
    let report = store
        .enforce_retention(&s.id, &DefaultSinkResolver)
        .await
        .unwrap();
    assert!(report.deleted.is_empty());
    assert_eq!(store.list_jobs(&s.id).unwrap().len(), 4);
}

#[tokio::test]
async fn sink_failure_orphans_instead_of_deleting() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    // No adapter for this provider here, so every delete fails.
    let (store, s) = setup(SinkKind::S3, root, Some(1));

    let old = run(&store, &s, root, JobPlan::full());
    let new = run(&store, &s, root, JobPlan::full());

    let report = store
        .enforce_retention(&s.id, &DefaultSinkResolver)
        .await
        .unwrap();
    assert!(report.deleted.is_empty());
    assert_eq!(report.orphaned.len(), 1);
    assert_eq!(report.orphaned[0].0, old.id);

    let orphan = store.get_job(&old.id).unwrap();
    assert_eq!(orphan.retention, RetentionState::Orphaned);
    assert_eq!(orphan.status, JobStatus::Completed);
    assert_eq!(orphan.error, None);
    assert!(orphan.retention_error.unwrap().contains("s3"));
    assert_eq!(
        store.get_job(&new.id).unwrap().retention,
        RetentionState::Retained
    );

    // Orphans are never retried.
    let again = store
        .enforce_retention(&s.id, &DefaultSinkResolver)
        .await
        .unwrap();
    assert!(again.orphaned.is_empty());
}

#[tokio::test]
async fn worker_prunes_after_each_completion() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let (tx, rx) = mpsc::channel(16);
    let store = BackupStore::new(Connection::open_in_memory().unwrap())
        .unwrap()
        .with_retention_queue(tx);
    let (store, s) = setup_with(store, SinkKind::Local, root, Some(1));
    let store = Arc::new(store);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(run_retention_worker(
        Arc::clone(&store),
        Arc::new(DefaultSinkResolver),
        rx,
        shutdown_rx,
    ));

    let first = run(&store, &s, root, JobPlan::full());
    let second = run(&store, &s, root, JobPlan::full());
    let third = run(&store, &s, root, JobPlan::full());

    let mut remaining = usize::MAX;
    for _ in 0..100 {
        remaining = store.list_jobs(&s.id).unwrap().len();
        if remaining == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(remaining, 1);
    assert!(exists(&store, &third));
    for gone in [&first, &second] {
        assert!(!exists(&store, gone));
        assert!(!root.join(gone.location.as_ref().unwrap()).exists());
    }
    assert!(root.join(third.location.as_ref().unwrap()).exists());

    shutdown_tx.send(true).unwrap();
    worker.await.unwrap();
}
