use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use sitevault_core::types::JobId;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::SchedulerError;
use crate::store::BackupStore;
use crate::types::{BackupJob, JobKind, Site};

/// What a producer is asked to do for one job.
#[derive(Debug, Clone, Serialize)]
pub struct BackupRequest {
    pub job_id: JobId,
    pub site: Site,
    #[serde(flatten)]
    pub kind: JobKind,
}

impl BackupRequest {
    pub fn new(job: &BackupJob, site: Site) -> Self {
        Self {
            job_id: job.id.clone(),
            site,
            kind: job.kind.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("producer unreachable: {0}")]
    Unreachable(String),

    #[error("producer rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },
}

/// Capability that actually creates a backup artifact.
///
/// `run` only has to accept the request. Progress and the final result come
/// back later as job events (`started`, `completed`, `failed`).
#[async_trait]
pub trait BackupProducer: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, request: &BackupRequest) -> Result<(), ProducerError>;
}

/// Hand every created job to `producer` until `shutdown` fires.
///
/// Each request runs on its own task so a slow site never delays another.
/// A job whose request fails is marked `failed`; if a callback already moved
/// it on, the failure is only logged.
pub async fn run_dispatcher(
    store: Arc<BackupStore>,
    producer: Arc<dyn BackupProducer>,
    mut rx: mpsc::Receiver<BackupJob>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(producer = producer.name(), "job dispatcher started");
    loop {
        tokio::select! {
            next = rx.recv() => {
                let Some(job) = next else {
                    info!("dispatch queue closed");
                    break;
                };
                let site = match store.get_site(&job.site_id) {
                    Ok(site) => site,
                    Err(e) => {
                        fail_job(&store, &job.id, &format!("site lookup failed: {e}"));
                        continue;
                    }
                };
                let request = BackupRequest::new(&job, site);
                let store = Arc::clone(&store);
                let producer = Arc::clone(&producer);
                tokio::spawn(async move {
                    debug!(job_id = %request.job_id, "dispatching backup request");
                    if let Err(e) = producer.run(&request).await {
                        warn!(job_id = %request.job_id, "producer request failed: {e}");
                        fail_job(&store, &request.job_id, &format!("producer failure: {e}"));
                    }
                });
            }
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    info!("job dispatcher shutting down");
                    break;
                }
            }
        }
    }
}

fn fail_job(store: &BackupStore, id: &JobId, reason: &str) {
    match store.mark_failed(id, reason) {
        Ok(_) => {}
        Err(SchedulerError::InvalidTransition { from, .. }) => {
            debug!(job_id = %id, %from, "job already moved on, not failing it");
        }
        Err(e) => error!(job_id = %id, "could not mark job failed: {e}"),
    }
}
