//! Job endpoints.
//!
//! `POST /jobs/{id}/events` is the producer callback and is authenticated by
//! signature, not by the operator token; see [`crate::auth::verify_signature`].

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use sitevault_core::types::JobId;
use sitevault_core::VaultError;
use serde::Deserialize;
use sitevault_scheduler::{BackupJob, JobEvent};
use tracing::{info, warn};

use crate::app::AppState;
use crate::auth::verify_signature;
use crate::error::ApiResult;

/// GET /jobs/{id}
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<JobId>,
) -> ApiResult<Json<BackupJob>> {
    Ok(Json(state.store.get_job(&id)?))
}

/// POST /jobs/{id}/transition: operator or watchdog applies an event.
pub async fn transition(
    State(state): State<Arc<AppState>>,
    Path(id): Path<JobId>,
    Json(event): Json<JobEvent>,
) -> ApiResult<Json<BackupJob>> {
    Ok(Json(state.store.transition(&id, event)?))
}

/// Body of a producer callback: `{"job_id": "...", "event": "...", ...}`.
#[derive(Debug, Deserialize)]
pub struct ProducerCallback {
    pub job_id: JobId,
    #[serde(flatten)]
    pub event: JobEvent,
}

/// POST /jobs/{id}/events: signed producer callback.
///
/// The signature is checked against the credential of the job's site before
/// the body is parsed; the body's `job_id` must then match the path.
pub async fn producer_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<JobId>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<BackupJob>> {
    let job = state.store.get_job(&id)?;
    let site = state.store.get_site(&job.site_id)?;

    if let Err(e) = verify_signature(&headers, &body, &site.credential) {
        warn!(job_id = %id, site_id = %site.id, "producer callback rejected");
        return Err(e.into());
    }

    let callback: ProducerCallback = serde_json::from_slice(&body).map_err(VaultError::from)?;
    if callback.job_id != id {
        warn!(job_id = %id, signed_for = %callback.job_id, "producer callback for another job");
        return Err(VaultError::AuthFailed("callback was signed for another job".into()).into());
    }
    info!(job_id = %id, event = callback.event.name(), "producer callback");
    Ok(Json(state.store.transition(&id, callback.event)?))
}
