use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sitevault_core::types::ScheduleId;
use sitevault_scheduler::{BackupJob, BackupSchedule, Firing, NewSchedule, Trigger};

use crate::app::AppState;
use crate::error::ApiResult;

#[derive(Deserialize)]
pub struct SetEnabled {
    pub enabled: bool,
}

#[derive(Deserialize)]
pub struct DueQuery {
    /// Evaluate due-ness at this instant instead of now.
    pub at: Option<DateTime<Utc>>,
}

/// POST /schedules
pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(input): Json<NewSchedule>,
) -> ApiResult<(StatusCode, Json<BackupSchedule>)> {
    let schedule = state.store.create_schedule(input, Utc::now())?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

/// GET /schedules
pub async fn list(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<BackupSchedule>>> {
    Ok(Json(state.store.list_schedules()?))
}

/// GET /schedules/due?at=<rfc3339>
pub async fn due(
    State(state): State<Arc<AppState>>,
    Query(q): Query<DueQuery>,
) -> ApiResult<Json<Vec<BackupSchedule>>> {
    let at = q.at.unwrap_or_else(Utc::now);
    Ok(Json(state.store.list_due_schedules(at)?))
}

/// GET /schedules/{id}
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ScheduleId>,
) -> ApiResult<Json<BackupSchedule>> {
    Ok(Json(state.store.get_schedule(&id)?))
}

/// DELETE /schedules/{id}
pub async fn delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ScheduleId>,
) -> ApiResult<StatusCode> {
    state.store.delete_schedule(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// PUT /schedules/{id}/enabled
pub async fn set_enabled(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ScheduleId>,
    Json(req): Json<SetEnabled>,
) -> ApiResult<Json<BackupSchedule>> {
    Ok(Json(
        state
            .store
            .set_schedule_enabled(&id, req.enabled, Utc::now())?,
    ))
}

/// POST /schedules/{id}/run: fire once outside the loop.
///
/// 201 with the created job, or 200 with the skip reason when the schedule's
/// previous job is still open.
pub async fn run_now(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ScheduleId>,
) -> ApiResult<(StatusCode, Json<Firing>)> {
    let firing = state
        .store
        .create_job_for_schedule(&id, Trigger::Manual, Utc::now())?;
    let status = match firing {
        Firing::Created { .. } => StatusCode::CREATED,
        Firing::Skipped { .. } => StatusCode::OK,
    };
    Ok((status, Json(firing)))
}

/// GET /schedules/{id}/jobs: newest first.
pub async fn jobs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ScheduleId>,
) -> ApiResult<Json<Vec<BackupJob>>> {
    Ok(Json(state.store.list_jobs(&id)?))
}
