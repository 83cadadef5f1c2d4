use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use sitevault_core::types::SinkId;
use sitevault_scheduler::{SinkKind, SinkRef};

use crate::app::AppState;
use crate::error::ApiResult;

#[derive(Deserialize)]
pub struct CreateSink {
    #[serde(rename = "type")]
    pub kind: SinkKind,
    #[serde(default)]
    pub credentials: serde_json::Value,
    #[serde(default)]
    pub quota_bytes: Option<u64>,
}

/// POST /sinks
pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSink>,
) -> ApiResult<(StatusCode, Json<SinkRef>)> {
    let sink = state
        .store
        .create_sink(req.kind, req.credentials, req.quota_bytes)?;
    Ok((StatusCode::CREATED, Json(sink)))
}

/// GET /sinks
pub async fn list(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<SinkRef>>> {
    Ok(Json(state.store.list_sinks()?))
}

/// GET /sinks/{id}
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SinkId>,
) -> ApiResult<Json<SinkRef>> {
    Ok(Json(state.store.get_sink(&id)?))
}

/// DELETE /sinks/{id}: cascades to schedules and jobs targeting the sink.
pub async fn delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SinkId>,
) -> ApiResult<StatusCode> {
    state.store.delete_sink(&id)?;
    Ok(StatusCode::NO_CONTENT)
}
