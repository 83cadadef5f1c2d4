use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use sitevault_core::types::{SinkId, SiteId};
use sitevault_scheduler::BackupJob;

use crate::app::AppState;
use crate::error::ApiResult;

/// GET /chains/{site_id}/{sink_id}: current chain, full root first.
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path((site_id, sink_id)): Path<(SiteId, SinkId)>,
) -> ApiResult<Json<Vec<BackupJob>>> {
    Ok(Json(state.store.get_chain(&site_id, &sink_id)?))
}
