use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use sitevault_core::types::SiteId;
use sitevault_scheduler::Site;

use crate::app::AppState;
use crate::error::ApiResult;

#[derive(Deserialize)]
pub struct CreateSite {
    pub name: String,
    pub url: String,
    pub credential: String,
}

#[derive(Deserialize)]
pub struct RotateCredential {
    pub credential: String,
}

/// POST /sites
pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSite>,
) -> ApiResult<(StatusCode, Json<Site>)> {
    let site = state.store.create_site(&req.name, &req.url, &req.credential)?;
    Ok((StatusCode::CREATED, Json(site)))
}

/// GET /sites
pub async fn list(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Site>>> {
    Ok(Json(state.store.list_sites()?))
}

/// GET /sites/{id}
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SiteId>,
) -> ApiResult<Json<Site>> {
    Ok(Json(state.store.get_site(&id)?))
}

/// DELETE /sites/{id}: cascades to the site's schedules and jobs.
pub async fn delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SiteId>,
) -> ApiResult<StatusCode> {
    state.store.delete_site(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// PUT /sites/{id}/credential
pub async fn rotate_credential(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SiteId>,
    Json(req): Json<RotateCredential>,
) -> ApiResult<Json<Site>> {
    Ok(Json(state.store.rotate_site_credential(&id, &req.credential)?))
}
