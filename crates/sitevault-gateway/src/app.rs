use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use sitevault_core::config::VaultConfig;
use sitevault_scheduler::BackupStore;

use crate::http;

/// Central shared state, passed as `Arc<AppState>` to all Axum handlers.
pub struct AppState {
    pub config: VaultConfig,
    pub store: Arc<BackupStore>,
}

impl AppState {
    pub fn new(config: VaultConfig, store: Arc<BackupStore>) -> Self {
        Self { config, store }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let operator = Router::new()
        .route("/sites", post(http::sites::create).get(http::sites::list))
        .route("/sites/{id}", get(http::sites::get).delete(http::sites::delete))
        .route("/sites/{id}/credential", put(http::sites::rotate_credential))
        .route("/sinks", post(http::sinks::create).get(http::sinks::list))
        .route("/sinks/{id}", get(http::sinks::get).delete(http::sinks::delete))
        .route(
            "/schedules",
            post(http::schedules::create).get(http::schedules::list),
        )
        .route("/schedules/due", get(http::schedules::due))
        .route(
            "/schedules/{id}",
            get(http::schedules::get).delete(http::schedules::delete),
        )
        .route("/schedules/{id}/enabled", put(http::schedules::set_enabled))
        .route("/schedules/{id}/run", post(http::schedules::run_now))
        .route("/schedules/{id}/jobs", get(http::schedules::jobs))
        .route("/jobs/{id}", get(http::jobs::get))
        .route("/jobs/{id}/transition", post(http::jobs::transition))
        .route("/chains/{site_id}/{sink_id}", get(http::chains::get))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            crate::auth::require_token,
        ));

    Router::new()
        .route("/health", get(http::health::health_handler))
        .route("/jobs/{id}/events", post(http::jobs::producer_event))
        .merge(operator)
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
