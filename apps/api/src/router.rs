use std::sync::Arc;

use axum::{
    Json, Router,
    routing::get,
};
use serde_json::json;

use realtime_cell::RealtimeHub;
use scheduling_cell::{SchedulingState, scheduling_routes};
use shared_config::AppConfig;

pub fn create_router(
    config: Arc<AppConfig>,
    scheduling: Arc<SchedulingState>,
    hub: Arc<RealtimeHub>,
) -> Router {
    Router::new()
        .route("/", get(|| async { "Practice API is running!" }))
        .route("/status", get(move || status(hub.clone())))
        .nest("/appointments", scheduling_routes(scheduling, config))
}

async fn status(hub: Arc<RealtimeHub>) -> Json<serde_json::Value> {
    let pruned = hub.prune_idle_channels().await;
    Json(json!({
        "status": "ok",
        "realtime_tenants": hub.active_tenants().await.len(),
        "pruned_channels": pruned,
    }))
}
