use std::sync::Arc;

use axum::{
    Router,
    routing::get,
};

use realtime_cell::{create_realtime_router, handlers::RealtimeState, RealtimeHub};
use shared_config::AppConfig;

pub fn create_router(state: Arc<AppConfig>, hub: RealtimeHub) -> Router {
    Router::new()
        .route("/", get(|| async { "Amae Clinic API is running!" }))
        .merge(create_realtime_router(RealtimeState::new(state, hub)))
}
