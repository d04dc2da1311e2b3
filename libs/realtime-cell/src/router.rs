use axum::{
    Router,
    routing::{get, post},
};

use crate::handlers::{
    get_hub_stats,
    publish_appointment_status,
    publish_doctor_availability,
    publish_transport_status,
    realtime_socket,
    RealtimeState,
};

/// Socket route plus the publish and stats routes.
///
/// The `/realtime/*` routes do no authentication of their own: anyone who
/// can reach them can push updates to every connected client. Mount this
/// router only behind an internal network or a gateway that authenticates
/// the calling services.
pub fn create_realtime_router(state: RealtimeState) -> Router {
    let socket_path = match state.config.realtime.path.as_str() {
        path if path.starts_with('/') => path.to_string(),
        path => format!("/{}", path),
    };

    Router::new()
        .route(&socket_path, get(realtime_socket))
        .route("/realtime/doctor-availability", post(publish_doctor_availability))
        .route("/realtime/appointment-status", post(publish_appointment_status))
        .route("/realtime/transport-status", post(publish_transport_status))
        .route("/realtime/stats", get(get_hub_stats))
        .with_state(state)
}
