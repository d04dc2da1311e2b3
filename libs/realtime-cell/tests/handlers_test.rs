use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    extract::State,
    http::{Request, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use realtime_cell::handlers::{
    get_hub_stats, publish_appointment_status, publish_doctor_availability, RealtimeState,
};
use realtime_cell::*;
use shared_config::AppConfig;
use shared_models::auth::{Identity, UserId};
use shared_models::error::AppError;

fn create_test_state() -> RealtimeState {
    RealtimeState::new(Arc::new(AppConfig::default()), RealtimeHub::new())
}

async fn post_json(state: RealtimeState, uri: &str, body: Value) -> (StatusCode, Value) {
    let app = create_realtime_router(state);
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn test_publish_doctor_availability_handler() {
    let state = create_test_state();
    let (_session, mut receiver) = state.hub.register(Identity::patient(7)).await;

    let result = publish_doctor_availability(
        State(state.clone()),
        Json(DoctorAvailabilityRequest {
            doctor_id: UserId::from("d-1"),
            is_available: true,
        }),
    )
    .await;

    let response = result.unwrap().0;
    assert_eq!(response["success"], true);
    assert_eq!(response["delivered"], 1);

    let frame: Value = serde_json::from_str(&receiver.try_recv().unwrap()).unwrap();
    assert_eq!(frame["type"], "doctorUpdate");
    assert_eq!(frame["data"]["isAvailable"], true);
}

#[tokio::test]
async fn test_publish_rejects_empty_ids() {
    let state = create_test_state();

    let result = publish_appointment_status(
        State(state),
        Json(AppointmentStatusRequest {
            appointment_id: Uuid::new_v4(),
            patient_id: UserId::from(""),
            doctor_id: UserId::from("d-1"),
            status: AppointmentStatus::Confirmed,
        }),
    )
    .await;

    match result.unwrap_err() {
        AppError::ValidationError(msg) => assert_eq!(msg, "patient_id must not be empty"),
        other => panic!("Expected ValidationError, got {:?}", other),
    }
}

#[tokio::test]
async fn test_validation_error_renders_bad_request() {
    let response = AppError::ValidationError("doctor_id must not be empty".to_string()).into_response();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_transport_status_route() {
    let state = create_test_state();
    let (_patient, mut patient_rx) = state.hub.register(Identity::patient(7)).await;
    let (_doctor, mut doctor_rx) = state.hub.register(Identity::doctor("d-1")).await;

    let (status, body) = post_json(
        state,
        "/realtime/transport-status",
        json!({
            "request_id": Uuid::new_v4(),
            "patient_id": 7,
            "status": "arrived",
            "eta_minutes": 0
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"success": true, "delivered": 2}));
    assert!(patient_rx.try_recv().is_ok());
    assert!(doctor_rx.try_recv().is_ok());
}

#[tokio::test]
async fn test_route_rejects_out_of_range_eta() {
    let (status, body) = post_json(
        create_test_state(),
        "/realtime/transport-status",
        json!({
            "request_id": Uuid::new_v4(),
            "patient_id": 7,
            "status": "en_route",
            "eta_minutes": 5000
        }),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("eta_minutes"));
}

#[tokio::test]
async fn test_route_rejects_unknown_status() {
    let (status, _) = post_json(
        create_test_state(),
        "/realtime/appointment-status",
        json!({
            "appointment_id": Uuid::new_v4(),
            "patient_id": 7,
            "doctor_id": "d-1",
            "status": "teleported"
        }),
    )
    .await;

    assert!(status.is_client_error());
}

#[tokio::test]
async fn test_hub_stats() {
    let state = create_test_state();
    state.hub.register(Identity::patient(7)).await;
    state.hub.register(Identity::doctor("d-1")).await;
    state.hub.register(Identity::doctor("d-2")).await;

    let stats = get_hub_stats(State(state.clone())).await.0;
    assert_eq!(stats, HubStats { active_sessions: 3, patients: 1, doctors: 2 });

    let app = create_realtime_router(state);
    let response = app
        .oneshot(Request::builder().uri("/realtime/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body, json!({"active_sessions": 3, "patients": 1, "doctors": 2}));
}
