use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::{Json, Response},
};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use shared_config::AppConfig;
use shared_models::{auth::Identity, error::AppError};

use crate::{
    parse_auth_frame, AppointmentStatusRequest, DoctorAvailabilityRequest, HubStats,
    RealtimeError, RealtimeHub, TransportStatusRequest,
};

#[derive(Clone)]
pub struct RealtimeState {
    pub config: Arc<AppConfig>,
    pub hub: RealtimeHub,
}

impl RealtimeState {
    pub fn new(config: Arc<AppConfig>, hub: RealtimeHub) -> Self {
        Self { config, hub }
    }
}

/// Upgrade to the realtime socket. The first frame must be `auth`.
pub async fn realtime_socket(
    ws: WebSocketUpgrade,
    State(state): State<RealtimeState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: RealtimeState) {
    let (mut sender, mut receiver) = socket.split();

    let auth_timeout = state.config.realtime.auth_timeout();
    let identity = match tokio::time::timeout(auth_timeout, read_auth(&mut receiver)).await {
        Ok(Ok(identity)) => identity,
        Ok(Err(e)) => {
            warn!("Rejecting realtime socket: {}", e);
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
        Err(_) => {
            warn!("Realtime socket sent no auth frame within {} ms", auth_timeout.as_millis());
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    let (session_id, mut outbound) = state.hub.register(identity).await;

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sender.send(Message::Text(frame.into())).await {
                        debug!("Realtime session {} write failed: {}", session_id, e);
                        break;
                    }
                }
                None => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    debug!("Ignoring client frame on session {}: {}", session_id, text.as_str());
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Realtime session {} read failed: {}", session_id, e);
                    break;
                }
            },
        }
    }

    state.hub.remove(session_id).await;
    info!("Realtime session {} closed", session_id);
}

async fn read_auth(receiver: &mut SplitStream<WebSocket>) -> Result<Identity, RealtimeError> {
    while let Some(message) = receiver.next().await {
        match message.map_err(|e| RealtimeError::Transport(e.to_string()))? {
            Message::Text(text) => return parse_auth_frame(text.as_str()),
            Message::Close(_) => break,
            _ => continue,
        }
    }
    Err(RealtimeError::Transport("socket closed before auth".to_string()))
}

/// Announce a doctor availability change
pub async fn publish_doctor_availability(
    State(state): State<RealtimeState>,
    Json(request): Json<DoctorAvailabilityRequest>,
) -> Result<Json<Value>, AppError> {
    info!("Doctor availability update for {}", request.doctor_id);
    request.validate().map_err(AppError::ValidationError)?;

    let delivered = state
        .hub
        .notify_doctor_availability(&request)
        .await
        .map_err(publish_failed)?;

    Ok(Json(json!({
        "success": true,
        "delivered": delivered
    })))
}

/// Announce an appointment status change
pub async fn publish_appointment_status(
    State(state): State<RealtimeState>,
    Json(request): Json<AppointmentStatusRequest>,
) -> Result<Json<Value>, AppError> {
    info!("Appointment status update for {}", request.appointment_id);
    request.validate().map_err(AppError::ValidationError)?;

    let delivered = state
        .hub
        .notify_appointment_status(&request)
        .await
        .map_err(publish_failed)?;

    Ok(Json(json!({
        "success": true,
        "delivered": delivered
    })))
}

/// Announce an emergency transport status change
pub async fn publish_transport_status(
    State(state): State<RealtimeState>,
    Json(request): Json<TransportStatusRequest>,
) -> Result<Json<Value>, AppError> {
    info!("Transport status update for {}", request.request_id);
    request.validate().map_err(AppError::ValidationError)?;

    let delivered = state
        .hub
        .notify_transport_status(&request)
        .await
        .map_err(publish_failed)?;

    Ok(Json(json!({
        "success": true,
        "delivered": delivered
    })))
}

pub async fn get_hub_stats(State(state): State<RealtimeState>) -> Json<HubStats> {
    Json(state.hub.stats().await)
}

fn publish_failed(e: RealtimeError) -> AppError {
    error!("Failed to publish realtime notification: {}", e);
    AppError::Internal("Failed to publish notification".to_string())
}
