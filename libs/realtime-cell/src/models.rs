use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;
use uuid::Uuid;

use shared_models::auth::{Identity, UserId};

use crate::RealtimeError;

pub const AUTH_TAG: &str = "auth";
pub const DOCTOR_UPDATE_TAG: &str = "doctorUpdate";
pub const APPOINTMENT_UPDATE_TAG: &str = "appointmentUpdate";
pub const TRANSPORT_UPDATE_TAG: &str = "transportUpdate";

// ==============================================================================
// CONNECTION STATE
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

impl ConnectionState {
    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Open)
    }
}

/// Bounded exponential backoff: the delay before reconnect `k` (1-based) is
/// `base_delay * 2^(k-1)`, and at most `max_attempts` reconnects are made
/// between two successful opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub attempt: u32,
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            base_delay,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Consumes one attempt from the budget and returns the delay to wait
    /// before it, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let delay = self.delay_for(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// User-visible notices raised by a realtime channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelNotice {
    /// Every reconnect attempt failed; the channel has disabled itself.
    ConnectionLost { attempts: u32 },
}

impl ChannelNotice {
    pub fn message(&self) -> &'static str {
        match self {
            ChannelNotice::ConnectionLost { .. } => {
                "Connection lost, some features are limited until realtime updates are re-enabled"
            }
        }
    }
}

// ==============================================================================
// FRAME PAYLOADS
// ==============================================================================

// Payload fields are optional on the receiving side so that a partially
// populated notification still reaches subscribers as its typed variant.
// Anything not modelled here is kept in `extra`.

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoctorAvailabilityUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doctor_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_available: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppointmentStatusUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appointment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doctor_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportStatusUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_minutes: Option<u32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A frame pushed from the hub to a channel: `{ "type": tag, "data": payload }`.
///
/// Typed variants keep the payload exactly as it arrived in `raw`; `update`
/// is a parsed view of it.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    DoctorUpdate { update: DoctorAvailabilityUpdate, raw: Value },
    AppointmentUpdate { update: AppointmentStatusUpdate, raw: Value },
    TransportUpdate { update: TransportStatusUpdate, raw: Value },
    Unknown { tag: String, data: Value },
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    tag: String,
    #[serde(default)]
    data: Value,
}

impl InboundMessage {
    /// Parses one text frame. Frames that are not JSON objects with a string
    /// `type` are rejected; a known tag whose payload does not fit its typed
    /// shape is kept as `Unknown` rather than dropped.
    pub fn parse(frame: &str) -> Result<Self, RealtimeError> {
        let raw: RawFrame = serde_json::from_str(frame)?;

        Ok(match raw.tag.as_str() {
            DOCTOR_UPDATE_TAG => typed::<DoctorAvailabilityUpdate>(raw, |update, raw| {
                InboundMessage::DoctorUpdate { update, raw }
            }),
            APPOINTMENT_UPDATE_TAG => typed::<AppointmentStatusUpdate>(raw, |update, raw| {
                InboundMessage::AppointmentUpdate { update, raw }
            }),
            TRANSPORT_UPDATE_TAG => typed::<TransportStatusUpdate>(raw, |update, raw| {
                InboundMessage::TransportUpdate { update, raw }
            }),
            _ => InboundMessage::Unknown {
                tag: raw.tag,
                data: raw.data,
            },
        })
    }

    pub fn doctor_update(update: DoctorAvailabilityUpdate) -> Result<Self, RealtimeError> {
        let raw = serde_json::to_value(&update)?;
        Ok(InboundMessage::DoctorUpdate { update, raw })
    }

    pub fn appointment_update(update: AppointmentStatusUpdate) -> Result<Self, RealtimeError> {
        let raw = serde_json::to_value(&update)?;
        Ok(InboundMessage::AppointmentUpdate { update, raw })
    }

    pub fn transport_update(update: TransportStatusUpdate) -> Result<Self, RealtimeError> {
        let raw = serde_json::to_value(&update)?;
        Ok(InboundMessage::TransportUpdate { update, raw })
    }

    pub fn tag(&self) -> &str {
        match self {
            InboundMessage::DoctorUpdate { .. } => DOCTOR_UPDATE_TAG,
            InboundMessage::AppointmentUpdate { .. } => APPOINTMENT_UPDATE_TAG,
            InboundMessage::TransportUpdate { .. } => TRANSPORT_UPDATE_TAG,
            InboundMessage::Unknown { tag, .. } => tag,
        }
    }

    /// The payload as received.
    pub fn data(&self) -> &Value {
        match self {
            InboundMessage::DoctorUpdate { raw, .. }
            | InboundMessage::AppointmentUpdate { raw, .. }
            | InboundMessage::TransportUpdate { raw, .. } => raw,
            InboundMessage::Unknown { data, .. } => data,
        }
    }

    pub fn to_frame(&self) -> Result<String, RealtimeError> {
        let frame = json!({
            "type": self.tag(),
            "data": self.data(),
        });
        Ok(serde_json::to_string(&frame)?)
    }
}

fn typed<T: DeserializeOwned>(raw: RawFrame, wrap: fn(T, Value) -> InboundMessage) -> InboundMessage {
    match serde_json::from_value::<T>(raw.data.clone()) {
        Ok(update) => wrap(update, raw.data),
        Err(e) => {
            debug!("Payload for '{}' did not match its schema ({}), forwarding untyped", raw.tag, e);
            InboundMessage::Unknown {
                tag: raw.tag,
                data: raw.data,
            }
        }
    }
}

/// A frame written by a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundRequest {
    /// Sent once, immediately after the transport opens.
    Auth(Identity),
    Message { tag: String, data: Value },
}

impl OutboundRequest {
    pub fn auth(identity: &Identity) -> Self {
        OutboundRequest::Auth(identity.clone())
    }

    pub fn message(tag: impl Into<String>, data: Value) -> Self {
        OutboundRequest::Message {
            tag: tag.into(),
            data,
        }
    }

    pub fn tag(&self) -> &str {
        match self {
            OutboundRequest::Auth(_) => AUTH_TAG,
            OutboundRequest::Message { tag, .. } => tag,
        }
    }

    pub fn to_frame(&self) -> Result<String, RealtimeError> {
        let frame = match self {
            OutboundRequest::Auth(identity) => json!({
                "type": AUTH_TAG,
                "userId": identity.user_id,
                "role": identity.role,
            }),
            OutboundRequest::Message { tag, data } => json!({
                "type": tag,
                "data": data,
            }),
        };
        Ok(serde_json::to_string(&frame)?)
    }
}

/// Reads the identity out of an `auth` frame.
pub fn parse_auth_frame(frame: &str) -> Result<Identity, RealtimeError> {
    let value: Value = serde_json::from_str(frame)?;
    match value.get("type").and_then(Value::as_str) {
        Some(AUTH_TAG) => Ok(serde_json::from_value(value)?),
        Some(other) => Err(RealtimeError::InvalidFrame(format!(
            "expected auth frame, got '{}'",
            other
        ))),
        None => Err(RealtimeError::InvalidFrame("frame has no type".to_string())),
    }
}

// ==============================================================================
// HUB MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct HubSession {
    pub session_id: Uuid,
    pub identity: Identity,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubStats {
    pub active_sessions: usize,
    pub patients: usize,
    pub doctors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
    NoShow,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::InProgress => "in_progress",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::NoShow => "no_show",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportStatus {
    Requested,
    Dispatched,
    EnRoute,
    Arrived,
    Completed,
    Cancelled,
}

impl TransportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportStatus::Requested => "requested",
            TransportStatus::Dispatched => "dispatched",
            TransportStatus::EnRoute => "en_route",
            TransportStatus::Arrived => "arrived",
            TransportStatus::Completed => "completed",
            TransportStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorAvailabilityRequest {
    pub doctor_id: UserId,
    pub is_available: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppointmentStatusRequest {
    pub appointment_id: Uuid,
    pub patient_id: UserId,
    pub doctor_id: UserId,
    pub status: AppointmentStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportStatusRequest {
    pub request_id: Uuid,
    pub patient_id: UserId,
    pub status: TransportStatus,
    pub eta_minutes: Option<u32>,
}

const MAX_ETA_MINUTES: u32 = 24 * 60;

fn require_id(field: &str, id: &UserId) -> Result<(), String> {
    match id {
        UserId::Text(text) if text.trim().is_empty() => Err(format!("{} must not be empty", field)),
        _ => Ok(()),
    }
}

impl DoctorAvailabilityRequest {
    pub fn validate(&self) -> Result<(), String> {
        require_id("doctor_id", &self.doctor_id)
    }
}

impl AppointmentStatusRequest {
    pub fn validate(&self) -> Result<(), String> {
        require_id("patient_id", &self.patient_id)?;
        require_id("doctor_id", &self.doctor_id)
    }
}

impl TransportStatusRequest {
    pub fn validate(&self) -> Result<(), String> {
        require_id("patient_id", &self.patient_id)?;
        match self.eta_minutes {
            Some(eta) if eta > MAX_ETA_MINUTES => {
                Err(format!("eta_minutes must be at most {}", MAX_ETA_MINUTES))
            }
            _ => Ok(()),
        }
    }
}

