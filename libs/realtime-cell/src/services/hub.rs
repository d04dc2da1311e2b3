use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use shared_models::auth::{Identity, UserId, UserRole};

use crate::{
    AppointmentStatusRequest, AppointmentStatusUpdate, DoctorAvailabilityRequest,
    DoctorAvailabilityUpdate, HubSession, HubStats, InboundMessage, RealtimeError,
    TransportStatusRequest, TransportStatusUpdate,
};

pub type HubSender = mpsc::UnboundedSender<String>;
pub type HubReceiver = mpsc::UnboundedReceiver<String>;

struct SessionEntry {
    session: HubSession,
    sender: HubSender,
}

/// Server-side registry of authenticated realtime sockets. Each session gets
/// its own queue of encoded frames; the socket task drains it.
pub struct RealtimeHub {
    sessions: Arc<RwLock<HashMap<Uuid, SessionEntry>>>,
}

impl RealtimeHub {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    #[instrument(skip(self, identity), fields(role = %identity.role))]
    pub async fn register(&self, identity: Identity) -> (Uuid, HubReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let session_id = Uuid::new_v4();
        let session = HubSession {
            session_id,
            identity,
            connected_at: Utc::now(),
        };

        info!(
            "Registered realtime session {} for {} {}",
            session_id, session.identity.role, session.identity.user_id
        );

        let mut sessions = self.sessions.write().await;
        sessions.insert(session_id, SessionEntry { session, sender });
        (session_id, receiver)
    }

    #[instrument(skip(self))]
    pub async fn remove(&self, session_id: Uuid) {
        let mut sessions = self.sessions.write().await;
        if sessions.remove(&session_id).is_some() {
            debug!("Removed realtime session {}", session_id);
        }
    }

    pub async fn broadcast(&self, message: &InboundMessage) -> Result<usize, RealtimeError> {
        self.deliver(message, |_| true).await
    }

    pub async fn send_to_user(
        &self,
        user_id: &UserId,
        message: &InboundMessage,
    ) -> Result<usize, RealtimeError> {
        self.deliver(message, |session| &session.identity.user_id == user_id)
            .await
    }

    pub async fn send_to_role(
        &self,
        role: UserRole,
        message: &InboundMessage,
    ) -> Result<usize, RealtimeError> {
        self.deliver(message, |session| session.identity.role == role)
            .await
    }

    /// Every connected client tracks doctor availability, so this goes to all
    /// sessions.
    pub async fn notify_doctor_availability(
        &self,
        request: &DoctorAvailabilityRequest,
    ) -> Result<usize, RealtimeError> {
        let message = InboundMessage::doctor_update(DoctorAvailabilityUpdate {
            doctor_id: Some(request.doctor_id.clone()),
            is_available: Some(request.is_available),
            extra: stamped(),
        })?;

        let delivered = self.broadcast(&message).await?;
        info!(
            "Doctor {} availability -> {} ({} sessions)",
            request.doctor_id, request.is_available, delivered
        );
        Ok(delivered)
    }

    /// Goes to the patient and the doctor of the appointment.
    pub async fn notify_appointment_status(
        &self,
        request: &AppointmentStatusRequest,
    ) -> Result<usize, RealtimeError> {
        let message = InboundMessage::appointment_update(AppointmentStatusUpdate {
            appointment_id: Some(request.appointment_id.to_string()),
            patient_id: Some(request.patient_id.clone()),
            doctor_id: Some(request.doctor_id.clone()),
            status: Some(request.status.as_str().to_string()),
            extra: stamped(),
        })?;

        let delivered = self
            .deliver(&message, |session| {
                session.identity.user_id == request.patient_id
                    || session.identity.user_id == request.doctor_id
            })
            .await?;
        info!(
            "Appointment {} status -> {} ({} sessions)",
            request.appointment_id,
            request.status.as_str(),
            delivered
        );
        Ok(delivered)
    }

    /// Goes to the requesting patient and to every doctor on duty.
    pub async fn notify_transport_status(
        &self,
        request: &TransportStatusRequest,
    ) -> Result<usize, RealtimeError> {
        let message = InboundMessage::transport_update(TransportStatusUpdate {
            request_id: Some(request.request_id.to_string()),
            patient_id: Some(request.patient_id.clone()),
            status: Some(request.status.as_str().to_string()),
            eta_minutes: request.eta_minutes,
            extra: stamped(),
        })?;

        let delivered = self
            .deliver(&message, |session| {
                session.identity.role == UserRole::Doctor
                    || session.identity.user_id == request.patient_id
            })
            .await?;
        info!(
            "Transport request {} status -> {} ({} sessions)",
            request.request_id,
            request.status.as_str(),
            delivered
        );
        Ok(delivered)
    }

    pub async fn active_sessions(&self) -> Vec<HubSession> {
        let sessions = self.sessions.read().await;
        sessions.values().map(|entry| entry.session.clone()).collect()
    }

    pub async fn stats(&self) -> HubStats {
        let sessions = self.sessions.read().await;
        let mut stats = HubStats {
            active_sessions: sessions.len(),
            ..HubStats::default()
        };
        for entry in sessions.values() {
            match entry.session.identity.role {
                UserRole::Patient => stats.patients += 1,
                UserRole::Doctor => stats.doctors += 1,
            }
        }
        stats
    }

    async fn deliver<F>(&self, message: &InboundMessage, filter: F) -> Result<usize, RealtimeError>
    where
        F: Fn(&HubSession) -> bool,
    {
        let frame = message.to_frame()?;
        let sessions = self.sessions.read().await;

        let mut delivered = 0;
        for entry in sessions.values().filter(|entry| filter(&entry.session)) {
            if entry.sender.send(frame.clone()).is_ok() {
                delivered += 1;
            } else {
                // Socket task already gone; it removes itself shortly.
                debug!("Session {} closed, skipping '{}'", entry.session.session_id, message.tag());
            }
        }

        debug!("Delivered '{}' to {} realtime sessions", message.tag(), delivered);
        Ok(delivered)
    }
}

fn stamped() -> Map<String, Value> {
    let mut extra = Map::new();
    extra.insert("updatedAt".to_string(), json!(Utc::now().to_rfc3339()));
    extra
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for RealtimeHub {
    fn clone(&self) -> Self {
        Self {
            sessions: Arc::clone(&self.sessions),
        }
    }
}
