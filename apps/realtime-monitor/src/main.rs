//! Connects a realtime channel as a given user and logs everything it
//! receives. Useful for checking a deployment end to end.
//!
//! `REALTIME_USER_ID` and `REALTIME_ROLE` (`patient` or `doctor`) pick the
//! identity; everything else comes from the shared `REALTIME_*` settings.
//! A channel that was disabled (by the user or after repeated connection
//! failures) is left alone unless `REALTIME_FORCE_ENABLE=true`.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use dotenv::dotenv;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use realtime_cell::{
    ChannelConfig, ConnectionState, FilePreferenceStore, InboundMessage, RealtimeChannel, WebSocketConnector,
};
use shared_config::AppConfig;
use shared_models::auth::{Identity, UserId, UserRole};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env();
    let identity = identity_from_env()?;
    let channel_config = ChannelConfig::from_realtime_config(&config.realtime)
        .context("invalid realtime endpoint")?;
    let preferences = Arc::new(FilePreferenceStore::open(&config.realtime.preferences_path));

    let channel = RealtimeChannel::spawn(
        channel_config,
        Arc::new(WebSocketConnector),
        preferences,
    );

    let _subscription = channel.subscribe(|message| match message {
        InboundMessage::DoctorUpdate { update, .. } => info!(
            "Doctor {:?} available: {:?}",
            update.doctor_id, update.is_available
        ),
        InboundMessage::AppointmentUpdate { update, .. } => info!(
            "Appointment {:?} is now {:?}",
            update.appointment_id, update.status
        ),
        InboundMessage::TransportUpdate { update, .. } => info!(
            "Transport {:?} is now {:?} (eta {:?} min)",
            update.request_id, update.status, update.eta_minutes
        ),
        InboundMessage::Unknown { tag, data } => info!("Unhandled '{}' message: {}", tag, data),
    });

    if !channel.enabled() {
        let preferences_path = config.realtime.preferences_path.display();
        if !force_enable(env::var("REALTIME_FORCE_ENABLE").ok().as_deref()) {
            channel.shutdown();
            bail!(
                "Realtime updates are disabled in {}; set REALTIME_FORCE_ENABLE=true to turn them back on",
                preferences_path
            );
        }
        warn!("Realtime updates are disabled in {}, re-enabling on request", preferences_path);
        channel.set_enabled(true);
    }
    channel.connect(identity);

    let mut notices = channel.notices();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        notice = notices.recv() => {
            if let Ok(notice) = notice {
                warn!("{}", notice.message());
            }
        }
    }

    info!("Received {} messages", channel.messages().len());
    let mut state = channel.watch_state();
    channel.shutdown();
    let _ = tokio::time::timeout(
        Duration::from_secs(1),
        state.wait_for(|s| *s == ConnectionState::Disconnected),
    )
    .await;
    Ok(())
}

fn identity_from_env() -> anyhow::Result<Identity> {
    let raw_id = env::var("REALTIME_USER_ID").context("REALTIME_USER_ID must be set")?;
    let user_id = match raw_id.parse::<i64>() {
        Ok(id) => UserId::Numeric(id),
        Err(_) => UserId::Text(raw_id),
    };

    let role = match env::var("REALTIME_ROLE").as_deref() {
        Ok("doctor") => UserRole::Doctor,
        Ok("patient") | Err(_) => UserRole::Patient,
        Ok(other) => bail!("REALTIME_ROLE must be 'patient' or 'doctor', got '{}'", other),
    };

    Ok(Identity::new(user_id, role))
}

fn force_enable(value: Option<&str>) -> bool {
    matches!(value.map(str::trim), Some("true") | Some("1"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_preference_is_kept_unless_forced() {
        assert!(!force_enable(None));
        assert!(!force_enable(Some("")));
        assert!(!force_enable(Some("false")));
        assert!(!force_enable(Some("yes please")));
        assert!(force_enable(Some("true")));
        assert!(force_enable(Some(" 1 ")));
    }
}
