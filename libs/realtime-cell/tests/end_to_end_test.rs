use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use realtime_cell::handlers::RealtimeState;
use realtime_cell::*;
use shared_config::AppConfig;
use shared_models::auth::{Identity, UserId};

mod common;
use common::{recorder, wait_for_state};

async fn start_server(auth_timeout_ms: u64) -> (SocketAddr, RealtimeHub) {
    let mut config = AppConfig::default();
    config.realtime.auth_timeout_ms = auth_timeout_ms;

    let hub = RealtimeHub::new();
    let app = create_realtime_router(RealtimeState::new(Arc::new(config), hub.clone()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, hub)
}

async fn wait_for_sessions(hub: &RealtimeHub, expected: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while hub.stats().await.active_sessions != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("hub never reached {} sessions", expected));
}

fn spawn_real_channel(addr: SocketAddr) -> RealtimeChannel {
    RealtimeChannel::spawn(
        ChannelConfig::new(format!("ws://{}/ws", addr)),
        Arc::new(WebSocketConnector),
        Arc::new(MemoryPreferenceStore::new()),
    )
}

#[tokio::test]
async fn test_channel_authenticates_and_receives_hub_updates() {
    let (addr, hub) = start_server(2000).await;
    let channel = spawn_real_channel(addr);
    let (received, record) = recorder();
    channel.subscribe(record);

    channel.connect(Identity::patient(7));
    wait_for_state(&channel, ConnectionState::Open).await;
    wait_for_sessions(&hub, 1).await;
    assert_eq!(hub.active_sessions().await[0].identity, Identity::patient(7));

    let delivered = hub
        .notify_doctor_availability(&DoctorAvailabilityRequest {
            doctor_id: UserId::from("d-9"),
            is_available: true,
        })
        .await
        .unwrap();
    assert_eq!(delivered, 1);

    tokio::time::timeout(Duration::from_secs(5), async {
        while received.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("update never arrived");

    let messages = channel.messages();
    assert_matches!(&messages[0], InboundMessage::DoctorUpdate { update, .. } => {
        assert_eq!(update.doctor_id, Some(UserId::from("d-9")));
        assert_eq!(update.is_available, Some(true));
        assert!(update.extra.contains_key("updatedAt"));
    });

    channel.disconnect();
    wait_for_state(&channel, ConnectionState::Disconnected).await;
    wait_for_sessions(&hub, 0).await;
    channel.shutdown();
}

#[tokio::test]
async fn test_hub_closes_sockets_that_never_authenticate() {
    let (addr, hub) = start_server(100).await;
    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .unwrap();

    let next = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("hub kept the socket open");
    assert_matches!(next, Some(Ok(Message::Close(_))) | None);
    assert_eq!(hub.stats().await.active_sessions, 0);
}

#[tokio::test]
async fn test_hub_closes_sockets_with_a_bad_first_frame() {
    let (addr, hub) = start_server(2000).await;
    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .unwrap();

    socket
        .send(Message::Text(r#"{"type":"chat","data":"hello"}"#.into()))
        .await
        .unwrap();

    let next = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("hub kept the socket open");
    assert_matches!(next, Some(Ok(Message::Close(_))) | None);
    assert_eq!(hub.stats().await.active_sessions, 0);
}

#[tokio::test]
async fn test_refused_endpoint_disables_after_backoff() {
    // Nothing listens on this port once the listener is dropped.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut config = ChannelConfig::new(format!("ws://{}/ws", addr));
    config.reconnect_base_delay = Duration::from_millis(10);
    let preferences = Arc::new(MemoryPreferenceStore::new());
    let channel = RealtimeChannel::spawn(config, Arc::new(WebSocketConnector), preferences.clone());
    let mut notices = channel.notices();

    channel.connect(Identity::doctor("d-1"));
    let notice = tokio::time::timeout(Duration::from_secs(10), notices.recv())
        .await
        .expect("channel never gave up")
        .unwrap();

    assert_eq!(notice, ChannelNotice::ConnectionLost { attempts: 3 });
    assert!(!channel.enabled());
    assert_eq!(preferences.get(ENABLED_KEY).as_deref(), Some("false"));
    assert_eq!(channel.state(), ConnectionState::Disconnected);
}
