#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

use realtime_cell::*;

pub const TEST_ENDPOINT: &str = "ws://clinic.test/ws";

/// How the mock answers one `open` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Step {
    Accept,
    Refuse,
    Hang,
}

/// The far end of an accepted mock transport.
pub struct MockPeer {
    pub frames: mpsc::UnboundedReceiver<OutboundFrame>,
    pub events: mpsc::UnboundedSender<TransportEvent>,
}

impl MockPeer {
    pub async fn next_frame(&mut self) -> Option<OutboundFrame> {
        timeout(Duration::from_secs(30), self.frames.recv())
            .await
            .expect("timed out waiting for an outbound frame")
    }

    pub async fn next_text(&mut self) -> serde_json::Value {
        match self.next_frame().await {
            Some(OutboundFrame::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text frame, got {:?}", other),
        }
    }

    pub fn push(&self, frame: &str) {
        self.events
            .send(TransportEvent::Frame(frame.to_string()))
            .expect("channel dropped the transport");
    }

    pub fn close(&self) {
        let _ = self.events.send(TransportEvent::Closed(Some("server restart".to_string())));
    }
}

/// Connector that follows a script and records when each attempt was made.
/// Once the script runs out every attempt is refused.
pub struct MockConnector {
    script: Mutex<VecDeque<Step>>,
    attempts: Mutex<Vec<Instant>>,
    peers_tx: mpsc::UnboundedSender<MockPeer>,
    peers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockPeer>>,
}

impl MockConnector {
    pub fn new(script: Vec<Step>) -> Arc<Self> {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            script: Mutex::new(script.into()),
            attempts: Mutex::new(Vec::new()),
            peers_tx,
            peers_rx: tokio::sync::Mutex::new(peers_rx),
        })
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }

    pub async fn next_peer(&self) -> MockPeer {
        let mut peers = self.peers_rx.lock().await;
        timeout(Duration::from_secs(30), peers.recv())
            .await
            .expect("timed out waiting for a transport to open")
            .expect("connector dropped")
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, url: &str) -> Result<Transport, RealtimeError> {
        assert_eq!(url, TEST_ENDPOINT);
        self.attempts.lock().unwrap().push(Instant::now());
        let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Refuse);

        match step {
            Step::Accept => {
                let (outbound, frames) = mpsc::unbounded_channel();
                let (events, inbound) = mpsc::unbounded_channel();
                let _ = self.peers_tx.send(MockPeer { frames, events });
                Ok(Transport { outbound, inbound })
            }
            Step::Refuse => Err(RealtimeError::Transport("connection refused".to_string())),
            Step::Hang => std::future::pending().await,
        }
    }
}

pub fn test_config() -> ChannelConfig {
    ChannelConfig::new(TEST_ENDPOINT)
}

pub fn spawn_channel(
    connector: Arc<MockConnector>,
    preferences: Arc<MemoryPreferenceStore>,
) -> RealtimeChannel {
    RealtimeChannel::spawn(test_config(), connector, preferences)
}

pub async fn wait_for_state(channel: &RealtimeChannel, expected: ConnectionState) {
    let mut state = channel.watch_state();
    timeout(Duration::from_secs(60), state.wait_for(|s| *s == expected))
        .await
        .unwrap_or_else(|_| panic!("channel never reached {:?}", expected))
        .unwrap();
}

/// Polls `condition` until it holds. With paused time the sleeps advance the
/// clock, so keep the timeout above any backoff under test.
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    timeout(Duration::from_secs(120), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}

/// Yields to the channel task a few times without moving the clock.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

pub fn recorder() -> (Arc<Mutex<Vec<InboundMessage>>>, impl Fn(&InboundMessage) + Send + Sync + 'static) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    (received, move |message: &InboundMessage| {
        sink.lock().unwrap().push(message.clone())
    })
}
