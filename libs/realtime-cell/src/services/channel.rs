use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Sleep;
use tracing::{debug, error, info, warn};

use shared_config::RealtimeConfig;
use shared_models::auth::Identity;

use crate::services::preference::{read_enabled, write_enabled, PreferenceStore};
use crate::services::transport::{endpoint_url, Connector, OutboundFrame, Transport, TransportEvent};
use crate::{ChannelNotice, ConnectionState, InboundMessage, OutboundRequest, RealtimeError, ReconnectPolicy};

pub type MessageHandler = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub endpoint: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub connect_timeout: Duration,
    pub history_limit: Option<usize>,
}

impl ChannelConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let defaults = RealtimeConfig::default();
        Self {
            endpoint: endpoint.into(),
            max_reconnect_attempts: defaults.max_reconnect_attempts,
            reconnect_base_delay: defaults.reconnect_base_delay(),
            connect_timeout: defaults.connect_timeout(),
            history_limit: defaults.history_limit,
        }
    }

    pub fn from_realtime_config(config: &RealtimeConfig) -> Result<Self, RealtimeError> {
        Ok(Self {
            endpoint: endpoint_url(&config.origin, &config.path)?,
            max_reconnect_attempts: config.max_reconnect_attempts,
            reconnect_base_delay: config.reconnect_base_delay(),
            connect_timeout: config.connect_timeout(),
            history_limit: config.history_limit,
        })
    }
}

// ==============================================================================
// SHARED STATE
// ==============================================================================

struct Shared {
    state: watch::Sender<ConnectionState>,
    enabled: AtomicBool,
    // Guards both the live writer and the Open transition so that `send`
    // never observes one without the other.
    outbound: Mutex<Option<mpsc::UnboundedSender<OutboundFrame>>>,
    history: RwLock<VecDeque<InboundMessage>>,
    history_limit: Option<usize>,
    evicted: AtomicU64,
    subscribers: Mutex<Vec<(u64, MessageHandler)>>,
    next_subscriber: AtomicU64,
    notices: broadcast::Sender<ChannelNotice>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Realtime channel {:?} -> {:?}", previous, state);
        }
    }

    fn record(&self, message: InboundMessage) {
        let mut history = self.history.write().unwrap_or_else(PoisonError::into_inner);
        history.push_back(message);
        if let Some(limit) = self.history_limit {
            while history.len() > limit {
                history.pop_front();
                let evicted = self.evicted.fetch_add(1, Ordering::Relaxed) + 1;
                debug!("Realtime history over {} entries, evicted oldest ({} so far)", limit, evicted);
            }
        }
    }

    fn dispatch(&self, message: &InboundMessage) {
        let handlers: Vec<(u64, MessageHandler)> = lock(&self.subscribers).clone();
        for (id, handler) in handlers {
            if panic::catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
                error!("Realtime subscriber {} panicked handling '{}'", id, message.tag());
            }
        }
    }

    fn remove_subscriber(&self, id: u64) {
        lock(&self.subscribers).retain(|(existing, _)| *existing != id);
    }
}

/// Handle returned by [`RealtimeChannel::subscribe`].
pub struct Subscription {
    id: u64,
    shared: Weak<Shared>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unsubscribe(self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.remove_subscriber(self.id);
        }
    }
}

enum Command {
    Connect(Identity),
    SetEnabled(bool),
    ClearIdentity,
    Shutdown,
}

// ==============================================================================
// CHANNEL HANDLE
// ==============================================================================

/// A single realtime connection per identity session.
///
/// All lifecycle methods are non-blocking: they queue a command for the
/// channel task, which owns the transport, the reconnect policy and the
/// persisted enabled flag. Observers read `connected`, `enabled`,
/// `messages` and `state` at any time. The task stops on [`shutdown`] or
/// once every handle has been dropped.
///
/// [`shutdown`]: RealtimeChannel::shutdown
#[derive(Clone)]
pub struct RealtimeChannel {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl RealtimeChannel {
    /// Spawns the channel task on the current tokio runtime. The channel
    /// starts `Disconnected`; call [`connect`](Self::connect) once an
    /// identity is available.
    pub fn spawn<C: Connector>(
        config: ChannelConfig,
        connector: Arc<C>,
        preferences: Arc<dyn PreferenceStore>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (notices, _) = broadcast::channel(16);
        let enabled = read_enabled(preferences.as_ref());

        let shared = Arc::new(Shared {
            state,
            enabled: AtomicBool::new(enabled),
            outbound: Mutex::new(None),
            history: RwLock::new(VecDeque::new()),
            history_limit: config.history_limit,
            evicted: AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber: AtomicU64::new(1),
            notices,
        });

        let (commands, command_rx) = mpsc::unbounded_channel();
        let actor = ChannelActor {
            policy: ReconnectPolicy::new(config.max_reconnect_attempts, config.reconnect_base_delay),
            config,
            connector,
            preferences,
            shared: Arc::clone(&shared),
            commands: command_rx,
            identity: None,
            pending: None,
            link: None,
            retry: None,
        };

        info!("Realtime channel created for {} (enabled: {})", actor.config.endpoint, enabled);
        tokio::spawn(actor.run());

        Self { commands, shared }
    }

    pub fn connect(&self, identity: Identity) {
        self.command(Command::Connect(identity));
    }

    /// Closes the connection and disables automatic reconnects until
    /// `set_enabled(true)`. Same as `set_enabled(false)`.
    pub fn disconnect(&self) {
        self.set_enabled(false);
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::SeqCst);
        self.command(Command::SetEnabled(enabled));
    }

    /// Forgets the identity (logout): closes the connection without touching
    /// the persisted enabled flag.
    pub fn clear_identity(&self) {
        self.command(Command::ClearIdentity);
    }

    /// Closes the connection and stops the channel task.
    pub fn shutdown(&self) {
        self.command(Command::Shutdown);
    }

    /// Writes one frame if the channel is open. Nothing is queued when it is
    /// not; retrying is up to the caller.
    pub fn send(&self, request: &OutboundRequest) -> bool {
        let outbound = lock(&self.shared.outbound);

        if self.shared.state() != ConnectionState::Open {
            warn!("Realtime channel not open, dropping '{}' message", request.tag());
            return false;
        }

        let frame = match request.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode '{}' message: {}", request.tag(), e);
                return false;
            }
        };

        match outbound.as_ref() {
            Some(writer) if writer.send(OutboundFrame::Text(frame)).is_ok() => true,
            _ => {
                warn!("Realtime transport gone, dropping '{}' message", request.tag());
                false
            }
        }
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        let id = self.shared.next_subscriber.fetch_add(1, Ordering::Relaxed);
        lock(&self.shared.subscribers).push((id, Arc::new(handler)));
        Subscription {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
    }

    /// Every message received so far, oldest first.
    pub fn messages(&self) -> Vec<InboundMessage> {
        self.shared
            .history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Messages dropped from the front of the history by `history_limit`.
    pub fn evicted_messages(&self) -> u64 {
        self.shared.evicted.load(Ordering::Relaxed)
    }

    pub fn notices(&self) -> broadcast::Receiver<ChannelNotice> {
        self.shared.notices.subscribe()
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("Realtime channel task has stopped, ignoring command");
        }
    }
}

// ==============================================================================
// CHANNEL TASK
// ==============================================================================

type PendingOpen = BoxFuture<'static, Result<Transport, RealtimeError>>;

struct ChannelActor<C: Connector> {
    config: ChannelConfig,
    connector: Arc<C>,
    preferences: Arc<dyn PreferenceStore>,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    identity: Option<Identity>,
    policy: ReconnectPolicy,
    // At most one of `pending` and `link` is set. Clearing a field drops the
    // underlying future or receiver, so nothing from a replaced transport or
    // a cancelled timer is ever observed.
    pending: Option<PendingOpen>,
    link: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    retry: Option<Pin<Box<Sleep>>>,
}

async fn opened(pending: &mut Option<PendingOpen>) -> Result<Transport, RealtimeError> {
    match pending {
        Some(open) => open.await,
        None => std::future::pending().await,
    }
}

async fn next_event(link: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>) -> Option<TransportEvent> {
    match link {
        Some(inbound) => inbound.recv().await,
        None => std::future::pending().await,
    }
}

async fn retry_due(retry: &mut Option<Pin<Box<Sleep>>>) {
    match retry {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

impl<C: Connector> ChannelActor<C> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                result = opened(&mut self.pending) => {
                    self.pending = None;
                    self.on_open_result(result);
                }
                event = next_event(&mut self.link) => self.on_transport_event(event),
                _ = retry_due(&mut self.retry) => {
                    self.retry = None;
                    self.on_retry_due();
                }
            }
        }

        self.close_transport();
        info!("Realtime channel for {} stopped", self.config.endpoint);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(identity) => self.connect(identity),
            Command::SetEnabled(true) => self.enable(),
            Command::SetEnabled(false) => self.disable(),
            Command::ClearIdentity => {
                info!("Identity cleared, closing realtime channel");
                self.identity = None;
                self.close_transport();
                self.policy.reset();
            }
            Command::Shutdown => {}
        }
    }

    fn connect(&mut self, identity: Identity) {
        self.identity = Some(identity);
        self.close_transport();

        if !self.shared.enabled.load(Ordering::SeqCst) {
            debug!("Realtime channel disabled, not connecting");
            return;
        }

        self.begin_open();
    }

    fn enable(&mut self) {
        self.persist_enabled(true);

        if self.identity.is_some() && !self.shared.state().is_live() {
            self.retry = None;
            self.policy.reset();
            self.begin_open();
        }
    }

    fn disable(&mut self) {
        self.persist_enabled(false);
        self.close_transport();
    }

    fn begin_open(&mut self) {
        let Some(identity) = self.identity.as_ref() else {
            return;
        };

        info!(
            "Connecting realtime channel to {} as {} {} (reconnect attempt {}/{})",
            self.config.endpoint,
            identity.role,
            identity.user_id,
            self.policy.attempt,
            self.policy.max_attempts
        );

        let connector = Arc::clone(&self.connector);
        let url = self.config.endpoint.clone();
        let timeout = self.config.connect_timeout;

        self.shared.set_state(ConnectionState::Connecting);
        self.pending = Some(Box::pin(async move {
            match tokio::time::timeout(timeout, connector.open(&url)).await {
                Ok(result) => result,
                Err(_) => Err(RealtimeError::ConnectTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                }),
            }
        }));
    }

    fn on_open_result(&mut self, result: Result<Transport, RealtimeError>) {
        let transport = match result {
            Ok(transport) => transport,
            Err(e) => {
                warn!("Realtime connection to {} failed: {}", self.config.endpoint, e);
                self.on_unexpected_close();
                return;
            }
        };

        let Some(identity) = self.identity.as_ref() else {
            let _ = transport.outbound.send(OutboundFrame::Close);
            self.shared.set_state(ConnectionState::Disconnected);
            return;
        };

        let auth = match OutboundRequest::auth(identity).to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode auth frame: {}", e);
                let _ = transport.outbound.send(OutboundFrame::Close);
                self.on_unexpected_close();
                return;
            }
        };

        if transport.outbound.send(OutboundFrame::Text(auth)).is_err() {
            warn!("Realtime transport closed before auth could be sent");
            self.on_unexpected_close();
            return;
        }

        {
            let mut outbound = lock(&self.shared.outbound);
            *outbound = Some(transport.outbound);
            self.shared.set_state(ConnectionState::Open);
        }
        self.link = Some(transport.inbound);
        self.policy.reset();

        info!("Realtime channel open at {}", self.config.endpoint);
    }

    fn on_transport_event(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Frame(frame)) => self.deliver(&frame),
            Some(TransportEvent::Closed(reason)) => {
                warn!(
                    "Realtime connection closed by peer{}",
                    reason.map(|r| format!(": {}", r)).unwrap_or_default()
                );
                self.on_unexpected_close();
            }
            Some(TransportEvent::Error(e)) => {
                warn!("Realtime transport error: {}", e);
                self.on_unexpected_close();
            }
            None => {
                warn!("Realtime transport ended without a close");
                self.on_unexpected_close();
            }
        }
    }

    fn deliver(&mut self, frame: &str) {
        let message = match InboundMessage::parse(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("Discarding malformed realtime frame: {}", e);
                return;
            }
        };

        debug!("Realtime message '{}' received", message.tag());
        self.shared.record(message.clone());
        self.shared.dispatch(&message);
    }

    fn on_unexpected_close(&mut self) {
        self.drop_transport();
        self.shared.set_state(ConnectionState::Disconnected);

        if !self.shared.enabled.load(Ordering::SeqCst) || self.identity.is_none() {
            return;
        }

        match self.policy.next_delay() {
            Some(delay) => {
                info!(
                    "Reconnecting realtime channel in {} ms (attempt {}/{})",
                    delay.as_millis(),
                    self.policy.attempt,
                    self.policy.max_attempts
                );
                self.retry = Some(Box::pin(tokio::time::sleep(delay)));
            }
            None => {
                let notice = ChannelNotice::ConnectionLost {
                    attempts: self.policy.max_attempts,
                };
                warn!(
                    "Realtime reconnect budget of {} attempts exhausted, disabling channel",
                    self.policy.max_attempts
                );
                self.shared.enabled.store(false, Ordering::SeqCst);
                self.persist_enabled(false);
                let _ = self.shared.notices.send(notice);
            }
        }
    }

    fn on_retry_due(&mut self) {
        if self.shared.enabled.load(Ordering::SeqCst) && self.pending.is_none() && self.link.is_none() {
            self.begin_open();
        }
    }

    /// Expected close: no reconnect is scheduled and any pending one is
    /// cancelled.
    fn close_transport(&mut self) {
        self.retry = None;
        self.pending = None;

        if self.link.is_some() {
            self.shared.set_state(ConnectionState::Closing);
            if let Some(writer) = lock(&self.shared.outbound).as_ref() {
                let _ = writer.send(OutboundFrame::Close);
            }
        }

        self.drop_transport();
        self.shared.set_state(ConnectionState::Disconnected);
    }

    fn drop_transport(&mut self) {
        lock(&self.shared.outbound).take();
        self.link = None;
    }

    fn persist_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::SeqCst);
        if let Err(e) = write_enabled(self.preferences.as_ref(), enabled) {
            warn!("Failed to persist realtime preference: {}", e);
        }
    }
}
