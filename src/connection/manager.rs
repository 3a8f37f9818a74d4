//! Lifecycle of the duplex connection: open, ping, dispatch, reconnect.

use crate::backoff::BackoffPolicy;
use crate::connection::dispatch::{MessageDispatcher, MessageHandler};
use crate::connection::message::Message;
use crate::connection::transport::{FrameSink, FrameStream, Transport, TransportLink};
use crate::error::{ConfigError, Result};
use crate::notify::{Event, SubscriberRegistry, SubscriptionHandle};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Interval between liveness pings.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(20);

/// State of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No link, and none being opened
    Disconnected,
    /// A link is being opened
    Connecting,
    /// A link is open
    Connected,
}

/// Kinds of [`ConnectionEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEventKind {
    /// See [`ConnectionEvent::Connected`]
    Connected,
    /// See [`ConnectionEvent::Error`]
    Error,
    /// See [`ConnectionEvent::Closed`]
    Closed,
}

/// Something that happened to the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// A link was opened.
    Connected,
    /// Opening failed, or an open link broke.
    Error(String),
    /// The peer closed the link.
    Closed,
}

impl Event for ConnectionEvent {
    type Kind = ConnectionEventKind;

    fn kind(&self) -> ConnectionEventKind {
        match self {
            ConnectionEvent::Connected => ConnectionEventKind::Connected,
            ConnectionEvent::Error(_) => ConnectionEventKind::Error,
            ConnectionEvent::Closed => ConnectionEventKind::Closed,
        }
    }
}

/// Tunables of a [`ConnectionManager`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionSettings {
    /// Interval between liveness pings; the first ping is sent on open
    pub ping_interval: Duration,
    /// Reconnect schedule
    pub backoff: BackoffPolicy,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            backoff: BackoffPolicy::CONNECTION,
        }
    }
}

#[derive(Clone)]
struct Link {
    sink: Arc<tokio::sync::Mutex<Box<dyn FrameSink>>>,
    broken: CancellationToken,
}

impl Link {
    async fn send(&self, frame: String) -> Result<()> {
        let result = self.sink.lock().await.send(frame).await;
        if let Err(e) = &result {
            debug!(error = %e, "Error sending message");
            self.broken.cancel();
        }
        result
    }

    async fn close(&self) {
        if let Err(e) = self.sink.lock().await.close().await {
            debug!(error = %e, "Error closing connection");
        }
    }
}

struct Shared {
    state: ConnectionState,
    link: Option<Link>,
    session: Option<CancellationToken>,
    generation: u64,
}

struct Inner {
    endpoint_base: String,
    transport: Arc<dyn Transport>,
    settings: ConnectionSettings,
    dispatcher: MessageDispatcher,
    events: SubscriberRegistry<ConnectionEvent>,
    reconnects: AtomicU64,
    shared: Mutex<Shared>,
}

enum SessionEnd {
    Cancelled,
    Closed,
    Failed(ConfigError),
}

/// Keeps one duplex connection per instance open.
///
/// After a successful open the manager sends a ping right away and then every
/// [`ConnectionSettings::ping_interval`]. Inbound frames are decoded and handed
/// to the registered [`MessageHandler`]s one at a time. When the link closes
/// or breaks, exactly one reconnect is scheduled using the configured backoff,
/// and this repeats until [`disconnect`](Self::disconnect) is called.
///
/// Dropping the manager disconnects it.
///
/// # Examples
///
/// ```rust
/// use confsync::connection::{ConnectionManager, ConnectionState, MemoryTransport};
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> confsync::error::Result<()> {
/// let transport = MemoryTransport::new();
/// let manager = ConnectionManager::new("ws://localhost/instances", Arc::new(transport.clone()));
///
/// manager.connect("inst_1").await?;
/// assert_eq!(manager.state(), ConnectionState::Connected);
///
/// manager.disconnect();
/// assert_eq!(manager.state(), ConnectionState::Disconnected);
/// # Ok(())
/// # }
/// ```
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager that opens `<endpoint_base>/<instance id>`.
    pub fn new(endpoint_base: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self::with_settings(endpoint_base, transport, ConnectionSettings::default())
    }

    /// Create a manager with explicit tunables.
    pub fn with_settings(
        endpoint_base: impl Into<String>,
        transport: Arc<dyn Transport>,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                endpoint_base: endpoint_base.into(),
                transport,
                settings,
                dispatcher: MessageDispatcher::new(),
                events: SubscriberRegistry::new(),
                reconnects: AtomicU64::new(0),
                shared: Mutex::new(Shared {
                    state: ConnectionState::Disconnected,
                    link: None,
                    session: None,
                    generation: 0,
                }),
            }),
        }
    }

    /// Open the connection for an instance.
    ///
    /// Resolves on the first successful open, or with the first error that
    /// happens before one. Either way the manager keeps reconnecting in the
    /// background until [`disconnect`](Self::disconnect) is called.
    ///
    /// Calling this again replaces the current connection.
    pub async fn connect(&self, instance_id: &str) -> Result<()> {
        let (settle_tx, settle_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        let generation = {
            let mut shared = self.inner.shared.lock();
            if let Some(previous) = shared.session.replace(cancel.clone()) {
                previous.cancel();
            }
            shared.link = None;
            shared.state = ConnectionState::Connecting;
            shared.generation += 1;
            shared.generation
        };
        self.inner.reconnects.store(0, Ordering::Release);

        let endpoint = format!(
            "{}/{}",
            self.inner.endpoint_base.trim_end_matches('/'),
            instance_id
        );

        tokio::spawn(Arc::clone(&self.inner).supervise(
            endpoint,
            instance_id.to_string(),
            generation,
            cancel,
            settle_tx,
        ));

        settle_rx.await.unwrap_or(Err(ConfigError::Cancelled))
    }

    /// Close the connection and stop reconnecting.
    ///
    /// Takes effect immediately: any pending reconnect is cancelled and the
    /// open link, if any, is closed in the background. Idempotent.
    pub fn disconnect(&self) {
        let mut shared = self.inner.shared.lock();
        if let Some(session) = shared.session.take() {
            debug!("Disconnecting");
            session.cancel();
        }
        shared.link = None;
        shared.state = ConnectionState::Disconnected;
        shared.generation += 1;
    }

    /// Send a message over the open link.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotConnected`] if no link is open. If the
    /// transport fails to send, a reconnect is scheduled and the transport
    /// error is returned.
    pub async fn send(&self, message: &Message) -> Result<()> {
        let link = self
            .inner
            .shared
            .lock()
            .link
            .clone()
            .ok_or(ConfigError::NotConnected)?;

        debug!(kind = ?message.kind(), "Sending message");
        link.send(message.encode()?).await
    }

    /// Register a handler for inbound messages of its kind.
    pub fn add_handler(&self, handler: Arc<dyn MessageHandler>) {
        self.inner.dispatcher.add_handler(handler);
    }

    /// Subscribe to connection events of one kind.
    pub fn subscribe<F>(&self, kind: ConnectionEventKind, callback: F) -> SubscriptionHandle
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(kind, callback)
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.inner.shared.lock().state
    }

    /// Reconnects scheduled since the last [`connect`](Self::connect).
    pub fn reconnect_attempts(&self) -> u64 {
        self.inner.reconnects.load(Ordering::Acquire)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl Inner {
    async fn supervise(
        self: Arc<Self>,
        endpoint: String,
        instance_id: String,
        generation: u64,
        cancel: CancellationToken,
        settle: oneshot::Sender<Result<()>>,
    ) {
        let mut settle = Some(settle);
        let mut backoff = self.settings.backoff.backoff();

        loop {
            self.set_state(generation, ConnectionState::Connecting);
            debug!(endpoint = %endpoint, "Opening connection");

            let opened = tokio::select! {
                _ = cancel.cancelled() => break,
                opened = self.transport.open(&endpoint) => opened,
            };

            match opened {
                Ok(TransportLink { sink, stream }) => {
                    backoff.reset();
                    let link = Link {
                        sink: Arc::new(tokio::sync::Mutex::new(sink)),
                        broken: CancellationToken::new(),
                    };

                    if !self.attach(generation, link.clone()) {
                        link.close().await;
                        break;
                    }

                    info!(instance_id = %instance_id, "Connection established");
                    self.events.notify(&ConnectionEvent::Connected);
                    if let Some(settle) = settle.take() {
                        let _ = settle.send(Ok(()));
                    }

                    let end = self.run_session(&instance_id, stream, &link, &cancel).await;

                    self.detach(generation);
                    link.close().await;

                    match end {
                        SessionEnd::Cancelled => break,
                        SessionEnd::Closed => {
                            info!(instance_id = %instance_id, "Connection was closed");
                            self.events.notify(&ConnectionEvent::Closed);
                        }
                        SessionEnd::Failed(e) => {
                            error!(instance_id = %instance_id, error = %e, "Connection encountered an error");
                            self.events.notify(&ConnectionEvent::Error(e.to_string()));
                        }
                    }
                }
                Err(e) => {
                    error!(endpoint = %endpoint, error = %e, "Failed to open connection");
                    self.set_state(generation, ConnectionState::Disconnected);
                    self.events.notify(&ConnectionEvent::Error(e.to_string()));
                    if let Some(settle) = settle.take() {
                        let _ = settle.send(Err(e));
                    }
                }
            }

            if cancel.is_cancelled() {
                break;
            }

            let delay = backoff.duration();
            self.reconnects.fetch_add(1, Ordering::AcqRel);
            info!(
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Scheduling reconnection attempt"
            );

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        debug!(endpoint = %endpoint, "Connection supervisor stopped");
    }

    async fn run_session(
        &self,
        instance_id: &str,
        mut stream: Box<dyn FrameStream>,
        link: &Link,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let period = self.settings.ping_interval.max(Duration::from_millis(1));
        let mut ping = tokio::time::interval(period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return SessionEnd::Cancelled,
                _ = link.broken.cancelled() => {
                    return SessionEnd::Failed(ConfigError::Transport("failed to send a message".into()));
                }
                frame = stream.next_frame() => match frame {
                    Some(Ok(frame)) => {
                        debug!(instance_id = %instance_id, "Received message");
                        tokio::select! {
                            _ = cancel.cancelled() => return SessionEnd::Cancelled,
                            _ = self.dispatcher.handle_frame(&frame) => {}
                        }
                    }
                    Some(Err(e)) => return SessionEnd::Failed(e),
                    None => return SessionEnd::Closed,
                },
                _ = ping.tick() => {
                    let frame = match Message::ping(instance_id).encode() {
                        Ok(frame) => frame,
                        Err(e) => return SessionEnd::Failed(e),
                    };
                    if let Err(e) = link.send(frame).await {
                        warn!(instance_id = %instance_id, error = %e, "Failed to send ping");
                        return SessionEnd::Failed(e);
                    }
                }
            }
        }
    }

    fn set_state(&self, generation: u64, state: ConnectionState) {
        let mut shared = self.shared.lock();
        if shared.generation == generation {
            shared.state = state;
        }
    }

    fn attach(&self, generation: u64, link: Link) -> bool {
        let mut shared = self.shared.lock();
        if shared.generation != generation {
            return false;
        }
        shared.link = Some(link);
        shared.state = ConnectionState::Connected;
        true
    }

    fn detach(&self, generation: u64) {
        let mut shared = self.shared.lock();
        if shared.generation == generation {
            shared.link = None;
            shared.state = ConnectionState::Disconnected;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::memory::{MemoryPeer, MemoryTransport};
    use crate::connection::message::MessageKind;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;
    use tokio::time::Instant;
    use tokio_test::{assert_err, assert_ok};

    fn manager(transport: &MemoryTransport) -> ConnectionManager {
        ConnectionManager::new("ws://svc/instances/", Arc::new(transport.clone()))
    }

    async fn connected(transport: &MemoryTransport) -> (ConnectionManager, MemoryPeer) {
        let manager = manager(transport);
        assert_ok!(manager.connect("inst_1").await);
        let peer = transport.accept().await.unwrap();
        (manager, peer)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    struct Forward {
        kind: MessageKind,
        tx: mpsc::UnboundedSender<Message>,
    }

    #[async_trait]
    impl MessageHandler for Forward {
        fn kind(&self) -> MessageKind {
            self.kind
        }

        async fn handle(&self, message: &Message) -> Result<()> {
            let _ = self.tx.send(message.clone());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_pings_immediately() {
        let transport = MemoryTransport::new();
        let (manager, mut peer) = connected(&transport).await;

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(peer.endpoint(), "ws://svc/instances/inst_1");

        let ping = Message::decode(&peer.recv().await.unwrap()).unwrap();
        assert_eq!(ping, Message::ping("inst_1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pings_repeat_on_interval() {
        let transport = MemoryTransport::new();
        let (_manager, mut peer) = connected(&transport).await;

        peer.recv().await.unwrap();
        let start = Instant::now();
        peer.recv().await.unwrap();
        assert_eq!(start.elapsed(), DEFAULT_PING_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connect_rejects_then_retries() {
        let transport = MemoryTransport::new();
        transport.refuse_connections(true);
        let manager = manager(&transport);

        let start = Instant::now();
        let err = assert_err!(manager.connect("inst_1").await);
        assert!(matches!(err, ConfigError::Transport(_)));
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        transport.refuse_connections(false);
        let _peer = transport.accept().await.unwrap();

        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(3_000), "waited {waited:?}");
        assert!(waited <= Duration::from_millis(3_100), "waited {waited:?}");
        assert_eq!(manager.reconnect_attempts(), 1);
        settle().await;
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_close_schedules_one_reconnect() {
        let transport = MemoryTransport::new();
        let (manager, mut peer) = connected(&transport).await;

        for _ in 0..3 {
            peer.close();
            peer = transport.accept().await.unwrap();
        }

        assert_eq!(manager.reconnect_attempts(), 3);
        assert_eq!(transport.open_attempts(), 4);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.open_attempts(), 4);
        drop(peer);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_then_close_reconnects_once() {
        let transport = MemoryTransport::new();
        let (manager, peer) = connected(&transport).await;

        let errors = Arc::new(AtomicUsize::new(0));
        let errors_clone = Arc::clone(&errors);
        let _errors = manager.subscribe(ConnectionEventKind::Error, move |_| {
            errors_clone.fetch_add(1, Ordering::SeqCst);
        });

        peer.push_error("connection reset");
        let _next = transport.accept().await.unwrap();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(manager.reconnect_attempts(), 1);
        assert_eq!(transport.open_attempts(), 2);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_reconnect() {
        let transport = MemoryTransport::new();
        let (manager, peer) = connected(&transport).await;

        peer.close();
        while manager.reconnect_attempts() == 0 {
            tokio::task::yield_now().await;
        }

        manager.disconnect();
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(transport.open_attempts(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_closes_link() {
        let transport = MemoryTransport::new();
        let (manager, mut peer) = connected(&transport).await;

        manager.disconnect();
        manager.disconnect();

        while peer.recv().await.is_some() {}
        assert!(peer.is_closed_by_client());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(transport.open_attempts(), 1);
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let transport = MemoryTransport::new();
        let manager = manager(&transport);

        let err = assert_err!(manager.send(&Message::ping("inst_1")).await);
        assert!(matches!(err, ConfigError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_schedules_reconnect() {
        let transport = MemoryTransport::new();
        let (manager, mut peer) = connected(&transport).await;
        peer.recv().await.unwrap();

        peer.fail_sends(true);
        assert_err!(manager.send(&Message::ping("inst_1")).await);

        let _next = transport.accept().await.unwrap();
        assert_eq!(manager.reconnect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_ping_schedules_reconnect() {
        let transport = MemoryTransport::new();
        let (manager, mut peer) = connected(&transport).await;
        peer.recv().await.unwrap();

        peer.fail_sends(true);
        tokio::time::sleep(DEFAULT_PING_INTERVAL + Duration::from_secs(1)).await;

        assert_eq!(manager.reconnect_attempts(), 1);
        assert_eq!(transport.open_attempts(), 1);
        assert!(peer.is_closed_by_client());

        let next = transport.accept().await.unwrap();
        assert_eq!(next.endpoint(), "ws://svc/instances/inst_1");
        assert_eq!(transport.open_attempts(), 2);
        assert_eq!(manager.reconnect_attempts(), 1);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frames_are_dropped() {
        let transport = MemoryTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager = manager(&transport);
        manager.add_handler(Arc::new(Forward {
            kind: MessageKind::Pong,
            tx,
        }));

        assert_ok!(manager.connect("inst_1").await);
        let peer = transport.accept().await.unwrap();

        peer.push("{definitely not json");
        peer.push(r#"{"kind":"pong"}"#);
        peer.push(r#"{"kind":"pong","instanceId":"inst_1"}"#);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.instance_id(), "inst_1");
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(transport.open_attempts(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_follow_the_link() {
        let transport = MemoryTransport::new();
        let manager = manager(&transport);

        let connected_count = Arc::new(AtomicUsize::new(0));
        let closed_count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&connected_count);
        let _connected = manager.subscribe(ConnectionEventKind::Connected, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let c = Arc::clone(&closed_count);
        let _closed = manager.subscribe(ConnectionEventKind::Closed, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert_ok!(manager.connect("inst_1").await);
        let peer = transport.accept().await.unwrap();
        peer.close();
        let _next = transport.accept().await.unwrap();
        settle().await;

        assert_eq!(connected_count.load(Ordering::SeqCst), 2);
        assert_eq!(closed_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_reconnecting() {
        let transport = MemoryTransport::new();
        let (manager, peer) = connected(&transport).await;

        drop(manager);
        peer.close();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.open_attempts(), 1);
    }
}
