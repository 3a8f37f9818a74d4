//! In-process transport for tests and local tooling.
//!
//! Every successful [`MemoryTransport::open`] produces a [`MemoryPeer`], the
//! service side of the link, which the caller picks up with
//! [`MemoryTransport::accept`].

use crate::connection::transport::{FrameSink, FrameStream, Transport, TransportLink};
use crate::error::{ConfigError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;

struct MemoryInner {
    refuse: AtomicBool,
    attempts: AtomicUsize,
    endpoints: Mutex<Vec<String>>,
    accepted_tx: mpsc::UnboundedSender<MemoryPeer>,
    accepted_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryPeer>>,
}

/// A [`Transport`] whose links live entirely in memory.
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<MemoryInner>,
}

impl MemoryTransport {
    /// Create a transport that accepts every open.
    pub fn new() -> Self {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(MemoryInner {
                refuse: AtomicBool::new(false),
                attempts: AtomicUsize::new(0),
                endpoints: Mutex::new(Vec::new()),
                accepted_tx,
                accepted_rx: tokio::sync::Mutex::new(accepted_rx),
            }),
        }
    }

    /// Make subsequent opens fail (or succeed again).
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of opens attempted so far, refused ones included.
    pub fn open_attempts(&self) -> usize {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Endpoint of every open attempt, in order.
    pub fn endpoints(&self) -> Vec<String> {
        self.inner.endpoints.lock().clone()
    }

    /// Wait for the service side of the next successful open.
    pub async fn accept(&self) -> Option<MemoryPeer> {
        self.inner.accepted_rx.lock().await.recv().await
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, endpoint: &str) -> Result<TransportLink> {
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);
        self.inner.endpoints.lock().push(endpoint.to_string());

        if self.inner.refuse.load(Ordering::SeqCst) {
            return Err(ConfigError::Transport(format!(
                "connection to {} refused",
                endpoint
            )));
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let fail_sends = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(AtomicBool::new(false));

        let peer = MemoryPeer {
            endpoint: endpoint.to_string(),
            outbound: outbound_rx,
            inbound: Mutex::new(Some(inbound_tx)),
            fail_sends: Arc::clone(&fail_sends),
            closed: Arc::clone(&closed),
        };
        self.inner
            .accepted_tx
            .send(peer)
            .map_err(|_| ConfigError::Transport("memory transport is gone".into()))?;

        Ok(TransportLink::new(
            MemorySink {
                outbound: outbound_tx,
                fail_sends,
                closed,
            },
            MemoryStream { inbound: inbound_rx },
        ))
    }
}

/// The service side of one in-memory link.
///
/// Dropping the peer closes the link.
pub struct MemoryPeer {
    endpoint: String,
    outbound: mpsc::UnboundedReceiver<String>,
    inbound: Mutex<Option<mpsc::UnboundedSender<Result<String>>>>,
    fail_sends: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl MemoryPeer {
    /// The endpoint the client opened.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Deliver a frame to the client. Returns `false` if the link is gone.
    pub fn push(&self, frame: impl Into<String>) -> bool {
        self.deliver(Ok(frame.into()))
    }

    /// Break the link with an error.
    pub fn push_error(&self, message: impl Into<String>) -> bool {
        let delivered = self.deliver(Err(ConfigError::Transport(message.into())));
        self.inbound.lock().take();
        delivered
    }

    /// Close the link from the service side.
    pub fn close(&self) {
        self.inbound.lock().take();
    }

    /// Make the client's sends fail (or succeed again).
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Whether the client closed its side.
    pub fn is_closed_by_client(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The next frame the client sent; `None` once the client side is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.outbound.recv().await
    }

    /// A frame the client already sent, without waiting.
    pub fn try_recv(&mut self) -> Option<String> {
        self.outbound.try_recv().ok()
    }

    fn deliver(&self, item: Result<String>) -> bool {
        self.inbound
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(item).is_ok())
    }
}

struct MemorySink {
    outbound: mpsc::UnboundedSender<String>,
    fail_sends: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: String) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
            return Err(ConfigError::Transport("send failed".into()));
        }
        self.outbound
            .send(frame)
            .map_err(|_| ConfigError::Transport("peer is gone".into()))
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryStream {
    inbound: mpsc::UnboundedReceiver<Result<String>>,
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn next_frame(&mut self) -> Option<Result<String>> {
        self.inbound.recv().await
    }
}
