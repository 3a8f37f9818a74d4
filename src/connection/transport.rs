//! Abstract duplex transport.

use crate::error::Result;
use async_trait::async_trait;

/// Opens duplex text-frame links to an endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a link to `endpoint`.
    ///
    /// Resolves once the link is usable, or with the error that prevented it.
    async fn open(&self, endpoint: &str) -> Result<TransportLink>;
}

/// Outbound half of a link.
#[async_trait]
pub trait FrameSink: Send {
    /// Send one text frame.
    async fn send(&mut self, frame: String) -> Result<()>;

    /// Close the link. Closing twice is not an error.
    async fn close(&mut self) -> Result<()>;
}

/// Inbound half of a link.
#[async_trait]
pub trait FrameStream: Send {
    /// The next text frame.
    ///
    /// `None` means the peer closed the link. An `Err` means the link broke.
    async fn next_frame(&mut self) -> Option<Result<String>>;
}

/// An open link, split into its two halves.
pub struct TransportLink {
    /// Outbound half
    pub sink: Box<dyn FrameSink>,
    /// Inbound half
    pub stream: Box<dyn FrameStream>,
}

impl TransportLink {
    /// Pair two halves into a link.
    pub fn new(sink: impl FrameSink + 'static, stream: impl FrameStream + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            stream: Box::new(stream),
        }
    }
}
