//! WebSocket transport.

use crate::connection::transport::{FrameSink, FrameStream, Transport, TransportLink};
use crate::error::{ConfigError, Result};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// [`Transport`] over WebSocket text frames.
///
/// `http://` and `https://` endpoints are opened as `ws://` and `wss://`.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    /// Create a WebSocket transport.
    pub fn new() -> Self {
        Self
    }
}

fn websocket_url(endpoint: &str) -> String {
    if let Some(rest) = endpoint.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = endpoint.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        endpoint.to_string()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, endpoint: &str) -> Result<TransportLink> {
        let url = websocket_url(endpoint);
        let (socket, response) = connect_async(url.as_str())
            .await
            .map_err(|e| ConfigError::Transport(format!("failed to connect to {}: {}", url, e)))?;

        debug!(url = %url, status = %response.status(), "WebSocket handshake completed");

        let (sink, stream) = socket.split();
        Ok(TransportLink::new(
            WebSocketSink { inner: sink },
            WebSocketFrames { inner: stream },
        ))
    }
}

struct WebSocketSink {
    inner: SplitSink<WsStream, WsMessage>,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, frame: String) -> Result<()> {
        self.inner
            .send(WsMessage::Text(frame))
            .await
            .map_err(|e| ConfigError::Transport(e.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        match self.inner.close().await {
            Ok(())
            | Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
            | Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(ConfigError::Transport(e.to_string())),
        }
    }
}

struct WebSocketFrames {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl FrameStream for WebSocketFrames {
    async fn next_frame(&mut self) -> Option<Result<String>> {
        loop {
            let message = match self.inner.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(ConfigError::Transport(e.to_string()))),
            };

            match message {
                WsMessage::Text(text) => return Some(Ok(text)),
                WsMessage::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(e) => warn!(error = %e, "Dropping binary frame that is not UTF-8"),
                },
                WsMessage::Close(frame) => {
                    debug!(frame = ?frame, "WebSocket closed by peer");
                    return None;
                }
                WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
            }
        }
    }
}
