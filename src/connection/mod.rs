//! The duplex connection to the configuration service.
//!
//! [`ConnectionManager`] owns the connection lifecycle and works against the
//! [`Transport`] trait. [`WebSocketTransport`] is the production transport
//! (feature `websocket`); [`MemoryTransport`] keeps everything in process.

mod dispatch;
mod manager;
mod memory;
mod message;
mod transport;

#[cfg(feature = "websocket")]
mod websocket;

pub use dispatch::{MessageDispatcher, MessageHandler};
pub use manager::{
    ConnectionEvent, ConnectionEventKind, ConnectionManager, ConnectionSettings, ConnectionState,
    DEFAULT_PING_INTERVAL,
};
pub use memory::{MemoryPeer, MemoryTransport};
pub use message::{Command, CommandKind, Message, MessageKind};
pub use transport::{FrameSink, FrameStream, Transport, TransportLink};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketTransport;
