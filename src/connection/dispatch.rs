//! Routing of inbound messages to registered handlers.

use crate::connection::message::{Message, MessageKind};
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Handles inbound messages of one kind.
///
/// # Examples
///
/// ```rust
/// use async_trait::async_trait;
/// use confsync::connection::{Message, MessageHandler, MessageKind};
/// use confsync::error::Result;
///
/// struct PongLogger;
///
/// #[async_trait]
/// impl MessageHandler for PongLogger {
///     fn kind(&self) -> MessageKind {
///         MessageKind::Pong
///     }
///
///     async fn handle(&self, message: &Message) -> Result<()> {
///         println!("pong for {}", message.instance_id());
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// The message kind this handler receives.
    fn kind(&self) -> MessageKind;

    /// Handle one message.
    async fn handle(&self, message: &Message) -> Result<()>;
}

/// Kind to ordered handler list.
#[derive(Clone, Default)]
pub struct MessageDispatcher {
    handlers: Arc<RwLock<HashMap<MessageKind, Vec<Arc<dyn MessageHandler>>>>>,
}

impl MessageDispatcher {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler after every handler already registered for its kind.
    pub fn add_handler(&self, handler: Arc<dyn MessageHandler>) {
        self.handlers
            .write()
            .entry(handler.kind())
            .or_default()
            .push(handler);
    }

    /// Number of handlers registered for a kind.
    pub fn handler_count(&self, kind: MessageKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }

    /// Run every handler for the message's kind, one after another.
    ///
    /// Stops at the first handler that fails and returns its error.
    pub async fn dispatch(&self, message: &Message) -> Result<()> {
        let handlers = self
            .handlers
            .read()
            .get(&message.kind())
            .cloned()
            .unwrap_or_default();

        debug!(
            kind = ?message.kind(),
            handlers = handlers.len(),
            "Handling message"
        );

        for handler in handlers {
            handler.handle(message).await?;
        }
        Ok(())
    }

    /// Decode a text frame and dispatch it.
    ///
    /// Frames that are not valid messages and handler failures are logged and
    /// dropped; neither affects the connection.
    pub async fn handle_frame(&self, frame: &str) {
        let message = match Message::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping malformed message");
                return;
            }
        };

        if let Err(e) = self.dispatch(&message).await {
            warn!(kind = ?message.kind(), error = %e, "Error handling message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use parking_lot::Mutex;

    struct Recorder {
        kind: MessageKind,
        name: &'static str,
        fail: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        fn kind(&self) -> MessageKind {
            self.kind
        }

        async fn handle(&self, _message: &Message) -> Result<()> {
            self.log.lock().push(self.name);
            if self.fail {
                return Err(ConfigError::Other("handler failed".into()));
            }
            Ok(())
        }
    }

    fn recorder(
        kind: MessageKind,
        name: &'static str,
        fail: bool,
        log: &Arc<Mutex<Vec<&'static str>>>,
    ) -> Arc<dyn MessageHandler> {
        Arc::new(Recorder {
            kind,
            name,
            fail,
            log: Arc::clone(log),
        })
    }

    #[tokio::test]
    async fn test_handlers_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = MessageDispatcher::new();
        dispatcher.add_handler(recorder(MessageKind::Pong, "first", false, &log));
        dispatcher.add_handler(recorder(MessageKind::Ping, "other", false, &log));
        dispatcher.add_handler(recorder(MessageKind::Pong, "second", false, &log));

        dispatcher
            .dispatch(&Message::Pong {
                instance_id: "i".into(),
            })
            .await
            .unwrap();

        assert_eq!(*log.lock(), vec!["first", "second"]);
        assert_eq!(dispatcher.handler_count(MessageKind::Pong), 2);
    }

    #[tokio::test]
    async fn test_failing_handler_stops_the_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = MessageDispatcher::new();
        dispatcher.add_handler(recorder(MessageKind::Ping, "fails", true, &log));
        dispatcher.add_handler(recorder(MessageKind::Ping, "skipped", false, &log));

        let result = dispatcher.dispatch(&Message::ping("i")).await;
        assert!(result.is_err());
        assert_eq!(*log.lock(), vec!["fails"]);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_dropped() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = MessageDispatcher::new();
        dispatcher.add_handler(recorder(MessageKind::Ping, "ping", false, &log));

        dispatcher.handle_frame("{not json").await;
        dispatcher.handle_frame(r#"{"kind":"ping"}"#).await;
        assert!(log.lock().is_empty());

        dispatcher
            .handle_frame(r#"{"kind":"ping","instanceId":"i"}"#)
            .await;
        assert_eq!(*log.lock(), vec!["ping"]);
    }
}
