//! Wire messages exchanged over the duplex connection.

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};

/// Discriminant of a [`Message`], used to route it to handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Liveness check sent by the client
    Ping,
    /// Answer to a ping
    Pong,
    /// A command pushed by the service
    CommandExecution,
}

/// A frame on the duplex connection, tagged by `kind`.
///
/// ```rust
/// use confsync::connection::{CommandKind, Message};
///
/// let message = Message::decode(r#"{
///     "kind": "command_execution",
///     "instanceId": "inst_1",
///     "environmentId": "env_1",
///     "commandExecutionId": "cmd_1",
///     "command": { "kind": "config_update", "details": {} }
/// }"#)?;
///
/// match message {
///     Message::CommandExecution { command, .. } => assert_eq!(command.kind, CommandKind::ConfigUpdate),
///     _ => unreachable!(),
/// }
/// # Ok::<(), confsync::error::ConfigError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Message {
    /// Liveness check
    Ping {
        /// Instance the ping belongs to
        instance_id: String,
    },
    /// Answer to a ping
    Pong {
        /// Instance the answer is addressed to
        instance_id: String,
    },
    /// A command for this instance
    CommandExecution {
        /// Instance the command is addressed to
        instance_id: String,
        /// Environment the instance runs in
        #[serde(default, skip_serializing_if = "Option::is_none")]
        environment_id: Option<String>,
        /// Id of this command execution
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command_execution_id: Option<String>,
        /// What to do
        command: Command,
    },
}

/// Kind of a pushed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// The instance's configuration changed on the service
    ConfigUpdate,
    /// Application defined command
    Custom,
    /// A command kind this client does not know about
    #[serde(other)]
    Unknown,
}

/// A command carried by [`Message::CommandExecution`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// What kind of command this is
    pub kind: CommandKind,
    /// Free-form command details
    #[serde(default)]
    pub details: serde_json::Value,
}

impl Message {
    /// A ping for the given instance.
    pub fn ping(instance_id: impl Into<String>) -> Self {
        Message::Ping {
            instance_id: instance_id.into(),
        }
    }

    /// The routing kind.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Ping { .. } => MessageKind::Ping,
            Message::Pong { .. } => MessageKind::Pong,
            Message::CommandExecution { .. } => MessageKind::CommandExecution,
        }
    }

    /// The instance this message belongs to.
    pub fn instance_id(&self) -> &str {
        match self {
            Message::Ping { instance_id }
            | Message::Pong { instance_id }
            | Message::CommandExecution { instance_id, .. } => instance_id,
        }
    }

    /// Parse a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Protocol`](crate::error::ConfigError::Protocol)
    /// if the frame is not a known message.
    pub fn decode(frame: &str) -> Result<Self> {
        serde_json::from_str(frame).map_err(|e| ConfigError::Protocol(e.to_string()))
    }

    /// Serialize to a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::SerializationError`] if the message cannot be
    /// rendered as JSON.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
