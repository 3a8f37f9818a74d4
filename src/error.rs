//! Error types for confsync.

/// Result type alias for confsync operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur while defining, syncing, or reading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config template could not be found.
    #[error("Config template not found: {0}")]
    MissingTemplate(String),

    /// The config template could not be parsed or is structurally invalid.
    #[error("Invalid config template: {0}")]
    InvalidTemplate(String),

    /// Required client settings were not provided.
    #[error(
        "Missing values for required settings: [{}]. Provide them through the builder or as environment variables.",
        .0.join(", ")
    )]
    MissingSettings(Vec<String>),

    /// Client settings were provided but could not be loaded.
    #[error("Failed to load client settings: {0}")]
    SettingsError(String),

    /// A remote API call failed.
    #[error("API request failed: {0}")]
    Api(String),

    /// The remote API answered with a payload we could not use.
    #[error("Invalid response from API: {0}")]
    InvalidResponse(String),

    /// The transport failed to open, send, or receive.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A frame could not be decoded into a known message.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A message was sent before the connection was established.
    #[error("Tried to send a message before establishing a connection")]
    NotConnected,

    /// A heartbeat could not be delivered after all retries.
    #[error("Failed to send a heartbeat after {attempts} attempts")]
    HeartbeatFailed {
        /// Number of attempts made during the failed cycle
        attempts: u32,
    },

    /// The client could not connect to the configuration service.
    #[error("Failed to establish a connection to the configuration service: {0}")]
    Connection(Box<ConfigError>),

    /// The operation was cancelled because its owner was stopped.
    #[error("Operation cancelled")]
    Cancelled,

    /// A value could not be serialized to JSON.
    #[error("Failed to serialize: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// IO error occurred.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Generic error for other cases.
    #[error("Configuration error: {0}")]
    Other(String),
}

impl ConfigError {
    /// Wrap an error as a connection failure, unless it already is one.
    pub fn connection(err: ConfigError) -> Self {
        match err {
            err @ ConfigError::Connection(_) => err,
            err => ConfigError::Connection(Box::new(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_settings_message_lists_fields() {
        let err = ConfigError::MissingSettings(vec![
            "application_name".to_string(),
            "environment_name".to_string(),
        ]);
        assert!(
            err.to_string()
                .contains("[application_name, environment_name]")
        );
    }

    #[test]
    fn test_json_errors_are_not_protocol_errors() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: ConfigError = json_err.into();
        assert!(matches!(err, ConfigError::SerializationError(_)));
    }

    #[test]
    fn test_connection_does_not_double_wrap() {
        let err = ConfigError::connection(ConfigError::connection(ConfigError::NotConnected));
        match err {
            ConfigError::Connection(inner) => assert!(matches!(*inner, ConfigError::NotConnected)),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
