//! Client settings with environment overrides.

use crate::api::Tags;
use crate::error::{ConfigError, Result};
use crate::heartbeat::DEFAULT_HEARTBEAT_INTERVAL;
use config::{Config, Environment};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::warn;

/// Prefix of the environment variables read by default, e.g. `CONFSYNC_ACCESS_TOKEN`.
pub const DEFAULT_ENV_PREFIX: &str = "CONFSYNC";

/// Everything a client needs to talk to the configuration service.
///
/// Every field can be set through the builder or through an environment
/// variable named `<PREFIX>_<FIELD>`; the environment wins.
///
/// | Field                | Environment variable             |
/// |----------------------|----------------------------------|
/// | `access_token`       | `CONFSYNC_ACCESS_TOKEN`          |
/// | `application_name`   | `CONFSYNC_APPLICATION_NAME`      |
/// | `environment_name`   | `CONFSYNC_ENVIRONMENT_NAME`      |
/// | `api_base_url`       | `CONFSYNC_API_BASE_URL`          |
/// | `websocket_base_url` | `CONFSYNC_WEBSOCKET_BASE_URL`    |
/// | `heartbeat_interval` | `CONFSYNC_HEARTBEAT_INTERVAL_MS` |
#[derive(Clone, PartialEq)]
pub struct ClientSettings {
    /// Secret used to authenticate with the service
    pub access_token: String,
    /// Application the instance belongs to
    pub application_name: String,
    /// Environment the instance runs in
    pub environment_name: String,
    /// Base URL of the instance API
    pub api_base_url: String,
    /// Base URL of the duplex connection endpoint
    pub websocket_base_url: String,
    /// Time between heartbeat cycles
    pub heartbeat_interval: Duration,
    /// Instance annotations
    pub tags: Tags,
}

impl ClientSettings {
    /// Create a new builder.
    pub fn builder() -> ClientSettingsBuilder {
        ClientSettingsBuilder::new()
    }

    /// Load settings from the environment alone.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingSettings`] listing every required
    /// variable that is unset or empty.
    pub fn from_env() -> Result<Self> {
        Self::builder().build()
    }
}

impl fmt::Debug for ClientSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSettings")
            .field("access_token", &"<redacted>")
            .field("application_name", &self.application_name)
            .field("environment_name", &self.environment_name)
            .field("api_base_url", &self.api_base_url)
            .field("websocket_base_url", &self.websocket_base_url)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("tags", &self.tags)
            .finish()
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawSettings {
    access_token: Option<String>,
    application_name: Option<String>,
    environment_name: Option<String>,
    api_base_url: Option<String>,
    websocket_base_url: Option<String>,
    heartbeat_interval_ms: Option<String>,
}

/// Builder for [`ClientSettings`].
///
/// # Examples
///
/// ```rust
/// use confsync::client::ClientSettings;
/// use std::collections::HashMap;
///
/// let settings = ClientSettings::builder()
///     .with_access_token("ak_live_123")
///     .with_application_name("shop")
///     .with_environment_name("production")
///     .with_api_base_url("https://config.example.com/api")
///     .with_websocket_base_url("wss://config.example.com/ws")
///     .with_tag("region", "eu-west-1")
///     // Read overrides from this map instead of the process environment
///     .with_env_source(HashMap::new())
///     .build()?;
///
/// assert_eq!(settings.application_name, "shop");
/// # Ok::<(), confsync::error::ConfigError>(())
/// ```
pub struct ClientSettingsBuilder {
    access_token: Option<String>,
    application_name: Option<String>,
    environment_name: Option<String>,
    api_base_url: Option<String>,
    websocket_base_url: Option<String>,
    heartbeat_interval: Option<Duration>,
    tags: Tags,
    env_prefix: String,
    env_source: Option<HashMap<String, String>>,
}

impl ClientSettingsBuilder {
    /// Create a builder that reads overrides from the process environment.
    pub fn new() -> Self {
        Self {
            access_token: None,
            application_name: None,
            environment_name: None,
            api_base_url: None,
            websocket_base_url: None,
            heartbeat_interval: None,
            tags: Tags::new(),
            env_prefix: DEFAULT_ENV_PREFIX.to_string(),
            env_source: None,
        }
    }

    /// Set the access token.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Set the application name.
    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// Set the environment name.
    pub fn with_environment_name(mut self, name: impl Into<String>) -> Self {
        self.environment_name = Some(name.into());
        self
    }

    /// Set the instance API base URL.
    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = Some(url.into());
        self
    }

    /// Set the duplex connection base URL.
    pub fn with_websocket_base_url(mut self, url: impl Into<String>) -> Self {
        self.websocket_base_url = Some(url.into());
        self
    }

    /// Set the heartbeat interval.
    ///
    /// Default is 60 seconds.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    /// Add an instance tag.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Replace every instance tag.
    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }

    /// Read overrides from variables starting with `<prefix>_`.
    ///
    /// Default is `CONFSYNC`.
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Read overrides from `vars` instead of the process environment.
    pub fn with_env_source(mut self, vars: HashMap<String, String>) -> Self {
        self.env_source = Some(vars);
        self
    }

    /// Merge builder values with environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingSettings`] listing every required field
    /// that is unset or empty, or [`ConfigError::SettingsError`] if the
    /// environment cannot be read.
    pub fn build(self) -> Result<ClientSettings> {
        let mut builder = Config::builder();

        let provided = [
            ("access_token", self.access_token),
            ("application_name", self.application_name),
            ("environment_name", self.environment_name),
            ("api_base_url", self.api_base_url),
            ("websocket_base_url", self.websocket_base_url),
            (
                "heartbeat_interval_ms",
                self.heartbeat_interval.map(|i| i.as_millis().to_string()),
            ),
        ];
        for (key, value) in provided {
            if let Some(value) = value {
                builder = builder.set_default(key, value).map_err(settings_error)?;
            }
        }

        let raw: RawSettings = builder
            .add_source(Environment::with_prefix(&self.env_prefix).source(self.env_source))
            .build()
            .and_then(|config| config.try_deserialize::<RawSettings>())
            .map_err(settings_error)?;

        let mut missing = Vec::new();
        let mut require = |name: &str, value: Option<String>| match value {
            Some(value) if !value.is_empty() => value,
            _ => {
                missing.push(name.to_string());
                String::new()
            }
        };

        let access_token = require("access_token", raw.access_token);
        let application_name = require("application_name", raw.application_name);
        let environment_name = require("environment_name", raw.environment_name);
        let api_base_url = require("api_base_url", raw.api_base_url);
        let websocket_base_url = require("websocket_base_url", raw.websocket_base_url);

        if !missing.is_empty() {
            return Err(ConfigError::MissingSettings(missing));
        }

        Ok(ClientSettings {
            access_token,
            application_name,
            environment_name,
            api_base_url,
            websocket_base_url,
            heartbeat_interval: heartbeat_interval(raw.heartbeat_interval_ms.as_deref()),
            tags: self.tags,
        })
    }
}

impl Default for ClientSettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn settings_error(err: config::ConfigError) -> ConfigError {
    ConfigError::SettingsError(err.to_string())
}

/// Milliseconds to an interval; unset, zero or unparsable means the default.
fn heartbeat_interval(millis: Option<&str>) -> Duration {
    match millis.map(|m| m.trim().parse::<u64>()) {
        None | Some(Ok(0)) => DEFAULT_HEARTBEAT_INTERVAL,
        Some(Ok(ms)) => Duration::from_millis(ms),
        Some(Err(e)) => {
            warn!(error = %e, "Ignoring invalid heartbeat interval");
            DEFAULT_HEARTBEAT_INTERVAL
        }
    }
}
