//! Builder for constructing Client instances.

use crate::api::InstanceApi;
use crate::backoff::BackoffPolicy;
use crate::client::{Client, ClientParts, ClientSettings};
use crate::connection::{ConnectionSettings, Transport};
use crate::core::{ConfigStore, ConfigTemplate};
use crate::error::Result;
use crate::heartbeat::HeartbeatSettings;
use std::path::PathBuf;
use std::sync::Arc;

#[cfg(feature = "http")]
use crate::api::HttpInstanceApi;

#[cfg(feature = "websocket")]
use crate::connection::WebSocketTransport;

#[cfg(feature = "metrics")]
use crate::metrics::SyncMetrics;

/// Template file loaded when no template is given.
pub const DEFAULT_TEMPLATE_PATH: &str = "confsync.config.yml";

enum TemplateSource {
    Parsed(ConfigTemplate),
    File(PathBuf),
    Yaml(String),
}

impl TemplateSource {
    fn load(self) -> Result<ConfigTemplate> {
        match self {
            TemplateSource::Parsed(template) => Ok(template),
            TemplateSource::File(path) => ConfigTemplate::from_path(path),
            TemplateSource::Yaml(yaml) => ConfigTemplate::parse(&yaml),
        }
    }
}

/// Builder for constructing a [`Client`].
///
/// Everything has a default: the template is read from
/// [`DEFAULT_TEMPLATE_PATH`], settings come from the environment, and the
/// HTTP API and WebSocket transport are used when their features are enabled.
///
/// # Examples
///
/// ```rust,no_run
/// use confsync::prelude::*;
/// use std::time::Duration;
///
/// # fn example() -> Result<()> {
/// let settings = ClientSettings::builder()
///     .with_access_token("secret")
///     .with_application_name("billing")
///     .with_environment_name("production")
///     .with_api_base_url("https://api.example.com")
///     .with_websocket_base_url("wss://ws.example.com")
///     .with_heartbeat_interval(Duration::from_secs(30))
///     .build()?;
///
/// let client = Client::builder()
///     .with_template_file("config/confsync.config.yml")
///     .with_settings(settings)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder {
    template: Option<TemplateSource>,
    settings: Option<ClientSettings>,
    api: Option<Arc<dyn InstanceApi>>,
    transport: Option<Arc<dyn Transport>>,
    connection_settings: ConnectionSettings,
    heartbeat_settings: Option<HeartbeatSettings>,
    reconnect_policy: BackoffPolicy,
    #[cfg(feature = "metrics")]
    meter: Option<opentelemetry::metrics::Meter>,
}

impl ClientBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            template: None,
            settings: None,
            api: None,
            transport: None,
            connection_settings: ConnectionSettings::default(),
            heartbeat_settings: None,
            reconnect_policy: BackoffPolicy::RECONNECT,
            #[cfg(feature = "metrics")]
            meter: None,
        }
    }

    /// Use an already parsed template.
    pub fn with_template(mut self, template: ConfigTemplate) -> Self {
        self.template = Some(TemplateSource::Parsed(template));
        self
    }

    /// Read the template from a YAML file at build time.
    pub fn with_template_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.template = Some(TemplateSource::File(path.into()));
        self
    }

    /// Parse the template from YAML text at build time.
    pub fn with_template_yaml(mut self, yaml: impl Into<String>) -> Self {
        self.template = Some(TemplateSource::Yaml(yaml.into()));
        self
    }

    /// Use explicit settings instead of [`ClientSettings::from_env`].
    pub fn with_settings(mut self, settings: ClientSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Use a custom instance API.
    pub fn with_api(mut self, api: Arc<dyn InstanceApi>) -> Self {
        self.api = Some(api);
        self
    }

    /// Use a custom transport for the duplex connection.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Override the ping interval and connection reconnect schedule.
    pub fn with_connection_settings(mut self, settings: ConnectionSettings) -> Self {
        self.connection_settings = settings;
        self
    }

    /// Override the heartbeat tunables.
    ///
    /// Takes precedence over [`ClientSettings::heartbeat_interval`].
    pub fn with_heartbeat_settings(mut self, settings: HeartbeatSettings) -> Self {
        self.heartbeat_settings = Some(settings);
        self
    }

    /// Override the schedule of full reconnects.
    pub fn with_reconnect_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.reconnect_policy = policy;
        self
    }

    /// Record sync metrics with the given meter.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, meter: opentelemetry::metrics::Meter) -> Self {
        self.meter = Some(meter);
        self
    }

    /// Build the client. Nothing is contacted until [`Client::connect`].
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The template is missing or invalid
    /// - Required settings are missing
    /// - No API or transport is given and the default one is not compiled in
    pub fn build(self) -> Result<Client> {
        let template = self
            .template
            .unwrap_or_else(|| TemplateSource::File(PathBuf::from(DEFAULT_TEMPLATE_PATH)))
            .load()?;

        let settings = match self.settings {
            Some(settings) => settings,
            None => ClientSettings::from_env()?,
        };

        let api = match self.api {
            Some(api) => api,
            None => default_api(&settings)?,
        };

        let transport = match self.transport {
            Some(transport) => transport,
            None => default_transport()?,
        };

        let heartbeat_settings = self.heartbeat_settings.unwrap_or(HeartbeatSettings {
            interval: settings.heartbeat_interval,
            ..HeartbeatSettings::default()
        });

        let store = Arc::new(ConfigStore::load(&template));

        #[cfg(feature = "metrics")]
        let metrics = self.meter.map(|meter| {
            let metrics = SyncMetrics::new(meter);
            let recorder = metrics.clone();
            store
                .subscribe(move |update| recorder.record_config_update(update.changes.len()))
                .detach();
            metrics
        });

        Ok(Client::from_parts(ClientParts {
            settings,
            template,
            store,
            api,
            transport,
            connection_settings: self.connection_settings,
            heartbeat_settings,
            reconnect_policy: self.reconnect_policy,
            #[cfg(feature = "metrics")]
            metrics,
        }))
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "http")]
fn default_api(settings: &ClientSettings) -> Result<Arc<dyn InstanceApi>> {
    let api = HttpInstanceApi::builder()
        .with_base_url(settings.api_base_url.as_str())
        .with_access_token(settings.access_token.as_str())
        .build()?;
    Ok(Arc::new(api))
}

#[cfg(not(feature = "http"))]
fn default_api(_settings: &ClientSettings) -> Result<Arc<dyn InstanceApi>> {
    Err(crate::error::ConfigError::SettingsError(
        "no instance API given and the `http` feature is disabled".to_string(),
    ))
}

#[cfg(feature = "websocket")]
fn default_transport() -> Result<Arc<dyn Transport>> {
    Ok(Arc::new(WebSocketTransport::new()))
}

#[cfg(not(feature = "websocket"))]
fn default_transport() -> Result<Arc<dyn Transport>> {
    Err(crate::error::ConfigError::SettingsError(
        "no transport given and the `websocket` feature is disabled".to_string(),
    ))
}
