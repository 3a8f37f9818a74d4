//! The client: keeps a local config store in sync with the service.
//!
//! A [`Client`] registers the running process as an instance, pulls the
//! instance's configuration into its [`ConfigStore`], reports liveness with a
//! [`HeartbeatReporter`] and listens for pushed changes over a
//! [`ConnectionManager`]. Reads never touch the network.

mod builder;
mod handler;
mod settings;

pub use builder::{ClientBuilder, DEFAULT_TEMPLATE_PATH};
pub use handler::ConfigUpdateHandler;
pub use settings::{ClientSettings, ClientSettingsBuilder, DEFAULT_ENV_PREFIX};

use crate::api::{CreateInstanceRequest, InstanceApi, InstanceInfo};
use crate::backoff::BackoffPolicy;
use crate::connection::{ConnectionManager, ConnectionSettings, Transport};
use crate::core::{ConfigStore, ConfigTemplate, ConfigUpdate, RawValueMap, TypedValue, TypedValueMap};
use crate::error::{ConfigError, Result};
use crate::heartbeat::{HeartbeatEvent, HeartbeatReporter, HeartbeatSettings};
use crate::notify::SubscriptionHandle;
use arc_swap::ArcSwapOption;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(feature = "metrics")]
use crate::metrics::SyncMetrics;

/// Options for [`Client::connect_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Log a failed connect instead of returning it, keep serving the cached
    /// values and keep trying to connect in the background.
    pub continue_after_error: bool,
}

#[derive(Default)]
struct Session {
    heartbeat: Option<HeartbeatReporter>,
    connection: Option<ConnectionManager>,
}

impl Session {
    fn teardown(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop();
        }
        if let Some(connection) = self.connection.take() {
            connection.disconnect();
        }
    }
}

/// Lets `disconnect` abort an in-flight connect without the session lock.
#[derive(Default)]
struct ConnectGate {
    cancel: CancellationToken,
    pending_disconnects: usize,
}

pub(crate) struct ClientParts {
    pub(crate) settings: ClientSettings,
    pub(crate) template: ConfigTemplate,
    pub(crate) store: Arc<ConfigStore>,
    pub(crate) api: Arc<dyn InstanceApi>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) connection_settings: ConnectionSettings,
    pub(crate) heartbeat_settings: HeartbeatSettings,
    pub(crate) reconnect_policy: BackoffPolicy,
    #[cfg(feature = "metrics")]
    pub(crate) metrics: Option<SyncMetrics>,
}

struct ClientInner {
    settings: ClientSettings,
    template: ConfigTemplate,
    store: Arc<ConfigStore>,
    api: Arc<dyn InstanceApi>,
    transport: Arc<dyn Transport>,
    connection_settings: ConnectionSettings,
    heartbeat_settings: HeartbeatSettings,
    reconnect_policy: BackoffPolicy,
    session: tokio::sync::Mutex<Session>,
    connected: AtomicBool,
    instance: ArcSwapOption<InstanceInfo>,
    reconnecting: AtomicBool,
    reconnect_cancel: parking_lot::Mutex<CancellationToken>,
    connect_gate: parking_lot::Mutex<ConnectGate>,
    #[cfg(feature = "metrics")]
    metrics: Option<SyncMetrics>,
}

/// A remote configuration client.
///
/// Until [`connect`](Self::connect) succeeds, reads return the template
/// defaults. Cloning is cheap; clones share the same connection and store.
///
/// # Examples
///
/// ```rust,no_run
/// use confsync::prelude::*;
///
/// # async fn example() -> Result<()> {
/// let client = Client::builder()
///     .with_template_file("confsync.config.yml")
///     .build()?;
///
/// client.connect().await?;
///
/// let port = client.get("app.port");
/// let _handle = client.on_config_update(|update| {
///     for (id, change) in &update.changes {
///         println!("{id}: {} -> {}", change.old_value, change.new_value);
///     }
/// });
///
/// client.disconnect().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a new builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub(crate) fn from_parts(parts: ClientParts) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                settings: parts.settings,
                template: parts.template,
                store: parts.store,
                api: parts.api,
                transport: parts.transport,
                connection_settings: parts.connection_settings,
                heartbeat_settings: parts.heartbeat_settings,
                reconnect_policy: parts.reconnect_policy,
                session: tokio::sync::Mutex::new(Session::default()),
                connected: AtomicBool::new(false),
                instance: ArcSwapOption::empty(),
                reconnecting: AtomicBool::new(false),
                reconnect_cancel: parking_lot::Mutex::new(CancellationToken::new()),
                connect_gate: parking_lot::Mutex::new(ConnectGate::default()),
                #[cfg(feature = "metrics")]
                metrics: parts.metrics,
            }),
        }
    }

    /// Connect to the configuration service.
    ///
    /// Registers an instance, applies its configuration, starts the heartbeat
    /// and opens the duplex connection. Does nothing if already connected.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Connection`] wrapping the first step that failed,
    /// or [`ConfigError::Cancelled`] if [`disconnect`](Self::disconnect) is
    /// called meanwhile. Anything started before the failure is shut down again.
    pub async fn connect(&self) -> Result<()> {
        self.connect_with(ConnectOptions::default()).await
    }

    /// Connect with explicit options.
    ///
    /// # Errors
    ///
    /// Same as [`connect`](Self::connect), unless
    /// [`ConnectOptions::continue_after_error`] is set. A connect cancelled by
    /// [`disconnect`](Self::disconnect) is always returned.
    pub async fn connect_with(&self, options: ConnectOptions) -> Result<()> {
        match self.inner.establish().await {
            Ok(()) => Ok(()),
            Err(e) if is_cancelled(&e) => {
                debug!("Connect cancelled by disconnect");
                Err(e)
            }
            Err(e) if options.continue_after_error => {
                error!(error = %e, "Failed to connect, continuing with cached configuration");
                self.inner.spawn_reconnect();
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Failed to connect");
                Err(e)
            }
        }
    }

    /// Disconnect from the configuration service.
    ///
    /// Stops the heartbeat, closes the connection, forgets the instance and
    /// cancels any connect or reconnect in progress. Values already applied
    /// stay readable. Idempotent.
    pub async fn disconnect(&self) {
        self.inner.reconnect_cancel.lock().cancel();
        let _pending = PendingDisconnect::new(&self.inner);
        self.inner.teardown().await;
    }

    /// Disconnect, then try to connect until it works.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Cancelled`] if [`disconnect`](Self::disconnect)
    /// is called before a connection is established.
    pub async fn reconnect(&self) -> Result<()> {
        let cancel = self.inner.begin_reconnect();
        reconnect(Arc::downgrade(&self.inner), cancel).await
    }

    /// Current typed value of a property.
    ///
    /// Returns `None` (and logs a warning) for undeclared properties.
    pub fn get(&self, id: &str) -> Option<TypedValue> {
        self.inner.store.get(id)
    }

    /// Current raw value of a property.
    pub fn get_raw(&self, id: &str) -> Option<String> {
        self.inner.store.get_raw(id)
    }

    /// Every current value, typed.
    pub fn config(&self) -> TypedValueMap {
        self.inner.store.current_typed()
    }

    /// Every current value, raw.
    pub fn config_raw(&self) -> Arc<RawValueMap> {
        self.inner.store.current_raw()
    }

    /// Call `callback` with the changed properties after every update.
    ///
    /// Returns a handle that unsubscribes when dropped.
    pub fn on_config_update<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(&ConfigUpdate) + Send + Sync + 'static,
    {
        self.inner.store.subscribe(callback)
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.inner.store
    }

    /// The loaded template.
    pub fn template(&self) -> &ConfigTemplate {
        &self.inner.template
    }

    /// The settings in use.
    pub fn settings(&self) -> &ClientSettings {
        &self.inner.settings
    }

    /// Whether a session is established.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// The registered instance, while connected.
    pub fn instance(&self) -> Option<Arc<InstanceInfo>> {
        self.inner.instance.load_full()
    }

    /// Id of the registered instance, while connected.
    pub fn instance_id(&self) -> Option<String> {
        self.instance().map(|i| i.id.clone())
    }

    /// Human readable name of the registered instance, while connected.
    pub fn instance_name(&self) -> Option<String> {
        self.instance().map(|i| i.name.clone())
    }

    /// Dashboard URL of the registered instance, while connected.
    pub fn instance_url(&self) -> Option<String> {
        self.instance().map(|i| i.url.clone())
    }
}

impl ClientInner {
    async fn establish(self: &Arc<Self>) -> Result<()> {
        let mut session = self.session.lock().await;
        if self.connected.load(Ordering::Acquire) {
            return Ok(());
        }

        let cancel = {
            let mut gate = self.connect_gate.lock();
            if gate.pending_disconnects > 0 {
                return Err(ConfigError::connection(ConfigError::Cancelled));
            }
            if gate.cancel.is_cancelled() {
                gate.cancel = CancellationToken::new();
            }
            gate.cancel.clone()
        };

        #[cfg(feature = "metrics")]
        let timer = self.metrics.as_ref().map(SyncMetrics::start_connect);

        let result = tokio::select! {
            biased;

            _ = cancel.cancelled() => Err(ConfigError::Cancelled),
            result = self.open_session(&mut session) => result,
        };

        #[cfg(feature = "metrics")]
        if let (Some(metrics), Some(timer)) = (&self.metrics, timer) {
            match &result {
                Ok(()) => metrics.record_connect_success(timer),
                Err(_) => metrics.record_connect_failure(timer),
            }
        }

        match result {
            Ok(instance) => {
                self.connected.store(true, Ordering::Release);
                info!(
                    instance_name = %instance.name,
                    instance_url = %instance.url,
                    "Connected to the configuration service"
                );
                Ok(())
            }
            Err(e) => {
                session.teardown();
                self.instance.store(None);
                Err(ConfigError::connection(e))
            }
        }
    }

    async fn open_session(self: &Arc<Self>, session: &mut Session) -> Result<Arc<InstanceInfo>> {
        let request = CreateInstanceRequest::new(
            self.settings.application_name.as_str(),
            self.settings.environment_name.as_str(),
            &self.template,
            self.settings.tags.clone(),
        )?;

        let instance = Arc::new(self.api.create_instance(&request).await?);
        self.instance.store(Some(Arc::clone(&instance)));
        debug!(instance_id = %instance.id, "Instance registered");

        let values = self.api.get_instance_configuration(&instance.id).await?;
        self.store.apply_update(values);

        let heartbeat = HeartbeatReporter::new(
            instance.id.as_str(),
            Arc::clone(&self.api),
            self.heartbeat_settings,
        );
        let weak = Arc::downgrade(self);
        heartbeat
            .on_failure(move |event: &HeartbeatEvent| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                warn!(event = ?event, "Heartbeat failed, reconnecting");
                #[cfg(feature = "metrics")]
                if let Some(metrics) = &inner.metrics {
                    metrics.record_heartbeat_failure();
                }
                inner.spawn_reconnect();
            })
            .detach();
        heartbeat.start();
        session.heartbeat = Some(heartbeat);

        let connection = session.connection.insert(ConnectionManager::with_settings(
            self.settings.websocket_base_url.as_str(),
            Arc::clone(&self.transport),
            self.connection_settings,
        ));
        connection.add_handler(Arc::new(ConfigUpdateHandler::new(
            Arc::clone(&self.store),
            Arc::clone(&self.api),
        )));
        connection.connect(&instance.id).await?;

        Ok(instance)
    }

    async fn teardown(&self) {
        let mut session = self.session.lock().await;
        session.teardown();
        self.instance.store(None);
        if self.connected.swap(false, Ordering::AcqRel) {
            info!("Disconnected from the configuration service");
        }
    }

    /// Cancel any running reconnect and hand out the token for a new one.
    fn begin_reconnect(&self) -> CancellationToken {
        let mut slot = self.reconnect_cancel.lock();
        slot.cancel();
        *slot = CancellationToken::new();
        slot.clone()
    }

    /// Start a background reconnect unless one is already running.
    fn spawn_reconnect(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::AcqRel) {
            debug!("Reconnect already in progress");
            return;
        }

        let cancel = self.begin_reconnect();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let result = reconnect(weak.clone(), cancel).await;
            if let Some(inner) = weak.upgrade() {
                inner.reconnecting.store(false, Ordering::Release);
            }
            if let Err(e) = result {
                debug!(error = %e, "Background reconnect stopped");
            }
        });
    }
}

fn is_cancelled(err: &ConfigError) -> bool {
    match err {
        ConfigError::Connection(inner) => matches!(**inner, ConfigError::Cancelled),
        err => matches!(err, ConfigError::Cancelled),
    }
}

/// Marks a disconnect in flight for as long as it lives.
///
/// While any is alive, new connects bail out and the running one is
/// cancelled, so the disconnect never waits on a transport open.
struct PendingDisconnect<'a> {
    inner: &'a ClientInner,
}

impl<'a> PendingDisconnect<'a> {
    fn new(inner: &'a ClientInner) -> Self {
        let mut gate = inner.connect_gate.lock();
        gate.pending_disconnects += 1;
        gate.cancel.cancel();
        Self { inner }
    }
}

impl Drop for PendingDisconnect<'_> {
    fn drop(&mut self) {
        let mut gate = self.inner.connect_gate.lock();
        gate.pending_disconnects = gate.pending_disconnects.saturating_sub(1);
    }
}

/// Tear the session down, then establish a new one with backoff.
///
/// Holds the client only while an attempt runs, so dropping every handle to
/// the client ends the loop.
async fn reconnect(weak: Weak<ClientInner>, cancel: CancellationToken) -> Result<()> {
    let policy = {
        let inner = weak.upgrade().ok_or(ConfigError::Cancelled)?;

        #[cfg(feature = "metrics")]
        if let Some(metrics) = &inner.metrics {
            metrics.record_reconnect();
        }

        inner.teardown().await;
        inner.reconnect_policy
    };

    let mut backoff = policy.backoff();
    loop {
        if cancel.is_cancelled() {
            return Err(ConfigError::Cancelled);
        }

        {
            let inner = weak.upgrade().ok_or(ConfigError::Cancelled)?;
            info!(attempt = backoff.attempts() + 1, "Attempting to reconnect");
            match inner.establish().await {
                Ok(()) if cancel.is_cancelled() => {
                    inner.teardown().await;
                    return Err(ConfigError::Cancelled);
                }
                Ok(()) => return Ok(()),
                Err(e) => warn!(error = %e, "Reconnect attempt failed"),
            }
        }

        let delay = backoff.duration();
        tokio::select! {
            _ = cancel.cancelled() => return Err(ConfigError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
