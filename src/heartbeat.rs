//! Periodic liveness reports with bounded retry.

use crate::api::InstanceApi;
use crate::backoff::BackoffPolicy;
use crate::error::{ConfigError, Result};
use crate::notify::{Event, SubscriberRegistry, SubscriptionHandle};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default time between the end of one heartbeat cycle and the next.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Tunables of a [`HeartbeatReporter`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeartbeatSettings {
    /// Pause between cycles
    pub interval: Duration,
    /// Retry schedule within a cycle
    pub retry: BackoffPolicy,
    /// Retries per cycle before the cycle is reported as failed
    pub max_attempts: u32,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_HEARTBEAT_INTERVAL,
            retry: BackoffPolicy::HEARTBEAT,
            max_attempts: 10,
        }
    }
}

/// Kinds of [`HeartbeatEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeartbeatEventKind {
    /// See [`HeartbeatEvent::Failed`]
    Failed,
}

/// Something that happened to the heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// A cycle ran out of retries.
    Failed {
        /// Instance the heartbeat was for
        instance_id: String,
        /// Calls made during the cycle
        attempts: u32,
    },
}

impl Event for HeartbeatEvent {
    type Kind = HeartbeatEventKind;

    fn kind(&self) -> HeartbeatEventKind {
        HeartbeatEventKind::Failed
    }
}

/// Reports an instance as alive on a fixed cadence.
///
/// The first heartbeat is sent as soon as the reporter starts. Failed calls
/// are retried with backoff; when a cycle runs out of retries a single
/// [`HeartbeatEvent::Failed`] is published. Either way the next cycle starts
/// one interval after the previous one ended.
pub struct HeartbeatReporter {
    instance_id: String,
    api: Arc<dyn InstanceApi>,
    settings: HeartbeatSettings,
    events: SubscriberRegistry<HeartbeatEvent>,
    running: Mutex<Option<CancellationToken>>,
}

impl HeartbeatReporter {
    /// Create a stopped reporter.
    pub fn new(
        instance_id: impl Into<String>,
        api: Arc<dyn InstanceApi>,
        settings: HeartbeatSettings,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            api,
            settings,
            events: SubscriberRegistry::new(),
            running: Mutex::new(None),
        }
    }

    /// Start sending heartbeats. Does nothing if already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        *running = Some(cancel.clone());

        debug!(
            instance_id = %self.instance_id,
            interval_ms = u64::try_from(self.settings.interval.as_millis()).unwrap_or(u64::MAX),
            "Starting heartbeat"
        );

        tokio::spawn(run(
            self.instance_id.clone(),
            Arc::clone(&self.api),
            self.settings,
            self.events.clone(),
            cancel,
        ));
    }

    /// Stop sending heartbeats and drop every failure listener.
    ///
    /// An in-flight call or retry wait is abandoned. Idempotent.
    pub fn stop(&self) {
        if let Some(cancel) = self.running.lock().take() {
            debug!(instance_id = %self.instance_id, "Stopping heartbeat");
            cancel.cancel();
        }
        self.events.clear();
    }

    /// Whether the reporter has been started and not stopped since.
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Call `callback` whenever a cycle runs out of retries.
    pub fn on_failure<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(&HeartbeatEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(HeartbeatEventKind::Failed, callback)
    }

    /// The instance being reported.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

impl Drop for HeartbeatReporter {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(
    instance_id: String,
    api: Arc<dyn InstanceApi>,
    settings: HeartbeatSettings,
    events: SubscriberRegistry<HeartbeatEvent>,
    cancel: CancellationToken,
) {
    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = beat(&instance_id, api.as_ref(), &settings) => outcome,
        };

        if let Err(e) = outcome {
            warn!(instance_id = %instance_id, error = %e, "Heartbeat failed");
            if let ConfigError::HeartbeatFailed { attempts } = e {
                events.notify(&HeartbeatEvent::Failed {
                    instance_id: instance_id.clone(),
                    attempts,
                });
            }
        }

        if cancel.is_cancelled() {
            break;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(settings.interval) => {}
        }
    }
}

/// One heartbeat cycle: the initial call plus up to `max_attempts` retries.
async fn beat(instance_id: &str, api: &dyn InstanceApi, settings: &HeartbeatSettings) -> Result<()> {
    let mut backoff = settings.retry.backoff();

    loop {
        let error = match api.send_heartbeat(instance_id).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        if backoff.attempts() >= settings.max_attempts {
            return Err(ConfigError::HeartbeatFailed {
                attempts: backoff.attempts() + 1,
            });
        }

        let delay = backoff.duration();
        debug!(
            instance_id,
            error = %error,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            attempt = backoff.attempts(),
            max_attempts = settings.max_attempts,
            "Retrying heartbeat"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{CreateInstanceRequest, InstanceInfo};
    use crate::core::RawValueMap;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Default)]
    struct CountingApi {
        calls: AtomicU32,
        failing: AtomicBool,
        hang: AtomicBool,
    }

    impl CountingApi {
        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl InstanceApi for CountingApi {
        async fn create_instance(&self, _request: &CreateInstanceRequest) -> Result<InstanceInfo> {
            unimplemented!("not used by the heartbeat")
        }

        async fn get_instance_configuration(&self, _instance_id: &str) -> Result<RawValueMap> {
            unimplemented!("not used by the heartbeat")
        }

        async fn send_heartbeat(&self, _instance_id: &str) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(ConfigError::Api("503 Service Unavailable".into()));
            }
            Ok(())
        }
    }

    fn fast_settings() -> HeartbeatSettings {
        HeartbeatSettings {
            interval: Duration::from_secs(5),
            retry: BackoffPolicy::from_millis(100, 1_000, 2.0, 0),
            max_attempts: 2,
        }
    }

    fn failure_counter(reporter: &HeartbeatReporter) -> Arc<AtomicU32> {
        let failures = Arc::new(AtomicU32::new(0));
        let failures_clone = Arc::clone(&failures);
        reporter
            .on_failure(move |event| {
                let HeartbeatEvent::Failed { attempts, .. } = event;
                assert_eq!(*attempts, 3);
                failures_clone.fetch_add(1, Ordering::SeqCst);
            })
            .detach();
        failures
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_emit_one_failure_per_cycle() {
        let api = Arc::new(CountingApi::default());
        api.failing.store(true, Ordering::SeqCst);
        let reporter = HeartbeatReporter::new("inst_1", api.clone(), fast_settings());
        let failures = failure_counter(&reporter);

        reporter.start();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(api.calls(), 3);
        assert_eq!(failures.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(api.calls(), 3);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(api.calls(), 6);
        assert_eq!(failures.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_heartbeats_follow_interval() {
        let api = Arc::new(CountingApi::default());
        let reporter = HeartbeatReporter::new("inst_1", api.clone(), HeartbeatSettings::default());

        reporter.start();
        reporter.start();
        assert!(reporter.is_running());

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(api.calls(), 1);

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(api.calls(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(api.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_within_cycle() {
        let api = Arc::new(CountingApi::default());
        api.failing.store(true, Ordering::SeqCst);
        let reporter = HeartbeatReporter::new("inst_1", api.clone(), fast_settings());
        let failures = failure_counter(&reporter);

        reporter.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(api.calls(), 1);

        api.failing.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(api.calls(), 2);
        assert_eq!(failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_abandons_in_flight_call() {
        let api = Arc::new(CountingApi::default());
        api.hang.store(true, Ordering::SeqCst);
        let reporter = HeartbeatReporter::new("inst_1", api.clone(), fast_settings());

        reporter.start();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(api.calls(), 1);

        reporter.stop();
        reporter.stop();
        assert!(!reporter.is_running());

        api.hang.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_releases_listeners() {
        let api = Arc::new(CountingApi::default());
        api.failing.store(true, Ordering::SeqCst);
        let reporter = HeartbeatReporter::new("inst_1", api.clone(), fast_settings());
        let failures = failure_counter(&reporter);

        reporter.stop();
        reporter.start();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(api.calls(), 3);
        assert_eq!(failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_may_stop_reporter() {
        let api = Arc::new(CountingApi::default());
        api.failing.store(true, Ordering::SeqCst);
        let reporter = Arc::new(HeartbeatReporter::new("inst_1", api.clone(), fast_settings()));

        let weak = Arc::downgrade(&reporter);
        reporter
            .on_failure(move |_| {
                if let Some(reporter) = weak.upgrade() {
                    reporter.stop();
                }
            })
            .detach();

        reporter.start();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(api.calls(), 3);
        assert!(!reporter.is_running());
    }
}
