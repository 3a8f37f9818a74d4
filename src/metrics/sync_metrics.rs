//! Sync metrics tracking using OpenTelemetry.

use opentelemetry::metrics::{Counter, Histogram, Meter};
use std::time::Instant;

/// Metrics collector for the client's sync operations.
///
/// # Examples
///
/// ```rust,no_run
/// use confsync::metrics::SyncMetrics;
/// use opentelemetry::global;
///
/// let metrics = SyncMetrics::new(global::meter("confsync"));
///
/// let timer = metrics.start_connect();
/// // ... connect ...
/// metrics.record_connect_success(timer);
/// ```
#[derive(Clone)]
pub struct SyncMetrics {
    connect_attempts: Counter<u64>,
    connect_success: Counter<u64>,
    connect_failures: Counter<u64>,
    connect_duration: Histogram<f64>,
    reconnects: Counter<u64>,
    config_updates: Counter<u64>,
    changed_properties: Counter<u64>,
    heartbeat_failures: Counter<u64>,
}

impl SyncMetrics {
    /// Create a new metrics collector with the provided meter.
    pub fn new(meter: Meter) -> Self {
        Self {
            connect_attempts: meter
                .u64_counter("confsync.connect.attempts")
                .with_description("Total number of connect attempts")
                .build(),
            connect_success: meter
                .u64_counter("confsync.connect.success")
                .with_description("Number of successful connects")
                .build(),
            connect_failures: meter
                .u64_counter("confsync.connect.failures")
                .with_description("Number of failed connects")
                .build(),
            connect_duration: meter
                .f64_histogram("confsync.connect.duration")
                .with_description("Duration of connect operations in seconds")
                .with_unit("s")
                .build(),
            reconnects: meter
                .u64_counter("confsync.reconnects")
                .with_description("Number of full reconnects started")
                .build(),
            config_updates: meter
                .u64_counter("confsync.config.updates")
                .with_description("Number of config updates that changed at least one property")
                .build(),
            changed_properties: meter
                .u64_counter("confsync.config.changed_properties")
                .with_description("Number of property changes applied")
                .build(),
            heartbeat_failures: meter
                .u64_counter("confsync.heartbeat.failures")
                .with_description("Number of heartbeat cycles that ran out of retries")
                .build(),
        }
    }

    /// Count a connect attempt and start timing it.
    pub fn start_connect(&self) -> Instant {
        self.connect_attempts.add(1, &[]);
        Instant::now()
    }

    /// Record a successful connect started at `start`.
    pub fn record_connect_success(&self, start: Instant) {
        self.connect_success.add(1, &[]);
        self.connect_duration.record(start.elapsed().as_secs_f64(), &[]);
    }

    /// Record a failed connect started at `start`.
    pub fn record_connect_failure(&self, start: Instant) {
        self.connect_failures.add(1, &[]);
        self.connect_duration.record(start.elapsed().as_secs_f64(), &[]);
    }

    /// Record the start of a full reconnect.
    pub fn record_reconnect(&self) {
        self.reconnects.add(1, &[]);
    }

    /// Record an applied config update.
    pub fn record_config_update(&self, changed: usize) {
        self.config_updates.add(1, &[]);
        self.changed_properties
            .add(u64::try_from(changed).unwrap_or(u64::MAX), &[]);
    }

    /// Record a heartbeat cycle that ran out of retries.
    pub fn record_heartbeat_failure(&self) {
        self.heartbeat_failures.add(1, &[]);
    }
}
