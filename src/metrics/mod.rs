//! OpenTelemetry metrics for the sync engine.
//!
//! Tracks:
//! - Connect attempts, successes, failures and their duration
//! - Full reconnects
//! - Config updates applied and properties changed
//! - Heartbeat cycles that ran out of retries
//!
//! # Examples
//!
//! ```rust,no_run
//! use confsync::prelude::*;
//! use opentelemetry::global;
//!
//! # fn example() -> Result<()> {
//! let client = Client::builder()
//!     .with_template_file("confsync.config.yml")
//!     .with_metrics(global::meter("my-app"))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

mod sync_metrics;

pub use sync_metrics::SyncMetrics;
