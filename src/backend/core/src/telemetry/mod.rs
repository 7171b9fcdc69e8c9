//! Telemetry: structured logging and Prometheus metrics.
//!
//! - **Logging**: `tracing-subscriber` with JSON/pretty/compact output
//! - **Metrics**: `metrics` facade backed by the Prometheus exporter, rendered
//!   by the lead server's debug endpoint
//!
//! # Example
//!
//! ```rust,no_run
//! use keel_core::config::Config;
//! use keel_core::telemetry::init_telemetry;
//!
//! let config = Config::default();
//! let _handle = init_telemetry(&config).expect("Failed to initialize telemetry");
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::{init_metrics, LifecycleMetrics, MetricsConfig, MetricsRegistry};

use crate::config::Config;

/// Handle for the installed telemetry stack.
#[derive(Debug, Clone)]
pub struct TelemetryHandle {
    /// Metrics registry for rendering
    pub metrics: MetricsRegistry,
}

/// Initialize logging and metrics from the application configuration.
///
/// Call once at process start, before any server is built.
///
/// # Errors
///
/// Returns an error if either component fails to initialize.
pub fn init_telemetry(config: &Config) -> anyhow::Result<TelemetryHandle> {
    let metrics = init_metrics(&config.metrics)?;
    init_logging(&config.logging, &config.environment)?;

    tracing::info!(
        environment = %config.environment,
        version = env!("CARGO_PKG_VERSION"),
        "Telemetry initialized"
    );

    Ok(TelemetryHandle { metrics })
}
