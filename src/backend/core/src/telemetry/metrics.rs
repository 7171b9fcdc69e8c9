//! Prometheus metrics for the scheduler, leadership and lifecycle phases.
//!
//! Recording goes through the `metrics` facade, so nothing here is required
//! for correctness: without an installed recorder every call is a no-op.
//!
//! # Example
//!
//! ```rust,no_run
//! use keel_core::telemetry::{init_metrics, MetricsConfig, LifecycleMetrics};
//!
//! let registry = init_metrics(&MetricsConfig::default()).expect("metrics");
//! LifecycleMetrics::job_run("crontab", "heartbeat");
//! println!("{}", registry.render());
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;

/// Handle of the recorder installed by [`init_metrics`].
static METRICS_REGISTRY: OnceLock<MetricsRegistry> = OnceLock::new();

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Histogram buckets for phase durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: BTreeMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            duration_buckets: default_duration_buckets(),
            global_labels: BTreeMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
}

/// Render access to the installed Prometheus recorder.
#[derive(Clone)]
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// A registry with no recorder behind it; renders as empty text.
    pub fn disabled() -> Self {
        Self {
            prometheus_handle: None,
        }
    }

    /// The registry installed by [`init_metrics`], if any.
    pub fn global() -> Option<&'static MetricsRegistry> {
        METRICS_REGISTRY.get()
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Install the Prometheus recorder and describe the crate's metrics.
///
/// # Errors
///
/// Fails when the buckets are invalid or another recorder is installed.
pub fn init_metrics(config: &MetricsConfig) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let mut builder = PrometheusBuilder::new();
    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }
    builder = builder.set_buckets(&config.duration_buckets)?;

    let handle = builder.install_recorder()?;
    describe_metrics();

    let registry = MetricsRegistry {
        prometheus_handle: Some(handle),
    };
    let _ = METRICS_REGISTRY.set(registry.clone());

    tracing::info!("Metrics recorder installed");
    Ok(registry)
}

fn describe_metrics() {
    describe_counter!("keel_cron_job_runs_total", "Job invocations launched by a cron engine");
    describe_counter!("keel_cron_job_failures_total", "Job invocations that returned an error or panicked");
    describe_counter!("keel_cron_jobs_retired_total", "Jobs with no further occurrences");
    describe_counter!("keel_leader_transitions_total", "Observed leadership transitions");
    describe_counter!("keel_leader_epochs_total", "Leader-only cron engines started");
    describe_gauge!("keel_is_leader", "1 while this replica holds leadership");
    describe_histogram!("keel_init_duration_seconds", "Wall time of each init group");
    describe_counter!("keel_cleanup_failures_total", "Cleanup groups that failed");
}

/// Recording helpers for lifecycle metrics.
pub struct LifecycleMetrics;

impl LifecycleMetrics {
    pub fn job_run(engine: &str, job: &str) {
        counter!(
            "keel_cron_job_runs_total",
            "engine" => engine.to_string(),
            "job" => job.to_string(),
        )
        .increment(1);
    }

    pub fn job_failure(engine: &str, job: &str) {
        counter!(
            "keel_cron_job_failures_total",
            "engine" => engine.to_string(),
            "job" => job.to_string(),
        )
        .increment(1);
    }

    pub fn job_retired(engine: &str, job: &str) {
        counter!(
            "keel_cron_jobs_retired_total",
            "engine" => engine.to_string(),
            "job" => job.to_string(),
        )
        .increment(1);
    }

    pub fn leadership_changed(is_leader: bool) {
        let to = if is_leader { "leader" } else { "follower" };
        counter!("keel_leader_transitions_total", "to" => to).increment(1);
        gauge!("keel_is_leader").set(if is_leader { 1.0 } else { 0.0 });
    }

    pub fn epoch_started() {
        counter!("keel_leader_epochs_total").increment(1);
    }

    pub fn init_group_finished(service: &str, elapsed: Duration) {
        histogram!("keel_init_duration_seconds", "service" => service.to_string())
            .record(elapsed.as_secs_f64());
    }

    pub fn cleanup_failed(service: &str) {
        counter!("keel_cleanup_failures_total", "service" => service.to_string()).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_config_defaults() {
        let config = MetricsConfig::default();
        assert!(config.enabled);
        assert!(!config.duration_buckets.is_empty());
        assert!(config.global_labels.is_empty());
    }

    #[test]
    fn test_disabled_registry_renders_empty() {
        let config = MetricsConfig {
            enabled: false,
            ..Default::default()
        };
        let registry = init_metrics(&config).unwrap();
        assert!(registry.render().is_empty());
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        LifecycleMetrics::job_run("crontab", "heartbeat");
        LifecycleMetrics::leadership_changed(true);
        LifecycleMetrics::init_group_finished("db", Duration::from_millis(5));
    }
}
