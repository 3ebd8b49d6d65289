//! Prometheus metrics for admission decisions and job lifecycle.
//!
//! Call sites record through the small helper types here so metric names and
//! label sets stay in one place.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::collections::HashMap;

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Histogram buckets for job durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
}

/// Handle used by `GET /metrics` to render the Prometheus text format.
#[derive(Clone, Default)]
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
    /// A registry with no recorder installed; renders an empty body.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Install the Prometheus recorder.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let mut builder = PrometheusBuilder::new();
    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }
    builder = builder.set_buckets(&config.duration_buckets)?;

    let handle = builder.install_recorder()?;
    register_metric_descriptions();

    tracing::info!(service_name = %service_name, "Metrics initialized");

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

fn register_metric_descriptions() {
    describe_counter!(
        "tollgate_admission_decisions_total",
        "Admission decisions by policy and outcome"
    );
    describe_counter!(
        "tollgate_admission_degraded_total",
        "Admission decisions made without the shared store (fail-open)"
    );
    describe_histogram!(
        "tollgate_throttle_delay_seconds",
        "Delay imposed on throttled requests"
    );
    describe_counter!("tollgate_jobs_total", "Job lifecycle events by queue and event");
    describe_histogram!(
        "tollgate_job_duration_seconds",
        "Handler execution time per job attempt"
    );
    describe_gauge!("tollgate_queue_jobs", "Jobs per queue and state");
    describe_counter!("tollgate_errors_total", "Errors by code and category");
}

/// Admission decision metrics.
pub struct AdmissionMetrics;

impl AdmissionMetrics {
    pub fn record(policy: &'static str, allowed: bool) {
        counter!(
            "tollgate_admission_decisions_total",
            "policy" => policy,
            "outcome" => if allowed { "allowed" } else { "rejected" },
        )
        .increment(1);
    }

    pub fn degraded(policy: &'static str) {
        counter!("tollgate_admission_degraded_total", "policy" => policy).increment(1);
    }

    pub fn throttle_delay(seconds: f64) {
        histogram!("tollgate_throttle_delay_seconds").record(seconds);
    }
}

/// Job lifecycle metrics.
pub struct JobMetrics;

impl JobMetrics {
    pub fn event(queue: &str, event: &'static str) {
        counter!(
            "tollgate_jobs_total",
            "queue" => queue.to_string(),
            "event" => event,
        )
        .increment(1);
    }

    pub fn duration(queue: &str, seconds: f64) {
        histogram!("tollgate_job_duration_seconds", "queue" => queue.to_string()).record(seconds);
    }

    pub fn queue_depth(queue: &str, state: &'static str, count: u64) {
        gauge!(
            "tollgate_queue_jobs",
            "queue" => queue.to_string(),
            "state" => state,
        )
        .set(count as f64);
    }
}
