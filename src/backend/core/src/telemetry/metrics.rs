//! Prometheus metrics for jobs, tasks and the stats pipeline.
//!
//! Metrics are emitted through the `metrics` facade; when no recorder is
//! installed every call is a no-op, which keeps tests free of global state.
//!
//! # Example
//!
//! ```rust,no_run
//! use fanout_core::telemetry::metrics::JobMetrics;
//!
//! JobMetrics::record_job_submitted("SYNTHETIC");
//! JobMetrics::record_task_retry("SYNTHETIC");
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Address the scrape endpoint is expected on (informational for the recorder)
    #[serde(default = "default_metrics_endpoint")]
    pub endpoint: String,

    /// Histogram buckets for durations (in seconds)
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
            endpoint: default_metrics_endpoint(),
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_endpoint() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
}

/// Handle over the installed Prometheus recorder.
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
    /// A registry with no recorder installed.
    pub fn disabled() -> Self {
        Self {
            prometheus_handle: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.prometheus_handle.is_some()
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Install the Prometheus recorder and describe all metrics.
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

    tracing::info!(
        service_name = %service_name,
        endpoint = %config.endpoint,
        "Metrics initialized"
    );

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

fn register_metric_descriptions() {
    describe_counter!("fanout_errors_total", "Total number of errors by code");

    // Job metrics
    describe_counter!("fanout_jobs_submitted_total", "Total number of jobs submitted");
    describe_counter!(
        "fanout_jobs_finished_total",
        "Total number of jobs that reached a terminal status"
    );
    describe_counter!("fanout_jobs_reprocessed_total", "Total number of reprocess requests");
    describe_counter!("fanout_tasks_submitted_total", "Total tasks produced by decomposition");
    describe_histogram!(
        "fanout_decomposition_duration_seconds",
        "Time spent decomposing a job into tasks"
    );

    // Task metrics
    describe_counter!("fanout_task_results_total", "Task results reported by outcome");
    describe_counter!("fanout_task_retries_total", "Task attempts retried in place");
    describe_counter!("fanout_tasks_dropped_total", "Tasks dropped without a result");
    describe_histogram!("fanout_task_duration_seconds", "Task execution duration in seconds");
    describe_gauge!("fanout_running_tasks", "Number of tasks currently executing");

    // Stats pipeline metrics
    describe_counter!("fanout_stats_messages_total", "Stats messages consumed by the aggregator");
    describe_counter!("fanout_stats_failures_total", "Job stats that failed to apply");

    // Worker pools
    describe_gauge!("fanout_worker_utilization", "Worker pool utilization (0-1)");

    describe_histogram!("operation_duration_seconds", "Duration of timed operations");
}

/// Job and task level metrics.
pub struct JobMetrics;

impl JobMetrics {
    pub fn record_job_submitted(job_type: &'static str) {
        counter!("fanout_jobs_submitted_total", "job_type" => job_type).increment(1);
    }

    pub fn record_job_finished(job_type: &'static str, status: &'static str) {
        counter!(
            "fanout_jobs_finished_total",
            "job_type" => job_type,
            "status" => status,
        )
        .increment(1);
    }

    pub fn record_job_reprocessed(job_type: &'static str, general_error: bool) {
        counter!(
            "fanout_jobs_reprocessed_total",
            "job_type" => job_type,
            "general_error" => general_error.to_string(),
        )
        .increment(1);
    }

    pub fn record_tasks_submitted(job_type: &'static str, count: u32) {
        counter!("fanout_tasks_submitted_total", "job_type" => job_type).increment(u64::from(count));
    }

    pub fn record_task_result(job_type: &'static str, outcome: &'static str, duration: Duration) {
        counter!(
            "fanout_task_results_total",
            "job_type" => job_type,
            "outcome" => outcome,
        )
        .increment(1);
        histogram!("fanout_task_duration_seconds", "job_type" => job_type)
            .record(duration.as_secs_f64());
    }

    pub fn record_task_retry(job_type: &'static str) {
        counter!("fanout_task_retries_total", "job_type" => job_type).increment(1);
    }

    pub fn record_task_dropped(job_type: &'static str, reason: &'static str) {
        counter!(
            "fanout_tasks_dropped_total",
            "job_type" => job_type,
            "reason" => reason,
        )
        .increment(1);
    }

    pub fn set_running_tasks(job_type: &'static str, count: usize) {
        gauge!("fanout_running_tasks", "job_type" => job_type).set(count as f64);
    }

    pub fn record_stats_batch(messages: usize, failures: usize) {
        counter!("fanout_stats_messages_total").increment(messages as u64);
        if failures > 0 {
            counter!("fanout_stats_failures_total").increment(failures as u64);
        }
    }

    pub fn set_worker_utilization(pool: &str, utilization: f64) {
        gauge!("fanout_worker_utilization", "pool" => pool.to_string()).set(utilization);
    }
}

/// Tracks operation timing and records it on `finish`.
pub struct OperationTimer {
    start: Instant,
    operation_name: &'static str,
    labels: Vec<(&'static str, String)>,
}

impl OperationTimer {
    /// Start timing an operation.
    pub fn start(operation_name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation_name,
            labels: Vec::new(),
        }
    }

    pub fn label(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.labels.push((key, value.into()));
        self
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Finish and record to `operation_duration_seconds`.
    pub fn finish(self) -> Duration {
        let duration = self.start.elapsed();

        let mut labels = vec![metrics::Label::new("operation", self.operation_name)];
        labels.extend(
            self.labels
                .into_iter()
                .map(|(k, v)| metrics::Label::new(k, v)),
        );
        histogram!("operation_duration_seconds", labels).record(duration.as_secs_f64());

        duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_config_defaults() {
        let config = MetricsConfig::default();
        assert!(config.enabled);
        assert_eq!(config.endpoint, "0.0.0.0:9090");
        assert!(!config.duration_buckets.is_empty());
    }

    #[test]
    fn test_disabled_registry_renders_empty() {
        let registry = MetricsRegistry::disabled();
        assert!(!registry.is_enabled());
        assert!(registry.render().is_empty());
    }

    #[test]
    fn test_operation_timer() {
        let timer = OperationTimer::start("decompose").label("job_type", "SYNTHETIC");

        std::thread::sleep(Duration::from_millis(10));
        let duration = timer.finish();

        assert!(duration.as_millis() >= 10);
    }

    #[test]
    fn test_job_metrics_without_recorder() {
        JobMetrics::record_job_submitted("SYNTHETIC");
        JobMetrics::record_task_result("SYNTHETIC", "SUCCESS", Duration::from_millis(3));
        JobMetrics::record_stats_batch(10, 1);
    }
}
