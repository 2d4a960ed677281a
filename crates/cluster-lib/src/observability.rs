//! Observability infrastructure for the cluster simulation
//!
//! Provides:
//! - Prometheus metrics (failures, repair latency, utilization, latency estimate)
//! - Structured JSON logging with tracing

use prometheus::{
    register_gauge, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, Gauge, Histogram, IntCounter, IntCounterVec, IntGauge,
};
use crate::health::{ComponentStatus, HealthResponse};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{error, info, warn};

/// Histogram buckets for repair durations (in seconds)
const REPAIR_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 10.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ClusterMetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct ClusterMetricsInner {
    failures_total: IntCounter,
    repair_duration_seconds: Histogram,
    repairs_in_flight: IntGauge,
    repairs_abandoned_total: IntCounter,
    utilization_percent: Gauge,
    latency_estimate_ms: Gauge,
    failed_containers: IntGauge,
    containers_running: IntGauge,
    remediations_total: IntCounterVec,
}

impl ClusterMetricsInner {
    fn new() -> Self {
        Self {
            failures_total: register_int_counter!(
                "cluster_failures_total",
                "Total number of failed containers that were repaired"
            )
            .expect("Failed to register failures_total"),

            repair_duration_seconds: register_histogram!(
                "cluster_repair_duration_seconds",
                "Time from failure detection to replacement deployment",
                REPAIR_BUCKETS.to_vec()
            )
            .expect("Failed to register repair_duration_seconds"),

            repairs_in_flight: register_int_gauge!(
                "cluster_repairs_in_flight",
                "Number of failed containers currently being repaired"
            )
            .expect("Failed to register repairs_in_flight"),

            repairs_abandoned_total: register_int_counter!(
                "cluster_repairs_abandoned_total",
                "Repairs given up after exhausting the retry policy"
            )
            .expect("Failed to register repairs_abandoned_total"),

            utilization_percent: register_gauge!(
                "cluster_utilization_percent",
                "Used slots over total capacity, in percent"
            )
            .expect("Failed to register utilization_percent"),

            latency_estimate_ms: register_gauge!(
                "cluster_latency_estimate_ms",
                "Smoothed latency estimate derived from utilization"
            )
            .expect("Failed to register latency_estimate_ms"),

            failed_containers: register_int_gauge!(
                "cluster_failed_containers",
                "Failed containers awaiting detection at the last sample"
            )
            .expect("Failed to register failed_containers"),

            containers_running: register_int_gauge!(
                "cluster_containers_running",
                "Running containers at the last sample"
            )
            .expect("Failed to register containers_running"),

            remediations_total: register_int_counter_vec!(
                "cluster_remediations_total",
                "Control action decisions by kind",
                &["action"]
            )
            .expect("Failed to register remediations_total"),
        }
    }
}

/// Cluster metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct ClusterMetrics {
    _private: (),
}

impl Default for ClusterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ClusterMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ClusterMetricsInner {
        GLOBAL_METRICS.get_or_init(ClusterMetricsInner::new)
    }

    /// Record a completed repair
    pub fn observe_repair(&self, duration: Duration) {
        self.inner().failures_total.inc();
        self.inner()
            .repair_duration_seconds
            .observe(duration.as_secs_f64());
    }

    pub fn set_repairs_in_flight(&self, count: usize) {
        self.inner().repairs_in_flight.set(count as i64);
    }

    pub fn inc_repairs_abandoned(&self) {
        self.inner().repairs_abandoned_total.inc();
    }

    /// Update gauges from a monitor sample
    pub fn record_sample(
        &self,
        utilization_percent: f64,
        latency_estimate_ms: f64,
        failed: usize,
        running: usize,
    ) {
        let inner = self.inner();
        inner.utilization_percent.set(utilization_percent);
        inner.latency_estimate_ms.set(latency_estimate_ms);
        inner.failed_containers.set(failed as i64);
        inner.containers_running.set(running as i64);
    }

    pub fn inc_remediation(&self, action: &str) {
        self.inner()
            .remediations_total
            .with_label_values(&[action])
            .inc();
    }

    /// Prometheus text exposition of every registered metric
    pub fn encode_text(&self) -> Result<String, prometheus::Error> {
        use prometheus::{Encoder, TextEncoder};

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&prometheus::gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// Structured logger for cluster events
///
/// Provides consistent JSON-formatted logging for failures, repairs,
/// remediation decisions and lifecycle events.
#[derive(Clone)]
pub struct StructuredLogger {
    cluster_name: String,
}

impl StructuredLogger {
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
        }
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Log simulation startup
    pub fn log_startup(&self, version: &str, nodes: usize, capacity: usize) {
        info!(
            event = "cluster_started",
            cluster = %self.cluster_name,
            version = %version,
            nodes = nodes,
            capacity = capacity,
            "Cluster simulation started"
        );
    }

    /// Log a failed container picked up by the detection scan
    pub fn log_failure_detected(&self, container_id: u64, node_id: u32, service: &str) {
        warn!(
            event = "failure_detected",
            cluster = %self.cluster_name,
            container_id = container_id,
            node_id = node_id,
            service = %service,
            "Container failure detected"
        );
    }

    /// Log a replacement deployed for a failed container
    pub fn log_repair_completed(
        &self,
        failed_id: u64,
        replacement_id: u64,
        node_id: u32,
        service: &str,
        duration: Duration,
        attempts: u32,
    ) {
        info!(
            event = "repair_completed",
            cluster = %self.cluster_name,
            failed_container_id = failed_id,
            replacement_container_id = replacement_id,
            node_id = node_id,
            service = %service,
            repair_ms = duration.as_millis() as u64,
            attempts = attempts,
            "Container repaired"
        );
    }

    /// Log a repair given up on
    pub fn log_repair_abandoned(&self, failed_id: u64, service: &str, attempts: u32, reason: &str) {
        error!(
            event = "repair_abandoned",
            cluster = %self.cluster_name,
            failed_container_id = failed_id,
            service = %service,
            attempts = attempts,
            reason = %reason,
            "Repair abandoned"
        );
    }

    /// Log a control action decision other than steady state
    pub fn log_remediation(&self, action: &str, reasons: &[String]) {
        warn!(
            event = "remediation",
            cluster = %self.cluster_name,
            action = %action,
            reasons = ?reasons,
            "Control action triggered"
        );
    }

    /// Log a periodic or final report
    pub fn log_report(&self, failures: u64, avg_repair: Duration, used: usize, capacity: usize) {
        info!(
            event = "cluster_report",
            cluster = %self.cluster_name,
            failures = failures,
            avg_repair_ms = avg_repair.as_millis() as u64,
            used_slots = used,
            capacity = capacity,
            "Cluster report"
        );
    }

    /// Log overall component health, naming every component not healthy
    pub fn log_health(&self, health: &HealthResponse) {
        let mut impaired: Vec<String> = health
            .components
            .iter()
            .filter(|(_, c)| c.status != ComponentStatus::Healthy)
            .map(|(name, c)| match &c.message {
                Some(message) => format!("{name}: {message}"),
                None => name.clone(),
            })
            .collect();
        impaired.sort();

        match health.status {
            ComponentStatus::Healthy => info!(
                event = "cluster_health",
                cluster = %self.cluster_name,
                status = "healthy",
                components = health.components.len(),
                "Cluster health"
            ),
            status => warn!(
                event = "cluster_health",
                cluster = %self.cluster_name,
                status = ?status,
                components = health.components.len(),
                impaired = ?impaired,
                "Cluster health"
            ),
        }
    }

    /// Log simulation shutdown
    pub fn log_shutdown(&self, reason: &str, joined: bool) {
        info!(
            event = "cluster_shutdown",
            cluster = %self.cluster_name,
            reason = %reason,
            joined = joined,
            "Cluster simulation shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_metrics_creation() {
        let metrics = ClusterMetrics::new();

        metrics.observe_repair(Duration::from_millis(500));
        metrics.set_repairs_in_flight(2);
        metrics.inc_repairs_abandoned();
        metrics.record_sample(30.0, 145.0, 1, 8);
        metrics.inc_remediation("degraded");
    }

    #[test]
    fn test_metrics_text_exposition() {
        let metrics = ClusterMetrics::new();
        metrics.observe_repair(Duration::from_millis(10));

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("cluster_failures_total"));
        assert!(text.contains("cluster_repair_duration_seconds"));
    }

    #[test]
    fn test_log_health_with_impaired_components() {
        use crate::health::ComponentHealth;
        use std::collections::HashMap;

        let mut components = HashMap::new();
        components.insert("detector".to_string(), ComponentHealth::healthy());
        components.insert(
            "monitor".to_string(),
            ComponentHealth::unhealthy("sampler stopped"),
        );
        let health = HealthResponse {
            status: HealthResponse::compute_status(&components),
            components,
        };
        assert_eq!(health.status, ComponentStatus::Unhealthy);

        StructuredLogger::new("test-cluster").log_health(&health);
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("test-cluster");
        assert_eq!(logger.cluster_name(), "test-cluster");
    }
}
