//! Cluster monitoring and smoothed metrics
//!
//! Samples the whole cluster in one census, derives utilization and a
//! latency estimate, and smooths the latency estimate and failed-container
//! count with independent EMAs.

mod ema;

pub use ema::Ema;

use crate::cluster::Cluster;
use crate::error::{ClusterError, ClusterResult};
use crate::observability::ClusterMetrics;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Linear latency model: `base_ms + utilization_percent * slope_ms`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencyModel {
    pub base_ms: f64,
    pub slope_ms: f64,
}

impl Default for LatencyModel {
    fn default() -> Self {
        Self {
            base_ms: 100.0,
            slope_ms: 1.5,
        }
    }
}

impl LatencyModel {
    pub fn estimate(&self, utilization_percent: f64) -> f64 {
        self.base_ms + utilization_percent * self.slope_ms
    }
}

/// Configuration for the monitor
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Smoothing factor for the latency estimate
    pub latency_alpha: f64,
    /// Smoothing factor for the failed-container count
    pub failure_alpha: f64,
    pub latency_model: LatencyModel,
    /// Period of the background sampler
    pub sample_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            latency_alpha: 0.4,
            failure_alpha: 0.3,
            latency_model: LatencyModel::default(),
            sample_interval: Duration::from_secs(1),
        }
    }
}

/// One monitor sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSample {
    /// `used / capacity * 100`, 0 when capacity is 0
    pub utilization_percent: f64,
    /// Smoothed latency estimate
    pub latency_estimate_ms: f64,
    /// Raw failed-container count at sample time
    pub failed_containers: usize,
    /// Smoothed failed-container count
    pub failure_rate: f64,
    pub running_containers: usize,
    pub used_slots: usize,
    pub capacity: usize,
}

/// Samples the cluster and maintains smoothed metrics
pub struct Monitor {
    cluster: Arc<Cluster>,
    latency: Ema,
    failures: Ema,
    config: MonitorConfig,
    last: Mutex<Option<MetricsSample>>,
    metrics: ClusterMetrics,
}

impl Monitor {
    pub fn new(cluster: Arc<Cluster>, config: MonitorConfig) -> ClusterResult<Self> {
        if config.sample_interval.is_zero() {
            return Err(ClusterError::InvalidConfig(
                "sample_interval must be non-zero".to_string(),
            ));
        }
        Ok(Self {
            cluster,
            latency: Ema::new(config.latency_alpha)?,
            failures: Ema::new(config.failure_alpha)?,
            config,
            last: Mutex::new(None),
            metrics: ClusterMetrics::new(),
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Take one sample and fold it into the smoothed metrics
    pub fn collect(&self) -> MetricsSample {
        let census = self.cluster.census();

        let utilization_percent = if census.capacity == 0 {
            0.0
        } else {
            census.used_slots as f64 / census.capacity as f64 * 100.0
        };
        let estimate = self.config.latency_model.estimate(utilization_percent);

        let sample = MetricsSample {
            utilization_percent,
            latency_estimate_ms: self.latency.update(estimate),
            failed_containers: census.failed,
            failure_rate: self.failures.update(census.failed as f64),
            running_containers: census.running,
            used_slots: census.used_slots,
            capacity: census.capacity,
        };

        self.metrics.record_sample(
            sample.utilization_percent,
            sample.latency_estimate_ms,
            sample.failed_containers,
            sample.running_containers,
        );
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(sample.clone());
        sample
    }

    /// Most recent sample, if any
    pub fn latest(&self) -> Option<MetricsSample> {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run the periodic sampler until cancelled
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            interval_ms = self.config.sample_interval.as_millis() as u64,
            "Starting monitor sampler"
        );

        let mut ticker = interval(self.config.sample_interval);
        let mut sample_count = 0u64;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let sample = self.collect();
                    sample_count += 1;

                    if sample_count % 10 == 0 {
                        debug!(
                            utilization = sample.utilization_percent,
                            latency_ms = sample.latency_estimate_ms,
                            failed = sample.failed_containers,
                            failure_rate = sample.failure_rate,
                            "Monitor sample"
                        );
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Shutting down monitor sampler");
                    break;
                }
            }
        }
    }
}
