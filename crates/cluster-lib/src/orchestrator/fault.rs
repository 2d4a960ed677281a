//! External fault injection
//!
//! Independently ticking task that fails running, non-replica containers
//! at random, on top of each container's own failure process.

use crate::cluster::{BoxedRng, Cluster};
use crate::error::{ClusterError, ClusterResult};
use crate::models::ContainerId;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Configuration for the fault injector
#[derive(Debug, Clone)]
pub struct FaultInjectionConfig {
    /// Per-tick, per-container failure probability; 0 disables injection
    pub probability: f64,
    pub interval: Duration,
}

impl Default for FaultInjectionConfig {
    fn default() -> Self {
        Self {
            probability: 0.0,
            interval: Duration::from_millis(400),
        }
    }
}

impl FaultInjectionConfig {
    pub fn is_enabled(&self) -> bool {
        self.probability > 0.0
    }

    pub fn validate(&self) -> ClusterResult<()> {
        if !(0.0..=1.0).contains(&self.probability) {
            return Err(ClusterError::InvalidConfig(format!(
                "fault probability must be within [0, 1], got {}",
                self.probability
            )));
        }
        if self.is_enabled() && self.interval.is_zero() {
            return Err(ClusterError::InvalidConfig(
                "fault interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Randomly fails containers on a fixed interval
pub struct FaultInjector {
    cluster: Arc<Cluster>,
    config: FaultInjectionConfig,
    rng: BoxedRng,
    injected: u64,
}

impl FaultInjector {
    pub fn new(cluster: Arc<Cluster>, config: FaultInjectionConfig) -> ClusterResult<Self> {
        config.validate()?;
        let rng = cluster.rng_factory().for_injector();
        Ok(Self {
            cluster,
            config,
            rng,
            injected: 0,
        })
    }

    /// Total faults injected by this instance
    pub fn injected(&self) -> u64 {
        self.injected
    }

    /// One injection pass over every container
    pub fn inject_once(&mut self) -> Vec<ContainerId> {
        let failed = self
            .cluster
            .inject_faults(&mut self.rng, self.config.probability);
        self.injected += failed.len() as u64;
        if !failed.is_empty() {
            debug!(containers = ?failed, "Injected container faults");
        }
        failed
    }

    /// Run until cancelled
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            probability = self.config.probability,
            interval_ms = self.config.interval.as_millis() as u64,
            "Starting fault injector"
        );

        let mut ticker = interval(self.config.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.inject_once();
                }
                _ = shutdown.cancelled() => {
                    info!(injected = self.injected, "Shutting down fault injector");
                    break;
                }
            }
        }
    }
}
