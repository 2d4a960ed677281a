//! Failure detection, repair and control
//!
//! The orchestrator composes a [`Cluster`] and a [`Monitor`]. It runs a
//! detection scan on a fixed interval, hands each failed container to an
//! independent repair task, and periodically feeds monitor output to a
//! [`ControlPolicy`]. All background work is spawned on the cluster's task
//! tracker and stops with the cluster's shutdown token.

mod control;
mod fault;
mod repair;


pub use control::{ControlContext, ControlPolicy, Remediation, ThresholdPolicy};
pub use fault::{FaultInjectionConfig, FaultInjector};
pub use repair::{RepairStats, RepairTicket};

use crate::cluster::Cluster;
use crate::error::{ClusterError, ClusterResult};
use crate::health::{components, HealthRegistry};
use crate::models::{ContainerId, ContainerView};
use crate::monitor::{MetricsSample, Monitor, MonitorConfig};
use crate::observability::{ClusterMetrics, StructuredLogger};
use crate::report::ClusterReport;
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{interval, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Retry behaviour for replacement deploys that hit a capacity error
///
/// The default retries forever with a constant backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total deploy attempts per repair; `None` means unlimited
    pub max_attempts: Option<u32>,
    /// Delay before the second attempt
    pub initial_backoff: Duration,
    /// Growth factor applied per further attempt
    pub multiplier: f64,
    /// Upper bound on any single delay
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_backoff: Duration::from_millis(100),
            multiplier: 1.0,
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// At most `attempts` deploys with exponential backoff
    pub fn limited(attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts: Some(attempts),
            initial_backoff,
            multiplier: 2.0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> ClusterResult<()> {
        if self.max_attempts == Some(0) {
            return Err(ClusterError::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if !(self.multiplier >= 1.0) {
            return Err(ClusterError::InvalidConfig(format!(
                "backoff multiplier must be >= 1, got {}",
                self.multiplier
            )));
        }
        if self.max_attempts.is_none() && self.initial_backoff.is_zero() {
            return Err(ClusterError::InvalidConfig(
                "unlimited retries need a non-zero backoff".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether another attempt may follow attempt number `attempt` (1-based)
    pub fn allows_retry(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }

    /// Delay after attempt number `attempt` (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        if secs >= self.max_backoff.as_secs_f64() {
            self.max_backoff
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Configuration for the orchestrator's periodic work
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Period of the failure-detection scan
    pub detection_interval: Duration,
    /// Simulated delay between detection and redeploy
    pub repair_latency: Duration,
    /// Period of the control action
    pub control_interval: Duration,
    pub retry: RetryPolicy,
    pub fault_injection: FaultInjectionConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            detection_interval: Duration::from_secs(2),
            repair_latency: Duration::from_millis(500),
            control_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            fault_injection: FaultInjectionConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> ClusterResult<()> {
        if self.detection_interval.is_zero() || self.control_interval.is_zero() {
            return Err(ClusterError::InvalidConfig(
                "detection and control intervals must be non-zero".to_string(),
            ));
        }
        self.retry.validate()?;
        self.fault_injection.validate()
    }
}

/// Self-healing control plane over a cluster
pub struct Orchestrator {
    cluster: Arc<Cluster>,
    monitor: Arc<Monitor>,
    config: OrchestratorConfig,
    policy: Box<dyn ControlPolicy>,
    stats: Mutex<RepairStats>,
    in_flight: DashMap<ContainerId, RepairTicket>,
    failures_by_service: DashMap<String, u64>,
    standbys: AtomicUsize,
    started: AtomicBool,
    last_action: Mutex<&'static str>,
    health: HealthRegistry,
    metrics: ClusterMetrics,
    logger: StructuredLogger,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    fn stats_guard(&self) -> MutexGuard<'_, RepairStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deploy a container through the cluster's placement policy
    pub fn deploy(&self, service: &str) -> ClusterResult<ContainerView> {
        self.cluster.deploy(service)
    }

    /// Scan for failed containers, evict them and start their repairs
    ///
    /// Returns the number of repairs started.
    pub fn detect_once(self: &Arc<Self>) -> usize {
        if self.cluster.is_shutting_down() {
            return 0;
        }

        let mut started = 0;
        for failed in self.cluster.failed_containers() {
            let evicted = match self.cluster.evict(failed.node_id, failed.id) {
                Ok(view) => view,
                Err(e) => {
                    // Evicted concurrently; that path owns the repair
                    debug!(container_id = failed.id, error = %e, "Skipping failed container");
                    continue;
                }
            };

            self.logger
                .log_failure_detected(evicted.id, evicted.node_id, &evicted.service);
            let ticket = RepairTicket {
                failed_id: evicted.id,
                node_id: evicted.node_id,
                service: evicted.service,
                detected_at: Instant::now(),
            };
            self.in_flight.insert(ticket.failed_id, ticket.clone());

            let this = Arc::clone(self);
            self.cluster
                .tasks()
                .spawn(async move { this.repair(ticket).await });
            started += 1;
        }

        if started > 0 {
            self.metrics.set_repairs_in_flight(self.in_flight.len());
        }
        started
    }

    /// Run one control action against the latest monitor sample
    ///
    /// Returns `None` without acting when the monitor has not sampled yet.
    pub async fn control_once(&self) -> Option<Remediation> {
        let Some(sample) = self.monitor.latest() else {
            debug!("No monitor sample yet, skipping control action");
            return None;
        };
        let decision = self.policy.evaluate(&sample, &self.control_context());
        self.apply(&decision, &sample).await;
        Some(decision)
    }

    fn control_context(&self) -> ControlContext {
        let mut failures_by_service: Vec<(String, u64)> = self
            .failures_by_service
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        failures_by_service.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ControlContext {
            failures_by_service,
            standbys: self.standbys.load(Ordering::SeqCst),
        }
    }

    async fn apply(&self, decision: &Remediation, sample: &MetricsSample) {
        let action = decision.action();
        self.metrics.inc_remediation(action);

        let changed = {
            let mut last = self
                .last_action
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let changed = *last != action;
            *last = action;
            changed
        };

        match decision {
            Remediation::Steady => {
                if changed {
                    info!(
                        utilization = sample.utilization_percent,
                        failure_rate = sample.failure_rate,
                        "Cluster back to steady state"
                    );
                }
                self.health.set_healthy(components::CONTROL).await;
                return;
            }
            Remediation::Degraded { reasons } => {
                if changed {
                    self.logger.log_remediation(action, reasons);
                }
            }
            Remediation::ProvisionStandby { service, reasons } => {
                self.logger.log_remediation(action, reasons);
                match self.cluster.deploy_replica(service) {
                    Ok(standby) => {
                        self.standbys.fetch_add(1, Ordering::SeqCst);
                        self.policy.standby_provisioned();
                        info!(
                            container_id = standby.id,
                            node_id = standby.node_id,
                            service = %service,
                            "Standby provisioned"
                        );
                    }
                    Err(e) => warn!(service = %service, error = %e, "Standby provisioning failed"),
                }
            }
        }

        self.health
            .set_degraded(components::CONTROL, decision.reasons().join("; "))
            .await;
    }

    /// Completed repairs
    pub fn failure_count(&self) -> u64 {
        self.stats_guard().failures
    }

    pub fn total_repair_time(&self) -> Duration {
        self.stats_guard().total_repair_time
    }

    /// Cumulative repair time over failure count, zero before any repair
    pub fn average_repair_time(&self) -> Duration {
        self.stats_guard().average_repair_time()
    }

    pub fn stats(&self) -> RepairStats {
        self.stats_guard().clone()
    }

    /// Failed containers evicted but not yet replaced
    pub fn repairs_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn failures_for(&self, service: &str) -> u64 {
        self.failures_by_service
            .get(service)
            .map(|v| *v)
            .unwrap_or(0)
    }

    pub fn standbys(&self) -> usize {
        self.standbys.load(Ordering::SeqCst)
    }

    pub fn report(&self) -> ClusterReport {
        let stats = self.stats();
        let (used_slots, capacity) = self.cluster.snapshot();
        ClusterReport {
            failures: stats.failures,
            avg_repair: stats.average_repair_time(),
            nodes: self.cluster.node_count(),
            used_slots,
            capacity,
            repairs_in_flight: self.repairs_in_flight(),
            repairs_abandoned: stats.abandoned,
        }
    }

    /// Spawn the detection scan, control action, monitor sampler and,
    /// when enabled, the fault injector
    ///
    /// Each component is marked unhealthy once its loop exits. Fails with
    /// [`ClusterError::AlreadyStarted`] on a second call.
    pub async fn start(self: &Arc<Self>) -> ClusterResult<()> {
        let shutdown = self.cluster.shutdown_token();
        if shutdown.is_cancelled() {
            return Err(ClusterError::ShuttingDown);
        }
        let injector = if self.config.fault_injection.is_enabled() {
            Some(FaultInjector::new(
                Arc::clone(&self.cluster),
                self.config.fault_injection.clone(),
            )?)
        } else {
            None
        };
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ClusterError::AlreadyStarted);
        }

        self.health.register(components::DETECTOR).await;
        self.health.register(components::MONITOR).await;
        self.health.register(components::CONTROL).await;

        self.spawn_component(
            components::DETECTOR,
            Arc::clone(self).run_detection(shutdown.clone()),
        );
        self.spawn_component(
            components::CONTROL,
            Arc::clone(self).run_control(shutdown.clone()),
        );
        self.spawn_component(
            components::MONITOR,
            Arc::clone(&self.monitor).run(shutdown.clone()),
        );

        if let Some(injector) = injector {
            self.health.register(components::FAULT_INJECTOR).await;
            self.spawn_component(components::FAULT_INJECTOR, injector.run(shutdown));
        }

        self.health.set_ready(true).await;
        info!(
            detection_interval_ms = self.config.detection_interval.as_millis() as u64,
            control_interval_ms = self.config.control_interval.as_millis() as u64,
            policy = self.policy.name(),
            "Orchestrator started"
        );
        Ok(())
    }

    fn spawn_component<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let health = self.health.clone();
        self.cluster.tasks().spawn(async move {
            task.await;
            health.set_unhealthy(name, "stopped").await;
        });
    }

    async fn run_detection(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = interval(self.config.detection_interval);
        let mut scans = 0u64;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let started = self.detect_once();
                    scans += 1;
                    if started > 0 {
                        debug!(scan = scans, repairs_started = started, "Detection scan");
                    }
                }
                _ = shutdown.cancelled() => {
                    info!(scans, "Shutting down failure detection");
                    break;
                }
            }
        }
    }

    async fn run_control(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = interval(self.config.control_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.control_once().await;
                }
                _ = shutdown.cancelled() => {
                    info!("Shutting down control action");
                    break;
                }
            }
        }
    }

    /// Stop all background work and container simulations, bounded by
    /// `timeout`. Returns `true` if every task finished in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.health.set_ready(false).await;
        let joined = self.cluster.shutdown(timeout).await;
        self.logger.log_shutdown("run complete", joined);
        joined
    }
}

/// Builder for creating an orchestrator
pub struct OrchestratorBuilder {
    cluster: Option<Arc<Cluster>>,
    monitor: Option<Arc<Monitor>>,
    monitor_config: MonitorConfig,
    config: OrchestratorConfig,
    policy: Option<Box<dyn ControlPolicy>>,
    health: Option<HealthRegistry>,
    logger: Option<StructuredLogger>,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            cluster: None,
            monitor: None,
            monitor_config: MonitorConfig::default(),
            config: OrchestratorConfig::default(),
            policy: None,
            health: None,
            logger: None,
        }
    }

    pub fn cluster(mut self, cluster: Arc<Cluster>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Use an existing monitor; it must sample the same cluster
    pub fn monitor(mut self, monitor: Arc<Monitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Configuration for a monitor built by [`build`](Self::build)
    pub fn monitor_config(mut self, config: MonitorConfig) -> Self {
        self.monitor_config = config;
        self
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn policy(mut self, policy: Box<dyn ControlPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn build(self) -> ClusterResult<Arc<Orchestrator>> {
        let cluster = self
            .cluster
            .ok_or_else(|| ClusterError::InvalidConfig("cluster is required".to_string()))?;
        self.config.validate()?;

        let monitor = match self.monitor {
            Some(m) => m,
            None => Arc::new(Monitor::new(Arc::clone(&cluster), self.monitor_config)?),
        };

        Ok(Arc::new(Orchestrator {
            cluster,
            monitor,
            config: self.config,
            policy: self
                .policy
                .unwrap_or_else(|| Box::new(ThresholdPolicy::default())),
            stats: Mutex::new(RepairStats::default()),
            in_flight: DashMap::new(),
            failures_by_service: DashMap::new(),
            standbys: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            last_action: Mutex::new(Remediation::Steady.action()),
            health: self.health.unwrap_or_default(),
            metrics: ClusterMetrics::new(),
            logger: self
                .logger
                .unwrap_or_else(|| StructuredLogger::new("cluster")),
        }))
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
