//! Simulation configuration

use anyhow::{bail, Result};
use cluster_lib::{
    ContainerSimConfig, FaultInjectionConfig, LatencyModel, MonitorConfig, OrchestratorConfig,
    OverflowPolicy, PlacementConfig, RetryPolicy, RngFactory, SeededRngFactory, ThresholdPolicy,
};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

/// Simulation configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SimulationConfig {
    /// Number of nodes created at bootstrap
    #[serde(default = "default_node_count")]
    pub node_count: usize,

    /// Slots per node
    #[serde(default = "default_node_capacity")]
    pub node_capacity: usize,

    /// Service labels, assigned round-robin to the initial containers
    #[serde(default = "default_services")]
    pub services: Vec<String>,

    #[serde(default = "default_initial_containers")]
    pub initial_containers: usize,

    /// Per-tick failure probability of a non-replica container
    #[serde(default = "default_fail_probability")]
    pub fail_probability: f64,

    #[serde(default = "default_tick_min_ms")]
    pub tick_min_ms: u64,

    #[serde(default = "default_tick_max_ms")]
    pub tick_max_ms: u64,

    /// Upper bound of the per-tick simulated state increment
    #[serde(default = "default_drift_max")]
    pub drift_max: u64,

    /// Fixed seed for reproducible runs; entropy when absent
    #[serde(default)]
    pub seed: Option<u64>,

    #[serde(default)]
    pub overflow_policy: OverflowPolicy,

    #[serde(default = "default_detection_interval")]
    pub detection_interval_ms: u64,

    #[serde(default = "default_repair_latency")]
    pub repair_latency_ms: u64,

    #[serde(default = "default_control_interval")]
    pub control_interval_ms: u64,

    /// Deploy attempts per repair; unlimited when absent
    #[serde(default)]
    pub max_repair_attempts: Option<u32>,

    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_retry_backoff_multiplier")]
    pub retry_backoff_multiplier: f64,

    #[serde(default = "default_retry_backoff_max")]
    pub retry_backoff_max_ms: u64,

    /// Per-tick probability the fault injector fails a container; 0 disables it
    #[serde(default = "default_fault_probability")]
    pub fault_probability: f64,

    #[serde(default = "default_fault_interval")]
    pub fault_interval_ms: u64,

    #[serde(default = "default_latency_alpha")]
    pub latency_alpha: f64,

    #[serde(default = "default_failure_alpha")]
    pub failure_alpha: f64,

    #[serde(default = "default_latency_base")]
    pub latency_base_ms: f64,

    #[serde(default = "default_latency_slope")]
    pub latency_slope_ms: f64,

    #[serde(default = "default_sample_interval")]
    pub sample_interval_ms: u64,

    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f64,

    #[serde(default = "default_utilization_threshold")]
    pub utilization_threshold: f64,

    #[serde(default = "default_remediation_cooldown")]
    pub remediation_cooldown_ms: u64,

    /// Standbys the control action may provision; 0 disables provisioning
    #[serde(default)]
    pub max_standbys: usize,

    #[serde(default = "default_run_duration")]
    pub run_duration_secs: u64,

    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,

    /// Bound on the final join of all tasks
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    #[serde(default)]
    pub log_format: LogFormat,

    /// Print the Prometheus exposition after the final report
    #[serde(default)]
    pub dump_metrics: bool,
}

fn default_node_count() -> usize {
    3
}

fn default_node_capacity() -> usize {
    10
}

fn default_services() -> Vec<String> {
    ["auth", "api", "db", "cache", "worker"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_initial_containers() -> usize {
    9
}

fn default_fail_probability() -> f64 {
    0.02
}

fn default_tick_min_ms() -> u64 {
    200
}

fn default_tick_max_ms() -> u64 {
    500
}

fn default_drift_max() -> u64 {
    8
}

fn default_detection_interval() -> u64 {
    2000
}

fn default_repair_latency() -> u64 {
    500
}

fn default_control_interval() -> u64 {
    1000
}

fn default_retry_backoff() -> u64 {
    100
}

fn default_retry_backoff_multiplier() -> f64 {
    1.0
}

fn default_retry_backoff_max() -> u64 {
    5000
}

fn default_fault_probability() -> f64 {
    0.01
}

fn default_fault_interval() -> u64 {
    400
}

fn default_latency_alpha() -> f64 {
    0.4
}

fn default_failure_alpha() -> f64 {
    0.3
}

fn default_latency_base() -> f64 {
    100.0
}

fn default_latency_slope() -> f64 {
    1.5
}

fn default_sample_interval() -> u64 {
    1000
}

fn default_failure_rate_threshold() -> f64 {
    1.0
}

fn default_utilization_threshold() -> f64 {
    90.0
}

fn default_remediation_cooldown() -> u64 {
    5000
}

fn default_run_duration() -> u64 {
    40
}

fn default_report_interval() -> u64 {
    2
}

fn default_shutdown_timeout() -> u64 {
    5
}

impl SimulationConfig {
    /// Load configuration from an optional file and `CLUSTER_*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("CLUSTER")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("services"),
            )
            .build()?;

        let parsed: SimulationConfig = config.try_deserialize()?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Checks that span several fields; per-component checks run when the
    /// library configs are built
    pub fn validate(&self) -> Result<()> {
        if self.node_count == 0 {
            bail!("node_count must be at least 1");
        }
        if self.initial_containers > 0 && self.services.is_empty() {
            bail!("services must not be empty when initial_containers > 0");
        }
        if self.report_interval_secs == 0 {
            bail!("report_interval_secs must be at least 1");
        }
        Ok(())
    }

    pub fn total_capacity(&self) -> usize {
        self.node_count * self.node_capacity
    }

    pub fn container_sim(&self) -> ContainerSimConfig {
        ContainerSimConfig {
            fail_probability: self.fail_probability,
            tick_min: Duration::from_millis(self.tick_min_ms),
            tick_max: Duration::from_millis(self.tick_max_ms),
            drift_max: self.drift_max,
            ..Default::default()
        }
    }

    pub fn placement(&self) -> PlacementConfig {
        PlacementConfig {
            overflow: self.overflow_policy,
        }
    }

    pub fn rng_factory(&self) -> Arc<dyn RngFactory> {
        Arc::new(SeededRngFactory::new(self.seed))
    }

    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_repair_attempts,
            initial_backoff: Duration::from_millis(self.retry_backoff_ms),
            multiplier: self.retry_backoff_multiplier,
            max_backoff: Duration::from_millis(self.retry_backoff_max_ms),
        }
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            detection_interval: Duration::from_millis(self.detection_interval_ms),
            repair_latency: Duration::from_millis(self.repair_latency_ms),
            control_interval: Duration::from_millis(self.control_interval_ms),
            retry: self.retry(),
            fault_injection: FaultInjectionConfig {
                probability: self.fault_probability,
                interval: Duration::from_millis(self.fault_interval_ms),
            },
        }
    }

    pub fn monitor(&self) -> MonitorConfig {
        MonitorConfig {
            latency_alpha: self.latency_alpha,
            failure_alpha: self.failure_alpha,
            latency_model: LatencyModel {
                base_ms: self.latency_base_ms,
                slope_ms: self.latency_slope_ms,
            },
            sample_interval: Duration::from_millis(self.sample_interval_ms),
        }
    }

    pub fn policy(&self) -> Result<ThresholdPolicy> {
        let policy = ThresholdPolicy::new(
            self.failure_rate_threshold,
            self.utilization_threshold,
            Duration::from_millis(self.remediation_cooldown_ms),
            self.max_standbys,
        );
        policy.validate()?;
        Ok(policy)
    }

    pub fn run_duration(&self) -> Duration {
        Duration::from_secs(self.run_duration_secs)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Mutex, MutexGuard, PoisonError};

    // Loading reads the process environment, which tests share
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn env_guard() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_toml(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let _env = env_guard();
        let file = write_toml("");
        let config = SimulationConfig::load(Some(file.path())).unwrap();

        assert_eq!(config.node_count, 3);
        assert_eq!(config.node_capacity, 10);
        assert_eq!(config.total_capacity(), 30);
        assert_eq!(config.initial_containers, 9);
        assert_eq!(config.services.len(), 5);
        assert_eq!(config.overflow_policy, OverflowPolicy::Overcommit);
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(config.seed.is_none());
        assert!(config.max_repair_attempts.is_none());
        assert_eq!(config.run_duration(), Duration::from_secs(40));
    }

    #[test]
    fn test_file_overrides() {
        let _env = env_guard();
        let file = write_toml(
            r#"
node_count = 2
node_capacity = 4
services = ["web", "queue"]
seed = 7
overflow_policy = "reject"
max_repair_attempts = 3
retry_backoff_multiplier = 2.0
log_format = "text"
fault_probability = 0.0
"#,
        );
        let config = SimulationConfig::load(Some(file.path())).unwrap();

        assert_eq!(config.total_capacity(), 8);
        assert_eq!(config.services, vec!["web", "queue"]);
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.placement().overflow, OverflowPolicy::Reject);
        assert_eq!(config.log_format, LogFormat::Text);

        let retry = config.retry();
        assert_eq!(retry.max_attempts, Some(3));
        assert_eq!(retry.backoff_for(2), Duration::from_millis(200));
        assert!(!config.orchestrator().fault_injection.is_enabled());
    }

    #[test]
    fn test_library_configs_from_defaults() {
        let _env = env_guard();
        let file = write_toml("");
        let config = SimulationConfig::load(Some(file.path())).unwrap();

        let sim = config.container_sim();
        assert_eq!(sim.tick_min, Duration::from_millis(200));
        assert_eq!(sim.tick_max, Duration::from_millis(500));
        assert!(sim.validate().is_ok());

        let orchestrator = config.orchestrator();
        assert_eq!(orchestrator.detection_interval, Duration::from_secs(2));
        assert_eq!(orchestrator.repair_latency, Duration::from_millis(500));
        assert!(orchestrator.validate().is_ok());

        let monitor = config.monitor();
        assert_eq!(monitor.latency_model.estimate(50.0), 175.0);

        let policy = config.policy().unwrap();
        assert_eq!(policy.max_standbys, 0);
    }

    #[test]
    fn test_rejects_zero_nodes() {
        let _env = env_guard();
        let file = write_toml("node_count = 0");
        assert!(SimulationConfig::load(Some(file.path())).is_err());
    }

    #[test]
    fn test_rejects_empty_services() {
        let _env = env_guard();
        let file = write_toml("initial_containers = 4");
        let mut config = SimulationConfig::load(Some(file.path())).unwrap();
        config.services.clear();
        assert!(config.validate().is_err());

        config.initial_containers = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let _env = env_guard();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(SimulationConfig::load(Some(&path)).is_err());
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let _env = env_guard();
        let file = write_toml("utilization_threshold = 0.0");
        let config = SimulationConfig::load(Some(file.path())).unwrap();
        assert!(config.policy().is_err());
    }

    #[test]
    fn test_environment_overlay() {
        let _env = env_guard();
        let file = write_toml("node_count = 2\nfail_probability = 0.1");

        std::env::set_var("CLUSTER_SERVICES", "web,queue");
        std::env::set_var("CLUSTER_FAIL_PROBABILITY", "0.5");
        std::env::set_var("CLUSTER_OVERFLOW_POLICY", "reject");
        std::env::set_var("CLUSTER_MAX_REPAIR_ATTEMPTS", "3");
        let loaded = SimulationConfig::load(Some(file.path()));
        for key in [
            "CLUSTER_SERVICES",
            "CLUSTER_FAIL_PROBABILITY",
            "CLUSTER_OVERFLOW_POLICY",
            "CLUSTER_MAX_REPAIR_ATTEMPTS",
        ] {
            std::env::remove_var(key);
        }

        let config = loaded.unwrap();
        assert_eq!(config.services, vec!["web", "queue"]);
        assert_eq!(config.fail_probability, 0.5);
        assert_eq!(config.overflow_policy, OverflowPolicy::Reject);
        assert_eq!(config.max_repair_attempts, Some(3));
        // Untouched file values survive the overlay
        assert_eq!(config.node_count, 2);
    }
}
