//! Periodic control action
//!
//! Consumes monitor output and decides whether the cluster needs
//! remediation. The numeric thresholds are operator configuration, not
//! derived constants.

use crate::error::{ClusterError, ClusterResult};
use crate::monitor::MetricsSample;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Decision produced by a [`ControlPolicy`]
#[derive(Debug, Clone, PartialEq)]
pub enum Remediation {
    /// No threshold crossed
    Steady,
    /// A threshold is crossed; mark the cluster degraded
    Degraded { reasons: Vec<String> },
    /// A threshold is crossed; add a failure-immune standby for `service`
    ProvisionStandby {
        service: String,
        reasons: Vec<String>,
    },
}

impl Remediation {
    /// Label used in metrics and logs
    pub fn action(&self) -> &'static str {
        match self {
            Remediation::Steady => "steady",
            Remediation::Degraded { .. } => "degraded",
            Remediation::ProvisionStandby { .. } => "provision_standby",
        }
    }

    pub fn reasons(&self) -> &[String] {
        match self {
            Remediation::Steady => &[],
            Remediation::Degraded { reasons } | Remediation::ProvisionStandby { reasons, .. } => {
                reasons
            }
        }
    }
}

/// Extra state a policy may consult beyond the monitor sample
#[derive(Debug, Clone, Default)]
pub struct ControlContext {
    /// Repaired failures per service, most failures first
    pub failures_by_service: Vec<(String, u64)>,
    /// Standbys provisioned by the control action so far
    pub standbys: usize,
}

/// Periodic remediation rule
pub trait ControlPolicy: Send + Sync {
    fn name(&self) -> &str;

    /// Decide what to do about the latest sample
    fn evaluate(&self, sample: &MetricsSample, context: &ControlContext) -> Remediation;

    /// Called once a standby asked for by [`evaluate`](Self::evaluate) is
    /// actually running
    fn standby_provisioned(&self) {}
}

/// Threshold rule on the smoothed failure rate and on utilization
///
/// Crossing either threshold degrades the cluster. When the failure-rate
/// threshold is crossed, standby budget remains and the cooldown since
/// the last standby has elapsed, the most-failing service gets a standby.
#[derive(Debug)]
pub struct ThresholdPolicy {
    /// Smoothed failed-container count at or above which to act
    pub failure_rate_threshold: f64,
    /// Utilization percent at or above which to act
    pub utilization_threshold: f64,
    /// Minimum time between two standby provisions
    pub cooldown: Duration,
    /// Standby budget; 0 disables provisioning
    pub max_standbys: usize,
    last_standby: Mutex<Option<Instant>>,
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self::new(1.0, 90.0, Duration::from_secs(5), 0)
    }
}

impl ThresholdPolicy {
    pub fn new(
        failure_rate_threshold: f64,
        utilization_threshold: f64,
        cooldown: Duration,
        max_standbys: usize,
    ) -> Self {
        Self {
            failure_rate_threshold,
            utilization_threshold,
            cooldown,
            max_standbys,
            last_standby: Mutex::new(None),
        }
    }

    pub fn validate(&self) -> ClusterResult<()> {
        if !(self.failure_rate_threshold >= 0.0) {
            return Err(ClusterError::InvalidConfig(format!(
                "failure_rate_threshold must be non-negative, got {}",
                self.failure_rate_threshold
            )));
        }
        if !(self.utilization_threshold > 0.0) {
            return Err(ClusterError::InvalidConfig(format!(
                "utilization_threshold must be positive, got {}",
                self.utilization_threshold
            )));
        }
        Ok(())
    }

    fn standby_allowed(&self, context: &ControlContext) -> bool {
        if context.standbys >= self.max_standbys {
            return false;
        }
        let last = self
            .last_standby
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match *last {
            Some(at) => at.elapsed() >= self.cooldown,
            None => true,
        }
    }
}

impl ControlPolicy for ThresholdPolicy {
    fn name(&self) -> &str {
        "threshold"
    }

    fn evaluate(&self, sample: &MetricsSample, context: &ControlContext) -> Remediation {
        let mut reasons = Vec::new();
        let failing = sample.failure_rate >= self.failure_rate_threshold;

        if failing {
            reasons.push(format!(
                "failure rate {:.2} >= {:.2}",
                sample.failure_rate, self.failure_rate_threshold
            ));
        }
        if sample.utilization_percent >= self.utilization_threshold {
            reasons.push(format!(
                "utilization {:.1}% >= {:.1}%",
                sample.utilization_percent, self.utilization_threshold
            ));
        }

        if reasons.is_empty() {
            return Remediation::Steady;
        }

        if failing {
            if let Some((service, _)) = context.failures_by_service.first() {
                if self.standby_allowed(context) {
                    return Remediation::ProvisionStandby {
                        service: service.clone(),
                        reasons,
                    };
                }
            }
        }

        Remediation::Degraded { reasons }
    }

    fn standby_provisioned(&self) {
        *self
            .last_standby
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(failure_rate: f64, utilization_percent: f64) -> MetricsSample {
        MetricsSample {
            utilization_percent,
            latency_estimate_ms: 100.0 + utilization_percent * 1.5,
            failed_containers: failure_rate.round() as usize,
            failure_rate,
            running_containers: 9,
            used_slots: 9,
            capacity: 30,
        }
    }

    fn context(standbys: usize) -> ControlContext {
        ControlContext {
            failures_by_service: vec![("db".to_string(), 4), ("api".to_string(), 1)],
            standbys,
        }
    }

    #[test]
    fn test_steady_below_thresholds() {
        let policy = ThresholdPolicy::default();
        assert_eq!(
            policy.evaluate(&sample(0.2, 30.0), &context(0)),
            Remediation::Steady
        );
    }

    #[test]
    fn test_degraded_on_high_utilization() {
        let policy = ThresholdPolicy::default();
        let decision = policy.evaluate(&sample(0.0, 95.0), &context(0));

        assert_eq!(decision.action(), "degraded");
        assert_eq!(decision.reasons().len(), 1);
        assert!(decision.reasons()[0].contains("utilization"));
    }

    #[test]
    fn test_degraded_when_standbys_disabled() {
        let policy = ThresholdPolicy::default();
        let decision = policy.evaluate(&sample(1.5, 30.0), &context(0));

        assert_eq!(decision.action(), "degraded");
        assert!(decision.reasons()[0].contains("failure rate"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_standby_for_most_failing_service_with_cooldown() {
        let policy = ThresholdPolicy::new(1.0, 90.0, Duration::from_secs(5), 3);

        let first = policy.evaluate(&sample(2.0, 30.0), &context(0));
        assert_eq!(
            first,
            Remediation::ProvisionStandby {
                service: "db".to_string(),
                reasons: vec!["failure rate 2.00 >= 1.00".to_string()],
            }
        );

        policy.standby_provisioned();

        // Inside the cooldown window
        let second = policy.evaluate(&sample(2.0, 30.0), &context(1));
        assert_eq!(second.action(), "degraded");

        tokio::time::advance(Duration::from_secs(6)).await;
        let third = policy.evaluate(&sample(2.0, 30.0), &context(1));
        assert_eq!(third.action(), "provision_standby");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unprovisioned_standby_keeps_cooldown_open() {
        let policy = ThresholdPolicy::new(1.0, 90.0, Duration::from_secs(60), 3);

        // Nothing reported back as provisioned, so the window never starts
        for _ in 0..3 {
            let decision = policy.evaluate(&sample(2.0, 30.0), &context(0));
            assert_eq!(decision.action(), "provision_standby");
        }

        policy.standby_provisioned();
        let decision = policy.evaluate(&sample(2.0, 30.0), &context(1));
        assert_eq!(decision.action(), "degraded");
    }

    #[tokio::test(start_paused = true)]
    async fn test_standby_budget_exhausted() {
        let policy = ThresholdPolicy::new(1.0, 90.0, Duration::ZERO, 1);
        let decision = policy.evaluate(&sample(3.0, 30.0), &context(1));
        assert_eq!(decision.action(), "degraded");
    }

    #[test]
    fn test_no_standby_without_failure_history() {
        let policy = ThresholdPolicy::new(1.0, 90.0, Duration::ZERO, 5);
        let decision = policy.evaluate(&sample(2.0, 30.0), &ControlContext::default());
        assert_eq!(decision.action(), "degraded");
    }

    #[test]
    fn test_validate_thresholds() {
        assert!(ThresholdPolicy::default().validate().is_ok());
        assert!(ThresholdPolicy::new(-1.0, 90.0, Duration::ZERO, 0)
            .validate()
            .is_err());
        assert!(ThresholdPolicy::new(1.0, 0.0, Duration::ZERO, 0)
            .validate()
            .is_err());
    }
}
