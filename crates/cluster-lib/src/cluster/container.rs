//! Simulated container and its failure process
//!
//! Each container runs an independent simulation task that sleeps a
//! randomized interval, then either fails (terminal) or advances its
//! workload counter. The task exits on failure or when its cancellation
//! token fires, whichever comes first.

use super::rng::BoxedRng;
use crate::error::{ClusterError, ClusterResult};
use crate::models::{ContainerId, ContainerView, NodeId};
use rand::Rng;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

/// Failure and workload model shared by every container in a cluster
#[derive(Debug, Clone)]
pub struct ContainerSimConfig {
    /// Per-tick probability that a non-replica container fails
    pub fail_probability: f64,
    /// Shortest pause between simulation ticks
    pub tick_min: Duration,
    /// Longest pause between simulation ticks
    pub tick_max: Duration,
    /// Exclusive upper bound of the per-tick workload increment
    pub drift_max: u64,
    /// Exclusive upper bound of the initial workload counter
    pub initial_state_max: u64,
}

impl Default for ContainerSimConfig {
    fn default() -> Self {
        Self {
            fail_probability: 0.02,
            tick_min: Duration::from_millis(200),
            tick_max: Duration::from_millis(500),
            drift_max: 8,
            initial_state_max: 1000,
        }
    }
}

impl ContainerSimConfig {
    pub fn validate(&self) -> ClusterResult<()> {
        if !(0.0..=1.0).contains(&self.fail_probability) {
            return Err(ClusterError::InvalidConfig(format!(
                "fail_probability must be within [0, 1], got {}",
                self.fail_probability
            )));
        }
        if self.tick_max.is_zero() || self.tick_min > self.tick_max {
            return Err(ClusterError::InvalidConfig(format!(
                "tick range {:?}..={:?} is empty",
                self.tick_min, self.tick_max
            )));
        }
        Ok(())
    }

    fn next_tick(&self, rng: &mut BoxedRng) -> Duration {
        if self.tick_min == self.tick_max {
            self.tick_min
        } else {
            rng.gen_range(self.tick_min..=self.tick_max)
        }
    }

    pub(crate) fn initial_state(&self, rng: &mut BoxedRng) -> u64 {
        below(rng, self.initial_state_max)
    }
}

fn below(rng: &mut BoxedRng, bound: u64) -> u64 {
    if bound == 0 {
        0
    } else {
        rng.gen_range(0..bound)
    }
}

#[derive(Debug)]
struct HealthState {
    running: bool,
    simulated_state: u64,
}

/// Outcome of one simulation tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tick {
    Progressed,
    Failed,
    /// Already non-running when the tick began
    Halted,
}

/// Health and progress shared between a container and its simulation task
#[derive(Debug)]
pub(crate) struct ContainerHealth {
    replica: bool,
    state: Mutex<HealthState>,
}

impl ContainerHealth {
    fn new(replica: bool, simulated_state: u64) -> Self {
        Self {
            replica,
            state: Mutex::new(HealthState {
                running: true,
                simulated_state,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HealthState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Terminal transition to non-running
    ///
    /// Returns `true` only for the call that performed the transition.
    /// Replicas are immune and always return `false`.
    pub(crate) fn mark_failed(&self) -> bool {
        if self.replica {
            return false;
        }
        let mut state = self.lock();
        let was_running = state.running;
        state.running = false;
        was_running
    }

    pub(crate) fn tick(&self, rng: &mut BoxedRng, config: &ContainerSimConfig) -> Tick {
        let mut state = self.lock();
        if !state.running {
            return Tick::Halted;
        }
        if !self.replica && rng.gen_bool(config.fail_probability) {
            state.running = false;
            return Tick::Failed;
        }
        state.simulated_state = state
            .simulated_state
            .saturating_add(below(rng, config.drift_max));
        Tick::Progressed
    }
}

/// A container registered on exactly one node
///
/// `node_id` is a lookup key into the cluster, never an owning reference.
#[derive(Debug)]
pub struct Container {
    id: ContainerId,
    service: String,
    node_id: NodeId,
    health: Arc<ContainerHealth>,
    cancel: CancellationToken,
}

impl Container {
    pub(crate) fn new(
        id: ContainerId,
        service: impl Into<String>,
        node_id: NodeId,
        replica: bool,
        initial_state: u64,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            service: service.into(),
            node_id,
            health: Arc::new(ContainerHealth::new(replica, initial_state)),
            cancel,
        }
    }

    pub fn id(&self) -> ContainerId {
        self.id
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn is_replica(&self) -> bool {
        self.health.replica
    }

    pub fn is_running(&self) -> bool {
        self.health.is_running()
    }

    pub fn view(&self) -> ContainerView {
        let state = self.health.lock();
        ContainerView {
            id: self.id,
            service: self.service.clone(),
            node_id: self.node_id,
            running: state.running,
            simulated_state: state.simulated_state,
            replica: self.health.replica,
        }
    }

    /// External fault toggle; also stops the simulation task
    pub(crate) fn fail(&self) -> bool {
        let failed = self.health.mark_failed();
        if failed {
            self.cancel.cancel();
        }
        failed
    }

    /// Signal the simulation task to stop
    pub(crate) fn stop(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn spawn_simulation(
        &self,
        tracker: &TaskTracker,
        config: ContainerSimConfig,
        rng: BoxedRng,
    ) {
        tracker.spawn(simulate(
            self.id,
            Arc::clone(&self.health),
            config,
            rng,
            self.cancel.clone(),
        ));
    }
}

async fn simulate(
    id: ContainerId,
    health: Arc<ContainerHealth>,
    config: ContainerSimConfig,
    mut rng: BoxedRng,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            debug!(container_id = id, "Container simulation stopped");
            return;
        }

        let pause = config.next_tick(&mut rng);
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(container_id = id, "Container simulation stopped");
                return;
            }
            _ = tokio::time::sleep(pause) => {}
        }

        match health.tick(&mut rng, &config) {
            Tick::Progressed => {}
            Tick::Failed => {
                debug!(container_id = id, "Container failed");
                return;
            }
            Tick::Halted => return,
        }
    }
}
