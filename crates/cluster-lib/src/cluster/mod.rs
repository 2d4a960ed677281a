//! Node registry, placement and container lifecycle
//!
//! Lock order is Cluster -> Node -> Container everywhere. No path takes a
//! node lock while holding another node's lock, and no lock is held across
//! an await point.

mod container;
mod node;
mod rng;

#[cfg(test)]
mod tests;

pub use container::{Container, ContainerSimConfig};
pub use node::Node;
pub use rng::{BoxedRng, RngFactory, SeededRngFactory};

use crate::error::{ClusterError, ClusterResult};
use crate::models::{Census, ContainerId, ContainerView, NodeId, NodeView};
use rand::Rng;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// What to do when first-fit finds no node with a free slot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Place on the least-loaded node (lowest `used / capacity`, ties to
    /// the lowest node ID) even though it is full
    #[default]
    Overcommit,
    /// Fail with [`ClusterError::CapacityExhausted`] or
    /// [`ClusterError::NodeFull`]
    Reject,
}

/// Placement configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct PlacementConfig {
    pub overflow: OverflowPolicy,
}

/// Where a new container should go
#[derive(Debug, Clone, Copy)]
enum Target {
    FirstFit,
    Node(NodeId),
}

#[derive(Debug, Default)]
struct Registry {
    nodes: BTreeMap<NodeId, Node>,
    next_container_id: ContainerId,
}

/// Registry of nodes; owns placement and container ID allocation
///
/// Deploy operations spawn container simulation tasks and must be called
/// from within a Tokio runtime.
pub struct Cluster {
    registry: Mutex<Registry>,
    sim: ContainerSimConfig,
    placement: PlacementConfig,
    rng: Arc<dyn RngFactory>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Cluster {
    /// Create an empty cluster
    pub fn new(
        sim: ContainerSimConfig,
        placement: PlacementConfig,
        rng: Arc<dyn RngFactory>,
    ) -> ClusterResult<Self> {
        sim.validate()?;
        Ok(Self {
            registry: Mutex::new(Registry::default()),
            sim,
            placement,
            rng,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn sim_config(&self) -> &ContainerSimConfig {
        &self.sim
    }

    pub fn placement(&self) -> PlacementConfig {
        self.placement
    }

    pub fn rng_factory(&self) -> Arc<dyn RngFactory> {
        Arc::clone(&self.rng)
    }

    /// Root stop signal; container tasks listen on child tokens
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Tracker every cluster-related task is spawned on
    pub fn tasks(&self) -> TaskTracker {
        self.tasks.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Append a node with a fresh ID. Bootstrap only.
    pub fn add_node(&self, capacity: usize) -> ClusterResult<NodeId> {
        if capacity == 0 {
            return Err(ClusterError::InvalidConfig(
                "node capacity must be at least 1".to_string(),
            ));
        }
        let mut registry = self.lock();
        let id = registry.nodes.len() as NodeId + 1;
        registry.nodes.insert(id, Node::new(id, capacity));
        info!(node_id = id, capacity, "Node added");
        Ok(id)
    }

    pub fn node_count(&self) -> usize {
        self.lock().nodes.len()
    }

    /// Deploy a container using first-fit placement
    pub fn deploy(&self, service: &str) -> ClusterResult<ContainerView> {
        self.place(Target::FirstFit, service, false)
    }

    /// Deploy a failure-immune standby using first-fit placement
    pub fn deploy_replica(&self, service: &str) -> ClusterResult<ContainerView> {
        self.place(Target::FirstFit, service, true)
    }

    /// Deploy a container onto a specific node
    pub fn deploy_to(&self, node_id: NodeId, service: &str) -> ClusterResult<ContainerView> {
        self.place(Target::Node(node_id), service, false)
    }

    fn place(&self, target: Target, service: &str, replica: bool) -> ClusterResult<ContainerView> {
        if self.is_shutting_down() {
            return Err(ClusterError::ShuttingDown);
        }
        // Spawning the simulation task panics outside a runtime
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(ClusterError::NoRuntime);
        }

        let mut registry = self.lock();
        let node_id = match target {
            Target::FirstFit => self.select_node(&registry)?,
            Target::Node(id) => self.check_target(&registry, id)?,
        };

        // Allocated only once placement succeeded so failed deploys leave no gaps
        registry.next_container_id += 1;
        let id = registry.next_container_id;
        let node = registry
            .nodes
            .get(&node_id)
            .ok_or(ClusterError::UnknownNode(node_id))?;

        let mut rng = self.rng.for_container(id);
        let initial_state = self.sim.initial_state(&mut rng);
        let container = Container::new(
            id,
            service,
            node_id,
            replica,
            initial_state,
            self.shutdown.child_token(),
        );
        container.spawn_simulation(&self.tasks, self.sim.clone(), rng);
        let view = container.view();
        node.add(container);

        debug!(
            container_id = id,
            node_id,
            service = %service,
            replica,
            "Container deployed"
        );
        Ok(view)
    }

    /// First-fit in ascending node ID order, then the overflow policy
    fn select_node(&self, registry: &Registry) -> ClusterResult<NodeId> {
        if registry.nodes.is_empty() {
            return Err(ClusterError::NoNodes);
        }

        if let Some(node) = registry.nodes.values().find(|n| n.has_free_slot()) {
            return Ok(node.id());
        }

        match self.placement.overflow {
            OverflowPolicy::Reject => {
                let (used, capacity) = totals(registry);
                Err(ClusterError::CapacityExhausted { used, capacity })
            }
            OverflowPolicy::Overcommit => {
                let fallback = registry
                    .nodes
                    .values()
                    .map(|n| (n.id(), n.snapshot()))
                    .min_by(|(_, (ua, ca)), (_, (ub, cb))| (ua * cb).cmp(&(ub * ca)))
                    .map(|(id, _)| id)
                    .ok_or(ClusterError::NoNodes)?;
                warn!(node_id = fallback, "All nodes full, overcommitting");
                Ok(fallback)
            }
        }
    }

    fn check_target(&self, registry: &Registry, node_id: NodeId) -> ClusterResult<NodeId> {
        let node = registry
            .nodes
            .get(&node_id)
            .ok_or(ClusterError::UnknownNode(node_id))?;
        if node.has_free_slot() {
            return Ok(node_id);
        }
        match self.placement.overflow {
            OverflowPolicy::Reject => Err(ClusterError::NodeFull {
                node_id,
                capacity: node.capacity(),
            }),
            OverflowPolicy::Overcommit => {
                warn!(node_id, "Node full, overcommitting");
                Ok(node_id)
            }
        }
    }

    /// Remove a container from its node and stop its simulation task
    pub fn evict(&self, node_id: NodeId, id: ContainerId) -> ClusterResult<ContainerView> {
        let registry = self.lock();
        let node = registry
            .nodes
            .get(&node_id)
            .ok_or(ClusterError::UnknownNode(node_id))?;
        let container = node.remove(id).ok_or(ClusterError::UnknownContainer(id))?;
        container.stop();
        debug!(container_id = id, node_id, "Container evicted");
        Ok(container.view())
    }

    /// Force a container into the failed state
    ///
    /// Returns `Ok(false)` for replicas and containers that already failed.
    pub fn fail_container(&self, id: ContainerId) -> ClusterResult<bool> {
        let registry = self.lock();
        let mut outcome = None;
        for node in registry.nodes.values() {
            node.for_each_container(|c| {
                if c.id() == id {
                    outcome = Some(c.fail());
                }
            });
            if outcome.is_some() {
                break;
            }
        }
        outcome.ok_or(ClusterError::UnknownContainer(id))
    }

    /// Fail each running non-replica container with `probability`
    ///
    /// Returns the IDs of containers this call failed.
    pub fn inject_faults(&self, rng: &mut BoxedRng, probability: f64) -> Vec<ContainerId> {
        let registry = self.lock();
        let mut failed = Vec::new();
        for node in registry.nodes.values() {
            node.for_each_container(|c| {
                if c.is_replica() || !c.is_running() {
                    return;
                }
                if rng.gen_bool(probability) && c.fail() {
                    failed.push(c.id());
                }
            });
        }
        failed
    }

    /// Node currently hosting the container
    pub fn locate(&self, id: ContainerId) -> Option<NodeId> {
        let registry = self.lock();
        registry
            .nodes
            .values()
            .find(|n| n.contains(id))
            .map(Node::id)
    }

    pub fn container(&self, id: ContainerId) -> Option<ContainerView> {
        let registry = self.lock();
        registry.nodes.values().find_map(|n| n.container(id))
    }

    pub fn node(&self, id: NodeId) -> Option<NodeView> {
        self.lock().nodes.get(&id).map(Node::view)
    }

    /// `(total_used, total_capacity)` under one cluster critical section
    pub fn snapshot(&self) -> (usize, usize) {
        totals(&self.lock())
    }

    /// Every node and container, read under one cluster critical section
    pub fn census(&self) -> Census {
        let registry = self.lock();
        let mut census = Census::default();
        for node in registry.nodes.values() {
            let view = node.view();
            census.used_slots += view.used_slots;
            census.capacity += view.capacity;
            for c in &view.containers {
                if c.running {
                    census.running += 1;
                } else if !c.replica {
                    census.failed += 1;
                }
                if c.replica {
                    census.replicas += 1;
                }
            }
            census.nodes.push(view);
        }
        census
    }

    /// Failed, non-replica containers still registered on a node
    pub fn failed_containers(&self) -> Vec<ContainerView> {
        self.census()
            .failed_containers()
            .into_iter()
            .cloned()
            .collect()
    }

    /// Check `used_slots == |containers|` on every node
    pub fn slots_consistent(&self) -> bool {
        let registry = self.lock();
        registry.nodes.values().all(|n| {
            let (used, len) = n.counts();
            used == len
        })
    }

    /// Stop every task and wait for them, bounded by `timeout`
    ///
    /// Returns `true` if all tasks finished in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.shutdown.cancel();
        self.tasks.close();
        match tokio::time::timeout(timeout, self.tasks.wait()).await {
            Ok(()) => {
                info!("All cluster tasks stopped");
                true
            }
            Err(_) => {
                warn!(
                    outstanding = self.tasks.len(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Timed out waiting for cluster tasks"
                );
                false
            }
        }
    }
}

fn totals(registry: &Registry) -> (usize, usize) {
    registry
        .nodes
        .values()
        .map(Node::snapshot)
        .fold((0, 0), |(u, c), (nu, nc)| (u + nu, c + nc))
}
