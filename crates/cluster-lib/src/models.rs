//! Core data models for the cluster simulation

use serde::{Deserialize, Serialize};

/// Globally unique, monotonically assigned container identifier
pub type ContainerId = u64;

/// Node identifier, assigned in bootstrap order starting at 1
pub type NodeId = u32;

/// Point-in-time view of a single container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerView {
    pub id: ContainerId,
    pub service: String,
    pub node_id: NodeId,
    pub running: bool,
    pub simulated_state: u64,
    pub replica: bool,
}

impl ContainerView {
    /// A container the repair loop must replace
    pub fn needs_repair(&self) -> bool {
        !self.running && !self.replica
    }
}

/// Point-in-time view of a node and the containers it hosts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeView {
    pub id: NodeId,
    pub capacity: usize,
    pub used_slots: usize,
    /// Ordered by container ID
    pub containers: Vec<ContainerView>,
}

impl NodeView {
    pub fn has_free_slot(&self) -> bool {
        self.used_slots < self.capacity
    }
}

/// Whole-cluster view taken under one critical section
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Census {
    /// Ordered by node ID
    pub nodes: Vec<NodeView>,
    pub used_slots: usize,
    pub capacity: usize,
    pub running: usize,
    /// Non-running, non-replica containers still registered on a node
    pub failed: usize,
    pub replicas: usize,
}

impl Census {
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Iterate every container in node order, then ID order
    pub fn containers(&self) -> impl Iterator<Item = &ContainerView> {
        self.nodes.iter().flat_map(|n| n.containers.iter())
    }

    /// Containers that are failed and not replicas
    pub fn failed_containers(&self) -> Vec<&ContainerView> {
        self.containers().filter(|c| c.needs_repair()).collect()
    }
}
