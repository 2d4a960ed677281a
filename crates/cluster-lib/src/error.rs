//! Cluster error types.

use thiserror::Error;

use crate::models::{ContainerId, NodeId};

/// Errors that can occur during placement and cluster operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClusterError {
    #[error("cluster has no nodes")]
    NoNodes,

    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("unknown container: {0}")]
    UnknownContainer(ContainerId),

    #[error("capacity exhausted: {used}/{capacity} slots in use")]
    CapacityExhausted { used: usize, capacity: usize },

    #[error("node {node_id} is full ({capacity} slots)")]
    NodeFull { node_id: NodeId, capacity: usize },

    #[error("cluster is shutting down")]
    ShuttingDown,

    #[error("orchestrator already started")]
    AlreadyStarted,

    #[error("deploy requires a running Tokio runtime")]
    NoRuntime,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClusterError {
    /// Capacity conditions are recoverable by waiting for a slot to free up
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            ClusterError::CapacityExhausted { .. } | ClusterError::NodeFull { .. }
        )
    }
}

pub type ClusterResult<T> = Result<T, ClusterError>;
