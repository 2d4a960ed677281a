//! Self-healing cluster simulation library
//!
//! This crate provides the core machinery for:
//! - Simulated containers with an internal failure process
//! - Capacity-bounded nodes and first-fit placement
//! - Failure detection and repair
//! - Smoothed utilization, latency and failure metrics
//! - Health checks and observability

pub mod cluster;
pub mod error;
pub mod health;
pub mod models;
pub mod monitor;
pub mod observability;
pub mod orchestrator;
pub mod report;

pub use cluster::{
    Cluster, ContainerSimConfig, OverflowPolicy, PlacementConfig, RngFactory, SeededRngFactory,
};
pub use error::{ClusterError, ClusterResult};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use monitor::{Ema, LatencyModel, MetricsSample, Monitor, MonitorConfig};
pub use observability::{ClusterMetrics, StructuredLogger};
pub use orchestrator::{
    ControlContext, ControlPolicy, FaultInjectionConfig, FaultInjector, Orchestrator,
    OrchestratorBuilder, OrchestratorConfig, Remediation, RepairStats, RetryPolicy,
    ThresholdPolicy,
};
pub use report::ClusterReport;
