//! Operator-facing cluster report

use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Snapshot of repair statistics and capacity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterReport {
    pub failures: u64,
    pub avg_repair: Duration,
    pub nodes: usize,
    pub used_slots: usize,
    pub capacity: usize,
    pub repairs_in_flight: usize,
    pub repairs_abandoned: u64,
}

impl ClusterReport {
    /// `Failures: <count> | Avg Repair: <duration>`
    pub fn failure_line(&self) -> String {
        format!(
            "Failures: {} | Avg Repair: {:?}",
            self.failures, self.avg_repair
        )
    }

    /// `Nodes:<count> Used:<usedSlots> Total:<capacity>`
    pub fn capacity_line(&self) -> String {
        format!(
            "Nodes:{} Used:{} Total:{}",
            self.nodes, self.used_slots, self.capacity
        )
    }
}

impl fmt::Display for ClusterReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.failure_line())?;
        write!(f, "{}", self.capacity_line())
    }
}
