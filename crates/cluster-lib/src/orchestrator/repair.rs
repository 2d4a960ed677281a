//! Repair path for a single failed container
//!
//! A repair waits the configured latency, then redeploys onto the node the
//! failed container lived on. Capacity errors are retried under the
//! orchestrator's [`RetryPolicy`](super::RetryPolicy); anything else ends
//! the repair.

use super::Orchestrator;
use crate::health::components;
use crate::models::{ContainerId, ContainerView, NodeId};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A failed container that has been evicted and awaits its replacement
#[derive(Debug, Clone)]
pub struct RepairTicket {
    pub failed_id: ContainerId,
    pub node_id: NodeId,
    pub service: String,
    pub detected_at: Instant,
}

/// Cumulative repair statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RepairStats {
    /// Completed repairs
    pub failures: u64,
    /// Sum of detection-to-redeploy durations
    pub total_repair_time: Duration,
    /// Repairs given up after the retry policy ran out
    pub abandoned: u64,
}

impl RepairStats {
    /// Mean repair time, zero when nothing has been repaired
    pub fn average_repair_time(&self) -> Duration {
        if self.failures == 0 {
            return Duration::ZERO;
        }
        let nanos = self.total_repair_time.as_nanos() / u128::from(self.failures);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

/// Sleep unless cancelled first; returns `false` on cancellation
async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

impl Orchestrator {
    pub(crate) async fn repair(&self, ticket: RepairTicket) {
        let cancel = self.cluster.shutdown_token();
        let mut attempt = 1u32;

        if pause(self.config.repair_latency, &cancel).await {
            loop {
                match self.cluster.deploy_to(ticket.node_id, &ticket.service) {
                    Ok(replacement) => {
                        self.record_repair(&ticket, &replacement, attempt);
                        break;
                    }
                    Err(e) if e.is_capacity() && self.config.retry.allows_retry(attempt) => {
                        let backoff = self.config.retry.backoff_for(attempt);
                        debug!(
                            failed_container_id = ticket.failed_id,
                            node_id = ticket.node_id,
                            attempt,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Replacement deploy failed, retrying"
                        );
                        if !pause(backoff, &cancel).await {
                            debug!(failed_container_id = ticket.failed_id, "Repair cancelled");
                            break;
                        }
                        attempt += 1;
                    }
                    Err(e) if cancel.is_cancelled() => {
                        debug!(
                            failed_container_id = ticket.failed_id,
                            error = %e,
                            "Repair cancelled"
                        );
                        break;
                    }
                    Err(e) => {
                        self.abandon_repair(&ticket, attempt, &e.to_string()).await;
                        break;
                    }
                }
            }
        } else {
            debug!(failed_container_id = ticket.failed_id, "Repair cancelled");
        }

        self.in_flight.remove(&ticket.failed_id);
        self.metrics.set_repairs_in_flight(self.in_flight.len());
    }

    fn record_repair(&self, ticket: &RepairTicket, replacement: &ContainerView, attempts: u32) {
        let elapsed = ticket.detected_at.elapsed();
        {
            let mut stats = self.stats_guard();
            stats.failures += 1;
            stats.total_repair_time += elapsed;
        }
        *self
            .failures_by_service
            .entry(ticket.service.clone())
            .or_insert(0) += 1;

        self.metrics.observe_repair(elapsed);
        self.logger.log_repair_completed(
            ticket.failed_id,
            replacement.id,
            replacement.node_id,
            &ticket.service,
            elapsed,
            attempts,
        );
    }

    async fn abandon_repair(&self, ticket: &RepairTicket, attempts: u32, reason: &str) {
        self.stats_guard().abandoned += 1;
        self.metrics.inc_repairs_abandoned();
        self.logger
            .log_repair_abandoned(ticket.failed_id, &ticket.service, attempts, reason);
        self.health
            .set_degraded(
                components::DETECTOR,
                format!(
                    "repair of container {} abandoned: {}",
                    ticket.failed_id, reason
                ),
            )
            .await;
    }
}
