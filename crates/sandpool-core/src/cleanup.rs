//! Cleanup worker.
//!
//! Each tick:
//!
//! 1. retires Warming/Allocated slots that are too old or idle,
//! 2. probes Ready slots and retires those whose container has exited,
//! 3. claims every Draining slot and tears its container down.
//!
//! Teardown only ever happens here (and in service shutdown), and
//! [`SandboxPool::take_draining`] hands each slot out once, so a container
//! is stopped and removed exactly once.

use crate::config::PoolConfig;
use crate::pool::SandboxPool;
use crate::runtime::{ContainerId, ContainerRuntime};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// What one cleanup tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Slots retired for age or inactivity.
    pub expired: usize,
    /// Ready slots whose container was found dead.
    pub dead: usize,
    /// Containers torn down.
    pub destroyed: usize,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Background worker that reaps slots.
pub struct CleanupWorker {
    pool: Arc<SandboxPool>,
    runtime: Arc<dyn ContainerRuntime>,
    interval: Duration,
    max_slot_age: Duration,
    liveness_threshold: Duration,
    probe_timeout: Option<Duration>,
    stop_grace: Duration,
}

impl CleanupWorker {
    pub fn new(
        pool: Arc<SandboxPool>,
        runtime: Arc<dyn ContainerRuntime>,
        config: &PoolConfig,
    ) -> Self {
        Self {
            pool,
            runtime,
            interval: config.cleanup_interval,
            max_slot_age: config.max_slot_age,
            liveness_threshold: config.liveness_threshold,
            probe_timeout: config.probe_timeout,
            stop_grace: config.sandbox.stop_grace,
        }
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            max_slot_age_ms = self.max_slot_age.as_millis() as u64,
            "Cleanup worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Cleanup worker received shutdown signal");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.pool.draining_notified() => {}
            }

            let report = self.tick().await;
            if !report.is_empty() {
                tracing::debug!(
                    expired = report.expired,
                    dead = report.dead,
                    destroyed = report.destroyed,
                    "Cleanup tick"
                );
            }
        }
        tracing::info!("Cleanup worker stopped");
    }

    /// Run one cleanup pass.
    pub async fn tick(&self) -> CleanupReport {
        let mut report = CleanupReport::default();

        let now = Instant::now();
        for slot in self
            .pool
            .expired(now, self.max_slot_age, self.liveness_threshold)
        {
            if self.pool.retire(slot) {
                tracing::info!(slot = %slot, "Retired expired slot");
                report.expired += 1;
            }
        }

        if let Some(probe_timeout) = self.probe_timeout {
            report.dead = self.probe_ready(probe_timeout).await;
        }

        let drained = self.pool.take_draining();
        report.destroyed = drained.len();
        join_all(drained.iter().map(|(slot, id)| async move {
            tracing::debug!(slot = %slot, container_id = %id, "Tearing down sandbox");
            teardown(&self.pool, self.runtime.as_ref(), id, self.stop_grace).await;
        }))
        .await;

        report
    }

    /// Retire Ready slots whose container has exited.
    async fn probe_ready(&self, probe_timeout: Duration) -> usize {
        let ready = self.pool.ready_containers();
        if ready.is_empty() {
            return 0;
        }

        let deadline = Instant::now() + probe_timeout;
        let probes = ready.iter().map(|(slot, id)| async move {
            let status = self.runtime.wait(id, deadline).await;
            (*slot, id, status)
        });

        let mut dead = 0;
        for (slot, id, status) in join_all(probes).await {
            let reason = match status {
                Ok(None) => continue,
                Ok(Some(code)) => format!("exited with status {code}"),
                Err(e) => e.to_string(),
            };
            if self.pool.retire(slot) {
                tracing::warn!(slot = %slot, container_id = %id, reason = %reason, "Ready sandbox is gone, retired");
                dead += 1;
            }
        }
        dead
    }
}

/// Stop then force-remove a container.
///
/// Each step is attempted regardless of the other; failures are logged and
/// never propagated.
pub async fn teardown(
    pool: &SandboxPool,
    runtime: &dyn ContainerRuntime,
    id: &ContainerId,
    grace: Duration,
) {
    if let Err(e) = runtime.stop(id, grace).await {
        tracing::warn!(container_id = %id, error = %e, "Failed to stop container");
    }
    if let Err(e) = runtime.remove(id, true).await {
        tracing::warn!(container_id = %id, error = %e, "Failed to remove container");
    }
    pool.record_destroyed();
}
