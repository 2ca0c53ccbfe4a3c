//! Allocation worker.
//!
//! Keeps the number of Ready slots at the configured watermark. Every tick
//! (or whenever the pool reports a deficit) it reserves capacity and
//! spawns one warm-up task per reservation, bounded by a boot semaphore.
//! A failed warm-up is logged and counted; the next tick or deficit signal
//! tries again.

use crate::cleanup::teardown;
use crate::config::{PoolConfig, SandboxConfig};
use crate::error::{CoreError, RuntimeError};
use crate::pool::{Reservation, SandboxPool};
use crate::protocol::SandboxStream;
use crate::runtime::{ContainerId, ContainerRuntime};
use crate::slot::SlotId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;

/// Background worker that replenishes the pool.
#[derive(Clone)]
pub struct AllocationWorker {
    pool: Arc<SandboxPool>,
    runtime: Arc<dyn ContainerRuntime>,
    sandbox: Arc<SandboxConfig>,
    fill_interval: Duration,
    warmup_timeout: Duration,
    /// Limits concurrent warm-ups.
    boots: Arc<Semaphore>,
}

impl AllocationWorker {
    pub fn new(
        pool: Arc<SandboxPool>,
        runtime: Arc<dyn ContainerRuntime>,
        config: &PoolConfig,
    ) -> Self {
        Self {
            pool,
            runtime,
            sandbox: Arc::new(config.sandbox.clone()),
            fill_interval: config.fill_interval,
            warmup_timeout: config.warmup_timeout,
            boots: Arc::new(Semaphore::new(config.max_concurrent_boots)),
        }
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// In-flight warm-ups are awaited before returning so no created
    /// container is left untracked.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            target_ready = self.pool.target_ready(),
            interval_ms = self.fill_interval.as_millis() as u64,
            "Allocation worker started"
        );

        let mut warmups = JoinSet::new();
        let mut refill = true;
        let mut budget = 0;
        loop {
            if refill {
                budget = self.pool.deficit();
                refill = false;
            }
            if budget > 0 {
                let spawned = self.spawn_warmups(&mut warmups, budget);
                budget -= spawned;
                if spawned > 0 {
                    tracing::debug!(spawned, remaining = budget, "Spawned sandbox warm-ups");
                }
            }

            // A freed boot permit is reused from the current budget. Failed
            // warm-ups are only retried once a tick or deficit signal
            // renews it.
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Allocation worker received shutdown signal");
                    break;
                }
                _ = tokio::time::sleep(self.fill_interval) => refill = true,
                _ = self.pool.deficit_notified() => refill = true,
                Some(joined) = warmups.join_next(), if !warmups.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Warm-up task panicked");
                    }
                }
            }
        }

        if !warmups.is_empty() {
            tracing::debug!(in_flight = warmups.len(), "Waiting for warm-ups to finish");
        }
        while let Some(joined) = warmups.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Warm-up task panicked");
            }
        }
        tracing::info!("Allocation worker stopped");
    }

    /// Reserve capacity and spawn up to `limit` warm-ups, stopping early at
    /// the watermark, `max_size` or the boot limit. Returns the number
    /// spawned.
    pub fn spawn_warmups(&self, warmups: &mut JoinSet<bool>, limit: usize) -> usize {
        let mut spawned = 0;
        while spawned < limit {
            let Ok(permit) = Arc::clone(&self.boots).try_acquire_owned() else {
                break;
            };
            let Some(reservation) = self.pool.reserve() else {
                break;
            };
            let worker = self.clone();
            warmups.spawn(async move { worker.warm_up(reservation, permit).await });
            spawned += 1;
        }
        spawned
    }

    /// Run one replenishment round to completion.
    ///
    /// The round makes one warm-up attempt per missing slot, starting the
    /// next as soon as a boot permit frees up. Returns the number of
    /// sandboxes that reached Ready.
    pub async fn replenish(&self) -> usize {
        let mut warmups = JoinSet::new();
        let mut budget = self.pool.deficit();
        budget -= self.spawn_warmups(&mut warmups, budget);
        let mut ready = 0;
        while let Some(joined) = warmups.join_next().await {
            if matches!(joined, Ok(true)) {
                ready += 1;
            }
            budget -= self.spawn_warmups(&mut warmups, budget);
        }
        ready
    }

    async fn warm_up(self, reservation: Reservation, _permit: OwnedSemaphorePermit) -> bool {
        match self.try_warm_up(reservation).await {
            Ok(Some(slot)) => {
                tracing::info!(slot = %slot, "Sandbox warmed up");
                true
            }
            Ok(None) => {
                // Retired while warming, e.g. reaped by cleanup for a slow start.
                if !self.pool.is_closed() {
                    self.pool.record_creation_failure();
                    tracing::warn!("Sandbox retired before it became ready");
                }
                false
            }
            Err(e) => {
                self.pool.record_creation_failure();
                tracing::warn!(error = %e, "Sandbox warm-up failed");
                false
            }
        }
    }

    /// Create, admit, attach and start one sandbox.
    ///
    /// `Ok(None)` means the slot was retired while warming.
    async fn try_warm_up(&self, reservation: Reservation) -> Result<Option<SlotId>, CoreError> {
        let deadline = Instant::now() + self.warmup_timeout;
        let timed_out = || CoreError::WarmupTimeout(self.warmup_timeout);

        let container_id = timeout_at(deadline, self.runtime.create(&self.sandbox))
            .await
            .map_err(|_| timed_out())??;

        let slot = match reservation.admit(container_id.clone()) {
            Ok(slot) => slot,
            Err(e) => {
                // Not tracked by the pool, tear it down here.
                teardown(
                    &self.pool,
                    self.runtime.as_ref(),
                    &container_id,
                    self.sandbox.stop_grace,
                )
                .await;
                return Err(e);
            }
        };

        let stream = match timeout_at(deadline, self.attach_and_start(&container_id)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.pool.retire(slot);
                return Err(e.into());
            }
            Err(_) => {
                self.pool.retire(slot);
                return Err(timed_out());
            }
        };

        Ok(self.pool.promote(slot, stream).then_some(slot))
    }

    async fn attach_and_start(&self, id: &ContainerId) -> Result<SandboxStream, RuntimeError> {
        // Attach before start so no early output is lost.
        let stream = self.runtime.attach(id).await?;
        if !self.runtime.start(id).await? {
            return Err(RuntimeError::NotStarted(id.clone()));
        }
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::SlotState;
    use crate::testing::{FakeRuntime, GuestBehavior};

    fn setup(target_ready: usize, max_size: usize) -> (Arc<SandboxPool>, Arc<FakeRuntime>, AllocationWorker) {
        let config = PoolConfig {
            target_ready,
            max_size,
            max_concurrent_boots: 4,
            warmup_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let pool = Arc::new(SandboxPool::new(&config));
        let runtime = Arc::new(FakeRuntime::new(GuestBehavior::Echo));
        let worker = AllocationWorker::new(Arc::clone(&pool), runtime.clone(), &config);
        (pool, runtime, worker)
    }

    #[tokio::test]
    async fn test_replenish_fills_to_watermark() {
        let (pool, runtime, worker) = setup(2, 4);
        assert_eq!(worker.replenish().await, 2);
        assert_eq!(pool.counts().ready, 2);
        assert_eq!(runtime.created(), 2);

        // Already at the watermark.
        assert_eq!(worker.replenish().await, 0);
        assert_eq!(runtime.created(), 2);
    }

    #[tokio::test]
    async fn test_replenish_respects_max_size() {
        let (pool, _runtime, worker) = setup(2, 2);
        worker.replenish().await;
        let _a = pool.try_acquire().unwrap();
        let _b = pool.try_acquire().unwrap();

        // Two Allocated slots fill max_size: no warm-up possible.
        assert_eq!(worker.replenish().await, 0);
        assert_eq!(pool.counts().live(), 2);
    }

    #[tokio::test]
    async fn test_boot_limit_bounds_spawned_warmups() {
        let config = PoolConfig {
            target_ready: 4,
            max_size: 4,
            max_concurrent_boots: 1,
            ..Default::default()
        };
        let pool = Arc::new(SandboxPool::new(&config));
        let runtime = Arc::new(FakeRuntime::default());
        let worker = AllocationWorker::new(Arc::clone(&pool), runtime, &config);

        let mut warmups = JoinSet::new();
        assert_eq!(worker.spawn_warmups(&mut warmups, 4), 1);
        assert_eq!(worker.spawn_warmups(&mut warmups, 4), 0);
        while warmups.join_next().await.is_some() {}
        assert_eq!(pool.counts().ready, 1);
    }

    #[tokio::test]
    async fn test_create_failure_is_counted_and_retried() {
        let (pool, runtime, worker) = setup(2, 2);
        runtime.fail_next_creates(1);

        assert_eq!(worker.replenish().await, 1);
        assert_eq!(pool.stats().snapshot().creation_failures, 1);
        assert_eq!(pool.counts().reserved, 0);

        assert_eq!(worker.replenish().await, 1);
        assert_eq!(pool.counts().ready, 2);
    }

    #[tokio::test]
    async fn test_start_refusal_retires_slot() {
        let (pool, runtime, worker) = setup(1, 1);
        runtime.fail_next_starts(1);

        assert_eq!(worker.replenish().await, 0);
        let counts = pool.counts();
        assert_eq!(counts.draining, 1);
        assert_eq!(counts.ready, 0);
        let slot = pool.snapshot()[0].id;
        assert_eq!(pool.state(slot), Some(SlotState::Draining));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_create_times_out() {
        let (pool, runtime, worker) = setup(1, 1);
        runtime.set_create_delay(Some(Duration::from_secs(5)));

        assert_eq!(worker.replenish().await, 0);
        assert_eq!(pool.stats().snapshot().creation_failures, 1);
        assert_eq!(pool.counts().live(), 0);
    }

    #[tokio::test]
    async fn test_admit_after_close_tears_container_down() {
        let (pool, runtime, worker) = setup(1, 1);
        let reservation = pool.reserve().unwrap();
        pool.close();

        let permit = Arc::clone(&worker.boots).try_acquire_owned().unwrap();
        assert!(!worker.clone().warm_up(reservation, permit).await);
        assert_eq!(runtime.created(), 1);
        assert_eq!(runtime.total_removes(), 1);
        assert!(pool.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_replenish_reuses_freed_boot_permits() {
        let config = PoolConfig {
            target_ready: 4,
            max_size: 4,
            max_concurrent_boots: 2,
            ..Default::default()
        };
        let pool = Arc::new(SandboxPool::new(&config));
        let runtime = Arc::new(FakeRuntime::default());
        let worker = AllocationWorker::new(Arc::clone(&pool), runtime.clone(), &config);

        assert_eq!(worker.replenish().await, 4);
        assert_eq!(pool.counts().ready, 4);
        assert_eq!(runtime.created(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_fills_past_boot_limit_within_one_tick() {
        let config = PoolConfig {
            target_ready: 4,
            max_size: 4,
            max_concurrent_boots: 2,
            fill_interval: Duration::from_secs(60),
            ..Default::default()
        };
        let pool = Arc::new(SandboxPool::new(&config));
        let worker = AllocationWorker::new(Arc::clone(&pool), Arc::new(FakeRuntime::default()), &config);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(worker.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.counts().ready, 4);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_retired_while_warming_counts_as_failure() {
        let (pool, runtime, worker) = setup(1, 1);
        runtime.set_start_delay(Some(Duration::from_secs(1)));

        let round = tokio::spawn({
            let worker = worker.clone();
            async move { worker.replenish().await }
        });
        tokio::time::sleep(Duration::from_millis(500)).await;
        let slot = pool.snapshot()[0].id;
        assert_eq!(pool.state(slot), Some(SlotState::Warming));
        assert!(pool.retire(slot));

        assert_eq!(round.await.unwrap(), 0);
        assert_eq!(pool.stats().snapshot().creation_failures, 1);
        assert_eq!(pool.state(slot), Some(SlotState::Draining));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let (pool, _runtime, worker) = setup(2, 2);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(worker.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.counts().ready, 2);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
