//! Pool service: the pool plus its two background workers.

use crate::allocator::AllocationWorker;
use crate::cleanup::{teardown, CleanupWorker};
use crate::config::PoolConfig;
use crate::error::Result;
use crate::executor::{ExecutionOutput, Executor};
use crate::pool::SandboxPool;
use crate::runtime::ContainerRuntime;
use bytes::Bytes;
use futures::future::join_all;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Running sandbox pool with its allocation and cleanup workers.
///
/// # Example
///
/// ```ignore
/// let runtime = Arc::new(DockerRuntime::connect()?);
/// let service = SandboxService::start(config, runtime)?;
///
/// let result = service.execute(Bytes::from_static(b"print(1)")).await?;
///
/// service.shutdown().await;
/// ```
pub struct SandboxService {
    pool: Arc<SandboxPool>,
    runtime: Arc<dyn ContainerRuntime>,
    executor: Executor,
    config: PoolConfig,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SandboxService {
    /// Validate `config`, create the pool and spawn both workers.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: PoolConfig, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        config.validate()?;

        let pool = Arc::new(SandboxPool::new(&config));
        let shutdown = CancellationToken::new();

        let allocator = AllocationWorker::new(Arc::clone(&pool), Arc::clone(&runtime), &config);
        let cleanup = CleanupWorker::new(Arc::clone(&pool), Arc::clone(&runtime), &config);
        let workers = vec![
            tokio::spawn(allocator.run(shutdown.child_token())),
            tokio::spawn(cleanup.run(shutdown.child_token())),
        ];

        tracing::info!(
            image = %config.sandbox.image,
            target_ready = config.target_ready,
            max_size = config.max_size,
            reuse_slots = config.reuse_slots,
            "Sandbox service started"
        );

        Ok(Self {
            executor: Executor::new(Arc::clone(&pool), &config),
            pool,
            runtime,
            config,
            shutdown,
            workers: Mutex::new(workers),
        })
    }

    /// Execute a program on a warm sandbox.
    pub async fn execute(&self, payload: Bytes) -> Result<ExecutionOutput> {
        self.executor.execute(payload).await
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn pool(&self) -> &Arc<SandboxPool> {
        &self.pool
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Stop both workers and tear down every sandbox.
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down sandbox service");

        // Close first so warm-ups finishing during shutdown are torn down
        // instead of admitted.
        let retired = self.pool.close();
        self.shutdown.cancel();

        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in workers {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task failed during shutdown");
            }
        }

        let drained = self.pool.take_draining();
        let grace = self.config.sandbox.stop_grace;
        join_all(
            drained
                .iter()
                .map(|(_, id)| teardown(&self.pool, self.runtime.as_ref(), id, grace)),
        )
        .await;

        tracing::info!(
            retired,
            destroyed = drained.len(),
            "Sandbox service stopped"
        );
    }
}

impl Drop for SandboxService {
    fn drop(&mut self) {
        if !self.shutdown.is_cancelled() {
            tracing::warn!("SandboxService dropped without shutdown, containers may leak");
            self.shutdown.cancel();
        }
    }
}
