//! Execution orchestrator.
//!
//! Runs one submitted program on a pooled sandbox: claim a Ready slot,
//! write the command and the exit sentinel, read the output frame carrying
//! this execution's correlation id, then dispose of the slot.

use crate::config::PoolConfig;
use crate::error::{CoreError, ProtocolError, Result};
use crate::pool::{Lease, SandboxPool};
use crate::protocol::{read_output, write_execute, write_exit, CorrelationId};
use crate::slot::SlotId;
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// What happened to the slot after an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    /// Returned to Ready for the next execution.
    Released,
    /// Moved to Draining and scheduled for teardown.
    Retired,
}

/// Result of a successful execution.
#[derive(Debug, Clone)]
pub struct ExecutionOutput {
    pub correlation_id: CorrelationId,
    pub slot: SlotId,
    /// Output payload exactly as the runner produced it.
    pub output: Bytes,
    pub elapsed: Duration,
    pub disposition: Disposition,
}

/// Runs programs on warm sandboxes.
#[derive(Clone)]
pub struct Executor {
    pool: Arc<SandboxPool>,
    execution_timeout: Duration,
    reuse_slots: bool,
}

impl Executor {
    pub fn new(pool: Arc<SandboxPool>, config: &PoolConfig) -> Self {
        Self {
            pool,
            execution_timeout: config.execution_timeout,
            reuse_slots: config.reuse_slots,
        }
    }

    /// Execute `payload` with the configured timeout.
    pub async fn execute(&self, payload: Bytes) -> Result<ExecutionOutput> {
        self.execute_with_deadline(payload, Instant::now() + self.execution_timeout)
            .await
    }

    /// Execute `payload`, failing if it has not finished by `deadline`.
    ///
    /// # Errors
    ///
    /// - [`CoreError::PoolExhausted`] if no slot is Ready. Nothing is
    ///   created on demand and nothing was sent.
    /// - [`CoreError::Protocol`] on any exchange failure, including the
    ///   deadline elapsing. The slot is retired.
    ///
    /// Dropping the returned future mid-flight also retires the slot.
    pub async fn execute_with_deadline(
        &self,
        payload: Bytes,
        deadline: Instant,
    ) -> Result<ExecutionOutput> {
        let started = Instant::now();
        let mut lease = self.pool.try_acquire().ok_or(CoreError::PoolExhausted)?;
        let slot = lease.slot();
        let correlation_id = CorrelationId::new();

        tracing::debug!(
            slot = %slot,
            container_id = %lease.container_id(),
            correlation_id = %correlation_id,
            payload_len = payload.len(),
            "Starting execution"
        );

        match self
            .exchange(&mut lease, payload, correlation_id, deadline)
            .await
        {
            Ok(output) => {
                let disposition = self.dispose(lease);
                let elapsed = started.elapsed();
                tracing::info!(
                    slot = %slot,
                    correlation_id = %correlation_id,
                    output_len = output.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    ?disposition,
                    "Execution completed"
                );
                Ok(ExecutionOutput {
                    correlation_id,
                    slot,
                    output,
                    elapsed,
                    disposition,
                })
            }
            Err(e) => {
                self.pool.retire_lease(lease);
                tracing::warn!(
                    slot = %slot,
                    correlation_id = %correlation_id,
                    error = %e,
                    "Execution failed, slot retired"
                );
                Err(e.into())
            }
        }
    }

    async fn exchange(
        &self,
        lease: &mut Lease,
        payload: Bytes,
        correlation_id: CorrelationId,
        deadline: Instant,
    ) -> std::result::Result<Bytes, ProtocolError> {
        write_execute(lease.stream(), payload, correlation_id, deadline).await?;
        write_exit(lease.stream(), deadline).await?;
        self.pool.touch(lease.slot());
        read_output(lease.stream(), correlation_id, deadline).await
    }

    fn dispose(&self, lease: Lease) -> Disposition {
        if !self.reuse_slots {
            self.pool.retire_lease(lease);
            return Disposition::Retired;
        }
        if self.pool.release(lease) {
            Disposition::Released
        } else {
            Disposition::Retired
        }
    }
}
