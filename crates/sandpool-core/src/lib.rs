//! # sandpool-core
//!
//! Warm container pool for running untrusted programs.
//!
//! A fixed number of sandbox containers are kept created, attached and
//! started ahead of time so an execution only pays for a stdin/stdout
//! round-trip, never for a container boot.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                      SandboxService                           │
//! ├───────────────────────────────────────────────────────────────┤
//! │                                                               │
//! │  ┌──────────────────┐  reserve/admit  ┌───────────────────┐  │
//! │  │ AllocationWorker │───────promote──▶│                   │  │
//! │  └──────────────────┘                 │                   │  │
//! │           │ create/attach/start       │   SandboxPool     │  │
//! │           ▼                           │  (slot table,     │  │
//! │  ┌──────────────────┐                 │   single lock)    │  │
//! │  │ ContainerRuntime │                 │                   │  │
//! │  │ (DockerRuntime)  │◀──stop/remove───│                   │  │
//! │  └──────────────────┘        │        └───────────────────┘  │
//! │                     ┌──────────────────┐   ▲         │       │
//! │                     │  CleanupWorker   │───┘ retire  │ lease │
//! │                     └──────────────────┘             ▼       │
//! │                                         ┌───────────────────┐│
//! │                                         │     Executor      ││
//! │                                         │ execute → output  ││
//! │                                         └───────────────────┘│
//! └───────────────────────────────────────────────────────────────┘
//!                           │ framed stdin/stdout
//!                           ▼
//!               ┌──────────────────────────┐
//!               │  in-sandbox runner       │
//!               └──────────────────────────┘
//! ```
//!
//! ## Slot lifecycle
//!
//! `Warming → Ready → Allocated → (Ready | Draining)`. Any live slot may be
//! retired to `Draining`; only the cleanup worker removes Draining slots
//! and tears their containers down.
//!
//! ## Quick Start
//!
//! ```ignore
//! use sandpool_core::{DockerRuntime, PoolConfig, SandboxConfig, SandboxService};
//!
//! # async fn example() -> sandpool_core::Result<()> {
//! let config = PoolConfig::builder()
//!     .target_ready(2)
//!     .max_size(4)
//!     .sandbox(SandboxConfig {
//!         image: "runner:latest".into(),
//!         ..Default::default()
//!     })
//!     .build()?;
//!
//! let runtime = std::sync::Arc::new(DockerRuntime::connect()?);
//! let service = SandboxService::start(config, runtime)?;
//!
//! match service.execute("print('hi')".into()).await {
//!     Ok(result) => println!("{:?}", result.output),
//!     Err(e) if e.is_retryable() => println!("busy, try again"),
//!     Err(e) => return Err(e),
//! }
//!
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod allocator;
mod cleanup;
mod config;
mod error;
mod executor;
mod pool;
mod protocol;
mod runtime;
mod service;
mod slot;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;


pub use allocator::AllocationWorker;
pub use cleanup::{teardown, CleanupReport, CleanupWorker};
pub use config::{MountSpec, PoolConfig, PoolConfigBuilder, SandboxConfig};
pub use error::{CoreError, FrameError, ProtocolError, Result, RuntimeError};
pub use executor::{Disposition, ExecutionOutput, Executor};
pub use pool::{Lease, PoolCounts, PoolStats, Reservation, SandboxPool, StatsSnapshot};
pub use protocol::{
    read_output, write_execute, write_exit, CorrelationId, Frame, FrameCodec, FrameKind,
    SandboxStream, HEADER_SIZE, MAX_PAYLOAD_SIZE,
};
pub use runtime::{ContainerId, ContainerRuntime, DockerRuntime};
pub use service::SandboxService;
pub use slot::{SlotId, SlotInfo, SlotState};
