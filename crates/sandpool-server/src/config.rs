//! Configuration for the sandpool server.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use sandpool_core::{MountSpec, PoolConfig, SandboxConfig};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Default cap on a request body (1 MB).
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Configuration for the sandpool server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP server bind address.
    pub http_addr: SocketAddr,

    /// Sandbox image (required).
    pub image: String,

    /// Runner command inside the sandbox (image default if empty).
    pub command: Vec<String>,

    /// Optional read-only bind mount carrying the runner.
    pub mount: Option<MountSpec>,

    /// CPU quota per sandbox (default: 50000).
    pub cpu_quota: i64,

    /// Memory limit per sandbox in bytes (default: none).
    pub memory_bytes: Option<i64>,

    /// Ready watermark (default: 2).
    pub target_ready: usize,

    /// Pool size cap (default: 4).
    pub max_size: usize,

    /// Concurrent warm-ups (default: 2).
    pub max_boots: usize,

    /// Per-request execution deadline (default: 10 s).
    pub execution_timeout: Duration,

    /// Longest a slot may stay Warming or Allocated (default: 30 s).
    pub max_slot_age: Duration,

    /// Idle limit for Warming or Allocated slots (default: 15 s).
    pub liveness_threshold: Duration,

    /// Reuse slots after clean executions (default: false).
    pub reuse_slots: bool,

    /// Request body limit (default: 1 MB).
    pub max_payload_bytes: usize,
}

/// Configuration validation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("SANDPOOL_IMAGE is not set")]
    MissingImage,

    #[error("mount source not found: {0}")]
    MissingMountSource(PathBuf),

    #[error("SANDPOOL_MAX_PAYLOAD_BYTES ({0}) exceeds the frame limit ({1})")]
    PayloadTooLarge(usize, usize),

    #[error(transparent)]
    Pool(#[from] sandpool_core::CoreError),
}

impl Default for ServerConfig {
    fn default() -> Self {
        let pool = PoolConfig::default();
        Self {
            http_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), 8080),
            image: String::new(),
            command: Vec::new(),
            mount: None,
            cpu_quota: pool.sandbox.cpu_quota,
            memory_bytes: None,
            target_ready: pool.target_ready,
            max_size: pool.max_size,
            max_boots: pool.max_concurrent_boots,
            execution_timeout: pool.execution_timeout,
            max_slot_age: pool.max_slot_age,
            liveness_threshold: pool.liveness_threshold,
            reuse_slots: pool.reuse_slots,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `SANDPOOL_HTTP_HOST` | `0.0.0.0` |
    /// | `SANDPOOL_HTTP_PORT` | `8080` |
    /// | `SANDPOOL_IMAGE` | (required) |
    /// | `SANDPOOL_COMMAND` | image default (whitespace separated) |
    /// | `SANDPOOL_MOUNT_SOURCE` / `SANDPOOL_MOUNT_TARGET` | no mount |
    /// | `SANDPOOL_CPU_QUOTA` | `50000` |
    /// | `SANDPOOL_MEMORY_BYTES` | unlimited |
    /// | `SANDPOOL_TARGET_READY` | `2` |
    /// | `SANDPOOL_MAX_SIZE` | `4` |
    /// | `SANDPOOL_MAX_BOOTS` | `2` |
    /// | `SANDPOOL_EXECUTION_TIMEOUT_MS` | `10000` |
    /// | `SANDPOOL_MAX_SLOT_AGE_MS` | `30000` |
    /// | `SANDPOOL_LIVENESS_MS` | `15000` |
    /// | `SANDPOOL_REUSE_SLOTS` | `false` |
    /// | `SANDPOOL_MAX_PAYLOAD_BYTES` | `1048576` |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, falling back to defaults for
    /// unset or unparsable values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let default = Self::default();
        let parse = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let millis = |key: &str, fallback: Duration| {
            parse(key).map(Duration::from_millis).unwrap_or(fallback)
        };

        let http_host: IpAddr = lookup("SANDPOOL_HTTP_HOST")
            .and_then(|v| v.parse().ok())
            .unwrap_or(default.http_addr.ip());
        let http_port: u16 = lookup("SANDPOOL_HTTP_PORT")
            .and_then(|v| v.parse().ok())
            .unwrap_or(default.http_addr.port());

        let mount = match (lookup("SANDPOOL_MOUNT_SOURCE"), lookup("SANDPOOL_MOUNT_TARGET")) {
            (Some(source), Some(target)) => Some(MountSpec::read_only(source, target)),
            _ => None,
        };

        Self {
            http_addr: SocketAddr::new(http_host, http_port),
            image: lookup("SANDPOOL_IMAGE").unwrap_or(default.image),
            command: lookup("SANDPOOL_COMMAND")
                .map(|v| v.split_whitespace().map(String::from).collect())
                .unwrap_or(default.command),
            mount,
            cpu_quota: lookup("SANDPOOL_CPU_QUOTA")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.cpu_quota),
            memory_bytes: lookup("SANDPOOL_MEMORY_BYTES").and_then(|v| v.parse().ok()),
            target_ready: parse("SANDPOOL_TARGET_READY")
                .map(|v| v as usize)
                .unwrap_or(default.target_ready),
            max_size: parse("SANDPOOL_MAX_SIZE")
                .map(|v| v as usize)
                .unwrap_or(default.max_size),
            max_boots: parse("SANDPOOL_MAX_BOOTS")
                .map(|v| v as usize)
                .unwrap_or(default.max_boots),
            execution_timeout: millis("SANDPOOL_EXECUTION_TIMEOUT_MS", default.execution_timeout),
            max_slot_age: millis("SANDPOOL_MAX_SLOT_AGE_MS", default.max_slot_age),
            liveness_threshold: millis("SANDPOOL_LIVENESS_MS", default.liveness_threshold),
            reuse_slots: lookup("SANDPOOL_REUSE_SLOTS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(default.reuse_slots),
            max_payload_bytes: parse("SANDPOOL_MAX_PAYLOAD_BYTES")
                .map(|v| v as usize)
                .unwrap_or(default.max_payload_bytes),
        }
    }

    /// Build the pool configuration.
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            target_ready: self.target_ready,
            max_size: self.max_size,
            max_concurrent_boots: self.max_boots,
            execution_timeout: self.execution_timeout,
            max_slot_age: self.max_slot_age,
            liveness_threshold: self.liveness_threshold,
            reuse_slots: self.reuse_slots,
            sandbox: SandboxConfig {
                image: self.image.clone(),
                command: self.command.clone(),
                mounts: self.mount.iter().cloned().collect(),
                cpu_quota: self.cpu_quota,
                memory_bytes: self.memory_bytes,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.image.trim().is_empty() {
            return Err(ConfigError::MissingImage);
        }
        if self.max_payload_bytes > sandpool_core::MAX_PAYLOAD_SIZE {
            return Err(ConfigError::PayloadTooLarge(
                self.max_payload_bytes,
                sandpool_core::MAX_PAYLOAD_SIZE,
            ));
        }
        self.to_pool_config().validate()?;
        Ok(())
    }

    /// Log warnings for settings that are valid but likely wrong.
    pub fn validate_warn(&self) {
        if let Some(mount) = &self.mount {
            if !mount.source.exists() {
                tracing::warn!(error = %ConfigError::MissingMountSource(mount.source.clone()), "Mount source missing on this host");
            }
        }
        if self.target_ready == 0 {
            tracing::warn!("SANDPOOL_TARGET_READY is 0, every request will be rejected");
        }
        if self.reuse_slots {
            tracing::warn!("Slot reuse enabled, sandboxes are shared across executions");
        }
    }
}
