//! Pool and sandbox configuration types.

use crate::error::CoreError;
use std::path::PathBuf;
use std::time::Duration;

/// A host path mounted into every sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    /// Path on the host.
    pub source: PathBuf,
    /// Path inside the container.
    pub target: String,
    /// Mount read-only (default for runner binaries).
    pub read_only: bool,
}

impl MountSpec {
    /// Create a read-only bind mount.
    pub fn read_only(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: true,
        }
    }
}

/// Configuration for creating a sandbox container.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Container image reference.
    pub image: String,
    /// Command running the in-sandbox runner (image default if empty).
    pub command: Vec<String>,
    /// Bind mounts.
    pub mounts: Vec<MountSpec>,
    /// CFS CPU quota in microseconds per 100ms period (default: 50000, half a core).
    pub cpu_quota: i64,
    /// Memory limit in bytes (default: none).
    pub memory_bytes: Option<i64>,
    /// Disable container networking (default: true).
    pub network_disabled: bool,
    /// Grace period before a stop turns into a kill (default: 1 second).
    pub stop_grace: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: String::new(),
            command: Vec::new(),
            mounts: Vec::new(),
            cpu_quota: 50_000,
            memory_bytes: None,
            network_disabled: true,
            stop_grace: Duration::from_secs(1),
        }
    }
}

impl SandboxConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.image.trim().is_empty() {
            return Err(CoreError::Config("image is required".into()));
        }
        if self.cpu_quota <= 0 {
            return Err(CoreError::Config("cpu_quota must be > 0".into()));
        }
        if matches!(self.memory_bytes, Some(m) if m <= 0) {
            return Err(CoreError::Config("memory_bytes must be > 0".into()));
        }
        Ok(())
    }
}

/// Configuration for the sandbox pool and its workers.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of Ready sandboxes the allocation worker aims for.
    /// Default: 2
    pub target_ready: usize,

    /// Upper bound on Warming + Ready + Allocated sandboxes.
    /// Default: 4
    pub max_size: usize,

    /// Maximum number of sandboxes warming up at the same time.
    /// Default: 2
    pub max_concurrent_boots: usize,

    /// Allocation worker tick.
    /// Default: 1 second
    pub fill_interval: Duration,

    /// Cleanup worker tick.
    /// Default: 1 second
    pub cleanup_interval: Duration,

    /// Longest a slot may stay Warming or Allocated.
    /// Default: 30 seconds
    pub max_slot_age: Duration,

    /// Longest a Warming or Allocated slot may go without activity.
    /// Default: 15 seconds
    pub liveness_threshold: Duration,

    /// Bound on create + attach + start for one sandbox.
    /// Default: 20 seconds
    pub warmup_timeout: Duration,

    /// How long the cleanup worker waits on each Ready container when
    /// checking it is still running. `None` disables the probe.
    /// Default: 50 milliseconds
    pub probe_timeout: Option<Duration>,

    /// Deadline for one execution when the caller does not pass one.
    /// Default: 10 seconds
    pub execution_timeout: Duration,

    /// Return cleanly finished slots to the pool instead of retiring them.
    /// Default: false
    pub reuse_slots: bool,

    /// Template for new sandbox containers.
    pub sandbox: SandboxConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            target_ready: 2,
            max_size: 4,
            max_concurrent_boots: 2,
            fill_interval: Duration::from_secs(1),
            cleanup_interval: Duration::from_secs(1),
            max_slot_age: Duration::from_secs(30),
            liveness_threshold: Duration::from_secs(15),
            warmup_timeout: Duration::from_secs(20),
            probe_timeout: Some(Duration::from_millis(50)),
            execution_timeout: Duration::from_secs(10),
            reuse_slots: false,
            sandbox: SandboxConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Create a new config builder.
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_size == 0 {
            return Err(CoreError::Config("max_size must be > 0".into()));
        }
        if self.target_ready > self.max_size {
            return Err(CoreError::Config(format!(
                "target_ready ({}) exceeds max_size ({})",
                self.target_ready, self.max_size
            )));
        }
        if self.max_concurrent_boots == 0 {
            return Err(CoreError::Config("max_concurrent_boots must be > 0".into()));
        }
        if self.fill_interval.is_zero() || self.cleanup_interval.is_zero() {
            return Err(CoreError::Config("worker intervals must be > 0".into()));
        }
        if self.execution_timeout.is_zero() {
            return Err(CoreError::Config("execution_timeout must be > 0".into()));
        }
        if self.max_slot_age < self.execution_timeout {
            return Err(CoreError::Config(
                "max_slot_age must be at least execution_timeout".into(),
            ));
        }
        // An execution is touched once before its read; it must not look
        // idle to cleanup while still inside its deadline.
        if self.liveness_threshold < self.execution_timeout {
            return Err(CoreError::Config(
                "liveness_threshold must be at least execution_timeout".into(),
            ));
        }
        self.sandbox.validate()
    }
}

/// Builder for PoolConfig.
#[derive(Debug, Default)]
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl PoolConfigBuilder {
    /// Set the Ready watermark.
    pub fn target_ready(mut self, n: usize) -> Self {
        self.config.target_ready = n;
        self
    }

    /// Set the maximum pool size.
    pub fn max_size(mut self, n: usize) -> Self {
        self.config.max_size = n;
        self
    }

    pub fn max_concurrent_boots(mut self, n: usize) -> Self {
        self.config.max_concurrent_boots = n;
        self
    }

    pub fn fill_interval(mut self, interval: Duration) -> Self {
        self.config.fill_interval = interval;
        self
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.config.cleanup_interval = interval;
        self
    }

    pub fn max_slot_age(mut self, age: Duration) -> Self {
        self.config.max_slot_age = age;
        self
    }

    pub fn liveness_threshold(mut self, threshold: Duration) -> Self {
        self.config.liveness_threshold = threshold;
        self
    }

    pub fn warmup_timeout(mut self, timeout: Duration) -> Self {
        self.config.warmup_timeout = timeout;
        self
    }

    /// Set the Ready-slot probe timeout (`None` disables probing).
    pub fn probe_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.probe_timeout = timeout;
        self
    }

    pub fn execution_timeout(mut self, timeout: Duration) -> Self {
        self.config.execution_timeout = timeout;
        self
    }

    /// Allow clean slots to be reused by later executions.
    pub fn reuse_slots(mut self, reuse: bool) -> Self {
        self.config.reuse_slots = reuse;
        self
    }

    /// Set the sandbox template.
    pub fn sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.config.sandbox = sandbox;
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<PoolConfig, CoreError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox() -> SandboxConfig {
        SandboxConfig {
            image: "runner:latest".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.target_ready, 2);
        assert_eq!(config.max_size, 4);
        assert_eq!(config.execution_timeout, Duration::from_secs(10));
        assert!(!config.reuse_slots);
        assert_eq!(config.sandbox.cpu_quota, 50_000);
        assert!(config.sandbox.network_disabled);
    }

    #[test]
    fn test_builder_requires_image() {
        let result = PoolConfig::builder().build();
        assert!(matches!(result, Err(CoreError::Config(_))));
    }

    #[test]
    fn test_builder_rejects_watermark_above_max() {
        let result = PoolConfig::builder()
            .target_ready(5)
            .max_size(2)
            .sandbox(sandbox())
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_rejects_short_slot_age() {
        let result = PoolConfig::builder()
            .execution_timeout(Duration::from_secs(10))
            .max_slot_age(Duration::from_secs(5))
            .sandbox(sandbox())
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_rejects_liveness_below_execution_timeout() {
        let result = PoolConfig::builder()
            .execution_timeout(Duration::from_secs(20))
            .max_slot_age(Duration::from_secs(30))
            .liveness_threshold(Duration::from_secs(15))
            .sandbox(sandbox())
            .build();
        assert!(matches!(result, Err(CoreError::Config(_))));

        let result = PoolConfig::builder()
            .execution_timeout(Duration::from_secs(15))
            .liveness_threshold(Duration::from_secs(15))
            .sandbox(sandbox())
            .build();
        assert!(result.is_ok());
    }

    #[test]
    fn test_builder_success() {
        let config = PoolConfig::builder()
            .target_ready(2)
            .max_size(2)
            .reuse_slots(true)
            .probe_timeout(None)
            .sandbox(sandbox())
            .build()
            .expect("should build successfully");

        assert_eq!(config.target_ready, 2);
        assert_eq!(config.max_size, 2);
        assert!(config.reuse_slots);
        assert!(config.probe_timeout.is_none());
    }

    #[test]
    fn test_sandbox_rejects_zero_memory() {
        let config = SandboxConfig {
            memory_bytes: Some(0),
            ..sandbox()
        };
        assert!(config.validate().is_err());
    }
}
