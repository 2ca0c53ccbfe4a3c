//! Container runtime client.
//!
//! The pool only needs six primitives from the runtime, captured by
//! [`ContainerRuntime`]. [`DockerRuntime`] implements them against the
//! Docker engine API through `bollard`.

use crate::config::SandboxConfig;
use crate::error::RuntimeError;
use crate::protocol::SandboxStream;
use async_trait::async_trait;
use bollard::container::{AttachContainerResults, LogOutput};
use bollard::models::{ContainerCreateBody, HostConfig, Mount, MountTypeEnum};
use bollard::query_parameters::{
    AttachContainerOptionsBuilder, CreateContainerOptions, RemoveContainerOptionsBuilder,
    StartContainerOptions, StopContainerOptionsBuilder, WaitContainerOptions,
};
use bollard::Docker;
use futures::StreamExt;
use std::fmt;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tokio_util::io::StreamReader;
use uuid::Uuid;

/// Opaque identifier assigned to a container by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Primitives the pool needs from a container runtime.
///
/// Every call except `create` must be safe to retry.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create (but do not start) a sandbox container.
    async fn create(&self, config: &SandboxConfig) -> Result<ContainerId, RuntimeError>;

    /// Attach a duplex stream to the container's stdin/stdout.
    async fn attach(&self, id: &ContainerId) -> Result<SandboxStream, RuntimeError>;

    /// Start the container. Returns `false` if the runtime declined.
    async fn start(&self, id: &ContainerId) -> Result<bool, RuntimeError>;

    /// Wait for the container to exit.
    ///
    /// Returns the exit status, or `None` if it was still running at `deadline`.
    async fn wait(&self, id: &ContainerId, deadline: Instant) -> Result<Option<i64>, RuntimeError>;

    /// Stop the container, killing it after `grace`.
    async fn stop(&self, id: &ContainerId, grace: Duration) -> Result<(), RuntimeError>;

    /// Remove the container.
    async fn remove(&self, id: &ContainerId, force: bool) -> Result<(), RuntimeError>;
}

/// Docker engine implementation of [`ContainerRuntime`].
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using the local defaults (`DOCKER_HOST` or the Unix socket).
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        tracing::info!("Connected to Docker engine");
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }

    fn create_body(config: &SandboxConfig) -> ContainerCreateBody {
        let mounts = config
            .mounts
            .iter()
            .map(|m| Mount {
                source: Some(m.source.to_string_lossy().into_owned()),
                target: Some(m.target.clone()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(m.read_only),
                ..Default::default()
            })
            .collect::<Vec<_>>();

        ContainerCreateBody {
            image: Some(config.image.clone()),
            cmd: (!config.command.is_empty()).then(|| config.command.clone()),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(false),
            open_stdin: Some(true),
            stdin_once: Some(false),
            tty: Some(false),
            network_disabled: Some(config.network_disabled),
            host_config: Some(HostConfig {
                mounts: Some(mounts),
                cpu_quota: Some(config.cpu_quota),
                memory: config.memory_bytes,
                memory_swap: config.memory_bytes,
                auto_remove: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, config: &SandboxConfig) -> Result<ContainerId, RuntimeError> {
        let options = CreateContainerOptions {
            name: Some(format!("sandpool-{}", Uuid::new_v4())),
            ..Default::default()
        };
        let created = self
            .docker
            .create_container(Some(options), Self::create_body(config))
            .await?;
        for warning in &created.warnings {
            tracing::warn!(container_id = %created.id, warning = %warning, "Docker create warning");
        }
        tracing::debug!(container_id = %created.id, image = %config.image, "Container created");
        Ok(ContainerId::new(created.id))
    }

    async fn attach(&self, id: &ContainerId) -> Result<SandboxStream, RuntimeError> {
        let options = AttachContainerOptionsBuilder::default()
            .stream(true)
            .stdin(true)
            .stdout(true)
            .stderr(false)
            .build();
        let AttachContainerResults { output, input } = self
            .docker
            .attach_container(id.as_str(), Some(options))
            .await?;

        // Demultiplexed docker output; only stdout carries protocol frames.
        let stdout = output.filter_map(|item| async move {
            match item {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                    Some(Ok(message))
                }
                Ok(_) => None,
                Err(e) => Some(Err(std::io::Error::other(e))),
            }
        });

        tracing::debug!(container_id = %id, "Attached to container stdio");
        Ok(SandboxStream::from_boxed(
            Box::pin(StreamReader::new(stdout)),
            input,
        ))
    }

    async fn start(&self, id: &ContainerId) -> Result<bool, RuntimeError> {
        self.docker
            .start_container(id.as_str(), None::<StartContainerOptions>)
            .await?;
        tracing::debug!(container_id = %id, "Container started");
        Ok(true)
    }

    async fn wait(&self, id: &ContainerId, deadline: Instant) -> Result<Option<i64>, RuntimeError> {
        let mut stream = self
            .docker
            .wait_container(id.as_str(), None::<WaitContainerOptions>);
        match timeout_at(deadline, stream.next()).await {
            Err(_) => Ok(None),
            Ok(Some(Ok(response))) => Ok(Some(response.status_code)),
            // bollard reports a non-zero exit as an error carrying the code
            Ok(Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. }))) => {
                Ok(Some(code))
            }
            Ok(Some(Err(e))) => Err(e.into()),
            Ok(None) => Err(RuntimeError::Unavailable(format!(
                "wait stream for {id} ended without a status"
            ))),
        }
    }

    async fn stop(&self, id: &ContainerId, grace: Duration) -> Result<(), RuntimeError> {
        let options = StopContainerOptionsBuilder::default()
            .t(grace.as_secs().max(1) as i32)
            .build();
        match self.docker.stop_container(id.as_str(), Some(options)).await {
            Ok(()) => {
                tracing::debug!(container_id = %id, "Container stopped");
                Ok(())
            }
            Err(e) if already_gone(&e) => {
                tracing::debug!(container_id = %id, "Container already stopped");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, id: &ContainerId, force: bool) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptionsBuilder::default().force(force).build();
        match self.docker.remove_container(id.as_str(), Some(options)).await {
            Ok(()) => {
                tracing::debug!(container_id = %id, "Container removed");
                Ok(())
            }
            Err(e) if already_gone(&e) => {
                tracing::debug!(container_id = %id, "Container already removed");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Not modified (304), not found (404) or removal already in progress (409).
///
/// Sandboxes are created with auto-remove, so these are the normal outcome
/// of stopping a container that has already exited.
fn already_gone(error: &bollard::errors::Error) -> bool {
    matches!(
        error,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 304 | 404 | 409,
            ..
        }
    )
}
