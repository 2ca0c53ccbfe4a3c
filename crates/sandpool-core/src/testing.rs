//! In-memory container runtime for tests.
//!
//! [`FakeRuntime`] hands out duplex pipes instead of real containers. Each
//! attached "container" runs a small guest task that speaks the frame
//! protocol according to a [`GuestBehavior`].

use crate::config::SandboxConfig;
use crate::error::RuntimeError;
use crate::protocol::{CorrelationId, Frame, FrameCodec, FrameKind, SandboxStream, HEADER_SIZE};
use crate::runtime::{ContainerId, ContainerRuntime};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::time::Instant;
use tokio_util::codec::Framed;

/// How the fake in-sandbox runner answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestBehavior {
    /// Reply to every execute with its payload.
    Echo,
    /// Read commands, never reply.
    Silent,
    /// Emit an output frame with an unrelated id before each real reply.
    Stale,
    /// Close the stream on the first execute.
    Close,
    /// Answer with bytes that are not a valid frame.
    Garbage,
}

#[derive(Debug, Default)]
struct FakeContainer {
    started: bool,
    exit_code: Option<i64>,
    stops: usize,
    removes: usize,
}

#[derive(Debug)]
struct FakeState {
    next_id: u64,
    behavior: GuestBehavior,
    failing_creates: usize,
    failing_starts: usize,
    create_delay: Option<Duration>,
    start_delay: Option<Duration>,
    containers: HashMap<ContainerId, FakeContainer>,
}

/// [`ContainerRuntime`] backed by in-process pipes.
#[derive(Debug)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new(behavior: GuestBehavior) -> Self {
        Self {
            state: Mutex::new(FakeState {
                next_id: 0,
                behavior,
                failing_creates: 0,
                failing_starts: 0,
                create_delay: None,
                start_delay: None,
                containers: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Behavior of containers attached from now on.
    pub fn set_behavior(&self, behavior: GuestBehavior) {
        self.lock().behavior = behavior;
    }

    /// Make the next `n` creates fail.
    pub fn fail_next_creates(&self, n: usize) {
        self.lock().failing_creates = n;
    }

    /// Make the next `n` starts report that the container did not start.
    pub fn fail_next_starts(&self, n: usize) {
        self.lock().failing_starts = n;
    }

    /// Delay every create by `delay`.
    pub fn set_create_delay(&self, delay: Option<Duration>) {
        self.lock().create_delay = delay;
    }

    /// Delay every start by `delay`.
    pub fn set_start_delay(&self, delay: Option<Duration>) {
        self.lock().start_delay = delay;
    }

    /// Mark a container as exited, as if its process died.
    pub fn kill(&self, id: &ContainerId, exit_code: i64) {
        if let Some(container) = self.lock().containers.get_mut(id) {
            container.exit_code = Some(exit_code);
        }
    }

    /// Number of containers created so far.
    pub fn created(&self) -> usize {
        self.lock().containers.len()
    }

    /// Containers that were created and not yet removed.
    pub fn running(&self) -> Vec<ContainerId> {
        let mut ids: Vec<ContainerId> = self
            .lock()
            .containers
            .iter()
            .filter(|(_, c)| c.removes == 0)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }

    pub fn stops(&self, id: &ContainerId) -> usize {
        self.lock().containers.get(id).map_or(0, |c| c.stops)
    }

    pub fn removes(&self, id: &ContainerId) -> usize {
        self.lock().containers.get(id).map_or(0, |c| c.removes)
    }

    /// Total remove calls across all containers.
    pub fn total_removes(&self) -> usize {
        self.lock().containers.values().map(|c| c.removes).sum()
    }
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new(GuestBehavior::Echo)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, _config: &SandboxConfig) -> Result<ContainerId, RuntimeError> {
        let delay = self.lock().create_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if state.failing_creates > 0 {
            state.failing_creates -= 1;
            return Err(RuntimeError::Unavailable("injected create failure".into()));
        }
        state.next_id += 1;
        let id = ContainerId::new(format!("fake-{}", state.next_id));
        state.containers.insert(id.clone(), FakeContainer::default());
        Ok(id)
    }

    async fn attach(&self, id: &ContainerId) -> Result<SandboxStream, RuntimeError> {
        let behavior = {
            let state = self.lock();
            if !state.containers.contains_key(id) {
                return Err(RuntimeError::Unavailable(format!("no such container {id}")));
            }
            state.behavior
        };

        let (host, guest) = tokio::io::duplex(64 * 1024);
        tokio::spawn(run_guest(guest, behavior));
        let (read_half, write_half) = tokio::io::split(host);
        Ok(SandboxStream::new(read_half, write_half))
    }

    async fn start(&self, id: &ContainerId) -> Result<bool, RuntimeError> {
        let delay = self.lock().start_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if state.failing_starts > 0 {
            state.failing_starts -= 1;
            return Ok(false);
        }
        match state.containers.get_mut(id) {
            Some(container) => {
                container.started = true;
                Ok(true)
            }
            None => Err(RuntimeError::Unavailable(format!("no such container {id}"))),
        }
    }

    async fn wait(&self, id: &ContainerId, deadline: Instant) -> Result<Option<i64>, RuntimeError> {
        let exit_code = match self.lock().containers.get(id) {
            Some(container) => container.exit_code,
            None => return Err(RuntimeError::Unavailable(format!("no such container {id}"))),
        };
        if exit_code.is_some() {
            return Ok(exit_code);
        }
        tokio::time::sleep_until(deadline).await;
        Ok(self.lock().containers.get(id).and_then(|c| c.exit_code))
    }

    async fn stop(&self, id: &ContainerId, _grace: Duration) -> Result<(), RuntimeError> {
        if let Some(container) = self.lock().containers.get_mut(id) {
            container.stops += 1;
            container.exit_code.get_or_insert(137);
        }
        Ok(())
    }

    async fn remove(&self, id: &ContainerId, _force: bool) -> Result<(), RuntimeError> {
        if let Some(container) = self.lock().containers.get_mut(id) {
            container.removes += 1;
        }
        Ok(())
    }
}

async fn run_guest(stream: DuplexStream, behavior: GuestBehavior) {
    let mut framed = Framed::new(stream, FrameCodec::default());
    while let Some(Ok(frame)) = framed.next().await {
        if frame.kind != FrameKind::Execute {
            // exit ends the session, the runner keeps reading
            continue;
        }
        let sent = match behavior {
            GuestBehavior::Echo => {
                framed
                    .send(Frame::output(frame.correlation_id, frame.payload))
                    .await
            }
            GuestBehavior::Silent => Ok(()),
            GuestBehavior::Stale => {
                let stale = Frame::output(CorrelationId::new(), Bytes::from_static(b"stale"));
                match framed.send(stale).await {
                    Ok(()) => {
                        framed
                            .send(Frame::output(frame.correlation_id, frame.payload))
                            .await
                    }
                    Err(e) => Err(e),
                }
            }
            GuestBehavior::Close => return,
            GuestBehavior::Garbage => {
                let _ = framed.get_mut().write_all(&[0xFF; HEADER_SIZE]).await;
                return;
            }
        };
        if sent.is_err() {
            return;
        }
    }
}

/// Stream with no runner behind it: reads end immediately, writes vanish.
pub fn detached_stream() -> SandboxStream {
    SandboxStream::new(tokio::io::empty(), tokio::io::sink())
}
