pub mod docker;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Opaque handle to a provisioned container, as returned by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRef(pub String);

impl std::fmt::Display for ContainerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Engine-reported container state, as seen by `inspect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    /// Provisioned but never started (or stopped after a start).
    Created,
    Running,
    Exited,
    /// The engine has no record of the container.
    Missing,
}

/// Resource limits applied at container creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory_mb: u32,
    pub cpus: u32,
}

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

/// Classification of container engine failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeErrorKind {
    /// The image reference could not be resolved or pulled.
    ImagePull,
    /// Requested resource limits cannot be satisfied.
    Resource,
    /// The engine has no such container.
    NotFound,
    /// Operation requires a running container (caller precondition).
    NotRunning,
    /// Likely to succeed on retry (daemon unreachable, timeout).
    Transient,
    Other,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub message: String,
}

impl RuntimeError {
    pub fn new(kind: RuntimeErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::Other, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind == RuntimeErrorKind::Transient
    }
}

/// Handle to the master side of an attached PTY.
///
/// The boxed controller is the sole owner of the master descriptor: dropping
/// it closes the master, which hangs up the shell inside the container.
pub trait PtyController: Send + Sync {
    fn resize(&self, size: TermSize) -> std::io::Result<()>;
}

/// Streams of a live PTY, bridged to bounded channels.
///
/// `output` yields shell output chunks in production order and closes when
/// the shell exits or the master is dropped. `input` feeds the shell's stdin;
/// the writer side shuts down when every sender is dropped. Both channels are
/// bounded, so a stalled consumer backpressures the PTY rather than buffering
/// output without limit.
pub struct PtyAttachment {
    pub output: mpsc::Receiver<Bytes>,
    pub input: mpsc::Sender<Bytes>,
    pub controller: Box<dyn PtyController>,
}

/// Thin, swappable interface over the host container engine.
///
/// Operations are idempotent where the engine allows it: `stop` on an
/// already-stopped container and `remove` of a missing container are no-op
/// successes, which keeps orchestrator retry logic simple.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create(
        &self,
        image: &str,
        limits: ResourceLimits,
    ) -> Result<ContainerRef, RuntimeError>;

    async fn start(&self, container: &ContainerRef) -> Result<(), RuntimeError>;

    async fn stop(&self, container: &ContainerRef, timeout: Duration) -> Result<(), RuntimeError>;

    async fn remove(&self, container: &ContainerRef) -> Result<(), RuntimeError>;

    async fn inspect(&self, container: &ContainerRef) -> Result<RuntimeState, RuntimeError>;

    /// Spawn `shell` under a pseudo-terminal inside a running container.
    ///
    /// Fails with `NotRunning` against a non-running container; that is a
    /// caller precondition violation and is never retried.
    async fn attach_pty(
        &self,
        container: &ContainerRef,
        shell: &[String],
        size: TermSize,
    ) -> Result<PtyAttachment, RuntimeError>;
}
