use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::registry::{Registry, WorkspaceState};
use crate::runtime::{ContainerRuntime, PtyController, TermSize};

/// Why a terminal session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The shell process inside the container exited on its own.
    ShellExited,
    /// The workspace was stopped or deleted while the session was live.
    WorkspaceStopped,
    /// The session sat with zero subscribers past the grace period.
    Idle,
}

impl EndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ShellExited => "shell_exited",
            Self::WorkspaceStopped => "workspace_stopped",
            Self::Idle => "idle_timeout",
        }
    }
}

/// Event stream delivered to each attached terminal bridge.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Raw shell output, unmodified and in production order.
    Output(Bytes),
    /// Terminal frame: the session is gone, no further output will arrive.
    Ended(EndReason),
}

/// One bridge's attachment to a PTY session.
pub struct TerminalSubscription {
    pub token: u64,
    pub workspace_id: Uuid,
    pub events: mpsc::Receiver<SessionEvent>,
    /// Shared shell stdin. Multiple subscribers write to the same shell
    /// (last-writer-wins); this is a shared terminal, not per-viewer isolation.
    pub input: mpsc::Sender<Bytes>,
}

/// A live pseudo-terminal bound to exactly one running workspace.
struct PtySession {
    workspace_id: Uuid,
    input: mpsc::Sender<Bytes>,
    /// Master-side owner. Taking it out (on teardown) closes the master and
    /// hangs up the shell. Bridges never touch the descriptor directly.
    controller: parking_lot::Mutex<Option<Box<dyn PtyController>>>,
    size: parking_lot::Mutex<TermSize>,
    subscribers: Mutex<HashMap<u64, mpsc::Sender<SessionEvent>>>,
    ended: AtomicBool,
    end_reason: parking_lot::Mutex<Option<EndReason>>,
}

impl PtySession {
    /// End the session exactly once: notify every subscriber, then drop the
    /// master so the shell side tears down.
    ///
    /// Must never await on a subscriber channel: the orchestrator calls this
    /// under the per-workspace transition lock, and a stalled bridge with a
    /// full channel would otherwise wedge every queued operation on the
    /// workspace. A subscriber whose channel is full misses the ended frame
    /// and learns of the teardown when its channel closes.
    async fn finish(&self, reason: EndReason) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.end_reason.lock() = Some(reason);
        info!(
            workspace_id = %self.workspace_id,
            reason = reason.as_str(),
            "terminal session ended"
        );
        let mut subs = self.subscribers.lock().await;
        for (_, tx) in subs.drain() {
            let _ = tx.try_send(SessionEvent::Ended(reason));
        }
        drop(subs);
        *self.controller.lock() = None;
    }
}

type Slot = Arc<Mutex<Option<Arc<PtySession>>>>;

/// Owns every PTY session and its file descriptors. Terminal bridges interact
/// with sessions only through this manager's subscribe/input/resize surface,
/// so concurrent detaches can never double-close a descriptor.
pub struct PtySessionManager {
    config: Arc<Config>,
    registry: Arc<Registry>,
    runtime: Arc<dyn ContainerRuntime>,
    /// Per-workspace creation slots. The inner mutex serializes session
    /// creation per id so racing acquires attach to one shell.
    slots: Mutex<HashMap<Uuid, Slot>>,
    next_token: AtomicU64,
}

impl PtySessionManager {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<Registry>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            config,
            registry,
            runtime,
            slots: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    async fn slot(&self, workspace_id: Uuid) -> Slot {
        let mut slots = self.slots.lock().await;
        slots
            .entry(workspace_id)
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    async fn existing_slot(&self, workspace_id: Uuid) -> Option<Slot> {
        self.slots.lock().await.get(&workspace_id).cloned()
    }

    /// Attach to the workspace's PTY session, creating it if absent.
    ///
    /// Fails with a precondition error unless the workspace is `running`.
    /// Safe to call concurrently; racing callers share one shell.
    #[instrument(skip(self))]
    pub async fn acquire(&self, workspace_id: Uuid) -> Result<TerminalSubscription> {
        let slot = self.slot(workspace_id).await;
        let mut guard = slot.lock().await;

        if let Some(session) = guard.as_ref() {
            if !session.ended.load(Ordering::SeqCst) {
                let session = session.clone();
                drop(guard);
                return Ok(self.subscribe(&session).await);
            }
            *guard = None;
        }

        let ws = self.registry.get(workspace_id).await?;
        if ws.state != WorkspaceState::Running {
            return Err(Error::precondition(format!(
                "workspace {} is not running (state: {})",
                workspace_id, ws.state
            )));
        }
        let container = ws.container_ref.clone().ok_or_else(|| {
            Error::precondition(format!("workspace {} has no container", workspace_id))
        })?;
        let image = self
            .config
            .image(&ws.image)
            .ok_or_else(|| Error::validation(format!("image '{}' not in catalog", ws.image)))?;

        let size = TermSize {
            cols: self.config.terminal.default_cols,
            rows: self.config.terminal.default_rows,
        };
        let attachment = self
            .runtime
            .attach_pty(&container, &image.shell, size)
            .await?;

        info!(
            workspace_id = %workspace_id,
            container = %container,
            shell = ?image.shell,
            "PTY session created"
        );

        let session = Arc::new(PtySession {
            workspace_id,
            input: attachment.input,
            controller: parking_lot::Mutex::new(Some(attachment.controller)),
            size: parking_lot::Mutex::new(size),
            subscribers: Mutex::new(HashMap::new()),
            ended: AtomicBool::new(false),
            end_reason: parking_lot::Mutex::new(None),
        });

        // Subscribe before the pump exists: a shell that dies instantly then
        // finds this subscriber in the map and delivers its ended frame.
        let subscription = self.subscribe(&session).await;
        tokio::spawn(pump_output(session.clone(), attachment.output, slot.clone()));

        *guard = Some(session);
        Ok(subscription)
    }

    async fn subscribe(&self, session: &Arc<PtySession>) -> TerminalSubscription {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.config.terminal.subscriber_buffer);
        session.subscribers.lock().await.insert(token, tx.clone());
        // The session can finish between the caller's liveness check and the
        // insert above; hand this subscriber its ended frame directly so it
        // is not left attached to a dead session.
        if session.ended.load(Ordering::SeqCst) {
            session.subscribers.lock().await.remove(&token);
            let reason = (*session.end_reason.lock()).unwrap_or(EndReason::ShellExited);
            let _ = tx.try_send(SessionEvent::Ended(reason));
        }
        debug!(
            workspace_id = %session.workspace_id,
            token,
            "terminal bridge attached"
        );
        TerminalSubscription {
            token,
            workspace_id: session.workspace_id,
            events: rx,
            input: session.input.clone(),
        }
    }

    /// Detach one bridge. When the last subscriber leaves, the session is
    /// torn down after the configured idle grace period unless someone
    /// re-attaches first.
    #[instrument(skip(self))]
    pub async fn release(&self, workspace_id: Uuid, token: u64) {
        let Some(slot) = self.existing_slot(workspace_id).await else {
            return;
        };
        let guard = slot.lock().await;
        let Some(session) = guard.as_ref().cloned() else {
            return;
        };
        drop(guard);

        let remaining = {
            let mut subs = session.subscribers.lock().await;
            subs.remove(&token);
            subs.len()
        };
        debug!(workspace_id = %workspace_id, token, remaining, "terminal bridge detached");

        if remaining == 0 {
            let grace = self.config.terminal.idle_grace();
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                let mut guard = slot.lock().await;
                let still_current = guard
                    .as_ref()
                    .is_some_and(|current| Arc::ptr_eq(current, &session));
                if !still_current {
                    return;
                }
                if session.subscribers.lock().await.is_empty() {
                    *guard = None;
                    drop(guard);
                    session.finish(EndReason::Idle).await;
                }
            });
        }
    }

    /// Resize the workspace's PTY. Control-only: never forwarded as bytes.
    pub async fn resize(&self, workspace_id: Uuid, cols: u16, rows: u16) -> Result<()> {
        let session = self
            .current_session(workspace_id)
            .await
            .ok_or_else(|| Error::precondition("no active terminal session"))?;

        let size = TermSize { cols, rows };
        {
            let controller = session.controller.lock();
            let Some(controller) = controller.as_ref() else {
                return Err(Error::precondition("terminal session already ended"));
            };
            controller
                .resize(size)
                .map_err(|e| Error::Runtime(crate::runtime::RuntimeError::other(format!(
                    "resizing PTY: {}",
                    e
                ))))?;
        }
        *session.size.lock() = size;
        debug!(workspace_id = %workspace_id, cols, rows, "PTY resized");
        Ok(())
    }

    /// Forced teardown hook, invoked by the orchestrator while it holds the
    /// workspace lock during stop/delete. Subscribers receive a
    /// `workspace_stopped` ended frame.
    #[instrument(skip(self))]
    pub async fn on_workspace_stopped(&self, workspace_id: Uuid) {
        let Some(slot) = self.existing_slot(workspace_id).await else {
            return;
        };
        let session = slot.lock().await.take();
        if let Some(session) = session {
            session.finish(EndReason::WorkspaceStopped).await;
        }
    }

    /// Number of bridges currently attached to the workspace's session.
    pub async fn subscriber_count(&self, workspace_id: Uuid) -> usize {
        match self.current_session(workspace_id).await {
            Some(session) => session.subscribers.lock().await.len(),
            None => 0,
        }
    }

    /// Current PTY size, if a session is live. Mostly for status endpoints.
    pub async fn size(&self, workspace_id: Uuid) -> Option<TermSize> {
        self.current_session(workspace_id)
            .await
            .map(|session| *session.size.lock())
    }

    /// Tear down every live session. Used during daemon shutdown.
    pub async fn shutdown_all(&self) {
        let slots: Vec<Slot> = self.slots.lock().await.values().cloned().collect();
        for slot in slots {
            let session = slot.lock().await.take();
            if let Some(session) = session {
                session.finish(EndReason::WorkspaceStopped).await;
            }
        }
    }

    async fn current_session(&self, workspace_id: Uuid) -> Option<Arc<PtySession>> {
        let slot = self.existing_slot(workspace_id).await?;
        let guard = slot.lock().await;
        guard
            .as_ref()
            .filter(|s| !s.ended.load(Ordering::SeqCst))
            .cloned()
    }
}

/// Per-session output pump: fan shell output out to every subscriber in
/// order. Sends await on each subscriber's bounded channel, so one slow
/// client backpressures the whole chain down to the PTY reader instead of
/// growing a buffer.
async fn pump_output(
    session: Arc<PtySession>,
    mut output: mpsc::Receiver<Bytes>,
    slot: Slot,
) {
    while let Some(chunk) = output.recv().await {
        if session.ended.load(Ordering::SeqCst) {
            break;
        }
        // Snapshot the senders so the awaited sends happen outside the
        // subscriber lock. A stalled bridge with a full channel parks this
        // pump (that is the backpressure), but subscribe, release, and
        // forced teardown stay unblocked.
        let targets: Vec<(u64, mpsc::Sender<SessionEvent>)> = {
            let subs = session.subscribers.lock().await;
            subs.iter().map(|(token, tx)| (*token, tx.clone())).collect()
        };
        let mut dead = Vec::new();
        for (token, tx) in targets {
            if tx.send(SessionEvent::Output(chunk.clone())).await.is_err() {
                dead.push(token);
            }
        }
        if !dead.is_empty() {
            let mut subs = session.subscribers.lock().await;
            for token in dead {
                subs.remove(&token);
            }
        }
    }

    // Output channel closed: the shell exited, or teardown dropped the master.
    session.finish(EndReason::ShellExited).await;

    // Clear the slot unless teardown already replaced or removed the session.
    let mut guard = slot.lock().await;
    if let Some(current) = guard.as_ref() {
        if Arc::ptr_eq(current, &session) {
            *guard = None;
        }
    }
}
