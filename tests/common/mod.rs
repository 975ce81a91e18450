#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use shellbox::config::Config;
use shellbox::registry::{MemoryStore, Registry};
use shellbox::runtime::{
    ContainerRef, ContainerRuntime, PtyAttachment, PtyController, ResourceLimits, RuntimeError,
    RuntimeErrorKind, RuntimeState, TermSize,
};
use shellbox::term::PtySessionManager;
use shellbox::workspace::Orchestrator;

/// In-memory engine double. Containers live in a map; `attach_pty` wires up
/// an echo loop standing in for a shell, which exits when it reads "exit\n".
pub struct FakeRuntime {
    containers: parking_lot::Mutex<HashMap<String, RuntimeState>>,
    next_id: AtomicUsize,
    fail_next_create: parking_lot::Mutex<Option<RuntimeError>>,
    attach_count: AtomicUsize,
    instant_exit: AtomicBool,
    recorded_sizes: Arc<parking_lot::Mutex<Vec<TermSize>>>,
    in_flight: AtomicUsize,
    overlapped: AtomicBool,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            containers: parking_lot::Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(1),
            fail_next_create: parking_lot::Mutex::new(None),
            attach_count: AtomicUsize::new(0),
            instant_exit: AtomicBool::new(false),
            recorded_sizes: Arc::new(parking_lot::Mutex::new(Vec::new())),
            in_flight: AtomicUsize::new(0),
            overlapped: AtomicBool::new(false),
        })
    }

    /// Arrange for the next `create` call to fail with the given error.
    pub fn fail_next_create(&self, error: RuntimeError) {
        *self.fail_next_create.lock() = Some(error);
    }

    /// Number of PTY attachments ever made (fan-in dedup checks).
    pub fn attach_count(&self) -> usize {
        self.attach_count.load(Ordering::SeqCst)
    }

    /// Make subsequent shells die the instant they are spawned.
    pub fn exit_shell_instantly(&self, on: bool) {
        self.instant_exit.store(on, Ordering::SeqCst);
    }

    /// Sizes seen by PTY resize calls, in order.
    pub fn recorded_sizes(&self) -> Vec<TermSize> {
        self.recorded_sizes.lock().clone()
    }

    /// Whether two engine operations ever ran concurrently. Only meaningful
    /// for tests that drive a single workspace.
    pub fn saw_overlap(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    pub fn container_state(&self, container: &ContainerRef) -> Option<RuntimeState> {
        self.containers.lock().get(&container.0).copied()
    }

    pub fn container_count(&self) -> usize {
        self.containers.lock().len()
    }

    /// Simulate the container vanishing behind the daemon's back.
    pub fn forget(&self, container: &ContainerRef) {
        self.containers.lock().remove(&container.0);
    }

    /// Hold every engine op open for a moment so overlapping calls are
    /// observable instead of racing through in one poll.
    async fn op(&self) -> OpGuard<'_> {
        if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
        OpGuard { fake: self }
    }
}

struct OpGuard<'a> {
    fake: &'a FakeRuntime,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        self.fake.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

struct FakeController {
    sizes: Arc<parking_lot::Mutex<Vec<TermSize>>>,
    // Dropping the sender hangs up the echo loop, like closing a PTY master.
    _close: watch::Sender<()>,
}

impl PtyController for FakeController {
    fn resize(&self, size: TermSize) -> std::io::Result<()> {
        self.sizes.lock().push(size);
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(
        &self,
        _image: &str,
        _limits: ResourceLimits,
    ) -> Result<ContainerRef, RuntimeError> {
        let _guard = self.op().await;
        if let Some(error) = self.fail_next_create.lock().take() {
            return Err(error);
        }
        let id = format!("fake-{:04}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers.lock().insert(id.clone(), RuntimeState::Created);
        Ok(ContainerRef(id))
    }

    async fn start(&self, container: &ContainerRef) -> Result<(), RuntimeError> {
        let _guard = self.op().await;
        let mut containers = self.containers.lock();
        match containers.get_mut(&container.0) {
            Some(state) => {
                *state = RuntimeState::Running;
                Ok(())
            }
            None => Err(RuntimeError::new(
                RuntimeErrorKind::NotFound,
                format!("no such container: {}", container),
            )),
        }
    }

    async fn stop(&self, container: &ContainerRef, _timeout: Duration) -> Result<(), RuntimeError> {
        let _guard = self.op().await;
        if let Some(state) = self.containers.lock().get_mut(&container.0) {
            *state = RuntimeState::Exited;
        }
        Ok(())
    }

    async fn remove(&self, container: &ContainerRef) -> Result<(), RuntimeError> {
        let _guard = self.op().await;
        self.containers.lock().remove(&container.0);
        Ok(())
    }

    async fn inspect(&self, container: &ContainerRef) -> Result<RuntimeState, RuntimeError> {
        let _guard = self.op().await;
        Ok(self
            .containers
            .lock()
            .get(&container.0)
            .copied()
            .unwrap_or(RuntimeState::Missing))
    }

    async fn attach_pty(
        &self,
        container: &ContainerRef,
        _shell: &[String],
        _size: TermSize,
    ) -> Result<PtyAttachment, RuntimeError> {
        let _guard = self.op().await;
        match self.containers.lock().get(&container.0) {
            Some(RuntimeState::Running) => {}
            Some(_) => {
                return Err(RuntimeError::new(
                    RuntimeErrorKind::NotRunning,
                    format!("container {} is not running", container),
                ));
            }
            None => {
                return Err(RuntimeError::new(
                    RuntimeErrorKind::NotFound,
                    format!("no such container: {}", container),
                ));
            }
        }
        self.attach_count.fetch_add(1, Ordering::SeqCst);

        let (input_tx, mut input_rx) = mpsc::channel::<Bytes>(64);
        let (output_tx, output_rx) = mpsc::channel::<Bytes>(64);
        let (close_tx, mut close_rx) = watch::channel(());

        // Echo loop: everything written comes straight back, "exit\n" ends
        // the shell, dropping the controller hangs it up.
        let instant_exit = self.instant_exit.load(Ordering::SeqCst);
        tokio::spawn(async move {
            if instant_exit {
                // Shell crashed on spawn: drop the output sender right away.
                return;
            }
            loop {
                tokio::select! {
                    changed = close_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    data = input_rx.recv() => match data {
                        Some(data) => {
                            if data.as_ref() == b"exit\n" {
                                break;
                            }
                            if output_tx.send(data).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        let controller = FakeController {
            sizes: self.recorded_sizes.clone(),
            _close: close_tx,
        };

        Ok(PtyAttachment {
            output: output_rx,
            input: input_tx,
            controller: Box::new(controller),
        })
    }
}

/// Everything a test needs, wired together over the in-memory store and the
/// fake engine.
pub struct Harness {
    pub config: Arc<Config>,
    pub registry: Arc<Registry>,
    pub fake: Arc<FakeRuntime>,
    pub sessions: Arc<PtySessionManager>,
    pub orchestrator: Arc<Orchestrator>,
}

pub fn harness() -> Harness {
    harness_with(|_| {})
}

pub fn harness_with(tweak: impl FnOnce(&mut Config)) -> Harness {
    let mut config = Config::default();
    // Keep retries snappy under test.
    config.runtime.retry_base_delay_ms = 1;
    tweak(&mut config);
    let config = Arc::new(config);

    let registry = Arc::new(Registry::new(Box::new(MemoryStore::new())));
    let fake = FakeRuntime::new();
    let runtime: Arc<dyn ContainerRuntime> = fake.clone();
    let sessions = Arc::new(PtySessionManager::new(
        config.clone(),
        registry.clone(),
        runtime.clone(),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        registry.clone(),
        runtime,
        sessions.clone(),
    ));

    Harness { config, registry, fake, sessions, orchestrator }
}
