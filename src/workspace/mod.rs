use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::registry::{Registry, Workspace, WorkspaceState};
use crate::runtime::{ContainerRuntime, ResourceLimits, RuntimeError};
use crate::term::PtySessionManager;

/// Parameters for creating a new workspace.
#[derive(Debug, Default)]
pub struct CreateParams {
    pub name: Option<String>,
    pub description: Option<String>,
    /// Catalog image name; falls back to the configured default.
    pub image: Option<String>,
}

type RuntimeFuture<T> = Pin<Box<dyn Future<Output = std::result::Result<T, RuntimeError>> + Send>>;

/// Drives the workspace lifecycle state machine.
///
/// Every transition for a given workspace id runs under that id's lock, so
/// concurrent requests against one workspace queue up in arrival order
/// (tokio's mutex is FIFO-fair) while different workspaces proceed fully in
/// parallel. Runtime failures never escape a transition: they are folded into
/// the record's `error` state with `last_error` set, and the caller gets the
/// resulting record back.
pub struct Orchestrator {
    config: Arc<Config>,
    registry: Arc<Registry>,
    runtime: Arc<dyn ContainerRuntime>,
    sessions: Arc<PtySessionManager>,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<Registry>,
        runtime: Arc<dyn ContainerRuntime>,
        sessions: Arc<PtySessionManager>,
    ) -> Self {
        Self {
            config,
            registry,
            runtime,
            sessions,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the per-workspace transition lock.
    async fn lock(&self, id: Uuid) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        lock.lock_owned().await
    }

    /// Run a runtime call with a bounded timeout, retrying transient failures
    /// with exponential backoff up to the configured attempt count. Timeouts
    /// are not retried: the operation may have partially happened.
    async fn call_runtime<T>(
        &self,
        what: &str,
        timeout: Duration,
        mut op: impl FnMut() -> RuntimeFuture<T>,
    ) -> std::result::Result<T, RuntimeError> {
        let mut delay = self.config.runtime.retry_base_delay();
        let attempts = self.config.runtime.retry_attempts;
        for attempt in 1..=attempts {
            match tokio::time::timeout(timeout, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if e.is_transient() && attempt < attempts => {
                    warn!(
                        what,
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "transient runtime failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(RuntimeError::other(format!(
                        "{} timed out after {}s",
                        what,
                        timeout.as_secs()
                    )));
                }
            }
        }
        unreachable!("retry loop always returns");
    }

    /// Fold a failed transition into the `error` state and return the record.
    async fn fail(&self, id: Uuid, error: &RuntimeError) -> Result<Workspace> {
        warn!(workspace_id = %id, error = %error, "transition failed");
        self.registry
            .update(id, |ws| {
                ws.state = WorkspaceState::Error;
                ws.last_error = Some(error.to_string());
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Create a new workspace: persist a `creating` record, provision the
    /// container, and land in `stopped` (or `error` with `last_error`).
    #[instrument(skip(self, params))]
    pub async fn create(&self, params: CreateParams) -> Result<Workspace> {
        let id = Uuid::new_v4();
        let short_id = id.to_string()[..8].to_string();
        let name = params.name.unwrap_or_else(|| format!("ws-{}", short_id));
        let image_name = params
            .image
            .unwrap_or_else(|| self.config.default_image.clone());

        let image = self
            .config
            .image(&image_name)
            .ok_or_else(|| {
                Error::validation(format!("unknown image '{}': not in the catalog", image_name))
            })?
            .clone();

        if name.is_empty() {
            return Err(Error::validation("workspace name must not be empty"));
        }
        if self.registry.count().await as u32 >= self.config.limits.max_workspaces {
            return Err(Error::validation(format!(
                "workspace limit reached: {} maximum",
                self.config.limits.max_workspaces
            )));
        }
        if self.registry.find_by_name(&name).await.is_some() {
            return Err(Error::validation(format!(
                "workspace name '{}' is already in use",
                name
            )));
        }

        let now = Utc::now();
        let record = Workspace {
            id,
            name: name.clone(),
            description: params.description.unwrap_or_default(),
            image: image_name.clone(),
            state: WorkspaceState::Creating,
            container_ref: None,
            created_at: now,
            updated_at: now,
            last_error: None,
        };
        self.registry.insert(record).await?;

        info!(workspace_id = %id, name = %name, image = %image.reference, "creating workspace");

        let _guard = self.lock(id).await;
        self.provision(id, &image.reference, ResourceLimits {
            memory_mb: image.memory_mb,
            cpus: image.cpus,
        })
        .await
    }

    /// The provisioning step shared by create and retry-after-create-failure.
    async fn provision(
        &self,
        id: Uuid,
        image_reference: &str,
        limits: ResourceLimits,
    ) -> Result<Workspace> {
        let runtime = self.runtime.clone();
        let reference = image_reference.to_string();
        let created = self
            .call_runtime("container create", self.config.runtime.create_timeout(), move || {
                let runtime = runtime.clone();
                let reference = reference.clone();
                Box::pin(async move { runtime.create(&reference, limits).await })
            })
            .await;

        match created {
            Ok(container) => {
                info!(workspace_id = %id, container = %container, "workspace provisioned");
                self.registry
                    .update(id, |ws| {
                        ws.state = WorkspaceState::Stopped;
                        ws.container_ref = Some(container);
                        ws.last_error = None;
                    })
                    .await
            }
            Err(e) => self.fail(id, &e).await,
        }
    }

    /// Start a stopped workspace.
    #[instrument(skip(self))]
    pub async fn start(&self, id: Uuid) -> Result<Workspace> {
        let _guard = self.lock(id).await;
        let ws = self.registry.get(id).await?;
        match ws.state {
            WorkspaceState::Stopped => {}
            state => {
                return Err(Error::precondition(format!(
                    "workspace {} cannot start from state '{}'",
                    id, state
                )));
            }
        }
        let container = ws
            .container_ref
            .clone()
            .ok_or_else(|| Error::precondition(format!("workspace {} has no container", id)))?;

        self.registry
            .update(id, |ws| ws.state = WorkspaceState::Starting)
            .await?;

        let runtime = self.runtime.clone();
        let started = self
            .call_runtime("container start", self.config.runtime.start_timeout(), move || {
                let runtime = runtime.clone();
                let container = container.clone();
                Box::pin(async move { runtime.start(&container).await })
            })
            .await;

        match started {
            Ok(()) => {
                info!(workspace_id = %id, "workspace started");
                self.registry
                    .update(id, |ws| {
                        ws.state = WorkspaceState::Running;
                        ws.last_error = None;
                    })
                    .await
            }
            Err(e) => self.fail(id, &e).await,
        }
    }

    /// Stop a running workspace. Tears down the PTY session first, so every
    /// attached bridge sees a session-ended frame before the container halts.
    #[instrument(skip(self))]
    pub async fn stop(&self, id: Uuid) -> Result<Workspace> {
        let _guard = self.lock(id).await;
        let ws = self.registry.get(id).await?;
        match ws.state {
            WorkspaceState::Running => {}
            state => {
                return Err(Error::precondition(format!(
                    "workspace {} cannot stop from state '{}'",
                    id, state
                )));
            }
        }
        let container = ws
            .container_ref
            .clone()
            .ok_or_else(|| Error::precondition(format!("workspace {} has no container", id)))?;

        self.registry
            .update(id, |ws| ws.state = WorkspaceState::Stopping)
            .await?;

        self.sessions.on_workspace_stopped(id).await;

        let stop_timeout = self.config.runtime.stop_timeout();
        let runtime = self.runtime.clone();
        let stopped = self
            .call_runtime("container stop", stop_timeout + Duration::from_secs(5), move || {
                let runtime = runtime.clone();
                let container = container.clone();
                Box::pin(async move { runtime.stop(&container, stop_timeout).await })
            })
            .await;

        match stopped {
            Ok(()) => {
                info!(workspace_id = %id, "workspace stopped");
                self.registry
                    .update(id, |ws| {
                        ws.state = WorkspaceState::Stopped;
                        ws.last_error = None;
                    })
                    .await
            }
            Err(e) => self.fail(id, &e).await,
        }
    }

    /// Delete a workspace: remove the container (if any) and the record.
    /// Returns the final record as it was at the moment of removal.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> Result<Workspace> {
        let _guard = self.lock(id).await;
        let ws = self.registry.get(id).await?;
        match ws.state {
            WorkspaceState::Running | WorkspaceState::Stopped | WorkspaceState::Error => {}
            state => {
                return Err(Error::precondition(format!(
                    "workspace {} cannot be deleted from state '{}'",
                    id, state
                )));
            }
        }

        let record = self
            .registry
            .update(id, |ws| ws.state = WorkspaceState::Deleting)
            .await?;

        self.sessions.on_workspace_stopped(id).await;

        if let Some(container) = record.container_ref.clone() {
            let runtime = self.runtime.clone();
            let removed = self
                .call_runtime("container remove", self.config.runtime.stop_timeout(), move || {
                    let runtime = runtime.clone();
                    let container = container.clone();
                    Box::pin(async move { runtime.remove(&container).await })
                })
                .await;
            if let Err(e) = removed {
                return self.fail(id, &e).await;
            }
        }

        self.registry.remove(id).await?;
        self.locks.lock().await.remove(&id);
        info!(workspace_id = %id, "workspace deleted");
        Ok(record)
    }

    /// Re-attempt the last failed action of a workspace in `error` state:
    /// provisioning if it never got a container, starting otherwise.
    #[instrument(skip(self))]
    pub async fn retry(&self, id: Uuid) -> Result<Workspace> {
        let (image, has_container) = {
            let _guard = self.lock(id).await;
            let ws = self.registry.get(id).await?;
            if ws.state != WorkspaceState::Error {
                return Err(Error::precondition(format!(
                    "workspace {} is not in error state (state: {})",
                    id, ws.state
                )));
            }
            let image = self
                .config
                .image(&ws.image)
                .ok_or_else(|| {
                    Error::validation(format!("image '{}' no longer in catalog", ws.image))
                })?
                .clone();

            if ws.container_ref.is_some() {
                // Re-run the start path; put the record back in `stopped`
                // so the normal transition applies.
                self.registry
                    .update(id, |ws| ws.state = WorkspaceState::Stopped)
                    .await?;
                (image, true)
            } else {
                self.registry
                    .update(id, |ws| ws.state = WorkspaceState::Creating)
                    .await?;
                (image, false)
            }
        };

        if has_container {
            self.start(id).await
        } else {
            let _guard = self.lock(id).await;
            self.provision(id, &image.reference, ResourceLimits {
                memory_mb: image.memory_mb,
                cpus: image.cpus,
            })
            .await
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get(&self, id: Uuid) -> Result<Workspace> {
        self.registry.get(id).await
    }

    pub async fn list(&self) -> Vec<Workspace> {
        self.registry.list().await
    }

    pub async fn find_by_name(&self, name: &str) -> Option<Uuid> {
        self.registry.find_by_name(name).await
    }

    // -----------------------------------------------------------------------
    // Startup reconciliation
    // -----------------------------------------------------------------------

    /// Reconcile persisted records with the engine after a daemon restart.
    ///
    /// PTY sessions do not survive a restart, so `running`/`starting`/
    /// `stopping` records fall back to `stopped` when their container still
    /// exists and `error` when it vanished. Interrupted `creating` records
    /// become `error`; interrupted `deleting` records finish their removal.
    pub async fn reconcile(&self) -> Result<()> {
        for ws in self.registry.list().await {
            let _guard = self.lock(ws.id).await;
            // Re-read under the lock; reconcile races with nothing at
            // startup, but the discipline is cheap to keep.
            let Ok(ws) = self.registry.get(ws.id).await else {
                continue;
            };
            match ws.state {
                WorkspaceState::Running | WorkspaceState::Starting | WorkspaceState::Stopping => {
                    let known = match &ws.container_ref {
                        Some(container) => match self.runtime.inspect(container).await {
                            Ok(crate::runtime::RuntimeState::Missing) => false,
                            Ok(_) => true,
                            Err(e) => {
                                warn!(workspace_id = %ws.id, error = %e, "inspect failed during reconcile");
                                true
                            }
                        },
                        None => false,
                    };
                    if known {
                        // The container may still be running; stop it so the
                        // record and the engine agree.
                        if let Some(container) = &ws.container_ref {
                            if let Err(e) = self
                                .runtime
                                .stop(container, self.config.runtime.stop_timeout())
                                .await
                            {
                                warn!(workspace_id = %ws.id, error = %e, "stop failed during reconcile");
                            }
                        }
                        self.registry
                            .update(ws.id, |ws| ws.state = WorkspaceState::Stopped)
                            .await?;
                        debug!(workspace_id = %ws.id, "reconciled to stopped");
                    } else {
                        self.registry
                            .update(ws.id, |ws| {
                                ws.state = WorkspaceState::Error;
                                ws.container_ref = None;
                                ws.last_error =
                                    Some("container disappeared while daemon was down".into());
                            })
                            .await?;
                        warn!(workspace_id = %ws.id, "container missing, reconciled to error");
                    }
                }
                WorkspaceState::Creating => {
                    self.registry
                        .update(ws.id, |ws| {
                            ws.state = WorkspaceState::Error;
                            ws.last_error = Some("provisioning interrupted by daemon restart".into());
                        })
                        .await?;
                    warn!(workspace_id = %ws.id, "interrupted create, reconciled to error");
                }
                WorkspaceState::Deleting => {
                    if let Some(container) = &ws.container_ref {
                        if let Err(e) = self.runtime.remove(container).await {
                            warn!(workspace_id = %ws.id, error = %e, "remove failed during reconcile");
                        }
                    }
                    self.registry.remove(ws.id).await?;
                    info!(workspace_id = %ws.id, "finished interrupted deletion");
                }
                WorkspaceState::Stopped | WorkspaceState::Error => {}
            }
        }
        Ok(())
    }
}
