use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::runtime::ContainerRef;

/// Workspace lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceState {
    Creating,
    Stopped,
    Starting,
    Running,
    Stopping,
    Deleting,
    Error,
}

impl std::fmt::Display for WorkspaceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Deleting => write!(f, "deleting"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Durable record of one provisioned workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    /// Catalog name of the image this workspace was provisioned from.
    /// Immutable after creation.
    pub image: String,
    pub state: WorkspaceState,
    /// Engine handle; `None` until provisioning succeeds, `None` again once
    /// removal completes.
    pub container_ref: Option<ContainerRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Populated while `state == error`; cleared on the next successful
    /// transition out of `error`.
    pub last_error: Option<String>,
}

impl Workspace {
    /// Short ID (first 8 chars of the UUID) used in logs and thread names.
    pub fn short_id(&self) -> String {
        self.id.to_string()[..8].to_string()
    }
}

/// Pluggable key-value durability for workspace records.
///
/// Implementations must provide read-your-writes consistency: a `get` after
/// a successful `put` observes the written record.
pub trait WorkspaceStore: Send + Sync {
    fn get(&self, id: Uuid) -> Result<Option<Workspace>>;
    fn put(&self, record: &Workspace) -> Result<()>;
    fn delete(&self, id: Uuid) -> Result<()>;
    fn list_all(&self) -> Result<Vec<Workspace>>;
}

/// On-disk layout of the JSON state file.
#[derive(Debug, Serialize, Deserialize, Default)]
struct PersistedState {
    /// Schema version for forward-compatible state file migrations.
    #[serde(default)]
    schema_version: u32,
    workspaces: HashMap<Uuid, Workspace>,
}

const SCHEMA_VERSION: u32 = 1;

/// JSON file store. Every mutation rewrites the whole file via a temp file
/// and rename, so a crash mid-write never corrupts existing state.
pub struct JsonFileStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles on the file.
    lock: parking_lot::Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), lock: parking_lot::Mutex::new(()) }
    }

    fn read_state(&self) -> Result<PersistedState> {
        if !self.path.exists() {
            return Ok(PersistedState::default());
        }
        let data = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading state file: {}", self.path.display()))
            .map_err(Error::Store)?;
        let state: PersistedState = serde_json::from_str(&data)
            .with_context(|| format!("parsing state file: {}", self.path.display()))
            .map_err(Error::Store)?;
        if state.schema_version > SCHEMA_VERSION {
            tracing::warn!(
                version = state.schema_version,
                "state file has newer schema version than supported ({}), some fields may be lost",
                SCHEMA_VERSION
            );
        }
        Ok(state)
    }

    fn write_state(&self, mut state: PersistedState) -> Result<()> {
        state.schema_version = SCHEMA_VERSION;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let data = serde_json::to_string_pretty(&state)
            .context("serializing state")
            .map_err(Error::Store)?;

        // Write to temp file then rename (atomic on the same filesystem).
        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, &data)
            .with_context(|| format!("writing temp state file: {}", tmp_path.display()))
            .map_err(Error::Store)?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("renaming temp state file to: {}", self.path.display()))
            .map_err(Error::Store)?;

        // Restrict permissions to owner-only.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.path, perms).ok();
        }

        Ok(())
    }
}

impl WorkspaceStore for JsonFileStore {
    fn get(&self, id: Uuid) -> Result<Option<Workspace>> {
        let _guard = self.lock.lock();
        Ok(self.read_state()?.workspaces.remove(&id))
    }

    fn put(&self, record: &Workspace) -> Result<()> {
        let _guard = self.lock.lock();
        let mut state = self.read_state()?;
        state.workspaces.insert(record.id, record.clone());
        self.write_state(state)
    }

    fn delete(&self, id: Uuid) -> Result<()> {
        let _guard = self.lock.lock();
        let mut state = self.read_state()?;
        state.workspaces.remove(&id);
        self.write_state(state)
    }

    fn list_all(&self) -> Result<Vec<Workspace>> {
        let _guard = self.lock.lock();
        Ok(self.read_state()?.workspaces.into_values().collect())
    }
}

/// In-memory store, used in tests and by ephemeral daemons.
#[derive(Default)]
pub struct MemoryStore {
    records: parking_lot::Mutex<HashMap<Uuid, Workspace>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkspaceStore for MemoryStore {
    fn get(&self, id: Uuid) -> Result<Option<Workspace>> {
        Ok(self.records.lock().get(&id).cloned())
    }

    fn put(&self, record: &Workspace) -> Result<()> {
        self.records.lock().insert(record.id, record.clone());
        Ok(())
    }

    fn delete(&self, id: Uuid) -> Result<()> {
        self.records.lock().remove(&id);
        Ok(())
    }

    fn list_all(&self) -> Result<Vec<Workspace>> {
        Ok(self.records.lock().values().cloned().collect())
    }
}

/// Single source of truth for workspace status queries: a write-through cache
/// over the durable store.
pub struct Registry {
    store: Box<dyn WorkspaceStore>,
    cache: RwLock<HashMap<Uuid, Workspace>>,
}

impl Registry {
    pub fn new(store: Box<dyn WorkspaceStore>) -> Self {
        Self { store, cache: RwLock::new(HashMap::new()) }
    }

    /// Populate the cache from the store. Call once at startup.
    pub async fn load(&self) -> Result<usize> {
        let records = self.store.list_all()?;
        let count = records.len();
        let mut cache = self.cache.write().await;
        *cache = records.into_iter().map(|ws| (ws.id, ws)).collect();
        info!(count, "loaded persisted workspace records");
        Ok(count)
    }

    pub async fn get(&self, id: Uuid) -> Result<Workspace> {
        self.cache
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(Error::NotFound(id))
    }

    /// All records, ordered by creation time.
    pub async fn list(&self) -> Vec<Workspace> {
        let mut records: Vec<Workspace> = self.cache.read().await.values().cloned().collect();
        records.sort_by_key(|ws| ws.created_at);
        records
    }

    pub async fn find_by_name(&self, name: &str) -> Option<Uuid> {
        self.cache
            .read()
            .await
            .values()
            .find(|ws| ws.name == name)
            .map(|ws| ws.id)
    }

    pub async fn count(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Insert a new record, persisting before it becomes visible in the cache.
    pub async fn insert(&self, record: Workspace) -> Result<()> {
        self.store.put(&record)?;
        self.cache.write().await.insert(record.id, record);
        Ok(())
    }

    /// Apply a mutation to a record, bump `updated_at`, persist, and return
    /// the updated record.
    pub async fn update(
        &self,
        id: Uuid,
        mutate: impl FnOnce(&mut Workspace),
    ) -> Result<Workspace> {
        let mut cache = self.cache.write().await;
        let record = cache.get_mut(&id).ok_or(Error::NotFound(id))?;
        mutate(record);
        record.updated_at = Utc::now();
        let updated = record.clone();
        self.store.put(&updated)?;
        Ok(updated)
    }

    /// Remove a record entirely (the terminal step of deletion).
    pub async fn remove(&self, id: Uuid) -> Result<()> {
        self.store.delete(id)?;
        self.cache.write().await.remove(&id);
        Ok(())
    }
}
