//! Durable storage seams for declared state and instances.
//!
//! The orchestrator persists through these traits only; the sled-backed
//! implementation stores JSON values and flushes before acknowledging so a
//! single writer reads its own writes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

use fleet_model::{Group, Instance, InstanceId, PathId, RunSpec};

/// Repository failures. These are fatal to the operation that hit them; the
/// leadership layer is expected to step down on persistent storage errors.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Underlying storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for repository operations.
pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Storage for instance records.
#[async_trait]
pub trait InstanceRepository: Send + Sync {
    /// Fetch one instance.
    async fn get(&self, id: &InstanceId) -> Result<Option<Instance>>;
    /// Store one instance.
    async fn put(&self, instance: &Instance) -> Result<()>;
    /// Delete one instance.
    async fn delete(&self, id: &InstanceId) -> Result<()>;
    /// All stored instances.
    async fn all(&self) -> Result<Vec<Instance>>;
}

/// Storage for the declared group tree and run-spec version history.
#[async_trait]
pub trait GroupRepository: Send + Sync {
    /// The current root group; an empty root when nothing is stored.
    async fn root(&self) -> Result<Group>;
    /// Replace the root group.
    async fn store_root(&self, root: &Group) -> Result<()>;
    /// Fetch one run spec.
    async fn get(&self, id: &PathId) -> Result<Option<RunSpec>>;
    /// Store one run spec and append it to the version history.
    async fn put(&self, spec: &RunSpec) -> Result<()>;
    /// Delete one run spec (history is retained).
    async fn delete(&self, id: &PathId) -> Result<()>;
    /// Stored version timestamps for a spec, ascending.
    async fn versions(&self, id: &PathId) -> Result<Vec<DateTime<Utc>>>;
}

/// Sled-backed repository for instances, specs and the root group.
pub struct SledRepository {
    db: sled::Db,
    instances: sled::Tree,
    specs: sled::Tree,
    versions: sled::Tree,
    roots: sled::Tree,
}

impl SledRepository {
    /// Open (or create) a repository at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        info!("opening repository at {:?}", path);
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// An in-memory repository, for tests.
    pub fn in_memory() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let instances = db.open_tree("instances")?;
        let specs = db.open_tree("specs")?;
        let versions = db.open_tree("versions")?;
        let roots = db.open_tree("roots")?;
        Ok(SledRepository { db, instances, specs, versions, roots })
    }
}

#[async_trait]
impl InstanceRepository for SledRepository {
    async fn get(&self, id: &InstanceId) -> Result<Option<Instance>> {
        match self.instances.get(id.to_string().as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, instance: &Instance) -> Result<()> {
        debug!(instance = %instance.id, "storing instance");
        let value = serde_json::to_vec(instance)?;
        self.instances.insert(instance.id.to_string().as_bytes(), value)?;
        self.instances.flush_async().await?;
        Ok(())
    }

    async fn delete(&self, id: &InstanceId) -> Result<()> {
        debug!(instance = %id, "deleting instance");
        self.instances.remove(id.to_string().as_bytes())?;
        self.instances.flush_async().await?;
        Ok(())
    }

    async fn all(&self) -> Result<Vec<Instance>> {
        let mut out = Vec::new();
        for entry in self.instances.iter() {
            let (_, value) = entry?;
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }
}

#[async_trait]
impl GroupRepository for SledRepository {
    async fn root(&self) -> Result<Group> {
        match self.roots.get(b"root")? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Group::empty_root(Utc::now())),
        }
    }

    async fn store_root(&self, root: &Group) -> Result<()> {
        let value = serde_json::to_vec(root)?;
        self.roots.insert(b"root", value)?;
        self.roots.flush_async().await?;
        Ok(())
    }

    async fn get(&self, id: &PathId) -> Result<Option<RunSpec>> {
        match self.specs.get(id.to_string().as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, spec: &RunSpec) -> Result<()> {
        let value = serde_json::to_vec(spec)?;
        self.specs.insert(spec.id().to_string().as_bytes(), value.clone())?;
        let version_key = format!("{}@{}", spec.id(), spec.version().to_rfc3339());
        self.versions.insert(version_key.as_bytes(), value)?;
        self.specs.flush_async().await?;
        self.versions.flush_async().await?;
        Ok(())
    }

    async fn delete(&self, id: &PathId) -> Result<()> {
        self.specs.remove(id.to_string().as_bytes())?;
        self.specs.flush_async().await?;
        Ok(())
    }

    async fn versions(&self, id: &PathId) -> Result<Vec<DateTime<Utc>>> {
        let prefix = format!("{id}@");
        let mut out = Vec::new();
        for entry in self.versions.scan_prefix(prefix.as_bytes()) {
            let (key, _) = entry?;
            let key = String::from_utf8_lossy(&key);
            if let Some((_, ts)) = key.split_once('@') {
                if let Ok(parsed) = DateTime::parse_from_rfc3339(ts) {
                    out.push(parsed.with_timezone(&Utc));
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

impl Drop for SledRepository {
    fn drop(&mut self) {
        if let Err(e) = self.db.flush() {
            tracing::error!("failed to flush repository on drop: {e}");
        }
    }
}

/// Purely in-memory repository, for tests and embedded use.
#[derive(Default)]
pub struct MemoryRepository {
    instances: futures::lock::Mutex<HashMap<String, Instance>>,
    specs: futures::lock::Mutex<HashMap<String, RunSpec>>,
    versions: futures::lock::Mutex<HashMap<String, Vec<DateTime<Utc>>>>,
    root: futures::lock::Mutex<Option<Group>>,
}

impl MemoryRepository {
    /// An empty repository.
    pub fn new() -> Self {
        MemoryRepository::default()
    }
}

#[async_trait]
impl InstanceRepository for MemoryRepository {
    async fn get(&self, id: &InstanceId) -> Result<Option<Instance>> {
        Ok(self.instances.lock().await.get(&id.to_string()).cloned())
    }

    async fn put(&self, instance: &Instance) -> Result<()> {
        self.instances.lock().await.insert(instance.id.to_string(), instance.clone());
        Ok(())
    }

    async fn delete(&self, id: &InstanceId) -> Result<()> {
        self.instances.lock().await.remove(&id.to_string());
        Ok(())
    }

    async fn all(&self) -> Result<Vec<Instance>> {
        Ok(self.instances.lock().await.values().cloned().collect())
    }
}

#[async_trait]
impl GroupRepository for MemoryRepository {
    async fn root(&self) -> Result<Group> {
        Ok(self.root.lock().await.clone().unwrap_or_else(|| Group::empty_root(Utc::now())))
    }

    async fn store_root(&self, root: &Group) -> Result<()> {
        *self.root.lock().await = Some(root.clone());
        Ok(())
    }

    async fn get(&self, id: &PathId) -> Result<Option<RunSpec>> {
        Ok(self.specs.lock().await.get(&id.to_string()).cloned())
    }

    async fn put(&self, spec: &RunSpec) -> Result<()> {
        self.specs.lock().await.insert(spec.id().to_string(), spec.clone());
        self.versions
            .lock()
            .await
            .entry(spec.id().to_string())
            .or_default()
            .push(spec.version());
        Ok(())
    }

    async fn delete(&self, id: &PathId) -> Result<()> {
        self.specs.lock().await.remove(&id.to_string());
        Ok(())
    }

    async fn versions(&self, id: &PathId) -> Result<Vec<DateTime<Utc>>> {
        let mut out = self
            .versions
            .lock()
            .await
            .get(&id.to_string())
            .cloned()
            .unwrap_or_default();
        out.sort();
        Ok(out)
    }
}
