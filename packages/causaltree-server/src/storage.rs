//! Shared handles to the object and stage stores.

use std::sync::{Arc, Mutex};

use causaltree_core::{
    error::Error, AppOp, MemoryObjectStore, MemoryStageStore, ObjectStore, StageStore,
};
use causaltree_sqlite::SqliteStore;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{Result, ServerError};

type Objects = dyn ObjectStore<AppOp> + Send;
type Stage = dyn StageStore<AppOp> + Send;

/// Object store and stage store behind blocking mutexes. Only touched from the
/// blocking pool.
#[derive(Clone)]
pub struct Storage {
    objects: Arc<Mutex<Objects>>,
    stage: Arc<Mutex<Stage>>,
}

impl Storage {
    pub fn new(
        objects: impl ObjectStore<AppOp> + Send + 'static,
        stage: impl StageStore<AppOp> + Send + 'static,
    ) -> Self {
        Self {
            objects: Arc::new(Mutex::new(objects)),
            stage: Arc::new(Mutex::new(stage)),
        }
    }

    pub fn memory() -> Self {
        Self::new(MemoryObjectStore::new(), MemoryStageStore::new())
    }

    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        match config.backend {
            StorageBackend::Memory => Ok(Self::memory()),
            StorageBackend::Sqlite => {
                let path = config.path.as_deref().ok_or_else(|| {
                    ServerError::Core(Error::Storage(
                        "storage.path is required for the sqlite backend".into(),
                    ))
                })?;
                let objects: SqliteStore<AppOp> = SqliteStore::open(path)?;
                let stage: SqliteStore<AppOp> = SqliteStore::open(path)?;
                Ok(Self::new(objects, stage))
            }
        }
    }

    /// Run `f` with both stores locked (objects first, then stage).
    pub fn with<T>(
        &self,
        f: impl FnOnce(&mut Objects, &mut Stage) -> causaltree_core::Result<T>,
    ) -> causaltree_core::Result<T> {
        let mut objects = self
            .objects
            .lock()
            .map_err(|_| Error::Storage("object store lock poisoned".into()))?;
        let mut stage = self
            .stage
            .lock()
            .map_err(|_| Error::Storage("stage store lock poisoned".into()))?;
        f(&mut *objects, &mut *stage)
    }

    /// Run `f` on the blocking pool.
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Objects, &mut Stage) -> causaltree_core::Result<T> + Send + 'static,
    {
        let storage = self.clone();
        let joined = tokio::task::spawn_blocking(move || storage.with(f)).await;
        match joined {
            Ok(result) => result.map_err(ServerError::from),
            Err(e) => Err(ServerError::Task(e.to_string())),
        }
    }
}
