//! Explicit registry of loaded branches, owned by the server.

use std::collections::HashMap;
use std::sync::Arc;

use causaltree_core::{load_branch, AtomAuthorizer};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::branch::{self, BranchHandle};
use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::storage::Storage;

pub struct BranchRegistry {
    branches: Mutex<HashMap<String, BranchHandle>>,
    storage: Storage,
    authorizer: Arc<dyn AtomAuthorizer + Send + Sync>,
    config: ServerConfig,
}

impl BranchRegistry {
    pub fn new(
        storage: Storage,
        authorizer: Arc<dyn AtomAuthorizer + Send + Sync>,
        config: ServerConfig,
    ) -> Self {
        Self {
            branches: Mutex::new(HashMap::new()),
            storage,
            authorizer,
            config,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Handle to the running actor for `name`, loading the branch (last commit plus
    /// stage) and starting its actor if needed. A branch that was never committed
    /// starts empty.
    pub async fn open(&self, name: &str) -> Result<BranchHandle> {
        let mut branches = self.branches.lock().await;
        if let Some(handle) = branches.get(name) {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
        }

        let branch = name.to_string();
        let loaded = self
            .storage
            .run(move |objects, stage| load_branch(&*objects, &*stage, &branch))
            .await?;
        info!(
            branch = name,
            atoms = loaded.weave.len(),
            head = ?loaded.branch.as_ref().map(|b| b.hash),
            "branch loaded"
        );

        let (handle, _join) = branch::spawn(
            name,
            loaded,
            self.storage.clone(),
            Arc::clone(&self.authorizer),
            self.config.branch.clone(),
            self.config.persistence.clone(),
        );
        branches.insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    /// Handle to `name` if it is currently loaded.
    pub async fn get(&self, name: &str) -> Option<BranchHandle> {
        let branches = self.branches.lock().await;
        branches.get(name).filter(|h| !h.is_closed()).cloned()
    }

    pub async fn loaded(&self) -> Vec<String> {
        let branches = self.branches.lock().await;
        let mut names: Vec<String> = branches.keys().cloned().collect();
        names.sort();
        names
    }

    /// Flush and stop `name`. Returns false if it was not loaded. The registry stays
    /// locked until the flush is done, so `open` never reloads a half-written stage.
    pub async fn evict(&self, name: &str) -> Result<bool> {
        let mut branches = self.branches.lock().await;
        let Some(handle) = branches.get(name) else {
            return Ok(false);
        };
        match handle.shutdown().await {
            Ok(()) | Err(ServerError::BranchClosed(_)) => {}
            Err(e) => return Err(e),
        }
        branches.remove(name);
        info!(branch = name, "branch evicted");
        Ok(true)
    }

    /// Evict every branch that has had no watchers for at least `idle_timeout`. Each
    /// actor decides for itself, so a watch that races the sweep keeps its branch.
    pub async fn evict_idle(&self) -> Result<Vec<String>> {
        let idle = self.config.branch.idle_timeout();
        let mut branches = self.branches.lock().await;

        let mut evicted = Vec::new();
        for (name, handle) in branches.iter() {
            let stopped = match handle.shutdown_if_idle(idle).await {
                Ok(stopped) => stopped,
                Err(ServerError::BranchClosed(_)) => true,
                Err(e) => return Err(e),
            };
            if stopped {
                evicted.push(name.clone());
            }
        }
        for name in &evicted {
            branches.remove(name);
            info!(branch = %name, "idle branch evicted");
        }
        Ok(evicted)
    }

    /// Stop every loaded branch.
    pub async fn shutdown(&self) {
        let mut branches = self.branches.lock().await;
        for (name, handle) in branches.drain() {
            if let Err(e) = handle.shutdown().await {
                warn!(branch = %name, error = %e, "branch did not shut down cleanly");
            }
        }
    }
}
