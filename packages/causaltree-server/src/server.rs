use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use causaltree_core::{AllowAllAccess, AtomAuthorizer};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::error::Result;
use crate::protocol::ServerMessage;
use crate::registry::BranchRegistry;
use crate::session::Session;
use crate::storage::Storage;

/// Entry point for transports: owns the branch registry and hands out sessions.
pub struct CausalRepoServer {
    registry: Arc<BranchRegistry>,
    next_session: AtomicU64,
}

impl CausalRepoServer {
    pub fn new(config: ServerConfig, storage: Storage) -> Self {
        Self::with_authorizer(config, storage, Arc::new(AllowAllAccess))
    }

    pub fn with_authorizer(
        config: ServerConfig,
        storage: Storage,
        authorizer: Arc<dyn AtomAuthorizer + Send + Sync>,
    ) -> Self {
        Self {
            registry: Arc::new(BranchRegistry::new(storage, authorizer, config)),
            next_session: AtomicU64::new(1),
        }
    }

    /// Build storage from `config.storage`.
    pub fn from_config(config: ServerConfig) -> Result<Self> {
        let storage = Storage::from_config(&config.storage)?;
        Ok(Self::new(config, storage))
    }

    pub fn registry(&self) -> &Arc<BranchRegistry> {
        &self.registry
    }

    /// New session for `device` plus the queue the transport should drain.
    pub fn connect(&self, device: impl Into<String>) -> (Session, mpsc::Receiver<ServerMessage>) {
        let capacity = self.registry.config().listen.session_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        (Session::new(id, device, Arc::clone(&self.registry), tx), rx)
    }

    /// Periodically evict idle branches.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let period = registry.config().branch.idle_timeout().max(registry.config().branch.tick_interval());
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                match registry.evict_idle().await {
                    Ok(evicted) if !evicted.is_empty() => {
                        info!(count = evicted.len(), branches = ?evicted, "evicted idle branches")
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "idle eviction failed"),
                }
            }
        })
    }

    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}
