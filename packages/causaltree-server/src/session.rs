//! One connected device.
//!
//! A session turns `ClientMessage`s into branch commands and feeds everything the
//! device should see into a single outbound queue. Each watched branch gets a small
//! forwarding task that pumps the watcher queue into that outbound queue.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::branch::{BranchHandle, Rejection};
use crate::broadcast::{SessionId, WatcherId};
use crate::error::{Result, ServerError};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::registry::BranchRegistry;

struct Watch {
    handle: BranchHandle,
    watcher: WatcherId,
    forward: JoinHandle<()>,
}

pub struct Session {
    id: SessionId,
    device: String,
    registry: Arc<BranchRegistry>,
    outbound: mpsc::Sender<ServerMessage>,
    watches: HashMap<String, Watch>,
}

impl Session {
    pub fn new(
        id: SessionId,
        device: impl Into<String>,
        registry: Arc<BranchRegistry>,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Self {
        Self {
            id,
            device: device.into(),
            registry,
            outbound,
            watches: HashMap::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Another sender into this session's outbound queue, for transport-level errors.
    pub fn outbound(&self) -> mpsc::Sender<ServerMessage> {
        self.outbound.clone()
    }

    pub fn watching(&self) -> Vec<String> {
        let mut names: Vec<String> = self.watches.keys().cloned().collect();
        names.sort();
        names
    }

    /// Handle one message. Request failures are reported to the device as `error`
    /// messages; only a closed outbound queue is returned as an error.
    pub async fn handle(&mut self, message: ClientMessage) -> Result<()> {
        let branch = message.branch().to_string();
        match self.dispatch(message).await {
            Ok(()) => Ok(()),
            Err(ServerError::SessionClosed) => Err(ServerError::SessionClosed),
            Err(e) => {
                debug!(session = self.id, branch = %branch, error = %e, "request failed");
                self.reply(ServerMessage::error(Some(&branch), e.to_string()))
                    .await
            }
        }
    }

    /// Drive the session from an inbound queue until it closes, then release watches.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<ClientMessage>) {
        info!(session = self.id, device = %self.device, "session started");
        while let Some(message) = inbound.recv().await {
            if self.handle(message).await.is_err() {
                break;
            }
        }
        self.close().await;
    }

    /// Stop watching every branch.
    pub async fn close(mut self) {
        let names: Vec<String> = self.watches.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.unwatch(&name).await {
                warn!(session = self.id, branch = %name, error = %e, "unwatch on close failed");
            }
        }
        info!(session = self.id, device = %self.device, "session closed");
    }

    async fn dispatch(&mut self, message: ClientMessage) -> Result<()> {
        match message {
            ClientMessage::WatchBranch { branch } => self.watch(&branch).await,
            ClientMessage::UnwatchBranch { branch } => self.unwatch(&branch).await,
            ClientMessage::AddAtoms { branch, atoms } => {
                let handle = self.registry.open(&branch).await?;
                let outcome = handle.add_atoms(self.id, &self.device, atoms).await?;
                if !outcome.pending.is_empty() {
                    self.reply(ServerMessage::Pending {
                        branch: branch.clone(),
                        hashes: outcome.pending,
                    })
                    .await?;
                }
                self.report_rejections(&branch, "atom", &outcome.rejected)
                    .await
            }
            ClientMessage::RemoveAtoms { branch, hashes } => {
                let handle = self.registry.open(&branch).await?;
                let outcome = handle.remove_atoms(self.id, &self.device, hashes).await?;
                self.report_rejections(&branch, "removal", &outcome.rejected)
                    .await
            }
            ClientMessage::GetBranchInfo { branch } => {
                let handle = self.registry.open(&branch).await?;
                let info = handle.info().await?;
                self.reply(ServerMessage::BranchInfo(info)).await
            }
            ClientMessage::Commit { branch, message } => {
                let handle = self.registry.open(&branch).await?;
                let commit = handle.commit(&message).await?;
                self.reply(ServerMessage::Committed {
                    branch,
                    hash: commit.hash,
                    message: commit.message,
                })
                .await
            }
        }
    }

    async fn report_rejections(&self, branch: &str, what: &str, rejected: &[Rejection]) -> Result<()> {
        if rejected.is_empty() {
            return Ok(());
        }
        let reasons: Vec<String> = rejected
            .iter()
            .map(|r| format!("{}: {}", r.hash, r.reason))
            .collect();
        self.reply(ServerMessage::error(
            Some(branch),
            format!("rejected {} {what}(s): {}", reasons.len(), reasons.join("; ")),
        ))
        .await
    }

    async fn watch(&mut self, branch: &str) -> Result<()> {
        if let Some(existing) = self.watches.get(branch) {
            if !existing.forward.is_finished() {
                return Err(ServerError::AlreadyWatching(branch.to_string()));
            }
        }
        let handle = self.registry.open(branch).await?;
        let subscription = handle.watch(self.id, &self.device).await?;

        let outbound = self.outbound.clone();
        let mut receiver = subscription.receiver;
        let forward = tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                if outbound.send(message).await.is_err() {
                    break;
                }
            }
        });
        self.watches.insert(
            branch.to_string(),
            Watch {
                handle,
                watcher: subscription.id,
                forward,
            },
        );
        Ok(())
    }

    async fn unwatch(&mut self, branch: &str) -> Result<()> {
        let watch = self
            .watches
            .remove(branch)
            .ok_or_else(|| ServerError::NotWatching(branch.to_string()))?;
        watch.forward.abort();
        match watch.handle.unwatch(watch.watcher).await {
            Ok(()) | Err(ServerError::BranchClosed(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn reply(&self, message: ServerMessage) -> Result<()> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| ServerError::SessionClosed)
    }
}
