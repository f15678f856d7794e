//! Per-branch actor.
//!
//! One tokio task per open branch owns the weave, the reducer state and the watcher
//! set. Everything else talks to it through a bounded command queue via
//! [`BranchHandle`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use causaltree_core::{
    AppOp, Atom, AtomAuthorizer, CausalRepoCommit, ContentHash, InsertStatus, LoadedBranch,
    PendingLimits, Reducer, Weave,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::broadcast::{SessionId, WatcherId, Watchers};
use crate::config::{BranchConfig, PersistenceConfig};
use crate::error::{Result, ServerError};
use crate::persistence::{self, PersistenceHandle, StageWrite};
use crate::protocol::{BranchInfo, ServerMessage};
use crate::storage::Storage;

/// A live subscription to a branch. The first message is the full `atoms` snapshot.
pub struct WatchSubscription {
    pub id: WatcherId,
    pub receiver: mpsc::Receiver<ServerMessage>,
}

/// An atom the branch refused.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rejection {
    pub hash: ContentHash,
    pub reason: String,
}

/// Result of an `add_atoms` command.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AddOutcome {
    /// Atoms placed into the weave, including buffered atoms released by this batch.
    pub applied: Vec<Atom<AppOp>>,
    /// Hashes of this batch's atoms buffered until their cause arrives. They are not
    /// staged and do not survive eviction.
    pub pending: Vec<ContentHash>,
    pub rejected: Vec<Rejection>,
}

/// Result of a `remove_atoms` command.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RemoveOutcome {
    /// Every hash taken out of the weave, subtrees included.
    pub removed: Vec<ContentHash>,
    pub rejected: Vec<Rejection>,
}

pub enum BranchCommand {
    Watch {
        session: SessionId,
        device: String,
        reply: oneshot::Sender<WatchSubscription>,
    },
    Unwatch {
        watcher: WatcherId,
    },
    AddAtoms {
        session: SessionId,
        device: String,
        atoms: Vec<Atom<AppOp>>,
        reply: oneshot::Sender<AddOutcome>,
    },
    RemoveAtoms {
        session: SessionId,
        device: String,
        hashes: Vec<ContentHash>,
        reply: oneshot::Sender<RemoveOutcome>,
    },
    Info {
        reply: oneshot::Sender<BranchInfo>,
    },
    Commit {
        message: String,
        reply: oneshot::Sender<Result<CausalRepoCommit>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    /// Stop only if nobody watches and the branch has been idle for `idle`. Replies
    /// `true` once the branch has closed.
    ShutdownIfIdle {
        idle: Duration,
        reply: oneshot::Sender<bool>,
    },
}

enum Closing {
    Requested(oneshot::Sender<()>),
    Idle(oneshot::Sender<bool>),
    Dropped,
}

/// Cloneable address of a running branch actor.
#[derive(Clone)]
pub struct BranchHandle {
    name: Arc<str>,
    tx: mpsc::Sender<BranchCommand>,
}

impl BranchHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn watch(&self, session: SessionId, device: &str) -> Result<WatchSubscription> {
        self.request(|reply| BranchCommand::Watch {
            session,
            device: device.to_string(),
            reply,
        })
        .await
    }

    pub async fn unwatch(&self, watcher: WatcherId) -> Result<()> {
        self.send(BranchCommand::Unwatch { watcher }).await
    }

    pub async fn add_atoms(
        &self,
        session: SessionId,
        device: &str,
        atoms: Vec<Atom<AppOp>>,
    ) -> Result<AddOutcome> {
        self.request(|reply| BranchCommand::AddAtoms {
            session,
            device: device.to_string(),
            atoms,
            reply,
        })
        .await
    }

    /// Remove atoms and their subtrees.
    pub async fn remove_atoms(
        &self,
        session: SessionId,
        device: &str,
        hashes: Vec<ContentHash>,
    ) -> Result<RemoveOutcome> {
        self.request(|reply| BranchCommand::RemoveAtoms {
            session,
            device: device.to_string(),
            hashes,
            reply,
        })
        .await
    }

    pub async fn info(&self) -> Result<BranchInfo> {
        self.request(|reply| BranchCommand::Info { reply }).await
    }

    pub async fn commit(&self, message: &str) -> Result<CausalRepoCommit> {
        self.request(|reply| BranchCommand::Commit {
            message: message.to_string(),
            reply,
        })
        .await?
    }

    /// Flush queued stage writes and stop the actor.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| BranchCommand::Shutdown { reply }).await
    }

    /// Stop the actor if it has been unwatched for at least `idle`. Returns whether it
    /// stopped; queued stage writes are flushed before it answers `true`.
    pub async fn shutdown_if_idle(&self, idle: Duration) -> Result<bool> {
        self.request(|reply| BranchCommand::ShutdownIfIdle { idle, reply })
            .await
    }

    async fn send(&self, command: BranchCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| ServerError::BranchClosed(self.name.to_string()))
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> BranchCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply)).await?;
        rx.await
            .map_err(|_| ServerError::BranchClosed(self.name.to_string()))
    }
}

/// Start the actor for a loaded branch.
pub fn spawn(
    name: &str,
    loaded: LoadedBranch<AppOp>,
    storage: Storage,
    authorizer: Arc<dyn AtomAuthorizer + Send + Sync>,
    config: BranchConfig,
    persistence_config: PersistenceConfig,
) -> (BranchHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(config.inbox_capacity.max(1));
    let head = loaded
        .branch
        .as_ref()
        .map(|b| b.hash);
    let flush_timeout = persistence_config.flush_timeout();
    let (persistence, persistence_join) =
        persistence::spawn(name.to_string(), storage, persistence_config, head);

    let mut weave = loaded.weave;
    weave.set_limits(PendingLimits {
        max_atoms: config.pending_max_atoms,
    });
    let mut reducer = Reducer::new();
    reducer.apply(&weave);

    let actor = BranchActor {
        name: name.to_string(),
        weave,
        reducer,
        watchers: Watchers::new(name, config.watcher_capacity),
        authorizer,
        persistence,
        persistence_join,
        flush_timeout,
        started: Instant::now(),
        idle_since: Some(Instant::now()),
        config,
    };
    let join = tokio::spawn(actor.run(rx));
    (
        BranchHandle {
            name: Arc::from(name),
            tx,
        },
        join,
    )
}

struct BranchActor {
    name: String,
    weave: Weave<AppOp>,
    reducer: Reducer,
    watchers: Watchers,
    authorizer: Arc<dyn AtomAuthorizer + Send + Sync>,
    persistence: PersistenceHandle,
    persistence_join: JoinHandle<()>,
    flush_timeout: Duration,
    started: Instant,
    idle_since: Option<Instant>,
    config: BranchConfig,
}

impl BranchActor {
    async fn run(mut self, mut rx: mpsc::Receiver<BranchCommand>) {
        info!(branch = %self.name, atoms = self.weave.len(), "branch opened");
        let mut tick = tokio::time::interval(self.config.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let closing = loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(BranchCommand::Shutdown { reply }) => break Closing::Requested(reply),
                    Some(BranchCommand::ShutdownIfIdle { idle, reply }) => {
                        if self.idle_for(idle) {
                            break Closing::Idle(reply);
                        }
                        let _ = reply.send(false);
                    }
                    Some(command) => self.handle(command),
                    None => break Closing::Dropped,
                },
                _ = tick.tick() => self.on_tick(),
            }
        };

        self.close().await;
        match closing {
            Closing::Requested(reply) => {
                let _ = reply.send(());
            }
            Closing::Idle(reply) => {
                let _ = reply.send(true);
            }
            Closing::Dropped => {}
        }
    }

    fn handle(&mut self, command: BranchCommand) {
        match command {
            BranchCommand::Watch {
                session,
                device,
                reply,
            } => {
                let snapshot = ServerMessage::Atoms {
                    branch: self.name.clone(),
                    atoms: self.weave.atoms().to_vec(),
                };
                let (id, receiver) = self.watchers.subscribe(session, &device, snapshot);
                self.idle_since = None;
                debug!(branch = %self.name, watcher = id, device = %device, "watcher added");
                let _ = reply.send(WatchSubscription { id, receiver });
            }
            BranchCommand::Unwatch { watcher } => {
                if self.watchers.unsubscribe(watcher) {
                    debug!(branch = %self.name, watcher, "watcher removed");
                }
                self.mark_idle_if_unwatched();
            }
            BranchCommand::AddAtoms {
                session,
                device,
                atoms,
                reply,
            } => {
                let outcome = self.add_atoms(session, &device, atoms);
                let _ = reply.send(outcome);
            }
            BranchCommand::RemoveAtoms {
                session,
                device,
                hashes,
                reply,
            } => {
                let outcome = self.remove_atoms(session, &device, hashes);
                let _ = reply.send(outcome);
            }
            BranchCommand::Info { reply } => {
                let _ = reply.send(self.info());
            }
            BranchCommand::Commit { message, reply } => {
                let time = chrono::Utc::now().timestamp_millis().max(0) as u64;
                let (commit_tx, commit_rx) = oneshot::channel();
                self.persistence
                    .submit_commit(self.weave.clone(), message, time, commit_tx);
                let name = self.name.clone();
                // Wait off the actor so retries do not stall other commands.
                tokio::spawn(async move {
                    let outcome = commit_rx
                        .await
                        .unwrap_or_else(|_| Err(ServerError::BranchClosed(name)));
                    let _ = reply.send(outcome);
                });
            }
            BranchCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
            BranchCommand::ShutdownIfIdle { reply, .. } => {
                let _ = reply.send(false);
            }
        }
    }

    fn add_atoms(
        &mut self,
        session: SessionId,
        device: &str,
        atoms: Vec<Atom<AppOp>>,
    ) -> AddOutcome {
        let mut outcome = AddOutcome::default();
        let submitted: HashSet<ContentHash> = atoms.iter().map(Atom::hash).collect();
        let now = self.now_ms();
        for atom in atoms {
            if !atom.is_valid() {
                warn!(
                    branch = %self.name,
                    device,
                    atom = %atom.id,
                    "dropping atom with invalid checksum"
                );
                outcome.rejected.push(Rejection {
                    hash: atom.hash(),
                    reason: "checksum mismatch".into(),
                });
                continue;
            }
            if let Err(e) = self
                .authorizer
                .can_apply(device, &atom, self.reducer.state())
            {
                warn!(branch = %self.name, device, atom = %atom.id, error = %e, "atom not authorized");
                outcome.rejected.push(Rejection {
                    hash: atom.hash(),
                    reason: e.to_string(),
                });
                continue;
            }
            let hash = atom.hash();
            match self.weave.insert_at(atom, now) {
                Ok(report) => {
                    if report.status == InsertStatus::Pending {
                        outcome.pending.push(hash);
                    }
                    for dropped in &report.evicted {
                        error!(
                            branch = %self.name,
                            atom = %dropped.id,
                            "pending buffer full; dropped atom waiting for its cause"
                        );
                    }
                    outcome.applied.extend(report.applied);
                }
                Err(e) => {
                    warn!(branch = %self.name, device, error = %e, "atom rejected by weave");
                    outcome.rejected.push(Rejection {
                        hash,
                        reason: e.to_string(),
                    });
                }
            }
        }

        if !outcome.applied.is_empty() {
            self.reducer.apply(&self.weave);
            self.persist(StageWrite::Add(outcome.applied.clone()));
            self.watchers.publish(
                Some(session),
                &ServerMessage::Atoms {
                    branch: self.name.clone(),
                    atoms: outcome.applied.clone(),
                },
            );
            // Buffered atoms from other devices that this batch released.
            let released: Vec<Atom<AppOp>> = outcome
                .applied
                .iter()
                .filter(|atom| !submitted.contains(&atom.hash()))
                .cloned()
                .collect();
            if !released.is_empty() {
                self.watchers.send_to_session(
                    session,
                    &ServerMessage::Atoms {
                        branch: self.name.clone(),
                        atoms: released,
                    },
                );
            }
        }
        outcome
    }

    fn remove_atoms(&mut self, session: SessionId, device: &str, hashes: Vec<ContentHash>) -> RemoveOutcome {
        let mut outcome = RemoveOutcome::default();
        for hash in hashes {
            let Some(atom) = self.weave.find_by_hash(&hash) else {
                continue;
            };
            if let Err(e) = self
                .authorizer
                .can_remove(device, atom, self.reducer.state())
            {
                warn!(branch = %self.name, device, atom = %atom.id, error = %e, "removal not authorized");
                outcome.rejected.push(Rejection {
                    hash,
                    reason: e.to_string(),
                });
                continue;
            }
            let id = atom.id.clone();
            match self.weave.remove(&id) {
                Ok(atoms) => outcome.removed.extend(atoms.iter().map(Atom::hash)),
                Err(e) => warn!(branch = %self.name, atom = %id, error = %e, "remove failed"),
            }
        }

        if !outcome.removed.is_empty() {
            self.reducer.apply(&self.weave);
            self.persist(StageWrite::Remove(outcome.removed.clone()));
            self.watchers.publish(
                Some(session),
                &ServerMessage::AtomsRemoved {
                    branch: self.name.clone(),
                    hashes: outcome.removed.clone(),
                },
            );
        }
        outcome
    }

    fn on_tick(&mut self) {
        let timeout = self.config.pending_timeout().as_millis() as u64;
        if let Some(cutoff) = self.now_ms().checked_sub(timeout) {
            for atom in self.weave.expire_pending(cutoff) {
                error!(
                    branch = %self.name,
                    atom = %atom.id,
                    cause = ?atom.cause,
                    "cause never arrived; dropping buffered atom"
                );
            }
        }

        self.persistence.drain_backlog();

        let name = self.name.clone();
        let weave = &self.weave;
        self.watchers.resync_lagged(|| ServerMessage::Resync {
            branch: name,
            atoms: weave.atoms().to_vec(),
        });
        self.watchers.prune_closed();
        self.mark_idle_if_unwatched();
    }

    fn info(&self) -> BranchInfo {
        BranchInfo {
            branch: self.name.clone(),
            head: self.persistence.head(),
            atoms: self.weave.len(),
            pending: self.weave.pending_len(),
            entities: self.reducer.state().len(),
            watchers: self.watchers.len(),
            lagged_watchers: self.watchers.lagged_count(),
            idle_ms: self
                .idle_since
                .map(|since| since.elapsed().as_millis() as u64)
                .unwrap_or(0),
            persistence: self.persistence.info(),
        }
    }

    fn persist(&mut self, write: StageWrite) {
        self.persistence.submit(write);
    }

    fn idle_for(&mut self, idle: Duration) -> bool {
        self.watchers.prune_closed();
        self.mark_idle_if_unwatched();
        self.watchers.is_empty()
            && self
                .idle_since
                .is_some_and(|since| since.elapsed() >= idle)
    }

    /// Hand held writes to the worker, close its queue and wait for it to drain.
    async fn close(self) {
        let BranchActor {
            name,
            persistence,
            persistence_join,
            flush_timeout,
            ..
        } = self;

        let abort = persistence_join.abort_handle();
        let drained = async move {
            persistence.finish().await;
            let _ = persistence_join.await;
        };
        match tokio::time::timeout(flush_timeout, drained).await {
            Ok(_) => debug!(branch = %name, "stage writes flushed"),
            Err(_) => {
                error!(
                    branch = %name,
                    timeout_ms = flush_timeout.as_millis() as u64,
                    "stage writes still failing at shutdown; abandoning queue"
                );
                abort.abort();
            }
        }
        info!(branch = %name, "branch closed");
    }

    fn mark_idle_if_unwatched(&mut self) {
        if self.watchers.is_empty() && self.idle_since.is_none() {
            self.idle_since = Some(Instant::now());
        }
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}
