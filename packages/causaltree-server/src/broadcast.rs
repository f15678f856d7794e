//! Watcher fan-out for a single branch.
//!
//! Owned by the branch actor, so no locking. Every watcher has its own bounded queue
//! and is only ever written with `try_send`: a full queue marks the watcher lagged,
//! incremental messages stop, and a `resync` snapshot is delivered as soon as the
//! queue has room again. Watchers whose receiver is gone are pruned.

use std::collections::BTreeMap;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::protocol::ServerMessage;

pub type WatcherId = u64;
pub type SessionId = u64;

struct Watcher {
    session: SessionId,
    device: String,
    sender: mpsc::Sender<ServerMessage>,
    lagged: bool,
}

/// Counters for one branch's fan-out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub delivered: u64,
    pub lagged: u64,
    pub resynced: u64,
    pub pruned: u64,
}

pub struct Watchers {
    branch: String,
    capacity: usize,
    next_id: WatcherId,
    watchers: BTreeMap<WatcherId, Watcher>,
    stats: BroadcastStats,
}

impl Watchers {
    pub fn new(branch: impl Into<String>, capacity: usize) -> Self {
        Self {
            branch: branch.into(),
            capacity: capacity.max(1),
            next_id: 1,
            watchers: BTreeMap::new(),
            stats: BroadcastStats::default(),
        }
    }

    /// Register a watcher. `initial` is queued before anything else.
    pub fn subscribe(
        &mut self,
        session: SessionId,
        device: &str,
        initial: ServerMessage,
    ) -> (WatcherId, mpsc::Receiver<ServerMessage>) {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let id = self.next_id;
        self.next_id = self.next_id.saturating_add(1);
        // Fresh queue with capacity >= 1: cannot be full.
        let lagged = sender.try_send(initial).is_err();
        self.watchers.insert(
            id,
            Watcher {
                session,
                device: device.to_string(),
                sender,
                lagged,
            },
        );
        (id, receiver)
    }

    pub fn unsubscribe(&mut self, id: WatcherId) -> bool {
        self.watchers.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.watchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }

    pub fn lagged_count(&self) -> usize {
        self.watchers.values().filter(|w| w.lagged).count()
    }

    pub fn stats(&self) -> BroadcastStats {
        self.stats
    }

    /// Deliver `message` to every watcher not belonging to `origin`.
    pub fn publish(&mut self, origin: Option<SessionId>, message: &ServerMessage) {
        self.deliver(|w| Some(w.session) != origin, message);
    }

    /// Deliver `message` only to the watchers of `session`.
    pub fn send_to_session(&mut self, session: SessionId, message: &ServerMessage) {
        self.deliver(|w| w.session == session, message);
    }

    fn deliver(&mut self, wants: impl Fn(&Watcher) -> bool, message: &ServerMessage) {
        let mut closed = Vec::new();
        for (id, watcher) in self.watchers.iter_mut() {
            if watcher.lagged || !wants(watcher) {
                continue;
            }
            match watcher.sender.try_send(message.clone()) {
                Ok(()) => self.stats.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        branch = %self.branch,
                        watcher = id,
                        device = %watcher.device,
                        "watcher queue full; switching to resync"
                    );
                    watcher.lagged = true;
                    self.stats.lagged += 1;
                }
                Err(TrySendError::Closed(_)) => closed.push(*id),
            }
        }
        self.prune(closed);
    }

    /// Try to hand each lagged watcher a fresh snapshot. The snapshot is only built
    /// when some watcher is lagged.
    pub fn resync_lagged(&mut self, snapshot: impl FnOnce() -> ServerMessage) {
        if self.lagged_count() == 0 {
            return;
        }
        let message = snapshot();
        let mut closed = Vec::new();
        for (id, watcher) in self.watchers.iter_mut().filter(|(_, w)| w.lagged) {
            match watcher.sender.try_send(message.clone()) {
                Ok(()) => {
                    debug!(branch = %self.branch, watcher = id, "lagged watcher resynced");
                    watcher.lagged = false;
                    self.stats.resynced += 1;
                }
                Err(TrySendError::Full(_)) => {}
                Err(TrySendError::Closed(_)) => closed.push(*id),
            }
        }
        self.prune(closed);
    }

    /// Drop watchers whose receiver has been dropped.
    pub fn prune_closed(&mut self) {
        let closed: Vec<WatcherId> = self
            .watchers
            .iter()
            .filter(|(_, w)| w.sender.is_closed())
            .map(|(id, _)| *id)
            .collect();
        self.prune(closed);
    }

    fn prune(&mut self, closed: Vec<WatcherId>) {
        for id in closed {
            if self.watchers.remove(&id).is_some() {
                debug!(branch = %self.branch, watcher = id, "pruned closed watcher");
                self.stats.pruned += 1;
            }
        }
    }
}
