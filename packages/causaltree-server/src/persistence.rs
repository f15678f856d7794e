//! Ordered, retrying stage persistence for one branch.
//!
//! The branch actor submits writes without ever waiting; a single worker task executes
//! them in order on the blocking pool. A failed write is retried with capped exponential
//! backoff until it succeeds; later writes wait behind it. When the queue is full the
//! handle holds writes in a local backlog, merging adjacent atom batches, and moves them
//! over as room frees up. In-memory branch state is authoritative in the meantime.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use causaltree_core::{AppOp, Atom, CausalRepoCommit, ContentHash, StageStore, Weave};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::PersistenceConfig;
use crate::error::{Result, ServerError};
use crate::protocol::PersistenceInfo;
use crate::storage::Storage;

/// One unit of work for the persistence worker.
#[derive(Clone, Debug)]
pub enum StageWrite {
    Add(Vec<Atom<AppOp>>),
    Remove(Vec<ContentHash>),
    Commit {
        weave: Weave<AppOp>,
        message: String,
        time: u64,
    },
}

impl StageWrite {
    fn kind(&self) -> &'static str {
        match self {
            StageWrite::Add(_) => "add_atoms",
            StageWrite::Remove(_) => "remove_atoms",
            StageWrite::Commit { .. } => "commit",
        }
    }
}

pub type CommitReply = oneshot::Sender<Result<CausalRepoCommit>>;

struct QueuedWrite {
    write: StageWrite,
    reply: Option<CommitReply>,
}

#[derive(Debug, Default)]
struct Counters {
    completed: AtomicU64,
    failures: AtomicU64,
    alerts: AtomicU64,
}

/// Sending side of a branch's persistence queue. Owned by the branch actor.
pub struct PersistenceHandle {
    branch: String,
    tx: mpsc::Sender<QueuedWrite>,
    backlog: VecDeque<QueuedWrite>,
    counters: Arc<Counters>,
    head: watch::Receiver<Option<ContentHash>>,
}

impl PersistenceHandle {
    /// Queue a stage write without waiting.
    pub fn submit(&mut self, write: StageWrite) {
        self.push(QueuedWrite { write, reply: None });
    }

    /// Queue a commit; `reply` receives the result once it has been written.
    pub fn submit_commit(&mut self, weave: Weave<AppOp>, message: String, time: u64, reply: CommitReply) {
        self.push(QueuedWrite {
            write: StageWrite::Commit {
                weave,
                message,
                time,
            },
            reply: Some(reply),
        });
    }

    /// Move held writes into the queue while it has room.
    pub fn drain_backlog(&mut self) {
        while let Some(queued) = self.backlog.pop_front() {
            match self.tx.try_send(queued) {
                Ok(()) => {}
                Err(TrySendError::Full(queued)) => {
                    self.backlog.push_front(queued);
                    return;
                }
                Err(TrySendError::Closed(queued)) => {
                    self.reject(queued);
                }
            }
        }
    }

    /// Head commit after the most recent successful commit.
    pub fn head(&self) -> Option<ContentHash> {
        *self.head.borrow()
    }

    pub fn info(&self) -> PersistenceInfo {
        PersistenceInfo {
            completed: self.counters.completed.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            alerts: self.counters.alerts.load(Ordering::Relaxed),
            backlog: self.backlog.len(),
        }
    }

    /// Hand every held write to the worker, waiting for room, then close the queue.
    pub async fn finish(mut self) {
        while let Some(queued) = self.backlog.pop_front() {
            if let Err(mpsc::error::SendError(queued)) = self.tx.send(queued).await {
                self.reject(queued);
            }
        }
    }

    fn push(&mut self, queued: QueuedWrite) {
        self.drain_backlog();
        if !self.backlog.is_empty() {
            self.hold(queued);
            return;
        }
        match self.tx.try_send(queued) {
            Ok(()) => {}
            Err(TrySendError::Full(queued)) => self.hold(queued),
            Err(TrySendError::Closed(queued)) => self.reject(queued),
        }
    }

    fn hold(&mut self, queued: QueuedWrite) {
        let queued = match self.backlog.back_mut() {
            Some(last) if last.reply.is_none() && queued.reply.is_none() => {
                match merge(&mut last.write, queued.write) {
                    None => return,
                    Some(write) => QueuedWrite { write, reply: None },
                }
            }
            _ => queued,
        };
        self.backlog.push_back(queued);
        self.warn_backlog();
    }

    fn warn_backlog(&self) {
        let held = self.backlog.len();
        if held.is_power_of_two() {
            error!(
                branch = %self.branch,
                held,
                "persistence queue full; holding stage writes in memory"
            );
        }
    }

    fn reject(&self, queued: QueuedWrite) {
        error!(branch = %self.branch, write = queued.write.kind(), "persistence worker stopped; write lost");
        if let Some(reply) = queued.reply {
            let _ = reply.send(Err(ServerError::Task("persistence worker stopped".into())));
        }
    }
}

/// Fold `write` into `held` when both carry the same kind of atom batch.
fn merge(held: &mut StageWrite, write: StageWrite) -> Option<StageWrite> {
    match (held, write) {
        (StageWrite::Add(held), StageWrite::Add(more)) => {
            held.extend(more);
            None
        }
        (StageWrite::Remove(held), StageWrite::Remove(more)) => {
            held.extend(more);
            None
        }
        (_, write) => Some(write),
    }
}

/// Start the worker for `branch`. Dropping the handle lets the worker drain its queue
/// and exit; use [`PersistenceHandle::finish`] to hand over held writes first.
pub fn spawn(
    branch: String,
    storage: Storage,
    config: PersistenceConfig,
    head: Option<ContentHash>,
) -> (PersistenceHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let (head_tx, head_rx) = watch::channel(head);
    let counters = Arc::new(Counters::default());
    let worker = Worker {
        branch: branch.clone(),
        storage,
        config,
        counters: Arc::clone(&counters),
        head: head_tx,
        consecutive_failures: 0,
    };
    let join = tokio::spawn(worker.run(rx));
    (
        PersistenceHandle {
            branch,
            tx,
            backlog: VecDeque::new(),
            counters,
            head: head_rx,
        },
        join,
    )
}

struct Worker {
    branch: String,
    storage: Storage,
    config: PersistenceConfig,
    counters: Arc<Counters>,
    head: watch::Sender<Option<ContentHash>>,
    consecutive_failures: u32,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<QueuedWrite>) {
        while let Some(queued) = rx.recv().await {
            let result = self.execute_with_retry(&queued.write).await;
            if let Some(commit) = &result {
                let _ = self.head.send(Some(commit.hash));
            }
            if let Some(reply) = queued.reply {
                let outcome = result.ok_or_else(|| {
                    ServerError::Task(format!("commit on {} produced no result", self.branch))
                });
                let _ = reply.send(outcome);
            }
        }
        debug!(branch = %self.branch, "persistence queue drained");
    }

    /// Returns the commit for `StageWrite::Commit`, `None` otherwise.
    async fn execute_with_retry(&mut self, write: &StageWrite) -> Option<CausalRepoCommit> {
        let mut attempt: u32 = 0;
        loop {
            match self.execute(write.clone()).await {
                Ok(commit) => {
                    if self.consecutive_failures > 0 {
                        info!(
                            branch = %self.branch,
                            write = write.kind(),
                            attempts = attempt + 1,
                            "persistence recovered"
                        );
                    }
                    self.consecutive_failures = 0;
                    self.counters.completed.fetch_add(1, Ordering::Relaxed);
                    return commit;
                }
                Err(e) => {
                    self.consecutive_failures += 1;
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    let delay = self.config.backoff_delay(attempt);
                    if self.consecutive_failures == self.config.alert_after {
                        self.counters.alerts.fetch_add(1, Ordering::Relaxed);
                        error!(
                            alert = true,
                            branch = %self.branch,
                            write = write.kind(),
                            failures = self.consecutive_failures,
                            error = %e,
                            "stage persistence keeps failing; in-memory state is ahead of storage"
                        );
                    } else {
                        warn!(
                            branch = %self.branch,
                            write = write.kind(),
                            attempt = attempt + 1,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %e,
                            "stage write failed"
                        );
                    }
                    tokio::time::sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    async fn execute(&self, write: StageWrite) -> Result<Option<CausalRepoCommit>> {
        let branch = self.branch.clone();
        self.storage
            .run(move |objects, stage| match write {
                StageWrite::Add(atoms) => stage.add_atoms(&branch, &atoms).map(|_| None),
                StageWrite::Remove(hashes) => stage.remove_atoms(&branch, &hashes).map(|_| None),
                StageWrite::Commit {
                    weave,
                    message,
                    time,
                } => causaltree_core::commit(objects, stage, &branch, &weave, &message, time)
                    .map(Some),
            })
            .await
    }
}
