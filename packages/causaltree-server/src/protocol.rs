//! Messages exchanged between a connected device and the replicator.
//!
//! Both directions are JSON objects tagged by `type`. The transport only relays them.

use causaltree_core::{AppOp, Atom, ContentHash};
use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════════════════════════════════════════
// Client Messages (Client -> Server)
// ═══════════════════════════════════════════════════════════════════════════════

/// Messages sent from a device to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start receiving the branch's atoms; the first reply is a full `atoms` snapshot
    WatchBranch { branch: String },

    /// Stop receiving updates for a branch
    UnwatchBranch { branch: String },

    /// Submit atoms created or relayed by this device
    AddAtoms {
        branch: String,
        atoms: Vec<Atom<AppOp>>,
    },

    /// Remove atoms (and their subtrees) by content hash
    RemoveAtoms {
        branch: String,
        hashes: Vec<ContentHash>,
    },

    /// Request branch metadata
    GetBranchInfo { branch: String },

    /// Fold the branch's stage into a new commit
    Commit { branch: String, message: String },
}

impl ClientMessage {
    pub fn branch(&self) -> &str {
        match self {
            ClientMessage::WatchBranch { branch }
            | ClientMessage::UnwatchBranch { branch }
            | ClientMessage::AddAtoms { branch, .. }
            | ClientMessage::RemoveAtoms { branch, .. }
            | ClientMessage::GetBranchInfo { branch }
            | ClientMessage::Commit { branch, .. } => branch,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Server Messages (Server -> Client)
// ═══════════════════════════════════════════════════════════════════════════════

/// Messages sent from the server to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Atoms newly applied to a watched branch
    Atoms {
        branch: String,
        atoms: Vec<Atom<AppOp>>,
    },

    /// Atoms removed from a watched branch
    AtomsRemoved {
        branch: String,
        hashes: Vec<ContentHash>,
    },

    /// Atoms from this device buffered until their cause arrives. They are neither
    /// woven nor staged yet and are dropped if the cause never shows up.
    Pending {
        branch: String,
        hashes: Vec<ContentHash>,
    },

    /// Full weave snapshot replacing whatever the watcher missed while lagging
    Resync {
        branch: String,
        atoms: Vec<Atom<AppOp>>,
    },

    /// Reply to `get_branch_info`
    BranchInfo(BranchInfo),

    /// Reply to `commit`
    Committed {
        branch: String,
        hash: ContentHash,
        message: String,
    },

    /// A request could not be honored; the session stays open
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
        message: String,
    },
}

impl ServerMessage {
    pub fn error(branch: Option<&str>, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            branch: branch.map(str::to_string),
            message: message.into(),
        }
    }
}

/// Snapshot of a running branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchInfo {
    pub branch: String,
    /// Head commit as last written by this process or loaded from storage
    pub head: Option<ContentHash>,
    pub atoms: usize,
    pub pending: usize,
    pub entities: usize,
    pub watchers: usize,
    pub lagged_watchers: usize,
    /// Milliseconds since the branch last had a watcher (0 while watched)
    pub idle_ms: u64,
    pub persistence: PersistenceInfo,
}

/// Counters from a branch's persistence worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceInfo {
    pub completed: u64,
    pub failures: u64,
    pub alerts: u64,
    /// Writes held by the branch because the persistence queue was full
    pub backlog: usize,
}
