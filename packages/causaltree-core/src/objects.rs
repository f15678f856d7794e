use std::collections::{BTreeSet, HashSet};

use blake3::Hasher;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::atom::{Atom, ContentHash};
use crate::error::{Error, Result};

const COMMIT_DOMAIN: &[u8] = b"causaltree/commit/v1";

/// Snapshot of a branch: the full set of atom hashes plus a link to its parent commit.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CausalRepoCommit {
    pub hash: ContentHash,
    pub message: String,
    /// Unix time in milliseconds.
    pub time: u64,
    pub previous_commit: Option<ContentHash>,
    /// Sorted, de-duplicated.
    pub atoms: Vec<ContentHash>,
}

impl CausalRepoCommit {
    pub fn new(
        message: impl Into<String>,
        time: u64,
        previous_commit: Option<ContentHash>,
        atoms: impl IntoIterator<Item = ContentHash>,
    ) -> Self {
        let atoms: Vec<ContentHash> = atoms
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let message = message.into();
        let hash = commit_hash(&message, time, previous_commit.as_ref(), &atoms);
        Self {
            hash,
            message,
            time,
            previous_commit,
            atoms,
        }
    }

    pub fn verify(&self) -> Result<()> {
        let actual = commit_hash(
            &self.message,
            self.time,
            self.previous_commit.as_ref(),
            &self.atoms,
        );
        if actual != self.hash {
            return Err(Error::InconsistentState(format!(
                "commit {} hashes to {}",
                self.hash, actual
            )));
        }
        Ok(())
    }
}

fn commit_hash(
    message: &str,
    time: u64,
    previous: Option<&ContentHash>,
    atoms: &[ContentHash],
) -> ContentHash {
    let mut hasher = Hasher::new();
    hasher.update(COMMIT_DOMAIN);
    hasher.update(&(message.len() as u32).to_be_bytes());
    hasher.update(message.as_bytes());
    hasher.update(&time.to_be_bytes());
    match previous {
        Some(prev) => {
            hasher.update(&[1]);
            hasher.update(prev.as_bytes());
        }
        None => {
            hasher.update(&[0]);
        }
    }
    hasher.update(&(atoms.len() as u64).to_be_bytes());
    for atom in atoms {
        hasher.update(atom.as_bytes());
    }
    ContentHash::finish(hasher)
}

/// Named pointer to a head commit.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CausalRepoBranch {
    pub name: String,
    pub hash: ContentHash,
    pub time: u64,
}

impl CausalRepoBranch {
    pub fn new(name: impl Into<String>, hash: ContentHash, time: u64) -> Self {
        Self {
            name: name.into(),
            hash,
            time,
        }
    }
}

/// Content-addressed object stored in the repo.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", rename_all = "snake_case"))]
pub enum CausalRepoObject<Op> {
    Atom(Atom<Op>),
    Commit(CausalRepoCommit),
}

impl<Op> CausalRepoObject<Op> {
    pub fn hash(&self) -> ContentHash {
        match self {
            CausalRepoObject::Atom(atom) => atom.hash(),
            CausalRepoObject::Commit(commit) => commit.hash,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CausalRepoObject::Atom(_) => "atom",
            CausalRepoObject::Commit(_) => "commit",
        }
    }

    pub fn as_atom(&self) -> Option<&Atom<Op>> {
        match self {
            CausalRepoObject::Atom(atom) => Some(atom),
            CausalRepoObject::Commit(_) => None,
        }
    }

    pub fn as_commit(&self) -> Option<&CausalRepoCommit> {
        match self {
            CausalRepoObject::Commit(commit) => Some(commit),
            CausalRepoObject::Atom(_) => None,
        }
    }
}

/// One entry in a branch's stage log.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum StageChange<Op> {
    Added { atom: Atom<Op> },
    Removed { hash: ContentHash },
}

impl<Op> StageChange<Op> {
    pub fn hash(&self) -> ContentHash {
        match self {
            StageChange::Added { atom } => atom.hash(),
            StageChange::Removed { hash } => *hash,
        }
    }

    pub fn is_added(&self) -> bool {
        matches!(self, StageChange::Added { .. })
    }
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StagedAtom<Op> {
    pub branch: String,
    pub change: StageChange<Op>,
}

/// Net effect of a branch's stage: atoms added since the last commit and hashes removed.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StageDiff<Op> {
    pub additions: Vec<Atom<Op>>,
    pub deletions: BTreeSet<ContentHash>,
}

impl<Op> Default for StageDiff<Op> {
    fn default() -> Self {
        Self {
            additions: Vec::new(),
            deletions: BTreeSet::new(),
        }
    }
}

impl<Op: Clone> StageDiff<Op> {
    /// Fold a stage log into its net diff. The last change per hash wins, so an atom
    /// re-added after a removal is live again.
    pub fn from_log<'a>(log: impl IntoIterator<Item = &'a StageChange<Op>>) -> Self
    where
        Op: 'a,
    {
        let mut diff = Self::default();
        let mut added = HashSet::new();
        for change in log {
            match change {
                StageChange::Added { atom } => {
                    let hash = atom.hash();
                    diff.deletions.remove(&hash);
                    if added.insert(hash) {
                        diff.additions.push(atom.clone());
                    }
                }
                StageChange::Removed { hash } => {
                    if added.remove(hash) {
                        diff.additions.retain(|a| a.hash() != *hash);
                    }
                    diff.deletions.insert(*hash);
                }
            }
        }
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.deletions.is_empty()
    }

    /// Apply the diff on top of committed atoms: `committed ∪ additions − deletions`.
    pub fn apply_to(&self, committed: impl IntoIterator<Item = Atom<Op>>) -> Vec<Atom<Op>> {
        let mut seen = HashSet::new();
        committed
            .into_iter()
            .chain(self.additions.iter().cloned())
            .filter(|atom| !self.deletions.contains(&atom.hash()))
            .filter(|atom| seen.insert(atom.hash()))
            .collect()
    }
}
