use std::collections::{BTreeMap, HashMap, HashSet};

use crate::atom::{Atom, ContentHash};
use crate::error::Result;
use crate::ids::Lamport;
use crate::objects::{CausalRepoBranch, CausalRepoObject, StageChange, StageDiff, StagedAtom};
use crate::ops::AppOp;
use crate::reducer::State;

/// Pluggable clock to allow Lamport, Hybrid Logical Clock, or custom time strategies.
pub trait Clock {
    fn tick(&mut self) -> Lamport;
    fn observe(&mut self, external: Lamport);
    fn now(&self) -> Lamport;
}

/// Basic Lamport clock implementation useful for tests and default flows.
#[derive(Clone, Debug, Default)]
pub struct LamportClock {
    counter: Lamport,
}

impl Clock for LamportClock {
    fn tick(&mut self) -> Lamport {
        self.counter += 1;
        self.counter
    }

    fn observe(&mut self, external: Lamport) {
        self.counter = self.counter.max(external);
    }

    fn now(&self) -> Lamport {
        self.counter
    }
}

/// Authorization hook consulted before an atom from `device` is applied to, or
/// removed from, a branch. Policies see the branch's current reduced state.
pub trait AtomAuthorizer {
    fn can_apply(&self, device: &str, atom: &Atom<AppOp>, state: &State) -> Result<()>;

    /// `atom` is the root of the subtree `device` asks to remove.
    fn can_remove(&self, device: &str, atom: &Atom<AppOp>, state: &State) -> Result<()>;
}

/// Allows unrestricted access; helpful for early prototyping.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAllAccess;

impl AtomAuthorizer for AllowAllAccess {
    fn can_apply(&self, _device: &str, _atom: &Atom<AppOp>, _state: &State) -> Result<()> {
        Ok(())
    }

    fn can_remove(&self, _device: &str, _atom: &Atom<AppOp>, _state: &State) -> Result<()> {
        Ok(())
    }
}

/// Content-addressed storage for atoms and commits, plus branch heads.
pub trait ObjectStore<Op> {
    fn get_object(&self, hash: &ContentHash) -> Result<Option<CausalRepoObject<Op>>>;
    /// Objects stored under `head`, in request order. Unknown hashes are skipped.
    fn get_objects(&self, head: &str, hashes: &[ContentHash]) -> Result<Vec<CausalRepoObject<Op>>>;
    /// Idempotent upsert; objects already present are left untouched.
    fn store_objects(&mut self, head: &str, objects: &[CausalRepoObject<Op>]) -> Result<()>;
    /// Branches whose name starts with `prefix` (all when `None`), sorted by name.
    fn get_branches(&self, prefix: Option<&str>) -> Result<Vec<CausalRepoBranch>>;
    fn get_branch(&self, name: &str) -> Result<Option<CausalRepoBranch>>;
    fn save_branch(&mut self, branch: &CausalRepoBranch) -> Result<()>;
    fn delete_branch(&mut self, name: &str) -> Result<()>;
}

/// Append-only per-branch log of edits not yet folded into a commit.
pub trait StageStore<Op> {
    fn get_stage(&self, branch: &str) -> Result<StageDiff<Op>>;
    /// An addition is ignored when the latest change for `(branch, hash)` is already an addition.
    fn add_atoms(&mut self, branch: &str, atoms: &[Atom<Op>]) -> Result<()>;
    /// A removal is ignored when the latest change for `(branch, hash)` is already a removal.
    fn remove_atoms(&mut self, branch: &str, hashes: &[ContentHash]) -> Result<()>;
    fn clear_stage(&mut self, branch: &str) -> Result<()>;
}

/// In-memory object store for tests and single-process deployments.
#[derive(Clone, Debug)]
pub struct MemoryObjectStore<Op> {
    objects: HashMap<ContentHash, CausalRepoObject<Op>>,
    heads: HashMap<String, HashSet<ContentHash>>,
    branches: BTreeMap<String, CausalRepoBranch>,
}

impl<Op> Default for MemoryObjectStore<Op> {
    fn default() -> Self {
        Self {
            objects: HashMap::new(),
            heads: HashMap::new(),
            branches: BTreeMap::new(),
        }
    }
}

impl<Op> MemoryObjectStore<Op> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }
}

impl<Op: Clone> ObjectStore<Op> for MemoryObjectStore<Op> {
    fn get_object(&self, hash: &ContentHash) -> Result<Option<CausalRepoObject<Op>>> {
        Ok(self.objects.get(hash).cloned())
    }

    fn get_objects(&self, head: &str, hashes: &[ContentHash]) -> Result<Vec<CausalRepoObject<Op>>> {
        let Some(owned) = self.heads.get(head) else {
            return Ok(Vec::new());
        };
        Ok(hashes
            .iter()
            .filter(|h| owned.contains(h))
            .filter_map(|h| self.objects.get(h).cloned())
            .collect())
    }

    fn store_objects(&mut self, head: &str, objects: &[CausalRepoObject<Op>]) -> Result<()> {
        let owned = self.heads.entry(head.to_string()).or_default();
        for object in objects {
            let hash = object.hash();
            owned.insert(hash);
            self.objects.entry(hash).or_insert_with(|| object.clone());
        }
        Ok(())
    }

    fn get_branches(&self, prefix: Option<&str>) -> Result<Vec<CausalRepoBranch>> {
        Ok(self
            .branches
            .values()
            .filter(|b| prefix.map_or(true, |p| b.name.starts_with(p)))
            .cloned()
            .collect())
    }

    fn get_branch(&self, name: &str) -> Result<Option<CausalRepoBranch>> {
        Ok(self.branches.get(name).cloned())
    }

    fn save_branch(&mut self, branch: &CausalRepoBranch) -> Result<()> {
        self.branches.insert(branch.name.clone(), branch.clone());
        Ok(())
    }

    fn delete_branch(&mut self, name: &str) -> Result<()> {
        self.branches.remove(name);
        Ok(())
    }
}

/// In-memory stage log.
#[derive(Clone, Debug)]
pub struct MemoryStageStore<Op> {
    log: Vec<StagedAtom<Op>>,
    /// Latest change kind per `(branch, hash)`: `true` for added.
    latest: HashMap<(String, ContentHash), bool>,
}

impl<Op> Default for MemoryStageStore<Op> {
    fn default() -> Self {
        Self {
            log: Vec::new(),
            latest: HashMap::new(),
        }
    }
}

impl<Op> MemoryStageStore<Op> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of raw log entries recorded for `branch`.
    pub fn log_len(&self, branch: &str) -> usize {
        self.log.iter().filter(|s| s.branch == branch).count()
    }

    /// Record `change` unless it repeats the latest change for the same hash.
    fn append(&mut self, branch: &str, change: StageChange<Op>) {
        let key = (branch.to_string(), change.hash());
        if self.latest.insert(key, change.is_added()) != Some(change.is_added()) {
            self.log.push(StagedAtom {
                branch: branch.to_string(),
                change,
            });
        }
    }
}

impl<Op: Clone> StageStore<Op> for MemoryStageStore<Op> {
    fn get_stage(&self, branch: &str) -> Result<StageDiff<Op>> {
        Ok(StageDiff::from_log(
            self.log
                .iter()
                .filter(|s| s.branch == branch)
                .map(|s| &s.change),
        ))
    }

    fn add_atoms(&mut self, branch: &str, atoms: &[Atom<Op>]) -> Result<()> {
        for atom in atoms {
            self.append(branch, StageChange::Added { atom: atom.clone() });
        }
        Ok(())
    }

    fn remove_atoms(&mut self, branch: &str, hashes: &[ContentHash]) -> Result<()> {
        for hash in hashes {
            self.append(branch, StageChange::Removed { hash: *hash });
        }
        Ok(())
    }

    fn clear_stage(&mut self, branch: &str) -> Result<()> {
        self.log.retain(|s| s.branch != branch);
        self.latest.retain(|(b, _), _| b != branch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{AtomId, SiteId};

    fn file(ts: u64, id: &str) -> Atom<AppOp> {
        Atom::new(AtomId::new(ts, &SiteId::new("a"), 0), None, AppOp::file(id))
    }

    #[test]
    fn lamport_observe_then_tick_exceeds_remote() {
        let mut clock = LamportClock::default();
        clock.observe(41);
        assert_eq!(clock.tick(), 42);
        clock.observe(3);
        assert_eq!(clock.now(), 42);
    }

    #[test]
    fn stage_writes_are_deduplicated() {
        let mut stage = MemoryStageStore::new();
        let a = file(1, "e1");
        stage.add_atoms("main", &[a.clone(), a.clone()]).unwrap();
        stage.remove_atoms("main", &[a.hash(), a.hash()]).unwrap();
        assert_eq!(stage.log_len("main"), 2);

        let diff = stage.get_stage("main").unwrap();
        assert!(diff.additions.is_empty());
        assert!(diff.deletions.contains(&a.hash()));

        stage.clear_stage("main").unwrap();
        assert!(stage.get_stage("main").unwrap().is_empty());
        stage.add_atoms("main", &[a]).unwrap();
        assert_eq!(stage.log_len("main"), 1);
    }

    #[test]
    fn re_added_atom_is_staged_again() {
        let mut stage = MemoryStageStore::new();
        let a = file(1, "e1");
        stage.add_atoms("main", &[a.clone()]).unwrap();
        stage.remove_atoms("main", &[a.hash()]).unwrap();
        stage.add_atoms("main", &[a.clone()]).unwrap();
        stage.add_atoms("main", &[a.clone()]).unwrap();
        assert_eq!(stage.log_len("main"), 3);

        let diff = stage.get_stage("main").unwrap();
        assert_eq!(diff.additions, vec![a]);
        assert!(diff.deletions.is_empty());
    }

    #[test]
    fn objects_are_scoped_by_head() {
        let mut store = MemoryObjectStore::new();
        let a = file(1, "e1");
        store
            .store_objects("main", &[CausalRepoObject::Atom(a.clone())])
            .unwrap();
        store
            .store_objects("main", &[CausalRepoObject::Atom(a.clone())])
            .unwrap();
        assert_eq!(store.object_count(), 1);
        assert_eq!(store.get_objects("main", &[a.hash()]).unwrap().len(), 1);
        assert!(store.get_objects("other", &[a.hash()]).unwrap().is_empty());
        assert!(store.get_object(&a.hash()).unwrap().is_some());
    }

    #[test]
    fn branches_filter_by_prefix() {
        let mut store: MemoryObjectStore<AppOp> = MemoryObjectStore::new();
        let hash = file(1, "e1").hash();
        for name in ["docs/a", "docs/b", "notes"] {
            store.save_branch(&CausalRepoBranch::new(name, hash, 1)).unwrap();
        }
        let docs = store.get_branches(Some("docs/")).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(store.get_branches(None).unwrap().len(), 3);
        store.delete_branch("notes").unwrap();
        assert!(store.get_branch("notes").unwrap().is_none());
    }
}
