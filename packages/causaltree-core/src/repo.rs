//! Branch persistence on top of [`ObjectStore`] and [`StageStore`].
//!
//! A branch head points at a commit; edits made since that commit live in the stage
//! log until the next [`commit`] folds them in.

use crate::atom::{Atom, ContentHash};
use crate::error::{Error, Result};
use crate::objects::{CausalRepoBranch, CausalRepoCommit, CausalRepoObject, StageDiff};
use crate::ops::AtomOp;
use crate::traits::{ObjectStore, StageStore};
use crate::weave::Weave;

/// A branch rebuilt from storage.
#[derive(Clone, Debug)]
pub struct LoadedBranch<Op> {
    /// `None` when the branch has never been committed.
    pub branch: Option<CausalRepoBranch>,
    pub commit: Option<CausalRepoCommit>,
    pub weave: Weave<Op>,
}

/// `committed ∪ additions − deletions`, de-duplicated by hash.
pub fn apply_stage<Op: Clone>(
    committed: impl IntoIterator<Item = Atom<Op>>,
    diff: &StageDiff<Op>,
) -> Vec<Atom<Op>> {
    diff.apply_to(committed)
}

/// Load the atoms of the branch's head commit plus its stage into a fresh weave.
pub fn load_branch<Op, O, S>(store: &O, stage: &S, name: &str) -> Result<LoadedBranch<Op>>
where
    Op: AtomOp,
    O: ObjectStore<Op> + ?Sized,
    S: StageStore<Op> + ?Sized,
{
    let branch = store.get_branch(name)?;
    let (commit, committed) = match &branch {
        Some(branch) => {
            let commit = load_commit(store, &branch.hash)?;
            let atoms = store
                .get_objects(name, &commit.atoms)?
                .into_iter()
                .filter_map(|object| match object {
                    CausalRepoObject::Atom(atom) => Some(atom),
                    CausalRepoObject::Commit(_) => None,
                })
                .collect::<Vec<_>>();
            if atoms.len() != commit.atoms.len() {
                return Err(Error::Storage(format!(
                    "commit {} lists {} atoms but only {} are stored",
                    commit.hash,
                    commit.atoms.len(),
                    atoms.len()
                )));
            }
            (Some(commit), atoms)
        }
        None => (None, Vec::new()),
    };

    let diff = stage.get_stage(name)?;
    let mut atoms = apply_stage(committed, &diff);
    // Lamport timestamps put causes ahead of their effects.
    atoms.sort_by_key(|atom| atom.id.timestamp);
    let weave = Weave::from_atoms(atoms)?;

    Ok(LoadedBranch {
        branch,
        commit,
        weave,
    })
}

/// Store every atom of `weave` and a commit listing them, advance the branch head,
/// then clear the branch's stage.
pub fn commit<Op, O, S>(
    store: &mut O,
    stage: &mut S,
    name: &str,
    weave: &Weave<Op>,
    message: &str,
    time: u64,
) -> Result<CausalRepoCommit>
where
    Op: Clone,
    O: ObjectStore<Op> + ?Sized,
    S: StageStore<Op> + ?Sized,
{
    let previous = store.get_branch(name)?.map(|b| b.hash);
    let commit = CausalRepoCommit::new(
        message,
        time,
        previous,
        weave.atoms().iter().map(Atom::hash),
    );

    let mut objects: Vec<CausalRepoObject<Op>> = weave
        .atoms()
        .iter()
        .cloned()
        .map(CausalRepoObject::Atom)
        .collect();
    objects.push(CausalRepoObject::Commit(commit.clone()));
    store.store_objects(name, &objects)?;
    store.save_branch(&CausalRepoBranch::new(name, commit.hash, time))?;
    stage.clear_stage(name)?;
    Ok(commit)
}

/// Commits reachable from `head` through `previous_commit`, newest first.
pub fn history<Op, O>(store: &O, head: &ContentHash) -> Result<Vec<CausalRepoCommit>>
where
    O: ObjectStore<Op> + ?Sized,
{
    let mut out: Vec<CausalRepoCommit> = Vec::new();
    let mut next = Some(*head);
    while let Some(hash) = next {
        if out.iter().any(|c| c.hash == hash) {
            return Err(Error::InconsistentState(format!(
                "commit history loops back to {hash}"
            )));
        }
        let commit = load_commit(store, &hash)?;
        next = commit.previous_commit;
        out.push(commit);
    }
    Ok(out)
}

fn load_commit<Op, O>(store: &O, hash: &ContentHash) -> Result<CausalRepoCommit>
where
    O: ObjectStore<Op> + ?Sized,
{
    match store.get_object(hash)? {
        Some(CausalRepoObject::Commit(commit)) => {
            commit.verify()?;
            Ok(commit)
        }
        Some(other) => Err(Error::InconsistentState(format!(
            "object {hash} is a {}, expected a commit",
            other.kind()
        ))),
        None => Err(Error::Storage(format!("commit {hash} not found"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{AtomId, SiteId};
    use crate::ops::AppOp;
    use crate::traits::{MemoryObjectStore, MemoryStageStore};

    fn atom(ts: u64, cause: Option<&Atom<AppOp>>, op: AppOp) -> Atom<AppOp> {
        Atom::new(
            AtomId::new(ts, &SiteId::new("a"), 0),
            cause.map(|c| c.id.clone()),
            op,
        )
    }

    #[test]
    fn empty_branch_loads_empty_weave() {
        let store: MemoryObjectStore<AppOp> = MemoryObjectStore::new();
        let stage = MemoryStageStore::new();
        let loaded = load_branch(&store, &stage, "main").unwrap();
        assert!(loaded.branch.is_none());
        assert!(loaded.commit.is_none());
        assert!(loaded.weave.is_empty());
    }

    #[test]
    fn commit_then_load_round_trips_weave() {
        let mut store = MemoryObjectStore::new();
        let mut stage = MemoryStageStore::new();
        let file = atom(1, None, AppOp::file("e1"));
        let tag = atom(2, Some(&file), AppOp::tag("name"));
        let value = atom(3, Some(&tag), AppOp::value("x"));
        let weave = Weave::from_atoms([file.clone(), tag.clone(), value.clone()]).unwrap();
        stage.add_atoms("main", weave.atoms()).unwrap();

        let first = commit(&mut store, &mut stage, "main", &weave, "init", 100).unwrap();
        assert!(stage.get_stage("main").unwrap().is_empty());

        let loaded = load_branch(&store, &stage, "main").unwrap();
        assert_eq!(loaded.commit.as_ref(), Some(&first));
        assert_eq!(loaded.weave.atoms(), weave.atoms());
    }

    #[test]
    fn stage_is_replayed_over_last_commit() {
        let mut store = MemoryObjectStore::new();
        let mut stage = MemoryStageStore::new();
        let file = atom(1, None, AppOp::file("e1"));
        let tag = atom(2, Some(&file), AppOp::tag("name"));
        let weave = Weave::from_atoms([file.clone(), tag.clone()]).unwrap();
        commit(&mut store, &mut stage, "main", &weave, "init", 100).unwrap();

        let other = atom(3, Some(&file), AppOp::tag("other"));
        stage.add_atoms("main", &[other.clone()]).unwrap();
        stage.remove_atoms("main", &[tag.hash()]).unwrap();

        let loaded = load_branch(&store, &stage, "main").unwrap();
        let ids: Vec<_> = loaded.weave.atoms().iter().map(|a| a.id.clone()).collect();
        assert_eq!(ids, vec![file.id, other.id]);
    }

    #[test]
    fn history_walks_newest_first() {
        let mut store = MemoryObjectStore::new();
        let mut stage = MemoryStageStore::new();
        let file = atom(1, None, AppOp::file("e1"));
        let mut weave = Weave::from_atoms([file.clone()]).unwrap();
        let first = commit(&mut store, &mut stage, "main", &weave, "one", 100).unwrap();
        weave.insert(atom(2, Some(&file), AppOp::tag("t"))).unwrap();
        let second = commit(&mut store, &mut stage, "main", &weave, "two", 200).unwrap();
        assert_eq!(second.previous_commit, Some(first.hash));

        let head = store.get_branch("main").unwrap().unwrap().hash;
        let messages: Vec<_> = history(&store, &head)
            .unwrap()
            .into_iter()
            .map(|c| c.message)
            .collect();
        assert_eq!(messages, vec!["two", "one"]);
    }

    #[test]
    fn history_of_non_commit_is_an_error() {
        let mut store = MemoryObjectStore::new();
        let file = atom(1, None, AppOp::file("e1"));
        store
            .store_objects("main", &[CausalRepoObject::Atom(file.clone())])
            .unwrap();
        assert!(matches!(
            history(&store, &file.hash()),
            Err(Error::InconsistentState(_))
        ));
    }
}
