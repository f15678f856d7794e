//! Fixtures shared by the causal tree test suites: a per-site atom builder, a
//! permutation helper for convergence checks, and conformance suites every
//! `ObjectStore`/`StageStore` backend must pass.

use causaltree_core::{
    AppOp, Atom, AtomId, CausalRepoBranch, CausalRepoCommit, CausalRepoObject, ObjectStore,
    SiteId, StageStore,
};

/// Builds checksummed atoms for one site with a strictly increasing timestamp.
pub struct SiteBuilder {
    site: SiteId,
    clock: u64,
}

impl SiteBuilder {
    pub fn new(site: &str) -> Self {
        Self {
            site: SiteId::new(site),
            clock: 0,
        }
    }

    /// Continue numbering after `timestamp`.
    pub fn starting_at(site: &str, timestamp: u64) -> Self {
        Self {
            site: SiteId::new(site),
            clock: timestamp,
        }
    }

    pub fn site(&self) -> &SiteId {
        &self.site
    }

    /// Advance past a timestamp seen from another site.
    pub fn observe(&mut self, atom: &Atom<AppOp>) {
        self.clock = self.clock.max(atom.id.timestamp);
    }

    pub fn atom(&mut self, cause: Option<&Atom<AppOp>>, op: AppOp) -> Atom<AppOp> {
        self.atom_with_priority(cause, op, 0)
    }

    pub fn atom_with_priority(
        &mut self,
        cause: Option<&Atom<AppOp>>,
        op: AppOp,
        priority: u32,
    ) -> Atom<AppOp> {
        self.clock += 1;
        Atom::new(
            AtomId::new(self.clock, &self.site, priority),
            cause.map(|c| c.id.clone()),
            op,
        )
    }

    pub fn file(&mut self, id: &str) -> Atom<AppOp> {
        self.atom(None, AppOp::file(id))
    }

    pub fn tag(&mut self, file: &Atom<AppOp>, name: &str) -> Atom<AppOp> {
        self.atom(Some(file), AppOp::tag(name))
    }

    pub fn value(&mut self, tag: &Atom<AppOp>, value: &str) -> Atom<AppOp> {
        self.atom(Some(tag), AppOp::value(value))
    }

    pub fn tombstone(&mut self, target: &Atom<AppOp>) -> Atom<AppOp> {
        self.atom(Some(target), AppOp::tombstone())
    }
}

/// Every ordering of `items` (Heap's algorithm).
pub fn permutations<T: Clone>(items: &[T]) -> Vec<Vec<T>> {
    fn heap_permute<T: Clone>(k: usize, items: &mut [T], res: &mut Vec<Vec<T>>) {
        if k <= 1 {
            res.push(items.to_vec());
            return;
        }
        heap_permute(k - 1, items, res);
        for i in 0..(k - 1) {
            if k % 2 == 0 {
                items.swap(i, k - 1);
            } else {
                items.swap(0, k - 1);
            }
            heap_permute(k - 1, items, res);
        }
    }
    let mut out = Vec::new();
    heap_permute(items.len(), &mut items.to_vec(), &mut out);
    out
}

/// Object store behavior shared by every backend.
pub fn object_store_conformance<S: ObjectStore<AppOp>>(mut make: impl FnMut() -> S) {
    let mut b = SiteBuilder::new("conformance");
    let file = b.file("e1");
    let tag = b.tag(&file, "title");
    let commit = CausalRepoCommit::new("init", 1_000, None, [file.hash(), tag.hash()]);

    // upsert is idempotent and scoped by head
    let mut store = make();
    let objects = vec![
        CausalRepoObject::Atom(file.clone()),
        CausalRepoObject::Atom(tag.clone()),
        CausalRepoObject::Commit(commit.clone()),
    ];
    store.store_objects("main", &objects).unwrap();
    store.store_objects("main", &objects).unwrap();
    assert_eq!(
        store.get_object(&file.hash()).unwrap(),
        Some(CausalRepoObject::Atom(file.clone()))
    );
    assert_eq!(
        store.get_object(&commit.hash).unwrap(),
        Some(CausalRepoObject::Commit(commit.clone()))
    );
    let fetched = store
        .get_objects("main", &[tag.hash(), commit.hash, file.hash()])
        .unwrap();
    assert_eq!(
        fetched.iter().map(|o| o.hash()).collect::<Vec<_>>(),
        vec![tag.hash(), commit.hash, file.hash()]
    );
    assert!(store
        .get_objects("other", &[file.hash()])
        .unwrap()
        .is_empty());

    // unknown hashes are skipped
    let unknown = b.file("missing").hash();
    assert!(store.get_object(&unknown).unwrap().is_none());
    assert_eq!(
        store
            .get_objects("main", &[unknown, file.hash()])
            .unwrap()
            .len(),
        1
    );

    // branches
    let mut store = make();
    assert!(store.get_branch("docs/a").unwrap().is_none());
    for name in ["docs/b", "docs/a", "notes"] {
        store
            .save_branch(&CausalRepoBranch::new(name, commit.hash, 5))
            .unwrap();
    }
    let moved = CausalRepoBranch::new("docs/a", file.hash(), 9);
    store.save_branch(&moved).unwrap();
    assert_eq!(store.get_branch("docs/a").unwrap(), Some(moved));
    let names: Vec<_> = store
        .get_branches(Some("docs/"))
        .unwrap()
        .into_iter()
        .map(|b| b.name)
        .collect();
    assert_eq!(names, vec!["docs/a", "docs/b"]);
    assert_eq!(store.get_branches(None).unwrap().len(), 3);
    store.delete_branch("notes").unwrap();
    store.delete_branch("notes").unwrap();
    assert!(store.get_branch("notes").unwrap().is_none());
}

/// Stage store behavior shared by every backend.
pub fn stage_store_conformance<S: StageStore<AppOp>>(mut make: impl FnMut() -> S) {
    let mut b = SiteBuilder::new("conformance");
    let file = b.file("e1");
    let tag = b.tag(&file, "title");
    let value = b.value(&tag, "hello");

    let mut stage = make();
    assert!(stage.get_stage("main").unwrap().is_empty());
    stage
        .add_atoms("main", &[file.clone(), tag.clone()])
        .unwrap();
    stage
        .add_atoms("main", &[tag.clone(), value.clone()])
        .unwrap();
    stage.remove_atoms("main", &[value.hash()]).unwrap();
    stage.remove_atoms("main", &[value.hash()]).unwrap();
    stage.add_atoms("other", &[file.clone()]).unwrap();

    let diff = stage.get_stage("main").unwrap();
    assert_eq!(diff.additions, vec![file.clone(), tag.clone()]);
    assert_eq!(diff.deletions.len(), 1);
    assert!(diff.deletions.contains(&value.hash()));
    assert_eq!(diff.apply_to(Vec::new()), vec![file.clone(), tag.clone()]);

    stage.clear_stage("main").unwrap();
    assert!(stage.get_stage("main").unwrap().is_empty());
    assert_eq!(stage.get_stage("other").unwrap().additions, vec![file.clone()]);

    // cleared changes may be staged again
    stage.add_atoms("main", &[value.clone()]).unwrap();
    assert_eq!(stage.get_stage("main").unwrap().additions, vec![value.clone()]);

    // a re-add after a removal wins over it
    stage.remove_atoms("main", &[value.hash()]).unwrap();
    stage.add_atoms("main", &[value.clone()]).unwrap();
    stage.add_atoms("main", &[value.clone()]).unwrap();
    let diff = stage.get_stage("main").unwrap();
    assert_eq!(diff.additions, vec![value.clone()]);
    assert!(diff.deletions.is_empty());
    assert_eq!(diff.apply_to(Vec::new()), vec![value]);
}
