use causaltree_core::{
    apply_stage, commit, eval, load_branch, AppOp, MemoryObjectStore, MemoryStageStore,
    StageStore, Weave,
};
use causaltree_test_support::SiteBuilder;

#[test]
fn removed_atom_is_excluded_from_replayed_stage() {
    let mut b = SiteBuilder::new("a");
    let a1 = b.file("e1");
    let a2 = b.file("e2");

    let mut stage: MemoryStageStore<AppOp> = MemoryStageStore::new();
    stage.add_atoms("main", &[a1.clone(), a2.clone()]).unwrap();
    stage.remove_atoms("main", &[a1.hash()]).unwrap();

    let diff = stage.get_stage("main").unwrap();
    assert_eq!(diff.additions, vec![a2.clone()]);
    assert_eq!(diff.deletions.len(), 1);
    assert!(diff.deletions.contains(&a1.hash()));

    let replayed = Weave::from_atoms(apply_stage(Vec::new(), &diff)).unwrap();
    let only_a2 = Weave::from_atoms([a2]).unwrap();
    assert_eq!(eval(&replayed), eval(&only_a2));
}

#[test]
fn loaded_branch_matches_live_state_after_commit_and_more_edits() {
    let mut b = SiteBuilder::new("a");
    let file = b.file("e1");
    let tag = b.tag(&file, "n");
    let value = b.value(&tag, "x");

    let mut store = MemoryObjectStore::new();
    let mut stage = MemoryStageStore::new();
    let mut live = Weave::new();
    for atom in [&file, &tag, &value] {
        live.insert(atom.clone()).unwrap();
        stage.add_atoms("main", &[atom.clone()]).unwrap();
    }
    commit(&mut store, &mut stage, "main", &live, "first", 1_000).unwrap();

    let newer = b.value(&tag, "y");
    live.insert(newer.clone()).unwrap();
    stage.add_atoms("main", &[newer]).unwrap();

    let loaded = load_branch(&store, &stage, "main").unwrap();
    assert_eq!(loaded.weave.atoms(), live.atoms());
    assert_eq!(eval(&loaded.weave), eval(&live));
}

#[test]
fn re_added_atom_survives_reload() {
    let mut b = SiteBuilder::new("a");
    let file = b.file("e1");
    let tag = b.tag(&file, "n");

    let store: MemoryObjectStore<AppOp> = MemoryObjectStore::new();
    let mut stage = MemoryStageStore::new();
    let mut live = Weave::new();
    for atom in [&file, &tag] {
        live.insert(atom.clone()).unwrap();
    }
    stage.add_atoms("main", &[file.clone(), tag.clone()]).unwrap();

    let removed = live.remove(&tag.id).unwrap();
    stage
        .remove_atoms("main", &removed.iter().map(|a| a.hash()).collect::<Vec<_>>())
        .unwrap();
    live.insert(tag.clone()).unwrap();
    stage.add_atoms("main", &[tag]).unwrap();

    let loaded = load_branch(&store, &stage, "main").unwrap();
    assert_eq!(loaded.weave.atoms(), live.atoms());
}
