use causaltree_core::{eval, InsertStatus, PendingLimits, Value, Weave};
use causaltree_test_support::SiteBuilder;

#[test]
fn children_before_parent_are_buffered_then_released() {
    let mut a = SiteBuilder::new("a");
    let file = a.file("e1");
    let tag = a.tag(&file, "n");
    let value = a.value(&tag, "x");

    let mut weave = Weave::new();
    assert_eq!(weave.insert(value.clone()).unwrap().status, InsertStatus::Pending);
    assert_eq!(weave.insert(tag.clone()).unwrap().status, InsertStatus::Pending);
    assert!(weave.is_empty());
    assert_eq!(weave.pending_len(), 2);

    let report = weave.insert(file.clone()).unwrap();
    assert_eq!(report.status, InsertStatus::Inserted);
    assert_eq!(report.applied, vec![file.clone(), tag.clone(), value.clone()]);
    assert_eq!(weave.pending_len(), 0);
    weave.validate().unwrap();
    assert_eq!(eval(&weave)["e1"].tag("n"), Some(&Value::from("x")));
}

#[test]
fn buffered_duplicate_is_reported_once() {
    let mut a = SiteBuilder::new("a");
    let file = a.file("e1");
    let tag = a.tag(&file, "n");

    let mut weave = Weave::new();
    weave.insert(tag.clone()).unwrap();
    assert_eq!(weave.insert(tag.clone()).unwrap().status, InsertStatus::Duplicate);
    assert_eq!(weave.pending_len(), 1);
}

#[test]
fn pending_buffer_evicts_oldest_past_limit() {
    let mut a = SiteBuilder::new("a");
    let missing = a.file("e1");
    let tags: Vec<_> = (0..4).map(|i| a.tag(&missing, &format!("t{i}"))).collect();

    let mut weave = Weave::with_limits(PendingLimits { max_atoms: 2 });
    let mut evicted = Vec::new();
    for tag in &tags {
        evicted.extend(weave.insert(tag.clone()).unwrap().evicted);
    }
    assert_eq!(evicted, vec![tags[0].clone(), tags[1].clone()]);

    let report = weave.insert(missing.clone()).unwrap();
    assert_eq!(report.applied.len(), 3);
    assert!(!weave.contains(&tags[0].id));
}

#[test]
fn expired_pending_atoms_are_dropped() {
    let mut a = SiteBuilder::new("a");
    let missing = a.file("e1");
    let early = a.tag(&missing, "early");
    let late = a.tag(&missing, "late");

    let mut weave = Weave::new();
    weave.insert_at(early.clone(), 100).unwrap();
    weave.insert_at(late.clone(), 200).unwrap();
    assert_eq!(weave.expire_pending(150), vec![early]);
    assert_eq!(weave.pending_len(), 1);

    weave.insert_at(missing, 300).unwrap();
    assert_eq!(weave.len(), 2);
    assert!(weave.contains(&late.id));
}
