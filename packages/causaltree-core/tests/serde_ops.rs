#![cfg(feature = "serde")]

use causaltree_core::{AppOp, Atom, CausalRepoObject, StageChange, Value};
use causaltree_test_support::SiteBuilder;

#[test]
fn op_serializes_as_tagged_map() {
    let json = serde_json::to_value(AppOp::insert(2, "hi")).unwrap();
    assert_eq!(json, serde_json::json!({"type": "insert", "index": 2, "text": "hi"}));
    let back: AppOp = serde_json::from_value(json).unwrap();
    assert_eq!(back, AppOp::insert(2, "hi"));

    let tombstone = serde_json::to_value(AppOp::tombstone()).unwrap();
    assert_eq!(tombstone, serde_json::json!({"type": "delete"}));
}

#[test]
fn unknown_kind_keeps_a_valid_checksum() {
    let mut b = SiteBuilder::new("a");
    let file = b.file("e1");
    let future = b.atom(
        Some(&file),
        AppOp::from_fields(
            "certificate",
            [("keypair".to_string(), Value::from("abc"))].into_iter().collect(),
        ),
    );
    let json = serde_json::to_string(&future).unwrap();
    let decoded: Atom<AppOp> = serde_json::from_str(&json).unwrap();
    assert!(decoded.is_valid());
    assert_eq!(decoded.op.kind(), "certificate");
}

#[test]
fn tampered_atom_fails_verification() {
    let mut b = SiteBuilder::new("a");
    let file = b.file("e1");
    let mut json = serde_json::to_value(&file).unwrap();
    json["op"]["id"] = serde_json::json!("e2");
    let decoded: Atom<AppOp> = serde_json::from_value(json).unwrap();
    assert!(!decoded.is_valid());
}

#[test]
fn repo_objects_are_tagged() {
    let mut b = SiteBuilder::new("a");
    let file = b.file("e1");
    let object = serde_json::to_value(CausalRepoObject::Atom(file.clone())).unwrap();
    assert_eq!(object["type"], "atom");
    let change = serde_json::to_value(StageChange::<AppOp>::Removed { hash: file.hash() }).unwrap();
    assert_eq!(change["kind"], "removed");
    assert_eq!(change["hash"], file.hash().to_hex());
}
