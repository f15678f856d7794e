use std::collections::{BTreeMap, BTreeSet};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::ops::Value;
use crate::reducer::{Entity, State};

/// Change between two reduced states, shaped for downstream consumers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StateDiff {
    pub added: BTreeMap<String, Entity>,
    /// Per entity, tags that changed: `Some(value)` for new or updated tags, `None`
    /// for removed ones.
    pub updated: BTreeMap<String, BTreeMap<String, Option<Value>>>,
    pub removed: BTreeSet<String>,
}

impl StateDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

pub fn diff(prev: &State, next: &State) -> StateDiff {
    let mut out = StateDiff::default();

    for (id, entity) in next {
        match prev.get(id) {
            None => {
                out.added.insert(id.clone(), entity.clone());
            }
            Some(old) if old != entity => {
                out.updated.insert(id.clone(), diff_tags(old, entity));
            }
            Some(_) => {}
        }
    }
    for id in prev.keys() {
        if !next.contains_key(id) {
            out.removed.insert(id.clone());
        }
    }

    out
}

fn diff_tags(old: &Entity, new: &Entity) -> BTreeMap<String, Option<Value>> {
    let mut changes = BTreeMap::new();
    for (name, value) in &new.tags {
        if old.tags.get(name) != Some(value) {
            changes.insert(name.clone(), Some(value.clone()));
        }
    }
    for name in old.tags.keys() {
        if !new.tags.contains_key(name) {
            changes.insert(name.clone(), None);
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(tags: &[(&str, &str)]) -> Entity {
        Entity {
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), Value::from(*v)))
                .collect(),
        }
    }

    #[test]
    fn classifies_added_updated_removed() {
        let mut prev = State::new();
        prev.insert("keep".into(), entity(&[("a", "1")]));
        prev.insert("change".into(), entity(&[("a", "1"), ("b", "2")]));
        prev.insert("gone".into(), entity(&[]));

        let mut next = State::new();
        next.insert("keep".into(), entity(&[("a", "1")]));
        next.insert("change".into(), entity(&[("a", "9")]));
        next.insert("new".into(), entity(&[("x", "y")]));

        let d = diff(&prev, &next);
        assert_eq!(d.added.keys().collect::<Vec<_>>(), vec!["new"]);
        assert_eq!(d.removed.iter().collect::<Vec<_>>(), vec!["gone"]);
        let change = &d.updated["change"];
        assert_eq!(change["a"], Some(Value::from("9")));
        assert_eq!(change["b"], None);
        assert!(!d.updated.contains_key("keep"));
    }

    #[test]
    fn identical_states_produce_empty_diff() {
        let mut state = State::new();
        state.insert("e".into(), entity(&[("a", "1")]));
        assert!(diff(&state, &state).is_empty());
    }
}
