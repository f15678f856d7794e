//! Reduction of an `AppOp` weave into application state.
//!
//! Conflict resolution relies entirely on weave order: siblings arrive newest and
//! highest-priority first, so "first one wins" is last-writer-wins without ever
//! comparing timestamps here.

use std::collections::{BTreeMap, HashSet};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::atom::Atom;
use crate::diff::{diff, StateDiff};
use crate::ids::AtomId;
use crate::ops::{AppOp, Value};
use crate::traverser::WeaveTraverser;
use crate::weave::Weave;

/// Reduced entity: its live tags.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Entity {
    pub tags: BTreeMap<String, Value>,
}

impl Entity {
    pub fn tag(&self, name: &str) -> Option<&Value> {
        self.tags.get(name)
    }
}

/// Reduced application state keyed by entity id.
pub type State = BTreeMap<String, Entity>;

/// Reduce a weave to application state in a single forward pass.
pub fn eval(weave: &Weave<AppOp>) -> State {
    let mut state = State::new();
    let mut t = weave.traverser();
    while let Some(atom) = t.next(None) {
        if let AppOp::File { id } = &atom.op {
            if !state.contains_key(id) {
                if let Some(entity) = reduce_entity(&mut t, atom) {
                    state.insert(id.clone(), entity);
                }
            }
        }
        t.skip(&atom.id);
    }
    state
}

fn reduce_entity(t: &mut WeaveTraverser<'_, AppOp>, file: &Atom<AppOp>) -> Option<Entity> {
    if has_child(t.fork(), &file.id, |op| matches!(op, AppOp::Delete { .. })) {
        return None;
    }

    let mut entity = Entity::default();
    let mut seen = HashSet::new();
    while let Some(child) = t.next(Some(&file.id)) {
        if let AppOp::Tag { name } = &child.op {
            if !seen.contains(name) && !has_child(t.fork(), &child.id, AppOp::is_tombstone) {
                seen.insert(name.clone());
                if let Some(value) = reduce_tag(t, child) {
                    entity.tags.insert(name.clone(), value);
                }
            }
        }
        t.skip(&child.id);
    }
    Some(entity)
}

fn reduce_tag(t: &mut WeaveTraverser<'_, AppOp>, tag: &Atom<AppOp>) -> Option<Value> {
    let mut result = None;
    while let Some(child) = t.next(Some(&tag.id)) {
        if result.is_none() {
            if let AppOp::Value { value } = &child.op {
                if !has_child(t.fork(), &child.id, AppOp::is_tombstone) {
                    result = Some(match value {
                        Value::Text(base) => Value::Text(eval_sequence(t, &child.id, base)),
                        other => other.clone(),
                    });
                }
            }
        }
        t.skip(&child.id);
    }
    result
}

/// Whether any direct child of `parent` satisfies `pred`. Runs on a forked cursor.
fn has_child(
    mut t: WeaveTraverser<'_, AppOp>,
    parent: &AtomId,
    pred: impl Fn(&AppOp) -> bool,
) -> bool {
    while let Some(child) = t.next(Some(parent)) {
        if pred(&child.op) {
            return true;
        }
        t.skip(&child.id);
    }
    false
}

/// Rebuild text from `base` plus the nested `Insert`/`Delete` children of `parent`.
///
/// Positions in child ops refer to `base`. Each applied child records `(index, delta)`
/// so later children can shift their position: deletes sum deltas at positions
/// `<= start`, inserts sum deltas at positions `< index`. That boundary asymmetry
/// decides how concurrent edits at the same index interleave.
pub fn eval_sequence(t: &mut WeaveTraverser<'_, AppOp>, parent: &AtomId, base: &str) -> String {
    let mut text: Vec<char> = base.chars().collect();
    let base_len = text.len() as u64;
    let mut edits: Vec<(u64, i64)> = Vec::new();

    while let Some(child) = t.next(Some(parent)) {
        match &child.op {
            AppOp::Insert {
                index,
                text: inserted,
            } => {
                let content: Vec<char> = eval_sequence(t, &child.id, inserted).chars().collect();
                let offset = offset_of(&edits, |pos| pos < *index);
                let at = clamp(*index as i64 + offset, text.len());
                let inserted_len = content.len() as i64;
                let tail = text.split_off(at);
                text.extend(content);
                text.extend(tail);
                edits.push((*index, inserted_len));
            }
            AppOp::Delete { start, end } => {
                let start = start.unwrap_or(0);
                let end = end.unwrap_or(base_len);
                if end >= start {
                    let offset = offset_of(&edits, |pos| pos <= start);
                    let at = clamp(start as i64 + offset, text.len());
                    let count = clamp((end - start) as i64 + offset, text.len() - at);
                    text.drain(at..at + count);
                    edits.push((start, -(count as i64)));
                }
            }
            _ => {}
        }
        t.skip(&child.id);
    }

    text.into_iter().collect()
}

fn offset_of(edits: &[(u64, i64)], include: impl Fn(u64) -> bool) -> i64 {
    edits
        .iter()
        .filter(|(pos, _)| include(*pos))
        .map(|(_, delta)| *delta)
        .sum()
}

fn clamp(value: i64, max: usize) -> usize {
    value.clamp(0, max as i64) as usize
}

/// Keeps the last reduced state so each `apply` yields the diff consumers need.
#[derive(Clone, Debug, Default)]
pub struct Reducer {
    state: State,
}

impl Reducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// Re-evaluate `weave` and return the change relative to the previous call.
    pub fn apply(&mut self, weave: &Weave<AppOp>) -> StateDiff {
        let next = eval(weave);
        let changes = diff(&self.state, &next);
        self.state = next;
        changes
    }
}
