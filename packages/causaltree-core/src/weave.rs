use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};

use crate::atom::{Atom, ContentHash};
use crate::error::{Error, Result};
use crate::ids::{cmp_siblings, AtomId};
use crate::ops::AtomOp;
use crate::traverser::WeaveTraverser;

/// Bounds for atoms waiting on a cause that has not arrived yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingLimits {
    pub max_atoms: usize,
}

impl Default for PendingLimits {
    fn default() -> Self {
        Self { max_atoms: 1024 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertStatus {
    /// The atom is now part of the weave.
    Inserted,
    /// The same atom was already present (or already buffered).
    Duplicate,
    /// The atom's cause is unknown; it is buffered until the cause arrives.
    Pending,
}

/// Outcome of a single `insert` call.
#[derive(Clone, Debug)]
pub struct InsertReport<Op> {
    pub status: InsertStatus,
    /// Every atom placed into the weave by this call, in application order. Includes
    /// buffered atoms released because their cause arrived.
    pub applied: Vec<Atom<Op>>,
    /// Buffered atoms dropped because the pending buffer overflowed.
    pub evicted: Vec<Atom<Op>>,
}

impl<Op> InsertReport<Op> {
    fn new(status: InsertStatus) -> Self {
        Self {
            status,
            applied: Vec::new(),
            evicted: Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
struct PendingAtom<Op> {
    atom: Atom<Op>,
    buffered_at: u64,
}

#[derive(Clone, Debug)]
struct Entry {
    cause: Option<AtomId>,
    checksum: ContentHash,
    size: usize,
}

/// Deterministic total order over a set of causally linked atoms.
///
/// Invariant: every atom is immediately followed by the contiguous run of its causal
/// descendants, and siblings are ordered by [`cmp_siblings`]. The array is therefore a
/// pure function of the atom set.
#[derive(Clone, Debug)]
pub struct Weave<Op> {
    atoms: Vec<Atom<Op>>,
    entries: HashMap<AtomId, Entry>,
    pending: VecDeque<PendingAtom<Op>>,
    limits: PendingLimits,
}

impl<Op> Default for Weave<Op> {
    fn default() -> Self {
        Self::with_limits(PendingLimits::default())
    }
}

impl<Op> Weave<Op> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: PendingLimits) -> Self {
        Self {
            atoms: Vec::new(),
            entries: HashMap::new(),
            pending: VecDeque::new(),
            limits,
        }
    }

    pub fn limits(&self) -> PendingLimits {
        self.limits
    }

    /// Takes effect on the next buffered atom.
    pub fn set_limits(&mut self, limits: PendingLimits) {
        self.limits = limits;
    }

    pub fn atoms(&self) -> &[Atom<Op>] {
        &self.atoms
    }

    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    pub fn contains(&self, id: &AtomId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_atoms(&self) -> impl Iterator<Item = &Atom<Op>> {
        self.pending.iter().map(|p| &p.atom)
    }

    /// Length of the subtree rooted at `id`, including the atom itself.
    pub fn get_atom_size(&self, id: &AtomId) -> Option<usize> {
        self.entries.get(id).map(|e| e.size)
    }

    /// Position of `id` in the weave. Linear scan.
    pub fn index_of(&self, id: &AtomId) -> Option<usize> {
        if !self.entries.contains_key(id) {
            return None;
        }
        self.atoms.iter().position(|a| &a.id == id)
    }

    pub fn get(&self, id: &AtomId) -> Option<&Atom<Op>> {
        self.index_of(id).map(|i| &self.atoms[i])
    }

    pub fn find_by_hash(&self, hash: &ContentHash) -> Option<&Atom<Op>> {
        self.atoms.iter().find(|a| &a.checksum == hash)
    }

    /// Direct children of `id`, in weave order.
    pub fn children(&self, id: &AtomId) -> Vec<&Atom<Op>> {
        let Some(start) = self.index_of(id) else {
            return Vec::new();
        };
        let end = start + self.size_at(start);
        self.run(start + 1, end)
    }

    /// Root atoms (no cause), in weave order.
    pub fn roots(&self) -> Vec<&Atom<Op>> {
        self.run(0, self.atoms.len())
    }

    pub fn traverser(&self) -> WeaveTraverser<'_, Op> {
        WeaveTraverser::new(self)
    }

    /// Drop buffered atoms whose arrival time is at or before `cutoff`.
    pub fn expire_pending(&mut self, cutoff: u64) -> Vec<Atom<Op>> {
        let (expired, kept): (VecDeque<_>, VecDeque<_>) = self
            .pending
            .drain(..)
            .partition(|p| p.buffered_at <= cutoff);
        self.pending = kept;
        expired.into_iter().map(|p| p.atom).collect()
    }

    /// Remove an atom together with its entire subtree. Returns the removed atoms in
    /// weave order.
    pub fn remove(&mut self, id: &AtomId) -> Result<Vec<Atom<Op>>> {
        let start = self
            .index_of(id)
            .ok_or_else(|| Error::UnknownAtom(id.clone()))?;
        let size = self.size_at(start);
        let removed: Vec<Atom<Op>> = self.atoms.drain(start..start + size).collect();
        let cause = self.entries.get(id).and_then(|e| e.cause.clone());
        for atom in &removed {
            self.entries.remove(&atom.id);
        }
        self.adjust_ancestors(cause, |size| *size -= removed.len());
        Ok(removed)
    }

    /// Check subtree contiguity, cached subtree sizes and sibling order. Quadratic;
    /// meant for tests and debugging.
    pub fn validate(&self) -> Result<()> {
        if self.entries.len() != self.atoms.len() {
            return Err(Error::InconsistentState(format!(
                "{} atoms but {} index entries",
                self.atoms.len(),
                self.entries.len()
            )));
        }
        let positions: HashMap<&AtomId, usize> = self
            .atoms
            .iter()
            .enumerate()
            .map(|(i, a)| (&a.id, i))
            .collect();
        for (i, atom) in self.atoms.iter().enumerate() {
            let end = i + self.size_at(i);
            if end > self.atoms.len() {
                return Err(Error::InconsistentState(format!(
                    "subtree of {} overruns the weave",
                    atom.id
                )));
            }
            for (j, inner) in self.atoms.iter().enumerate().take(end).skip(i + 1) {
                let parent = inner.cause.as_ref().and_then(|c| positions.get(c));
                if !matches!(parent, Some(&p) if p >= i && p < j) {
                    return Err(Error::InconsistentState(format!(
                        "{} is not a descendant of {}",
                        inner.id, atom.id
                    )));
                }
            }
            let siblings = self.run(i + 1, end);
            for pair in siblings.windows(2) {
                if cmp_siblings(&pair[0].id, &pair[1].id) != Ordering::Less {
                    return Err(Error::InconsistentState(format!(
                        "siblings {} and {} out of order",
                        pair[0].id, pair[1].id
                    )));
                }
            }
        }
        let roots = self.run(0, self.atoms.len());
        if roots.iter().any(|a| a.cause.is_some()) {
            return Err(Error::InconsistentState("caused atom at top level".into()));
        }
        for pair in roots.windows(2) {
            if cmp_siblings(&pair[0].id, &pair[1].id) != Ordering::Less {
                return Err(Error::InconsistentState(format!(
                    "roots {} and {} out of order",
                    pair[0].id, pair[1].id
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn size_at(&self, index: usize) -> usize {
        self.atoms
            .get(index)
            .and_then(|a| self.entries.get(&a.id))
            .map(|e| e.size)
            .unwrap_or(0)
    }

    /// Sibling run between `start` and `end`, jumping over each sibling's subtree.
    fn run(&self, start: usize, end: usize) -> Vec<&Atom<Op>> {
        let mut out = Vec::new();
        let mut j = start;
        while j < end {
            out.push(&self.atoms[j]);
            j += self.size_at(j).max(1);
        }
        out
    }

    fn adjust_ancestors(&mut self, mut cause: Option<AtomId>, f: impl Fn(&mut usize)) {
        while let Some(id) = cause {
            match self.entries.get_mut(&id) {
                Some(entry) => {
                    f(&mut entry.size);
                    cause = entry.cause.clone();
                }
                None => break,
            }
        }
    }
}

impl<Op: AtomOp> Weave<Op> {
    /// Build a weave from an arbitrary sequence of atoms.
    pub fn from_atoms(atoms: impl IntoIterator<Item = Atom<Op>>) -> Result<Self> {
        let mut weave = Self::default();
        for atom in atoms {
            weave.insert(atom)?;
        }
        Ok(weave)
    }

    pub fn insert(&mut self, atom: Atom<Op>) -> Result<InsertReport<Op>> {
        self.insert_at(atom, 0)
    }

    /// Insert an atom, stamping it with `now` if it has to wait for its cause.
    pub fn insert_at(&mut self, atom: Atom<Op>, now: u64) -> Result<InsertReport<Op>> {
        atom.verify()?;

        if let Some(entry) = self.entries.get(&atom.id) {
            return if entry.checksum == atom.checksum {
                Ok(InsertReport::new(InsertStatus::Duplicate))
            } else {
                Err(Error::ConflictingAtom(atom.id))
            };
        }
        if let Some(waiting) = self.pending.iter().find(|p| p.atom.id == atom.id) {
            return if waiting.atom.checksum == atom.checksum {
                Ok(InsertReport::new(InsertStatus::Duplicate))
            } else {
                Err(Error::ConflictingAtom(atom.id))
            };
        }

        let cause_missing = match &atom.cause {
            Some(cause) if cause == &atom.id => {
                return Err(Error::InvalidOperation(format!(
                    "atom {} cannot be its own cause",
                    atom.id
                )));
            }
            Some(cause) => !self.entries.contains_key(cause),
            None => false,
        };
        if cause_missing {
            let mut report = InsertReport::new(InsertStatus::Pending);
            self.pending.push_back(PendingAtom {
                atom,
                buffered_at: now,
            });
            while self.pending.len() > self.limits.max_atoms {
                if let Some(oldest) = self.pending.pop_front() {
                    report.evicted.push(oldest.atom);
                }
            }
            return Ok(report);
        }

        let mut report = InsertReport::new(InsertStatus::Inserted);
        let mut released = VecDeque::new();
        released.push_back(atom.id.clone());
        self.place(atom.clone());
        report.applied.push(atom);

        while let Some(cause) = released.pop_front() {
            let mut idx = 0;
            while idx < self.pending.len() {
                if self.pending[idx].atom.cause.as_ref() != Some(&cause) {
                    idx += 1;
                    continue;
                }
                let Some(waiting) = self.pending.remove(idx) else {
                    break;
                };
                if self.entries.contains_key(&waiting.atom.id) {
                    continue;
                }
                released.push_back(waiting.atom.id.clone());
                self.place(waiting.atom.clone());
                report.applied.push(waiting.atom);
            }
        }

        Ok(report)
    }

    fn place(&mut self, atom: Atom<Op>) {
        let pos = match &atom.cause {
            None => self.slot_in_run(0, self.atoms.len(), &atom.id),
            Some(cause) => {
                // `insert_at` guarantees the cause is known.
                let parent = self.index_of(cause).unwrap_or(self.atoms.len());
                let end = parent + self.size_at(parent);
                self.slot_in_run(parent + 1, end, &atom.id)
            }
        };
        let cause = atom.cause.clone();
        self.entries.insert(
            atom.id.clone(),
            Entry {
                cause: cause.clone(),
                checksum: atom.checksum,
                size: 1,
            },
        );
        self.atoms.insert(pos, atom);
        self.adjust_ancestors(cause, |size| *size += 1);
    }

    /// Scan direct siblings in `[start, end)` and return the slot for `id`.
    fn slot_in_run(&self, start: usize, end: usize, id: &AtomId) -> usize {
        let mut j = start;
        while j < end {
            let sibling = &self.atoms[j];
            if cmp_siblings(id, &sibling.id) == Ordering::Less {
                return j;
            }
            j += self.size_at(j).max(1);
        }
        end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SiteId;
    use crate::ops::AppOp;

    fn atom(site: &SiteId, ts: u64, cause: Option<&Atom<AppOp>>, op: AppOp) -> Atom<AppOp> {
        Atom::new(AtomId::new(ts, site, 0), cause.map(|c| c.id.clone()), op)
    }

    #[test]
    fn children_follow_their_cause_newest_first() {
        let site = SiteId::new(b"a");
        let root = atom(&site, 1, None, AppOp::file("e1"));
        let older = atom(&site, 2, Some(&root), AppOp::tag("a"));
        let newer = atom(&site, 3, Some(&root), AppOp::tag("b"));
        let grandchild = atom(&site, 4, Some(&older), AppOp::value("x"));

        let mut weave = Weave::new();
        for a in [root.clone(), older.clone(), newer.clone(), grandchild.clone()] {
            weave.insert(a).unwrap();
        }

        let ids: Vec<_> = weave.atoms().iter().map(|a| a.id.timestamp).collect();
        assert_eq!(ids, vec![1, 3, 2, 4]);
        assert_eq!(weave.get_atom_size(&root.id), Some(4));
        assert_eq!(weave.get_atom_size(&older.id), Some(2));
        assert_eq!(weave.get_atom_size(&newer.id), Some(1));
    }

    #[test]
    fn buffered_atoms_release_transitively() {
        let site = SiteId::new(b"a");
        let root = atom(&site, 1, None, AppOp::file("e1"));
        let tag = atom(&site, 2, Some(&root), AppOp::tag("n"));
        let value = atom(&site, 3, Some(&tag), AppOp::value("x"));

        let mut weave = Weave::new();
        assert_eq!(weave.insert(value.clone()).unwrap().status, InsertStatus::Pending);
        assert_eq!(weave.insert(tag.clone()).unwrap().status, InsertStatus::Pending);
        assert_eq!(weave.pending_len(), 2);

        let report = weave.insert(root.clone()).unwrap();
        assert_eq!(report.status, InsertStatus::Inserted);
        assert_eq!(report.applied, vec![root, tag, value]);
        assert_eq!(weave.pending_len(), 0);
        assert_eq!(weave.len(), 3);
    }

    #[test]
    fn pending_overflow_evicts_oldest() {
        let site = SiteId::new(b"a");
        let missing = atom(&site, 1, None, AppOp::file("e1"));
        let mut weave = Weave::with_limits(PendingLimits { max_atoms: 2 });

        let first = atom(&site, 2, Some(&missing), AppOp::tag("a"));
        let second = atom(&site, 3, Some(&missing), AppOp::tag("b"));
        let third = atom(&site, 4, Some(&missing), AppOp::tag("c"));
        weave.insert(first.clone()).unwrap();
        weave.insert(second).unwrap();
        let report = weave.insert(third).unwrap();
        assert_eq!(report.evicted, vec![first]);
        assert_eq!(weave.pending_len(), 2);
    }

    #[test]
    fn expire_pending_drops_old_entries() {
        let site = SiteId::new(b"a");
        let missing = atom(&site, 1, None, AppOp::file("e1"));
        let early = atom(&site, 2, Some(&missing), AppOp::tag("a"));
        let late = atom(&site, 3, Some(&missing), AppOp::tag("b"));

        let mut weave = Weave::new();
        weave.insert_at(early.clone(), 100).unwrap();
        weave.insert_at(late, 500).unwrap();

        assert_eq!(weave.expire_pending(200), vec![early]);
        assert_eq!(weave.pending_len(), 1);
    }

    #[test]
    fn conflicting_content_for_same_id_is_rejected() {
        let site = SiteId::new(b"a");
        let first = atom(&site, 1, None, AppOp::file("e1"));
        let forged = atom(&site, 1, None, AppOp::file("e2"));

        let mut weave = Weave::new();
        weave.insert(first).unwrap();
        assert!(matches!(weave.insert(forged), Err(Error::ConflictingAtom(_))));
    }

    #[test]
    fn remove_drops_whole_subtree_and_updates_sizes() {
        let site = SiteId::new(b"a");
        let root = atom(&site, 1, None, AppOp::file("e1"));
        let tag = atom(&site, 2, Some(&root), AppOp::tag("n"));
        let value = atom(&site, 3, Some(&tag), AppOp::value("x"));
        let other = atom(&site, 4, Some(&root), AppOp::tag("m"));

        let mut weave = Weave::from_atoms([root.clone(), tag.clone(), value.clone(), other]).unwrap();
        let removed = weave.remove(&tag.id).unwrap();
        assert_eq!(removed, vec![tag.clone(), value.clone()]);
        assert_eq!(weave.get_atom_size(&root.id), Some(2));
        assert!(!weave.contains(&value.id));
        assert!(matches!(weave.remove(&tag.id), Err(Error::UnknownAtom(_))));
    }
}
