use crate::atom::Atom;
use crate::ids::AtomId;
use crate::weave::Weave;

/// Sequential cursor over a [`Weave`] scoped by causal parent.
///
/// The cursor is a shared reference plus an index, so `fork` is a plain copy and the
/// weave cannot change underneath it.
pub struct WeaveTraverser<'a, Op> {
    weave: &'a Weave<Op>,
    index: usize,
}

impl<Op> Clone for WeaveTraverser<'_, Op> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Op> Copy for WeaveTraverser<'_, Op> {}

impl<'a, Op> WeaveTraverser<'a, Op> {
    pub fn new(weave: &'a Weave<Op>) -> Self {
        Self { weave, index: 0 }
    }

    pub fn position(&self) -> usize {
        self.index
    }

    pub fn is_done(&self) -> bool {
        self.index >= self.weave.len()
    }

    /// Next unconsumed atom, if it is unconstrained or a direct child of `parent`.
    pub fn peek(&self, parent: Option<&AtomId>) -> Option<&'a Atom<Op>> {
        let atom = self.weave.atoms().get(self.index)?;
        match parent {
            None => Some(atom),
            Some(parent) if atom.cause.as_ref() == Some(parent) => Some(atom),
            Some(_) => None,
        }
    }

    /// Like `peek`, but consumes the atom.
    pub fn next(&mut self, parent: Option<&AtomId>) -> Option<&'a Atom<Op>> {
        let atom = self.peek(parent)?;
        self.index += 1;
        Some(atom)
    }

    /// Advance past the remainder of `parent`'s subtree.
    pub fn skip(&mut self, parent: &AtomId) {
        let Some(start) = self.locate(parent) else {
            return;
        };
        let end = start + self.weave.size_at(start);
        if self.index < end {
            self.index = end;
        }
    }

    /// Position of `id`. Skipped atoms are normally behind the cursor with only their
    /// consumed descendants in between, so scan backwards first.
    fn locate(&self, id: &AtomId) -> Option<usize> {
        let atoms = self.weave.atoms();
        let mut i = self.index.min(atoms.len());
        while i > 0 {
            i -= 1;
            let atom = &atoms[i];
            if &atom.id == id {
                return Some(i);
            }
            // a root that ends before the cursor: `id` is not an open ancestor
            if atom.cause.is_none() && i + self.weave.size_at(i) < self.index {
                break;
            }
        }
        self.weave.index_of(id)
    }

    /// Independent cursor at the same position.
    pub fn fork(&self) -> Self {
        *self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SiteId;
    use crate::ops::AppOp;

    fn sample() -> (Weave<AppOp>, Vec<Atom<AppOp>>) {
        let site = SiteId::new(b"a");
        let file = Atom::new(AtomId::new(1, &site, 0), None, AppOp::file("e1"));
        let tag = Atom::new(AtomId::new(2, &site, 0), Some(file.id.clone()), AppOp::tag("n"));
        let value = Atom::new(AtomId::new(3, &site, 0), Some(tag.id.clone()), AppOp::value("x"));
        let other = Atom::new(AtomId::new(4, &site, 0), None, AppOp::file("e2"));
        let atoms = vec![file, tag, value, other];
        (Weave::from_atoms(atoms.clone()).unwrap(), atoms)
    }

    #[test]
    fn peek_respects_parent_constraint() {
        let (weave, atoms) = sample();
        let mut t = weave.traverser();
        // newest root first
        assert_eq!(t.next(None).unwrap().id, atoms[3].id);
        assert_eq!(t.peek(Some(&atoms[3].id)), None);
        assert_eq!(t.next(None).unwrap().id, atoms[0].id);
        assert_eq!(t.peek(Some(&atoms[1].id)), None);
        assert_eq!(t.peek(Some(&atoms[0].id)).unwrap().id, atoms[1].id);
    }

    #[test]
    fn skip_jumps_over_subtree() {
        let (weave, atoms) = sample();
        let mut t = weave.traverser();
        t.next(None);
        let file = t.next(None).unwrap();
        assert_eq!(file.id, atoms[0].id);
        t.skip(&file.id);
        assert!(t.is_done());
    }

    #[test]
    fn skip_after_consuming_descendants() {
        let (weave, atoms) = sample();
        let mut t = weave.traverser();
        t.next(None);
        let file = t.next(None).unwrap();
        let tag = t.next(Some(&file.id)).unwrap();
        t.next(Some(&tag.id)).unwrap();
        t.skip(&tag.id);
        assert_eq!(t.position(), 4);
        t.skip(&file.id);
        assert!(t.is_done());

        // an atom ahead of the cursor still resolves
        let mut t = weave.traverser();
        t.skip(&atoms[0].id);
        assert!(t.is_done());
    }

    #[test]
    fn skip_over_wide_sibling_runs() {
        let site = SiteId::new(b"a");
        let file = Atom::new(AtomId::new(1, &site, 0), None, AppOp::file("e1"));
        let mut atoms = vec![file.clone()];
        for ts in 2..2_000 {
            atoms.push(Atom::new(AtomId::new(ts, &site, 0), Some(file.id.clone()), AppOp::tag("t")));
        }
        let weave = Weave::from_atoms(atoms).unwrap();
        let mut t = weave.traverser();
        let root = t.next(None).unwrap();
        let mut seen = 0;
        while let Some(child) = t.next(Some(&root.id)) {
            seen += 1;
            t.skip(&child.id);
        }
        t.skip(&root.id);
        assert_eq!(seen, 1_998);
        assert!(t.is_done());
    }

    #[test]
    fn fork_does_not_move_caller() {
        let (weave, _) = sample();
        let mut t = weave.traverser();
        t.next(None);
        let mut fork = t.fork();
        fork.next(None);
        fork.next(None);
        assert_eq!(t.position(), 1);
        assert_eq!(fork.position(), 3);
    }
}
