use crate::atom::Atom;
use crate::error::Result;
use crate::ids::{AtomId, Lamport, SiteId};
use crate::ops::AtomOp;
use crate::traits::Clock;
use crate::weave::{InsertReport, Weave};

/// Single-replica facade that stamps local atoms with this site's clock and feeds
/// remote atoms into the same weave.
#[derive(Clone, Debug)]
pub struct CausalTree<Op, C: Clock> {
    site: SiteId,
    clock: C,
    weave: Weave<Op>,
}

impl<Op: AtomOp, C: Clock> CausalTree<Op, C> {
    pub fn new(site: SiteId, clock: C) -> Self {
        Self::with_weave(site, clock, Weave::new())
    }

    /// Resume from an existing weave; the clock is advanced past every atom in it.
    pub fn with_weave(site: SiteId, mut clock: C, weave: Weave<Op>) -> Self {
        let latest = weave
            .atoms()
            .iter()
            .chain(weave.pending_atoms())
            .map(|a| a.id.timestamp)
            .max()
            .unwrap_or(0);
        clock.observe(latest);
        Self { site, clock, weave }
    }

    pub fn site(&self) -> &SiteId {
        &self.site
    }

    pub fn weave(&self) -> &Weave<Op> {
        &self.weave
    }

    pub fn into_weave(self) -> Weave<Op> {
        self.weave
    }

    /// Current Lamport time as observed by this replica.
    pub fn lamport(&self) -> Lamport {
        self.clock.now()
    }

    /// Create an atom under `cause` and add it to the local weave.
    pub fn local(&mut self, cause: Option<&AtomId>, op: Op) -> Result<Atom<Op>> {
        self.local_with_priority(cause, op, 0)
    }

    pub fn local_with_priority(
        &mut self,
        cause: Option<&AtomId>,
        op: Op,
        priority: u32,
    ) -> Result<Atom<Op>> {
        let id = AtomId::new(self.clock.tick(), &self.site, priority);
        let atom = Atom::new(id, cause.cloned(), op);
        self.weave.insert(atom.clone())?;
        Ok(atom)
    }

    /// Apply an atom received from another replica.
    pub fn apply_remote(&mut self, atom: Atom<Op>) -> Result<InsertReport<Op>> {
        self.clock.observe(atom.id.timestamp);
        self.weave.insert(atom)
    }

    /// Remove an atom and its subtree from the local weave.
    pub fn remove(&mut self, id: &AtomId) -> Result<Vec<Atom<Op>>> {
        self.weave.remove(id)
    }
}
