#![forbid(unsafe_code)]
//! Core primitives for a causal tree CRDT: checksummed atoms, the weave that orders
//! them, a reducer that folds a weave into entity state, and storage abstractions for
//! commits and staged edits. No I/O happens here; hosts supply storage through the
//! traits in [`traits`].

pub mod atom;
pub mod diff;
pub mod error;
pub mod ids;
pub mod objects;
pub mod ops;
pub mod reducer;
pub mod repo;
pub mod traits;
pub mod traverser;
pub mod tree;
pub mod weave;

pub use atom::{compute_checksum, Atom, ContentHash};
pub use diff::{diff, StateDiff};
pub use error::{Error, Result};
pub use ids::{cmp_siblings, AtomId, Lamport, SiteId};
pub use objects::{
    CausalRepoBranch, CausalRepoCommit, CausalRepoObject, StageChange, StageDiff, StagedAtom,
};
pub use ops::{AppOp, AtomOp, Value};
pub use reducer::{eval, eval_sequence, Entity, Reducer, State};
pub use repo::{apply_stage, commit, history, load_branch, LoadedBranch};
pub use traits::{
    AllowAllAccess, AtomAuthorizer, Clock, LamportClock, MemoryObjectStore, MemoryStageStore,
    ObjectStore, StageStore,
};
pub use traverser::WeaveTraverser;
pub use tree::CausalTree;
pub use weave::{InsertReport, InsertStatus, PendingLimits, Weave};
