use thiserror::Error;

use crate::atom::ContentHash;
use crate::ids::AtomId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("checksum mismatch for atom {id}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        id: AtomId,
        expected: ContentHash,
        actual: ContentHash,
    },
    #[error("atom {0} already exists with different content")]
    ConflictingAtom(AtomId),
    #[error("unknown atom: {0}")]
    UnknownAtom(AtomId),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("inconsistent state: {0}")]
    InconsistentState(String),
}
