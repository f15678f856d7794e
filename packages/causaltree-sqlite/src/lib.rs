//! SQLite storage for causal tree repos.
//! Objects and stage entries are stored as JSON rows keyed by content hash, so any op
//! type with serde support can be persisted.

mod storage;

pub use storage::SqliteStore;
