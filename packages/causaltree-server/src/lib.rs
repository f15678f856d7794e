//! Branch replicator for causal tree repos.
//!
//! Each open branch runs as an actor that validates, authorizes and weaves incoming
//! atoms, fans them out to watchers and stages them for persistence. Sessions adapt
//! a device's JSON messages to those actors; the transport itself lives elsewhere.

pub mod branch;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod persistence;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;
pub mod telemetry;

pub use branch::{AddOutcome, BranchHandle, Rejection, WatchSubscription};
pub use config::ServerConfig;
pub use error::{Result, ServerError};
pub use protocol::{BranchInfo, ClientMessage, PersistenceInfo, ServerMessage};
pub use registry::BranchRegistry;
pub use server::CausalRepoServer;
pub use session::Session;
pub use storage::Storage;
