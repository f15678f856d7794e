use thiserror::Error;

/// Errors surfaced by the branch replicator.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Core(#[from] causaltree_core::Error),
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("logging setup failed: {0}")]
    Telemetry(String),
    #[error("branch {0} is shut down")]
    BranchClosed(String),
    #[error("already watching branch {0}")]
    AlreadyWatching(String),
    #[error("not watching branch {0}")]
    NotWatching(String),
    #[error("session outbound queue closed")]
    SessionClosed,
    #[error("storage task failed: {0}")]
    Task(String),
    #[error("protocol error: {0}")]
    Protocol(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;
