//! Engine errors.

use stixgraph_mirror::MirrorError;
use stixgraph_pattern::PatternError;
use stixgraph_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed pattern, mixed types or a field its modifier rejects.
    #[error(transparent)]
    Pattern(#[from] PatternError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Mirror(#[from] MirrorError),

    #[error("invalid feed name `{0}`: expected 1 to 30 characters from [A-Za-z0-9_]")]
    InvalidFeedName(String),

    #[error("no relational mirror is configured")]
    MirrorNotConfigured,

    #[error("unknown storage paradigm `{0}`")]
    UnknownStorageParadigm(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid object: {0}")]
    InvalidObject(String),

    /// An edge endpoint was not part of the batch.
    #[error("`{from}` references `{to}` through `{label}`, which is not in the batch")]
    DanglingReference {
        from: String,
        to: String,
        label: String,
    },

    #[error("content identity is not defined for `{0}` objects")]
    IdentityUnsupported(String),

    #[error("`{0}` is not installed or not on PATH")]
    ToolingMissing(String),

    #[error("`{tool}` failed: {reason}")]
    ToolingFailed { tool: String, reason: String },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("feed task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Store tooling failures are surfaced as engine tooling failures.
    pub(crate) fn from_store(err: StoreError) -> Self {
        match err {
            StoreError::ToolingMissing(tool) => Error::ToolingMissing(tool),
            StoreError::ToolingFailed { tool, reason } => Error::ToolingFailed { tool, reason },
            other => Error::Store(other),
        }
    }
}
