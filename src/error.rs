use uuid::Uuid;

use crate::runtime::RuntimeError;

/// Typed error taxonomy for the workspace core.
///
/// Expected failure modes are explicit variants so callers must handle them;
/// runtime failures during lifecycle transitions are normally folded into the
/// workspace's `error` state instead of being returned through here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad input (unknown image, malformed id, duplicate name). Rejected
    /// synchronously with no state change.
    #[error("{0}")]
    Validation(String),

    /// The operation is not legal in the workspace's current state (e.g.
    /// terminal requested on a stopped workspace).
    #[error("{0}")]
    Precondition(String),

    #[error("workspace not found: {0}")]
    NotFound(Uuid),

    /// Container engine failure that could not be folded into a workspace
    /// record (e.g. during terminal attach).
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// Persistent store failure.
    #[error("state store: {0}")]
    Store(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }
}
