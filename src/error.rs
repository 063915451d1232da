//! Error types for the job control plane.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Mirror error: {0}")]
    Mirror(#[from] MirrorError),
}

/// Job lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: String },

    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },
}

/// Runner-lock errors.
///
/// Note that failing to acquire a lock held by someone else is *not* an
/// error — `acquire` returns `Ok(false)` so callers handle "already
/// running" as a normal outcome.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The shared lock store is required but unreachable. Callers must not
    /// assume exclusivity; by default the manager fails closed with this.
    #[error("Lock store unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Shared mirror-store errors.
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("Mirror store unreachable: {0}")]
    Connection(String),

    #[error("Mirror command failed: {0}")]
    Command(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redis::RedisError> for MirrorError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
            MirrorError::Connection(e.to_string())
        } else {
            MirrorError::Command(e.to_string())
        }
    }
}

/// Result type alias for the control plane.
pub type Result<T> = std::result::Result<T, Error>;
