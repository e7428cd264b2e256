//! Structured error types for the queue.
//!
//! `SiloError` provides pattern-matchable errors instead of a generic
//! boxed error. Validation failures are rejected before any side effect;
//! database failures are surfaced untransformed; handle misuse is its own
//! variant so consumers can distinguish it from backend trouble.
//!
//! Dedup collisions and acks of rows that are already gone are *not*
//! errors: the backend reports them as counts or silently no-ops.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SiloError>;

/// Errors surfaced by backends, handles, and the queue facade.
#[derive(Debug, Error)]
pub enum SiloError {
    /// A caller-supplied value failed validation: oversized payload,
    /// wrong hash width, or an out-of-range configuration value.
    /// Raised before any side effect.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A message or topic-lock handle was used after ack, nack, or
    /// release.
    #[error("handle has already been released")]
    AlreadyReleased,

    /// A blocking `get` timed out, or a non-blocking probe found no
    /// deliverable message.
    #[error("queue is empty")]
    QueueEmpty,

    /// Database connectivity or statement failure. Never retried here;
    /// the caller decides.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl SiloError {
    /// True for errors worth retrying at the caller's discretion.
    pub fn is_transient(&self) -> bool {
        matches!(self, SiloError::Database(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_argument_is_not_transient() {
        let err = SiloError::InvalidArgument("payload too large".to_string());
        assert!(!err.is_transient());
        assert!(err.to_string().contains("payload too large"));
    }

    #[test]
    fn database_errors_are_transient() {
        let err = SiloError::from(sqlx::Error::PoolClosed);
        assert!(err.is_transient());
    }
}
