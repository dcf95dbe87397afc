//! Error types for the sync engine.

use thiserror::Error;

use crate::models::{EntityType, Payload};

/// Outcome of a single failed remote call, as classified by an applier.
#[derive(Debug, Clone, Error)]
pub enum ApplyError {
    /// Network-class failure: timeout, connection reset, 5xx. Retried with backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The remote copy moved on since the local base was read.
    #[error("version conflict")]
    Conflict {
        /// Authoritative remote record, when the remote sent it along.
        remote: Option<Payload>,
    },

    /// Validation or permission failure. Never retried.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl ApplyError {
    /// Classifies an HTTP-style status code.
    ///
    /// 409 routes to conflict resolution, 408/429/5xx are transient and every
    /// other non-success status is permanent.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            409 => ApplyError::Conflict { remote: None },
            408 | 429 | 500..=599 => ApplyError::Transient(format!("{}: {}", status, message)),
            _ => ApplyError::Permanent(format!("{}: {}", status, message)),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ApplyError::Transient(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ApplyError::Conflict { .. })
    }
}

/// Errors raised by a [`LocalStore`](crate::store::LocalStore) implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors surfaced across the engine's public API.
#[derive(Debug, Error)]
pub enum SyncError {
    /// No applier is registered for the entity type. This is a configuration bug.
    #[error("no remote applier registered for entity type '{0}'")]
    UnknownEntityType(EntityType),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("mutation not found: {0}")]
    NotFound(String),

    #[error("mutation {0} is not awaiting manual conflict resolution")]
    NotParked(String),

    /// Durable queue state could not be written or read. The in-memory queue
    /// is reloaded from the store on the next run.
    #[error("queue persistence failed: {0}")]
    QueuePersistence(#[source] StoreError),

    #[error("reconciliation failed: {0}")]
    Reconcile(ApplyError),
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_classification() {
        assert!(ApplyError::from_status(409, "stale").is_conflict());
        assert!(ApplyError::from_status(503, "unavailable").is_transient());
        assert!(ApplyError::from_status(500, "boom").is_transient());
        assert!(ApplyError::from_status(429, "slow down").is_transient());
        assert!(ApplyError::from_status(408, "timeout").is_transient());

        for status in [400, 401, 403, 404, 422] {
            let err = ApplyError::from_status(status, "nope");
            assert!(matches!(err, ApplyError::Permanent(_)), "status {}", status);
        }
    }

    #[test]
    fn test_error_messages() {
        let err = SyncError::UnknownEntityType(EntityType::Redemption);
        assert_eq!(
            err.to_string(),
            "no remote applier registered for entity type 'redemption'"
        );

        let err = ApplyError::from_status(503, "unavailable");
        assert_eq!(err.to_string(), "transient failure: 503: unavailable");
    }
}
