//! Error types for the controller core.

use crate::registry::Lifecycle;
use lane_protocol::{InstanceId, PlayerId, ProtocolError, RequestId};
use thiserror::Error;

/// Kind of entity a lookup failed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Instance,
    Player,
    Request,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Instance => write!(f, "Instance"),
            EntityKind::Player => write!(f, "Player"),
            EntityKind::Request => write!(f, "Routing request"),
        }
    }
}

/// Errors surfaced by the registry, directory, routing engine and controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    #[error("Instance {instance} has no free capacity")]
    CapacityExceeded { instance: InstanceId },

    #[error("Instance {0} is already registered and healthy")]
    DuplicateRegistration(InstanceId),

    #[error("Instance {instance} is not accepting players ({lifecycle:?})")]
    NotJoinable {
        instance: InstanceId,
        lifecycle: Lifecycle,
    },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),
}

impl ControllerError {
    pub fn instance_not_found(id: &InstanceId) -> Self {
        Self::NotFound {
            kind: EntityKind::Instance,
            id: id.to_string(),
        }
    }

    pub fn player_not_found(player: &PlayerId) -> Self {
        Self::NotFound {
            kind: EntityKind::Player,
            id: player.to_string(),
        }
    }

    pub fn request_not_found(request: &RequestId) -> Self {
        Self::NotFound {
            kind: EntityKind::Request,
            id: request.to_string(),
        }
    }

    /// Whether the caller may reasonably retry, possibly against a different target.
    pub fn is_retryable(&self) -> bool {
        match self {
            ControllerError::CapacityExceeded { .. }
            | ControllerError::DuplicateRegistration(_)
            | ControllerError::NotJoinable { .. }
            | ControllerError::Timeout(_)
            | ControllerError::Network(_) => true,
            ControllerError::Persistence(e) => e.is_retryable(),
            ControllerError::Validation(_)
            | ControllerError::NotFound { .. }
            | ControllerError::Protocol(_)
            | ControllerError::InvariantViolation(_) => false,
        }
    }
}

/// Errors from the session store.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Connection pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("Database unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Stored data could not be decoded: {0}")]
    Serialization(String),

    #[error("Write failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl PersistenceError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PersistenceError::PoolExhausted(_) | PersistenceError::Unavailable(_)
        )
    }
}

// SQLITE_BUSY and SQLITE_LOCKED clear up on their own.
const SQLITE_TRANSIENT_CODES: [&str; 2] = ["5", "6"];

impl From<sqlx::Error> for PersistenceError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => PersistenceError::PoolExhausted(
                "timed out acquiring a pooled connection".to_string(),
            ),
            sqlx::Error::Io(e) => PersistenceError::Unavailable(e.to_string()),
            sqlx::Error::Database(db)
                if db
                    .code()
                    .is_some_and(|code| SQLITE_TRANSIENT_CODES.contains(&code.as_ref())) =>
            {
                PersistenceError::Unavailable(db.to_string())
            }
            e @ (sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_)) => {
                PersistenceError::Serialization(e.to_string())
            }
            other => PersistenceError::Database(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ControllerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeout_is_retryable() {
        let err = PersistenceError::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, PersistenceError::PoolExhausted(_)));
        assert!(ControllerError::from(err).is_retryable());
    }

    #[test]
    fn validation_is_not_retryable() {
        assert!(!ControllerError::Validation("capacity must be > 0".into()).is_retryable());
        assert!(!ControllerError::instance_not_found(&InstanceId::new("gone")).is_retryable());
    }

    #[test]
    fn exhausted_retries_are_not_retried_again() {
        let err = PersistenceError::RetriesExhausted {
            attempts: 4,
            last: "pool timed out".into(),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Write failed after 4 attempts: pool timed out");
    }
}
