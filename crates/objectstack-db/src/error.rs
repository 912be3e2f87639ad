//! Database error classification.
//!
//! Raw `sqlx` failures are classified by SQLSTATE into the handful of
//! conditions the rest of the system reacts to: pool/statement timeouts,
//! serialization failures (retried), unique violations (self-healed by the
//! sharding allocator), refused advisory locks, and the direct-delete
//! guard's `insufficient_privilege`.

use objectstack_core::StorageError;

/// Classified database failure.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// Waiting for a pooled connection or a statement timed out.
    #[error("database timeout")]
    Timeout,

    /// The server refused the connection: too many clients.
    #[error("too many database connections")]
    TooManyConnections,

    /// Serializable transaction conflict (SQLSTATE 40001).
    #[error("serialization failure")]
    SerializationFailure,

    /// Unique constraint violation (SQLSTATE 23505).
    #[error("unique violation on {constraint}")]
    UniqueViolation {
        /// The violated constraint name, when the server reported one.
        constraint: String,
    },

    /// The direct-delete guard or a row policy refused the statement
    /// (SQLSTATE 42501).
    #[error("insufficient privilege")]
    InsufficientPrivilege,

    /// A non-blocking lock acquisition was refused (SQLSTATE 55P03).
    #[error("lock not available")]
    LockNotAvailable,

    /// Any other driver or server failure.
    #[error(transparent)]
    Other(sqlx::Error),
}

/// Convenience result type for database operations.
pub type DbResult<T> = Result<T, DbError>;

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut => Self::Timeout,
            sqlx::Error::Database(db) => match db.code().as_deref() {
                Some("40001") => Self::SerializationFailure,
                Some("23505") => Self::UniqueViolation {
                    constraint: db.constraint().unwrap_or_default().to_owned(),
                },
                Some("42501") => Self::InsufficientPrivilege,
                Some("55P03") => Self::LockNotAvailable,
                Some("53300") => Self::TooManyConnections,
                // statement_timeout and canceled statements surface alike.
                Some("57014") => Self::Timeout,
                _ => Self::Other(err),
            },
            _ => Self::Other(err),
        }
    }
}

impl DbError {
    /// Whether a fresh attempt in a new transaction may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SerializationFailure | Self::TooManyConnections
        )
    }
}

impl From<DbError> for StorageError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Timeout | DbError::TooManyConnections => Self::DatabaseTimeout,
            DbError::SerializationFailure => Self::TransactionError {
                message: "serialization failure".to_owned(),
            },
            DbError::UniqueViolation { constraint } => Self::Conflict {
                message: format!("duplicate key on {constraint}"),
            },
            DbError::InsufficientPrivilege => Self::AccessDenied,
            DbError::LockNotAvailable => Self::ResourceLocked {
                key: String::new(),
            },
            DbError::Other(e) => Self::Internal(anyhow::Error::new(e)),
        }
    }
}
