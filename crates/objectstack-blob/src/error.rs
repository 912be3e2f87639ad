//! Blob backend error type.

use objectstack_core::StorageError;

/// Failures produced by blob backend operations.
///
/// `BackendUnavailable` is retryable by callers per their policy;
/// `NotFound` and `AccessDenied` never are.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    /// No blob exists at the requested key.
    #[error("blob not found: {key}")]
    NotFound {
        /// The physical key that was not found.
        key: String,
    },

    /// The backend rejected the caller's credentials for this operation.
    #[error("access denied by blob backend")]
    AccessDenied,

    /// A conditional write lost, or the backend reported a state conflict.
    #[error("conflict at {key}")]
    Conflict {
        /// The physical key the conflict occurred at.
        key: String,
    },

    /// The operation was cancelled by the request's cancel signal.
    #[error("operation cancelled")]
    Cancelled,

    /// The backend is unreachable or returned a retryable failure.
    #[error("backend unavailable: {message}")]
    BackendUnavailable {
        /// Backend-provided detail.
        message: String,
    },

    /// Internal error with context.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BlobError {
    /// Whether the operation may be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. })
    }

    /// Classify a local I/O error against a physical key.
    pub(crate) fn from_io(err: &std::io::Error, key: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound {
                key: key.to_owned(),
            },
            std::io::ErrorKind::PermissionDenied => Self::AccessDenied,
            std::io::ErrorKind::AlreadyExists => Self::Conflict {
                key: key.to_owned(),
            },
            _ => Self::BackendUnavailable {
                message: err.to_string(),
            },
        }
    }
}

impl From<BlobError> for StorageError {
    fn from(err: BlobError) -> Self {
        match err {
            // The physical key cannot be mapped back to a logical
            // (bucket, name) here: versioned keys carry a trailing version
            // segment the logical name must not contain. Call sites that
            // expect absence match `NotFound` themselves and rebuild the
            // error from the logical key they already hold; reaching this
            // arm means a committed row pointed at a blob that is gone.
            BlobError::NotFound { key } => {
                Self::Internal(anyhow::anyhow!("blob missing at {key}"))
            }
            BlobError::AccessDenied => Self::AccessDenied,
            BlobError::Conflict { key } => Self::Conflict {
                message: format!("concurrent write detected at {key}"),
            },
            BlobError::Cancelled => Self::Internal(anyhow::anyhow!("request cancelled")),
            BlobError::BackendUnavailable { message } => Self::BackendUnavailable { message },
            BlobError::Internal(e) => Self::Internal(e),
        }
    }
}
