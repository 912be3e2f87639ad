//! The renderable error taxonomy.
//!
//! Every fallible operation in ObjectStack returns a [`StorageError`]. Each
//! variant carries a stable error kind string and maps to an HTTP status
//! code through [`StorageError::status_code`], so the transport layer can
//! translate domain failures into responses without inspecting messages.
//!
//! Internal errors are sanitized on render: the original message is logged
//! by the caller but the response body always says "Internal Server Error".
//!
//! # Usage
//!
//! ```
//! use objectstack_core::StorageError;
//!
//! let err = StorageError::BucketNotFound {
//!     bucket: "avatars".to_owned(),
//! };
//! assert_eq!(err.status_code(), 404);
//! assert_eq!(err.error_kind(), "BucketNotFound");
//! ```

use http::StatusCode;
use serde::{Deserialize, Serialize};

/// Domain error for all ObjectStack operations.
///
/// Variants correspond one-to-one with the renderable error kinds the
/// gateway may produce. Converting to an [`ErrorResponse`] attaches the
/// status code and a sanitized message.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    // -----------------------------------------------------------------------
    // Authentication / signature errors
    // -----------------------------------------------------------------------
    /// The bearer JWT is missing, malformed, or failed verification.
    #[error("{message}")]
    InvalidJwt {
        /// Why the token was rejected (e.g. `jwt expired`).
        message: String,
    },

    /// A signed URL token did not verify or did not match the resource.
    #[error("The signature for this resource is invalid")]
    InvalidSignature,

    // -----------------------------------------------------------------------
    // Request validation errors
    // -----------------------------------------------------------------------
    /// The supplied object metadata could not be parsed.
    #[error("Invalid metadata: {message}")]
    InvalidMetadata {
        /// Description of the malformed metadata.
        message: String,
    },

    /// A request that requires metadata arrived without any.
    #[error("Metadata is required for this operation")]
    MetadataRequired,

    /// A request parameter is out of range or malformed.
    #[error("Invalid parameter: {message}")]
    InvalidParameter {
        /// Description of the invalid parameter.
        message: String,
    },

    // -----------------------------------------------------------------------
    // Authorization errors
    // -----------------------------------------------------------------------
    /// The caller's row-level authorization rejected the operation.
    #[error("Access Denied")]
    AccessDenied,

    // -----------------------------------------------------------------------
    // Not-found errors
    // -----------------------------------------------------------------------
    /// The named bucket does not exist (or is invisible to the caller).
    #[error("Bucket not found: {bucket}")]
    BucketNotFound {
        /// The bucket that was not found.
        bucket: String,
    },

    /// The named object does not exist (or is invisible to the caller).
    #[error("Object not found: {bucket}/{name}")]
    ObjectNotFound {
        /// The bucket the object was looked up in.
        bucket: String,
        /// The object name that was not found.
        name: String,
    },

    /// The shard reservation does not exist.
    #[error("Reservation not found: {id}")]
    ReservationNotFound {
        /// The reservation id that was not found.
        id: String,
    },

    // -----------------------------------------------------------------------
    // Conflict errors
    // -----------------------------------------------------------------------
    /// The operation conflicts with concurrent state (duplicate key,
    /// concurrent writer, failed precondition).
    #[error("{message}")]
    Conflict {
        /// Description of the conflict.
        message: String,
    },

    /// The bucket still contains objects and cannot be deleted.
    #[error("The bucket you tried to delete is not empty: {bucket}")]
    BucketNotEmpty {
        /// The bucket that is not empty.
        bucket: String,
    },

    /// The object is locked by a concurrent writer.
    #[error("Resource is locked: {key}")]
    ResourceLocked {
        /// The `(bucket, name, version)` key that is held.
        key: String,
    },

    /// The reservation's lease elapsed before it was confirmed.
    #[error("Reservation has expired: {id}")]
    ExpiredReservation {
        /// The expired reservation id.
        id: String,
    },

    // -----------------------------------------------------------------------
    // Size / content errors
    // -----------------------------------------------------------------------
    /// The payload exceeds the applicable file size limit.
    #[error("The object exceeded the maximum allowed size ({size} > {limit})")]
    EntityTooLarge {
        /// Observed payload size in bytes.
        size: u64,
        /// The applicable limit in bytes.
        limit: u64,
    },

    /// The request body exceeds the transport limit.
    #[error("Payload too large")]
    PayloadTooLarge,

    /// The content type is not in the bucket's allow list.
    #[error("mime type {mime_type} is not supported")]
    InvalidMimeType {
        /// The rejected content type.
        mime_type: String,
    },

    // -----------------------------------------------------------------------
    // Sharding errors
    // -----------------------------------------------------------------------
    /// No shard of the requested kind is active.
    #[error("No active shard available for kind {kind}")]
    NoActiveShard {
        /// The resource kind that could not be placed.
        kind: String,
    },

    /// Every active shard of the requested kind is at capacity.
    #[error("No shard with free capacity for kind {kind}")]
    NoAvailableShard {
        /// The resource kind that could not be placed.
        kind: String,
    },

    // -----------------------------------------------------------------------
    // Infrastructure errors
    // -----------------------------------------------------------------------
    /// The metadata store did not yield a connection or answer in time.
    #[error("Database timeout")]
    DatabaseTimeout,

    /// The upload lock could not be acquired within the retry budget.
    #[error("Timed out acquiring the upload lock")]
    AcquiringLockTimeout,

    /// The blob backend is unreachable or returned a retryable failure.
    #[error("Storage backend unavailable: {message}")]
    BackendUnavailable {
        /// Backend-provided detail (logged, sanitized on render).
        message: String,
    },

    /// A metadata transaction failed to begin, commit, or roll back.
    #[error("Transaction failed: {message}")]
    TransactionError {
        /// Description of the transaction failure.
        message: String,
    },

    /// Internal error with context. Never rendered verbatim.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Convenience result type for ObjectStack operations.
pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    /// The stable error-kind string used in rendered responses.
    #[must_use]
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidJwt { .. } => "InvalidJWT",
            Self::InvalidSignature => "InvalidSignature",
            Self::InvalidMetadata { .. } => "InvalidMetadata",
            Self::MetadataRequired => "MetadataRequired",
            Self::InvalidParameter { .. } => "InvalidParameter",
            Self::AccessDenied => "AccessDenied",
            Self::BucketNotFound { .. } => "BucketNotFound",
            Self::ObjectNotFound { .. } => "ObjectNotFound",
            Self::ReservationNotFound { .. } => "ReservationNotFound",
            Self::Conflict { .. } => "Conflict",
            Self::BucketNotEmpty { .. } => "BucketNotEmpty",
            Self::ResourceLocked { .. } => "ResourceLocked",
            Self::ExpiredReservation { .. } => "ExpiredReservation",
            Self::EntityTooLarge { .. } => "EntityTooLarge",
            Self::PayloadTooLarge => "PayloadTooLarge",
            Self::InvalidMimeType { .. } => "InvalidMimeType",
            Self::NoActiveShard { .. } => "NoActiveShard",
            Self::NoAvailableShard { .. } => "NoAvailableShard",
            Self::DatabaseTimeout => "DatabaseTimeout",
            Self::AcquiringLockTimeout => "AcquiringLockTimeout",
            Self::BackendUnavailable { .. } => "BackendUnavailable",
            Self::TransactionError { .. } => "TransactionError",
            Self::Internal(_) => "InternalError",
        }
    }

    /// The HTTP status code this error renders to.
    ///
    /// `DatabaseTimeout` uses the service-specific 544 code, which is not a
    /// registered status, so the mapping works on bare `u16`.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidJwt { .. }
            | Self::InvalidSignature
            | Self::InvalidMetadata { .. }
            | Self::MetadataRequired
            | Self::InvalidParameter { .. } => StatusCode::BAD_REQUEST.as_u16(),
            Self::AccessDenied => StatusCode::FORBIDDEN.as_u16(),
            Self::BucketNotFound { .. }
            | Self::ObjectNotFound { .. }
            | Self::ReservationNotFound { .. } => StatusCode::NOT_FOUND.as_u16(),
            Self::Conflict { .. }
            | Self::BucketNotEmpty { .. }
            | Self::ResourceLocked { .. }
            | Self::ExpiredReservation { .. } => StatusCode::CONFLICT.as_u16(),
            Self::EntityTooLarge { .. } | Self::PayloadTooLarge => {
                StatusCode::PAYLOAD_TOO_LARGE.as_u16()
            }
            Self::InvalidMimeType { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE.as_u16(),
            Self::NoActiveShard { .. } | Self::NoAvailableShard { .. } => {
                StatusCode::INSUFFICIENT_STORAGE.as_u16()
            }
            Self::DatabaseTimeout => 544,
            Self::AcquiringLockTimeout | Self::BackendUnavailable { .. } => {
                StatusCode::SERVICE_UNAVAILABLE.as_u16()
            }
            Self::TransactionError { .. } | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR.as_u16()
            }
        }
    }

    /// Whether callers may retry the failed operation.
    ///
    /// Only backend unavailability and database timeouts are retryable;
    /// not-found and access-denied failures never are.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable { .. } | Self::DatabaseTimeout
        )
    }

    /// Render this error into the wire shape.
    ///
    /// Internal and transaction errors are sanitized: their message becomes
    /// "Internal Server Error" so backend details never leak. Validation
    /// errors keep their precise message.
    #[must_use]
    pub fn render(&self) -> ErrorResponse {
        let status_code = self.status_code();
        let message = if status_code >= 500 && !matches!(self, Self::BackendUnavailable { .. }) {
            "Internal Server Error".to_owned()
        } else if let Self::BackendUnavailable { .. } = self {
            "Storage backend unavailable".to_owned()
        } else {
            self.to_string()
        };

        ErrorResponse {
            status_code,
            error: self.error_kind().to_owned(),
            message,
        }
    }
}

/// The JSON error body rendered to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    /// The HTTP status code, duplicated in the body.
    pub status_code: u16,
    /// The stable error-kind string.
    pub error: String,
    /// The sanitized, human-readable message.
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_map_validation_errors_to_400() {
        for err in [
            StorageError::InvalidJwt {
                message: "jwt expired".to_owned(),
            },
            StorageError::InvalidSignature,
            StorageError::InvalidMetadata {
                message: "not json".to_owned(),
            },
            StorageError::MetadataRequired,
            StorageError::InvalidParameter {
                message: "limit".to_owned(),
            },
        ] {
            assert_eq!(err.status_code(), 400, "{err}");
        }
    }

    #[test]
    fn test_should_map_not_found_errors_to_404() {
        let err = StorageError::ObjectNotFound {
            bucket: "b".to_owned(),
            name: "a/b.txt".to_owned(),
        };
        assert_eq!(err.status_code(), 404);
        assert_eq!(err.error_kind(), "ObjectNotFound");
    }

    #[test]
    fn test_should_map_conflict_family_to_409() {
        for err in [
            StorageError::Conflict {
                message: "duplicate".to_owned(),
            },
            StorageError::BucketNotEmpty {
                bucket: "b".to_owned(),
            },
            StorageError::ResourceLocked {
                key: "b/o/v1".to_owned(),
            },
            StorageError::ExpiredReservation {
                id: "r1".to_owned(),
            },
        ] {
            assert_eq!(err.status_code(), 409, "{err}");
        }
    }

    #[test]
    fn test_should_map_shard_exhaustion_to_507() {
        let err = StorageError::NoActiveShard {
            kind: "vector".to_owned(),
        };
        assert_eq!(err.status_code(), 507);
    }

    #[test]
    fn test_should_use_service_specific_timeout_code() {
        assert_eq!(StorageError::DatabaseTimeout.status_code(), 544);
    }

    #[test]
    fn test_should_sanitize_internal_errors_on_render() {
        let err = StorageError::Internal(anyhow::anyhow!("connection refused to 10.0.0.3"));
        let rendered = err.render();
        assert_eq!(rendered.status_code, 500);
        assert_eq!(rendered.error, "InternalError");
        assert_eq!(rendered.message, "Internal Server Error");
    }

    #[test]
    fn test_should_sanitize_backend_detail_on_render() {
        let err = StorageError::BackendUnavailable {
            message: "dial tcp: i/o timeout".to_owned(),
        };
        let rendered = err.render();
        assert_eq!(rendered.status_code, 503);
        assert_eq!(rendered.message, "Storage backend unavailable");
    }

    #[test]
    fn test_should_keep_validation_message_on_render() {
        let err = StorageError::InvalidMimeType {
            mime_type: "application/x-thing".to_owned(),
        };
        let rendered = err.render();
        assert_eq!(rendered.status_code, 415);
        assert!(rendered.message.contains("application/x-thing"));
    }

    #[test]
    fn test_should_mark_only_infrastructure_errors_retryable() {
        assert!(
            StorageError::BackendUnavailable {
                message: "503".to_owned()
            }
            .is_retryable()
        );
        assert!(StorageError::DatabaseTimeout.is_retryable());
        assert!(!StorageError::AccessDenied.is_retryable());
        assert!(
            !StorageError::BucketNotFound {
                bucket: "b".to_owned()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_should_serialize_error_response_in_camel_case() {
        let rendered = StorageError::AccessDenied.render();
        let json = serde_json::to_value(&rendered).unwrap();
        assert_eq!(json["statusCode"], 403);
        assert_eq!(json["error"], "AccessDenied");
        assert_eq!(json["message"], "Access Denied");
    }
}
