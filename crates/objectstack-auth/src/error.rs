//! Error types for token verification.
//!
//! All verification failures are represented by [`AuthError`]. Conversion
//! into the renderable taxonomy maps expiry and malformed-token failures to
//! `InvalidJWT` and signature/resource mismatches to `InvalidSignature`.

use objectstack_core::StorageError;

/// Errors that can occur while signing or verifying tokens.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The token is not three base64url segments.
    #[error("malformed token")]
    MalformedToken,

    /// The header's `alg` is not HS256.
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The payload is not valid JSON or misses required claims.
    #[error("invalid claims: {0}")]
    InvalidClaims(String),

    /// The computed signature does not match the token's signature.
    #[error("signature verification failed")]
    SignatureMismatch,

    /// The token's `exp` is in the past.
    #[error("jwt expired")]
    Expired,

    /// The token's `nbf` is in the future.
    #[error("jwt not yet valid")]
    NotYetValid,

    /// The token verified but its `url` claim does not name the requested
    /// resource.
    #[error("token url does not match the requested resource")]
    UrlMismatch,
}

impl From<AuthError> for StorageError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::SignatureMismatch | AuthError::UrlMismatch => Self::InvalidSignature,
            other => Self::InvalidJwt {
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_map_expiry_to_invalid_jwt_with_message() {
        let err: StorageError = AuthError::Expired.into();
        match err {
            StorageError::InvalidJwt { message } => assert_eq!(message, "jwt expired"),
            other => panic!("unexpected mapping: {other:?}"),
        }
    }

    #[test]
    fn test_should_map_mismatches_to_invalid_signature() {
        assert!(matches!(
            StorageError::from(AuthError::SignatureMismatch),
            StorageError::InvalidSignature
        ));
        assert!(matches!(
            StorageError::from(AuthError::UrlMismatch),
            StorageError::InvalidSignature
        ));
    }
}
