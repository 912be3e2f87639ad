//! Signed URL minting and verification.
//!
//! A [`UrlSigner`] is constructed per tenant from that tenant's JWT secret.
//! The `url` claim pins the exact resource: verification fails with
//! [`AuthError::UrlMismatch`] when the requested path differs, so a token
//! minted for one object can never be replayed against another.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AuthError;
use crate::jwt;

/// Claims of a signed render (download) URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderUrlClaims {
    /// The exact `bucketName/objectPath` resource.
    pub url: String,
    /// Optional serialized transformation options.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transformations: Option<String>,
    /// Expiry, seconds since epoch.
    pub exp: i64,
}

/// Claims of a signed resumable upload URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadUrlClaims {
    /// The exact upload resource path.
    pub url: String,
    /// Owner injected into the upload context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Whether the upload may replace an existing object.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upsert: Option<bool>,
    /// Expiry, seconds since epoch.
    pub exp: i64,
}

/// The verified outcome of a signed upload token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedUpload {
    /// Owner to attribute the upload to.
    pub owner: Option<String>,
    /// Whether upsert semantics were granted.
    pub upsert: bool,
}

/// Signs and verifies resource-pinned URL tokens with a tenant secret.
pub struct UrlSigner {
    secret: Vec<u8>,
}

impl std::fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlSigner").finish_non_exhaustive()
    }
}

impl UrlSigner {
    /// Create a signer from the tenant's JWT secret.
    #[must_use]
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Mint a signed render URL token for `bucketName/objectPath`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidClaims`] if claim serialization fails.
    pub fn sign_render_url(
        &self,
        url: &str,
        transformations: Option<String>,
        expires_in: Duration,
    ) -> Result<String, AuthError> {
        let claims = RenderUrlClaims {
            url: url.to_owned(),
            transformations,
            exp: expiry(expires_in),
        };
        jwt::encode(&claims, &self.secret)
    }

    /// Verify a render token against the requested resource path.
    ///
    /// # Errors
    ///
    /// - [`AuthError::Expired`] / [`AuthError::SignatureMismatch`] per the
    ///   JWT codec.
    /// - [`AuthError::UrlMismatch`] if the token was minted for a different
    ///   resource.
    pub fn verify_render_url(
        &self,
        token: &str,
        requested_url: &str,
    ) -> Result<RenderUrlClaims, AuthError> {
        let claims: RenderUrlClaims = jwt::decode(token, &self.secret)?;
        if claims.url != requested_url {
            debug!(
                token_url = %claims.url,
                requested_url,
                "render token url mismatch"
            );
            return Err(AuthError::UrlMismatch);
        }
        Ok(claims)
    }

    /// Mint a signed resumable upload token.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidClaims`] if claim serialization fails.
    pub fn sign_upload_url(
        &self,
        url: &str,
        owner: Option<String>,
        upsert: bool,
        expires_in: Duration,
    ) -> Result<String, AuthError> {
        let claims = UploadUrlClaims {
            url: url.to_owned(),
            owner,
            upsert: upsert.then_some(true),
            exp: expiry(expires_in),
        };
        jwt::encode(&claims, &self.secret)
    }

    /// Verify a signed upload token against the upload resource path.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`UrlSigner::verify_render_url`].
    pub fn verify_upload_url(
        &self,
        token: &str,
        requested_url: &str,
    ) -> Result<VerifiedUpload, AuthError> {
        let claims: UploadUrlClaims = jwt::decode(token, &self.secret)?;
        if claims.url != requested_url {
            debug!(
                token_url = %claims.url,
                requested_url,
                "upload token url mismatch"
            );
            return Err(AuthError::UrlMismatch);
        }
        Ok(VerifiedUpload {
            owner: claims.owner,
            upsert: claims.upsert.unwrap_or(false),
        })
    }
}

fn expiry(expires_in: Duration) -> i64 {
    chrono::Utc::now().timestamp() + i64::try_from(expires_in.as_secs()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn signer() -> UrlSigner {
        UrlSigner::new(b"tenant-secret".to_vec())
    }

    #[test]
    fn test_should_round_trip_render_token() {
        let s = signer();
        let token = s
            .sign_render_url("b-1/public/cat.png", None, HOUR)
            .unwrap();
        let claims = s.verify_render_url(&token, "b-1/public/cat.png").unwrap();
        assert_eq!(claims.url, "b-1/public/cat.png");
        assert!(claims.transformations.is_none());
    }

    #[test]
    fn test_should_reject_render_token_for_other_path() {
        let s = signer();
        let token = s.sign_render_url("b-1/a.png", None, HOUR).unwrap();
        let result = s.verify_render_url(&token, "b-1/b.png");
        assert!(matches!(result, Err(AuthError::UrlMismatch)));
    }

    #[test]
    fn test_should_reject_expired_render_token() {
        let s = signer();
        let token = s
            .sign_render_url("b-1/a.png", None, Duration::ZERO)
            .unwrap();
        let result = s.verify_render_url(&token, "b-1/a.png");
        assert!(matches!(result, Err(AuthError::Expired)));
    }

    #[test]
    fn test_should_carry_owner_and_upsert_in_upload_token() {
        let s = signer();
        let token = s
            .sign_upload_url("b-2/u/file.bin", Some("user-X".to_owned()), true, HOUR)
            .unwrap();
        let verified = s.verify_upload_url(&token, "b-2/u/file.bin").unwrap();
        assert_eq!(verified.owner.as_deref(), Some("user-X"));
        assert!(verified.upsert);
    }

    #[test]
    fn test_should_default_upsert_to_false() {
        let s = signer();
        let token = s.sign_upload_url("b-2/u/file.bin", None, false, HOUR).unwrap();
        let verified = s.verify_upload_url(&token, "b-2/u/file.bin").unwrap();
        assert!(verified.owner.is_none());
        assert!(!verified.upsert);
    }

    #[test]
    fn test_should_reject_upload_token_signed_with_other_secret() {
        let token = UrlSigner::new(b"other".to_vec())
            .sign_upload_url("b-2/u/file.bin", None, false, HOUR)
            .unwrap();
        let result = signer().verify_upload_url(&token, "b-2/u/file.bin");
        assert!(matches!(result, Err(AuthError::SignatureMismatch)));
    }
}
