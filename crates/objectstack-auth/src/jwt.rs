//! Minimal HS256 JWT codec.
//!
//! Only the subset of JOSE this gateway needs: HS256 signatures, `exp`
//! (required) and `nbf` (optional) enforcement. Signature comparison is
//! constant-time.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, KeyInit, Mac};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::AuthError;

type HmacSha256 = Hmac<Sha256>;

/// The fixed JOSE header for every token this gateway mints.
const HEADER: &str = r#"{"alg":"HS256","typ":"JWT"}"#;

/// Sign `claims` into a compact JWT with the given secret.
///
/// # Errors
///
/// Returns [`AuthError::InvalidClaims`] if the claims fail to serialize.
pub fn encode<T: Serialize>(claims: &T, secret: &[u8]) -> Result<String, AuthError> {
    let payload =
        serde_json::to_vec(claims).map_err(|e| AuthError::InvalidClaims(e.to_string()))?;

    let mut token = String::new();
    token.push_str(&URL_SAFE_NO_PAD.encode(HEADER.as_bytes()));
    token.push('.');
    token.push_str(&URL_SAFE_NO_PAD.encode(&payload));

    let signature = sign(token.as_bytes(), secret);
    token.push('.');
    token.push_str(&URL_SAFE_NO_PAD.encode(signature));

    Ok(token)
}

/// Verify a compact JWT and deserialize its claims.
///
/// Checks, in order: structure, algorithm, signature (constant-time), `exp`
/// (required, must be in the future), `nbf` (when present, must not be in
/// the future).
///
/// # Errors
///
/// Any verification failure returns the corresponding [`AuthError`]; an
/// expired token is always reported as [`AuthError::Expired`] regardless of
/// other defects so the caller renders `jwt expired`.
pub fn decode<T: DeserializeOwned>(token: &str, secret: &[u8]) -> Result<T, AuthError> {
    let (signing_input, claims, signature) = split(token)?;

    let header: serde_json::Value = serde_json::from_slice(
        &URL_SAFE_NO_PAD
            .decode(token.split('.').next().unwrap_or_default())
            .map_err(|_| AuthError::MalformedToken)?,
    )
    .map_err(|_| AuthError::MalformedToken)?;
    match header.get("alg").and_then(|a| a.as_str()) {
        Some("HS256") => {}
        Some(other) => return Err(AuthError::UnsupportedAlgorithm(other.to_owned())),
        None => return Err(AuthError::MalformedToken),
    }

    let expected = sign(signing_input.as_bytes(), secret);
    if expected.ct_eq(&signature[..]).unwrap_u8() != 1 {
        return Err(AuthError::SignatureMismatch);
    }

    validate_time_claims(&claims)?;

    serde_json::from_value(claims).map_err(|e| AuthError::InvalidClaims(e.to_string()))
}

/// Decode a token's claims without verifying the signature.
///
/// Used where the raw claims are needed for session scope injection after
/// an upstream verifier has already validated the token.
///
/// # Errors
///
/// Returns [`AuthError::MalformedToken`] if the token is not parseable.
pub fn peek_claims(token: &str) -> Result<serde_json::Value, AuthError> {
    let (_, claims, _) = split(token)?;
    Ok(claims)
}

/// Split a compact token into `(signing_input, claims_json, signature)`.
fn split(token: &str) -> Result<(&str, serde_json::Value, Vec<u8>), AuthError> {
    let mut parts = token.split('.');
    let (Some(header), Some(payload), Some(sig), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(AuthError::MalformedToken);
    };

    let signing_len = header.len() + 1 + payload.len();
    let signing_input = &token[..signing_len];

    let payload_bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| AuthError::MalformedToken)?;
    let claims: serde_json::Value =
        serde_json::from_slice(&payload_bytes).map_err(|_| AuthError::MalformedToken)?;

    let signature = URL_SAFE_NO_PAD
        .decode(sig)
        .map_err(|_| AuthError::MalformedToken)?;

    Ok((signing_input, claims, signature))
}

/// Enforce `exp` (required) and `nbf` (optional).
fn validate_time_claims(claims: &serde_json::Value) -> Result<(), AuthError> {
    let now = chrono::Utc::now().timestamp();

    let exp = claims
        .get("exp")
        .and_then(serde_json::Value::as_i64)
        .ok_or_else(|| AuthError::InvalidClaims("missing exp claim".to_owned()))?;
    if exp <= now {
        return Err(AuthError::Expired);
    }

    if let Some(nbf) = claims.get("nbf").and_then(serde_json::Value::as_i64) {
        if nbf > now {
            return Err(AuthError::NotYetValid);
        }
    }

    Ok(())
}

/// HMAC-SHA256 over the signing input.
fn sign(input: &[u8], secret: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, so new_from_slice cannot fail.
    let mut mac = HmacSha256::new_from_slice(secret).unwrap_or_else(|_| unreachable!());
    mac.update(input);
    mac.finalize().into_bytes().to_vec()
}
