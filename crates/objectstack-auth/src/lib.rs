//! Token signing and verification for ObjectStack.
//!
//! Two token families are produced and consumed here, both standard HS256
//! JWTs signed with the tenant's secret:
//!
//! - **Render tokens** authorize a signed download URL; the payload pins the
//!   exact `bucket/objectPath` resource and optional transformations.
//! - **Upload tokens** authorize a signed resumable upload; the payload pins
//!   the upload resource and injects `owner` / `upsert` into the upload
//!   context.
//!
//! The JWT codec is implemented directly over `hmac` + `sha2` with
//! constant-time signature comparison, the same way request signing is done
//! elsewhere in the workspace. `exp` is required and enforced; `nbf` is
//! honored when present.

mod error;
mod jwt;
mod signer;

pub use error::AuthError;
pub use jwt::{decode, encode, peek_claims};
pub use signer::{
    RenderUrlClaims, UploadUrlClaims, UrlSigner, VerifiedUpload,
};
