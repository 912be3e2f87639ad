//! Blob backend adapter for ObjectStack.
//!
//! A uniform set of operations over a physical blob store, polymorphic over
//! the two production variants:
//!
//! - [`S3BlobStore`]: any S3-compatible endpoint via the AWS SDK.
//! - [`FsBlobStore`]: a local filesystem rooted at a configured directory.
//!
//! Object bytes live at the physical key `{key}/{version}`; the unversioned
//! `key` is `{tenant}/{bucket}/{objectName}`. Raw-key operations
//! (`get_raw`, `put_raw_if_absent`, ...) exist for the small control objects
//! the resumable subsystem maintains (lock and upload-info objects), which
//! are not versioned.
//!
//! Every operation takes a [`CancellationToken`]; blob I/O aborts promptly
//! when the request disconnects.
//!
//! # Architecture
//!
//! ```text
//! Storage / Uploader / TUS
//!        |
//!        v
//!   dyn BlobStore  (this trait)
//!      /     \
//!     v       v
//! S3BlobStore  FsBlobStore
//! ```

mod error;
mod local_fs;
mod s3;

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use tokio_util::sync::CancellationToken;

use objectstack_core::ByteRange;

pub use error::BlobError;
pub use local_fs::FsBlobStore;
pub use s3::S3BlobStore;

/// Default content type when a caller does not provide one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Default cache-control when a caller does not provide one.
pub const DEFAULT_CACHE_CONTROL: &str = "no-cache";

/// S3 caps `DeleteObjects` at 1000 keys per request; `delete_many` chunks
/// at this size on every backend for uniform behavior.
pub const MAX_KEYS_PER_DELETE: usize = 1000;

/// A cancellable stream of body chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// System metadata of a stored blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMetadata {
    /// Total size in bytes.
    pub size: u64,
    /// Backend-assigned entity tag.
    pub etag: String,
    /// Stored content type.
    pub mimetype: String,
    /// Stored cache-control directive.
    pub cache_control: String,
    /// Last modification timestamp.
    pub last_modified: DateTime<Utc>,
    /// HTTP status a passthrough response would carry (200, or 206 for
    /// ranged reads).
    pub http_status_code: u16,
}

/// A blob opened for reading: metadata plus the body stream.
pub struct BlobObject {
    /// System metadata (with `http_status_code` reflecting the range).
    pub metadata: BlobMetadata,
    /// The body; yields exactly the requested range.
    pub stream: ByteStream,
}

impl std::fmt::Debug for BlobObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobObject")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// A replayable upload body with a known length.
///
/// Produced by the hashing sink: small payloads stay in memory, large ones
/// arrive as a spilled temporary file. The S3 SDK requires a sized body, so
/// the adapter never accepts an unsized stream for writes.
#[derive(Debug, Clone)]
pub enum BlobPayload {
    /// The whole payload in memory.
    InMemory(Bytes),
    /// The payload spilled to a file on disk.
    Spilled {
        /// Path of the spill file.
        path: PathBuf,
        /// File length in bytes.
        len: u64,
    },
}

impl BlobPayload {
    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        match self {
            Self::InMemory(bytes) => bytes.len() as u64,
            Self::Spilled { len, .. } => *len,
        }
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One uploaded multipart part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedPart {
    /// 1-based part number.
    pub part_number: i32,
    /// Backend entity tag for the part.
    pub etag: String,
}

/// Uniform operations over a physical blob store.
///
/// All failures are [`BlobError`]s; `BackendUnavailable` is the only
/// retryable kind.
#[async_trait]
pub trait BlobStore: Send + Sync + std::fmt::Debug + 'static {
    /// Open `{key}/{version}` for reading, optionally restricted to a byte
    /// range.
    async fn read(
        &self,
        key: &str,
        version: &str,
        range: Option<ByteRange>,
        cancel: &CancellationToken,
    ) -> Result<BlobObject, BlobError>;

    /// Store a payload at `{key}/{version}`.
    async fn write(
        &self,
        key: &str,
        version: &str,
        payload: BlobPayload,
        content_type: &str,
        cache_control: &str,
        user_metadata: Option<&HashMap<String, String>>,
        cancel: &CancellationToken,
    ) -> Result<BlobMetadata, BlobError>;

    /// Fetch metadata of `{key}/{version}` without the body.
    async fn head(&self, key: &str, version: &str) -> Result<BlobMetadata, BlobError>;

    /// Server-side copy `{src}/{src_version}` to `{dst}/{dst_version}`.
    async fn copy(
        &self,
        src_key: &str,
        src_version: &str,
        dst_key: &str,
        dst_version: &str,
        cancel: &CancellationToken,
    ) -> Result<BlobMetadata, BlobError>;

    /// Delete `{key}/{version}`. Deleting a missing blob is not an error.
    async fn delete(&self, key: &str, version: &str) -> Result<(), BlobError>;

    /// Delete many physical keys, chunked at [`MAX_KEYS_PER_DELETE`].
    async fn delete_many(&self, keys: Vec<String>) -> Result<(), BlobError>;

    /// List physical keys under a raw prefix, up to `max_keys`.
    async fn list(&self, prefix: &str, max_keys: Option<usize>) -> Result<Vec<String>, BlobError>;

    /// Begin a multipart upload at `{key}/{version}`; returns the backend
    /// upload id.
    async fn create_multipart(
        &self,
        key: &str,
        version: &str,
        content_type: &str,
        cache_control: &str,
    ) -> Result<String, BlobError>;

    /// Upload one part of a multipart upload.
    async fn upload_part(
        &self,
        key: &str,
        version: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
        cancel: &CancellationToken,
    ) -> Result<UploadedPart, BlobError>;

    /// List parts uploaded so far.
    async fn list_parts(
        &self,
        key: &str,
        version: &str,
        upload_id: &str,
    ) -> Result<Vec<UploadedPart>, BlobError>;

    /// Complete a multipart upload from its part list.
    async fn complete_multipart(
        &self,
        key: &str,
        version: &str,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<BlobMetadata, BlobError>;

    /// Abort a multipart upload and discard its parts.
    async fn abort_multipart(
        &self,
        key: &str,
        version: &str,
        upload_id: &str,
    ) -> Result<(), BlobError>;

    /// A URL that grants read access to `{key}/{version}` for `ttl`.
    async fn private_url(
        &self,
        key: &str,
        version: &str,
        ttl: Duration,
    ) -> Result<String, BlobError>;

    /// Whether [`BlobStore::put_raw_if_absent`] provides atomic
    /// if-none-match semantics on this backend.
    fn supports_conditional_put(&self) -> bool;

    /// Read a small control object at a raw (unversioned) key.
    async fn get_raw(&self, key: &str) -> Result<Bytes, BlobError>;

    /// Write a small control object at a raw key.
    async fn put_raw(&self, key: &str, body: Bytes) -> Result<(), BlobError>;

    /// Atomically create a raw-key object, failing with
    /// [`BlobError::Conflict`] if it already exists.
    async fn put_raw_if_absent(&self, key: &str, body: Bytes) -> Result<(), BlobError>;

    /// Delete a raw-key control object.
    async fn delete_raw(&self, key: &str) -> Result<(), BlobError>;
}

/// Join an unversioned key and version into the physical backend key.
#[must_use]
pub fn physical_key(key: &str, version: &str) -> String {
    format!("{key}/{version}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_join_physical_key() {
        assert_eq!(
            physical_key("t1/bucket/dir/file.txt", "v-1"),
            "t1/bucket/dir/file.txt/v-1"
        );
    }

    #[test]
    fn test_should_report_payload_length() {
        let mem = BlobPayload::InMemory(Bytes::from_static(b"hello"));
        assert_eq!(mem.len(), 5);
        assert!(!mem.is_empty());

        let spilled = BlobPayload::Spilled {
            path: PathBuf::from("/tmp/x"),
            len: 0,
        };
        assert!(spilled.is_empty());
    }
}
