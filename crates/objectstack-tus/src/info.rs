//! Server-side resumable upload state.
//!
//! Each session's state (offset, declared size, metadata, expiry, backend
//! multipart bookkeeping) is a JSON control object at
//! `__tus_info/{tenant}/{id}.info`, persisted through the blob backend so
//! every worker process sees the same session.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use objectstack_blob::{BlobError, BlobStore};
use objectstack_core::{StorageError, StorageResult};

use crate::upload_id::UploadId;

/// One uploaded part recorded in the session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoredPart {
    /// 1-based part number at the backend.
    pub part_number: i32,
    /// Backend entity tag.
    pub etag: String,
    /// Part length in bytes.
    pub size: u64,
}

/// Persisted state of a resumable upload session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadInfo {
    /// Bytes accepted so far.
    pub offset: u64,
    /// Declared total size (`Upload-Length`), when known.
    pub size: Option<u64>,
    /// Declared content type.
    pub content_type: Option<String>,
    /// Normalized cache-control directive.
    pub cache_control: String,
    /// Opaque caller metadata.
    pub user_metadata: Option<serde_json::Value>,
    /// Owner to attribute the object to.
    pub owner: Option<String>,
    /// Whether the session may replace an existing object.
    pub is_upsert: bool,
    /// When the session (and its URL) stops being valid.
    pub expires_at: DateTime<Utc>,
    /// Backend multipart upload id.
    pub multipart_upload_id: String,
    /// Parts uploaded so far, in order.
    pub parts: Vec<StoredPart>,
    /// The version this session supersedes on completion, for upserts.
    pub superseded_version: Option<Uuid>,
}

impl UploadInfo {
    /// Whether the session's expiry has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at < Utc::now()
    }

    /// Whether every declared byte has arrived.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.size.is_some_and(|size| self.offset >= size)
    }

    /// The next backend part number.
    #[must_use]
    pub fn next_part_number(&self) -> i32 {
        self.parts.last().map_or(1, |p| p.part_number + 1)
    }
}

/// Load a session's state; `None` when the session does not exist.
pub async fn load(blob: &dyn BlobStore, id: &UploadId) -> StorageResult<Option<UploadInfo>> {
    match blob.get_raw(&id.info_key()).await {
        Ok(bytes) => {
            let info = serde_json::from_slice(&bytes).map_err(|e| {
                StorageError::Internal(anyhow::anyhow!("corrupt upload info for {id}: {e}"))
            })?;
            Ok(Some(info))
        }
        Err(BlobError::NotFound { .. }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Persist a session's state.
pub async fn save(blob: &dyn BlobStore, id: &UploadId, info: &UploadInfo) -> StorageResult<()> {
    let bytes = serde_json::to_vec(info)
        .map_err(|e| StorageError::Internal(anyhow::anyhow!("serialize upload info: {e}")))?;
    blob.put_raw(&id.info_key(), Bytes::from(bytes))
        .await
        .map_err(Into::into)
}

/// Remove a session's state. Idempotent.
pub async fn delete(blob: &dyn BlobStore, id: &UploadId) -> StorageResult<()> {
    blob.delete_raw(&id.info_key()).await.map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> UploadInfo {
        UploadInfo {
            offset: 0,
            size: Some(100),
            content_type: Some("application/octet-stream".to_owned()),
            cache_control: "no-cache".to_owned(),
            user_metadata: None,
            owner: None,
            is_upsert: false,
            expires_at: Utc::now() + chrono::Duration::hours(1),
            multipart_upload_id: "mp-1".to_owned(),
            parts: Vec::new(),
            superseded_version: None,
        }
    }

    #[test]
    fn test_should_report_completion_by_offset() {
        let mut i = info();
        assert!(!i.is_complete());
        i.offset = 100;
        assert!(i.is_complete());
        i.size = None;
        assert!(!i.is_complete());
    }

    #[test]
    fn test_should_number_parts_sequentially() {
        let mut i = info();
        assert_eq!(i.next_part_number(), 1);
        i.parts.push(StoredPart {
            part_number: 1,
            etag: "a".to_owned(),
            size: 10,
        });
        i.parts.push(StoredPart {
            part_number: 2,
            etag: "b".to_owned(),
            size: 10,
        });
        assert_eq!(i.next_part_number(), 3);
    }

    #[test]
    fn test_should_detect_expiry() {
        let mut i = info();
        assert!(!i.is_expired());
        i.expires_at = Utc::now() - chrono::Duration::seconds(1);
        assert!(i.is_expired());
    }
}
