//! Resumable upload lifecycle.
//!
//! [`TusLifecycle`] carries the hooks the protocol handlers drive:
//! create (POST), append (PATCH), status (HEAD), abort (DELETE). The
//! handlers own protocol concerns (headers, status codes); everything
//! stateful happens here, delegated to the [`Uploader`] for the two-phase
//! object lifecycle and serialized per upload id by the configured
//! [`UploadLocker`].
//!
//! A holder that receives a release request finishes its current request
//! and unlocks; serving one request per lock acquisition is what makes the
//! hand-off cooperative.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::{StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use objectstack_auth::{UrlSigner, VerifiedUpload};
use objectstack_blob::{BlobStore, ByteStream, DEFAULT_CONTENT_TYPE, UploadedPart};
use objectstack_core::{ObjectPath, StorageError, StorageResult, TusConfig};
use objectstack_db::objects::ObjectRecord;
use objectstack_storage::mime::normalize_cache_control;
use objectstack_storage::{CompleteUpload, StorageOptions, UploadTarget, UploadType, Uploader};

use crate::info::{self, StoredPart, UploadInfo};
use crate::locker::UploadLocker;
use crate::upload_id::UploadId;

/// Parameters of a session creation (TUS POST).
#[derive(Debug, Clone, Default)]
pub struct CreateUpload {
    /// `Upload-Length`, when declared up front.
    pub declared_size: Option<u64>,
    /// Declared content type from `Upload-Metadata`.
    pub content_type: Option<String>,
    /// Raw cache-control metadata value.
    pub cache_control: Option<String>,
    /// Remaining opaque metadata.
    pub user_metadata: Option<serde_json::Value>,
    /// Owner to attribute the object to.
    pub owner: Option<String>,
    /// Whether the session may replace an existing object.
    pub is_upsert: bool,
}

/// The resumable upload state machine.
pub struct TusLifecycle {
    uploader: Uploader,
    blob: Arc<dyn BlobStore>,
    locker: Arc<dyn UploadLocker>,
    tus: TusConfig,
    spill_memory_limit: usize,
    spill_tmp_root: PathBuf,
}

impl std::fmt::Debug for TusLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TusLifecycle")
            .field("part_size", &self.tus.part_size)
            .finish_non_exhaustive()
    }
}

impl TusLifecycle {
    /// Assemble the lifecycle from its collaborators.
    #[must_use]
    pub fn new(
        uploader: Uploader,
        blob: Arc<dyn BlobStore>,
        locker: Arc<dyn UploadLocker>,
        tus: TusConfig,
        options: &StorageOptions,
    ) -> Self {
        Self {
            uploader,
            blob,
            locker,
            tus,
            spill_memory_limit: options.spill_memory_limit,
            spill_tmp_root: options.spill_tmp_root.clone(),
        }
    }

    fn target(&self, id: &UploadId, owner: Option<String>, is_upsert: bool) -> UploadTarget {
        UploadTarget {
            bucket_id: id.bucket_id.clone(),
            object_name: id.object_name.clone(),
            owner,
            is_upsert,
        }
    }

    fn path(&self, id: &UploadId) -> ObjectPath {
        ObjectPath::new(
            id.tenant_id.clone(),
            id.bucket_id.clone(),
            id.object_name.clone(),
        )
    }

    /// Authorization probe run on every request except OPTIONS/HEAD.
    pub async fn check_access(
        &self,
        id: &UploadId,
        owner: Option<&str>,
        is_upsert: bool,
    ) -> StorageResult<()> {
        self.uploader
            .can_upload(&self.target(id, owner.map(ToOwned::to_owned), is_upsert))
            .await
    }

    /// Verify a signed-upload token against this upload's resource path.
    pub fn verify_signature(
        &self,
        signer: &UrlSigner,
        token: &str,
        id: &UploadId,
    ) -> StorageResult<VerifiedUpload> {
        signer
            .verify_upload_url(token, &id.signed_url_resource())
            .map_err(Into::into)
    }

    /// Create a session: validates the bucket and limits, reserves the
    /// version carried by the id, opens the backend multipart upload, and
    /// persists the initial state.
    pub async fn create(
        &self,
        id: &UploadId,
        params: CreateUpload,
        cancel: &CancellationToken,
    ) -> StorageResult<UploadInfo> {
        let target = self.target(id, params.owner.clone(), params.is_upsert);
        self.uploader.can_upload(&target).await?;

        let prepared = self
            .uploader
            .prepare_upload(
                &target,
                params.content_type.as_deref(),
                params.declared_size,
                params.user_metadata.as_ref(),
                Some(id.version),
            )
            .await?;

        let cache_control = normalize_cache_control(params.cache_control.as_deref());
        let content_type = params
            .content_type
            .clone()
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_owned());

        let path = self.path(id);
        let multipart_upload_id = match self
            .blob
            .create_multipart(&path.key(), &id.version.to_string(), &content_type, &cache_control)
            .await
        {
            Ok(upload_id) => upload_id,
            Err(e) => {
                self.uploader
                    .abort_prepared(&target, prepared.superseded_version)
                    .await;
                return Err(e.into());
            }
        };

        let upload_info = UploadInfo {
            offset: 0,
            size: params.declared_size,
            content_type: params.content_type,
            cache_control,
            user_metadata: params.user_metadata,
            owner: params.owner,
            is_upsert: params.is_upsert,
            expires_at: chrono::Utc::now()
                + chrono::Duration::from_std(self.tus.url_expiry)
                    .unwrap_or(chrono::Duration::hours(24)),
            multipart_upload_id,
            parts: Vec::new(),
            superseded_version: prepared.superseded_version,
        };
        info::save(self.blob.as_ref(), id, &upload_info).await?;

        if cancel.is_cancelled() {
            // The client went away mid-create; leave a resumable session
            // behind, it expires on its own.
            debug!(%id, "client disconnected during session create");
        }
        debug!(%id, size = ?upload_info.size, "created resumable session");
        Ok(upload_info)
    }

    /// Session status for HEAD (`Upload-Offset` / `Upload-Length`).
    pub async fn status(&self, id: &UploadId) -> StorageResult<UploadInfo> {
        let info = info::load(self.blob.as_ref(), id)
            .await?
            .ok_or_else(|| session_not_found(id))?;
        if info.is_expired() {
            return Err(session_not_found(id));
        }
        Ok(info)
    }

    /// Append bytes at `expected_offset` (TUS PATCH).
    ///
    /// Serialized per upload id by the locker. When the declared size is
    /// reached the upload finishes: backend multipart completes and the
    /// object commits with `uploadType = resumable`.
    pub async fn append(
        &self,
        id: &UploadId,
        expected_offset: u64,
        body: ByteStream,
        cancel: &CancellationToken,
    ) -> StorageResult<UploadInfo> {
        let lock = self.locker.lock(id, cancel).await?;
        let result = self.append_locked(id, expected_offset, body, cancel).await;
        if let Err(e) = lock.unlock().await {
            warn!(%id, error = %e, "failed to release upload lock");
        }
        result
    }

    async fn append_locked(
        &self,
        id: &UploadId,
        expected_offset: u64,
        body: ByteStream,
        cancel: &CancellationToken,
    ) -> StorageResult<UploadInfo> {
        let mut info = info::load(self.blob.as_ref(), id)
            .await?
            .ok_or_else(|| session_not_found(id))?;
        if info.is_expired() {
            return Err(session_not_found(id));
        }
        if info.offset != expected_offset {
            return Err(StorageError::Conflict {
                message: format!(
                    "upload offset mismatch: expected {}, got {expected_offset}",
                    info.offset
                ),
            });
        }

        // Stage the request body so parts have known sizes.
        let mut sink =
            objectstack_storage::HashingSink::new(self.spill_memory_limit, &self.spill_tmp_root);
        let staged = match cancel
            .run_until_cancelled(async {
                sink.write_stream(body).await?;
                sink.finish().await
            })
            .await
        {
            Some(result) => result,
            None => Err(StorageError::Internal(anyhow::anyhow!(
                "upload interrupted by client disconnect"
            ))),
        };
        staged?;

        if let Some(size) = info.size {
            if info.offset + sink.size() > size {
                sink.cleanup().await;
                return Err(StorageError::EntityTooLarge {
                    size: info.offset + sink.size(),
                    limit: size,
                });
            }
        }

        let path = self.path(id);
        let version = id.version.to_string();
        let chunks = split_into_parts(&sink, self.tus.part_size).await?;
        let first_part = info.next_part_number();

        let uploads = chunks.into_iter().enumerate().map(|(i, chunk)| {
            let blob = Arc::clone(&self.blob);
            let key = path.key();
            let version = version.clone();
            let upload_id = info.multipart_upload_id.clone();
            let part_number = first_part + i as i32;
            let size = chunk.len() as u64;
            let cancel = cancel.clone();
            async move {
                blob.upload_part(&key, &version, &upload_id, part_number, chunk, &cancel)
                    .await
                    .map(|part| StoredPart {
                        part_number: part.part_number,
                        etag: part.etag,
                        size,
                    })
            }
        });
        // Bounded parallelism, completion collected in part order.
        let uploaded: Vec<StoredPart> = futures::stream::iter(uploads)
            .buffered(self.tus.max_concurrent_uploads.max(1))
            .try_collect()
            .await
            .map_err(StorageError::from)?;

        info.offset += sink.size();
        info.parts.extend(uploaded);
        sink.cleanup().await;
        info::save(self.blob.as_ref(), id, &info).await?;

        if info.is_complete() {
            self.finish(id, &mut info).await?;
        }
        Ok(info)
    }

    /// Abort a session (TUS DELETE): backend multipart, session state, and
    /// the pending reservation are all discarded.
    pub async fn abort(&self, id: &UploadId, cancel: &CancellationToken) -> StorageResult<()> {
        let lock = self.locker.lock(id, cancel).await?;
        let result = self.abort_locked(id).await;
        if let Err(e) = lock.unlock().await {
            warn!(%id, error = %e, "failed to release upload lock");
        }
        result
    }

    async fn abort_locked(&self, id: &UploadId) -> StorageResult<()> {
        let Some(upload_info) = info::load(self.blob.as_ref(), id).await? else {
            return Ok(());
        };

        let path = self.path(id);
        if let Err(e) = self
            .blob
            .abort_multipart(
                &path.key(),
                &id.version.to_string(),
                &upload_info.multipart_upload_id,
            )
            .await
        {
            warn!(%id, error = %e, "failed to abort backend multipart upload");
        }
        info::delete(self.blob.as_ref(), id).await?;

        let target = self.target(id, upload_info.owner.clone(), upload_info.is_upsert);
        self.uploader
            .abort_prepared(&target, upload_info.superseded_version)
            .await;

        debug!(%id, "aborted resumable session");
        Ok(())
    }

    /// Complete the backend upload and commit the object.
    async fn finish(&self, id: &UploadId, info_state: &mut UploadInfo) -> StorageResult<()> {
        let path = self.path(id);
        let version = id.version.to_string();

        if info_state.parts.is_empty() {
            // Zero-byte upload: multipart cannot complete with no parts.
            self.blob
                .abort_multipart(&path.key(), &version, &info_state.multipart_upload_id)
                .await
                .ok();
            self.blob
                .write(
                    &path.key(),
                    &version,
                    objectstack_blob::BlobPayload::InMemory(Bytes::new()),
                    info_state
                        .content_type
                        .as_deref()
                        .unwrap_or(DEFAULT_CONTENT_TYPE),
                    &info_state.cache_control,
                    None,
                    &CancellationToken::new(),
                )
                .await?;
        } else {
            let parts: Vec<UploadedPart> = info_state
                .parts
                .iter()
                .map(|p| UploadedPart {
                    part_number: p.part_number,
                    etag: p.etag.clone(),
                })
                .collect();
            self.blob
                .complete_multipart(
                    &path.key(),
                    &version,
                    &info_state.multipart_upload_id,
                    &parts,
                )
                .await?;
        }

        let committed = self
            .uploader
            .complete_upload(CompleteUpload {
                version: id.version,
                bucket_id: id.bucket_id.clone(),
                object_name: id.object_name.clone(),
                is_upsert: info_state.is_upsert,
                upload_type: UploadType::Resumable,
                owner: info_state.owner.clone(),
                user_metadata: info_state.user_metadata.clone(),
                superseded_version: info_state.superseded_version,
                req_id: None,
            })
            .await;

        // The session is finished either way; the uploader already
        // scheduled the losing blob for deletion on failure.
        info::delete(self.blob.as_ref(), id).await?;
        committed.map(drop)
    }
}

/// The committed record type returned by a finished upload.
pub type FinishedUpload = ObjectRecord;

fn session_not_found(id: &UploadId) -> StorageError {
    StorageError::ObjectNotFound {
        bucket: id.bucket_id.clone(),
        name: id.object_name.clone(),
    }
}

/// Cut a staged payload into backend parts of at most `part_size` bytes.
async fn split_into_parts(
    sink: &objectstack_storage::HashingSink,
    part_size: u64,
) -> StorageResult<Vec<Bytes>> {
    let part_size = usize::try_from(part_size.max(1)).unwrap_or(usize::MAX);
    let mut stream = sink.to_readable(false).await?;
    let mut parts = Vec::new();
    let mut current = BytesMut::new();

    while let Some(chunk) = stream.next().await {
        let mut chunk = chunk.map_err(|e| StorageError::Internal(anyhow::anyhow!(e)))?;
        while !chunk.is_empty() {
            let room = part_size - current.len();
            let take = room.min(chunk.len());
            current.extend_from_slice(&chunk.split_to(take));
            if current.len() == part_size {
                parts.push(current.split().freeze());
            }
        }
    }
    if !current.is_empty() {
        parts.push(current.freeze());
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use objectstack_storage::HashingSink;

    async fn parts_for(data: &[u8], limit: usize, part_size: u64) -> Vec<Bytes> {
        let tmp = tempfile::tempdir().unwrap();
        let mut sink = HashingSink::new(limit, tmp.path());
        sink.write(data).await.unwrap();
        sink.finish().await.unwrap();
        let parts = split_into_parts(&sink, part_size).await.unwrap();
        sink.cleanup().await;
        parts
    }

    #[tokio::test]
    async fn test_should_split_payload_into_equal_parts_with_tail() {
        let data: Vec<u8> = (0..=255_u8).cycle().take(2500).collect();
        let parts = parts_for(&data, 128, 1000).await;
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 1000);
        assert_eq!(parts[1].len(), 1000);
        assert_eq!(parts[2].len(), 500);

        let rejoined: Vec<u8> = parts.iter().flat_map(|p| p.iter().copied()).collect();
        assert_eq!(rejoined, data);
    }

    #[tokio::test]
    async fn test_should_emit_single_part_for_small_payload() {
        let parts = parts_for(b"hello", 1024, 1000).await;
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].as_ref(), b"hello");
    }

    #[tokio::test]
    async fn test_should_emit_no_parts_for_empty_payload() {
        let parts = parts_for(b"", 1024, 1000).await;
        assert!(parts.is_empty());
    }
}
