//! Storage façade for ObjectStack.
//!
//! [`Storage`] is the entry point request handlers drive: it binds a
//! tenant-scoped database connection, the blob backend, and the tenant's
//! limits, and exposes the object and bucket operations with their
//! transactional guarantees:
//!
//! - metadata change + lifecycle event commit in the same transaction;
//! - blobs of superseded or removed versions are scheduled for deletion in
//!   that same transaction, never deleted before it commits;
//! - prefix hierarchy maintenance runs inside the deleting/moving
//!   transaction with globally ordered locks.
//!
//! Uploads go through [`Uploader`]; resumable sessions layer the `tus`
//! crate on top of it.

pub mod mime;
pub mod sink;
pub mod uploader;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use objectstack_auth::UrlSigner;
use objectstack_blob::{BlobError, BlobObject, BlobStore};
use objectstack_core::{ByteRange, ObjectPath, StorageConfig, StorageError, StorageResult};
use objectstack_db::buckets::{self, Bucket, BucketUpdate, NewBucket};
use objectstack_db::events::{Event, EventKind, EventPayload};
use objectstack_db::objects::{self, ListOptions, ListPage, ObjectRecord};
use objectstack_db::{
    DbError, DbTransaction, TenantConfig, TenantConnection, events, locks, prefixes,
    with_delete_guard,
};

pub use sink::HashingSink;
pub use uploader::{
    CompleteUpload, PlainUpload, PreparedUpload, UploadTarget, UploadType, Uploader,
};

/// Page size used when draining a bucket.
const EMPTY_BUCKET_BATCH: i64 = 1000;

/// Longest accepted bucket id.
const MAX_BUCKET_ID_LEN: usize = 100;

/// Process-level options the façade needs beyond its collaborators.
#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// In-memory ceiling before an upload spills to disk.
    pub spill_memory_limit: usize,
    /// Directory spilled uploads are written under.
    pub spill_tmp_root: PathBuf,
    /// Default TTL for signed URLs.
    pub signed_url_expiry: Duration,
}

impl From<&StorageConfig> for StorageOptions {
    fn from(config: &StorageConfig) -> Self {
        Self {
            spill_memory_limit: config.spill_memory_limit,
            spill_tmp_root: PathBuf::from(&config.spill_tmp_root),
            signed_url_expiry: config.upload_signed_url_expiry,
        }
    }
}

/// The per-request storage façade.
#[derive(Clone)]
pub struct Storage {
    conn: TenantConnection,
    blob: Arc<dyn BlobStore>,
    tenant: TenantConfig,
    options: StorageOptions,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("tenant", &self.tenant.id)
            .finish_non_exhaustive()
    }
}

impl Storage {
    /// Build a façade over a tenant connection and blob store.
    #[must_use]
    pub fn new(
        conn: TenantConnection,
        blob: Arc<dyn BlobStore>,
        tenant: TenantConfig,
        options: StorageOptions,
    ) -> Self {
        Self {
            conn,
            blob,
            tenant,
            options,
        }
    }

    /// The uploader bound to this request's connection.
    #[must_use]
    pub fn uploader(&self) -> Uploader {
        Uploader::new(self.conn.clone(), Arc::clone(&self.blob), self.tenant.clone())
    }

    /// The façade's options (spill limits, signed URL expiry).
    #[must_use]
    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    /// A signer bound to this tenant's secret.
    #[must_use]
    pub fn url_signer(&self) -> UrlSigner {
        UrlSigner::new(self.tenant.jwt_secret.as_bytes())
    }

    fn path(&self, bucket_id: &str, name: &str) -> ObjectPath {
        ObjectPath::new(self.conn.tenant_id().clone(), bucket_id, name)
    }

    // -----------------------------------------------------------------------
    // Bucket operations
    // -----------------------------------------------------------------------

    /// Create a bucket.
    pub async fn create_bucket(&self, bucket: NewBucket) -> StorageResult<Bucket> {
        validate_bucket_id(&bucket.id)?;
        let mut tx = self.conn.transaction().await.map_err(StorageError::from)?;
        let created = buckets::create(&mut tx, &bucket).await.map_err(|e| match e {
            DbError::UniqueViolation { .. } => StorageError::Conflict {
                message: format!("bucket {} already exists", bucket.id),
            },
            DbError::InsufficientPrivilege => StorageError::AccessDenied,
            other => other.into(),
        })?;
        objectstack_db::commit(tx).await.map_err(StorageError::from)?;
        Ok(created)
    }

    /// Fetch a bucket.
    pub async fn get_bucket(&self, id: &str) -> StorageResult<Bucket> {
        let mut tx = self.conn.transaction().await.map_err(StorageError::from)?;
        let bucket = buckets::get(&mut tx, id)
            .await
            .map_err(StorageError::from)?
            .ok_or_else(|| StorageError::BucketNotFound {
                bucket: id.to_owned(),
            })?;
        objectstack_db::commit(tx).await.map_err(StorageError::from)?;
        Ok(bucket)
    }

    /// List buckets.
    pub async fn list_buckets(&self, limit: i64, offset: i64) -> StorageResult<Vec<Bucket>> {
        let mut tx = self.conn.transaction().await.map_err(StorageError::from)?;
        let list = buckets::list(&mut tx, limit, offset)
            .await
            .map_err(StorageError::from)?;
        objectstack_db::commit(tx).await.map_err(StorageError::from)?;
        Ok(list)
    }

    /// Update a bucket's mutable fields.
    pub async fn update_bucket(&self, id: &str, changes: BucketUpdate) -> StorageResult<Bucket> {
        let mut tx = self.conn.transaction().await.map_err(StorageError::from)?;
        let updated = buckets::update(&mut tx, id, &changes)
            .await
            .map_err(StorageError::from)?
            .ok_or_else(|| StorageError::BucketNotFound {
                bucket: id.to_owned(),
            })?;
        objectstack_db::commit(tx).await.map_err(StorageError::from)?;
        Ok(updated)
    }

    /// Delete an empty bucket.
    pub async fn delete_bucket(&self, id: &str) -> StorageResult<()> {
        let mut tx = self.conn.transaction().await.map_err(StorageError::from)?;
        let remaining = buckets::count_objects(&mut tx, id)
            .await
            .map_err(StorageError::from)?;
        if remaining > 0 {
            return Err(StorageError::BucketNotEmpty {
                bucket: id.to_owned(),
            });
        }
        with_delete_guard(&mut tx).await.map_err(StorageError::from)?;
        let deleted = buckets::delete(&mut tx, id).await.map_err(StorageError::from)?;
        if !deleted {
            return Err(StorageError::BucketNotFound {
                bucket: id.to_owned(),
            });
        }
        objectstack_db::commit(tx).await.map_err(StorageError::from)?;
        Ok(())
    }

    /// Remove every object in a bucket, batch by batch.
    pub async fn empty_bucket(&self, id: &str, req_id: Option<&str>) -> StorageResult<u64> {
        let mut total = 0_u64;
        loop {
            let page = self
                .list_objects(
                    id,
                    &ListOptions {
                        limit: EMPTY_BUCKET_BATCH,
                        ..ListOptions::default()
                    },
                )
                .await?;
            if page.objects.is_empty() {
                break;
            }
            let names: Vec<String> = page.objects.iter().map(|o| o.name.clone()).collect();
            total += self.delete_objects(id, &names, req_id).await?.len() as u64;
            if !page.has_next {
                break;
            }
        }
        debug!(bucket = id, total, "emptied bucket");
        Ok(total)
    }

    // -----------------------------------------------------------------------
    // Object reads
    // -----------------------------------------------------------------------

    /// Fetch an object's metadata row.
    pub async fn object_info(&self, bucket_id: &str, name: &str) -> StorageResult<ObjectRecord> {
        let mut tx = self.conn.transaction().await.map_err(StorageError::from)?;
        let record = require_object(&mut tx, bucket_id, name).await?;
        objectstack_db::commit(tx).await.map_err(StorageError::from)?;
        Ok(record)
    }

    /// Open an object for reading.
    ///
    /// Returns the row and the backend stream; the stream observes the
    /// request's cancel signal.
    pub async fn read_object(
        &self,
        bucket_id: &str,
        name: &str,
        range: Option<ByteRange>,
        cancel: &CancellationToken,
    ) -> StorageResult<(ObjectRecord, BlobObject)> {
        let mut tx = self.conn.transaction().await.map_err(StorageError::from)?;
        let record = require_object(&mut tx, bucket_id, name).await?;
        objects::touch_last_accessed(&mut tx, bucket_id, name)
            .await
            .map_err(StorageError::from)?;
        objectstack_db::commit(tx).await.map_err(StorageError::from)?;

        let path = self.path(bucket_id, name);
        let blob = self
            .blob
            .read(&path.key(), &record.version.to_string(), range, cancel)
            .await
            .map_err(|e| blob_error_for(e, bucket_id, name))?;
        Ok((record, blob))
    }

    /// A presigned backend URL for direct reads.
    pub async fn private_asset_url(
        &self,
        bucket_id: &str,
        name: &str,
        ttl: Option<Duration>,
    ) -> StorageResult<String> {
        let record = self.object_info(bucket_id, name).await?;
        let path = self.path(bucket_id, name);
        self.blob
            .private_url(
                &path.key(),
                &record.version.to_string(),
                ttl.unwrap_or(self.options.signed_url_expiry),
            )
            .await
            .map_err(|e| blob_error_for(e, bucket_id, name))
    }

    /// Flat listing with cursor pagination.
    pub async fn list_objects(
        &self,
        bucket_id: &str,
        options: &ListOptions,
    ) -> StorageResult<ListPage> {
        let mut tx = self.conn.transaction().await.map_err(StorageError::from)?;
        let page = objects::list(&mut tx, bucket_id, options)
            .await
            .map_err(StorageError::from)?;
        objectstack_db::commit(tx).await.map_err(StorageError::from)?;
        Ok(page)
    }

    /// Delimiter ("folder") listing.
    pub async fn list_objects_with_delimiter(
        &self,
        bucket_id: &str,
        prefix: &str,
        limit: i64,
        cursor: Option<&str>,
    ) -> StorageResult<ListPage> {
        let mut tx = self.conn.transaction().await.map_err(StorageError::from)?;
        let page = objects::list_with_delimiter(&mut tx, bucket_id, prefix, limit, cursor)
            .await
            .map_err(StorageError::from)?;
        objectstack_db::commit(tx).await.map_err(StorageError::from)?;
        Ok(page)
    }

    // -----------------------------------------------------------------------
    // Object deletion
    // -----------------------------------------------------------------------

    /// Delete one object: row, prefixes, event, and blob GC in one
    /// transaction.
    pub async fn delete_object(
        &self,
        bucket_id: &str,
        name: &str,
        req_id: Option<&str>,
    ) -> StorageResult<ObjectRecord> {
        let deleted = self
            .delete_objects(bucket_id, std::slice::from_ref(&name.to_owned()), req_id)
            .await?;
        deleted
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::ObjectNotFound {
                bucket: bucket_id.to_owned(),
                name: name.to_owned(),
            })
    }

    /// Delete a batch of objects from one bucket.
    ///
    /// Returns the deleted rows; names that did not exist are skipped.
    pub async fn delete_objects(
        &self,
        bucket_id: &str,
        names: &[String],
        req_id: Option<&str>,
    ) -> StorageResult<Vec<ObjectRecord>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let mut tx = self.conn.transaction().await.map_err(StorageError::from)?;
        with_delete_guard(&mut tx).await.map_err(StorageError::from)?;

        let deleted = objects::delete_many(&mut tx, bucket_id, names)
            .await
            .map_err(StorageError::from)?;
        if deleted.is_empty() {
            objectstack_db::commit(tx).await.map_err(StorageError::from)?;
            return Ok(deleted);
        }

        let deleted_names: Vec<String> = deleted.iter().map(|o| o.name.clone()).collect();
        prefixes::cleanup_after_delete(&mut tx, bucket_id, &deleted_names)
            .await
            .map_err(StorageError::from)?;

        for record in &deleted {
            self.emit(
                &mut tx,
                EventKind::RemovedDelete,
                bucket_id,
                &record.name,
                record.metadata.clone(),
                record.version,
                None,
                req_id,
            )
            .await?;
            events::schedule_blob_deletion(
                &mut tx,
                self.tenant.id.as_str(),
                &self
                    .path(bucket_id, &record.name)
                    .versioned_key(&record.version.to_string()),
            )
            .await
            .map_err(StorageError::from)?;
        }

        objectstack_db::commit(tx).await.map_err(StorageError::from)?;
        debug!(bucket = bucket_id, count = deleted.len(), "deleted objects");
        Ok(deleted)
    }

    // -----------------------------------------------------------------------
    // Move / copy
    // -----------------------------------------------------------------------

    /// Move an object, possibly across buckets.
    ///
    /// The destination gets a fresh version (its blob is copied first);
    /// the row rename, prefix maintenance on both sides, both lifecycle
    /// events, and the source blob's GC schedule commit atomically.
    pub async fn move_object(
        &self,
        src_bucket: &str,
        src_name: &str,
        dst_bucket: &str,
        dst_name: &str,
        req_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> StorageResult<ObjectRecord> {
        let source = self.object_info(src_bucket, src_name).await?;
        let src_version = source.version.to_string();
        let new_version = Uuid::new_v4();

        let src_path = self.path(src_bucket, src_name);
        let dst_path = self.path(dst_bucket, dst_name);
        self.blob
            .copy(
                &src_path.key(),
                &src_version,
                &dst_path.key(),
                &new_version.to_string(),
                cancel,
            )
            .await
            .map_err(|e| blob_error_for(e, src_bucket, src_name))?;

        let result = async {
            let mut tx = self.conn.transaction().await.map_err(StorageError::from)?;
            locks::lock_object(&mut tx, dst_bucket, dst_name, &new_version.to_string())
                .await
                .map_err(StorageError::from)?;

            let moved = objects::rename(
                &mut tx,
                src_bucket,
                src_name,
                dst_bucket,
                dst_name,
                new_version,
            )
            .await
            .map_err(|e| match e {
                DbError::UniqueViolation { .. } => StorageError::Conflict {
                    message: format!("object {dst_bucket}/{dst_name} already exists"),
                },
                DbError::InsufficientPrivilege => StorageError::AccessDenied,
                other => other.into(),
            })?
            .ok_or_else(|| StorageError::ObjectNotFound {
                bucket: src_bucket.to_owned(),
                name: src_name.to_owned(),
            })?;

            prefixes::cleanup_after_delete(&mut tx, src_bucket, &[src_name.to_owned()])
                .await
                .map_err(StorageError::from)?;

            // Both events name the destination bucket.
            self.emit(
                &mut tx,
                EventKind::CreatedMove,
                dst_bucket,
                dst_name,
                moved.metadata.clone(),
                new_version,
                Some(serde_json::json!({
                    "bucketId": src_bucket,
                    "name": src_name,
                    "version": source.version,
                })),
                req_id,
            )
            .await?;
            self.emit(
                &mut tx,
                EventKind::RemovedMove,
                dst_bucket,
                src_name,
                source.metadata.clone(),
                source.version,
                None,
                req_id,
            )
            .await?;

            events::schedule_blob_deletion(
                &mut tx,
                self.tenant.id.as_str(),
                &src_path.versioned_key(&src_version),
            )
            .await
            .map_err(StorageError::from)?;

            objectstack_db::commit(tx).await.map_err(StorageError::from)?;
            Ok(moved)
        }
        .await;

        if result.is_err() {
            // The copied destination blob never became current.
            if let Err(e) = self
                .blob
                .delete(&dst_path.key(), &new_version.to_string())
                .await
            {
                tracing::warn!(key = %dst_path, error = %e, "failed to remove move leftover");
            }
        }
        result
    }

    /// Copy an object, possibly across buckets. The destination is a new
    /// object with its own version.
    pub async fn copy_object(
        &self,
        src_bucket: &str,
        src_name: &str,
        dst_bucket: &str,
        dst_name: &str,
        owner: Option<&str>,
        req_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> StorageResult<ObjectRecord> {
        let source = self.object_info(src_bucket, src_name).await?;
        let new_version = Uuid::new_v4();

        let src_path = self.path(src_bucket, src_name);
        let dst_path = self.path(dst_bucket, dst_name);
        let blob_meta = self
            .blob
            .copy(
                &src_path.key(),
                &source.version.to_string(),
                &dst_path.key(),
                &new_version.to_string(),
                cancel,
            )
            .await
            .map_err(|e| blob_error_for(e, src_bucket, src_name))?;

        let result = async {
            let mut tx = self.conn.transaction().await.map_err(StorageError::from)?;
            objects::insert_pending(
                &mut tx,
                dst_bucket,
                dst_name,
                new_version,
                owner,
                source.user_metadata.as_ref(),
            )
            .await
            .map_err(|e| match e {
                DbError::UniqueViolation { .. } => StorageError::Conflict {
                    message: format!("object {dst_bucket}/{dst_name} already exists"),
                },
                DbError::InsufficientPrivilege => StorageError::AccessDenied,
                other => other.into(),
            })?;

            let metadata = uploader::system_metadata(&blob_meta);
            let committed = objects::commit(
                &mut tx,
                dst_bucket,
                dst_name,
                new_version,
                &metadata,
                source.user_metadata.as_ref(),
                owner,
            )
            .await
            .map_err(StorageError::from)?
            .ok_or_else(|| StorageError::Conflict {
                message: "copy destination changed concurrently".to_owned(),
            })?;

            self.emit(
                &mut tx,
                EventKind::CreatedCopy,
                dst_bucket,
                dst_name,
                Some(metadata),
                new_version,
                Some(serde_json::json!({
                    "bucketId": src_bucket,
                    "name": src_name,
                    "version": source.version,
                })),
                req_id,
            )
            .await?;

            objectstack_db::commit(tx).await.map_err(StorageError::from)?;
            Ok(committed)
        }
        .await;

        if result.is_err() {
            if let Err(e) = self
                .blob
                .delete(&dst_path.key(), &new_version.to_string())
                .await
            {
                tracing::warn!(key = %dst_path, error = %e, "failed to remove copy leftover");
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn emit(
        &self,
        tx: &mut DbTransaction,
        kind: EventKind,
        bucket_id: &str,
        name: &str,
        metadata: Option<serde_json::Value>,
        version: Uuid,
        old_object: Option<serde_json::Value>,
        req_id: Option<&str>,
    ) -> StorageResult<()> {
        let event = Event {
            version: version.to_string(),
            event_type: kind,
            apply_time: chrono::Utc::now(),
            payload: EventPayload {
                bucket_id: bucket_id.to_owned(),
                name: name.to_owned(),
                metadata,
                tenant: self.tenant.id.as_str().to_owned(),
                req_id: req_id.map(ToOwned::to_owned),
                old_object,
            },
            tenant: self.tenant.id.as_str().to_owned(),
        };
        events::enqueue(tx, &event)
            .await
            .map_err(StorageError::from)?;
        Ok(())
    }
}

async fn require_object(
    tx: &mut DbTransaction,
    bucket_id: &str,
    name: &str,
) -> StorageResult<ObjectRecord> {
    objects::find_by_name(tx, bucket_id, name)
        .await
        .map_err(StorageError::from)?
        .ok_or_else(|| StorageError::ObjectNotFound {
            bucket: bucket_id.to_owned(),
            name: name.to_owned(),
        })
}

/// Validate a caller-supplied bucket id.
fn validate_bucket_id(id: &str) -> StorageResult<()> {
    if id.is_empty() || id.len() > MAX_BUCKET_ID_LEN {
        return Err(StorageError::InvalidParameter {
            message: format!("bucket id must be 1-{MAX_BUCKET_ID_LEN} characters"),
        });
    }
    if id.contains('/') {
        return Err(StorageError::InvalidParameter {
            message: "bucket id must not contain '/'".to_owned(),
        });
    }
    Ok(())
}

/// Map a blob-layer failure onto the logical object it was about.
///
/// The adapter only knows the versioned physical key, which must never be
/// rendered as an object name; every blob operation performed on behalf of
/// a known `(bucket, name)` goes through this instead of the blanket
/// `From<BlobError>` conversion, so absence surfaces as a clean
/// `ObjectNotFound` for the logical key.
#[must_use]
pub fn blob_error_for(err: BlobError, bucket_id: &str, name: &str) -> StorageError {
    match err {
        BlobError::NotFound { .. } => StorageError::ObjectNotFound {
            bucket: bucket_id.to_owned(),
            name: name.to_owned(),
        },
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_validate_bucket_ids() {
        assert!(validate_bucket_id("b-1").is_ok());
        assert!(validate_bucket_id("").is_err());
        assert!(validate_bucket_id("has/slash").is_err());
        assert!(validate_bucket_id(&"x".repeat(101)).is_err());
    }

    #[test]
    fn test_should_map_blob_not_found_to_logical_object() {
        // The versioned physical key the adapter reports is discarded; the
        // rendered error names the logical object only.
        let err = BlobError::NotFound {
            key: "t1/avatars/users/1/pic.png/3fa85f64-5717-4562-b3fc-2c963f66afa6".to_owned(),
        };
        match blob_error_for(err, "avatars", "users/1/pic.png") {
            StorageError::ObjectNotFound { bucket, name } => {
                assert_eq!(bucket, "avatars");
                assert_eq!(name, "users/1/pic.png");
            }
            other => panic!("unexpected mapping: {other:?}"),
        }
    }

    #[test]
    fn test_should_pass_through_non_absence_blob_errors() {
        let err = BlobError::BackendUnavailable {
            message: "503".to_owned(),
        };
        assert!(matches!(
            blob_error_for(err, "avatars", "users/1/pic.png"),
            StorageError::BackendUnavailable { .. }
        ));
    }
}
