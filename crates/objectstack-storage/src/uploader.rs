//! Two-phase upload pipeline.
//!
//! Every byte path (plain, multipart, resumable) persists an object in two
//! phases: a pending metadata row carrying a fresh version UUID is written
//! first (under the caller's authorization), the bytes go to the blob
//! backend at `{key}/{version}`, and a final transaction commits the system
//! metadata, enqueues the lifecycle event, and schedules the superseded
//! version's blob for deletion. The blob of a version that lost (failed
//! commit, concurrent replacement) is scheduled for deletion instead,
//! never the committed one.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use objectstack_blob::{BlobError, BlobMetadata, BlobStore, ByteStream, DEFAULT_CONTENT_TYPE};
use objectstack_core::{ObjectPath, StorageError, StorageResult};
use objectstack_db::buckets::{self, Bucket};
use objectstack_db::events::{Event, EventKind, EventPayload};
use objectstack_db::objects::{self, ObjectRecord};
use objectstack_db::{DbError, TenantConfig, TenantConnection, events, locks, with_delete_guard};

use crate::mime::{normalize_cache_control, validate_mime_type};
use crate::sink::HashingSink;

/// How the bytes arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadType {
    /// Single-request body.
    Plain,
    /// Backend multipart assembly.
    Multipart,
    /// Resumable protocol session.
    Resumable,
}

impl UploadType {
    /// Stable name used in logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Multipart => "multipart",
            Self::Resumable => "resumable",
        }
    }
}

/// The logical destination of an upload.
#[derive(Debug, Clone)]
pub struct UploadTarget {
    /// Destination bucket.
    pub bucket_id: String,
    /// Destination object name.
    pub object_name: String,
    /// Owner to attribute the object to.
    pub owner: Option<String>,
    /// Whether an existing object may be replaced.
    pub is_upsert: bool,
}

/// Outcome of the reservation phase.
#[derive(Debug, Clone)]
pub struct PreparedUpload {
    /// The version minted for this attempt.
    pub version: Uuid,
    /// The version this upload replaces, for upserts over existing objects.
    pub superseded_version: Option<Uuid>,
    /// The destination bucket row (limits, MIME allow list).
    pub bucket: Bucket,
    /// Effective size ceiling: min(bucket limit, tenant limit).
    pub size_ceiling: u64,
}

/// Parameters of the commit phase.
#[derive(Debug, Clone)]
pub struct CompleteUpload {
    /// The version written to the backend.
    pub version: Uuid,
    /// Destination bucket.
    pub bucket_id: String,
    /// Destination object name.
    pub object_name: String,
    /// Whether this was an upsert.
    pub is_upsert: bool,
    /// How the bytes arrived.
    pub upload_type: UploadType,
    /// Owner to attribute the object to.
    pub owner: Option<String>,
    /// Opaque caller metadata.
    pub user_metadata: Option<serde_json::Value>,
    /// The replaced version whose blob is scheduled for deletion on commit.
    pub superseded_version: Option<Uuid>,
    /// Request id carried into the event payload.
    pub req_id: Option<String>,
}

/// A plain (single-request) upload.
#[derive(Debug, Clone)]
pub struct PlainUpload {
    /// Destination.
    pub target: UploadTarget,
    /// Declared content type.
    pub content_type: Option<String>,
    /// Raw cache-control metadata (normalized before storage).
    pub cache_control: Option<String>,
    /// Opaque caller metadata.
    pub user_metadata: Option<serde_json::Value>,
    /// Content-Length when the transport provides it.
    pub declared_size: Option<u64>,
    /// Request id for events.
    pub req_id: Option<String>,
}

/// The two-phase uploader bound to one tenant connection.
#[derive(Clone)]
pub struct Uploader {
    conn: TenantConnection,
    blob: Arc<dyn BlobStore>,
    tenant: TenantConfig,
}

impl std::fmt::Debug for Uploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uploader")
            .field("tenant", &self.tenant.id)
            .finish_non_exhaustive()
    }
}

impl Uploader {
    /// Bind an uploader to a connection, blob store, and tenant limits.
    #[must_use]
    pub fn new(conn: TenantConnection, blob: Arc<dyn BlobStore>, tenant: TenantConfig) -> Self {
        Self { conn, blob, tenant }
    }

    /// Whether the caller would be allowed to INSERT (new) or UPDATE
    /// (upsert) the target object.
    ///
    /// Probes the store under the caller's authorization inside a rolled
    /// back transaction, so row policies decide without side effects.
    ///
    /// # Errors
    ///
    /// - [`StorageError::AccessDenied`] when neither write is permitted.
    /// - [`StorageError::Conflict`] when the object exists and upsert was
    ///   not requested.
    pub async fn can_upload(&self, target: &UploadTarget) -> StorageResult<()> {
        let mut tx = self.conn.transaction().await.map_err(StorageError::from)?;
        let probe_version = Uuid::new_v4();

        let outcome = async {
            if target.is_upsert {
                let updated = objects::update_pending_version(
                    &mut tx,
                    &target.bucket_id,
                    &target.object_name,
                    probe_version,
                    target.owner.as_deref(),
                )
                .await?;
                if updated.is_some() {
                    return Ok(());
                }
            }
            objects::insert_pending(
                &mut tx,
                &target.bucket_id,
                &target.object_name,
                probe_version,
                target.owner.as_deref(),
                None,
            )
            .await
            .map(|_| ())
        }
        .await;

        // The probe must never persist.
        if let Err(e) = tx.rollback().await {
            warn!(error = %e, "failed to roll back can_upload probe");
        }

        outcome.map_err(|e| match e {
            DbError::InsufficientPrivilege => StorageError::AccessDenied,
            DbError::UniqueViolation { .. } => StorageError::Conflict {
                message: format!(
                    "object {}/{} already exists",
                    target.bucket_id, target.object_name
                ),
            },
            other => other.into(),
        })
    }

    /// Reserve a version for an upload: validates the bucket, MIME type,
    /// and declared size, then writes the pending row under the
    /// `(bucket, name, version)` advisory lock.
    ///
    /// Resumable uploads mint the version up front (it is embedded in the
    /// upload id) and pass it in; plain uploads let this method mint one.
    pub async fn prepare_upload(
        &self,
        target: &UploadTarget,
        content_type: Option<&str>,
        declared_size: Option<u64>,
        user_metadata: Option<&serde_json::Value>,
        version: Option<Uuid>,
    ) -> StorageResult<PreparedUpload> {
        let mut tx = self.conn.transaction().await.map_err(StorageError::from)?;

        let bucket = buckets::get(&mut tx, &target.bucket_id)
            .await
            .map_err(StorageError::from)?
            .ok_or_else(|| StorageError::BucketNotFound {
                bucket: target.bucket_id.clone(),
            })?;

        if let Some(ct) = content_type {
            validate_mime_type(ct, bucket.allowed_mime_types.as_deref())?;
        }

        let size_ceiling = self.size_ceiling(&bucket);
        if let Some(size) = declared_size {
            if size > size_ceiling {
                return Err(StorageError::EntityTooLarge {
                    size,
                    limit: size_ceiling,
                });
            }
        }

        let version = version.unwrap_or_else(Uuid::new_v4);
        locks::lock_object(&mut tx, &target.bucket_id, &target.object_name, &version.to_string())
            .await
            .map_err(StorageError::from)?;

        let existing = objects::find_by_name(&mut tx, &target.bucket_id, &target.object_name)
            .await
            .map_err(StorageError::from)?;

        let superseded_version = match existing {
            Some(existing) if target.is_upsert => {
                objects::update_pending_version(
                    &mut tx,
                    &target.bucket_id,
                    &target.object_name,
                    version,
                    target.owner.as_deref(),
                )
                .await
                .map_err(map_write_error)?;
                Some(existing.version)
            }
            Some(_) => {
                return Err(StorageError::Conflict {
                    message: format!(
                        "object {}/{} already exists",
                        target.bucket_id, target.object_name
                    ),
                });
            }
            None => {
                objects::insert_pending(
                    &mut tx,
                    &target.bucket_id,
                    &target.object_name,
                    version,
                    target.owner.as_deref(),
                    user_metadata,
                )
                .await
                .map_err(map_write_error)?;
                None
            }
        };

        objectstack_db::commit(tx).await.map_err(StorageError::from)?;

        debug!(
            bucket = target.bucket_id,
            name = target.object_name,
            %version,
            upsert = target.is_upsert,
            "prepared upload"
        );
        Ok(PreparedUpload {
            version,
            superseded_version,
            bucket,
            size_ceiling,
        })
    }

    /// Commit an upload whose blob already exists at `{key}/{version}`.
    ///
    /// Within one transaction: the final object row, the lifecycle event,
    /// and the superseded blob's deletion schedule. Fails
    /// [`StorageError::ResourceLocked`] when a concurrent writer already
    /// replaced this version.
    pub async fn complete_upload(&self, params: CompleteUpload) -> StorageResult<ObjectRecord> {
        let path = ObjectPath::new(
            self.conn.tenant_id().clone(),
            params.bucket_id.clone(),
            params.object_name.clone(),
        );
        let version = params.version.to_string();

        // Pre-condition: the blob is in place. Its head supplies the system
        // metadata of record.
        let blob_meta = match self.blob.head(&path.key(), &version).await {
            Ok(meta) => meta,
            Err(BlobError::NotFound { .. }) => {
                return Err(StorageError::ObjectNotFound {
                    bucket: params.bucket_id.clone(),
                    name: params.object_name.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let result = self.commit_row(&params, &path, &blob_meta).await;
        if result.is_err() {
            // The new version never became current; schedule its blob away.
            self.schedule_orphan(&path, &version).await;
        }
        result
    }

    async fn commit_row(
        &self,
        params: &CompleteUpload,
        path: &ObjectPath,
        blob_meta: &BlobMetadata,
    ) -> StorageResult<ObjectRecord> {
        let version = params.version.to_string();
        let mut tx = self.conn.transaction().await.map_err(StorageError::from)?;

        // Re-check quota against what actually landed at the backend.
        let bucket = buckets::get(&mut tx, &params.bucket_id)
            .await
            .map_err(StorageError::from)?
            .ok_or_else(|| StorageError::BucketNotFound {
                bucket: params.bucket_id.clone(),
            })?;
        let ceiling = self.size_ceiling(&bucket);
        if blob_meta.size > ceiling {
            return Err(StorageError::EntityTooLarge {
                size: blob_meta.size,
                limit: ceiling,
            });
        }

        locks::lock_object(&mut tx, &params.bucket_id, &params.object_name, &version)
            .await
            .map_err(StorageError::from)?;

        let old = objects::find_by_name(&mut tx, &params.bucket_id, &params.object_name)
            .await
            .map_err(StorageError::from)?;

        let metadata = system_metadata(blob_meta);
        let committed = objects::commit(
            &mut tx,
            &params.bucket_id,
            &params.object_name,
            params.version,
            &metadata,
            params.user_metadata.as_ref(),
            params.owner.as_deref(),
        )
        .await
        .map_err(StorageError::from)?
        .ok_or_else(|| StorageError::ResourceLocked {
            key: locks::object_lock_key(&params.bucket_id, &params.object_name, &version),
        })?;

        let kind = if params.superseded_version.is_some() {
            EventKind::CreatedPut
        } else {
            EventKind::CreatedPost
        };
        let event = Event {
            version: version.clone(),
            event_type: kind,
            apply_time: chrono::Utc::now(),
            payload: EventPayload {
                bucket_id: params.bucket_id.clone(),
                name: params.object_name.clone(),
                metadata: Some(metadata.clone()),
                tenant: self.tenant.id.as_str().to_owned(),
                req_id: params.req_id.clone(),
                old_object: old
                    .filter(|_| params.superseded_version.is_some())
                    .map(|o| object_summary(&o)),
            },
            tenant: self.tenant.id.as_str().to_owned(),
        };
        events::enqueue(&mut tx, &event)
            .await
            .map_err(StorageError::from)?;

        if let Some(superseded) = params.superseded_version {
            if superseded != params.version {
                events::schedule_blob_deletion(
                    &mut tx,
                    self.tenant.id.as_str(),
                    &path.versioned_key(&superseded.to_string()),
                )
                .await
                .map_err(StorageError::from)?;
            }
        }

        objectstack_db::commit(tx).await.map_err(StorageError::from)?;

        debug!(
            bucket = params.bucket_id,
            name = params.object_name,
            version = %params.version,
            upload_type = params.upload_type.as_str(),
            size = blob_meta.size,
            "completed upload"
        );
        Ok(committed)
    }

    /// Drive a plain upload end to end: hash and stage the body, write the
    /// blob, commit the row.
    pub async fn upload_new_object(
        &self,
        upload: PlainUpload,
        body: ByteStream,
        spill_limit: usize,
        spill_root: &Path,
        cancel: &CancellationToken,
    ) -> StorageResult<ObjectRecord> {
        let prepared = self
            .prepare_upload(
                &upload.target,
                upload.content_type.as_deref(),
                upload.declared_size,
                upload.user_metadata.as_ref(),
                None,
            )
            .await?;

        let mut sink = HashingSink::new(spill_limit, spill_root);
        let ingest = async {
            sink.write_stream(body).await?;
            sink.finish().await
        };
        let ingested = match cancel.run_until_cancelled(ingest).await {
            Some(result) => result,
            None => Err(StorageError::Internal(anyhow::anyhow!(
                "upload cancelled by client"
            ))),
        };
        if let Err(e) = ingested {
            self.abort_prepared(&upload.target, prepared.superseded_version).await;
            return Err(e);
        }

        if sink.size() > prepared.size_ceiling {
            let size = sink.size();
            sink.cleanup().await;
            self.abort_prepared(&upload.target, prepared.superseded_version).await;
            return Err(StorageError::EntityTooLarge {
                size,
                limit: prepared.size_ceiling,
            });
        }

        let path = ObjectPath::new(
            self.conn.tenant_id().clone(),
            upload.target.bucket_id.clone(),
            upload.target.object_name.clone(),
        );
        let version = prepared.version.to_string();
        let content_type = upload
            .content_type
            .as_deref()
            .unwrap_or(DEFAULT_CONTENT_TYPE);
        let cache_control = normalize_cache_control(upload.cache_control.as_deref());

        let written = self
            .blob
            .write(
                &path.key(),
                &version,
                sink.payload(),
                content_type,
                &cache_control,
                None,
                cancel,
            )
            .await;
        sink.cleanup().await;
        if let Err(e) = written {
            self.abort_prepared(&upload.target, prepared.superseded_version).await;
            return Err(e.into());
        }

        self.complete_upload(CompleteUpload {
            version: prepared.version,
            bucket_id: upload.target.bucket_id.clone(),
            object_name: upload.target.object_name.clone(),
            is_upsert: upload.target.is_upsert,
            upload_type: UploadType::Plain,
            owner: upload.target.owner.clone(),
            user_metadata: upload.user_metadata,
            superseded_version: prepared.superseded_version,
            req_id: upload.req_id,
        })
        .await
    }

    /// Effective ceiling for a bucket under this tenant.
    #[must_use]
    pub fn size_ceiling(&self, bucket: &Bucket) -> u64 {
        let bucket_limit = bucket
            .file_size_limit
            .and_then(|l| u64::try_from(l).ok())
            .unwrap_or(u64::MAX);
        bucket_limit.min(self.tenant.file_size_limit)
    }

    /// Best-effort rollback of a pending reservation that will never
    /// complete: fresh inserts are removed, upserts point back at the
    /// superseded version.
    pub async fn abort_prepared(&self, target: &UploadTarget, superseded_version: Option<Uuid>) {
        let attempt = async {
            let super_conn = self.conn.as_super_user();
            let mut tx = super_conn.transaction().await?;
            match superseded_version {
                Some(previous) => {
                    objects::update_pending_version(
                        &mut tx,
                        &target.bucket_id,
                        &target.object_name,
                        previous,
                        None,
                    )
                    .await?;
                }
                None => {
                    with_delete_guard(&mut tx).await?;
                    objects::delete(&mut tx, &target.bucket_id, &target.object_name).await?;
                }
            }
            objectstack_db::commit(tx).await
        };
        if let Err(e) = attempt.await {
            warn!(
                bucket = target.bucket_id,
                name = target.object_name,
                error = %e,
                "failed to roll back pending upload row"
            );
        }
    }

    /// Schedule deletion of a version that never committed.
    async fn schedule_orphan(&self, path: &ObjectPath, version: &str) {
        let attempt = async {
            let super_conn = self.conn.as_super_user();
            let mut tx = super_conn.transaction().await?;
            events::schedule_blob_deletion(
                &mut tx,
                self.tenant.id.as_str(),
                &path.versioned_key(version),
            )
            .await?;
            objectstack_db::commit(tx).await
        };
        if let Err(e) = attempt.await {
            warn!(key = %path, version, error = %e, "failed to schedule orphan blob deletion");
        }
    }
}

/// Translate pending-row write failures into the renderable taxonomy.
fn map_write_error(e: DbError) -> StorageError {
    match e {
        DbError::InsufficientPrivilege => StorageError::AccessDenied,
        DbError::UniqueViolation { .. } => StorageError::Conflict {
            message: "object already exists".to_owned(),
        },
        other => other.into(),
    }
}

/// The system metadata JSON stored on the object row.
#[must_use]
pub fn system_metadata(meta: &BlobMetadata) -> serde_json::Value {
    serde_json::json!({
        "size": meta.size,
        "mimetype": meta.mimetype,
        "eTag": meta.etag,
        "cacheControl": meta.cache_control,
        "lastModified": meta.last_modified.to_rfc3339(),
        "contentLength": meta.size,
        "httpStatusCode": meta.http_status_code,
    })
}

/// Compact object summary used as `oldObject` in events.
fn object_summary(record: &ObjectRecord) -> serde_json::Value {
    serde_json::json!({
        "id": record.id,
        "bucketId": record.bucket_id,
        "name": record.name,
        "version": record.version,
        "metadata": record.metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_should_build_system_metadata_shape() {
        let meta = BlobMetadata {
            size: 3746,
            etag: "abc".to_owned(),
            mimetype: "image/png".to_owned(),
            cache_control: "max-age=3600".to_owned(),
            last_modified: Utc::now(),
            http_status_code: 200,
        };
        let json = system_metadata(&meta);
        assert_eq!(json["size"], 3746);
        assert_eq!(json["eTag"], "abc");
        assert_eq!(json["cacheControl"], "max-age=3600");
        assert_eq!(json["httpStatusCode"], 200);
    }

    #[test]
    fn test_should_name_upload_types() {
        assert_eq!(UploadType::Plain.as_str(), "plain");
        assert_eq!(UploadType::Multipart.as_str(), "multipart");
        assert_eq!(UploadType::Resumable.as_str(), "resumable");
    }
}
