//! Local filesystem blob backend.
//!
//! Bytes live at `{root}/{key}/{version}`; each stored blob has a JSON
//! sidecar `{version}.meta.json` in the same directory carrying the content
//! type, cache-control, entity tag, and user metadata the filesystem cannot
//! hold natively. Raw control objects (locks, upload info) are plain files
//! without sidecars.
//!
//! The entity tag is the hex SHA-256 of the content, computed while the
//! bytes are streamed to disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use objectstack_core::ByteRange;

use crate::error::BlobError;
use crate::{BlobMetadata, BlobObject, BlobPayload, BlobStore, UploadedPart, physical_key};

/// Sidecar file suffix for per-blob metadata.
const META_SUFFIX: &str = ".meta.json";

/// Directory multipart sessions are staged under.
const UPLOADS_DIR: &str = ".uploads";

/// Copy buffer size for streamed writes.
const COPY_BUF_SIZE: usize = 64 * 1024;

/// Sidecar metadata persisted next to each blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SidecarMeta {
    mimetype: String,
    cache_control: String,
    etag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_metadata: Option<HashMap<String, String>>,
}

/// Multipart session descriptor staged with the parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MultipartSession {
    key: String,
    version: String,
    content_type: String,
    cache_control: String,
}

/// Filesystem-backed [`BlobStore`].
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Create a store rooted at `root`. The directory is created lazily on
    /// first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a backend key to its path under the root, rejecting
    /// traversal segments.
    fn resolve(&self, key: &str) -> Result<PathBuf, BlobError> {
        if key.is_empty() || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
        {
            return Err(BlobError::Internal(anyhow::anyhow!(
                "invalid backend key: {key}"
            )));
        }
        Ok(self.root.join(key))
    }

    fn sidecar_path(path: &Path) -> PathBuf {
        let mut os = path.as_os_str().to_owned();
        os.push(META_SUFFIX);
        PathBuf::from(os)
    }

    async fn read_sidecar(path: &Path) -> Option<SidecarMeta> {
        let bytes = tokio::fs::read(Self::sidecar_path(path)).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    async fn write_sidecar(path: &Path, meta: &SidecarMeta) -> Result<(), BlobError> {
        let bytes = serde_json::to_vec(meta)
            .map_err(|e| BlobError::Internal(anyhow::anyhow!("sidecar serialize: {e}")))?;
        tokio::fs::write(Self::sidecar_path(path), bytes)
            .await
            .map_err(|e| BlobError::from_io(&e, &path.display().to_string()))
    }

    /// Stat a blob file and merge its sidecar into a [`BlobMetadata`].
    async fn stat(&self, physical: &str) -> Result<BlobMetadata, BlobError> {
        let path = self.resolve(physical)?;
        let fs_meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| BlobError::from_io(&e, physical))?;
        if fs_meta.is_dir() {
            return Err(BlobError::NotFound {
                key: physical.to_owned(),
            });
        }

        let sidecar = Self::read_sidecar(&path).await;
        let last_modified = fs_meta
            .modified()
            .ok()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(Utc::now);

        Ok(BlobMetadata {
            size: fs_meta.len(),
            etag: sidecar.as_ref().map_or_else(String::new, |m| m.etag.clone()),
            mimetype: sidecar
                .as_ref()
                .map_or_else(|| crate::DEFAULT_CONTENT_TYPE.to_owned(), |m| m.mimetype.clone()),
            cache_control: sidecar
                .as_ref()
                .map_or_else(|| crate::DEFAULT_CACHE_CONTROL.to_owned(), |m| {
                    m.cache_control.clone()
                }),
            last_modified,
            http_status_code: 200,
        })
    }

    /// Stream a payload into `dest`, returning `(size, sha256_hex)`.
    async fn store_payload(
        dest: &Path,
        payload: &BlobPayload,
        physical: &str,
    ) -> Result<(u64, String), BlobError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BlobError::from_io(&e, physical))?;
        }

        let mut hasher = Sha256::new();
        let mut out = tokio::fs::File::create(dest)
            .await
            .map_err(|e| BlobError::from_io(&e, physical))?;

        let size = match payload {
            BlobPayload::InMemory(bytes) => {
                hasher.update(bytes);
                out.write_all(bytes)
                    .await
                    .map_err(|e| BlobError::from_io(&e, physical))?;
                bytes.len() as u64
            }
            BlobPayload::Spilled { path, .. } => {
                let mut src = tokio::fs::File::open(path)
                    .await
                    .map_err(|e| BlobError::from_io(&e, physical))?;
                let mut buf = vec![0_u8; COPY_BUF_SIZE];
                let mut total = 0_u64;
                loop {
                    let n = src
                        .read(&mut buf)
                        .await
                        .map_err(|e| BlobError::from_io(&e, physical))?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                    out.write_all(&buf[..n])
                        .await
                        .map_err(|e| BlobError::from_io(&e, physical))?;
                    total += n as u64;
                }
                total
            }
        };

        out.flush()
            .await
            .map_err(|e| BlobError::from_io(&e, physical))?;

        Ok((size, hex::encode(hasher.finalize())))
    }

    fn upload_dir(&self, upload_id: &str) -> PathBuf {
        self.root.join(UPLOADS_DIR).join(upload_id)
    }

    fn part_file(&self, upload_id: &str, part_number: i32) -> PathBuf {
        self.upload_dir(upload_id)
            .join(format!("part-{part_number:05}"))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn read(
        &self,
        key: &str,
        version: &str,
        range: Option<ByteRange>,
        cancel: &CancellationToken,
    ) -> Result<BlobObject, BlobError> {
        let physical = physical_key(key, version);
        let mut metadata = self.stat(&physical).await?;
        let path = self.resolve(&physical)?;

        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| BlobError::from_io(&e, &physical))?;

        let reader: Box<dyn tokio::io::AsyncRead + Send + Unpin> = match range {
            Some(r) => {
                if r.start >= metadata.size {
                    return Err(BlobError::Internal(anyhow::anyhow!(
                        "requested range {}-{} not satisfiable for size {}",
                        r.start,
                        r.end,
                        metadata.size
                    )));
                }
                let end = r.end.min(metadata.size);
                file.seek(std::io::SeekFrom::Start(r.start))
                    .await
                    .map_err(|e| BlobError::from_io(&e, &physical))?;
                metadata.http_status_code = 206;
                Box::new(file.take(end - r.start))
            }
            None => Box::new(file),
        };

        let stream = ReaderStream::with_capacity(reader, COPY_BUF_SIZE)
            .take_until(cancel.clone().cancelled_owned());

        trace!(key, version, status = metadata.http_status_code, "opened blob for read");
        Ok(BlobObject {
            metadata,
            stream: Box::pin(stream),
        })
    }

    async fn write(
        &self,
        key: &str,
        version: &str,
        payload: BlobPayload,
        content_type: &str,
        cache_control: &str,
        user_metadata: Option<&HashMap<String, String>>,
        cancel: &CancellationToken,
    ) -> Result<BlobMetadata, BlobError> {
        let physical = physical_key(key, version);
        let path = self.resolve(&physical)?;

        let stored = match cancel
            .run_until_cancelled(Self::store_payload(&path, &payload, &physical))
            .await
        {
            Some(result) => result,
            None => {
                // Partial file is useless after cancellation.
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(key = physical, error = %e, "failed to remove partial blob");
                    }
                }
                return Err(BlobError::Cancelled);
            }
        };
        let (size, etag) = stored?;

        let meta = SidecarMeta {
            mimetype: content_type.to_owned(),
            cache_control: cache_control.to_owned(),
            etag: etag.clone(),
            user_metadata: user_metadata.cloned(),
        };
        Self::write_sidecar(&path, &meta).await?;

        debug!(key, version, size, "stored blob");
        Ok(BlobMetadata {
            size,
            etag,
            mimetype: content_type.to_owned(),
            cache_control: cache_control.to_owned(),
            last_modified: Utc::now(),
            http_status_code: 200,
        })
    }

    async fn head(&self, key: &str, version: &str) -> Result<BlobMetadata, BlobError> {
        self.stat(&physical_key(key, version)).await
    }

    async fn copy(
        &self,
        src_key: &str,
        src_version: &str,
        dst_key: &str,
        dst_version: &str,
        cancel: &CancellationToken,
    ) -> Result<BlobMetadata, BlobError> {
        let src_physical = physical_key(src_key, src_version);
        let src_path = self.resolve(&src_physical)?;
        let src_meta = self.stat(&src_physical).await?;

        let payload = BlobPayload::Spilled {
            path: src_path,
            len: src_meta.size,
        };
        // Re-store rather than fs::copy so the sidecar and etag are rebuilt
        // together with the bytes.
        self.write(
            dst_key,
            dst_version,
            payload,
            &src_meta.mimetype,
            &src_meta.cache_control,
            None,
            cancel,
        )
        .await
    }

    async fn delete(&self, key: &str, version: &str) -> Result<(), BlobError> {
        let physical = physical_key(key, version);
        let path = self.resolve(&physical)?;

        for target in [path.clone(), Self::sidecar_path(&path)] {
            if let Err(e) = tokio::fs::remove_file(&target).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(BlobError::from_io(&e, &physical));
                }
            }
        }
        trace!(key, version, "deleted blob");
        Ok(())
    }

    async fn delete_many(&self, keys: Vec<String>) -> Result<(), BlobError> {
        for physical in keys {
            let path = self.resolve(&physical)?;
            for target in [path.clone(), Self::sidecar_path(&path)] {
                if let Err(e) = tokio::fs::remove_file(&target).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        return Err(BlobError::from_io(&e, &physical));
                    }
                }
            }
        }
        Ok(())
    }

    async fn list(&self, prefix: &str, max_keys: Option<usize>) -> Result<Vec<String>, BlobError> {
        let limit = max_keys.unwrap_or(usize::MAX);
        let mut keys = Vec::new();

        // The prefix may name a directory or a key prefix within one; walk
        // from the deepest existing directory and filter on the relative key.
        let start = self.root.join(prefix);
        let walk_root = if tokio::fs::metadata(&start).await.is_ok() {
            start
        } else {
            start
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| self.root.clone())
        };

        let mut stack = vec![walk_root];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(BlobError::from_io(&e, prefix)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| BlobError::from_io(&e, prefix))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| BlobError::from_io(&e, prefix))?;
                if file_type.is_dir() {
                    stack.push(path);
                    continue;
                }
                if entry.file_name().to_string_lossy().ends_with(META_SUFFIX) {
                    continue;
                }
                if let Ok(rel) = path.strip_prefix(&self.root) {
                    let key = rel.to_string_lossy().replace('\\', "/");
                    if key.starts_with(prefix) {
                        keys.push(key);
                        if keys.len() >= limit {
                            keys.sort();
                            return Ok(keys);
                        }
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn create_multipart(
        &self,
        key: &str,
        version: &str,
        content_type: &str,
        cache_control: &str,
    ) -> Result<String, BlobError> {
        let upload_id = Uuid::new_v4().to_string();
        let dir = self.upload_dir(&upload_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| BlobError::from_io(&e, key))?;

        let session = MultipartSession {
            key: key.to_owned(),
            version: version.to_owned(),
            content_type: content_type.to_owned(),
            cache_control: cache_control.to_owned(),
        };
        let bytes = serde_json::to_vec(&session)
            .map_err(|e| BlobError::Internal(anyhow::anyhow!("session serialize: {e}")))?;
        tokio::fs::write(dir.join("upload.json"), bytes)
            .await
            .map_err(|e| BlobError::from_io(&e, key))?;

        debug!(key, version, upload_id, "created multipart upload");
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        _version: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
        cancel: &CancellationToken,
    ) -> Result<UploadedPart, BlobError> {
        if cancel.is_cancelled() {
            return Err(BlobError::Cancelled);
        }
        let path = self.part_file(upload_id, part_number);
        if tokio::fs::metadata(path.parent().unwrap_or(Path::new("/"))).await.is_err() {
            return Err(BlobError::NotFound {
                key: format!("{key}#{upload_id}"),
            });
        }

        let etag = hex::encode(Sha256::digest(&body));
        tokio::fs::write(&path, &body)
            .await
            .map_err(|e| BlobError::from_io(&e, key))?;

        trace!(upload_id, part_number, size = body.len(), "stored part");
        Ok(UploadedPart { part_number, etag })
    }

    async fn list_parts(
        &self,
        key: &str,
        _version: &str,
        upload_id: &str,
    ) -> Result<Vec<UploadedPart>, BlobError> {
        let dir = self.upload_dir(upload_id);
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BlobError::NotFound {
                    key: format!("{key}#{upload_id}"),
                }
            } else {
                BlobError::from_io(&e, key)
            }
        })?;

        let mut parts = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| BlobError::from_io(&e, key))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(num) = name.strip_prefix("part-") else {
                continue;
            };
            let Ok(part_number) = num.parse::<i32>() else {
                continue;
            };
            let body = tokio::fs::read(entry.path())
                .await
                .map_err(|e| BlobError::from_io(&e, key))?;
            parts.push(UploadedPart {
                part_number,
                etag: hex::encode(Sha256::digest(&body)),
            });
        }
        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }

    async fn complete_multipart(
        &self,
        key: &str,
        version: &str,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<BlobMetadata, BlobError> {
        let dir = self.upload_dir(upload_id);
        let session_bytes = tokio::fs::read(dir.join("upload.json")).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BlobError::NotFound {
                    key: format!("{key}#{upload_id}"),
                }
            } else {
                BlobError::from_io(&e, key)
            }
        })?;
        let session: MultipartSession = serde_json::from_slice(&session_bytes)
            .map_err(|e| BlobError::Internal(anyhow::anyhow!("session parse: {e}")))?;

        let physical = physical_key(key, version);
        let path = self.resolve(&physical)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BlobError::from_io(&e, &physical))?;
        }

        let mut hasher = Sha256::new();
        let mut out = tokio::fs::File::create(&path)
            .await
            .map_err(|e| BlobError::from_io(&e, &physical))?;
        let mut size = 0_u64;

        for part in parts {
            let body = tokio::fs::read(self.part_file(upload_id, part.part_number))
                .await
                .map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        BlobError::NotFound {
                            key: format!("{key}#{upload_id}/part-{}", part.part_number),
                        }
                    } else {
                        BlobError::from_io(&e, key)
                    }
                })?;
            hasher.update(&body);
            out.write_all(&body)
                .await
                .map_err(|e| BlobError::from_io(&e, &physical))?;
            size += body.len() as u64;
        }
        out.flush()
            .await
            .map_err(|e| BlobError::from_io(&e, &physical))?;

        let etag = format!("{}-{}", hex::encode(hasher.finalize()), parts.len());
        let meta = SidecarMeta {
            mimetype: session.content_type.clone(),
            cache_control: session.cache_control.clone(),
            etag: etag.clone(),
            user_metadata: None,
        };
        Self::write_sidecar(&path, &meta).await?;

        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            warn!(upload_id, error = %e, "failed to remove multipart staging dir");
        }

        debug!(key, version, upload_id, size, parts = parts.len(), "completed multipart upload");
        Ok(BlobMetadata {
            size,
            etag,
            mimetype: session.content_type,
            cache_control: session.cache_control,
            last_modified: Utc::now(),
            http_status_code: 200,
        })
    }

    async fn abort_multipart(
        &self,
        _key: &str,
        _version: &str,
        upload_id: &str,
    ) -> Result<(), BlobError> {
        if let Err(e) = tokio::fs::remove_dir_all(self.upload_dir(upload_id)).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(BlobError::from_io(&e, upload_id));
            }
        }
        Ok(())
    }

    async fn private_url(
        &self,
        key: &str,
        version: &str,
        ttl: Duration,
    ) -> Result<String, BlobError> {
        // The filesystem has no signing authority; the deterministic URL is
        // only meaningful to a fronting process that re-checks access.
        let physical = physical_key(key, version);
        let expires = Utc::now().timestamp() + i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        Ok(format!(
            "file://{}?expires={expires}",
            self.root.join(physical).display()
        ))
    }

    fn supports_conditional_put(&self) -> bool {
        // create_new(true) is atomic on a local filesystem.
        true
    }

    async fn get_raw(&self, key: &str) -> Result<Bytes, BlobError> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(e) => Err(BlobError::from_io(&e, key)),
        }
    }

    async fn put_raw(&self, key: &str, body: Bytes) -> Result<(), BlobError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BlobError::from_io(&e, key))?;
        }
        tokio::fs::write(&path, &body)
            .await
            .map_err(|e| BlobError::from_io(&e, key))
    }

    async fn put_raw_if_absent(&self, key: &str, body: Bytes) -> Result<(), BlobError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BlobError::from_io(&e, key))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| BlobError::from_io(&e, key))?;
        file.write_all(&body)
            .await
            .map_err(|e| BlobError::from_io(&e, key))?;
        file.flush().await.map_err(|e| BlobError::from_io(&e, key))
    }

    async fn delete_raw(&self, key: &str) -> Result<(), BlobError> {
        let path = self.resolve(key)?;
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(BlobError::from_io(&e, key));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn store() -> (tempfile::TempDir, FsBlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        (dir, store)
    }

    async fn collect(mut stream: crate::ByteStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    // -----------------------------------------------------------------------
    // Write / read / head
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_should_write_and_read_back_blob() {
        let (_dir, store) = store();
        let cancel = CancellationToken::new();

        let meta = store
            .write(
                "t1/b/hello.txt",
                "v1",
                BlobPayload::InMemory(Bytes::from_static(b"hello world")),
                "text/plain",
                "max-age=60",
                None,
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(meta.size, 11);
        assert_eq!(meta.mimetype, "text/plain");
        assert!(!meta.etag.is_empty());

        let obj = store.read("t1/b/hello.txt", "v1", None, &cancel).await.unwrap();
        assert_eq!(obj.metadata.http_status_code, 200);
        assert_eq!(obj.metadata.cache_control, "max-age=60");
        assert_eq!(collect(obj.stream).await, b"hello world");
    }

    #[tokio::test]
    async fn test_should_read_byte_range() {
        let (_dir, store) = store();
        let cancel = CancellationToken::new();
        store
            .write(
                "t1/b/r.txt",
                "v1",
                BlobPayload::InMemory(Bytes::from_static(b"hello world")),
                "text/plain",
                "no-cache",
                None,
                &cancel,
            )
            .await
            .unwrap();

        let obj = store
            .read("t1/b/r.txt", "v1", ByteRange::new(6, 11), &cancel)
            .await
            .unwrap();
        assert_eq!(obj.metadata.http_status_code, 206);
        assert_eq!(collect(obj.stream).await, b"world");
    }

    #[tokio::test]
    async fn test_should_return_not_found_for_missing_blob() {
        let (_dir, store) = store();
        let result = store.head("t1/b/ghost", "v1").await;
        assert!(matches!(result, Err(BlobError::NotFound { .. })));
    }

    // -----------------------------------------------------------------------
    // Copy / delete
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_should_copy_blob_with_metadata() {
        let (_dir, store) = store();
        let cancel = CancellationToken::new();
        store
            .write(
                "t1/b/src.bin",
                "v1",
                BlobPayload::InMemory(Bytes::from_static(b"payload")),
                "application/x-thing",
                "max-age=5",
                None,
                &cancel,
            )
            .await
            .unwrap();

        let meta = store
            .copy("t1/b/src.bin", "v1", "t1/b/dst.bin", "v2", &cancel)
            .await
            .unwrap();
        assert_eq!(meta.size, 7);
        assert_eq!(meta.mimetype, "application/x-thing");

        let obj = store.read("t1/b/dst.bin", "v2", None, &cancel).await.unwrap();
        assert_eq!(collect(obj.stream).await, b"payload");
    }

    #[tokio::test]
    async fn test_should_delete_blob_and_sidecar() {
        let (dir, store) = store();
        let cancel = CancellationToken::new();
        store
            .write(
                "t1/b/gone.txt",
                "v1",
                BlobPayload::InMemory(Bytes::from_static(b"x")),
                "text/plain",
                "no-cache",
                None,
                &cancel,
            )
            .await
            .unwrap();

        store.delete("t1/b/gone.txt", "v1").await.unwrap();
        assert!(matches!(
            store.head("t1/b/gone.txt", "v1").await,
            Err(BlobError::NotFound { .. })
        ));
        // Sidecar must be gone too.
        assert!(!dir.path().join("t1/b/gone.txt/v1.meta.json").exists());

        // Deleting again is a no-op.
        store.delete("t1/b/gone.txt", "v1").await.unwrap();
    }

    // -----------------------------------------------------------------------
    // List
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_should_list_keys_without_sidecars() {
        let (_dir, store) = store();
        let cancel = CancellationToken::new();
        for name in ["a.txt", "sub/b.txt"] {
            store
                .write(
                    &format!("t1/b/{name}"),
                    "v1",
                    BlobPayload::InMemory(Bytes::from_static(b"x")),
                    "text/plain",
                    "no-cache",
                    None,
                    &cancel,
                )
                .await
                .unwrap();
        }

        let keys = store.list("t1/b", None).await.unwrap();
        assert_eq!(keys, vec!["t1/b/a.txt/v1", "t1/b/sub/b.txt/v1"]);
    }

    // -----------------------------------------------------------------------
    // Multipart
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_should_assemble_multipart_upload() {
        let (_dir, store) = store();
        let cancel = CancellationToken::new();
        let upload_id = store
            .create_multipart("t1/b/big.bin", "v1", "application/octet-stream", "no-cache")
            .await
            .unwrap();

        let p1 = store
            .upload_part("t1/b/big.bin", "v1", &upload_id, 1, Bytes::from_static(b"hello "), &cancel)
            .await
            .unwrap();
        let p2 = store
            .upload_part("t1/b/big.bin", "v1", &upload_id, 2, Bytes::from_static(b"world"), &cancel)
            .await
            .unwrap();

        let listed = store.list_parts("t1/b/big.bin", "v1", &upload_id).await.unwrap();
        assert_eq!(listed.len(), 2);

        let meta = store
            .complete_multipart("t1/b/big.bin", "v1", &upload_id, &[p1, p2])
            .await
            .unwrap();
        assert_eq!(meta.size, 11);
        assert!(meta.etag.ends_with("-2"));

        let obj = store.read("t1/b/big.bin", "v1", None, &cancel).await.unwrap();
        assert_eq!(collect(obj.stream).await, b"hello world");

        // Staging directory is cleaned up.
        assert!(matches!(
            store.list_parts("t1/b/big.bin", "v1", &upload_id).await,
            Err(BlobError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_should_abort_multipart_upload() {
        let (_dir, store) = store();
        let cancel = CancellationToken::new();
        let upload_id = store
            .create_multipart("t1/b/x.bin", "v1", "application/octet-stream", "no-cache")
            .await
            .unwrap();
        store
            .upload_part("t1/b/x.bin", "v1", &upload_id, 1, Bytes::from_static(b"abc"), &cancel)
            .await
            .unwrap();

        store.abort_multipart("t1/b/x.bin", "v1", &upload_id).await.unwrap();
        assert!(matches!(
            store.list_parts("t1/b/x.bin", "v1", &upload_id).await,
            Err(BlobError::NotFound { .. })
        ));
    }

    // -----------------------------------------------------------------------
    // Raw control objects
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_should_enforce_conditional_put_on_raw_keys() {
        let (_dir, store) = store();
        assert!(store.supports_conditional_put());

        store
            .put_raw_if_absent("__tus_locks/t1/u1.lock", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        let second = store
            .put_raw_if_absent("__tus_locks/t1/u1.lock", Bytes::from_static(b"{}"))
            .await;
        assert!(matches!(second, Err(BlobError::Conflict { .. })));

        store.delete_raw("__tus_locks/t1/u1.lock").await.unwrap();
        store
            .put_raw_if_absent("__tus_locks/t1/u1.lock", Bytes::from_static(b"{}"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_should_reject_traversal_keys() {
        let (_dir, store) = store();
        let result = store.get_raw("../etc/passwd").await;
        assert!(matches!(result, Err(BlobError::Internal(_))));
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_should_fail_write_on_cancelled_token() {
        let (_dir, store) = store();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = store
            .write(
                "t1/b/c.txt",
                "v1",
                BlobPayload::InMemory(Bytes::from_static(b"x")),
                "text/plain",
                "no-cache",
                None,
                &cancel,
            )
            .await;
        assert!(matches!(result, Err(BlobError::Cancelled)));
    }
}
