//! Spill-to-disk hashing sink.
//!
//! A [`HashingSink`] ingests a byte stream, computing SHA-256 and the total
//! size as it goes. Payloads at or below the in-memory limit never touch
//! the filesystem; the first byte past the limit moves everything
//! (already-buffered bytes first, in order) into a single file inside a
//! fresh subdirectory of the configured temp root.
//!
//! Directory names combine the millisecond timestamp with a v4 UUID, so
//! sinks started in the same millisecond cannot collide.
//!
//! Replay readers are reference-counted: [`HashingSink::cleanup`] defers
//! artifact removal until the last open reader closes, and a reader opened
//! with `auto_cleanup` removes the artifacts itself when it is the last one
//! out. Cleanup never relies on garbage collection; each reader carries an
//! explicit scoped finalizer.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{trace, warn};
use uuid::Uuid;

use objectstack_blob::{BlobPayload, ByteStream};
use objectstack_core::{StorageError, StorageResult};

/// Name of the single spill file inside the sink's directory.
const SPILL_FILE_NAME: &str = "payload";

/// Prefix of spill directory names.
const SPILL_DIR_PREFIX: &str = "hashspill";

/// Read buffer for replay streams.
const REPLAY_BUF_SIZE: usize = 64 * 1024;

#[derive(Debug)]
struct Spill {
    path: PathBuf,
    file: Option<tokio::fs::File>,
}

/// Shared artifact state between the sink and its replay readers.
#[derive(Debug)]
struct Artifacts {
    dir: PathBuf,
    readers: AtomicUsize,
    cleanup_requested: AtomicBool,
}

impl Artifacts {
    fn remove_now(dir: &Path) {
        if let Err(e) = std::fs::remove_dir_all(dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %dir.display(), error = %e, "failed to remove spill directory");
            }
        } else {
            trace!(dir = %dir.display(), "removed spill directory");
        }
    }
}

/// Scoped finalizer attached to each replay reader.
struct ReaderGuard {
    artifacts: Arc<Artifacts>,
    auto_cleanup: bool,
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        let was_last = self.artifacts.readers.fetch_sub(1, Ordering::AcqRel) == 1;
        if was_last
            && (self.auto_cleanup || self.artifacts.cleanup_requested.load(Ordering::Acquire))
        {
            Artifacts::remove_now(&self.artifacts.dir);
        }
    }
}

/// Streaming SHA-256 sink with memory-to-file spill.
#[derive(Debug)]
pub struct HashingSink {
    limit: usize,
    tmp_root: PathBuf,
    buffer: BytesMut,
    spill: Option<Spill>,
    artifacts: Option<Arc<Artifacts>>,
    hasher: Sha256,
    size: u64,
    digest: Option<String>,
}

impl HashingSink {
    /// Create a sink keeping at most `limit_in_memory` bytes in memory
    /// before spilling under `tmp_root`.
    #[must_use]
    pub fn new(limit_in_memory: usize, tmp_root: impl Into<PathBuf>) -> Self {
        Self {
            limit: limit_in_memory,
            tmp_root: tmp_root.into(),
            buffer: BytesMut::new(),
            spill: None,
            artifacts: None,
            hasher: Sha256::new(),
            size: 0,
            digest: None,
        }
    }

    /// Ingest one chunk.
    ///
    /// # Errors
    ///
    /// Fails with the underlying I/O error if the spill file cannot be
    /// created or written; partial artifacts are cleaned up best-effort.
    pub async fn write(&mut self, chunk: &[u8]) -> StorageResult<()> {
        self.hasher.update(chunk);
        self.size += chunk.len() as u64;

        if let Some(spill) = &mut self.spill {
            let path = spill.path.clone();
            let file = spill.file.as_mut().ok_or_else(|| {
                StorageError::Internal(anyhow::anyhow!("write after finish"))
            })?;
            file.write_all(chunk).await.map_err(|e| {
                StorageError::Internal(anyhow::anyhow!("spill file {}: {e}", path.display()))
            })?;
            return Ok(());
        }

        self.buffer.extend_from_slice(chunk);
        if self.buffer.len() > self.limit {
            self.spill_buffered().await?;
        }
        Ok(())
    }

    /// Drain an entire stream into the sink.
    pub async fn write_stream(&mut self, mut stream: ByteStream) -> StorageResult<()> {
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| StorageError::Internal(anyhow::anyhow!(e)))?;
            self.write(&chunk).await?;
        }
        Ok(())
    }

    /// Finalize the hash. Must be called before [`HashingSink::digest_hex`]
    /// or any replay.
    pub async fn finish(&mut self) -> StorageResult<()> {
        if self.digest.is_some() {
            return Ok(());
        }
        if let Some(spill) = &mut self.spill {
            let path = spill.path.clone();
            if let Some(mut file) = spill.file.take() {
                file.flush().await.map_err(|e| {
                    StorageError::Internal(anyhow::anyhow!("spill file {}: {e}", path.display()))
                })?;
            }
        }
        let digest = std::mem::take(&mut self.hasher).finalize();
        self.digest = Some(hex::encode(digest));
        Ok(())
    }

    /// Total bytes written.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Hex SHA-256 of everything written. Available after `finish`.
    #[must_use]
    pub fn digest_hex(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Whether the payload overflowed to disk.
    #[must_use]
    pub fn is_spilled(&self) -> bool {
        self.spill.is_some()
    }

    /// The payload handle for a backend write. Available after `finish`.
    #[must_use]
    pub fn payload(&self) -> BlobPayload {
        match &self.spill {
            Some(spill) => BlobPayload::Spilled {
                path: spill.path.clone(),
                len: self.size,
            },
            None => BlobPayload::InMemory(Bytes::copy_from_slice(&self.buffer)),
        }
    }

    /// Open a fresh replay stream over the full byte sequence.
    ///
    /// Multiple concurrent readers are allowed and each yields the exact
    /// sequence. With `auto_cleanup`, the last reader to close removes the
    /// spill artifacts.
    pub async fn to_readable(&self, auto_cleanup: bool) -> StorageResult<ByteStream> {
        match (&self.spill, &self.artifacts) {
            (Some(spill), Some(artifacts)) => {
                let file = tokio::fs::File::open(&spill.path).await.map_err(|e| {
                    StorageError::Internal(anyhow::anyhow!(
                        "open spill file {}: {e}",
                        spill.path.display()
                    ))
                })?;
                artifacts.readers.fetch_add(1, Ordering::AcqRel);
                let guard = ReaderGuard {
                    artifacts: Arc::clone(artifacts),
                    auto_cleanup,
                };
                let stream = ReaderStream::with_capacity(file, REPLAY_BUF_SIZE)
                    .map(move |chunk| {
                        let _held = &guard;
                        chunk
                    });
                Ok(Box::pin(stream) as ByteStream)
            }
            _ => {
                let bytes = Bytes::copy_from_slice(&self.buffer);
                Ok(Box::pin(futures::stream::once(async move { Ok(bytes) })) as ByteStream)
            }
        }
    }

    /// Remove spill artifacts. No-op when nothing spilled; deferred while
    /// readers are open; safe to call repeatedly.
    pub async fn cleanup(&self) {
        let Some(artifacts) = &self.artifacts else {
            return;
        };
        artifacts.cleanup_requested.store(true, Ordering::Release);
        if artifacts.readers.load(Ordering::Acquire) == 0 {
            let dir = artifacts.dir.clone();
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(dir = %dir.display(), error = %e, "failed to remove spill directory");
                }
            } else {
                trace!(dir = %dir.display(), "removed spill directory");
            }
        }
    }

    /// Move the buffered bytes (and all future bytes) to disk.
    async fn spill_buffered(&mut self) -> StorageResult<()> {
        let dir = self.tmp_root.join(format!(
            "{SPILL_DIR_PREFIX}-{}-{}",
            chrono::Utc::now().timestamp_millis(),
            Uuid::new_v4()
        ));
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            StorageError::Internal(anyhow::anyhow!("create spill dir {}: {e}", dir.display()))
        })?;

        let path = dir.join(SPILL_FILE_NAME);
        let mut file = match tokio::fs::File::create(&path).await {
            Ok(file) => file,
            Err(e) => {
                Artifacts::remove_now(&dir);
                return Err(StorageError::Internal(anyhow::anyhow!(
                    "create spill file {}: {e}",
                    path.display()
                )));
            }
        };

        if let Err(e) = file.write_all(&self.buffer).await {
            Artifacts::remove_now(&dir);
            return Err(StorageError::Internal(anyhow::anyhow!(
                "write spill file {}: {e}",
                path.display()
            )));
        }
        self.buffer.clear();

        trace!(dir = %dir.display(), "spilled sink to disk");
        self.artifacts = Some(Arc::new(Artifacts {
            dir: dir.clone(),
            readers: AtomicUsize::new(0),
            cleanup_requested: AtomicBool::new(false),
        }));
        self.spill = Some(Spill {
            path,
            file: Some(file),
        });
        Ok(())
    }

}

impl Drop for HashingSink {
    fn drop(&mut self) {
        // Readers still open keep the artifacts; the last guard out removes
        // them because the drop marks cleanup as requested.
        if let Some(artifacts) = &self.artifacts {
            artifacts.cleanup_requested.store(true, Ordering::Release);
            if artifacts.readers.load(Ordering::Acquire) == 0 {
                Artifacts::remove_now(&artifacts.dir);
            }
        }
    }
}
