//! Distributed upload lockers.
//!
//! Mutual exclusion over one upload id across worker processes, in two
//! pluggable variants:
//!
//! - [`PgUploadLocker`] holds a non-blocking advisory lock inside an open
//!   transaction; the lock lives exactly as long as the transaction.
//! - [`S3UploadLocker`] creates a lock object at a deterministic key with
//!   if-none-match semantics, renews it on a timer strictly shorter than
//!   its TTL, and deletes it on release. A sweeper removes zombie locks
//!   whose expiry passed (crashed holders).
//!
//! Both variants publish a `REQUEST_LOCK_RELEASE` message on contention
//! and retry with backoff; the current holder receives the request through
//! the notifier and is invited to release cooperatively, so waiting
//! processes are never starved while a healthy holder finishes up.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use objectstack_blob::{BlobError, BlobStore};
use objectstack_core::{StorageError, StorageResult};
use objectstack_db::{DbTransaction, LockNotifier, TenantConnection, locks};

use crate::upload_id::UploadId;

/// Polling interval of the advisory-lock variant.
const PG_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Total budget of the advisory-lock variant.
const PG_LOCK_TIMEOUT: Duration = Duration::from_secs(15);

/// First backoff of the conditional-put variant.
const S3_RETRY_BASE: Duration = Duration::from_millis(250);

/// A held upload lock.
///
/// Dropping without [`UploadLock::unlock`] still releases (transaction
/// rollback / renewal stop), but unlock should be awaited for prompt
/// hand-off.
pub struct UploadLock {
    id: String,
    release_invite: CancellationToken,
    notifier: Arc<LockNotifier>,
    inner: LockInner,
}

enum LockInner {
    Pg {
        tx: Option<DbTransaction>,
    },
    S3 {
        blob: Arc<dyn BlobStore>,
        key: String,
        renewal: JoinHandle<()>,
    },
}

impl std::fmt::Debug for UploadLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadLock")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl UploadLock {
    /// Cancelled when another process asks this holder to release.
    #[must_use]
    pub fn release_requested(&self) -> &CancellationToken {
        &self.release_invite
    }

    /// Release the lock.
    pub async fn unlock(mut self) -> StorageResult<()> {
        self.notifier.unregister_holder(&self.id);
        match &mut self.inner {
            LockInner::Pg { tx } => {
                if let Some(tx) = tx.take() {
                    // The advisory lock is transaction-scoped; rollback
                    // releases it.
                    tx.rollback()
                        .await
                        .map_err(|e| StorageError::TransactionError {
                            message: format!("release upload lock: {e}"),
                        })?;
                }
            }
            LockInner::S3 { blob, key, renewal } => {
                renewal.abort();
                blob.delete_raw(key).await?;
            }
        }
        debug!(id = self.id, "released upload lock");
        Ok(())
    }
}

impl Drop for UploadLock {
    fn drop(&mut self) {
        self.notifier.unregister_holder(&self.id);
        if let LockInner::S3 { renewal, .. } = &self.inner {
            renewal.abort();
        }
        // A dropped Pg transaction rolls back on its own.
    }
}

/// Mutual exclusion over upload ids.
#[async_trait]
pub trait UploadLocker: Send + Sync + std::fmt::Debug + 'static {
    /// Acquire the lock for an upload id, waiting within the variant's
    /// budget. `cancel` aborts the wait (client disconnect).
    async fn lock(&self, id: &UploadId, cancel: &CancellationToken) -> StorageResult<UploadLock>;
}

// ---------------------------------------------------------------------------
// Postgres advisory-lock variant
// ---------------------------------------------------------------------------

/// Locker over transaction-scoped advisory locks.
pub struct PgUploadLocker {
    conn: TenantConnection,
    notifier: Arc<LockNotifier>,
}

impl std::fmt::Debug for PgUploadLocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgUploadLocker").finish_non_exhaustive()
    }
}

impl PgUploadLocker {
    /// Build the locker around a (privileged) tenant connection.
    #[must_use]
    pub fn new(conn: TenantConnection, notifier: Arc<LockNotifier>) -> Self {
        Self {
            conn: conn.as_super_user(),
            notifier,
        }
    }
}

#[async_trait]
impl UploadLocker for PgUploadLocker {
    async fn lock(&self, id: &UploadId, cancel: &CancellationToken) -> StorageResult<UploadLock> {
        let raw_id = id.as_raw();
        let version = id.version.to_string();
        let started = Instant::now();
        let mut requested_release = false;

        loop {
            let mut tx = self.conn.transaction().await.map_err(StorageError::from)?;
            let acquired =
                locks::must_lock_object(&mut tx, &id.bucket_id, &id.object_name, &version)
                    .await
                    .map_err(StorageError::from)?;

            if acquired {
                let invite = self.notifier.register_holder(&raw_id);
                trace!(id = raw_id, "acquired advisory upload lock");
                return Ok(UploadLock {
                    id: raw_id,
                    release_invite: invite,
                    notifier: Arc::clone(&self.notifier),
                    inner: LockInner::Pg { tx: Some(tx) },
                });
            }
            drop(tx);

            // Ask the current holder (possibly in another process) to wrap
            // up, then keep polling.
            if !requested_release {
                self.notifier
                    .request_release(&raw_id)
                    .await
                    .map_err(StorageError::from)?;
                requested_release = true;
            }

            if started.elapsed() + PG_RETRY_INTERVAL > PG_LOCK_TIMEOUT {
                return Err(StorageError::AcquiringLockTimeout);
            }
            if cancel
                .run_until_cancelled(tokio::time::sleep(PG_RETRY_INTERVAL))
                .await
                .is_none()
            {
                return Err(StorageError::AcquiringLockTimeout);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Blob-backend conditional-put variant
// ---------------------------------------------------------------------------

/// Contents of a lock object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockFile {
    lock_id: Uuid,
    created_at: DateTime<Utc>,
    renewed_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Locker over conditional writes at the blob backend.
pub struct S3UploadLocker {
    blob: Arc<dyn BlobStore>,
    notifier: Arc<LockNotifier>,
    ttl: Duration,
    max_retries: u32,
}

impl std::fmt::Debug for S3UploadLocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3UploadLocker")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl S3UploadLocker {
    /// Build the locker.
    ///
    /// # Errors
    ///
    /// Refuses a backend without atomic conditional put; lock safety
    /// depends on it, and conditional-put semantics differ across stores.
    pub fn new(
        blob: Arc<dyn BlobStore>,
        notifier: Arc<LockNotifier>,
        ttl: Duration,
        max_retries: u32,
    ) -> StorageResult<Self> {
        if !blob.supports_conditional_put() {
            return Err(StorageError::Internal(anyhow::anyhow!(
                "blob backend does not support conditional put; use the postgres locker"
            )));
        }
        Ok(Self {
            blob,
            notifier,
            ttl,
            max_retries,
        })
    }

    fn lock_file(&self, lock_id: Uuid) -> LockFile {
        let now = Utc::now();
        LockFile {
            lock_id,
            created_at: now,
            renewed_at: now,
            expires_at: now
                + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::seconds(60)),
        }
    }

    async fn try_acquire(&self, key: &str) -> StorageResult<Option<Uuid>> {
        let lock_id = Uuid::new_v4();
        let body = serde_json::to_vec(&self.lock_file(lock_id))
            .map_err(|e| StorageError::Internal(anyhow::anyhow!("lock serialize: {e}")))?;

        match self.blob.put_raw_if_absent(key, Bytes::from(body)).await {
            Ok(()) => Ok(Some(lock_id)),
            Err(BlobError::Conflict { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the lock object if its expiry passed. Returns whether a
    /// zombie was removed.
    async fn reap_if_expired(&self, key: &str) -> StorageResult<bool> {
        let existing = match self.blob.get_raw(key).await {
            Ok(bytes) => bytes,
            Err(BlobError::NotFound { .. }) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let Ok(lock) = serde_json::from_slice::<LockFile>(&existing) else {
            // Unparseable lock objects are treated as zombies.
            self.blob.delete_raw(key).await?;
            return Ok(true);
        };
        if lock.expires_at < Utc::now() {
            warn!(key, lock_id = %lock.lock_id, "removing expired upload lock");
            self.blob.delete_raw(key).await?;
            return Ok(true);
        }
        Ok(false)
    }

    fn spawn_renewal(&self, key: String, lock_id: Uuid) -> JoinHandle<()> {
        let blob = Arc::clone(&self.blob);
        let ttl = self.ttl;
        // Renewal must outpace expiry even when one write is slow.
        let interval = ttl / 3;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(200)));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let now = Utc::now();
                let renewed = LockFile {
                    lock_id,
                    created_at: now,
                    renewed_at: now,
                    expires_at: now
                        + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(60)),
                };
                let Ok(body) = serde_json::to_vec(&renewed) else {
                    continue;
                };
                if let Err(e) = blob.put_raw(&key, Bytes::from(body)).await {
                    warn!(key, error = %e, "failed to renew upload lock");
                }
            }
        })
    }
}

#[async_trait]
impl UploadLocker for S3UploadLocker {
    async fn lock(&self, id: &UploadId, cancel: &CancellationToken) -> StorageResult<UploadLock> {
        let raw_id = id.as_raw();
        let key = id.lock_key();
        let mut requested_release = false;
        let mut delay = S3_RETRY_BASE;

        for attempt in 0..=self.max_retries {
            if let Some(lock_id) = self.try_acquire(&key).await? {
                let invite = self.notifier.register_holder(&raw_id);
                let renewal = self.spawn_renewal(key.clone(), lock_id);
                trace!(id = raw_id, attempt, "acquired conditional-put upload lock");
                return Ok(UploadLock {
                    id: raw_id,
                    release_invite: invite,
                    notifier: Arc::clone(&self.notifier),
                    inner: LockInner::S3 {
                        blob: Arc::clone(&self.blob),
                        key,
                        renewal,
                    },
                });
            }

            // Zombie locks from crashed holders are reclaimed immediately.
            if self.reap_if_expired(&key).await? {
                continue;
            }

            if !requested_release {
                self.notifier
                    .request_release(&raw_id)
                    .await
                    .map_err(StorageError::from)?;
                requested_release = true;
            }

            if attempt == self.max_retries {
                break;
            }
            let jitter = {
                use rand::RngExt;
                let mut rng = rand::rng();
                rng.random_range(0..=delay.as_millis() as u64 / 4)
            };
            let sleep = delay + Duration::from_millis(jitter);
            if cancel
                .run_until_cancelled(tokio::time::sleep(sleep))
                .await
                .is_none()
            {
                return Err(StorageError::AcquiringLockTimeout);
            }
            delay = (delay * 2).min(Duration::from_secs(5));
        }

        Err(StorageError::AcquiringLockTimeout)
    }
}

/// Remove zombie lock objects under `__tus_locks/`.
///
/// Run periodically (`tus_lock_sweep_interval`); returns the number of
/// locks removed.
pub async fn sweep_expired_locks(blob: &Arc<dyn BlobStore>) -> StorageResult<u64> {
    let keys = blob.list("__tus_locks/", None).await?;
    let now = Utc::now();
    let mut removed = 0_u64;

    for key in keys {
        let bytes = match blob.get_raw(&key).await {
            Ok(bytes) => bytes,
            Err(BlobError::NotFound { .. }) => continue,
            Err(e) => return Err(e.into()),
        };
        let expired = serde_json::from_slice::<LockFile>(&bytes)
            .map_or(true, |lock| lock.expires_at < now);
        if expired {
            blob.delete_raw(&key).await?;
            removed += 1;
        }
    }

    if removed > 0 {
        debug!(removed, "swept expired upload locks");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use objectstack_blob::FsBlobStore;
    use objectstack_core::TenantId;

    fn notifier() -> Arc<LockNotifier> {
        LockNotifier::detached()
    }

    fn fs_blob() -> (tempfile::TempDir, Arc<dyn BlobStore>) {
        let dir = tempfile::tempdir().unwrap();
        let blob: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(dir.path()));
        (dir, blob)
    }

    fn upload_id() -> UploadId {
        UploadId::new(TenantId::new("t1"), "b-1", "u/file.bin")
    }

    // -----------------------------------------------------------------------
    // Conditional-put locker (filesystem backend provides atomic create)
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_should_exclude_second_locker_until_release() {
        let (_dir, blob) = fs_blob();
        let notifier = notifier();
        let locker =
            S3UploadLocker::new(Arc::clone(&blob), Arc::clone(&notifier), Duration::from_secs(10), 1)
                .unwrap();
        let id = upload_id();
        let cancel = CancellationToken::new();

        let lock = locker.lock(&id, &cancel).await.unwrap();

        // Second acquisition exhausts its retries while the lock is held.
        let second = locker.lock(&id, &cancel).await;
        assert!(matches!(second, Err(StorageError::AcquiringLockTimeout)));

        lock.unlock().await.unwrap();
        let reacquired = locker.lock(&id, &cancel).await.unwrap();
        reacquired.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn test_should_reclaim_expired_lock() {
        let (_dir, blob) = fs_blob();
        let notifier = notifier();
        let id = upload_id();
        let cancel = CancellationToken::new();

        // Plant an already-expired lock object.
        let stale = LockFile {
            lock_id: Uuid::new_v4(),
            created_at: Utc::now() - chrono::Duration::seconds(120),
            renewed_at: Utc::now() - chrono::Duration::seconds(120),
            expires_at: Utc::now() - chrono::Duration::seconds(60),
        };
        blob.put_raw(
            &id.lock_key(),
            Bytes::from(serde_json::to_vec(&stale).unwrap()),
        )
        .await
        .unwrap();

        let locker =
            S3UploadLocker::new(Arc::clone(&blob), notifier, Duration::from_secs(10), 2).unwrap();
        let lock = locker.lock(&id, &cancel).await.unwrap();
        lock.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn test_should_sweep_only_expired_locks() {
        let (_dir, blob) = fs_blob();
        let fresh_id = upload_id();
        let stale_id = UploadId::new(TenantId::new("t1"), "b-1", "other.bin");

        let fresh = LockFile {
            lock_id: Uuid::new_v4(),
            created_at: Utc::now(),
            renewed_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::seconds(60),
        };
        let stale = LockFile {
            expires_at: Utc::now() - chrono::Duration::seconds(1),
            ..fresh.clone()
        };
        blob.put_raw(&fresh_id.lock_key(), Bytes::from(serde_json::to_vec(&fresh).unwrap()))
            .await
            .unwrap();
        blob.put_raw(&stale_id.lock_key(), Bytes::from(serde_json::to_vec(&stale).unwrap()))
            .await
            .unwrap();

        let removed = sweep_expired_locks(&blob).await.unwrap();
        assert_eq!(removed, 1);
        assert!(blob.get_raw(&fresh_id.lock_key()).await.is_ok());
        assert!(matches!(
            blob.get_raw(&stale_id.lock_key()).await,
            Err(BlobError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_should_register_holder_for_release_requests() {
        let (_dir, blob) = fs_blob();
        let notifier = notifier();
        let locker =
            S3UploadLocker::new(blob, Arc::clone(&notifier), Duration::from_secs(10), 1).unwrap();
        let id = upload_id();
        let cancel = CancellationToken::new();

        let lock = locker.lock(&id, &cancel).await.unwrap();
        assert_eq!(notifier.held_count(), 1);
        assert!(!lock.release_requested().is_cancelled());

        lock.unlock().await.unwrap();
        assert_eq!(notifier.held_count(), 0);
    }
}
