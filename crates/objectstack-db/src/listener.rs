//! Lock-release pub/sub over the metadata store's notify channel.
//!
//! Every worker process subscribes to one channel. When a process fails to
//! take an upload lock it broadcasts `REQUEST_LOCK_RELEASE(id)`; the process
//! currently holding that id cancels the registered holder token, inviting
//! the holder to release cooperatively. This prevents starvation between
//! processes and enables graceful hand-off.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::DbResult;

/// The single release-request channel name.
pub const LOCK_RELEASE_CHANNEL: &str = "objectstack_request_lock_release";

/// Process-wide lock-release notifier.
///
/// Constructed once at startup and handed to every locker; stopped at
/// shutdown. A detached notifier (no channel subscription) dispatches
/// release requests within the process only, which is correct for single-process
/// deployments and tests.
pub struct LockNotifier {
    pool: Option<PgPool>,
    holders: DashMap<String, CancellationToken>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for LockNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockNotifier")
            .field("held", &self.holders.len())
            .finish_non_exhaustive()
    }
}

impl LockNotifier {
    /// Subscribe to the release channel and start dispatching requests.
    pub async fn start(pool: PgPool) -> DbResult<Arc<Self>> {
        let mut listener = PgListener::connect_with(&pool).await?;
        listener.listen(LOCK_RELEASE_CHANNEL).await?;

        let notifier = Arc::new(Self {
            pool: Some(pool),
            holders: DashMap::new(),
            task: Mutex::new(None),
        });

        let weak = Arc::downgrade(&notifier);
        let handle = tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        let Some(notifier) = weak.upgrade() else {
                            break;
                        };
                        notifier.handle_release_request(notification.payload());
                    }
                    Err(e) => {
                        // PgListener reconnects internally; recv errors are
                        // transient connection losses.
                        let Some(_) = weak.upgrade() else { break };
                        warn!(error = %e, "lock release listener error, retrying");
                    }
                }
            }
        });
        *notifier.task.lock() = Some(handle);

        info!(channel = LOCK_RELEASE_CHANNEL, "lock release notifier started");
        Ok(notifier)
    }

    /// A notifier without a channel subscription: release requests are
    /// dispatched within this process only.
    #[must_use]
    pub fn detached() -> Arc<Self> {
        Arc::new(Self {
            pool: None,
            holders: DashMap::new(),
            task: Mutex::new(None),
        })
    }

    /// Broadcast a release request for an upload id to every process.
    ///
    /// Detached notifiers short-circuit to the in-process dispatch.
    pub async fn request_release(&self, id: &str) -> DbResult<()> {
        match &self.pool {
            Some(pool) => {
                sqlx::query("SELECT pg_notify($1, $2)")
                    .bind(LOCK_RELEASE_CHANNEL)
                    .bind(id)
                    .execute(pool)
                    .await?;
            }
            None => self.handle_release_request(id),
        }
        debug!(id, "requested lock release");
        Ok(())
    }

    /// Register the holder of an id. The returned token's cancellation is
    /// the invitation to release.
    pub fn register_holder(&self, id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.holders.insert(id.to_owned(), token.clone());
        token
    }

    /// Remove a holder registration after release.
    pub fn unregister_holder(&self, id: &str) {
        self.holders.remove(id);
    }

    /// Number of ids this process currently holds.
    #[must_use]
    pub fn held_count(&self) -> usize {
        self.holders.len()
    }

    /// Stop listening. Held registrations stay valid so in-flight releases
    /// can still complete.
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    fn handle_release_request(&self, id: &str) {
        if let Some(entry) = self.holders.get(id) {
            debug!(id, "release requested for held lock, cancelling holder");
            entry.value().cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The dispatch path is testable without a database by driving
    // handle_release_request directly; the channel round-trip itself is
    // covered by the integration suite.

    #[tokio::test]
    async fn test_should_cancel_registered_holder_on_release_request() {
        let notifier = LockNotifier::detached();
        let token = notifier.register_holder("t1/b/o/v1");
        assert!(!token.is_cancelled());

        notifier.request_release("t1/b/o/v1").await.unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_should_ignore_release_request_for_unheld_id() {
        let notifier = LockNotifier::detached();
        let token = notifier.register_holder("t1/b/o/v1");

        notifier.request_release("t1/b/other/v1").await.unwrap();
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn test_should_not_cancel_after_unregister() {
        let notifier = LockNotifier::detached();
        let token = notifier.register_holder("t1/b/o/v1");
        notifier.unregister_holder("t1/b/o/v1");
        assert_eq!(notifier.held_count(), 0);

        notifier.request_release("t1/b/o/v1").await.unwrap();
        assert!(!token.is_cancelled());
    }
}
