//! Tenant connection pooling.
//!
//! Each tenant's metadata database gets its own `PgPool`, cached
//! process-wide by connection string. Single-tenant deployments hold one
//! entry forever; multi-tenant deployments evict entries after a short
//! inactivity window and destroy the pool on eviction.
//!
//! Two pool variants exist per tenant: the cached internal pool, and
//! "external" single-use pools for proxied connections, destroyed on
//! dispose.
//!
//! Transaction acquisition retries on server-side connection exhaustion
//! with jittered exponential backoff; pool acquire timeouts surface as
//! `DatabaseTimeout`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::RngExt;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use objectstack_core::{DatabaseConfig, TenantId};

use crate::error::{DbError, DbResult};
use crate::scope::AuthScope;
use crate::tenant::TenantConfig;
use crate::DbTransaction;

/// Attempts to begin a transaction before giving up on a saturated server.
const TX_RETRY_MAX_ATTEMPTS: u32 = 10;

/// Lower bound of the first backoff.
const TX_RETRY_BASE_MIN: Duration = Duration::from_millis(50);

/// Upper bound of the first backoff.
const TX_RETRY_BASE_MAX: Duration = Duration::from_millis(200);

/// Total backoff budget across all attempts.
const TX_RETRY_BUDGET: Duration = Duration::from_secs(3);

/// Idle timeout applied to pooled connections.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Options for [`PoolManager::acquire`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AcquireOptions {
    /// Request a single-use pool destroyed on dispose instead of the cached
    /// internal pool.
    pub external: bool,
}

struct PoolEntry {
    pool: PgPool,
    last_used: Mutex<Instant>,
}

/// Process-wide tenant pool cache.
pub struct PoolManager {
    config: DatabaseConfig,
    multitenant: bool,
    pools: DashMap<String, Arc<PoolEntry>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("pool_count", &self.pools.len())
            .field("multitenant", &self.multitenant)
            .finish_non_exhaustive()
    }
}

impl PoolManager {
    /// Create the manager. In multi-tenant mode a background sweeper task
    /// destroys pools idle longer than `free_pool_after_inactivity`.
    #[must_use]
    pub fn new(config: DatabaseConfig, multitenant: bool) -> Arc<Self> {
        let manager = Arc::new(Self {
            config,
            multitenant,
            pools: DashMap::new(),
            sweeper: Mutex::new(None),
        });

        if multitenant {
            let weak = Arc::downgrade(&manager);
            let ttl = manager.config.free_pool_after_inactivity;
            let handle = tokio::spawn(async move {
                let mut interval = tokio::time::interval(ttl.max(Duration::from_millis(500)) / 2);
                loop {
                    interval.tick().await;
                    let Some(manager) = weak.upgrade() else {
                        break;
                    };
                    manager.evict_idle(ttl).await;
                }
            });
            *manager.sweeper.lock() = Some(handle);
        }

        manager
    }

    /// Acquire a connection handle for a tenant.
    ///
    /// The returned [`TenantConnection`] is bound to the tenant's database
    /// and the caller's [`AuthScope`]; `super_user` starts it on the
    /// service role.
    pub fn acquire(
        &self,
        tenant: &TenantConfig,
        scope: AuthScope,
        super_user: bool,
        options: AcquireOptions,
    ) -> DbResult<TenantConnection> {
        let scope = if super_user { scope.as_service() } else { scope };

        let (pool, external) = if options.external {
            // Single-use variant: its own tiny pool, destroyed on dispose.
            (self.build_pool(&tenant.db_url, 1)?, true)
        } else {
            (self.cached_pool(&tenant.db_url)?, false)
        };

        Ok(TenantConnection {
            pool,
            tenant_id: tenant.id.clone(),
            scope,
            external,
        })
    }

    /// Release a connection handle. Idempotent; only external handles own
    /// their pool.
    pub async fn dispose(&self, conn: TenantConnection) {
        if conn.external {
            conn.pool.close().await;
        }
    }

    /// Close every pool and stop the sweeper.
    pub async fn stop(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        let urls: Vec<String> = self.pools.iter().map(|e| e.key().clone()).collect();
        for url in urls {
            if let Some((_, entry)) = self.pools.remove(&url) {
                entry.pool.close().await;
            }
        }
        info!("closed all tenant pools");
    }

    /// Number of live cached pools.
    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    fn cached_pool(&self, db_url: &str) -> DbResult<PgPool> {
        if let Some(entry) = self.pools.get(db_url) {
            *entry.last_used.lock() = Instant::now();
            return Ok(entry.pool.clone());
        }

        // Short critical section: the entry() API keeps exactly one writer
        // racing for a given url.
        let entry = self
            .pools
            .entry(db_url.to_owned())
            .or_try_insert_with(|| {
                let pool = self.build_pool(db_url, self.config.max_connections)?;
                debug!(multitenant = self.multitenant, "created tenant pool");
                Ok::<_, DbError>(Arc::new(PoolEntry {
                    pool,
                    last_used: Mutex::new(Instant::now()),
                }))
            })?;
        Ok(entry.pool.clone())
    }

    fn build_pool(&self, db_url: &str, max_connections: u32) -> DbResult<PgPool> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(self.config.connection_timeout)
            .idle_timeout(Some(POOL_IDLE_TIMEOUT))
            .connect_lazy(db_url)?;
        Ok(pool)
    }

    async fn evict_idle(&self, ttl: Duration) {
        let expired: Vec<(String, Arc<PoolEntry>)> = self
            .pools
            .iter()
            .filter(|e| e.last_used.lock().elapsed() > ttl)
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        for (url, entry) in expired {
            // Re-check under removal so a pool touched meanwhile survives.
            if entry.last_used.lock().elapsed() > ttl {
                self.pools.remove(&url);
                entry.pool.close().await;
                debug!("evicted idle tenant pool");
            }
        }
    }
}

/// A tenant-bound database handle carrying the request's scope.
#[derive(Debug, Clone)]
pub struct TenantConnection {
    pool: PgPool,
    tenant_id: TenantId,
    scope: AuthScope,
    external: bool,
}

impl TenantConnection {
    /// The tenant this handle belongs to.
    #[must_use]
    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    /// The scope applied to authorized transactions.
    #[must_use]
    pub fn scope(&self) -> &AuthScope {
        &self.scope
    }

    /// The underlying pool, for subsystems that manage their own
    /// connections (the pub/sub listener).
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// A view of the same connection that runs the next transaction on the
    /// service role, bypassing row policies.
    #[must_use]
    pub fn as_super_user(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            tenant_id: self.tenant_id.clone(),
            scope: self.scope.as_service(),
            external: self.external,
        }
    }

    /// Begin a transaction with this handle's scope applied.
    ///
    /// Retries on server-side connection exhaustion with jittered
    /// exponential backoff (first delay 50–200 ms, doubling, at most
    /// [`TX_RETRY_MAX_ATTEMPTS`] attempts within a 3 s budget). Pool
    /// acquire timeouts surface as [`DbError::Timeout`].
    pub async fn transaction(&self) -> DbResult<DbTransaction> {
        let mut delay = {
            let mut rng = rand::rng();
            Duration::from_millis(
                rng.random_range(TX_RETRY_BASE_MIN.as_millis() as u64..=TX_RETRY_BASE_MAX.as_millis() as u64),
            )
        };
        let started = Instant::now();

        for attempt in 1..=TX_RETRY_MAX_ATTEMPTS {
            match self.pool.begin().await.map_err(DbError::from) {
                Ok(mut tx) => {
                    self.scope.apply(&mut tx).await?;
                    return Ok(tx);
                }
                Err(DbError::TooManyConnections)
                    if attempt < TX_RETRY_MAX_ATTEMPTS
                        && started.elapsed() + delay < TX_RETRY_BUDGET =>
                {
                    warn!(attempt, delay_ms = delay.as_millis() as u64, "connection slots exhausted, backing off");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(TX_RETRY_BUDGET);
                }
                Err(other) => return Err(other),
            }
        }

        Err(DbError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(url: &str) -> TenantConfig {
        TenantConfig {
            id: TenantId::new("t1"),
            db_url: url.to_owned(),
            jwt_secret: "secret".to_owned(),
            file_size_limit: 1024,
            max_buckets: None,
            features: serde_json::json!({}),
        }
    }

    fn config() -> DatabaseConfig {
        DatabaseConfig::builder()
            .max_connections(5)
            .connection_timeout(Duration::from_millis(200))
            .free_pool_after_inactivity(Duration::from_millis(50))
            .build()
    }

    // connect_lazy never dials, so pool bookkeeping is testable without a
    // database.

    #[tokio::test]
    async fn test_should_cache_internal_pool_per_url() {
        let manager = PoolManager::new(config(), false);
        let t = tenant("postgresql://localhost:5432/one");

        let a = manager
            .acquire(&t, AuthScope::anonymous(), false, AcquireOptions::default())
            .unwrap();
        let b = manager
            .acquire(&t, AuthScope::anonymous(), false, AcquireOptions::default())
            .unwrap();
        assert_eq!(manager.pool_count(), 1);

        manager.dispose(a).await;
        manager.dispose(b).await;
        // Internal pools survive dispose.
        assert_eq!(manager.pool_count(), 1);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_should_destroy_external_pool_on_dispose() {
        let manager = PoolManager::new(config(), false);
        let t = tenant("postgresql://localhost:5432/one");

        let conn = manager
            .acquire(
                &t,
                AuthScope::anonymous(),
                false,
                AcquireOptions { external: true },
            )
            .unwrap();
        // External pools are not cached.
        assert_eq!(manager.pool_count(), 0);
        let pool = conn.pool().clone();
        manager.dispose(conn).await;
        assert!(pool.is_closed());
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_should_evict_idle_pools_in_multitenant_mode() {
        let manager = PoolManager::new(config(), true);
        let t = tenant("postgresql://localhost:5432/evictme");

        let conn = manager
            .acquire(&t, AuthScope::anonymous(), false, AcquireOptions::default())
            .unwrap();
        manager.dispose(conn).await;
        assert_eq!(manager.pool_count(), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(manager.pool_count(), 0, "idle pool should be evicted");
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_should_switch_scope_on_super_user_view() {
        let manager = PoolManager::new(config(), false);
        let t = tenant("postgresql://localhost:5432/one");
        let conn = manager
            .acquire(&t, AuthScope::anonymous(), false, AcquireOptions::default())
            .unwrap();

        assert_eq!(conn.scope().role, "anon");
        let elevated = conn.as_super_user();
        assert!(elevated.scope().is_service());
        // The original is untouched.
        assert_eq!(conn.scope().role, "anon");
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_should_start_on_service_role_when_requested() {
        let manager = PoolManager::new(config(), false);
        let t = tenant("postgresql://localhost:5432/one");
        let conn = manager
            .acquire(&t, AuthScope::anonymous(), true, AcquireOptions::default())
            .unwrap();
        assert!(conn.scope().is_service());
        manager.stop().await;
    }
}
