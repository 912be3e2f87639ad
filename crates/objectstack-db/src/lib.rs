//! Postgres metadata store adapter for ObjectStack.
//!
//! This crate owns everything that talks SQL:
//!
//! - [`PoolManager`]: TTL-cached per-tenant connection pools with bounded
//!   retry on exhaustion, and the [`TenantConnection`] handle requests use.
//! - [`AuthScope`]: the request identity applied to every authorized
//!   transaction as session-local settings, which the store's row-level
//!   policies evaluate.
//! - Typed repositories over the `buckets` / `objects` / `prefixes` tables,
//!   including cursor pagination and delimiter listings.
//! - Advisory object locks and the `REQUEST_LOCK_RELEASE` pub/sub channel.
//! - Prefix hierarchy maintenance (ensure on insert, ordered recursive
//!   cleanup on delete); see [`prefixes`].
//! - The lifecycle event queue and the blob GC queue, written in the same
//!   transaction as the metadata they describe.
//! - Embedded migrations (`sqlx::migrate!`), including the
//!   prefix-maintenance triggers and the direct-delete guard.

pub mod buckets;
mod error;
pub mod events;
mod listener;
pub mod locks;
pub mod objects;
pub mod prefixes;
mod pool;
mod scope;
mod tenant;

pub use error::{DbError, DbResult};
pub use listener::{LOCK_RELEASE_CHANNEL, LockNotifier};
pub use pool::{AcquireOptions, PoolManager, TenantConnection};
pub use scope::{AuthScope, SERVICE_ROLE, headers_json, with_delete_guard};
pub use tenant::{StaticTenantRegistry, TenantConfig, TenantRegistry};

/// A transaction over the tenant's metadata store.
pub type DbTransaction = sqlx::Transaction<'static, sqlx::Postgres>;

/// Commit a transaction, classifying the failure.
pub async fn commit(tx: DbTransaction) -> DbResult<()> {
    tx.commit().await.map_err(DbError::from)
}

/// The embedded migrator for the ObjectStack schema.
///
/// Applied by deploy tooling; tests apply it against their scratch
/// database before running.
#[must_use]
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}
