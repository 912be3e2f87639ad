//! Advisory object locks.
//!
//! Concurrent writes to the same `(bucket, name)` are serialized by a
//! transaction-scoped advisory lock keyed by `(bucket, name, version)`.
//! The key is hashed server-side with `hashtextextended`, so any process
//! connected to the same database contends on the same lock.

use tracing::trace;

use crate::DbTransaction;
use crate::error::DbResult;

/// The canonical lock key for an object version.
#[must_use]
pub fn object_lock_key(bucket_id: &str, name: &str, version: &str) -> String {
    format!("{bucket_id}/{name}/{version}")
}

/// Block until the object lock is held. Released at transaction end.
pub async fn lock_object(
    tx: &mut DbTransaction,
    bucket_id: &str,
    name: &str,
    version: &str,
) -> DbResult<()> {
    let key = object_lock_key(bucket_id, name, version);
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(&key)
        .execute(&mut **tx)
        .await?;
    trace!(key, "acquired object lock");
    Ok(())
}

/// Try to take the object lock without blocking.
///
/// Returns `false` when another transaction holds it.
pub async fn must_lock_object(
    tx: &mut DbTransaction,
    bucket_id: &str,
    name: &str,
    version: &str,
) -> DbResult<bool> {
    let key = object_lock_key(bucket_id, name, version);
    let row: (bool,) = sqlx::query_as("SELECT pg_try_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(&key)
        .fetch_one(&mut **tx)
        .await?;
    trace!(key, acquired = row.0, "tried object lock");
    Ok(row.0)
}
