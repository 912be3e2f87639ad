//! The allocator over the shard tables.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::Row;
use sqlx::postgres::PgRow;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use objectstack_core::{StorageError, StorageResult};
use objectstack_db::{DbError, DbTransaction, TenantConnection};

use crate::model::{Reservation, ReservationStatus, ReserveRequest, Shard, ShardStats, ShardStatus};
use crate::selector::{ShardSelector, ShardUsage};

/// Default lease for unconfirmed reservations.
const DEFAULT_LEASE: Duration = Duration::from_secs(60);

/// Attempts for the serializable reserve loop.
const SERIALIZABLE_RETRIES: u32 = 3;

/// Capacity-bounded slot allocator.
///
/// All state lives in the metadata store; the allocator holds nothing but
/// a privileged connection and the selection policy.
pub struct ShardAllocator {
    conn: TenantConnection,
    selector: Arc<dyn ShardSelector>,
    default_lease: Duration,
}

impl std::fmt::Debug for ShardAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardAllocator")
            .field("selector", &self.selector)
            .finish_non_exhaustive()
    }
}

impl ShardAllocator {
    /// Build an allocator with the given selection policy.
    #[must_use]
    pub fn new(conn: TenantConnection, selector: Arc<dyn ShardSelector>) -> Self {
        Self {
            conn: conn.as_super_user(),
            selector,
            default_lease: DEFAULT_LEASE,
        }
    }

    /// Override the default lease.
    #[must_use]
    pub fn with_default_lease(mut self, lease: Duration) -> Self {
        self.default_lease = lease;
        self
    }

    /// Register a shard. Idempotent on `(kind, shard_key)`.
    pub async fn create_shard(
        &self,
        kind: &str,
        shard_key: &str,
        capacity: i32,
    ) -> StorageResult<Shard> {
        let mut tx = self.begin().await?;
        let row = sqlx::query(
            "INSERT INTO shards (kind, shard_key, capacity) VALUES ($1, $2, $3) \
             ON CONFLICT (kind, shard_key) DO UPDATE SET capacity = shards.capacity \
             RETURNING id, kind, shard_key, capacity, status",
        )
        .bind(kind)
        .bind(shard_key)
        .bind(capacity)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let shard = shard_from_row(&row).map_err(db_err)?;
        objectstack_db::commit(tx).await.map_err(StorageError::from)?;
        debug!(kind, shard_key, capacity, "registered shard");
        Ok(shard)
    }

    /// Register several shards. Idempotent.
    pub async fn create_shards(
        &self,
        shards: &[(String, String, i32)],
    ) -> StorageResult<Vec<Shard>> {
        let mut out = Vec::with_capacity(shards.len());
        for (kind, shard_key, capacity) in shards {
            out.push(self.create_shard(kind, shard_key, *capacity).await?);
        }
        Ok(out)
    }

    /// Reserve a slot for a logical resource.
    ///
    /// Idempotent: a live (pending or confirmed) reservation for the same
    /// resource is returned as-is. Runs serializable and retries
    /// serialization failures; a uniqueness race re-reads the concurrent
    /// winner's reservation.
    pub async fn reserve(&self, request: &ReserveRequest) -> StorageResult<Reservation> {
        let resource = request.resource_id();
        let lease = request.lease.unwrap_or(self.default_lease);

        let mut attempt = 0_u32;
        loop {
            attempt += 1;
            match self.try_reserve(request, &resource, lease).await {
                Ok(reservation) => return Ok(reservation),
                Err(StorageError::TransactionError { .. }) if attempt < SERIALIZABLE_RETRIES => {
                    let backoff = Duration::from_millis(25 * u64::from(attempt) * u64::from(attempt));
                    trace!(resource, attempt, "serialization conflict, retrying reserve");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_reserve(
        &self,
        request: &ReserveRequest,
        resource: &str,
        lease: Duration,
    ) -> StorageResult<Reservation> {
        let mut tx = self.begin_serializable().await?;

        // Idempotency: hand back the live reservation if one exists.
        if let Some(existing) = find_live_reservation(&mut tx, &request.kind, resource).await? {
            objectstack_db::commit(tx).await.map_err(StorageError::from)?;
            return Ok(existing);
        }

        let candidates = shard_usage(&mut tx, &request.kind).await?;
        if candidates.is_empty() {
            return Err(StorageError::NoActiveShard {
                kind: request.kind.clone(),
            });
        }
        let Some(winner) = self.selector.select(&candidates) else {
            return Err(StorageError::NoActiveShard {
                kind: request.kind.clone(),
            });
        };
        let shard = &candidates[winner];

        // Prefer a freed slot, then mint the next one within capacity.
        let slot_no = match reuse_free_slot(&mut tx, shard.shard_id, resource, &request.tenant_id)
            .await?
        {
            Some(slot_no) => slot_no,
            None => {
                mint_slot(&mut tx, shard, resource, &request.tenant_id).await?.ok_or_else(
                    || StorageError::NoAvailableShard {
                        kind: request.kind.clone(),
                    },
                )?
            }
        };

        let lease_expires_at =
            Utc::now() + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::seconds(60));
        let inserted = sqlx::query(
            "INSERT INTO shard_reservations (kind, resource_id, shard_id, slot_no, lease_expires_at) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING id",
        )
        .bind(&request.kind)
        .bind(resource)
        .bind(shard.shard_id)
        .bind(slot_no)
        .bind(lease_expires_at)
        .fetch_one(&mut *tx)
        .await;

        let id: Uuid = match inserted {
            Ok(row) => row.try_get("id").map_err(db_err)?,
            Err(e) => {
                let classified = DbError::from(e);
                if matches!(classified, DbError::UniqueViolation { .. }) {
                    // A concurrent peer won; surface its reservation.
                    drop(tx);
                    return self
                        .read_winner(&request.kind, resource)
                        .await?
                        .ok_or(StorageError::ReservationNotFound {
                            id: resource.to_owned(),
                        });
                }
                return Err(classified.into());
            }
        };

        objectstack_db::commit(tx).await.map_err(StorageError::from)?;

        debug!(
            resource,
            shard_key = shard.shard_key,
            slot_no,
            "reserved shard slot"
        );
        Ok(Reservation {
            id,
            kind: request.kind.clone(),
            resource_id: resource.to_owned(),
            shard_id: shard.shard_id,
            shard_key: shard.shard_key.clone(),
            slot_no,
            status: ReservationStatus::Pending,
            lease_expires_at,
        })
    }

    async fn read_winner(&self, kind: &str, resource: &str) -> StorageResult<Option<Reservation>> {
        let mut tx = self.begin().await?;
        let winner = find_live_reservation(&mut tx, kind, resource).await?;
        objectstack_db::commit(tx).await.map_err(StorageError::from)?;
        Ok(winner)
    }

    /// Confirm a pending reservation, finalizing slot ownership.
    pub async fn confirm(&self, reservation_id: Uuid, resource: &str) -> StorageResult<()> {
        let mut tx = self.begin().await?;

        let row = sqlx::query(
            "SELECT r.id, r.kind, r.resource_id, r.shard_id, r.slot_no, r.status, \
                    r.lease_expires_at, s.shard_key \
             FROM shard_reservations r JOIN shards s ON s.id = r.shard_id \
             WHERE r.id = $1 FOR UPDATE OF r",
        )
        .bind(reservation_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StorageError::ReservationNotFound {
            id: reservation_id.to_string(),
        })?;
        let reservation = reservation_from_row(&row).map_err(db_err)?;

        if reservation.resource_id != resource {
            return Err(StorageError::InvalidParameter {
                message: format!(
                    "reservation {reservation_id} is for {}, not {resource}",
                    reservation.resource_id
                ),
            });
        }
        match reservation.status {
            ReservationStatus::Confirmed => {
                // Confirm twice is fine.
                return Ok(());
            }
            ReservationStatus::Cancelled | ReservationStatus::Expired => {
                return Err(StorageError::ExpiredReservation {
                    id: reservation_id.to_string(),
                });
            }
            ReservationStatus::Pending => {}
        }
        if reservation.lease_expires_at < Utc::now() {
            sqlx::query(
                "UPDATE shard_reservations SET status = 'expired', updated_at = now() WHERE id = $1",
            )
            .bind(reservation_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            clear_slot_pending(&mut tx, reservation.shard_id, reservation.slot_no).await?;
            objectstack_db::commit(tx).await.map_err(StorageError::from)?;
            return Err(StorageError::ExpiredReservation {
                id: reservation_id.to_string(),
            });
        }

        sqlx::query(
            "UPDATE shard_slots SET resource_id = resource_id_pending, \
             resource_id_pending = NULL, updated_at = now() \
             WHERE shard_id = $1 AND slot_no = $2",
        )
        .bind(reservation.shard_id)
        .bind(reservation.slot_no)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "UPDATE shard_reservations SET status = 'confirmed', updated_at = now() WHERE id = $1",
        )
        .bind(reservation_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        objectstack_db::commit(tx).await.map_err(StorageError::from)?;
        debug!(%reservation_id, resource, "confirmed reservation");
        Ok(())
    }

    /// Cancel a pending reservation, freeing its slot.
    pub async fn cancel(&self, reservation_id: Uuid) -> StorageResult<()> {
        let mut tx = self.begin().await?;

        let row = sqlx::query(
            "UPDATE shard_reservations SET status = 'cancelled', updated_at = now() \
             WHERE id = $1 AND status = 'pending' \
             RETURNING shard_id, slot_no",
        )
        .bind(reservation_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        if let Some(row) = row {
            let shard_id: Uuid = row.try_get("shard_id").map_err(db_err)?;
            let slot_no: i32 = row.try_get("slot_no").map_err(db_err)?;
            clear_slot_pending(&mut tx, shard_id, slot_no).await?;
        }

        objectstack_db::commit(tx).await.map_err(StorageError::from)?;
        debug!(%reservation_id, "cancelled reservation");
        Ok(())
    }

    /// Free a confirmed slot by its resource id.
    pub async fn free_by_resource(&self, shard_id: Uuid, resource: &str) -> StorageResult<bool> {
        let mut tx = self.begin().await?;
        let result = sqlx::query(
            "UPDATE shard_slots SET resource_id = NULL, resource_id_pending = NULL, \
             tenant_id = NULL, updated_at = now() \
             WHERE shard_id = $1 AND resource_id = $2",
        )
        .bind(shard_id)
        .bind(resource)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "UPDATE shard_reservations SET status = 'cancelled', updated_at = now() \
             WHERE shard_id = $1 AND resource_id = $2 AND status IN ('pending', 'confirmed')",
        )
        .bind(shard_id)
        .bind(resource)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        objectstack_db::commit(tx).await.map_err(StorageError::from)?;
        Ok(result.rows_affected() > 0)
    }

    /// Free a slot by its location.
    pub async fn free_by_location(&self, shard_id: Uuid, slot_no: i32) -> StorageResult<bool> {
        let mut tx = self.begin().await?;
        let row = sqlx::query(
            "UPDATE shard_slots SET resource_id = NULL, resource_id_pending = NULL, \
             tenant_id = NULL, updated_at = now() \
             WHERE shard_id = $1 AND slot_no = $2 \
             RETURNING id",
        )
        .bind(shard_id)
        .bind(slot_no)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "UPDATE shard_reservations SET status = 'cancelled', updated_at = now() \
             WHERE shard_id = $1 AND slot_no = $2 AND status IN ('pending', 'confirmed')",
        )
        .bind(shard_id)
        .bind(slot_no)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        objectstack_db::commit(tx).await.map_err(StorageError::from)?;
        Ok(row.is_some())
    }

    /// Find the shard currently hosting a resource.
    pub async fn find_shard_by_resource(&self, resource: &str) -> StorageResult<Option<Shard>> {
        let mut tx = self.begin().await?;
        let row = sqlx::query(
            "SELECT s.id, s.kind, s.shard_key, s.capacity, s.status \
             FROM shard_slots sl JOIN shards s ON s.id = sl.shard_id \
             WHERE sl.resource_id = $1",
        )
        .bind(resource)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        let shard = row.as_ref().map(shard_from_row).transpose().map_err(db_err)?;
        objectstack_db::commit(tx).await.map_err(StorageError::from)?;
        Ok(shard)
    }

    /// Expire pending reservations whose lease elapsed, freeing their
    /// slots. Returns the number expired.
    pub async fn expire_leases(&self) -> StorageResult<u64> {
        let mut tx = self.begin().await?;

        let expired: Vec<(Uuid, i32)> = sqlx::query_as(
            "UPDATE shard_reservations SET status = 'expired', updated_at = now() \
             WHERE status = 'pending' AND lease_expires_at < now() \
             RETURNING shard_id, slot_no",
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        for (shard_id, slot_no) in &expired {
            clear_slot_pending(&mut tx, *shard_id, *slot_no).await?;
        }

        objectstack_db::commit(tx).await.map_err(StorageError::from)?;
        let count = expired.len() as u64;
        if count > 0 {
            warn!(count, "expired unconfirmed shard reservations");
        }
        Ok(count)
    }

    /// Occupancy snapshot per shard of a kind.
    pub async fn shard_stats(&self, kind: &str) -> StorageResult<Vec<ShardStats>> {
        let mut tx = self.begin().await?;
        let usage = shard_usage_all(&mut tx, kind).await?;
        objectstack_db::commit(tx).await.map_err(StorageError::from)?;
        Ok(usage
            .into_iter()
            .map(|u| ShardStats {
                free: u.free(),
                shard_key: u.shard_key,
                capacity: u.capacity,
                used: u.used,
            })
            .collect())
    }

    async fn begin(&self) -> StorageResult<DbTransaction> {
        self.conn.transaction().await.map_err(StorageError::from)
    }

    /// A serializable transaction without the scope preamble: the
    /// isolation level must be set before any other statement runs.
    async fn begin_serializable(&self) -> StorageResult<DbTransaction> {
        let mut tx = self
            .conn
            .pool()
            .begin()
            .await
            .map_err(|e| StorageError::from(DbError::from(e)))?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        Ok(tx)
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

fn shard_from_row(row: &PgRow) -> Result<Shard, sqlx::Error> {
    Ok(Shard {
        id: row.try_get("id")?,
        kind: row.try_get("kind")?,
        shard_key: row.try_get("shard_key")?,
        capacity: row.try_get("capacity")?,
        status: ShardStatus::from_str_lossy(row.try_get::<String, _>("status")?.as_str()),
    })
}

fn reservation_from_row(row: &PgRow) -> Result<Reservation, sqlx::Error> {
    Ok(Reservation {
        id: row.try_get("id")?,
        kind: row.try_get("kind")?,
        resource_id: row.try_get("resource_id")?,
        shard_id: row.try_get("shard_id")?,
        shard_key: row.try_get("shard_key")?,
        slot_no: row.try_get("slot_no")?,
        status: ReservationStatus::from_str_lossy(row.try_get::<String, _>("status")?.as_str()),
        lease_expires_at: row.try_get("lease_expires_at")?,
    })
}

async fn find_live_reservation(
    tx: &mut DbTransaction,
    kind: &str,
    resource: &str,
) -> StorageResult<Option<Reservation>> {
    let row = sqlx::query(
        "SELECT r.id, r.kind, r.resource_id, r.shard_id, r.slot_no, r.status, \
                r.lease_expires_at, s.shard_key \
         FROM shard_reservations r JOIN shards s ON s.id = r.shard_id \
         WHERE r.kind = $1 AND r.resource_id = $2 AND r.status IN ('pending', 'confirmed')",
    )
    .bind(kind)
    .bind(resource)
    .fetch_optional(&mut **tx)
    .await
    .map_err(db_err)?;
    row.as_ref().map(reservation_from_row).transpose().map_err(db_err)
}

async fn shard_usage(tx: &mut DbTransaction, kind: &str) -> StorageResult<Vec<ShardUsage>> {
    let rows = sqlx::query(
        "SELECT s.id, s.shard_key, s.capacity::bigint AS capacity, \
                count(sl.id) FILTER (WHERE sl.resource_id IS NOT NULL \
                                        OR sl.resource_id_pending IS NOT NULL) AS used \
         FROM shards s LEFT JOIN shard_slots sl ON sl.shard_id = s.id \
         WHERE s.kind = $1 AND s.status = 'active' \
         GROUP BY s.id, s.shard_key, s.capacity \
         ORDER BY s.shard_key",
    )
    .bind(kind)
    .fetch_all(&mut **tx)
    .await
    .map_err(db_err)?;

    rows.iter()
        .map(|row| {
            Ok(ShardUsage {
                shard_id: row.try_get("id").map_err(db_err)?,
                shard_key: row.try_get("shard_key").map_err(db_err)?,
                capacity: row.try_get("capacity").map_err(db_err)?,
                used: row.try_get("used").map_err(db_err)?,
            })
        })
        .collect()
}

/// Usage across all states (stats view), not just active shards.
async fn shard_usage_all(tx: &mut DbTransaction, kind: &str) -> StorageResult<Vec<ShardUsage>> {
    let rows = sqlx::query(
        "SELECT s.id, s.shard_key, s.capacity::bigint AS capacity, \
                count(sl.id) FILTER (WHERE sl.resource_id IS NOT NULL \
                                        OR sl.resource_id_pending IS NOT NULL) AS used \
         FROM shards s LEFT JOIN shard_slots sl ON sl.shard_id = s.id \
         WHERE s.kind = $1 \
         GROUP BY s.id, s.shard_key, s.capacity \
         ORDER BY s.shard_key",
    )
    .bind(kind)
    .fetch_all(&mut **tx)
    .await
    .map_err(db_err)?;

    rows.iter()
        .map(|row| {
            Ok(ShardUsage {
                shard_id: row.try_get("id").map_err(db_err)?,
                shard_key: row.try_get("shard_key").map_err(db_err)?,
                capacity: row.try_get("capacity").map_err(db_err)?,
                used: row.try_get("used").map_err(db_err)?,
            })
        })
        .collect()
}

/// Claim the lowest freed slot, if any.
async fn reuse_free_slot(
    tx: &mut DbTransaction,
    shard_id: Uuid,
    resource: &str,
    tenant_id: &str,
) -> StorageResult<Option<i32>> {
    let row = sqlx::query(
        "UPDATE shard_slots SET resource_id_pending = $3, tenant_id = $4, updated_at = now() \
         WHERE id = ( \
           SELECT id FROM shard_slots \
           WHERE shard_id = $1 AND resource_id IS NULL AND resource_id_pending IS NULL \
           ORDER BY slot_no LIMIT 1 FOR UPDATE SKIP LOCKED \
         ) AND shard_id = $2 \
         RETURNING slot_no",
    )
    .bind(shard_id)
    .bind(shard_id)
    .bind(resource)
    .bind(tenant_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(row
        .map(|r| r.try_get::<i32, _>("slot_no"))
        .transpose()
        .map_err(db_err)?)
}

/// Mint the next unused slot number, verifying capacity.
async fn mint_slot(
    tx: &mut DbTransaction,
    shard: &ShardUsage,
    resource: &str,
    tenant_id: &str,
) -> StorageResult<Option<i32>> {
    let next: (i32,) = sqlx::query_as(
        "SELECT COALESCE(MAX(slot_no) + 1, 0) FROM shard_slots WHERE shard_id = $1",
    )
    .bind(shard.shard_id)
    .fetch_one(&mut **tx)
    .await
    .map_err(db_err)?;

    if i64::from(next.0) >= shard.capacity {
        return Ok(None);
    }

    sqlx::query(
        "INSERT INTO shard_slots (shard_id, slot_no, resource_id_pending, tenant_id) \
         VALUES ($1, $2, $3, $4)",
    )
    .bind(shard.shard_id)
    .bind(next.0)
    .bind(resource)
    .bind(tenant_id)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(Some(next.0))
}

async fn clear_slot_pending(
    tx: &mut DbTransaction,
    shard_id: Uuid,
    slot_no: i32,
) -> StorageResult<()> {
    sqlx::query(
        "UPDATE shard_slots SET resource_id_pending = NULL, \
         tenant_id = CASE WHEN resource_id IS NULL THEN NULL ELSE tenant_id END, \
         updated_at = now() \
         WHERE shard_id = $1 AND slot_no = $2 AND resource_id IS NULL",
    )
    .bind(shard_id)
    .bind(slot_no)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(())
}

fn db_err(e: sqlx::Error) -> StorageError {
    StorageError::from(DbError::from(e))
}
