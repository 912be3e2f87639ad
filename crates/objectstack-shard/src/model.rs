//! Allocator data model.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Shard availability state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStatus {
    /// Accepting new resources.
    Active,
    /// Existing resources stay, new ones go elsewhere.
    Draining,
    /// Out of rotation.
    Disabled,
}

impl ShardStatus {
    /// Stable string form stored in the `status` column.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Disabled => "disabled",
        }
    }

    /// Parse the stored form; unknown values are treated as disabled.
    #[must_use]
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            "draining" => Self::Draining,
            _ => Self::Disabled,
        }
    }
}

/// A physical shard.
#[derive(Debug, Clone)]
pub struct Shard {
    /// Surrogate id.
    pub id: Uuid,
    /// Resource kind this shard hosts.
    pub kind: String,
    /// Operator-facing shard key.
    pub shard_key: String,
    /// Slot capacity.
    pub capacity: i32,
    /// Availability state.
    pub status: ShardStatus,
}

/// Reservation lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationStatus {
    /// Awaiting confirmation within the lease.
    Pending,
    /// Slot ownership finalized.
    Confirmed,
    /// Abandoned by the caller.
    Cancelled,
    /// Lease elapsed without confirmation.
    Expired,
}

impl ReservationStatus {
    /// Stable string form stored in the `status` column.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    /// Parse the stored form; unknown values are treated as expired.
    #[must_use]
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "confirmed" => Self::Confirmed,
            "cancelled" => Self::Cancelled,
            _ => Self::Expired,
        }
    }
}

/// A slot reservation.
#[derive(Debug, Clone)]
pub struct Reservation {
    /// Reservation id.
    pub id: Uuid,
    /// Resource kind.
    pub kind: String,
    /// The resource being placed.
    pub resource_id: String,
    /// The chosen shard.
    pub shard_id: Uuid,
    /// The chosen shard's key.
    pub shard_key: String,
    /// The reserved slot.
    pub slot_no: i32,
    /// Lifecycle state.
    pub status: ReservationStatus,
    /// Confirmation deadline.
    pub lease_expires_at: DateTime<Utc>,
}

/// A reservation request for a logical resource.
#[derive(Debug, Clone)]
pub struct ReserveRequest {
    /// Resource kind (e.g. `vector`, `iceberg`).
    pub kind: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Bucket the resource belongs to.
    pub bucket_name: String,
    /// Logical resource name within the bucket.
    pub logical_name: String,
    /// Lease length; `None` uses the allocator default.
    pub lease: Option<std::time::Duration>,
}

impl ReserveRequest {
    /// The canonical resource id for this request.
    #[must_use]
    pub fn resource_id(&self) -> String {
        resource_id(&self.kind, &self.bucket_name, &self.logical_name)
    }
}

/// Canonical resource id: `{kind}::{bucket}::{logical}`.
#[must_use]
pub fn resource_id(kind: &str, bucket: &str, logical: &str) -> String {
    format!("{kind}::{bucket}::{logical}")
}

/// Occupancy snapshot of one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardStats {
    /// The shard's key.
    pub shard_key: String,
    /// Slot capacity.
    pub capacity: i64,
    /// Slots holding or pending a resource.
    pub used: i64,
    /// Remaining capacity.
    pub free: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_build_resource_id() {
        assert_eq!(
            resource_id("vector", "embeddings", "items-v2"),
            "vector::embeddings::items-v2"
        );
    }

    #[test]
    fn test_should_round_trip_status_strings() {
        for s in [
            ReservationStatus::Pending,
            ReservationStatus::Confirmed,
            ReservationStatus::Cancelled,
            ReservationStatus::Expired,
        ] {
            assert_eq!(ReservationStatus::from_str_lossy(s.as_str()), s);
        }
        for s in [ShardStatus::Active, ShardStatus::Draining, ShardStatus::Disabled] {
            assert_eq!(ShardStatus::from_str_lossy(s.as_str()), s);
        }
    }
}
