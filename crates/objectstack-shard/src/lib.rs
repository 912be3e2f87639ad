//! Sharding allocator.
//!
//! Assigns each logical resource `(kind, tenant, bucket, logicalName)` to a
//! slot on some physical shard, enforcing capacity and idempotent
//! allocation under concurrency:
//!
//! - Reservation runs in a serializable transaction, retried on
//!   serialization failures; the partial unique index on live reservations
//!   plus the `(shard_id, slot_no)` uniqueness make concurrent reserves
//!   collapse to one winner, with losers re-reading the winner's row.
//! - Slots are reused lowest-`slot_no`-first before new ones are minted,
//!   and minting verifies `slot_no < capacity`.
//! - Reservations are leases: unconfirmed ones expire and free their slot.
//!
//! Shard choice is behind [`ShardSelector`]; the default [`FillFirst`]
//! packs the fullest shard that still has room, lowest `shard_key` on
//! ties.

mod allocator;
mod model;
mod selector;

pub use allocator::ShardAllocator;
pub use model::{
    Reservation, ReservationStatus, ReserveRequest, Shard, ShardStats, ShardStatus, resource_id,
};
pub use selector::{FillFirst, ShardSelector, ShardUsage};
