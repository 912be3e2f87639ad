//! Shard selection policies.

use uuid::Uuid;

/// Occupancy of one candidate shard, as seen inside the reserving
/// transaction.
#[derive(Debug, Clone)]
pub struct ShardUsage {
    /// The shard's id.
    pub shard_id: Uuid,
    /// The shard's key.
    pub shard_key: String,
    /// Slot capacity.
    pub capacity: i64,
    /// Slots holding or pending a resource.
    pub used: i64,
}

impl ShardUsage {
    /// Remaining capacity.
    #[must_use]
    pub fn free(&self) -> i64 {
        (self.capacity - self.used).max(0)
    }
}

/// Chooses the shard a new resource lands on.
///
/// Candidates are active shards of the requested kind; the selector must
/// skip candidates without free capacity and may return `None` when
/// nothing fits.
pub trait ShardSelector: Send + Sync + std::fmt::Debug + 'static {
    /// Pick the index of the winning candidate.
    fn select(&self, candidates: &[ShardUsage]) -> Option<usize>;
}

/// Fill-first: the shard with the smallest free capacity that still has
/// room, ties broken by lowest `shard_key`.
///
/// Packing resources densely keeps whole shards free for draining and
/// capacity planning.
#[derive(Debug, Clone, Copy, Default)]
pub struct FillFirst;

impl ShardSelector for FillFirst {
    fn select(&self, candidates: &[ShardUsage]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.free() > 0)
            .min_by(|(_, a), (_, b)| {
                a.free()
                    .cmp(&b.free())
                    .then_with(|| a.shard_key.cmp(&b.shard_key))
            })
            .map(|(i, _)| i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(key: &str, capacity: i64, used: i64) -> ShardUsage {
        ShardUsage {
            shard_id: Uuid::new_v4(),
            shard_key: key.to_owned(),
            capacity,
            used,
        }
    }

    #[test]
    fn test_should_pick_fullest_shard_with_room() {
        let candidates = vec![
            usage("s1", 10, 2),
            usage("s2", 10, 9),
            usage("s3", 10, 5),
        ];
        let picked = FillFirst.select(&candidates).unwrap();
        assert_eq!(candidates[picked].shard_key, "s2");
    }

    #[test]
    fn test_should_skip_full_shards() {
        let candidates = vec![usage("s1", 4, 4), usage("s2", 4, 1)];
        let picked = FillFirst.select(&candidates).unwrap();
        assert_eq!(candidates[picked].shard_key, "s2");
    }

    #[test]
    fn test_should_break_ties_by_lowest_shard_key() {
        let candidates = vec![usage("s-b", 10, 5), usage("s-a", 10, 5)];
        let picked = FillFirst.select(&candidates).unwrap();
        assert_eq!(candidates[picked].shard_key, "s-a");
    }

    #[test]
    fn test_should_return_none_when_everything_is_full() {
        let candidates = vec![usage("s1", 2, 2), usage("s2", 1, 1)];
        assert!(FillFirst.select(&candidates).is_none());
        assert!(FillFirst.select(&[]).is_none());
    }
}
