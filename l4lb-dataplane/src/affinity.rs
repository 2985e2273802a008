//! Flow affinity: which real a live flow was last sent to.

use l4lb_common::FlowKey;
use parking_lot::Mutex;

use crate::lru::LruCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AffinityEntry {
    pub real_id: u32,
    /// Monotonic nanoseconds.
    pub last_access: u64,
}

/// A lane's private table.
pub type AffinityShard = LruCache<FlowKey, AffinityEntry>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Hit(u32),
    Miss,
    /// The fallback shard was held by another lane.
    Busy,
}

/// Shared table for lanes without a shard of their own. Split by a murmur3
/// hash of the flow key; shards are only ever `try_lock`ed.
pub struct FallbackCache {
    shards: Box<[Mutex<AffinityShard>]>,
}

impl FallbackCache {
    pub fn new(capacity: usize, shards: usize) -> Self {
        let shards = shards.max(1);
        let per_shard = capacity.div_ceil(shards);
        FallbackCache {
            shards: (0..shards)
                .map(|_| Mutex::new(AffinityShard::new(per_shard)))
                .collect(),
        }
    }

    fn shard_for(&self, key: &FlowKey) -> &Mutex<AffinityShard> {
        let hash = mur3::murmurhash3_x86_32(&key.encode(), 0);
        &self.shards[hash as usize % self.shards.len()]
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

/// Where a packet's affinity lookups and writes go.
pub enum CacheTier<'a> {
    Shard(&'a mut AffinityShard),
    Fallback(&'a FallbackCache),
}

impl CacheTier<'_> {
    /// A UDP entry idle for longer than `udp_timeout_ns` is a miss but stays
    /// in the table until the next selection overwrites it.
    pub fn lookup(&mut self, key: &FlowKey, is_udp: bool, now: u64, udp_timeout_ns: u64) -> Lookup {
        match self {
            CacheTier::Shard(shard) => lookup_in(shard, key, is_udp, now, udp_timeout_ns),
            CacheTier::Fallback(fallback) => match fallback.shard_for(key).try_lock() {
                Some(mut shard) => lookup_in(&mut shard, key, is_udp, now, udp_timeout_ns),
                None => Lookup::Busy,
            },
        }
    }

    /// Unconditional overwrite. `false` when a fallback shard was busy.
    pub fn insert(&mut self, key: FlowKey, entry: AffinityEntry) -> bool {
        match self {
            CacheTier::Shard(shard) => {
                shard.insert(key, entry);
                true
            }
            CacheTier::Fallback(fallback) => match fallback.shard_for(&key).try_lock() {
                Some(mut shard) => {
                    shard.insert(key, entry);
                    true
                }
                None => false,
            },
        }
    }
}

fn lookup_in(
    shard: &mut AffinityShard,
    key: &FlowKey,
    is_udp: bool,
    now: u64,
    udp_timeout_ns: u64,
) -> Lookup {
    let Some(entry) = shard.get_mut(key) else {
        return Lookup::Miss;
    };
    if is_udp {
        if now.saturating_sub(entry.last_access) > udp_timeout_ns {
            return Lookup::Miss;
        }
        entry.last_access = now;
    }
    Lookup::Hit(entry.real_id)
}
