//! Range partitioning of the key space into buckets, and the assignment of buckets to (node, disk) pairs.
//!
//! Every node builds the same [`PartitionMap`] from the same inputs, so senders and receivers agree on where each key
//! lives without ever talking about it.

use crate::error::ConfigError;
use crate::record::{Key, KEY_LEN, RECORD_SIZE};

use std::ops::RangeInclusive;

/// Buckets are addressed by a `u16` on the wire.
pub const MAX_BUCKETS: usize = u16::MAX as usize;

#[derive(Clone, Debug)]
pub struct PartitionMap {
    nodes: usize,
    disks: usize,
    /// Upper (inclusive) key of each bucket's range, strictly increasing, last one is `MAX_KEY`.
    boundaries: Vec<Key>,
    /// For each possible first key byte, the only boundaries a key starting with that byte can fall under.
    first_byte_index: Vec<RangeInclusive<usize>>,
}

impl PartitionMap {
    /// Builds a map of `buckets_per_node * nodes` buckets spread over `nodes` nodes with `disks` disks each.
    pub fn new(nodes: usize, disks: usize, buckets_per_node: usize) -> Result<Self, ConfigError> {
        if nodes == 0 {
            return Err(ConfigError::NoNodes);
        }
        if disks == 0 {
            return Err(ConfigError::NoDisks);
        }
        if nodes > MAX_BUCKETS {
            return Err(ConfigError::TooManyNodes(nodes));
        }
        let buckets = buckets_per_node.saturating_mul(nodes);
        if buckets > MAX_BUCKETS {
            return Err(ConfigError::TooManyBuckets(buckets));
        }
        if buckets == 0 || buckets % nodes != 0 || buckets % (nodes * disks) != 0 {
            return Err(ConfigError::UnevenBuckets {
                buckets,
                nodes,
                disks,
            });
        }

        let boundaries = shard_boundaries(buckets);
        let first_byte_index = index_first_byte(&boundaries);

        Ok(Self {
            nodes,
            disks,
            boundaries,
            first_byte_index,
        })
    }

    pub fn nodes(&self) -> usize {
        self.nodes
    }

    pub fn disks(&self) -> usize {
        self.disks
    }

    pub fn buckets(&self) -> usize {
        self.boundaries.len()
    }

    pub fn buckets_per_node(&self) -> usize {
        self.buckets() / self.nodes
    }

    pub fn boundaries(&self) -> &[Key] {
        &self.boundaries
    }

    /// Maps a key to the bucket whose range contains it. A key equal to a boundary belongs to the lower bucket.
    pub fn bucket_for(&self, key: &[u8]) -> u16 {
        debug_assert!(key.len() >= KEY_LEN);
        let key = &key[..KEY_LEN];
        let candidates = self.first_byte_index[key[0] as usize].clone();
        let (lo, hi) = (*candidates.start(), *candidates.end());
        // Every key under this first byte is <= boundaries[hi], so only [lo, hi) needs searching.
        let offset = self.boundaries[lo..hi].partition_point(|b| b.as_slice() < key);
        (lo + offset) as u16
    }

    pub fn owner_node(&self, bucket: u16) -> usize {
        bucket as usize % self.nodes
    }

    /// Position of `bucket` among its owner node's buckets.
    pub fn local_id(&self, bucket: u16) -> usize {
        bucket as usize / self.nodes
    }

    pub fn owner_disk(&self, bucket: u16) -> usize {
        self.local_id(bucket) % self.disks
    }

    /// Position of `bucket` among the buckets on its owner disk.
    pub fn disk_local_id(&self, bucket: u16) -> usize {
        self.local_id(bucket) / self.disks
    }

    /// Buckets owned by `node`, in increasing order: `node, node + nodes, node + 2 * nodes, ...`.
    pub fn owned_buckets(&self, node: usize) -> impl Iterator<Item = u16> + '_ {
        (node..self.buckets()).step_by(self.nodes).map(|b| b as u16)
    }

    /// Buckets owned by `node` that live on its disk `disk`, in increasing order.
    pub fn disk_buckets(&self, node: usize, disk: usize) -> impl Iterator<Item = u16> + '_ {
        self.owned_buckets(node)
            .filter(move |&b| self.owner_disk(b) == disk)
    }
}

/// Splits `[0, MAX_KEY]` into `buckets` equal-width ranges and returns each range's upper bound.
fn shard_boundaries(buckets: usize) -> Vec<Key> {
    let max = (1u128 << (KEY_LEN * 8)) - 1;
    let split = max / buckets as u128;
    let mut boundaries: Vec<Key> = (1..buckets as u128)
        .map(|i| key_from_u128(split * i))
        .collect();
    // Explicit so the final bucket reaches the top of the key space exactly.
    boundaries.push(key_from_u128(max));
    boundaries
}

fn key_from_u128(value: u128) -> Key {
    let bytes = value.to_be_bytes();
    let mut key = [0; KEY_LEN];
    key.copy_from_slice(&bytes[bytes.len() - KEY_LEN..]);
    key
}

fn index_first_byte(boundaries: &[Key]) -> Vec<RangeInclusive<usize>> {
    let last = boundaries.len() - 1;
    (0..=u8::MAX)
        .map(|byte| {
            let lo = boundaries.partition_point(|b| b[0] < byte);
            let hi = boundaries.partition_point(|b| b[0] <= byte).min(last);
            lo.min(last)..=hi
        })
        .collect()
}

/// Number of records a single disk may load at once, given that loading the next bucket overlaps sorting the
/// current one (hence two buffers per disk).
pub fn max_sort_records(memory: u64, reserve: u64, disks: usize) -> Result<u64, ConfigError> {
    let usable = memory.saturating_sub(reserve);
    let records = usable / RECORD_SIZE as u64 / disks.max(1) as u64 / 2;
    if records == 0 {
        return Err(ConfigError::InsufficientMemory {
            available: memory,
            reserve,
        });
    }
    Ok(records)
}

/// Buckets per node so that any single bucket fits in a disk's sort buffer, never fewer than `min_per_disk` per disk.
pub fn buckets_per_node(
    records_per_node: u64,
    disks: usize,
    sort_capacity_records: u64,
    min_per_disk: usize,
) -> usize {
    let records_per_disk = records_per_node.div_ceil(disks as u64);
    let per_disk = records_per_disk.div_ceil(sort_capacity_records.max(1)) as usize;
    disks * per_disk.max(min_per_disk).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{key_with_prefix, MAX_KEY};
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;

    fn scan_bucket(map: &PartitionMap, key: &Key) -> u16 {
        map.boundaries().iter().position(|b| key <= b).unwrap() as u16
    }

    #[test]
    fn boundaries_are_strictly_increasing_and_end_at_max() {
        for buckets in [1, 2, 3, 4, 7, 64, 1000] {
            let map = PartitionMap::new(1, 1, buckets).unwrap();
            assert_eq!(map.buckets(), buckets);
            assert!(map.boundaries().windows(2).all(|w| w[0] < w[1]));
            assert_eq!(*map.boundaries().last().unwrap(), MAX_KEY);
        }
    }

    #[test]
    fn boundary_keys_belong_to_lower_bucket() {
        let map = PartitionMap::new(3, 2, 42).unwrap();
        for (i, b) in map.boundaries().iter().enumerate() {
            assert_eq!(map.bucket_for(b) as usize, i);
        }
    }

    #[test]
    fn extreme_keys() {
        let map = PartitionMap::new(2, 1, 2).unwrap();
        assert_eq!(map.bucket_for(&[0; KEY_LEN]), 0);
        assert_eq!(map.bucket_for(&MAX_KEY) as usize, map.buckets() - 1);
    }

    #[test]
    fn indexed_lookup_matches_linear_scan() {
        let mut rng = SmallRng::seed_from_u64(7);
        for buckets_per_node in [1, 2, 16, 300] {
            let map = PartitionMap::new(4, 1, buckets_per_node).unwrap();
            for _ in 0..5000 {
                let key: Key = rng.gen();
                let b = map.bucket_for(&key);
                assert!((b as usize) < map.buckets());
                assert_eq!(b, scan_bucket(&map, &key));
            }
        }
    }

    #[test]
    fn four_buckets_split_on_quarters() {
        let map = PartitionMap::new(2, 1, 2).unwrap();
        let expect = [0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3];
        for (hi, &bucket) in (0u8..16).zip(expect.iter()) {
            assert_eq!(map.bucket_for(&key_with_prefix(&[hi << 4])), bucket);
        }
    }

    #[test]
    fn ownership_covers_every_bucket_once() {
        let (nodes, disks) = (3, 2);
        let map = PartitionMap::new(nodes, disks, 8).unwrap();
        let mut seen = HashSet::new();
        for node in 0..nodes {
            for disk in 0..disks {
                for (i, b) in map.disk_buckets(node, disk).enumerate() {
                    assert_eq!(map.owner_node(b), node);
                    assert_eq!(map.owner_disk(b), disk);
                    assert_eq!(map.disk_local_id(b), i);
                    assert!(seen.insert(b));
                }
            }
        }
        assert_eq!(seen.len(), map.buckets());
    }

    #[test]
    fn rejects_uneven_layouts() {
        assert!(matches!(
            PartitionMap::new(2, 3, 4),
            Err(ConfigError::UnevenBuckets { .. })
        ));
        assert!(matches!(
            PartitionMap::new(2, 1, 40000),
            Err(ConfigError::TooManyBuckets(80000))
        ));
        assert!(matches!(PartitionMap::new(0, 1, 1), Err(ConfigError::NoNodes)));
        assert!(matches!(PartitionMap::new(1, 0, 1), Err(ConfigError::NoDisks)));
    }

    #[test]
    fn bucket_sizing() {
        // Tiny data still gets the floor.
        assert_eq!(buckets_per_node(10, 2, 1000, 2), 4);
        // 10k records over 2 disks with room for 1k records per load: 5 buckets per disk.
        assert_eq!(buckets_per_node(10_000, 2, 1000, 2), 10);
        let capacity = max_sort_records(4000 + 1000, 1000, 2).unwrap();
        assert_eq!(capacity, 10);
        assert!(max_sort_records(100, 1000, 1).is_err());
    }
}
