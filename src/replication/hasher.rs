//! Partition Hasher
//!
//! Assigns entries to partitions by hashing selected dimension values with
//! murmur3-32. Assignment must be stable across leader restarts, so the
//! hash function is part of the protocol and cannot change.

use crate::wal::DimensionMap;

const HASH_SEED: u32 = 0;

/// Murmur3-32 partition assignment
///
/// Each map worker owns its own hasher; the scratch buffer is reused
/// between entries.
pub struct PartitionHasher {
    num_partitions: u32,
    buf: Vec<u8>,
}

impl PartitionHasher {
    /// Create a hasher for a cluster of `num_partitions` shards
    pub fn new(num_partitions: u32) -> Self {
        Self {
            num_partitions: num_partitions.max(1),
            buf: Vec::with_capacity(64),
        }
    }

    /// Compute the partition for an entry's dimensions
    ///
    /// With partition keys, only the present, non-empty key values feed the
    /// hash, in key order; absent keys contribute nothing. Without keys the
    /// entire encoded dimension map is hashed.
    pub fn partition_for(&mut self, dims: &DimensionMap<'_>, partition_keys: &[String]) -> u32 {
        let sum = if partition_keys.is_empty() {
            mur3::murmurhash3_x86_32(dims.as_bytes(), HASH_SEED)
        } else {
            self.buf.clear();
            for key in partition_keys {
                if let Some(value) = dims.get(key) {
                    if !value.is_empty() {
                        self.buf.extend_from_slice(value);
                    }
                }
            }
            mur3::murmurhash3_x86_32(&self.buf, HASH_SEED)
        };
        sum % self.num_partitions
    }

    /// Check whether an entry's dimensions land in a given partition
    pub fn in_partition(
        &mut self,
        dims: &DimensionMap<'_>,
        partition_keys: &[String],
        partition: u32,
    ) -> bool {
        self.partition_for(dims, partition_keys) == partition
    }
}
