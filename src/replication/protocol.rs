//! Follow Protocol
//!
//! Wire types a follower sends to subscribe with a leader, plus the
//! canonical partition-key form used on both sides of the protocol.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::wal::Offset;

/// Subscription request a follower sends to a leader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Follow {
    /// Stream to follow
    pub stream: String,
    /// Earliest offset the follower needs replayed
    pub earliest_offset: Offset,
    /// Partition this follower is assigned
    pub partition_number: u32,
    /// Partition-key groups, keyed by canonical partition-keys string
    pub partitions: HashMap<String, Partition>,
}

/// One partition-key group within a Follow request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Partition {
    /// Partition keys, sorted
    pub keys: Vec<String>,
    /// Tables sharing this key group
    pub tables: Vec<PartitionTable>,
}

/// A single table's subscription state within a partition group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionTable {
    /// Table name
    pub name: String,
    /// Last offset the follower applied for this table
    pub offset: Offset,
}

impl Follow {
    /// Serialize the request to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize a request from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Canonicalize partition keys: sorted, joined with `|`
///
/// Returns both the canonical string and the sorted key list. Empty keys
/// canonicalize to the empty string (hash over all dimensions).
pub fn sorted_partition_keys(partition_keys: &[String]) -> (String, Vec<String>) {
    if partition_keys.is_empty() {
        return (String::new(), Vec::new());
    }
    let mut sorted = partition_keys.to_vec();
    sorted.sort();
    (sorted.join("|"), sorted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_keys_are_sorted_and_joined() {
        let keys = vec!["region".to_string(), "country".to_string()];
        let (joined, sorted) = sorted_partition_keys(&keys);
        assert_eq!(joined, "country|region");
        assert_eq!(sorted, vec!["country".to_string(), "region".to_string()]);
    }

    #[test]
    fn empty_keys_canonicalize_to_empty_string() {
        let (joined, sorted) = sorted_partition_keys(&[]);
        assert_eq!(joined, "");
        assert!(sorted.is_empty());
    }

    #[test]
    fn follow_round_trips() {
        let mut partitions = HashMap::new();
        partitions.insert(
            "country".to_string(),
            Partition {
                keys: vec!["country".to_string()],
                tables: vec![PartitionTable {
                    name: "visits".to_string(),
                    offset: Offset::new(1_000, 7),
                }],
            },
        );
        let follow = Follow {
            stream: "default".to_string(),
            earliest_offset: Offset::new(500, 0),
            partition_number: 3,
            partitions,
        };

        let bytes = follow.serialize().unwrap();
        let restored = Follow::deserialize(&bytes).unwrap();
        assert_eq!(restored.stream, "default");
        assert_eq!(restored.partition_number, 3);
        assert_eq!(restored.earliest_offset, Offset::new(500, 0));
        assert_eq!(restored.partitions["country"].tables[0].name, "visits");
    }
}
