//! Replication Metrics
//!
//! Concurrent-safe counters for the leader's view of its followers:
//! connected partitions and followers, per-follower queue depth, and the
//! WAL offset currently being read. One `Metrics` handle is shared by the
//! hub and its sessions; `get_stats` returns a sorted snapshot.

use chrono::SecondsFormat;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;

use crate::wal::Offset;

/// Overall replication stats snapshot
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    /// Leader-wide counters
    pub leader: LeaderStats,
    /// Per-follower stats, sorted by (partition, follower id)
    pub followers: Vec<FollowerStats>,
    /// Per-partition stats, sorted by partition
    pub partitions: Vec<PartitionStats>,
}

/// Stats for the cluster leader
#[derive(Debug, Clone, Default, Serialize)]
pub struct LeaderStats {
    /// Number of partitions the cluster shards into
    pub num_partitions: u32,
    /// Partitions with at least one live follower
    pub connected_partitions: u32,
    /// Live followers
    pub connected_followers: u32,
    /// RFC3339 timestamp of the WAL offset currently being read
    pub currently_reading_wal: String,
}

/// Stats for a single follower
#[derive(Debug, Clone, Serialize)]
pub struct FollowerStats {
    /// Leader-assigned follower id
    pub follower_id: u64,
    /// Partition the follower subscribed for
    pub partition: u32,
    /// Entries queued for delivery
    pub queued: usize,
    /// Whether the follower's session has failed
    pub failed: bool,
}

/// Stats for a single partition
#[derive(Debug, Clone, Serialize)]
pub struct PartitionStats {
    /// Partition number
    pub partition: u32,
    /// Live followers attached for this partition
    pub num_followers: u32,
}

#[derive(Default)]
struct MetricsInner {
    leader: LeaderStats,
    followers: HashMap<u64, FollowerStats>,
    partitions: HashMap<u32, PartitionStats>,
}

/// Shared replication metrics table
#[derive(Default)]
pub struct Metrics {
    inner: RwLock<MetricsInner>,
}

impl Metrics {
    /// Create an empty metrics table
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all tables
    pub fn reset(&self) {
        *self.inner.write() = MetricsInner::default();
    }

    /// Set the number of partitions in the cluster
    pub fn set_num_partitions(&self, num_partitions: u32) {
        self.inner.write().leader.num_partitions = num_partitions;
    }

    /// Record the WAL offset currently being read
    pub fn currently_reading_wal(&self, offset: Offset) {
        let ts = offset.ts().to_rfc3339_opts(SecondsFormat::Secs, true);
        self.inner.write().leader.currently_reading_wal = ts;
    }

    /// Record that a follower joined the leader
    pub fn follower_joined(&self, follower_id: u64, partition: u32) {
        let mut inner = self.inner.write();
        if !inner.followers.contains_key(&follower_id) {
            inner.leader.connected_followers += 1;
            inner.followers.insert(
                follower_id,
                FollowerStats {
                    follower_id,
                    partition,
                    queued: 0,
                    failed: false,
                },
            );
        }
        if let Some(stats) = inner.followers.get_mut(&follower_id) {
            stats.partition = partition;
        }
        if !inner.partitions.contains_key(&partition) {
            inner.partitions.insert(
                partition,
                PartitionStats {
                    partition,
                    num_followers: 0,
                },
            );
            inner.leader.connected_partitions += 1;
        }
        if let Some(stats) = inner.partitions.get_mut(&partition) {
            stats.num_followers += 1;
        }
    }

    /// Record that a follower failed (analogous to leaving)
    ///
    /// Only the first call for a given follower has any effect.
    pub fn follower_failed(&self, follower_id: u64) {
        let mut inner = self.inner.write();
        let partition = match inner.followers.get_mut(&follower_id) {
            Some(stats) if !stats.failed => {
                stats.failed = true;
                stats.partition
            }
            _ => return,
        };
        inner.leader.connected_followers = inner.leader.connected_followers.saturating_sub(1);
        if let Some(stats) = inner.partitions.get_mut(&partition) {
            stats.num_followers = stats.num_followers.saturating_sub(1);
            if stats.num_followers == 0 {
                inner.leader.connected_partitions =
                    inner.leader.connected_partitions.saturating_sub(1);
            }
        }
    }

    /// Record how many entries are queued for a follower
    pub fn queued_for_follower(&self, follower_id: u64, queued: usize) {
        if let Some(stats) = self.inner.write().followers.get_mut(&follower_id) {
            stats.queued = queued;
        }
    }

    /// Snapshot the current stats, followers and partitions sorted
    pub fn get_stats(&self) -> Stats {
        let inner = self.inner.read();
        let leader = inner.leader.clone();
        let mut followers: Vec<FollowerStats> = inner.followers.values().cloned().collect();
        let mut partitions: Vec<PartitionStats> = inner.partitions.values().cloned().collect();
        drop(inner);

        followers.sort_by_key(|f| (f.partition, f.follower_id));
        partitions.sort_by_key(|p| p.partition);

        Stats {
            leader,
            followers,
            partitions,
        }
    }
}
