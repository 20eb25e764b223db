//! WolfStream - Distributed Time-Series Replication Engine
//!
//! The cluster-replication core of a distributed time-series database.
//! A leader node persists incoming inserts to per-stream write-ahead logs
//! and fans matching entries out to a dynamic set of follower nodes; each
//! follower maintains a durable subscription to its leaders, applies
//! received entries to local tables, and advances per-table offsets.
//!
//! # Architecture
//!
//! On the leader, a single dispatcher task owns all subscription state.
//! One tailer per followed stream feeds entries into a parallel pipeline
//! that computes partition assignments (murmur3-32 over selected
//! dimensions) and evaluates per-table predicates, re-sorting each batch
//! so followers always observe ascending offsets. Bounded per-follower
//! queues push backpressure all the way back to the WAL when a follower
//! falls behind.
//!
//! # Features
//!
//! - Dynamic membership: followers join, fail, and reconnect at any time
//! - Shared multi-consumer WAL tailing that restarts at the earliest
//!   offset any joiner requires
//! - Partition- and predicate-filtered fan-out with per-entry predicate
//!   memoization
//! - Strict per-stream offset ordering despite parallel evaluation
//! - Reconnecting client loop with capped exponential backoff
//! - Replication metrics: connected partitions/followers, queue depths,
//!   current WAL position

pub mod config;
pub mod error;
pub mod expr;
pub mod metrics;
pub mod replication;
pub mod tables;
pub mod tuning;
pub mod wal;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ClusterConfig, Config};
    pub use crate::error::{Error, Result};
    pub use crate::expr::Predicate;
    pub use crate::metrics::{Metrics, Stats};
    pub use crate::replication::{
        ClusterFollower, EntrySink, Follow, FollowHub, FollowStream, LeaderClient,
        TableSubscription,
    };
    pub use crate::tables::{TableCatalog, TableInserter, TableMeta, WalRead};
    pub use crate::wal::{Offset, Wal, WalEntry, WalReader, WalSource};
}
