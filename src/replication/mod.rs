//! Replication Module
//!
//! The cluster-replication core: the leader-side follower multiplexer
//! (WAL tailer, map/reduce pipeline, dispatcher, follower sessions) and
//! the client-side follower loop.

pub mod protocol;
pub mod transport;

mod follower;
mod hasher;
mod leader;
mod pipeline;
mod session;
mod tailer;

pub use follower::{serve_remote_queries, ClusterFollower, TableSubscription};
pub use hasher::PartitionHasher;
pub use leader::FollowHub;
pub use protocol::{sorted_partition_keys, Follow, Partition, PartitionTable};
pub use transport::{EntrySink, FollowStream, LeaderClient};
