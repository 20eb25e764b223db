//! Transport Contracts
//!
//! The replication core does not speak the wire itself. Leader-side
//! delivery and follower-side connections are injected through these
//! traits by the RPC layer.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

use super::protocol::Follow;
use crate::error::Result;
use crate::wal::Offset;

/// Leader-side delivery callback for one attached follower
///
/// Returning an error marks the follower's session failed; the follower is
/// expected to reconnect with a fresh subscription.
#[async_trait]
pub trait EntrySink: Send + Sync {
    /// Deliver one entry payload at its offset
    async fn deliver(&self, data: Bytes, offset: Offset) -> Result<()>;
}

/// Dialed connection to one leader
#[async_trait]
pub trait LeaderClient: Send + Sync {
    /// Subscribe with the leader and stream matching entries back
    async fn follow(&self, request: Follow) -> Result<Box<dyn FollowStream>>;

    /// Serve one remote query on behalf of the leader (feed role)
    async fn process_remote_query(&self, partition: u32, timeout: Duration) -> Result<()>;
}

/// Server-push stream of replicated entries
#[async_trait]
pub trait FollowStream: Send {
    /// Next replicated entry payload and its offset
    async fn next(&mut self) -> Result<(Bytes, Offset)>;
}
