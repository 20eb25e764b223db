//! Table Contracts
//!
//! The replication core neither creates nor flushes tables; it consumes
//! them through these contracts. On the leader, the catalog answers which
//! tables exist and how they partition and filter. On a follower, each
//! subscribed table drains replicated reads from its own insert channel.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::expr::Predicate;
use crate::wal::Offset;

/// Replication-relevant description of a table
#[derive(Clone)]
pub struct TableMeta {
    /// Table name
    pub name: String,
    /// Optional filter: only matching entries belong to this table
    pub where_clause: Option<Arc<Predicate>>,
    /// Dimensions the table partitions by, in declaration order
    pub partition_by: Vec<String>,
}

/// Leader-side lookup of locally known tables
pub trait TableCatalog: Send + Sync {
    /// Resolve a table by name
    fn table(&self, name: &str) -> Option<TableMeta>;
}

/// One replicated read bound for a table's insert path
#[derive(Debug, Clone)]
pub struct WalRead {
    /// Entry payload
    pub data: Bytes,
    /// Offset the payload was replicated at
    pub offset: Offset,
}

/// Follower-side insert machinery for one table
#[async_trait]
pub trait TableInserter: Send + Sync {
    /// Consume replicated reads until the channel closes
    async fn process_inserts(&self, inserts: mpsc::Receiver<WalRead>);
}
