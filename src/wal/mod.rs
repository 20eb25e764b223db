//! Write-Ahead Log Contracts
//!
//! The replication core consumes per-stream write-ahead logs through the
//! narrow contracts in this module. The storage engine behind them (segment
//! rotation, compression, sync) lives elsewhere.

pub mod entry;

pub use entry::{parse_dimensions, DimensionMap, WalEntry};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Result;

/// Cursor into a stream: an opaque, totally ordered position that also
/// carries the wall-clock time of the segment it points into.
///
/// The all-zero offset is the sentinel "none" and orders before every real
/// offset. Offsets handed out by a single stream reader are non-decreasing.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Offset {
    ts_millis: i64,
    position: u64,
}

impl Offset {
    /// The sentinel "no offset", smaller than every real offset
    pub const NONE: Offset = Offset {
        ts_millis: 0,
        position: 0,
    };

    /// Create an offset at an explicit timestamp and in-segment position
    pub fn new(ts_millis: i64, position: u64) -> Self {
        Self {
            ts_millis,
            position,
        }
    }

    /// Create the earliest offset for a point in time
    ///
    /// Used to clamp replay horizons: every entry logged at or after `ts`
    /// has an offset that is not before the returned value.
    pub fn for_ts(ts: DateTime<Utc>) -> Self {
        Self {
            ts_millis: ts.timestamp_millis(),
            position: 0,
        }
    }

    /// Strict ordering test: does this offset come after `other`?
    pub fn after(&self, other: Offset) -> bool {
        *self > other
    }

    /// Check for the sentinel "none"
    pub fn is_none(&self) -> bool {
        *self == Offset::NONE
    }

    /// The wall-clock time this offset corresponds to
    pub fn ts(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.ts_millis).unwrap_or_default()
    }

    /// In-segment position component
    pub fn position(&self) -> u64 {
        self.position
    }
}

impl std::fmt::Display for Offset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_none() {
            write!(f, "(none)")
        } else {
            write!(f, "{}@{}", self.ts().to_rfc3339(), self.position)
        }
    }
}

/// Resolves stream names to their write-ahead logs
pub trait WalSource: Send + Sync {
    /// Look up the WAL for a stream, if the stream exists
    fn open(&self, stream: &str) -> Option<Arc<dyn Wal>>;
}

/// A single stream's write-ahead log
#[async_trait]
pub trait Wal: Send + Sync {
    /// Open a named reader positioned at the given offset
    async fn reader(&self, name: &str, offset: Offset) -> Result<Box<dyn WalReader>>;
}

/// Sequential reader over one stream
#[async_trait]
pub trait WalReader: Send {
    /// Read the next entry's payload. `Ok(None)` is a legal empty read.
    async fn read(&mut self) -> Result<Option<Bytes>>;

    /// Offset of the most recently read entry
    fn offset(&self) -> Offset;

    /// Release the reader
    async fn close(&mut self);
}
