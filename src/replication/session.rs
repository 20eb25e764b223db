//! Follower Session
//!
//! One session per attached follower: a bounded delivery queue filled by
//! the dispatcher and drained by a reader task that invokes the follower's
//! delivery callback. A delivery error is terminal for the session; the
//! follower reconnects with a new id to recover.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::transport::EntrySink;
use crate::metrics::Metrics;
use crate::wal::WalEntry;

/// Entries larger than this are dropped rather than delivered, guarding
/// against corrupt or unbounded payloads.
pub(crate) const MAX_ENTRY_BYTES: usize = 2_000_000;

/// Dispatcher-side handle to one follower's delivery queue
pub(crate) struct FollowerHandle {
    pub follower_id: u64,
    pub partition_number: u32,
    entries: Option<mpsc::Sender<Arc<WalEntry>>>,
    failed: Arc<AtomicBool>,
    depth: Arc<AtomicUsize>,
}

impl FollowerHandle {
    pub(crate) fn new(
        follower_id: u64,
        partition_number: u32,
        entries: mpsc::Sender<Arc<WalEntry>>,
        failed: Arc<AtomicBool>,
        depth: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            follower_id,
            partition_number,
            entries: Some(entries),
            failed,
            depth,
        }
    }

    /// Whether the session has failed
    pub(crate) fn failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Entries currently queued for delivery
    pub(crate) fn queued(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Queue one entry for delivery.
    ///
    /// A failed session closes its queue instead (idempotent). Otherwise
    /// the send may block on a full queue; that backpressure deliberately
    /// propagates up through the dispatcher to the WAL tailer.
    pub(crate) async fn submit(&mut self, entry: Arc<WalEntry>) {
        if self.failed() {
            self.entries.take();
            return;
        }
        if let Some(entries) = &self.entries {
            self.depth.fetch_add(1, Ordering::Relaxed);
            if entries.send(entry).await.is_err() {
                self.depth.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }
}

/// Reader-side state for one session
pub(crate) struct SessionReader {
    pub follower_id: u64,
    pub partition_number: u32,
    pub failed: Arc<AtomicBool>,
    pub depth: Arc<AtomicUsize>,
    pub sink: Arc<dyn EntrySink>,
    pub metrics: Arc<Metrics>,
}

impl SessionReader {
    /// Drain the queue until it closes, delivering entries to the sink.
    ///
    /// After a failure the queue keeps draining so the dispatcher never
    /// blocks on a dead follower.
    pub(crate) async fn read(&self, mut entries: mpsc::Receiver<Arc<WalEntry>>) {
        while let Some(entry) = entries.recv().await {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            if self.failed.load(Ordering::Acquire) {
                continue;
            }
            if entry.data.len() > MAX_ENTRY_BYTES {
                tracing::warn!(
                    "discarding entry of {} bytes at {} on stream '{}'",
                    entry.data.len(),
                    entry.offset,
                    entry.stream
                );
                continue;
            }
            if let Err(e) = self.sink.deliver(entry.data.clone(), entry.offset).await {
                tracing::error!(
                    "error on following for follower {}: {}",
                    self.partition_number,
                    e
                );
                self.failed.store(true, Ordering::Release);
                self.metrics.follower_failed(self.follower_id);
            }
        }
    }
}
