//! Shared test fixtures: an in-memory WAL, a static table catalog, a
//! scripted leader client, and collecting sinks/inserters.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};

use crate::error::{Error, Result};
use crate::expr::Predicate;
use crate::replication::protocol::Follow;
use crate::replication::transport::{EntrySink, FollowStream, LeaderClient};
use crate::tables::{TableCatalog, TableInserter, TableMeta, WalRead};
use crate::wal::entry::{encode_dimensions, encode_payload};
use crate::wal::{parse_dimensions, DimensionMap, Offset, Wal, WalReader, WalSource};

pub(crate) fn off(ts_millis: i64, position: u64) -> Offset {
    Offset::new(ts_millis, position)
}

pub(crate) fn entry_bytes(pairs: &[(&str, &str)]) -> Bytes {
    let pairs: Vec<(&str, &[u8])> = pairs
        .iter()
        .map(|(key, value)| (*key, value.as_bytes()))
        .collect();
    let dims = encode_dimensions(&pairs);
    encode_payload(0, &dims, b"payload")
}

pub(crate) fn dims_of(data: &[u8]) -> DimensionMap<'_> {
    parse_dimensions(data).unwrap()
}

/// Poll a condition until it holds, panicking after five seconds
pub(crate) async fn wait_until(predicate: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !predicate() {
        if Instant::now() > deadline {
            panic!("condition not reached within 5s");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ---------------------------------------------------------------- wal

struct MemoryWalInner {
    entries: Mutex<Vec<(Bytes, Offset)>>,
    readers_opened: AtomicUsize,
    readers_closed: AtomicUsize,
    entries_read: AtomicUsize,
}

/// Append-only in-memory WAL for one stream
#[derive(Clone)]
pub(crate) struct MemoryWal {
    inner: Arc<MemoryWalInner>,
}

impl MemoryWal {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(MemoryWalInner {
                entries: Mutex::new(Vec::new()),
                readers_opened: AtomicUsize::new(0),
                readers_closed: AtomicUsize::new(0),
                entries_read: AtomicUsize::new(0),
            }),
        }
    }

    pub(crate) fn append(&self, data: Bytes, offset: Offset) {
        self.inner.entries.lock().push((data, offset));
    }

    pub(crate) fn readers_opened(&self) -> usize {
        self.inner.readers_opened.load(Ordering::SeqCst)
    }

    pub(crate) fn reader_closed(&self) -> bool {
        self.inner.readers_closed.load(Ordering::SeqCst) > 0
    }

    /// Total entries handed out across all readers
    pub(crate) fn entries_read(&self) -> usize {
        self.inner.entries_read.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Wal for MemoryWal {
    async fn reader(&self, _name: &str, offset: Offset) -> Result<Box<dyn WalReader>> {
        self.inner.readers_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryWalReader {
            inner: self.inner.clone(),
            start: offset,
            position: 0,
            offset,
        }))
    }
}

struct MemoryWalReader {
    inner: Arc<MemoryWalInner>,
    start: Offset,
    position: usize,
    offset: Offset,
}

#[async_trait]
impl WalReader for MemoryWalReader {
    async fn read(&mut self) -> Result<Option<Bytes>> {
        loop {
            let next = {
                let entries = self.inner.entries.lock();
                if self.position < entries.len() {
                    let entry = entries[self.position].clone();
                    self.position += 1;
                    Some(entry)
                } else {
                    None
                }
            };
            match next {
                // resume strictly after the start offset, matching the
                // dispatcher's own delivery filter
                Some((_, offset)) if !offset.after(self.start) => continue,
                Some((data, offset)) => {
                    self.offset = offset;
                    self.inner.entries_read.fetch_add(1, Ordering::SeqCst);
                    return Ok(Some(data));
                }
                None => {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    return Ok(None);
                }
            }
        }
    }

    fn offset(&self) -> Offset {
        self.offset
    }

    async fn close(&mut self) {
        self.inner.readers_closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Stream-name to in-memory WAL map
pub(crate) struct MemoryWalSource {
    streams: Mutex<HashMap<String, MemoryWal>>,
}

impl MemoryWalSource {
    pub(crate) fn new() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn add_stream(&self, name: &str) -> MemoryWal {
        let wal = MemoryWal::new();
        self.streams.lock().insert(name.to_string(), wal.clone());
        wal
    }
}

impl WalSource for MemoryWalSource {
    fn open(&self, stream: &str) -> Option<Arc<dyn Wal>> {
        self.streams
            .lock()
            .get(stream)
            .map(|wal| Arc::new(wal.clone()) as Arc<dyn Wal>)
    }
}

// ------------------------------------------------------------- tables

/// Fixed table catalog
pub(crate) struct StaticCatalog {
    tables: HashMap<String, TableMeta>,
}

impl StaticCatalog {
    pub(crate) fn new() -> Self {
        Self {
            tables: HashMap::new(),
        }
    }

    pub(crate) fn with_table(
        mut self,
        name: &str,
        where_clause: Option<Predicate>,
        partition_by: &[&str],
    ) -> Self {
        self.tables.insert(
            name.to_string(),
            TableMeta {
                name: name.to_string(),
                where_clause: where_clause.map(Arc::new),
                partition_by: partition_by.iter().map(|key| key.to_string()).collect(),
            },
        );
        self
    }
}

impl TableCatalog for StaticCatalog {
    fn table(&self, name: &str) -> Option<TableMeta> {
        self.tables.get(name).cloned()
    }
}

/// Inserter that records everything it is handed
#[derive(Clone)]
pub(crate) struct CollectingInserter {
    reads: Arc<Mutex<Vec<WalRead>>>,
}

impl CollectingInserter {
    pub(crate) fn new() -> Self {
        Self {
            reads: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn as_inserter(&self) -> Arc<dyn TableInserter> {
        Arc::new(self.clone())
    }

    pub(crate) fn offsets(&self) -> Vec<Offset> {
        self.reads.lock().iter().map(|read| read.offset).collect()
    }
}

#[async_trait]
impl TableInserter for CollectingInserter {
    async fn process_inserts(&self, mut inserts: mpsc::Receiver<WalRead>) {
        while let Some(read) = inserts.recv().await {
            self.reads.lock().push(read);
        }
    }
}

// --------------------------------------------------------------- sink

struct SinkInner {
    delivered: Mutex<Vec<(Bytes, Offset)>>,
    calls: AtomicUsize,
    fail_on_call: Option<usize>,
    gate: Option<Semaphore>,
}

/// Delivery sink that records entries; can fail on a chosen call or gate
/// every delivery behind explicit release
#[derive(Clone)]
pub(crate) struct CollectingSink {
    inner: Arc<SinkInner>,
}

impl CollectingSink {
    pub(crate) fn new() -> Self {
        Self::build(None, None)
    }

    /// Fail the nth delivery call (1-based)
    pub(crate) fn failing_at(call: usize) -> Self {
        Self::build(Some(call), None)
    }

    /// Block every delivery until `release` is called
    pub(crate) fn gated() -> Self {
        Self::build(None, Some(Semaphore::new(0)))
    }

    fn build(fail_on_call: Option<usize>, gate: Option<Semaphore>) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                delivered: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
                fail_on_call,
                gate,
            }),
        }
    }

    pub(crate) fn as_sink(&self) -> Arc<dyn EntrySink> {
        Arc::new(self.clone())
    }

    pub(crate) fn release(&self) {
        if let Some(gate) = &self.inner.gate {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    pub(crate) fn offsets(&self) -> Vec<Offset> {
        self.inner
            .delivered
            .lock()
            .iter()
            .map(|(_, offset)| *offset)
            .collect()
    }
}

#[async_trait]
impl EntrySink for CollectingSink {
    async fn deliver(&self, data: Bytes, offset: Offset) -> Result<()> {
        if let Some(gate) = &self.inner.gate {
            gate.acquire().await.unwrap().forget();
        }
        let call = self.inner.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.inner.fail_on_call == Some(call) {
            return Err(Error::Delivery("scripted delivery failure".to_string()));
        }
        self.inner.delivered.lock().push((data, offset));
        Ok(())
    }
}

// ------------------------------------------------------------- leader

struct ScriptedLeaderInner {
    follows: Mutex<Vec<Follow>>,
    fail_follows: AtomicUsize,
    batches: Mutex<VecDeque<Vec<(Bytes, Offset)>>>,
    query_calls: AtomicUsize,
}

/// Leader client that records Follow requests and streams scripted batches
#[derive(Clone)]
pub(crate) struct ScriptedLeader {
    inner: Arc<ScriptedLeaderInner>,
}

impl ScriptedLeader {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(ScriptedLeaderInner {
                follows: Mutex::new(Vec::new()),
                fail_follows: AtomicUsize::new(0),
                batches: Mutex::new(VecDeque::new()),
                query_calls: AtomicUsize::new(0),
            }),
        }
    }

    pub(crate) fn client(&self) -> Arc<dyn LeaderClient> {
        Arc::new(self.clone())
    }

    /// Fail the next `count` follow attempts with a network error
    pub(crate) fn fail_next_follows(&self, count: usize) {
        self.inner.fail_follows.store(count, Ordering::SeqCst);
    }

    /// Queue one batch; each successful follow streams the next batch and
    /// then stays open without yielding further entries
    pub(crate) fn push_batch(&self, entries: Vec<(Bytes, Offset)>) {
        self.inner.batches.lock().push_back(entries);
    }

    pub(crate) fn follow_calls(&self) -> usize {
        self.inner.follows.lock().len()
    }

    pub(crate) fn follow_requests(&self) -> Vec<Follow> {
        self.inner.follows.lock().clone()
    }

    pub(crate) fn query_calls(&self) -> usize {
        self.inner.query_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LeaderClient for ScriptedLeader {
    async fn follow(&self, request: Follow) -> Result<Box<dyn FollowStream>> {
        self.inner.follows.lock().push(request);
        let remaining = self.inner.fail_follows.load(Ordering::SeqCst);
        if remaining > 0 {
            self.inner.fail_follows.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Network("scripted follow failure".to_string()));
        }
        let entries = self.inner.batches.lock().pop_front().unwrap_or_default();
        Ok(Box::new(ScriptedStream {
            entries: entries.into(),
        }))
    }

    async fn process_remote_query(&self, _partition: u32, _timeout: Duration) -> Result<()> {
        self.inner.query_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2)).await;
        Err(Error::Network("no remote queries".to_string()))
    }
}

struct ScriptedStream {
    entries: VecDeque<(Bytes, Offset)>,
}

#[async_trait]
impl FollowStream for ScriptedStream {
    async fn next(&mut self) -> Result<(Bytes, Offset)> {
        match self.entries.pop_front() {
            Some((data, offset)) => Ok((data, offset)),
            // a live stream with nothing new to say
            None => std::future::pending().await,
        }
    }
}
