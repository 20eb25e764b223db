//! Client Follower Loop
//!
//! Runs on a node that holds some tables for an assigned partition:
//! aggregates the subscribed tables into a Follow request, maintains a
//! connection to each leader with capped exponential backoff, routes
//! received entries to per-table insert channels, and advances per-table
//! offsets. Feed-role nodes instead serve remote queries for their
//! leaders with the same backoff discipline.

use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use super::protocol::{sorted_partition_keys, Follow, Partition, PartitionTable};
use super::transport::LeaderClient;
use crate::config::ClusterConfig;
use crate::error::{Error, Result};
use crate::tables::{TableInserter, TableMeta, WalRead};
use crate::wal::Offset;

/// Reconnect backoff while following a leader
const FOLLOW_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const FOLLOW_MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Backoff while serving remote queries (feed role)
const QUERY_INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const QUERY_MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Startup waits for tables to register before the first Follow
const INITIAL_TABLE_WAIT: Duration = Duration::from_secs(30);
const SUBSCRIBER_TABLE_WAIT: Duration = Duration::from_secs(1);
const EMPTY_TABLE_EXTENSION: Duration = Duration::from_secs(5);

/// A local table subscribing to replicated entries
pub struct TableSubscription {
    /// Replication description of the table
    pub meta: TableMeta,
    /// Last offset the table applied
    pub offset: Offset,
    /// The table's insert machinery
    pub inserter: Arc<dyn TableInserter>,
}

/// Client-side follower loop for one stream
pub struct ClusterFollower {
    stream: String,
    partition: u32,
    max_follow_age: Option<Duration>,
    leaders: Vec<Arc<dyn LeaderClient>>,
    subscriber_rx: mpsc::Receiver<TableSubscription>,
    initial_table_wait: Duration,
    subscriber_wait: Duration,
    empty_extension: Duration,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl ClusterFollower {
    /// Create a follower loop; tables subscribe through the returned sender
    pub fn new(
        config: &ClusterConfig,
        leaders: Vec<Arc<dyn LeaderClient>>,
    ) -> (Self, mpsc::Sender<TableSubscription>) {
        let (subscriber_tx, subscriber_rx) = mpsc::channel(128);
        (
            Self {
                stream: config.stream.clone(),
                partition: config.partition,
                max_follow_age: config.max_follow_age(),
                leaders,
                subscriber_rx,
                initial_table_wait: INITIAL_TABLE_WAIT,
                subscriber_wait: SUBSCRIBER_TABLE_WAIT,
                empty_extension: EMPTY_TABLE_EXTENSION,
                initial_backoff: FOLLOW_INITIAL_BACKOFF,
                max_backoff: FOLLOW_MAX_BACKOFF,
            },
            subscriber_tx,
        )
    }

    /// Run the follower loop. Returns only if no table ever subscribes and
    /// no more can arrive.
    pub async fn run(mut self) {
        let mut tables = self.wait_for_tables().await;
        if tables.is_empty() {
            tracing::warn!("no tables subscribed for stream '{}', not following", self.stream);
            return;
        }

        loop {
            let (cancel_tx, cancel_rx) = watch::channel(false);
            let state = self.start_generation(&tables);
            let mut handles = Vec::with_capacity(self.leaders.len());
            for leader in &self.leaders {
                handles.push(tokio::spawn(follow_leader(
                    leader.clone(),
                    state.clone(),
                    cancel_rx.clone(),
                    self.initial_backoff,
                    self.max_backoff,
                )));
            }

            let Some(subscriber) = self.subscriber_rx.recv().await else {
                // subscription set is final; follow with it indefinitely
                for handle in handles {
                    let _ = handle.await;
                }
                return;
            };

            // restart with the augmented table list; wait for the outgoing
            // tasks so the new follow sees the final committed offsets
            let _ = cancel_tx.send(true);
            for handle in handles {
                let _ = handle.await;
            }
            let final_offsets = state.offsets.read().clone();
            for (table, offset) in tables.iter_mut().zip(final_offsets) {
                table.offset = offset;
            }
            tables.push(subscriber);
        }
    }

    /// Wait for tables to register at startup.
    ///
    /// Table schemas can appear slightly after boot: each new subscriber
    /// shortens the remaining wait, while an expiry with no tables at all
    /// extends it.
    async fn wait_for_tables(&mut self) -> Vec<TableSubscription> {
        let mut tables = Vec::new();
        let timer = tokio::time::sleep(self.initial_table_wait);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                () = &mut timer => {
                    if tables.is_empty() {
                        timer.as_mut().reset(Instant::now() + self.empty_extension);
                    } else {
                        break;
                    }
                }
                subscriber = self.subscriber_rx.recv() => match subscriber {
                    Some(subscriber) => {
                        tables.push(subscriber);
                        timer.as_mut().reset(Instant::now() + self.subscriber_wait);
                    }
                    None => break,
                }
            }
        }
        tables
    }

    /// Build the shared state for one follow generation and spawn the
    /// per-table insert consumers
    fn start_generation(&self, tables: &[TableSubscription]) -> Arc<FollowState> {
        let mut inserts = Vec::with_capacity(tables.len());
        for table in tables {
            // minimal buffering: don't read ahead of a table mid-flush
            let (insert_tx, insert_rx) = mpsc::channel(1);
            inserts.push(insert_tx);
            let inserter = table.inserter.clone();
            tokio::spawn(async move { inserter.process_inserts(insert_rx).await });
        }

        let mut partitions: HashMap<String, Partition> = HashMap::new();
        for table in tables {
            let (keys_string, keys) = sorted_partition_keys(&table.meta.partition_by);
            let partition = partitions
                .entry(keys_string)
                .or_insert_with(|| Partition {
                    keys,
                    tables: Vec::new(),
                });
            partition.tables.push(PartitionTable {
                name: table.meta.name.clone(),
                offset: table.offset,
            });
        }

        Arc::new(FollowState {
            stream: self.stream.clone(),
            partition: self.partition,
            max_follow_age: self.max_follow_age,
            partitions,
            offsets: RwLock::new(tables.iter().map(|table| table.offset).collect()),
            inserts,
        })
    }
}

/// Shared state of one follow generation
struct FollowState {
    stream: String,
    partition: u32,
    max_follow_age: Option<Duration>,
    partitions: HashMap<String, Partition>,
    offsets: RwLock<Vec<Offset>>,
    inserts: Vec<mpsc::Sender<WalRead>>,
}

impl FollowState {
    /// Build the Follow request from current per-table offsets
    fn make_follow(&self) -> Follow {
        let offsets = self.offsets.read();
        let mut earliest = Offset::NONE;
        for (i, offset) in offsets.iter().enumerate() {
            if i == 0 || earliest.after(*offset) {
                earliest = *offset;
            }
        }
        drop(offsets);

        if let Some(max_age) = self.max_follow_age {
            let earliest_allowed =
                Offset::for_ts(Utc::now() - chrono::Duration::milliseconds(max_age.as_millis() as i64));
            if earliest_allowed.after(earliest) {
                tracing::debug!("forcibly limiting following to {}", earliest_allowed);
                earliest = earliest_allowed;
            }
        }

        tracing::debug!("following {} starting at {}", self.stream, earliest);
        Follow {
            stream: self.stream.clone(),
            earliest_offset: earliest,
            partition_number: self.partition,
            partitions: self.partitions.clone(),
        }
    }

    /// Route one replicated entry to every table it advances
    async fn apply(&self, read: WalRead, cancel: &watch::Receiver<bool>) -> Result<()> {
        if *cancel.borrow() {
            return Err(Error::Canceled);
        }
        for (i, insert) in self.inserts.iter().enumerate() {
            let prior = self.offsets.read()[i];
            if read.offset.after(prior) {
                if insert.send(read.clone()).await.is_err() {
                    return Err(Error::Canceled);
                }
                self.offsets.write()[i] = read.offset;
            }
        }
        Ok(())
    }
}

/// Connection loop for one leader: follow, stream, reconnect with backoff
async fn follow_leader(
    leader: Arc<dyn LeaderClient>,
    state: Arc<FollowState>,
    mut cancel: watch::Receiver<bool>,
    initial_backoff: Duration,
    max_backoff: Duration,
) {
    let mut backoff = initial_backoff;
    loop {
        if *cancel.borrow() {
            return;
        }
        match leader.follow(state.make_follow()).await {
            Ok(mut stream) => loop {
                let next = tokio::select! {
                    next = stream.next() => next,
                    _ = cancel.changed() => return,
                };
                match next {
                    Ok((data, offset)) => {
                        backoff = initial_backoff;
                        match state.apply(WalRead { data, offset }, &cancel).await {
                            Ok(()) => {}
                            Err(e) if e.is_canceled() => return,
                            Err(e) => {
                                tracing::debug!("error applying followed entry: {}", e);
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::debug!("error following stream '{}': {}", state.stream, e);
                        break;
                    }
                }
            },
            Err(e) => tracing::debug!("unable to follow stream '{}': {}", state.stream, e),
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = cancel.changed() => return,
        }
        backoff = (backoff * 2).min(max_backoff);
    }
}

/// Feed role: serve remote queries for each leader with `concurrency`
/// workers per leader, backing off on errors
pub async fn serve_remote_queries(
    leaders: Vec<Arc<dyn LeaderClient>>,
    partition: u32,
    concurrency: usize,
    timeout: Duration,
) {
    let mut handles = Vec::new();
    for leader in leaders {
        for _ in 0..concurrency.max(1) {
            let leader = leader.clone();
            handles.push(tokio::spawn(async move {
                let mut backoff = QUERY_INITIAL_BACKOFF;
                loop {
                    match leader.process_remote_query(partition, timeout).await {
                        Ok(()) => backoff = QUERY_INITIAL_BACKOFF,
                        Err(e) => {
                            tracing::debug!("error processing remote query: {}", e);
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2).min(QUERY_MAX_BACKOFF);
                        }
                    }
                }
            }));
        }
    }
    for handle in handles {
        let _ = handle.await;
    }
}
