//! Leader-Side Follower Multiplexer
//!
//! The hub accepts follower subscriptions and fans WAL entries out to
//! them. A single dispatcher task owns all mutable subscription state:
//! the follower table, the per-stream subscription tree, the WAL tailers,
//! and the processing pipeline. Joins and pipeline results arrive over
//! channels, so no lock guards the tree.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use super::pipeline::{self, PartitionRequest, PartitionsResult};
use super::protocol::{sorted_partition_keys, Follow};
use super::session::{FollowerHandle, SessionReader};
use super::tailer::WalTailer;
use super::transport::EntrySink;
use crate::config::ClusterConfig;
use crate::expr::Predicate;
use crate::metrics::Metrics;
use crate::tables::TableCatalog;
use crate::wal::{Offset, WalEntry, WalSource};

/// One follower's progress on one (stream, keys, table, partition) tuple
#[derive(Debug, Clone)]
pub(crate) struct FollowSpec {
    pub follower_id: u64,
    pub offset: Offset,
}

/// Per-table subscription state within a key group
#[derive(Clone)]
pub(crate) struct TableSpec {
    /// The table's filter, if any
    pub where_clause: Option<Arc<Predicate>>,
    /// Canonical lowercased filter string, the predicate memo key
    pub where_string: String,
    /// Follow specs by partition number
    pub followers: HashMap<u32, Vec<FollowSpec>>,
}

/// Subscription state for one partition-key group of a stream
#[derive(Clone)]
pub(crate) struct PartitionSpec {
    /// Sorted partition keys
    pub keys: Vec<String>,
    /// Subscribed tables by name
    pub tables: HashMap<String, TableSpec>,
}

/// A follower arriving at the dispatcher
struct FollowerJoined {
    follow: Follow,
    entries: mpsc::Sender<Arc<WalEntry>>,
    failed: Arc<AtomicBool>,
    depth: Arc<AtomicUsize>,
    id: oneshot::Sender<u64>,
}

/// Leader-side follower multiplexer
///
/// Must be created on a tokio runtime; construction spawns the dispatcher
/// task that owns all subscription state for the hub's lifetime.
pub struct FollowHub {
    joined_tx: mpsc::Sender<FollowerJoined>,
    queue_capacity: usize,
    metrics: Arc<Metrics>,
}

impl FollowHub {
    /// Create a hub and start its dispatcher
    pub fn new(
        config: &ClusterConfig,
        wal_source: Arc<dyn WalSource>,
        catalog: Arc<dyn TableCatalog>,
        metrics: Arc<Metrics>,
    ) -> Self {
        metrics.set_num_partitions(config.num_partitions);

        let (joined_tx, joined_rx) = mpsc::channel(128);
        let dispatcher = Dispatcher::new(config, wal_source, catalog, metrics.clone());
        tokio::spawn(dispatcher.run(joined_rx));

        Self {
            joined_tx,
            queue_capacity: config.follower_queue_capacity.max(1),
            metrics,
        }
    }

    /// Register a follower and block on its delivery loop.
    ///
    /// Entries matching the subscription are pushed to `sink` in ascending
    /// offset order per stream. Returns when the session's queue closes;
    /// a session that fails keeps draining and never returns, matching the
    /// follower-reconnects-to-recover model.
    pub async fn follow(&self, follow: Follow, sink: Arc<dyn EntrySink>) {
        let partition_number = follow.partition_number;
        let (entries_tx, entries_rx) = mpsc::channel(self.queue_capacity);
        let failed = Arc::new(AtomicBool::new(false));
        let depth = Arc::new(AtomicUsize::new(0));
        let (id_tx, id_rx) = oneshot::channel();

        let joined = FollowerJoined {
            follow,
            entries: entries_tx,
            failed: failed.clone(),
            depth: depth.clone(),
            id: id_tx,
        };
        if self.joined_tx.send(joined).await.is_err() {
            tracing::error!("follower dispatcher has shut down, rejecting follower");
            return;
        }
        let follower_id = match id_rx.await {
            Ok(id) => id,
            Err(_) => {
                tracing::error!("follower dispatcher has shut down, rejecting follower");
                return;
            }
        };

        let reader = SessionReader {
            follower_id,
            partition_number,
            failed,
            depth,
            sink,
            metrics: self.metrics.clone(),
        };
        reader.read(entries_rx).await;
    }

    /// Snapshot replication stats
    pub fn stats(&self) -> crate::metrics::Stats {
        self.metrics.get_stats()
    }
}

/// Single-task owner of all mutable subscription state
struct Dispatcher {
    num_partitions: u32,
    parallelism: usize,
    stats_interval: Duration,
    wal_source: Arc<dyn WalSource>,
    catalog: Arc<dyn TableCatalog>,
    metrics: Arc<Metrics>,
    next_follower_id: u64,
    followers: HashMap<u64, FollowerHandle>,
    streams: HashMap<String, HashMap<String, PartitionSpec>>,
    tailers: HashMap<String, WalTailer>,
    requests: Option<mpsc::Sender<PartitionRequest>>,
    stats: Vec<u64>,
    included: Vec<u64>,
}

impl Dispatcher {
    fn new(
        config: &ClusterConfig,
        wal_source: Arc<dyn WalSource>,
        catalog: Arc<dyn TableCatalog>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            num_partitions: config.num_partitions,
            parallelism: config.effective_map_parallelism(),
            stats_interval: Duration::from_secs(config.stats_interval_secs.max(1)),
            wal_source,
            catalog,
            metrics,
            next_follower_id: 0,
            followers: HashMap::new(),
            streams: HashMap::new(),
            tailers: HashMap::new(),
            requests: None,
            stats: vec![0; config.num_partitions as usize],
            included: Vec::new(),
        }
    }

    async fn run(mut self, mut joined_rx: mpsc::Receiver<FollowerJoined>) {
        tracing::debug!("starting to process followers");

        let mut results_rx: Option<mpsc::Receiver<PartitionsResult>> = None;
        let mut ticker = tokio::time::interval(self.stats_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                joined = joined_rx.recv() => match joined {
                    Some(first) => {
                        results_rx = Some(self.reconfigure(first, &mut joined_rx).await);
                    }
                    None => break,
                },
                result = recv_result(&mut results_rx) => match result {
                    Some(result) => self.dispatch(result).await,
                    None => results_rx = None,
                },
                _ = ticker.tick() => self.report_stats(),
            }
        }
    }

    /// Rebuild the pipeline and tailers around a join (or burst of joins)
    async fn reconfigure(
        &mut self,
        first: FollowerJoined,
        joined_rx: &mut mpsc::Receiver<FollowerJoined>,
    ) -> mpsc::Receiver<PartitionsResult> {
        let (requests_tx, results_rx) = pipeline::start(self.parallelism, self.num_partitions);
        let old_requests = self.requests.replace(requests_tx);

        let mut newly_joined = HashSet::new();
        self.on_follower_joined(first, &mut newly_joined);
        // a burst of joiners reconfigures once
        while let Ok(next) = joined_rx.try_recv() {
            self.on_follower_joined(next, &mut newly_joined);
        }

        // every live tailer rebinds to the new pipeline; newly joined
        // streams restart at their recomputed earliest offset
        let mut to_restart: Vec<String> = self.tailers.keys().cloned().collect();
        for stream in newly_joined {
            if !to_restart.contains(&stream) {
                to_restart.push(stream);
            }
        }
        for stream in &to_restart {
            self.restart_tailer(stream).await;
        }

        // the old pipeline drains naturally once its last sender is gone
        drop(old_requests);
        results_rx
    }

    fn on_follower_joined(&mut self, joined: FollowerJoined, newly_joined: &mut HashSet<String>) {
        self.next_follower_id += 1;
        let follower_id = self.next_follower_id;
        let follow = joined.follow;

        self.metrics
            .follower_joined(follower_id, follow.partition_number);
        tracing::debug!(
            "follower joined: {} -> partition {}",
            follower_id,
            follow.partition_number
        );
        self.followers.insert(
            follower_id,
            FollowerHandle::new(
                follower_id,
                follow.partition_number,
                joined.entries,
                joined.failed,
                joined.depth,
            ),
        );
        let _ = joined.id.send(follower_id);

        let partitions = self.streams.entry(follow.stream.clone()).or_default();
        for partition in follow.partitions.values() {
            let (partition_keys, sorted_keys) = sorted_partition_keys(&partition.keys);
            let spec = partitions.entry(partition_keys).or_insert_with(|| PartitionSpec {
                keys: sorted_keys,
                tables: HashMap::new(),
            });
            for table in &partition.tables {
                if !spec.tables.contains_key(&table.name) {
                    let Some(meta) = self.catalog.table(&table.name) else {
                        tracing::warn!(
                            "table {} requested by partition {} not found, not including from WAL",
                            table.name,
                            follow.partition_number
                        );
                        continue;
                    };
                    let where_string = meta
                        .where_clause
                        .as_ref()
                        .map(|clause| clause.to_string().to_lowercase())
                        .unwrap_or_default();
                    spec.tables.insert(
                        table.name.clone(),
                        TableSpec {
                            where_clause: meta.where_clause,
                            where_string,
                            followers: HashMap::new(),
                        },
                    );
                }
                let Some(table_spec) = spec.tables.get_mut(&table.name) else {
                    continue;
                };
                let mut offset = table.offset;
                if follow.earliest_offset.after(offset) {
                    offset = follow.earliest_offset;
                }
                table_spec
                    .followers
                    .entry(follow.partition_number)
                    .or_default()
                    .push(FollowSpec {
                        follower_id,
                        offset,
                    });
            }
        }

        newly_joined.insert(follow.stream);
    }

    /// Stop and restart one stream's tailer at its earliest required offset
    async fn restart_tailer(&mut self, stream: &str) {
        let Some(partitions) = self.streams.get(stream) else {
            return;
        };
        let earliest = earliest_offset(partitions);
        let snapshot = Arc::new(partitions.clone());

        if let Some(tailer) = self.tailers.remove(stream) {
            tailer.stop().await;
        }

        let Some(wal) = self.wal_source.open(stream) else {
            tracing::error!("unable to start following wal: stream '{}' not found", stream);
            return;
        };
        let Some(requests) = self.requests.clone() else {
            return;
        };
        match WalTailer::start(
            wal,
            stream.to_string(),
            earliest,
            snapshot,
            requests,
            self.metrics.clone(),
        )
        .await
        {
            Ok(tailer) => {
                self.tailers.insert(stream.to_string(), tailer);
            }
            Err(e) => tracing::error!("unable to start following wal: {}", e),
        }
    }

    /// Fan one reduced result out to the followers it belongs to
    async fn dispatch(&mut self, result: PartitionsResult) {
        let entry = result.entry;
        let offset = entry.offset;

        self.included.clear();
        if let Some(partitions) = self.streams.get_mut(&entry.stream) {
            for (partition_keys, partition) in partitions.iter_mut() {
                let Some(pr) = result.partitions.get(partition_keys) else {
                    continue;
                };
                for (table_name, table) in partition.tables.iter_mut() {
                    let Some(specs) = table.followers.get_mut(&pr.pid) else {
                        continue;
                    };
                    if specs.is_empty() {
                        continue;
                    }
                    let where_passed = pr.where_passed.get(table_name).copied().unwrap_or(false);
                    for spec in specs.iter_mut() {
                        if offset.after(spec.offset) {
                            if where_passed {
                                self.included.push(spec.follower_id);
                            }
                            // advance even on a predicate miss: the
                            // subscriber is caught up past this offset
                            spec.offset = offset;
                        }
                    }
                }
            }
        }

        if self.included.is_empty() {
            return;
        }
        self.included.sort_unstable();
        self.included.dedup();

        for i in 0..self.included.len() {
            let follower_id = self.included[i];
            let Some(follower) = self.followers.get_mut(&follower_id) else {
                continue;
            };
            if follower.failed() {
                continue;
            }
            follower.submit(entry.clone()).await;
            if let Some(count) = self.stats.get_mut(follower.partition_number as usize) {
                *count += 1;
            }
        }
    }

    /// Periodic throughput and queue-depth report
    fn report_stats(&mut self) {
        let interval_secs = self.stats_interval.as_secs().max(1);
        for (partition, count) in self.stats.iter().enumerate() {
            tracing::debug!("sent to partition {}: {}/s", partition, count / interval_secs);
        }
        self.stats.iter_mut().for_each(|count| *count = 0);

        for follower in self.followers.values() {
            let queued = follower.queued();
            self.metrics.queued_for_follower(follower.follower_id, queued);
            tracing::debug!("queued for follower {}: {}", follower.partition_number, queued);
        }
    }
}

async fn recv_result(
    results_rx: &mut Option<mpsc::Receiver<PartitionsResult>>,
) -> Option<PartitionsResult> {
    match results_rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Earliest offset any follow spec of the stream still needs
fn earliest_offset(partitions: &HashMap<String, PartitionSpec>) -> Offset {
    let mut earliest: Option<Offset> = None;
    for partition in partitions.values() {
        for table in partition.tables.values() {
            for specs in table.followers.values() {
                for spec in specs {
                    match earliest {
                        Some(current) if !current.after(spec.offset) => {}
                        _ => earliest = Some(spec.offset),
                    }
                }
            }
        }
    }
    earliest.unwrap_or(Offset::NONE)
}
