//! Parallel Entry Processing
//!
//! A fixed pool of map workers computes, for every entry, the partition id
//! of each subscribed key group and evaluates per-table predicates. Because
//! workers finish out of order while followers require strictly ascending
//! offsets, a small queued/drained handshake re-sorts each parallel batch
//! before results reach the dispatcher.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use super::hasher::PartitionHasher;
use super::leader::PartitionSpec;
use crate::tuning;
use crate::wal::{parse_dimensions, WalEntry};

/// One entry plus the subscription snapshot it should be evaluated against
pub(crate) struct PartitionRequest {
    pub partitions: Arc<HashMap<String, PartitionSpec>>,
    pub entry: Arc<WalEntry>,
}

/// Mapped evaluation of one entry across all subscribed key groups
pub(crate) struct PartitionsResult {
    pub entry: Arc<WalEntry>,
    pub partitions: HashMap<String, PartitionResult>,
}

/// Evaluation of one key group: its partition id and per-table predicate
/// outcomes for tables with followers on that partition
pub(crate) struct PartitionResult {
    pub pid: u32,
    pub where_passed: HashMap<String, bool>,
}

/// Start the pipeline; returns the request sender and result receiver.
///
/// Closing the request sender drains in-flight batches, then shuts the
/// workers and reducer down in order, closing the results channel last.
pub(crate) fn start(
    parallelism: usize,
    num_partitions: u32,
) -> (
    mpsc::Sender<PartitionRequest>,
    mpsc::Receiver<PartitionsResult>,
) {
    let parallelism = parallelism.max(1);
    let capacity = tuning::pipeline_channel_capacity(parallelism, num_partitions);
    tracing::debug!("using {} workers to process entries for followers", parallelism);

    let (requests_tx, requests_rx) = mpsc::channel(capacity);
    let (in_tx, in_rx) = mpsc::channel(capacity);
    let (mapped_tx, mapped_rx) = mpsc::channel(capacity);
    let (results_tx, results_rx) = mpsc::channel(capacity);
    let (queued_tx, queued_rx) = mpsc::channel(1);
    let (drained_tx, drained_rx) = mpsc::channel(1);

    tokio::spawn(enqueue_requests(
        parallelism,
        requests_rx,
        in_tx,
        queued_tx,
        drained_rx,
    ));

    let shared_in = Arc::new(Mutex::new(in_rx));
    for _ in 0..parallelism {
        tokio::spawn(map_requests(
            num_partitions,
            shared_in.clone(),
            mapped_tx.clone(),
        ));
    }
    drop(mapped_tx);

    tokio::spawn(reduce_results(
        parallelism,
        mapped_rx,
        results_tx,
        queued_rx,
        drained_tx,
    ));

    (requests_tx, results_rx)
}

/// Feed requests to the workers, signalling the reducer once a full batch
/// of `parallelism` entries is in flight. Partial batches flush as soon as
/// intake runs dry so latency stays bounded under light load.
async fn enqueue_requests(
    parallelism: usize,
    mut requests: mpsc::Receiver<PartitionRequest>,
    in_tx: mpsc::Sender<PartitionRequest>,
    queued_tx: mpsc::Sender<usize>,
    mut drained_rx: mpsc::Receiver<()>,
) {
    let mut in_flight = 0usize;
    loop {
        match requests.try_recv() {
            Ok(request) => {
                if in_tx.send(request).await.is_err() {
                    return;
                }
                in_flight += 1;
                if in_flight == parallelism {
                    flush_batch(&mut in_flight, &queued_tx, &mut drained_rx).await;
                }
            }
            Err(mpsc::error::TryRecvError::Empty) => {
                flush_batch(&mut in_flight, &queued_tx, &mut drained_rx).await;
                match requests.recv().await {
                    Some(request) => {
                        if in_tx.send(request).await.is_err() {
                            return;
                        }
                        in_flight += 1;
                        if in_flight == parallelism {
                            flush_batch(&mut in_flight, &queued_tx, &mut drained_rx).await;
                        }
                    }
                    None => break,
                }
            }
            Err(mpsc::error::TryRecvError::Disconnected) => break,
        }
    }
    flush_batch(&mut in_flight, &queued_tx, &mut drained_rx).await;
    // dropping in_tx ends the workers; dropping queued_tx ends the reducer
}

async fn flush_batch(
    in_flight: &mut usize,
    queued_tx: &mpsc::Sender<usize>,
    drained_rx: &mut mpsc::Receiver<()>,
) {
    if *in_flight == 0 {
        return;
    }
    if queued_tx.send(*in_flight).await.is_ok() {
        let _ = drained_rx.recv().await;
    }
    *in_flight = 0;
}

/// Map worker: evaluate entries against the subscription snapshot.
///
/// tokio channels are single-consumer, so the pool shares the input behind
/// a mutex; contention is only on dequeue.
async fn map_requests(
    num_partitions: u32,
    in_rx: Arc<Mutex<mpsc::Receiver<PartitionRequest>>>,
    mapped_tx: mpsc::Sender<PartitionsResult>,
) {
    let mut hasher = PartitionHasher::new(num_partitions);
    loop {
        let request = {
            let mut rx = in_rx.lock().await;
            rx.recv().await
        };
        let Some(request) = request else { break };

        let result =
            match std::panic::catch_unwind(AssertUnwindSafe(|| map_request(&mut hasher, &request)))
            {
                Ok(result) => result,
                Err(_) => {
                    tracing::error!(
                        "panic while mapping entry at {} on stream '{}'",
                        request.entry.offset,
                        request.entry.stream
                    );
                    // degraded result keeps batch accounting intact
                    PartitionsResult {
                        entry: request.entry.clone(),
                        partitions: HashMap::new(),
                    }
                }
            };

        if mapped_tx.send(result).await.is_err() {
            break;
        }
    }
}

fn map_request(hasher: &mut PartitionHasher, request: &PartitionRequest) -> PartitionsResult {
    let mut result = PartitionsResult {
        entry: request.entry.clone(),
        partitions: HashMap::with_capacity(request.partitions.len()),
    };

    let dims = match parse_dimensions(&request.entry.data) {
        Ok(dims) => dims,
        Err(e) => {
            tracing::debug!(
                "unable to parse dimensions at {} on stream '{}': {}",
                request.entry.offset,
                request.entry.stream,
                e
            );
            return result;
        }
    };

    // predicate results memoized per entry, keyed by canonical where string
    let mut where_results: HashMap<&str, bool> = HashMap::with_capacity(16);

    for (partition_keys, partition) in request.partitions.iter() {
        let pid = hasher.partition_for(&dims, &partition.keys);
        let mut where_passed = HashMap::with_capacity(partition.tables.len());
        for (table_name, table) in &partition.tables {
            let specs_present = table
                .followers
                .get(&pid)
                .map(|specs| !specs.is_empty())
                .unwrap_or(false);
            if !specs_present {
                continue;
            }
            let passed = match where_results.get(table.where_string.as_str()) {
                Some(passed) => *passed,
                None => {
                    let passed = table
                        .where_clause
                        .as_ref()
                        .map(|clause| clause.eval(&dims))
                        .unwrap_or(true);
                    where_results.insert(table.where_string.as_str(), passed);
                    passed
                }
            };
            where_passed.insert(table_name.clone(), passed);
        }
        result
            .partitions
            .insert(partition_keys.clone(), PartitionResult { pid, where_passed });
    }

    result
}

/// Reducer: restore ascending offset order within each parallel batch
async fn reduce_results(
    parallelism: usize,
    mut mapped_rx: mpsc::Receiver<PartitionsResult>,
    results_tx: mpsc::Sender<PartitionsResult>,
    mut queued_rx: mpsc::Receiver<usize>,
    drained_tx: mpsc::Sender<()>,
) {
    let mut buf: Vec<PartitionsResult> = Vec::with_capacity(parallelism);
    while let Some(batch_size) = queued_rx.recv().await {
        buf.clear();
        for _ in 0..batch_size {
            match mapped_rx.recv().await {
                Some(result) => buf.push(result),
                None => break,
            }
        }
        buf.sort_by_key(|result| result.entry.offset);
        for result in buf.drain(..) {
            // the dispatcher may already have moved to a new pipeline
            let _ = results_tx.send(result).await;
        }
        if drained_tx.send(()).await.is_err() {
            break;
        }
    }
    // dropping results_tx closes the results channel
}
