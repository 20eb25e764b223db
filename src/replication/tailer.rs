//! WAL Tailer
//!
//! One tailer per followed stream: continuously reads entries starting at
//! the earliest offset any follower requires, tags them, and feeds them to
//! the processing pipeline. The dispatcher stops and restarts a tailer
//! whenever a joining follower needs an earlier offset.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::leader::PartitionSpec;
use super::pipeline::PartitionRequest;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::wal::{Offset, Wal, WalEntry};

/// Handle to a running tailer task
pub(crate) struct WalTailer {
    stopped: Arc<AtomicBool>,
    stop_tx: mpsc::Sender<()>,
    finished_rx: oneshot::Receiver<()>,
}

impl WalTailer {
    /// Open a reader on the stream at `offset` and start tailing into
    /// `requests`, evaluating against the given subscription snapshot.
    pub(crate) async fn start(
        wal: Arc<dyn Wal>,
        stream: String,
        offset: Offset,
        partitions: Arc<HashMap<String, PartitionSpec>>,
        requests: mpsc::Sender<PartitionRequest>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        tracing::debug!("following {} starting at {}", stream, offset);
        let reader_name = format!("clusterfollower.{}", stream);
        let mut reader = wal.reader(&reader_name, offset).await?;

        let stopped = Arc::new(AtomicBool::new(false));
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        let (finished_tx, finished_rx) = oneshot::channel();

        let stop_flag = stopped.clone();
        tokio::spawn(async move {
            loop {
                let data = tokio::select! {
                    read = reader.read() => match read {
                        Ok(Some(data)) => data,
                        Ok(None) => continue,
                        Err(e) => {
                            if stop_flag.load(Ordering::SeqCst) {
                                break;
                            }
                            tracing::debug!("unable to read from stream '{}': {}", stream, e);
                            continue;
                        }
                    },
                    _ = stop_rx.recv() => break,
                };

                let offset = reader.offset();
                metrics.currently_reading_wal(offset);

                let request = PartitionRequest {
                    partitions: partitions.clone(),
                    entry: Arc::new(WalEntry {
                        stream: stream.clone(),
                        data,
                        offset,
                    }),
                };
                tokio::select! {
                    sent = requests.send(request) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                    _ = stop_rx.recv() => break,
                }
            }
            reader.close().await;
            let _ = finished_tx.send(());
        });

        Ok(Self {
            stopped,
            stop_tx,
            finished_rx,
        })
    }

    /// Stop the tailer and wait for its task to exit
    pub(crate) async fn stop(self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.stop_tx.try_send(());
        let _ = self.finished_rx.await;
    }
}
