//! Work queue between the dispatcher and the processor pool
//!
//! Bounded and multi-consumer: each [`WorkItem`] is received by exactly one
//! worker. Receivers poll with a timeout so that idle workers get a chance
//! to notice shutdown.

use std::path::PathBuf;
use std::time::Duration;

/// Ordered group of spool files handled by one worker pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub paths: Vec<PathBuf>,
}

impl WorkItem {
    /// Splits `paths` into items of at most `max_files` entries, keeping order.
    pub fn chunk(paths: Vec<PathBuf>, max_files: usize) -> Vec<WorkItem> {
        paths
            .chunks(max_files.max(1))
            .map(|chunk| WorkItem {
                paths: chunk.to_vec(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

#[derive(Clone)]
pub struct WorkSender {
    tx: flume::Sender<WorkItem>,
}

#[derive(Clone)]
pub struct WorkReceiver {
    rx: flume::Receiver<WorkItem>,
}

/// Outcome of one bounded wait on the queue
#[derive(Debug)]
pub enum Dequeued {
    Item(WorkItem),
    Timeout,
    Closed,
}

pub fn work_queue(capacity: usize) -> (WorkSender, WorkReceiver) {
    let (tx, rx) = flume::bounded(capacity);
    (WorkSender { tx }, WorkReceiver { rx })
}

impl WorkSender {
    /// Waits for room in the queue. Fails only when every receiver is gone.
    pub async fn push(&self, item: WorkItem) -> Result<(), flume::SendError<WorkItem>> {
        self.tx.send_async(item).await
    }
}

impl WorkReceiver {
    pub async fn next(&self, timeout: Duration) -> Dequeued {
        match tokio::time::timeout(timeout, self.rx.recv_async()).await {
            Ok(Ok(item)) => Dequeued::Item(item),
            Ok(Err(flume::RecvError::Disconnected)) => Dequeued::Closed,
            Err(_) => Dequeued::Timeout,
        }
    }

    pub fn try_next(&self) -> Option<WorkItem> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
