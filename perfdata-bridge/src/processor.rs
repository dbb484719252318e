//! File processor (worker)
//!
//! A worker takes one [`WorkItem`] at a time, claims each of its files by
//! renaming them with `<file_picked_suffix><worker id>`, parses them and
//! submits everything it read as one batch. Claimed files are deleted as
//! soon as they have been read, whatever happened.
//!
//! Submission is two-phase: the batch is sent (retrying while the store is
//! unreachable); if the store rejects it for unknown resources or metrics
//! those are created, then the batch is sent exactly once more.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::{Batch, BatchBuilder};
use crate::cache::SharedResourceCache;
use crate::config::BridgeConfig;
use crate::perfdata::{parse_line, ParsedRecord};
use crate::queue::{Dequeued, WorkItem, WorkReceiver};
use crate::retry::{retry_on_connect, ExponentialBackoff};
use crate::store::{MetricStore, NewMetric, NewResource, StoreError};

/// A spool file renamed for exclusive use by one worker.
///
/// [`ClaimedFile::remove`] deletes it; dropping it without doing so also
/// removes the file.
#[derive(Debug)]
pub struct ClaimedFile {
    path: PathBuf,
    removed: bool,
}

impl ClaimedFile {
    /// Renames `path` to `path + marker`. Fails if another worker got it first.
    pub async fn claim(path: &Path, marker: &str) -> std::io::Result<Self> {
        let mut claimed = path.as_os_str().to_owned();
        claimed.push(marker);
        let claimed = PathBuf::from(claimed);
        tokio::fs::rename(path, &claimed).await?;
        Ok(Self {
            path: claimed,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn remove(mut self) -> std::io::Result<()> {
        self.removed = true;
        tokio::fs::remove_file(&self.path).await
    }
}

impl Drop for ClaimedFile {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        // early-exit fallback; a blocking unlink of one spool file is short
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "spool file removed"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => error!(path = %self.path.display(), error = %err, "failed to remove spool file"),
        }
    }
}

/// How a work item ended up in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Nothing to send
    Empty,
    /// Accepted on the first submission
    Submitted,
    /// Accepted after creating missing resources or metrics
    Reconciled,
}

pub struct FileProcessor {
    worker_id: String,
    marker: String,
    store: Arc<dyn MetricStore>,
    cache: SharedResourceCache,
    builder: BatchBuilder,
    resource_type: String,
    archive_policy_name: Option<String>,
    create_metrics: bool,
    backoff: ExponentialBackoff,
    dequeue_timeout: Duration,
}

impl FileProcessor {
    pub fn new(
        worker_id: impl Into<String>,
        config: &BridgeConfig,
        store: Arc<dyn MetricStore>,
        cache: SharedResourceCache,
    ) -> Self {
        let worker_id = worker_id.into();
        Self {
            marker: format!("{}{}", config.file_picked_suffix, worker_id),
            worker_id,
            store,
            cache,
            builder: BatchBuilder::new(config.slash_replacement.clone(), config.metric_delim.clone()),
            resource_type: config.store.resource_type.clone(),
            archive_policy_name: config.store.archive_policy_name.clone(),
            create_metrics: config.store.create_metrics,
            backoff: ExponentialBackoff::from_config(&config.store),
            dequeue_timeout: config.dequeue_timeout(),
        }
    }

    /// Claims, reads and parses one spool file. Bad lines are logged and skipped.
    pub async fn read_file(&self, path: &Path) -> anyhow::Result<Vec<ParsedRecord>> {
        let claimed = ClaimedFile::claim(path, &self.marker)
            .await
            .with_context(|| format!("failed to claim {}", path.display()))?;
        let raw = tokio::fs::read(claimed.path())
            .await
            .with_context(|| format!("failed to read {}", claimed.path().display()))?;
        let claimed_path = claimed.path().to_path_buf();
        if let Err(err) = claimed.remove().await {
            error!(path = %claimed_path.display(), error = %err, "failed to remove spool file");
        }

        let content = String::from_utf8_lossy(&raw);
        let records = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter_map(|line| match parse_line(line) {
                Ok(record) => Some(record),
                Err(err) => {
                    error!(path = %path.display(), line, error = %err, "skipping malformed perfdata");
                    None
                }
            })
            .collect();
        Ok(records)
    }

    /// Handles one work item: every readable file goes into a single batch.
    pub async fn process_item(&self, item: &WorkItem) -> anyhow::Result<SubmitOutcome> {
        let started = Instant::now();
        let mut records = Vec::new();
        for path in &item.paths {
            match self.read_file(path).await {
                Ok(mut parsed) => records.append(&mut parsed),
                Err(err) => error!(worker = %self.worker_id, error = %format!("{:#}", err), "skipping spool file"),
            }
        }

        let batch = self.builder.build(&records);
        if batch.is_empty() {
            debug!(worker = %self.worker_id, files = item.len(), "no measures to submit");
            return Ok(SubmitOutcome::Empty);
        }

        let size = serde_json::to_vec(&batch.payload)
            .context("failed to serialize batch")?
            .len();
        let outcome = self
            .submit(&batch)
            .await
            .with_context(|| format!("failed to submit batch of {} files", item.len()))?;

        info!(
            worker = %self.worker_id,
            files = item.len(),
            resources = batch.resource_count(),
            measures = batch.measure_count(),
            bytes = size,
            elapsed_ms = started.elapsed().as_millis() as u64,
            outcome = ?outcome,
            "batch submitted"
        );
        Ok(outcome)
    }

    /// Sends the batch, reconciling unknown resources/metrics at most once.
    pub async fn submit(&self, batch: &Batch) -> Result<SubmitOutcome, StoreError> {
        let store = &self.store;
        let create_metrics = self.create_metrics;
        let first = retry_on_connect("batch submission", self.backoff.clone(), || {
            store.batch_measures(&batch.payload, create_metrics)
        })
        .await;

        let rejection = match first {
            Ok(()) => return Ok(SubmitOutcome::Submitted),
            Err(err) => err,
        };
        if !self.reconcile(batch, &rejection).await? {
            return Err(rejection);
        }

        debug!(worker = %self.worker_id, "resubmitting batch");
        self.store
            .batch_measures(&batch.payload, self.create_metrics)
            .await?;
        Ok(SubmitOutcome::Reconciled)
    }

    /// Creates what the store reported missing. `false` if the rejection is not reconcilable.
    async fn reconcile(&self, batch: &Batch, rejection: &StoreError) -> Result<bool, StoreError> {
        if let Some(resource_ids) = rejection.unknown_resources() {
            for resource_id in resource_ids {
                self.ensure_resource(batch, &resource_id).await?;
            }
            return Ok(true);
        }
        if let Some(metrics) = rejection.unknown_metrics() {
            for (resource_id, name) in metrics {
                self.ensure_metric(&resource_id, &name).await?;
            }
            return Ok(true);
        }
        Ok(false)
    }

    async fn ensure_resource(&self, batch: &Batch, resource_id: &str) -> Result<(), StoreError> {
        if self.cache.contains(resource_id) {
            return Ok(());
        }
        let Some(identity) = batch.identity(resource_id) else {
            warn!(worker = %self.worker_id, resource_id, "store reported a resource absent from the batch");
            return Ok(());
        };

        let resource = NewResource {
            id: resource_id.to_string(),
            host: identity.host.clone(),
            service: identity.service.clone(),
        };
        match self.store.create_resource(&self.resource_type, &resource).await {
            Ok(()) => info!(
                worker = %self.worker_id,
                resource_id,
                host = %identity.host,
                service = %identity.service,
                "resource created"
            ),
            Err(err) if err.is_already_exists() => {
                debug!(worker = %self.worker_id, resource_id, "resource already created")
            }
            Err(err) => return Err(err),
        }

        // without on-demand metric creation the resubmission would be rejected again
        if !self.create_metrics {
            for name in batch.metric_names(resource_id) {
                self.ensure_metric(resource_id, &name).await?;
            }
        }
        self.cache.insert(resource_id);
        Ok(())
    }

    async fn ensure_metric(&self, resource_id: &str, name: &str) -> Result<(), StoreError> {
        let metric = NewMetric {
            resource_id: resource_id.to_string(),
            name: name.to_string(),
            archive_policy_name: self.archive_policy_name.clone(),
        };
        match self.store.create_metric(&metric).await {
            Ok(()) => {
                info!(worker = %self.worker_id, resource_id, metric = name, "metric created");
                Ok(())
            }
            Err(err) if err.is_already_exists() => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Drains the queue until shutdown or until every sender is gone.
    ///
    /// An item already dequeued is always finished.
    pub async fn run(self, queue: WorkReceiver, shutdown: CancellationToken) {
        info!(worker = %self.worker_id, "worker started");
        while !shutdown.is_cancelled() {
            let item = match queue.next(self.dequeue_timeout).await {
                Dequeued::Item(item) => item,
                Dequeued::Timeout => continue,
                Dequeued::Closed => break,
            };

            match AssertUnwindSafe(self.process_item(&item)).catch_unwind().await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => error!(worker = %self.worker_id, error = %format!("{:#}", err), "work item failed"),
                Err(panic) => error!(
                    worker = %self.worker_id,
                    panic = panic_message(panic.as_ref()),
                    "worker panicked on work item"
                ),
            }
        }
        info!(worker = %self.worker_id, "worker stopped");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
