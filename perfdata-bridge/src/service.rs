//! Service wiring: one dispatcher task, a pool of worker tasks and the
//! bounded work queue between them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cache::{MemoryResourceCache, SharedResourceCache};
use crate::config::BridgeConfig;
use crate::dispatcher::SpoolDispatcher;
use crate::processor::FileProcessor;
use crate::queue::work_queue;
use crate::retry::ExponentialBackoff;
use crate::store::{ensure_resource_type, MetricStore};

pub struct BridgeService {
    config: BridgeConfig,
    store: Arc<dyn MetricStore>,
    cache: SharedResourceCache,
}

impl BridgeService {
    pub fn new(config: BridgeConfig, store: Arc<dyn MetricStore>, cache: SharedResourceCache) -> Self {
        Self { config, store, cache }
    }

    /// Service with the in-memory resource cache.
    pub fn with_memory_cache(config: BridgeConfig, store: Arc<dyn MetricStore>) -> Self {
        let ttl = Duration::from_secs(config.store.cache_ttl_secs);
        Self::new(config, store, Arc::new(MemoryResourceCache::new(ttl)))
    }

    /// Runs until `shutdown` is cancelled.
    ///
    /// Fails only at startup: the resource type cannot be ensured or the
    /// spool directory cannot be scanned for leftovers.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let store_config = &self.config.store;
        ensure_resource_type(
            self.store.as_ref(),
            &store_config.resource_type,
            ExponentialBackoff::from_config(store_config),
        )
        .await
        .with_context(|| format!("failed to ensure resource type {}", store_config.resource_type))?;

        let (sender, receiver) = work_queue(self.config.queue_capacity);
        let dispatcher = SpoolDispatcher::new(&self.config, sender, shutdown.clone());
        let recovered = dispatcher
            .recover_claimed_files(self.config.resubmit_on_crash)
            .await
            .context("failed to recover claimed spool files")?;
        if recovered > 0 {
            info!(recovered, "recovered files left by crashed workers");
        }

        let pid = std::process::id();
        let workers: Vec<JoinHandle<()>> = (0..self.config.workers)
            .map(|index| {
                let processor = FileProcessor::new(
                    format!("{}.{}", pid, index),
                    &self.config,
                    self.store.clone(),
                    self.cache.clone(),
                );
                tokio::spawn(processor.run(receiver.clone(), shutdown.clone()))
            })
            .collect();
        drop(receiver);

        info!(
            workers = self.config.workers,
            spool = %self.config.spool_directory.display(),
            "perfdata bridge started"
        );

        if let Err(err) = tokio::spawn(dispatcher.run()).await {
            error!(error = %err, "dispatcher task failed");
            shutdown.cancel();
        }
        for worker in workers {
            if let Err(err) = worker.await {
                error!(error = %err, "worker task failed");
            }
        }

        info!("perfdata bridge stopped");
        Ok(())
    }
}
