/*!
Harness de test pour le bridge perfdata

Facilite l'écriture de tests bout-en-bout avec:
- Un spool temporaire et une config adaptée aux tests (intervalles courts)
- Un `MockStore` partagé entre dispatcher, workers et assertions
- L'accès aux briques (dispatcher, processor) ou au service complet
*/

use crate::mock_store::MockStore;
use crate::perfdata_builder::SpoolFile;
use anyhow::{Context, Result};
use perfdata_bridge::cache::{MemoryResourceCache, SharedResourceCache};
use perfdata_bridge::config::{BridgeConfig, StoreConfig};
use perfdata_bridge::dispatcher::SpoolDispatcher;
use perfdata_bridge::identity::ResourceIdentity;
use perfdata_bridge::processor::FileProcessor;
use perfdata_bridge::queue::{work_queue, WorkReceiver};
use perfdata_bridge::BridgeService;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Logging des tests, sans échouer si déjà initialisé
pub fn init_test_logging() {
    tracing_subscriber::fmt().with_test_writer().try_init().ok();
}

/// Spool temporaire + store mocké
pub struct SpoolHarness {
    dir: TempDir,
    pub config: BridgeConfig,
    pub store: MockStore,
    cache: SharedResourceCache,
}

impl SpoolHarness {
    pub fn new() -> Result<Self> {
        init_test_logging();
        let dir = tempfile::tempdir().context("failed to create spool directory")?;

        let config = BridgeConfig {
            spool_directory: dir.path().to_path_buf(),
            workers: 2,
            file_per_worker_pass: 10,
            interval_delay_secs: 1,
            dequeue_timeout_secs: 1,
            store: StoreConfig {
                connect_retry_initial_ms: 1,
                connect_retry_max_secs: 1,
                ..StoreConfig::default()
            },
            ..BridgeConfig::default()
        };

        Ok(Self {
            dir,
            config,
            store: MockStore::new(),
            cache: Arc::new(MemoryResourceCache::new(Duration::from_secs(60))),
        })
    }

    pub fn spool(&self) -> &Path {
        self.dir.path()
    }

    /// Dépose un fichier comme le ferait Nagios
    pub fn drop_file(&self, name: &str, file: &SpoolFile) -> Result<PathBuf> {
        file.write(self.spool(), name)
    }

    /// Noms des fichiers présents dans le spool, triés
    pub fn spool_entries(&self) -> Result<Vec<String>> {
        let mut names = std::fs::read_dir(self.spool())?
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<std::io::Result<Vec<_>>>()?;
        names.sort();
        Ok(names)
    }

    pub fn dispatcher(&self) -> (SpoolDispatcher, WorkReceiver) {
        let (sender, receiver) = work_queue(self.config.queue_capacity);
        let dispatcher = SpoolDispatcher::new(&self.config, sender, CancellationToken::new());
        (dispatcher, receiver)
    }

    /// Worker branché sur le mock, cache partagé entre workers du harness
    pub fn processor(&self, index: usize) -> FileProcessor {
        FileProcessor::new(
            format!("{}.{}", std::process::id(), index),
            &self.config,
            Arc::new(self.store.clone()),
            self.cache.clone(),
        )
    }

    pub fn service(&self) -> BridgeService {
        BridgeService::with_memory_cache(self.config.clone(), Arc::new(self.store.clone()))
    }

    pub fn resource_id(host: &str, service: &str) -> String {
        ResourceIdentity::new(host, service).resource_id().to_string()
    }

    /// Attend qu'une condition devienne vraie (polling 20ms)
    pub async fn wait_for(&self, timeout: Duration, condition: impl Fn(&Self) -> bool) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if condition(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        condition(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_store::StoreCall;
    use crate::perfdata_builder::PerfdataLine;
    use perfdata_bridge::processor::SubmitOutcome;

    fn uptime_file(host: &str, value: &str) -> SpoolFile {
        SpoolFile::new().line(PerfdataLine::service(host, "Uptime").metric("uptime", value))
    }

    #[tokio::test]
    async fn test_two_files_dispatched_once_and_batched_together() {
        let harness = SpoolHarness::new().unwrap();
        harness
            .drop_file("service-perfdata.1479726660", &uptime_file("arn", "9175101.06"))
            .unwrap();
        harness
            .drop_file(
                "host-perfdata.1479726660",
                &SpoolFile::new().line(PerfdataLine::host("tsf").metric("rta", "0.08")),
            )
            .unwrap();

        let (mut dispatcher, receiver) = harness.dispatcher();
        assert_eq!(dispatcher.run_tick().await.unwrap(), 2);
        assert_eq!(dispatcher.run_tick().await.unwrap(), 0);

        let item = receiver.try_next().unwrap();
        assert_eq!(item.len(), 2);
        assert!(receiver.try_next().is_none());

        let outcome = harness.processor(0).process_item(&item).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Reconciled);

        // one batch rejected, one create per identity, one resubmission
        let mut created: Vec<String> = harness.store.created_resources().into_iter().map(|r| r.id).collect();
        created.sort();
        let mut expected = vec![
            SpoolHarness::resource_id("arn", "Uptime"),
            SpoolHarness::resource_id("tsf", "PING"),
        ];
        expected.sort();
        assert_eq!(created, expected);
        assert_eq!(harness.store.batch_calls(), 2);

        let uptime = harness
            .store
            .measures(&SpoolHarness::resource_id("arn", "Uptime"), "Uptime::uptime");
        assert_eq!(uptime.len(), 1);
        assert_eq!(uptime[0].timestamp, "2016-11-21T11:11:00+00:00");
        assert!((uptime[0].value - 9175101.06).abs() < 1e-6);

        assert!(harness.spool_entries().unwrap().is_empty());
        dispatcher.run_tick().await.unwrap();
        assert_eq!(dispatcher.tracked_len(), 0);
    }

    #[tokio::test]
    async fn test_known_resources_are_created_once_across_items() {
        let harness = SpoolHarness::new().unwrap();
        let (mut dispatcher, receiver) = harness.dispatcher();
        let processor = harness.processor(0);

        harness.drop_file("a", &uptime_file("arn", "1")).unwrap();
        dispatcher.run_tick().await.unwrap();
        processor.process_item(&receiver.try_next().unwrap()).await.unwrap();

        harness.drop_file("b", &uptime_file("arn", "2")).unwrap();
        dispatcher.run_tick().await.unwrap();
        let outcome = processor.process_item(&receiver.try_next().unwrap()).await.unwrap();

        assert_eq!(outcome, SubmitOutcome::Submitted);
        assert_eq!(harness.store.created_resources().len(), 1);
        assert_eq!(harness.store.total_measures(), 2);
    }

    #[tokio::test]
    async fn test_resubmitting_a_batch_only_duplicates_measures() {
        let harness = SpoolHarness::new().unwrap();
        let path = harness.drop_file("a", &uptime_file("arn", "1")).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let processor = harness.processor(0);

        let item = perfdata_bridge::queue::WorkItem { paths: vec![path.clone()] };
        processor.process_item(&item).await.unwrap();

        // crash after submission, before deletion: the same file comes back
        std::fs::write(&path, content).unwrap();
        let outcome = processor.process_item(&item).await.unwrap();

        assert_eq!(outcome, SubmitOutcome::Submitted);
        assert_eq!(harness.store.created_resources().len(), 1);
        let measures = harness
            .store
            .measures(&SpoolHarness::resource_id("arn", "Uptime"), "Uptime::uptime");
        assert_eq!(measures.len(), 2);
        assert_eq!(measures[0], measures[1]);
    }

    #[tokio::test]
    async fn test_resource_creation_race_counts_as_created() {
        let harness = SpoolHarness::new().unwrap();
        let id = SpoolHarness::resource_id("arn", "Uptime");
        harness.store.race_on_create(&id);
        let path = harness.drop_file("a", &uptime_file("arn", "1")).unwrap();

        let item = perfdata_bridge::queue::WorkItem { paths: vec![path] };
        let outcome = harness.processor(0).process_item(&item).await.unwrap();

        assert_eq!(outcome, SubmitOutcome::Reconciled);
        assert_eq!(harness.store.total_measures(), 1);
    }

    #[tokio::test]
    async fn test_malformed_lines_do_not_block_the_file() {
        let harness = SpoolHarness::new().unwrap();
        let file = SpoolFile::new()
            .text("DATATYPE::SERVICEPERFDATA\tTIMET::now\tHOSTNAME::arn\tSERVICEDESC::Uptime\tSERVICEPERFDATA::uptime=1")
            .text("")
            .line(PerfdataLine::service("arn", "Disk /var").metric("/var", "4.5M"))
            .line(PerfdataLine::service("arn", "Load").raw("load1=abc"));
        let path = harness.drop_file("a", &file).unwrap();

        let item = perfdata_bridge::queue::WorkItem { paths: vec![path] };
        harness.processor(0).process_item(&item).await.unwrap();

        let disk = harness
            .store
            .measures(&SpoolHarness::resource_id("arn", "Disk @var"), "Disk @var::@var");
        assert_eq!(disk.len(), 1);
        assert_eq!(disk[0].value, 4.5 * 1024.0 * 1024.0);
        assert_eq!(harness.store.total_measures(), 1);
        assert!(harness.spool_entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_service_end_to_end() {
        let harness = SpoolHarness::new().unwrap();
        harness.store.fail_connects(2);
        for i in 0..5 {
            harness
                .drop_file(&format!("service-perfdata.{}", i), &uptime_file(&format!("host{}", i), "1"))
                .unwrap();
        }

        let shutdown = CancellationToken::new();
        let running = tokio::spawn(harness.service().run(shutdown.clone()));

        let done = harness
            .wait_for(Duration::from_secs(10), |h| {
                h.store.total_measures() == 5 && h.spool_entries().map(|e| e.is_empty()).unwrap_or(false)
            })
            .await;
        shutdown.cancel();
        running.await.unwrap().unwrap();

        assert!(done, "spool not drained: {:?}", harness.spool_entries());
        assert!(harness.store.has_resource_type("nagios-service"));
        assert_eq!(
            harness
                .store
                .count_calls(|c| matches!(c, StoreCall::CreateResourceType(_))),
            1
        );
        assert_eq!(harness.store.created_resources().len(), 5);
    }

    #[tokio::test]
    async fn test_service_resubmits_crash_leftovers() {
        let mut harness = SpoolHarness::new().unwrap();
        harness.config.resubmit_on_crash = true;
        let leftover = format!("service-perfdata.1{}999.0", harness.config.file_picked_suffix);
        harness.drop_file(&leftover, &uptime_file("arn", "1")).unwrap();

        let shutdown = CancellationToken::new();
        let running = tokio::spawn(harness.service().run(shutdown.clone()));
        let done = harness
            .wait_for(Duration::from_secs(10), |h| h.store.total_measures() == 1)
            .await;
        shutdown.cancel();
        running.await.unwrap().unwrap();

        assert!(done);
        assert!(harness.spool_entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_service_fails_when_store_rejects_bootstrap() {
        let harness = SpoolHarness::new().unwrap();
        harness.store.fail_connects(usize::MAX);

        let result = harness.service().run(CancellationToken::new()).await;
        assert!(result.is_err());
        assert_eq!(harness.store.total_measures(), 0);
    }
}
