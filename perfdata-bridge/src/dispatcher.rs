//! Spool directory dispatcher
//!
//! Polls the spool directory and queues every new perfdata file exactly once
//! while it stays in the directory. Tracking is a mark-and-sweep over two
//! generations: each tick marks the files it lists with the current flag,
//! drops entries still carrying the previous flag (the file vanished: a
//! worker claimed it or it was deleted) and then inverts the flag.
//!
//! Files renamed with the in-process marker belong to a worker and are never
//! listed.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::queue::{WorkItem, WorkSender};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("failed to list spool directory {path}: {source}")]
    List {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("work queue closed")]
    QueueClosed,
    #[error("shutdown requested while queueing")]
    Cancelled,
}

pub struct SpoolDispatcher {
    spool_directory: PathBuf,
    picked_suffix: String,
    max_files: usize,
    interval: Duration,
    queue: WorkSender,
    shutdown: CancellationToken,
    /// file name -> generation flag of the last tick that listed it
    tracked: HashMap<OsString, bool>,
    seen_flag: bool,
}

impl SpoolDispatcher {
    pub fn new(config: &BridgeConfig, queue: WorkSender, shutdown: CancellationToken) -> Self {
        Self {
            spool_directory: config.spool_directory.clone(),
            picked_suffix: config.file_picked_suffix.clone(),
            max_files: config.file_per_worker_pass,
            interval: config.interval_delay(),
            queue,
            shutdown,
            tracked: HashMap::new(),
            seen_flag: true,
        }
    }

    fn is_claimed(&self, name: &OsString) -> bool {
        name.to_string_lossy().contains(&self.picked_suffix)
    }

    async fn list(&self) -> Result<Vec<OsString>, DispatchError> {
        let list_error = |source| DispatchError::List {
            path: self.spool_directory.clone(),
            source,
        };
        let mut entries = tokio::fs::read_dir(&self.spool_directory)
            .await
            .map_err(list_error)?;

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(list_error)? {
            match entry.file_type().await {
                Ok(file_type) if file_type.is_dir() => continue,
                Ok(_) => names.push(entry.file_name()),
                // usually vanished between listing and stat
                Err(err) => {
                    debug!(path = %entry.path().display(), error = %err, "skipping unreadable spool entry");
                    continue;
                }
            }
        }
        Ok(names)
    }

    /// Deals with files a crashed worker left claimed.
    ///
    /// They are deleted, or with `resubmit` renamed back to their original
    /// name so that the next tick dispatches them again.
    pub async fn recover_claimed_files(&self, resubmit: bool) -> Result<usize, DispatchError> {
        let mut recovered = 0;
        for name in self.list().await? {
            let lossy = name.to_string_lossy().into_owned();
            let Some(marker) = lossy.find(&self.picked_suffix) else {
                continue;
            };
            let claimed = self.spool_directory.join(&name);
            let original = self.spool_directory.join(&lossy[..marker]);

            let result = if resubmit && marker > 0 && !original.exists() {
                info!(path = %claimed.display(), "resubmitting file left by a crashed worker");
                tokio::fs::rename(&claimed, &original).await
            } else {
                warn!(path = %claimed.display(), "removing file left by a crashed worker");
                tokio::fs::remove_file(&claimed).await
            };
            match result {
                Ok(()) => recovered += 1,
                Err(err) => error!(path = %claimed.display(), error = %err, "failed to recover claimed file"),
            }
        }
        Ok(recovered)
    }

    /// One polling pass. Returns how many files were queued.
    pub async fn run_tick(&mut self) -> Result<usize, DispatchError> {
        let mut new_paths = Vec::new();
        for name in self.list().await? {
            if self.is_claimed(&name) {
                continue;
            }
            if !self.tracked.contains_key(&name) {
                debug!(file = %name.to_string_lossy(), "new perfdata file");
                new_paths.push(self.spool_directory.join(&name));
            }
            self.tracked.insert(name, self.seen_flag);
        }

        let queued = new_paths.len();
        for item in WorkItem::chunk(new_paths, self.max_files) {
            tokio::select! {
                pushed = self.queue.push(item) => pushed.map_err(|_| DispatchError::QueueClosed)?,
                _ = self.shutdown.cancelled() => return Err(DispatchError::Cancelled),
            }
        }

        let current = self.seen_flag;
        self.tracked.retain(|_, seen| *seen == current);
        self.seen_flag = !self.seen_flag;

        info!("Currently {} files are waiting.", self.tracked.len());
        Ok(queued)
    }

    /// Number of files seen but not yet claimed.
    pub fn tracked_len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_tracked(&self, path: &Path) -> bool {
        path.file_name()
            .map(|name| self.tracked.contains_key(name))
            .unwrap_or(false)
    }

    /// Ticks every `interval_delay` (minus the time the tick took) until shutdown.
    pub async fn run(mut self) {
        info!(spool = %self.spool_directory.display(), "dispatcher started");
        loop {
            let started = Instant::now();
            match self.run_tick().await {
                Ok(_) => {}
                Err(DispatchError::Cancelled) => break,
                Err(err) => error!(error = %err, "dispatch tick failed"),
            }

            let delay = self.interval.saturating_sub(started.elapsed());
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!("dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{work_queue, WorkReceiver};
    use std::fs;

    const SUFFIX: &str = "-processed-by-worker-";

    fn setup(max_files: usize) -> (tempfile::TempDir, SpoolDispatcher, WorkReceiver) {
        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig {
            spool_directory: dir.path().to_path_buf(),
            file_per_worker_pass: max_files,
            ..BridgeConfig::default()
        };
        let (tx, rx) = work_queue(64);
        let dispatcher = SpoolDispatcher::new(&config, tx, CancellationToken::new());
        (dir, dispatcher, rx)
    }

    fn touch(path: &Path) {
        fs::write(path, b"").unwrap();
    }

    fn drain(rx: &WorkReceiver) -> Vec<WorkItem> {
        std::iter::from_fn(|| rx.try_next()).collect()
    }

    #[tokio::test]
    async fn test_dispatch_lifecycle() {
        let (dir, mut p, rx) = setup(1);
        let f1 = dir.path().join("host-perfdata.1479712710");
        let f2 = dir.path().join("service-perfdata.1479712710");
        let f3 = dir.path().join("host-perfdata.1479712720");
        let f4 = dir.path().join("service-perfdata.1479712720");
        let p1 = PathBuf::from(format!("{}{}0", f1.display(), SUFFIX));
        let p2 = PathBuf::from(format!("{}{}1", f2.display(), SUFFIX));

        // nagios drops files
        touch(&f1);
        touch(&f2);
        p.run_tick().await.unwrap();
        assert_eq!(rx.len(), 2);
        assert_eq!(p.tracked_len(), 2);

        // processors take them, nothing is queued twice
        drain(&rx);
        p.run_tick().await.unwrap();
        assert_eq!(rx.len(), 0);
        assert_eq!(p.tracked_len(), 2);

        // processors claim the files, tracking goes away
        fs::rename(&f1, &p1).unwrap();
        fs::rename(&f2, &p2).unwrap();
        p.run_tick().await.unwrap();
        assert_eq!(rx.len(), 0);
        assert_eq!(p.tracked_len(), 0);

        // new files show up
        touch(&f3);
        touch(&f4);
        p.run_tick().await.unwrap();
        assert_eq!(rx.len(), 2);
        assert_eq!(p.tracked_len(), 2);
        drain(&rx);

        // everything processed
        fs::remove_file(&p1).unwrap();
        fs::remove_file(&p2).unwrap();
        fs::remove_file(&f3).unwrap();
        fs::remove_file(&f4).unwrap();
        p.run_tick().await.unwrap();
        assert_eq!(rx.len(), 0);
        assert_eq!(p.tracked_len(), 0);
    }

    #[tokio::test]
    async fn test_files_are_chunked_per_tick() {
        let (dir, mut p, rx) = setup(2);
        for i in 0..5 {
            touch(&dir.path().join(format!("service-perfdata.{}", i)));
        }
        assert_eq!(p.run_tick().await.unwrap(), 5);

        let items = drain(&rx);
        let mut sizes: Vec<usize> = items.iter().map(WorkItem::len).collect();
        sizes.sort();
        assert_eq!(sizes, vec![1, 2, 2]);
        let mut all: Vec<PathBuf> = items.into_iter().flat_map(|i| i.paths).collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn test_claimed_files_are_never_dispatched() {
        let (dir, mut p, rx) = setup(10);
        let claimed = dir.path().join(format!("service-perfdata.1{}7.0", SUFFIX));
        touch(&claimed);
        fs::create_dir(dir.path().join("subdir")).unwrap();

        assert_eq!(p.run_tick().await.unwrap(), 0);
        assert!(!p.is_tracked(&claimed));
        assert!(rx.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_follow_interval_and_stop_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig {
            spool_directory: dir.path().to_path_buf(),
            interval_delay_secs: 15,
            ..BridgeConfig::default()
        };
        let (tx, rx) = work_queue(8);
        let shutdown = CancellationToken::new();
        let dispatcher = SpoolDispatcher::new(&config, tx, shutdown.clone());
        let started = Instant::now();
        let running = tokio::spawn(dispatcher.run());

        // first tick runs at once on an empty spool
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.is_empty());
        touch(&dir.path().join("service-perfdata.1"));

        tokio::time::sleep_until(started + Duration::from_secs(11)).await;
        assert!(rx.is_empty());

        tokio::time::sleep_until(started + Duration::from_secs(16)).await;
        assert_eq!(rx.len(), 1);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .expect("dispatcher kept sleeping after shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn test_listing_error_is_reported() {
        let (dir, mut p, _rx) = setup(10);
        let missing = dir.path().join("absent");
        p.spool_directory = missing;
        assert!(matches!(p.run_tick().await, Err(DispatchError::List { .. })));
    }

    #[tokio::test]
    async fn test_recovery_removes_claimed_files() {
        let (dir, p, _rx) = setup(10);
        let claimed = dir.path().join(format!("host-perfdata.1{}3.1", SUFFIX));
        let fresh = dir.path().join("host-perfdata.2");
        touch(&claimed);
        touch(&fresh);

        assert_eq!(p.recover_claimed_files(false).await.unwrap(), 1);
        assert!(!claimed.exists());
        assert!(fresh.exists());
    }

    #[tokio::test]
    async fn test_recovery_can_resubmit() {
        let (dir, mut p, rx) = setup(10);
        let original = dir.path().join("host-perfdata.1");
        let claimed = PathBuf::from(format!("{}{}3.1", original.display(), SUFFIX));
        touch(&claimed);

        assert_eq!(p.recover_claimed_files(true).await.unwrap(), 1);
        assert!(original.exists());
        assert!(!claimed.exists());

        p.run_tick().await.unwrap();
        let items = drain(&rx);
        assert_eq!(items, vec![WorkItem { paths: vec![original] }]);
    }
}
