//! Watch coordinator: turns watcher batches into incremental runs and
//! keeps global results fresh on an interval.
//!
//! # Lock Ordering
//!
//! 1. **dirty_paths lock** (PipelineSharedState), acquired first
//! 2. **wakeup channel send**, acquired last
//!
//! The watcher thread only ever inserts keys. The coordinator thread is
//! the single writer: it drains keys, runs the file-local phases, and runs
//! the global phases when the interval elapses. Keys that arrive while a
//! run is in progress wait in the dirty set for the next drain.

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::graph::NodeId;
use crate::pipeline::{Pipeline, RunReport};
use crate::watcher::{FileSystemWatcher, WatcherConfig};

/// What a dirty key turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    /// Touched but content hash identical
    Unchanged,
    Deleted,
    /// Not indexed and not ingestible
    Ignored,
}

/// Outcome of one drained batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub changes: Vec<(String, ChangeKind)>,
    pub report: RunReport,
}

impl BatchSummary {
    pub fn kind_of(&self, key: &str) -> Option<ChangeKind> {
        self.changes.iter().find(|(k, _)| k == key).map(|(_, kind)| *kind)
    }
}

/// Dirty keys shared between the watcher thread and the coordinator.
///
/// `dirty_paths` is a BTreeSet, so drains are sorted and de-duplicated.
/// `wakeup_tx` has capacity 1; a full channel already means "work pending".
#[derive(Clone)]
pub struct PipelineSharedState {
    dirty_paths: Arc<Mutex<BTreeSet<String>>>,
    wakeup_tx: SyncSender<()>,
}

impl PipelineSharedState {
    fn new() -> (Self, Receiver<()>) {
        let (wakeup_tx, wakeup_rx) = std::sync::mpsc::sync_channel(1);
        (
            Self {
                dirty_paths: Arc::new(Mutex::new(BTreeSet::new())),
                wakeup_tx,
            },
            wakeup_rx,
        )
    }

    /// Queue keys and wake the coordinator.
    ///
    /// The lock is held across the send so a concurrent drain cannot empty
    /// the set between insert and wakeup.
    pub fn insert_dirty_paths(&self, paths: &[String]) -> Result<()> {
        let mut dirty_paths = self
            .dirty_paths
            .lock()
            .map_err(|e| anyhow::anyhow!("dirty_paths mutex poisoned: {}", e))?;
        dirty_paths.extend(paths.iter().cloned());
        let _ = self.wakeup_tx.try_send(());
        Ok(())
    }

    /// Snapshot and clear the dirty set.
    fn drain_dirty_paths(&self) -> Result<Vec<String>> {
        let mut paths = self
            .dirty_paths
            .lock()
            .map_err(|e| anyhow::anyhow!("dirty_paths mutex poisoned: {}", e))?;
        Ok(std::mem::take(&mut *paths).into_iter().collect())
    }
}

/// Single writer for a watched repository.
pub struct WatchCoordinator {
    pipeline: Pipeline,
    state: PipelineSharedState,
    wakeup_rx: Receiver<()>,
    /// Files changed since the last global refresh
    global_dirty: BTreeSet<String>,
    last_global: Instant,
    global_interval: Duration,
}

impl WatchCoordinator {
    pub fn new(pipeline: Pipeline) -> Self {
        let (state, wakeup_rx) = PipelineSharedState::new();
        let global_interval = pipeline.config().watch.global_interval();
        Self {
            pipeline,
            state,
            wakeup_rx,
            global_dirty: BTreeSet::new(),
            last_global: Instant::now(),
            global_interval,
        }
    }

    pub fn with_global_interval(mut self, interval: Duration) -> Self {
        self.global_interval = interval;
        self
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Handle for feeding keys from another thread.
    pub fn queue(&self) -> PipelineSharedState {
        self.state.clone()
    }

    /// Files waiting for the next global refresh.
    pub fn pending_global(&self) -> &BTreeSet<String> {
        &self.global_dirty
    }

    /// Drain queued keys and process them as one batch.
    pub fn process_pending(&mut self) -> Result<Option<BatchSummary>> {
        let keys = self.state.drain_dirty_paths()?;
        if keys.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.handle_batch(&keys)))
    }

    /// Classify `keys` against disk and graph, then run the file-local
    /// phases for them. Global phases are deferred to the interval.
    pub fn handle_batch(&mut self, keys: &[String]) -> BatchSummary {
        let snapshot = self.pipeline.snapshots().load();
        let root = self.pipeline.root();
        let mut changes: Vec<(String, ChangeKind)> = keys
            .iter()
            .map(|key| {
                let indexed = snapshot.contains_node(&NodeId::file(key));
                let abs = root.join(key);
                let ingestible = abs.is_file() && self.pipeline.filter().should_skip(&abs).is_none();
                let kind = match (ingestible, indexed) {
                    (true, false) => ChangeKind::Created,
                    (true, true) => ChangeKind::Modified,
                    (false, true) => ChangeKind::Deleted,
                    (false, false) => ChangeKind::Ignored,
                };
                (key.clone(), kind)
            })
            .collect();
        drop(snapshot);

        let report = self.pipeline.run_file_local(keys);
        for (key, kind) in changes.iter_mut() {
            if report.unchanged_files.contains(key) {
                *kind = ChangeKind::Unchanged;
            }
            match kind {
                ChangeKind::Created => tracing::info!(path = %key, "CREATE"),
                ChangeKind::Modified => tracing::info!(path = %key, "MODIFY"),
                ChangeKind::Deleted => tracing::info!(path = %key, "DELETE"),
                ChangeKind::Unchanged | ChangeKind::Ignored => tracing::debug!(path = %key, kind = ?kind, "no change"),
            }
        }

        self.global_dirty.extend(report.changed_files.iter().cloned());
        self.global_dirty.extend(report.dependent_files.iter().cloned());
        self.global_dirty.extend(report.removed_files.iter().cloned());
        BatchSummary { changes, report }
    }

    /// Run the global phases if anything changed and the interval elapsed.
    pub fn refresh_global_if_due(&mut self, now: Instant) -> Option<RunReport> {
        if self.global_dirty.is_empty() || now.duration_since(self.last_global) < self.global_interval {
            return None;
        }
        Some(self.refresh_global(now))
    }

    /// Run the global phases now if anything changed since the last run.
    pub fn flush_global(&mut self) -> Option<RunReport> {
        if self.global_dirty.is_empty() {
            return None;
        }
        Some(self.refresh_global(Instant::now()))
    }

    fn refresh_global(&mut self, now: Instant) -> RunReport {
        let dirty = std::mem::take(&mut self.global_dirty);
        tracing::info!(files = dirty.len(), "global refresh");
        self.last_global = now;
        self.pipeline.run_global()
    }

    /// Watch the root until `shutdown` is set. Returns the number of keys
    /// processed.
    ///
    /// With `scan_initial`, a full run happens first; edits made during it
    /// are buffered and flushed right after.
    pub fn run(&mut self, shutdown: Arc<AtomicBool>, scan_initial: bool) -> Result<usize> {
        let watcher_thread = {
            let mut config = WatcherConfig::from_settings(self.pipeline.root().to_path_buf(), &self.pipeline.config().watch);
            config.include = self.pipeline.config().discovery.include.clone();
            config.exclude = self.pipeline.config().discovery.exclude.clone();
            let state = self.state.clone();
            let shutdown_watch = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("meridian-watch-feed".into())
                .spawn(move || {
                    if let Err(e) = watcher_loop(config, state, shutdown_watch) {
                        tracing::error!(error = %e, "watcher thread failed");
                    }
                })?
        };

        if scan_initial {
            let report = self.pipeline.run_full();
            tracing::info!(files = report.changed_files.len(), "baseline scan done");
            self.last_global = Instant::now();
        }

        let mut total_processed = 0;
        while !shutdown.load(Ordering::SeqCst) {
            match self.wakeup_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(()) => {
                    if let Some(summary) = self.process_pending()? {
                        total_processed += summary.changes.len();
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.refresh_global_if_due(Instant::now());
        }

        // Whatever is still queued is processed before exit
        if let Some(summary) = self.process_pending()? {
            total_processed += summary.changes.len();
        }
        self.flush_global();

        let timeout = Duration::from_secs(5);
        let start = Instant::now();
        while !watcher_thread.is_finished() {
            if start.elapsed() >= timeout {
                tracing::warn!(?timeout, "watcher thread did not finish, detaching");
                return Ok(total_processed);
            }
            thread::sleep(Duration::from_millis(50));
        }
        if watcher_thread.join().is_err() {
            tracing::error!("watcher thread panicked");
        }
        Ok(total_processed)
    }
}

/// Receive batches and move their keys into the shared state.
fn watcher_loop(config: WatcherConfig, state: PipelineSharedState, shutdown: Arc<AtomicBool>) -> Result<()> {
    let watcher = FileSystemWatcher::new(config, Arc::clone(&shutdown))?;
    while !shutdown.load(Ordering::SeqCst) {
        match watcher.recv_batch_timeout(Duration::from_millis(100)) {
            Ok(Some(batch)) => state.insert_dirty_paths(&batch.paths)?,
            Ok(None) => break,
            Err(()) => continue,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_state_drains_sorted_and_deduplicated() {
        let (state, wakeup_rx) = PipelineSharedState::new();
        state
            .insert_dirty_paths(&["src/b.py".to_string(), "src/a.py".to_string()])
            .unwrap();
        state.insert_dirty_paths(&["src/a.py".to_string()]).unwrap();

        // Two inserts, one pending wakeup
        assert!(wakeup_rx.try_recv().is_ok());
        assert!(wakeup_rx.try_recv().is_err());

        assert_eq!(state.drain_dirty_paths().unwrap(), vec!["src/a.py", "src/b.py"]);
        assert!(state.drain_dirty_paths().unwrap().is_empty());
    }
}
