//! Filesystem watcher with debounced batch events.
//!
//! All events inside one debounce window are collected, de-duplicated,
//! turned into repository-relative keys, sorted, and emitted as a single
//! batch. Batches carry only keys: whether a key was created, modified or
//! deleted is decided later against the filesystem and the graph, so the
//! outcome does not depend on event order.
//!
//! Deleted files are kept. Their paths no longer canonicalize, so they are
//! keyed lexically against the (canonical) root and checked by name only.

use anyhow::Result;
use notify::RecursiveMode;
use notify_debouncer_mini::new_debouncer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::WatchSettings;
use crate::graph::filter::FileFilter;
use crate::graph::identity::relative_key;
use crate::ingest::detect_language;
use crate::validation::validate_file_key;

/// Deterministic batch of dirty file keys, in lexicographic order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatcherBatch {
    pub paths: Vec<String>,
}

impl WatcherBatch {
    fn from_set(paths: BTreeSet<String>) -> Self {
        Self {
            paths: paths.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self { paths: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Directory watched recursively; keys are relative to it
    pub root_path: PathBuf,
    pub debounce_ms: u64,
    /// Apply .gitignore and include/exclude globs to events
    pub gitignore_aware: bool,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl WatcherConfig {
    pub fn from_settings(root_path: PathBuf, settings: &WatchSettings) -> Self {
        Self {
            root_path,
            debounce_ms: settings.debounce_ms,
            gitignore_aware: settings.gitignore_aware,
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self::from_settings(PathBuf::from("."), &WatchSettings::default())
    }
}

/// Watcher that emits debounced batches of dirty keys.
pub struct FileSystemWatcher {
    watcher_thread: Option<thread::JoinHandle<()>>,
    batch_receiver: Receiver<WatcherBatch>,
    shutdown: Arc<AtomicBool>,
}

impl FileSystemWatcher {
    /// Start watching `config.root_path`. The watcher thread runs until
    /// `shutdown` is set.
    pub fn new(config: WatcherConfig, shutdown: Arc<AtomicBool>) -> Result<Self> {
        let (batch_tx, batch_rx) = mpsc::channel();
        let thread_shutdown = Arc::clone(&shutdown);
        let thread = thread::Builder::new()
            .name("meridian-watcher".into())
            .spawn(move || {
                if let Err(e) = run_watcher(batch_tx, config, thread_shutdown) {
                    tracing::error!(error = %e, "watcher stopped");
                }
            })?;

        Ok(Self {
            watcher_thread: Some(thread),
            batch_receiver: batch_rx,
            shutdown,
        })
    }

    /// Block until a batch arrives. `None` once the watcher has stopped.
    pub fn recv_batch(&self) -> Option<WatcherBatch> {
        self.batch_receiver.recv().ok()
    }

    pub fn try_recv_batch(&self) -> Option<WatcherBatch> {
        self.batch_receiver.try_recv().ok()
    }

    /// - `Ok(Some(batch))` when a batch arrived
    /// - `Ok(None)` when the watcher thread has terminated
    /// - `Err(())` when the timeout elapsed
    pub fn recv_batch_timeout(&self, timeout: Duration) -> Result<Option<WatcherBatch>, ()> {
        match self.batch_receiver.recv_timeout(timeout) {
            Ok(batch) => Ok(Some(batch)),
            Err(RecvTimeoutError::Timeout) => Err(()),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }
}

impl Drop for FileSystemWatcher {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.watcher_thread.take() {
            // The thread polls the flag; don't hang a drop on it
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}

fn run_watcher(tx: Sender<WatcherBatch>, config: WatcherConfig, shutdown: Arc<AtomicBool>) -> Result<()> {
    let debounce = Duration::from_millis(config.debounce_ms);
    let root = std::fs::canonicalize(&config.root_path).unwrap_or_else(|_| config.root_path.clone());

    // Built once; .gitignore is not re-read per event
    let filter = if config.gitignore_aware {
        match FileFilter::new(&root, &config.include, &config.exclude) {
            Ok(f) => Some(f),
            Err(e) => {
                tracing::warn!(error = %e, "ignore rules unavailable, watching unfiltered");
                None
            }
        }
    } else {
        None
    };

    let callback_root = root.clone();
    let mut debouncer = new_debouncer(debounce, move |result: notify_debouncer_mini::DebounceEventResult| {
        match result {
            Ok(events) => {
                let keys = extract_dirty_keys(events.iter().map(|e| e.path.as_path()), &callback_root, filter.as_ref());
                if !keys.is_empty() {
                    tracing::debug!(paths = keys.len(), "watch batch");
                    let _ = tx.send(WatcherBatch::from_set(keys));
                }
            }
            Err(error) => tracing::warn!(error = %error, "watch error"),
        }
    })?;

    debouncer.watcher().watch(&root, RecursiveMode::Recursive)?;
    tracing::info!(root = %root.display(), debounce_ms = config.debounce_ms, "watching");

    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(50));
    }
    Ok(())
}

/// Turn raw event paths into ingestible repository keys.
///
/// - directories are dropped
/// - paths outside `root` or with malformed keys are dropped
/// - existing files go through the full filter; deleted files through the
///   name-only filter so their removal still reaches the graph
/// - without a filter, only the language check applies
pub fn extract_dirty_keys<'a, I>(paths: I, root: &Path, filter: Option<&FileFilter>) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a Path>,
{
    let mut keys = BTreeSet::new();
    for path in paths {
        if path.is_dir() {
            continue;
        }
        let Some(key) = relative_key(root, path) else {
            tracing::warn!(path = %path.display(), "event outside watched root rejected");
            continue;
        };
        if let Err(e) = validate_file_key(&key) {
            tracing::warn!(error = %e, "event rejected");
            continue;
        }

        let skipped = match filter {
            Some(f) if path.exists() => f.should_skip(path).is_some(),
            Some(f) => f.should_skip_name(path).is_some(),
            None => detect_language(path).is_none(),
        };
        if !skipped {
            keys.insert(key);
        }
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_extract_keeps_deleted_files_and_sorts() {
        let dir = TempDir::new().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        fs::create_dir_all(root.join("src")).unwrap();
        fs::write(root.join("src/b.py"), "x = 1").unwrap();
        fs::write(root.join("src/a.py"), "x = 1").unwrap();

        let filter = FileFilter::new(&root, &[], &[]).unwrap();
        let deleted = root.join("src/gone.py");
        let events = [root.join("src/b.py"), root.join("src/a.py"), deleted, root.join("src/a.py")];
        let keys = extract_dirty_keys(events.iter().map(PathBuf::as_path), &root, Some(&filter));
        assert_eq!(
            keys.into_iter().collect::<Vec<_>>(),
            vec!["src/a.py", "src/b.py", "src/gone.py"]
        );
    }

    #[test]
    fn test_extract_filters_ignored_and_unsupported() {
        let dir = TempDir::new().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        fs::create_dir_all(root.join("target/debug")).unwrap();
        fs::create_dir_all(root.join("generated")).unwrap();
        fs::write(root.join(".gitignore"), "generated/\n").unwrap();
        fs::write(root.join("target/debug/gen.rs"), "").unwrap();
        fs::write(root.join("generated/bundle.js"), "").unwrap();
        fs::write(root.join("notes.txt"), "").unwrap();
        fs::write(root.join("main.rs"), "fn main() {}").unwrap();

        let filter = FileFilter::new(&root, &[], &[]).unwrap();
        let events = [
            root.join("target/debug/gen.rs"),
            root.join("generated/bundle.js"),
            root.join("notes.txt"),
            root.join("main.rs"),
            root.join("generated"),
            PathBuf::from("/elsewhere/x.py"),
        ];
        let keys = extract_dirty_keys(events.iter().map(PathBuf::as_path), &root, Some(&filter));
        assert_eq!(keys.into_iter().collect::<Vec<_>>(), vec!["main.rs"]);
    }

    #[test]
    fn test_extract_without_filter_checks_language_only() {
        let root = PathBuf::from("/repo");
        let events = [PathBuf::from("/repo/dist/app.ts"), PathBuf::from("/repo/README.md")];
        let keys = extract_dirty_keys(events.iter().map(PathBuf::as_path), &root, None);
        assert_eq!(keys.into_iter().collect::<Vec<_>>(), vec!["dist/app.ts"]);
    }
}
