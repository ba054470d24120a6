//! Source discovery and reading.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::diagnostics::{RunDiagnostic, SkipReason};
use crate::error::EngineError;
use crate::graph::filter::FileFilter;
use crate::graph::identity::relative_key;

/// SHA-256 of file contents, hex encoded.
pub fn content_hash(source: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source);
    hex::encode(hasher.finalize())
}

/// Every ingestible file under the filter's root, as sorted relative keys.
///
/// Files rejected by ignore rules or globs are reported as skipped;
/// unsupported extensions and directories are dropped silently.
pub fn discover(filter: &FileFilter) -> (Vec<String>, Vec<RunDiagnostic>) {
    let root = filter.root();
    let mut keys = Vec::new();
    let mut diagnostics = Vec::new();

    for entry in walkdir::WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let Some(key) = relative_key(root, path) else {
            continue;
        };
        match filter.should_skip(path) {
            None => keys.push(key),
            Some(SkipReason::UnsupportedLanguage) | Some(SkipReason::NotAFile) => {}
            Some(SkipReason::IgnoredInternal) => {}
            Some(reason) => diagnostics.push(RunDiagnostic::skipped(key, reason)),
        }
    }

    keys.sort();
    (keys, diagnostics)
}

/// A file read from disk.
#[derive(Debug, Clone)]
pub struct SourceText {
    pub text: String,
    pub hash: String,
}

/// Read `key` under `root`. Invalid UTF-8 is replaced, not rejected.
pub fn read_source(root: &Path, key: &str) -> Result<SourceText, EngineError> {
    let path: PathBuf = root.join(key);
    let bytes = std::fs::read(&path).map_err(|source| EngineError::Io {
        path: key.to_string(),
        source,
    })?;
    Ok(SourceText {
        hash: content_hash(&bytes),
        text: String::from_utf8_lossy(&bytes).into_owned(),
    })
}
