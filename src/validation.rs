//! Validation of untrusted inputs: filesystem paths from watch events,
//! version-control refs, and file keys arriving through queries.
//!
//! Paths must resolve inside the repository root. Refs must match a strict
//! allow-list so they can never be read as a command-line option.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::error::EngineError;

#[derive(Debug, thiserror::Error)]
pub enum PathValidationError {
    /// Path cannot be canonicalized (doesn't exist or permission denied)
    #[error("cannot canonicalize path: {0}")]
    CannotCanonicalize(String),

    /// Resolved path escapes the repository root
    #[error("path escapes repository root: {0} (root: {1})")]
    OutsideRoot(String, String),

    /// Relative key with `..`, a leading `/` or an empty component
    #[error("malformed file key: {0:?}")]
    MalformedKey(String),
}

/// Canonicalize `path` and check it lies under `root`.
pub fn validate_path_within_root(path: &Path, root: &Path) -> Result<PathBuf, PathValidationError> {
    let canonical_path = std::fs::canonicalize(path)
        .map_err(|_| PathValidationError::CannotCanonicalize(path.to_string_lossy().to_string()))?;
    let canonical_root = std::fs::canonicalize(root)
        .map_err(|_| PathValidationError::CannotCanonicalize(root.to_string_lossy().to_string()))?;

    if !canonical_path.starts_with(&canonical_root) {
        return Err(PathValidationError::OutsideRoot(
            canonical_path.to_string_lossy().to_string(),
            canonical_root.to_string_lossy().to_string(),
        ));
    }
    Ok(canonical_path)
}

/// Check a repository-relative key supplied by a caller (`src/app/auth.py`).
pub fn validate_file_key(key: &str) -> Result<&str, PathValidationError> {
    let malformed = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.contains('\0')
        || key.split('/').any(|part| part.is_empty() || part == "..");
    if malformed {
        return Err(PathValidationError::MalformedKey(key.to_string()));
    }
    Ok(key)
}

fn ref_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._/\-]{0,199}$").ok())
        .as_ref()
}

/// Check a branch, tag or commit ref before it reaches a subprocess.
///
/// Accepted: alphanumerics, `_`, `.`, `/`, `-`, at most 200 characters,
/// not starting with `-`, and without `..` or a `.lock` suffix.
pub fn validate_ref(git_ref: &str) -> Result<&str, EngineError> {
    let ok = !git_ref.starts_with('-')
        && ref_pattern().map(|re| re.is_match(git_ref)).unwrap_or(false)
        && !git_ref.contains("..")
        && !git_ref.contains("//")
        && !git_ref.ends_with('/')
        && !git_ref.ends_with(".lock");
    if ok {
        Ok(git_ref)
    } else {
        Err(EngineError::InvalidRef(git_ref.to_string()))
    }
}
