//! Deterministic node identity and repository-relative path keys.
//!
//! Ids are readable strings: `<label>:<path>:<qualified name>` for symbols,
//! `file:<path>` and `folder:<path>` for structure nodes. An unchanged file
//! re-parsed any number of times yields the same ids.

use camino::{Utf8Component, Utf8Path};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use super::schema::Label;

/// Unique node identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn symbol(label: Label, path: &str, qualified_name: &str) -> Self {
        match label {
            Label::File => Self::file(path),
            Label::Folder => Self::folder(path),
            _ => Self(format!("{}:{}:{}", label.as_str(), path, qualified_name)),
        }
    }

    pub fn file(path: &str) -> Self {
        Self(format!("file:{}", path))
    }

    pub fn folder(path: &str) -> Self {
        Self(format!("folder:{}", path))
    }

    pub fn community(index: usize) -> Self {
        Self(format!("community:{}", index))
    }

    pub fn process(entry: &NodeId) -> Self {
        Self(format!("process:{}", entry.0))
    }

    /// Wrap an id received from outside (query input, storage rows).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Label encoded in the id prefix.
    pub fn label(&self) -> Option<Label> {
        self.0.split(':').next().and_then(Label::from_prefix)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Repository-relative, `/`-separated key for `path`.
///
/// Returns `None` for paths outside `root`, non-UTF-8 paths, or paths that
/// would need a `..` component.
pub fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = match path.strip_prefix(root) {
        Ok(rel) => rel.to_path_buf(),
        Err(_) => {
            let canonical_root = std::fs::canonicalize(root).ok()?;
            let canonical = std::fs::canonicalize(path).ok();
            match canonical {
                Some(p) => p.strip_prefix(&canonical_root).ok()?.to_path_buf(),
                None => path.strip_prefix(&canonical_root).ok()?.to_path_buf(),
            }
        }
    };
    let utf8 = Utf8Path::from_path(&rel)?;
    let mut parts = Vec::new();
    for component in utf8.components() {
        match component {
            Utf8Component::Normal(part) => parts.push(part),
            Utf8Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Directory part of a relative key; empty for root-level files.
pub fn dir_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// All ancestor directories of a relative key, outermost first.
///
/// `src/app/auth.py` yields `["src", "src/app"]`.
pub fn ancestor_dirs(path: &str) -> Vec<String> {
    let dir = dir_of(path);
    if dir.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut acc = String::new();
    for part in dir.split('/') {
        if !acc.is_empty() {
            acc.push('/');
        }
        acc.push_str(part);
        out.push(acc.clone());
    }
    out
}

/// Number of leading directory components two relative keys share.
pub fn shared_dir_prefix(a: &str, b: &str) -> usize {
    let da = dir_of(a);
    let db = dir_of(b);
    if da.is_empty() || db.is_empty() {
        return 0;
    }
    da.split('/')
        .zip(db.split('/'))
        .take_while(|(x, y)| x == y)
        .count()
}

/// Directory depth of a relative key (`a.py` is 0, `src/a.py` is 1).
pub fn dir_depth(path: &str) -> usize {
    path.matches('/').count()
}

/// Relative key with its final extension removed.
pub fn strip_extension(path: &str) -> &str {
    let file_start = path.rfind('/').map(|i| i + 1).unwrap_or(0);
    match path[file_start..].rfind('.') {
        Some(dot) if dot > 0 => &path[..file_start + dot],
        _ => path,
    }
}
