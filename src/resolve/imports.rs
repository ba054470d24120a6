//! Module path resolution for import statements.
//!
//! Handles:
//! - relative forms: Python leading dots, JS/TS `./` and `../`
//! - Rust prefixes: `crate::`, `self::`, `super::`
//! - absolute dotted, `::` or `/` separated module paths, matched by suffix
//!
//! Package index files (`__init__.py`, `index.ts`, `mod.rs`, `lib.rs`) stand
//! for their directory.

use ahash::AHashMap;
use std::collections::BTreeSet;

use crate::graph::identity::{dir_of, strip_extension};
use crate::graph::{KnowledgeGraph, Label};

use super::rank_paths;

/// Stems that make a file stand for its directory.
const PACKAGE_INDEX_STEMS: &[&str] = &["__init__", "index", "mod", "lib"];

/// Module path of a source file: its key without extension, with a
/// trailing package index stem removed.
///
/// `src/app/__init__.py` is `src/app`; `src/app/auth.py` is `src/app/auth`.
pub fn module_path(path: &str) -> &str {
    let stem = strip_extension(path);
    let last = stem.rsplit('/').next().unwrap_or(stem);
    if PACKAGE_INDEX_STEMS.contains(&last) {
        dir_of(stem)
    } else {
        stem
    }
}

/// Last component of a file's module path; the key it is indexed under.
pub fn module_key(path: &str) -> &str {
    let module = module_path(path);
    module.rsplit('/').next().unwrap_or(module)
}

/// Whether `path` is a package index file.
pub fn is_package_index(path: &str) -> bool {
    let stem = strip_extension(path);
    let last = stem.rsplit('/').next().unwrap_or(stem);
    PACKAGE_INDEX_STEMS.contains(&last)
}

/// Where an import statement points, before looking at the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleSpec {
    /// Exact module path relative to the repository root
    Exact(String),
    /// Module path known only up to an unknown source root
    Suffix(String),
}

impl ModuleSpec {
    /// Last path component, the lookup key in [`ModuleIndex`].
    pub fn key(&self) -> &str {
        let path = match self {
            ModuleSpec::Exact(p) | ModuleSpec::Suffix(p) => p.as_str(),
        };
        path.rsplit('/').next().unwrap_or(path)
    }
}

/// Turn module text as written in `from_path` into a [`ModuleSpec`].
pub fn module_spec(module: &str, from_path: &str) -> Option<ModuleSpec> {
    let module = module.trim();
    if module.is_empty() {
        return None;
    }

    // Python: `.models`, `..core.db`
    if module.starts_with('.') && !module.starts_with("./") && !module.starts_with("../") {
        let dots = module.chars().take_while(|c| *c == '.').count();
        let mut base = dir_of(from_path).to_string();
        for _ in 1..dots {
            base = dir_of(&base).to_string();
        }
        let rest = module[dots..].replace('.', "/");
        return Some(ModuleSpec::Exact(join(&base, &rest)));
    }

    // JS/TS: `./util`, `../lib/http`
    if module.starts_with("./") || module.starts_with("../") {
        let joined = join(dir_of(from_path), module);
        let normalized = normalize(&joined)?;
        return Some(ModuleSpec::Exact(strip_known_extension(&normalized).to_string()));
    }

    // Rust: `crate::db`, `self::parser`, `super::util`
    let parts: Vec<&str> = module.split("::").collect();
    if parts.len() > 1 || matches!(parts[0], "crate" | "self" | "super") {
        match parts[0] {
            "crate" => {
                let rest = parts[1..].join("/");
                if rest.is_empty() {
                    return None;
                }
                return Some(ModuleSpec::Suffix(rest));
            }
            "self" | "super" => {
                let mut base = rust_module_dir(from_path);
                let mut idx = 0;
                while idx < parts.len() && matches!(parts[idx], "self" | "super") {
                    if parts[idx] == "super" {
                        base = dir_of(&base).to_string();
                    }
                    idx += 1;
                }
                return Some(ModuleSpec::Exact(join(&base, &parts[idx..].join("/"))));
            }
            _ => return Some(ModuleSpec::Suffix(parts.join("/"))),
        }
    }

    let normalized = module.trim_start_matches('@').replace(['.', '/'], "/");
    Some(ModuleSpec::Suffix(normalized))
}

/// Directory that `self::` names for a Rust source file.
fn rust_module_dir(from_path: &str) -> String {
    if is_package_index(from_path) || strip_extension(from_path).ends_with("/main") {
        dir_of(from_path).to_string()
    } else {
        strip_extension(from_path).to_string()
    }
}

fn join(base: &str, rest: &str) -> String {
    match (base.is_empty(), rest.is_empty()) {
        (true, _) => rest.to_string(),
        (false, true) => base.to_string(),
        (false, false) => format!("{}/{}", base, rest),
    }
}

/// Resolve `.` and `..` components. `None` if the path escapes the root.
fn normalize(path: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }
    Some(parts.join("/"))
}

fn strip_known_extension(path: &str) -> &str {
    for ext in [".ts", ".tsx", ".js", ".jsx", ".mjs", ".cjs", ".py", ".rs"] {
        if let Some(stripped) = path.strip_suffix(ext) {
            return stripped;
        }
    }
    path
}

/// Index of module paths to file keys, keyed by the module's last component.
#[derive(Debug, Default)]
pub struct ModuleIndex {
    by_key: AHashMap<String, BTreeSet<String>>,
}

impl ModuleIndex {
    /// Index every File node in `graph`.
    pub fn build(graph: &KnowledgeGraph) -> Self {
        let mut index = Self::default();
        for node in graph.nodes_with_label(Label::File) {
            index.insert(&node.file_path);
        }
        index
    }

    pub fn insert(&mut self, path: &str) {
        self.by_key
            .entry(module_key(path).to_string())
            .or_default()
            .insert(path.to_string());
    }

    pub fn len(&self) -> usize {
        self.by_key.values().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// File that `module`, imported from `from_path`, refers to.
    ///
    /// Exact specs prefer a direct module file over a package index.
    /// Suffix specs rank candidates the same way ambiguous calls are ranked.
    pub fn resolve(&self, module: &str, from_path: &str) -> Option<String> {
        let spec = module_spec(module, from_path)?;
        let candidates = self.by_key.get(spec.key())?;
        match &spec {
            ModuleSpec::Exact(target) => candidates
                .iter()
                .filter(|p| module_path(p) == target)
                .min_by_key(|p| (is_package_index(p), p.as_str()))
                .cloned(),
            ModuleSpec::Suffix(suffix) => {
                let with_slash = format!("/{}", suffix);
                let matching: Vec<&str> = candidates
                    .iter()
                    .filter(|p| p.as_str() != from_path)
                    .filter(|p| {
                        let m = module_path(p);
                        m == suffix || m.ends_with(&with_slash)
                    })
                    .map(String::as_str)
                    .collect();
                rank_paths(from_path, matching).map(str::to_string)
            }
        }
    }
}
