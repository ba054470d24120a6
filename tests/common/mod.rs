//! Shared fixtures for integration tests.
//!
//! `OutlineParser` reads a small indentation-based outline instead of a
//! real language, so tests can write fixture files whose records are
//! obvious from their text:
//!
//! ```text
//! from util import helper as h
//! import models
//! @route("/")
//! export def main(a, b)
//!   call h
//!   uses Config parameter
//! class Derived(Base)
//!   implements Runner
//!   def run(self)
//!     call self.save
//! interface Runner
//!   def run(self)
//! ```
//!
//! A line containing `!syntax-error` makes the whole file fail to parse.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use meridian::config::EngineConfig;
use meridian::graph::{Edge, EdgeType, KnowledgeGraph, NodeId, Span};
use meridian::ingest::{
    CallRecord, HeritageKind, HeritageRecord, ImportRecord, ImportedName, Language, ParseFailure, ParsedFile,
    SourceParser, SymbolKind, SymbolRecord, TypeRefRecord, TypeRole,
};
use meridian::pipeline::Pipeline;
use meridian::vcs::{Commit, VcsError, VersionControl};

#[derive(Debug, Default)]
pub struct OutlineParser;

struct Open {
    indent: usize,
    qualified: String,
    kind: SymbolKind,
    record: usize,
}

impl SourceParser for OutlineParser {
    fn parse(&self, path: &str, language: Language, source: &str) -> Result<ParsedFile, ParseFailure> {
        let mut parsed = ParsedFile::new(path, language);
        let mut stack: Vec<Open> = Vec::new();
        let mut markers: Vec<String> = Vec::new();
        let lines: Vec<&str> = source.lines().collect();

        for (i, raw) in lines.iter().enumerate() {
            let line_no = i as u32 + 1;
            if raw.contains("!syntax-error") {
                return Err(ParseFailure::new(format!("unexpected token at line {}", line_no)));
            }
            let text = raw.trim();
            if text.is_empty() || text.starts_with('#') {
                continue;
            }
            let indent = raw.len() - raw.trim_start().len();
            while stack.last().map(|o| o.indent >= indent).unwrap_or(false) {
                stack.pop();
            }
            // Every open block extends to this line
            for open in &stack {
                let span = &mut parsed.symbols[open.record].span;
                span.end_line = span.end_line.max(line_no);
            }

            if let Some(marker) = text.strip_prefix('@') {
                markers.push(format!("@{}", marker));
                continue;
            }

            let (exported, text) = match text.strip_prefix("export ") {
                Some(rest) => (true, rest),
                None => (false, text),
            };
            let mut words = text.splitn(2, ' ');
            let keyword = words.next().unwrap_or_default();
            let rest = words.next().unwrap_or_default().trim();
            let enclosing = stack.last();

            match keyword {
                "def" | "class" | "interface" => {
                    let name_end = rest.find('(').unwrap_or(rest.len());
                    let name = rest[..name_end].trim();
                    let owner = enclosing.filter(|o| matches!(o.kind, SymbolKind::Class | SymbolKind::Interface));
                    let kind = match (keyword, owner) {
                        ("def", Some(_)) => SymbolKind::Method,
                        ("def", None) => SymbolKind::Function,
                        ("class", _) => SymbolKind::Class,
                        _ => SymbolKind::Interface,
                    };
                    let span = Span::new(line_no, line_no);
                    let mut record = match owner {
                        Some(o) if kind == SymbolKind::Method => SymbolRecord::method(&o.qualified, name, span),
                        _ => SymbolRecord::new(kind, name, span),
                    };
                    if keyword == "def" && rest.contains('(') {
                        record = record.with_signature(&format!("def {}", rest));
                    }
                    if keyword == "class" && rest.contains('(') {
                        let parents = rest[name_end + 1..].trim_end_matches(')');
                        for parent in parents.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                            parsed.heritage.push(HeritageRecord {
                                class: record.qualified_name.clone(),
                                parent: parent.to_string(),
                                kind: HeritageKind::Extends,
                            });
                        }
                    }
                    record.markers = std::mem::take(&mut markers);
                    record.exported = exported;
                    stack.push(Open {
                        indent,
                        qualified: record.qualified_name.clone(),
                        kind,
                        record: parsed.symbols.len(),
                    });
                    parsed.symbols.push(record);
                }
                "call" => {
                    let caller = enclosing.map(|o| o.qualified.clone()).unwrap_or_default();
                    let mut call = CallRecord::new(&caller, rest);
                    call.line = line_no;
                    parsed.calls.push(call);
                }
                "implements" => {
                    if let Some(class) = enclosing {
                        parsed.heritage.push(HeritageRecord {
                            class: class.qualified.clone(),
                            parent: rest.to_string(),
                            kind: HeritageKind::Implements,
                        });
                    }
                }
                "uses" => {
                    let mut parts = rest.split_whitespace();
                    let type_name = parts.next().unwrap_or_default().to_string();
                    let role = match parts.next() {
                        Some("parameter") => TypeRole::Parameter,
                        Some("return") => TypeRole::Return,
                        _ => TypeRole::Variable,
                    };
                    if let Some(symbol) = enclosing {
                        parsed.type_refs.push(TypeRefRecord {
                            symbol: symbol.qualified.clone(),
                            type_name,
                            role,
                        });
                    }
                }
                "import" => {
                    let mut record = match rest.split_once(" as ") {
                        Some((module, alias)) => {
                            let mut r = ImportRecord::module(module.trim());
                            r.alias = Some(alias.trim().to_string());
                            r
                        }
                        None => ImportRecord::module(rest),
                    };
                    record.line = line_no;
                    parsed.imports.push(record);
                }
                "from" => {
                    let Some((module, names)) = rest.split_once(" import ") else {
                        return Err(ParseFailure::new(format!("bad import at line {}", line_no)));
                    };
                    let mut record = ImportRecord::module(module.trim());
                    record.names = names
                        .split(',')
                        .map(str::trim)
                        .filter(|n| !n.is_empty())
                        .map(|n| match n.split_once(" as ") {
                            Some((name, alias)) => ImportedName {
                                name: name.trim().to_string(),
                                alias: Some(alias.trim().to_string()),
                            },
                            None => ImportedName {
                                name: n.to_string(),
                                alias: None,
                            },
                        })
                        .collect();
                    record.line = line_no;
                    parsed.imports.push(record);
                }
                _ => {}
            }
        }
        Ok(parsed)
    }
}

/// Version control that serves a fixed commit list and fakes worktrees by
/// copying prepared directories.
#[derive(Default)]
pub struct FakeVcs {
    pub commits: Vec<Commit>,
    /// ref -> directory whose contents become the worktree
    pub trees: Vec<(String, PathBuf)>,
    pub removed: Arc<Mutex<Vec<PathBuf>>>,
}

impl FakeVcs {
    pub fn with_commits(commits: Vec<Commit>) -> Self {
        Self {
            commits,
            ..Default::default()
        }
    }
}

impl VersionControl for FakeVcs {
    fn log(&self, _since: DateTime<Utc>, paths: &[String]) -> Result<Vec<Commit>, VcsError> {
        if paths.is_empty() {
            return Ok(self.commits.clone());
        }
        Ok(self
            .commits
            .iter()
            .filter(|c| c.files.iter().any(|f| paths.contains(f)))
            .cloned()
            .collect())
    }

    fn create_worktree(&self, git_ref: &str, dest: &Path) -> Result<(), VcsError> {
        let git_ref = meridian::validation::validate_ref(git_ref)?;
        let Some((_, src)) = self.trees.iter().find(|(r, _)| r == git_ref) else {
            return Err(VcsError::Failed {
                command: "git worktree".into(),
                status: 128,
                stderr: format!("invalid reference: {}", git_ref),
            });
        };
        copy_tree(src, dest)?;
        Ok(())
    }

    fn remove_worktree(&self, dest: &Path) -> Result<(), VcsError> {
        if let Ok(mut removed) = self.removed.lock() {
            removed.push(dest.to_path_buf());
        }
        let _ = fs::remove_dir_all(dest);
        Ok(())
    }
}

fn copy_tree(src: &Path, dest: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in walkdir::WalkDir::new(src).into_iter().filter_map(Result::ok) {
        let Ok(rel) = entry.path().strip_prefix(src) else { continue };
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

pub fn commit(id: &str, files: &[&str]) -> Commit {
    Commit {
        id: id.to_string(),
        files: files.iter().map(|f| f.to_string()).collect(),
    }
}

/// A throwaway repository on disk.
pub struct TestRepo {
    pub dir: TempDir,
}

impl TestRepo {
    pub fn new(files: &[(&str, &str)]) -> Self {
        let _ = meridian::logging::init_tracing("warn");
        let dir = TempDir::new().unwrap();
        let repo = Self { dir };
        for (path, contents) in files {
            repo.write(path, contents);
        }
        repo
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, path: &str, contents: &str) {
        let full = self.dir.path().join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(full, contents).unwrap();
    }

    pub fn remove(&self, path: &str) {
        fs::remove_file(self.dir.path().join(path)).unwrap();
    }

    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(self.root(), EngineConfig::default(), Arc::new(OutlineParser)).unwrap()
    }
}

/// Current published graph of `pipeline`.
pub fn graph_of(pipeline: &Pipeline) -> KnowledgeGraph {
    pipeline.snapshots().working_copy()
}

pub fn calls_edge<'g>(graph: &'g KnowledgeGraph, from: &str, to: &str) -> Option<&'g Edge> {
    graph
        .outgoing(&NodeId::from_raw(from))
        .find(|e| e.edge_type == EdgeType::Calls && e.target.as_str() == to)
}
