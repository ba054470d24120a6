//! Indexing pipeline.
//!
//! A run discovers (or is handed) changed files, parses them in parallel,
//! applies the file-local phases to a private working copy, publishes it as
//! one snapshot, syncs storage, and optionally runs the global phases.
//!
//! Full and incremental runs converge: re-parsing a changed file together
//! with every file whose resolution could depend on it yields the same
//! graph a full rebuild would.

pub mod file_local;
pub mod global;
pub mod scan;

pub use file_local::{apply_batch, BatchOutcome, ParsedSource};
pub use global::{run_global_phases, run_phase, GlobalContext};
pub use scan::{content_hash, discover, read_source};

use anyhow::Result;
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::analysis::{BfsFlowDetector, CommunityDetector, ConnectedComponents, MatcherRegistry, ProcessDetector};
use crate::config::EngineConfig;
use crate::diagnostics::{DiagnosticStage, RunDiagnostic, SkipReason};
use crate::error::EngineError;
use crate::graph::query::methods_of;
use crate::graph::{EdgeOwner, EdgeType, FileFilter, KnowledgeGraph, Label, NodeId, SnapshotCell, SnapshotReader};
use crate::ingest::{detect_language, SourceParser, SymbolKind};
use crate::resolve::imports::is_package_index;
use crate::storage::{StorageSync, SyncReport};
use crate::validation::validate_file_key;
use crate::vcs::VersionControl;

use file_local::{contribution, exposed_names, MODULE_REF_PREFIX};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Full,
    Incremental,
    Global,
}

/// Whether an incremental run also refreshes the global phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalMode {
    Immediate,
    /// Leave global results stale; the caller refreshes them later
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PhaseStatus {
    Succeeded,
    Skipped { reason: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseReport {
    pub phase: DiagnosticStage,
    pub status: PhaseStatus,
    pub duration_ms: u64,
    /// Nodes or edges the phase wrote
    pub items: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Partial { skipped_files: Vec<String>, warnings: Vec<String> },
    Failure { reason: String },
}

/// Summary of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub changed_files: Vec<String>,
    pub dependent_files: Vec<String>,
    pub removed_files: Vec<String>,
    pub unchanged_files: Vec<String>,
    pub phases: Vec<PhaseReport>,
    pub diagnostics: Vec<RunDiagnostic>,
    pub storage: Option<SyncReport>,
    /// Snapshot generation after the run
    pub generation: u64,
    pub outcome: RunOutcome,
}

impl RunReport {
    fn new(mode: RunMode) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            mode,
            started_at: Utc::now(),
            changed_files: Vec::new(),
            dependent_files: Vec::new(),
            removed_files: Vec::new(),
            unchanged_files: Vec::new(),
            phases: Vec::new(),
            diagnostics: Vec::new(),
            storage: None,
            generation: 0,
            outcome: RunOutcome::Success,
        }
    }

    pub fn phase(&self, phase: DiagnosticStage) -> Option<&PhaseReport> {
        self.phases.iter().find(|p| p.phase == phase)
    }

    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Success
    }

    /// Derive the outcome from diagnostics, phases and storage. A fatal
    /// outcome already recorded wins.
    fn settle(&mut self) {
        if matches!(self.outcome, RunOutcome::Failure { .. }) {
            return;
        }
        self.diagnostics.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

        let skipped_files: Vec<String> = self
            .diagnostics
            .iter()
            .filter(|d| d.is_error())
            .map(|d| d.path().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let mut warnings: Vec<String> = self
            .phases
            .iter()
            .filter_map(|p| match &p.status {
                PhaseStatus::Failed { reason } => Some(reason.clone()),
                _ => None,
            })
            .collect();
        if let Some(storage) = &self.storage {
            for (unit, failures) in &storage.units_aborted {
                warnings.push(format!("storage unit {} rolled back after {} failures", unit, failures));
            }
        }

        self.outcome = if skipped_files.is_empty() && warnings.is_empty() {
            RunOutcome::Success
        } else {
            RunOutcome::Partial { skipped_files, warnings }
        };
    }
}

/// Drives parsing, resolution, snapshot publication and storage sync.
pub struct Pipeline {
    root: PathBuf,
    config: EngineConfig,
    parser: Arc<dyn SourceParser>,
    filter: FileFilter,
    cell: Arc<SnapshotCell>,
    matchers: MatcherRegistry,
    community: Box<dyn CommunityDetector>,
    process: Box<dyn ProcessDetector>,
    vcs: Option<Box<dyn VersionControl>>,
    storage: Option<StorageSync>,
}

impl Pipeline {
    pub fn new(root: &Path, config: EngineConfig, parser: Arc<dyn SourceParser>) -> Result<Self> {
        let filter = FileFilter::new(root, &config.discovery.include, &config.discovery.exclude)?;
        Ok(Self {
            root: filter.root().to_path_buf(),
            config,
            parser,
            filter,
            cell: SnapshotCell::empty(),
            matchers: MatcherRegistry::builtin(),
            community: Box::new(ConnectedComponents::default()),
            process: Box::new(BfsFlowDetector::default()),
            vcs: None,
            storage: None,
        })
    }

    pub fn with_vcs(mut self, vcs: Box<dyn VersionControl>) -> Self {
        self.vcs = Some(vcs);
        self
    }

    pub fn with_community_detector(mut self, detector: Box<dyn CommunityDetector>) -> Self {
        self.community = detector;
        self
    }

    pub fn with_process_detector(mut self, detector: Box<dyn ProcessDetector>) -> Self {
        self.process = detector;
        self
    }

    pub fn with_matchers(mut self, matchers: MatcherRegistry) -> Self {
        self.matchers = matchers;
        self
    }

    pub fn with_storage(mut self, storage: StorageSync) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Publish into an existing cell instead of a private one.
    pub fn with_snapshot_cell(mut self, cell: Arc<SnapshotCell>) -> Self {
        self.cell = cell;
        self
    }

    /// Canonical indexed root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn filter(&self) -> &FileFilter {
        &self.filter
    }

    pub fn snapshots(&self) -> &Arc<SnapshotCell> {
        &self.cell
    }

    pub fn reader(&self) -> SnapshotReader {
        self.cell.reader()
    }

    pub fn storage(&self) -> Option<&StorageSync> {
        self.storage.as_ref()
    }

    /// Index the whole tree from scratch.
    pub fn run_full(&self) -> RunReport {
        let mut report = RunReport::new(RunMode::Full);
        let (keys, skipped) = discover(&self.filter);
        report.diagnostics.extend(skipped);
        tracing::info!(root = %self.root.display(), files = keys.len(), "full index started");

        let parsed = self.load_all(&keys, &mut report);
        report.changed_files = parsed.iter().map(|p| p.parsed.path.clone()).collect();

        let mut graph = KnowledgeGraph::new();
        let batch = apply_batch(&mut graph, &[], &parsed);
        report.phases.extend(batch.phases);
        report.diagnostics.extend(batch.diagnostics);
        report.generation = self.cell.publish(graph);

        self.finish_global(&mut report);
        tracing::info!(
            run_id = %report.run_id,
            nodes = self.cell.load().node_count(),
            edges = self.cell.load().edge_count(),
            "full index finished"
        );
        report
    }

    /// Re-index `changed` (repository-relative keys) and the files that
    /// depend on them.
    pub fn run_incremental(&self, changed: &[String], mode: GlobalMode) -> RunReport {
        let mut report = RunReport::new(RunMode::Incremental);
        let current = self.cell.load();
        let graph = current.graph();

        let mut to_parse: Vec<String> = Vec::new();
        let mut removed: Vec<String> = Vec::new();
        let keys: BTreeSet<&str> = changed.iter().map(String::as_str).collect();

        for key in keys {
            let key = match validate_file_key(key) {
                Ok(key) => key,
                Err(e) => {
                    tracing::warn!(key, error = %e, "change ignored");
                    continue;
                }
            };
            let indexed = graph.contains_node(&NodeId::file(key));
            let abs = self.root.join(key);
            if !abs.is_file() || self.filter.should_skip(&abs).is_some() {
                if indexed {
                    removed.push(key.to_string());
                }
                continue;
            }
            to_parse.push(key.to_string());
        }

        // Hash check before parsing: touched-but-identical files are skipped
        let mut sources = Vec::with_capacity(to_parse.len());
        for key in to_parse {
            match read_source(&self.root, &key) {
                Ok(source) => {
                    let previous = graph.node(&NodeId::file(&key)).and_then(|n| n.prop_str("hash"));
                    if previous == Some(source.hash.as_str()) {
                        report.unchanged_files.push(key);
                    } else {
                        sources.push((key, source));
                    }
                }
                Err(e) => report
                    .diagnostics
                    .push(RunDiagnostic::error(key, DiagnosticStage::Read, e.code(), e.to_string())),
            }
        }

        let results: Vec<Result<ParsedSource, RunDiagnostic>> = sources
            .into_par_iter()
            .map(|(key, source)| self.parse_one(&key, &source.text, source.hash))
            .collect();
        let mut parsed = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(p) => parsed.push(p),
                Err(diagnostic) => report.diagnostics.push(diagnostic),
            }
        }

        if parsed.is_empty() && removed.is_empty() {
            report.generation = self.cell.generation();
            report.settle();
            return report;
        }

        let primary: BTreeSet<String> = parsed
            .iter()
            .map(|p| p.parsed.path.clone())
            .chain(removed.iter().cloned())
            .collect();
        let dependents: Vec<String> = dependents_of(graph, &parsed, &removed)
            .into_iter()
            .filter(|d| !primary.contains(d))
            .collect();
        report.changed_files = parsed.iter().map(|p| p.parsed.path.clone()).collect();
        report.removed_files = removed.clone();

        // Dependents are always re-parsed; their own content may be unchanged
        let reparsed = self.load_all(&dependents, &mut report);
        report.dependent_files = reparsed.iter().map(|p| p.parsed.path.clone()).collect();
        parsed.extend(reparsed);
        parsed.sort_by(|a, b| a.parsed.path.cmp(&b.parsed.path));

        let mut working = self.cell.working_copy();
        let batch = apply_batch(&mut working, &removed, &parsed);
        report.phases.extend(batch.phases);
        report.diagnostics.extend(batch.diagnostics);
        report.generation = self.cell.publish(working);
        tracing::info!(
            run_id = %report.run_id,
            changed = report.changed_files.len(),
            dependents = report.dependent_files.len(),
            removed = report.removed_files.len(),
            generation = report.generation,
            "file-local batch published"
        );

        if let Some(storage) = &self.storage {
            let mut touched: Vec<String> = parsed.iter().map(|p| p.parsed.path.clone()).collect();
            touched.extend(removed);
            let snapshot = self.cell.load();
            match storage.sync_files(snapshot.graph(), &touched) {
                Ok(sync) => report.storage = Some(sync),
                Err(e) => {
                    report.outcome = RunOutcome::Failure { reason: e.to_string() };
                    return report;
                }
            }
        }

        match mode {
            GlobalMode::Immediate => self.finish_global(&mut report),
            GlobalMode::Deferred => report.settle(),
        }
        report
    }

    /// File-local work only; global results stay stale until
    /// [`run_global`](Self::run_global).
    pub fn run_file_local(&self, changed: &[String]) -> RunReport {
        self.run_incremental(changed, GlobalMode::Deferred)
    }

    /// Recompute every global phase over the current snapshot and reload
    /// storage.
    pub fn run_global(&self) -> RunReport {
        let mut report = RunReport::new(RunMode::Global);
        self.finish_global(&mut report);
        report
    }

    fn finish_global(&self, report: &mut RunReport) {
        let ctx = GlobalContext {
            cell: &self.cell,
            matchers: &self.matchers,
            community: self.community.as_ref(),
            process: self.process.as_ref(),
            vcs: self.vcs.as_deref(),
            coupling: &self.config.coupling,
        };
        report.phases.extend(run_global_phases(&ctx));
        report.generation = self.cell.generation();

        if let Some(storage) = &self.storage {
            let snapshot = self.cell.load();
            match storage.bulk_load(snapshot.graph()) {
                Ok(sync) => match report.storage.as_mut() {
                    Some(existing) => {
                        existing.units_committed += sync.units_committed;
                        existing.units_aborted.extend(sync.units_aborted);
                        existing.tolerated_failures += sync.tolerated_failures;
                    }
                    None => report.storage = Some(sync),
                },
                Err(e) => {
                    report.outcome = RunOutcome::Failure { reason: e.to_string() };
                    return;
                }
            }
        }
        report.settle();
    }

    /// Read and parse `keys` in parallel. Failures become diagnostics and
    /// the file keeps whatever the graph already holds for it.
    fn load_all(&self, keys: &[String], report: &mut RunReport) -> Vec<ParsedSource> {
        let results: Vec<Result<ParsedSource, RunDiagnostic>> = keys
            .par_iter()
            .map(|key| {
                let source = read_source(&self.root, key)
                    .map_err(|e| RunDiagnostic::error(key.as_str(), DiagnosticStage::Read, e.code(), e.to_string()))?;
                self.parse_one(key, &source.text, source.hash)
            })
            .collect();

        let mut parsed = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(p) => parsed.push(p),
                Err(diagnostic) => report.diagnostics.push(diagnostic),
            }
        }
        parsed
    }

    fn parse_one(&self, key: &str, text: &str, hash: String) -> Result<ParsedSource, RunDiagnostic> {
        let language = detect_language(Path::new(key))
            .ok_or_else(|| RunDiagnostic::skipped(key, SkipReason::UnsupportedLanguage))?;
        match self.parser.parse(key, language, text) {
            Ok(mut parsed) => {
                parsed.path = key.to_string();
                parsed.language = language;
                Ok(ParsedSource { parsed, hash })
            }
            Err(failure) => {
                let err = EngineError::Parse {
                    path: key.to_string(),
                    message: failure.message,
                };
                tracing::warn!(path = key, code = err.code(), "parse failed, previous data kept");
                Err(RunDiagnostic::error(key, DiagnosticStage::Parse, err.code(), err.to_string()))
            }
        }
    }
}

/// Files outside the batch whose file-local edges could change when the
/// batch is applied to `graph`.
///
/// - files with file-local edges into nodes the batch removes
/// - files importing a batch file
/// - files with an open reference matching a name or module the batch
///   defines now or defined before
/// - files defining methods named like a batch interface's methods
/// - importers of any of the above that are package index files
pub fn dependents_of(graph: &KnowledgeGraph, parsed: &[ParsedSource], removed: &[String]) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    let mut names: BTreeSet<String> = BTreeSet::new();
    let mut interface_methods: BTreeSet<String> = BTreeSet::new();

    let batch = parsed
        .iter()
        .map(|p| (p.parsed.path.as_str(), Some(p)))
        .chain(removed.iter().map(|r| (r.as_str(), None)));

    for (path, source) in batch {
        let old_ids: BTreeSet<NodeId> = graph.nodes_in_file(path).map(|n| n.id.clone()).collect();
        let new_ids: BTreeSet<NodeId> = source
            .map(|s| {
                let c = contribution(s);
                std::iter::once(c.file_node.id)
                    .chain(c.symbols.into_iter().map(|n| n.id))
                    .collect()
            })
            .unwrap_or_default();

        for gone in old_ids.difference(&new_ids) {
            for edge in graph.incoming(gone) {
                if edge.edge_type.owner() != EdgeOwner::FileLocal {
                    continue;
                }
                if let Some(source_node) = graph.node(&edge.source) {
                    out.insert(source_node.file_path.clone());
                }
            }
        }

        out.extend(importers(graph, path));

        let old_names = graph
            .nodes_in_file(path)
            .filter(|n| n.label.is_symbol())
            .map(|n| n.name.as_str());
        let new_names = source
            .into_iter()
            .flat_map(|s| s.parsed.symbols.iter().map(|r| r.name.as_str()));
        names.extend(exposed_names(path, old_names.chain(new_names)));

        for interface in graph.nodes_in_file(path).filter(|n| n.label == Label::Interface) {
            interface_methods.extend(methods_of(graph, interface).into_iter().map(|m| m.name.clone()));
        }
        if let Some(s) = source {
            let interfaces: BTreeSet<&str> = s
                .parsed
                .symbols
                .iter()
                .filter(|r| r.kind == SymbolKind::Interface)
                .map(|r| r.qualified_name.as_str())
                .collect();
            interface_methods.extend(
                s.parsed
                    .symbols
                    .iter()
                    .filter(|r| r.owner.as_deref().map(|o| interfaces.contains(o)).unwrap_or(false))
                    .map(|r| r.name.clone()),
            );
        }
    }

    for file in graph.nodes_with_label(Label::File) {
        let refs = file.prop_strings("open_refs");
        if refs.iter().any(|r| names.contains(r)) {
            out.insert(file.file_path.clone());
        }
    }

    for method in &interface_methods {
        for node in graph.nodes_named(method).filter(|n| n.label == Label::Method) {
            out.insert(node.file_path.clone());
        }
    }

    let index_files: Vec<String> = out.iter().filter(|p| is_package_index(p)).cloned().collect();
    for index in index_files {
        out.extend(importers(graph, &index));
    }

    for path in removed {
        out.remove(path);
    }
    tracing::debug!(
        dependents = out.len(),
        names = names.iter().filter(|n| !n.starts_with(MODULE_REF_PREFIX)).count(),
        "dependents computed"
    );
    out
}

fn importers(graph: &KnowledgeGraph, path: &str) -> Vec<String> {
    graph
        .incoming(&NodeId::file(path))
        .filter(|e| e.edge_type == EdgeType::Imports)
        .filter_map(|e| graph.node(&e.source))
        .map(|n| n.file_path.clone())
        .collect()
}
