//! Read-side interface over published snapshots.
//!
//! Every call loads the current snapshot once and answers from it, so a
//! result is always consistent with a single generation even while the
//! watch loop keeps publishing.

pub mod diff;
pub mod raw;

pub use diff::{parse_unified_diff, ChangeImpact, ChangedFile};
pub use raw::{RawQueryResult, WRITE_KEYWORDS};

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::config::QuerySettings;
use crate::error::EngineError;
use crate::graph::query::{
    callees_with_confidence, callers_with_confidence, coupled_files, methods_of, owner_of, targets,
    traverse_upstream, TraversalOptions,
};
use crate::graph::{Direction, Edge, EdgeType, KnowledgeGraph, Label, Node, NodeId, SnapshotReader};
use crate::storage::{Params, StorageBackend, StorageError};

/// Traversal depth is never allowed past this, whatever the configuration.
pub const MAX_TRAVERSE_DEPTH: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("symbol {0:?} not found")]
    NotFound(String),

    #[error("query rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<QueryError> for EngineError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::NotFound(symbol) => EngineError::SymbolNotFound(symbol),
            QueryError::Rejected(reason) => EngineError::QueryRejected(reason),
            QueryError::Storage(e) => e.into(),
        }
    }
}

/// Display marker for a CALLS confidence.
pub fn confidence_tag(confidence: f64) -> &'static str {
    if confidence >= 0.9 {
        ""
    } else if confidence >= 0.5 {
        " (~)"
    } else {
        " (?)"
    }
}

/// Section title for a blast-radius depth.
pub fn depth_title(depth: usize) -> &'static str {
    match depth {
        1 => "Direct callers (will break)",
        2 => "Indirect (may break)",
        _ => "Transitive (review)",
    }
}

/// How a search hit matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    Prefix,
    Substring,
}

/// Compact description of a node in results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSummary {
    pub id: String,
    pub label: Label,
    pub name: String,
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
}

impl From<&Node> for NodeSummary {
    fn from(node: &Node) -> Self {
        Self {
            id: node.id.to_string(),
            label: node.label,
            name: node.name.clone(),
            file_path: node.file_path.clone(),
            start_line: node.span.start_line,
            end_line: node.span.end_line,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub node: NodeSummary,
    pub match_kind: MatchKind,
    /// Execution flow this symbol takes part in, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<String>,
}

/// Search hits grouped under their execution flow.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GroupedSearch {
    pub query: String,
    /// Process name and its hits, in order of first appearance
    pub groups: Vec<(String, Vec<SearchHit>)>,
    pub other: Vec<SearchHit>,
}

impl GroupedSearch {
    pub fn new(query: &str, hits: Vec<SearchHit>) -> Self {
        let mut grouped = Self {
            query: query.to_string(),
            ..Default::default()
        };
        for hit in hits {
            let Some(process) = hit.process.clone() else {
                grouped.other.push(hit);
                continue;
            };
            match grouped.groups.iter_mut().find(|(name, _)| *name == process) {
                Some((_, hits)) => hits.push(hit),
                None => grouped.groups.push((process, vec![hit])),
            }
        }
        grouped
    }

    pub fn total(&self) -> usize {
        self.groups.iter().map(|(_, hits)| hits.len()).sum::<usize>() + self.other.len()
    }

    pub fn render(&self) -> String {
        if self.total() == 0 {
            return format!("No results found for '{}'.", self.query);
        }
        let mut out = String::new();
        let mut counter = 1;
        let mut section = |out: &mut String, hits: &[SearchHit]| {
            for hit in hits {
                let _ = writeln!(out, "{}. {} ({}) -- {}", counter, hit.node.name, hit.node.label, hit.node.file_path);
                counter += 1;
            }
            out.push('\n');
        };
        for (process, hits) in &self.groups {
            let _ = writeln!(out, "=== {} ===", process);
            section(&mut out, hits.as_slice());
        }
        if !self.other.is_empty() {
            if !self.groups.is_empty() {
                out.push_str("=== Other results ===\n");
            }
            section(&mut out, self.other.as_slice());
        }
        out
    }
}

/// A neighbor reached over a CALLS edge.
#[derive(Debug, Clone, Serialize)]
pub struct CallNeighbor {
    #[serde(flatten)]
    pub node: NodeSummary,
    pub confidence: f64,
}

/// Everything known about one symbol.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolContext {
    pub symbol: NodeSummary,
    pub signature: Option<String>,
    pub dead_reason: Option<String>,
    pub owner: Option<NodeSummary>,
    pub methods: Vec<NodeSummary>,
    pub callers: Vec<CallNeighbor>,
    pub callees: Vec<CallNeighbor>,
    /// Types this symbol references, with their role
    pub type_refs: Vec<(NodeSummary, String)>,
    pub extends: Vec<NodeSummary>,
    pub implements: Vec<NodeSummary>,
    pub community: Option<String>,
    /// Process name and this symbol's step in it
    pub processes: Vec<(String, u64)>,
    /// Files that change together with this symbol's file
    pub coupled_files: Vec<(String, f64)>,
}

impl SymbolContext {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let s = &self.symbol;
        let _ = writeln!(out, "Symbol: {} ({})", s.name, s.label);
        let _ = writeln!(out, "File: {}:{}-{}", s.file_path, s.start_line, s.end_line);
        if let Some(signature) = &self.signature {
            let _ = writeln!(out, "Signature: {}", signature);
        }
        if let Some(reason) = &self.dead_reason {
            let _ = writeln!(out, "Status: DEAD CODE ({})", reason);
        }
        if let Some(owner) = &self.owner {
            let _ = writeln!(out, "Member of: {} ({})", owner.name, owner.label);
        }
        render_calls(&mut out, "Callers", &self.callers);
        render_calls(&mut out, "Callees", &self.callees);
        if !self.type_refs.is_empty() {
            let _ = writeln!(out, "\nType references ({}):", self.type_refs.len());
            for (t, role) in &self.type_refs {
                let _ = writeln!(out, "  -> {}  {} [{}]", t.name, t.file_path, role);
            }
        }
        for (title, nodes) in [("Extends", &self.extends), ("Implements", &self.implements)] {
            if !nodes.is_empty() {
                let names: Vec<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
                let _ = writeln!(out, "{}: {}", title, names.join(", "));
            }
        }
        if let Some(community) = &self.community {
            let _ = writeln!(out, "Community: {}", community);
        }
        for (process, step) in &self.processes {
            let _ = writeln!(out, "Process: {} (step {})", process, step);
        }
        if !self.coupled_files.is_empty() {
            let _ = writeln!(out, "\nChanges together with:");
            for (path, strength) in &self.coupled_files {
                let _ = writeln!(out, "  {} ({:.2})", path, strength);
            }
        }
        out
    }
}

fn render_calls(out: &mut String, title: &str, calls: &[CallNeighbor]) {
    if calls.is_empty() {
        return;
    }
    let _ = writeln!(out, "\n{} ({}):", title, calls.len());
    for c in calls {
        let _ = writeln!(
            out,
            "  -> {}  {}:{}{}",
            c.node.name,
            c.node.file_path,
            c.node.start_line,
            confidence_tag(c.confidence)
        );
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImpactEntry {
    #[serde(flatten)]
    pub node: NodeSummary,
    /// Confidence of the direct CALLS edge, for depth-1 callers
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImpactGroup {
    pub depth: usize,
    pub title: &'static str,
    pub entries: Vec<ImpactEntry>,
}

/// Upstream blast radius of a symbol, grouped by distance.
#[derive(Debug, Clone, Serialize)]
pub struct ImpactReport {
    pub symbol: NodeSummary,
    /// Depth actually used after clamping
    pub depth: usize,
    pub groups: Vec<ImpactGroup>,
}

impl ImpactReport {
    pub fn total(&self) -> usize {
        self.groups.iter().map(|g| g.entries.len()).sum()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Impact analysis for: {} ({})", self.symbol.name, self.symbol.label);
        let _ = writeln!(out, "Depth: {} | Total: {} symbols", self.depth, self.total());
        let mut counter = 1;
        for group in &self.groups {
            let _ = writeln!(out, "\nDepth {}: {}", group.depth, group.title);
            for entry in &group.entries {
                let tag = entry
                    .confidence
                    .map(|c| format!("  (confidence: {:.2})", c))
                    .unwrap_or_default();
                let _ = writeln!(
                    out,
                    "  {}. {} ({}) -- {}:{}{}",
                    counter, entry.node.name, entry.node.label, entry.node.file_path, entry.node.start_line, tag
                );
                counter += 1;
            }
        }
        out
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadSymbol {
    #[serde(flatten)]
    pub node: NodeSummary,
    pub reason: String,
}

/// Dead symbols grouped by file, files and symbols in line order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeadCodeListing {
    pub files: BTreeMap<String, Vec<DeadSymbol>>,
}

impl DeadCodeListing {
    pub fn total(&self) -> usize {
        self.files.values().map(Vec::len).sum()
    }

    pub fn render(&self) -> String {
        if self.files.is_empty() {
            return "No dead code detected.".to_string();
        }
        let mut out = format!("Dead code ({} symbols):\n", self.total());
        for (path, symbols) in &self.files {
            let _ = writeln!(out, "\n  {}", path);
            for s in symbols {
                let _ = writeln!(out, "    - {} ({}) line {}", s.node.name, s.node.label, s.node.start_line);
            }
        }
        out
    }
}

/// Query entry point. Cheap to clone; holds only a snapshot reader.
#[derive(Clone)]
pub struct QueryService {
    reader: SnapshotReader,
    settings: QuerySettings,
}

impl QueryService {
    pub fn new(reader: SnapshotReader, settings: QuerySettings) -> Self {
        Self { reader, settings }
    }

    pub fn settings(&self) -> &QuerySettings {
        &self.settings
    }

    /// Generation of the snapshot the next call will read.
    pub fn generation(&self) -> u64 {
        self.reader.generation()
    }

    /// Symbols matching `text`: exact names first, then case-insensitive
    /// prefixes, then substrings. `limit` is capped by the configuration.
    pub fn search_symbols(&self, text: &str, limit: usize) -> Vec<SearchHit> {
        let snapshot = self.reader.snapshot();
        let limit = limit.clamp(1, self.settings.max_search_limit.max(1));
        search(snapshot.graph(), text, limit)
    }

    /// [`search_symbols`](Self::search_symbols) with the hits grouped by
    /// execution flow.
    pub fn search_grouped(&self, text: &str, limit: usize) -> GroupedSearch {
        GroupedSearch::new(text.trim(), self.search_symbols(text, limit))
    }

    /// 360° view of one symbol. `symbol` may be a node id or a name.
    pub fn context(&self, symbol: &str) -> Result<SymbolContext, QueryError> {
        let snapshot = self.reader.snapshot();
        let graph = snapshot.graph();
        let node = resolve_symbol(graph, symbol)?;

        let neighbor = |(n, confidence): (&Node, f64)| CallNeighbor {
            node: NodeSummary::from(n),
            confidence,
        };
        let type_refs = graph
            .outgoing(&node.id)
            .filter(|e| e.edge_type == EdgeType::UsesType)
            .filter_map(|e| {
                let role = e.properties.get("role").and_then(|v| v.as_str()).unwrap_or("variable");
                graph.node(&e.target).map(|t| (NodeSummary::from(t), role.to_string()))
            })
            .collect();
        let community = targets(graph, &node.id, EdgeType::MemberOf)
            .first()
            .map(|c| c.name.clone());
        let processes = graph
            .neighbors(&node.id, &[EdgeType::StepInProcess], Direction::Outgoing)
            .into_iter()
            .map(|(e, p)| (p.name.clone(), e.prop_u64("step").unwrap_or(0)))
            .collect();
        let dead_reason = node
            .prop_bool("is_dead")
            .then(|| node.prop_str("dead_reason").unwrap_or("unreferenced").to_string());
        let methods = if node.label.is_type() {
            methods_of(graph, node).into_iter().map(NodeSummary::from).collect()
        } else {
            Vec::new()
        };

        Ok(SymbolContext {
            symbol: NodeSummary::from(node),
            signature: node.prop_str("signature").map(str::to_string),
            dead_reason,
            owner: owner_of(graph, node).map(NodeSummary::from),
            methods,
            callers: callers_with_confidence(graph, &node.id).into_iter().map(neighbor).collect(),
            callees: callees_with_confidence(graph, &node.id).into_iter().map(neighbor).collect(),
            type_refs,
            extends: summaries(targets(graph, &node.id, EdgeType::Extends)),
            implements: summaries(targets(graph, &node.id, EdgeType::Implements)),
            community,
            processes,
            coupled_files: coupled_files(graph, &node.file_path)
                .into_iter()
                .map(|(n, strength)| (n.file_path.clone(), strength))
                .collect(),
        })
    }

    /// Everything upstream of `symbol` within `depth` hops over CALLS,
    /// USES_TYPE and COUPLED_WITH. Uncertain calls are only followed when
    /// `include_uncertain` is set.
    pub fn blast_radius(&self, symbol: &str, depth: usize, include_uncertain: bool) -> Result<ImpactReport, QueryError> {
        let snapshot = self.reader.snapshot();
        let graph = snapshot.graph();
        let start = resolve_symbol(graph, symbol)?;
        let depth = self.clamp_depth(depth);
        let options = TraversalOptions {
            max_depth: depth,
            min_confidence: if include_uncertain { 0.0 } else { 1.0 },
            follow_type_refs: true,
            follow_coupling: true,
        };

        let direct: BTreeMap<&NodeId, f64> = graph
            .incoming(&start.id)
            .filter(|e| e.edge_type == EdgeType::Calls)
            .map(|e| (&e.source, e.confidence()))
            .collect();

        let mut groups: Vec<ImpactGroup> = Vec::new();
        for (id, d) in traverse_upstream(graph, &start.id, &options) {
            let Some(node) = graph.node(&id) else { continue };
            let entry = ImpactEntry {
                node: NodeSummary::from(node),
                confidence: if d == 1 { direct.get(&id).copied() } else { None },
            };
            match groups.last_mut() {
                Some(group) if group.depth == d => group.entries.push(entry),
                _ => groups.push(ImpactGroup {
                    depth: d,
                    title: depth_title(d),
                    entries: vec![entry],
                }),
            }
        }

        Ok(ImpactReport {
            symbol: NodeSummary::from(start),
            depth,
            groups,
        })
    }

    /// Caller-supplied depth bounded to `[1, max]`. Zero means the default.
    pub fn clamp_depth(&self, depth: usize) -> usize {
        let max = self.settings.max_depth.clamp(1, MAX_TRAVERSE_DEPTH);
        let depth = if depth == 0 { self.settings.default_depth } else { depth };
        depth.clamp(1, max)
    }

    /// Symbols the last dead-code pass flagged.
    pub fn dead_code(&self) -> DeadCodeListing {
        let snapshot = self.reader.snapshot();
        let mut listing = DeadCodeListing::default();
        for node in snapshot.graph().nodes().filter(|n| n.prop_bool("is_dead")) {
            listing.files.entry(node.file_path.clone()).or_default().push(DeadSymbol {
                node: NodeSummary::from(node),
                reason: node.prop_str("dead_reason").unwrap_or("unreferenced").to_string(),
            });
        }
        for symbols in listing.files.values_mut() {
            symbols.sort_by(|a, b| {
                a.node
                    .start_line
                    .cmp(&b.node.start_line)
                    .then_with(|| a.node.id.cmp(&b.node.id))
            });
        }
        listing
    }

    /// Map a unified diff to the indexed symbols whose lines it touches.
    pub fn detect_changes(&self, diff_text: &str) -> ChangeImpact {
        let snapshot = self.reader.snapshot();
        diff::map_changes(snapshot.graph(), &parse_unified_diff(diff_text))
    }

    /// Read-only passthrough to the storage backend.
    pub fn raw_query(
        &self,
        backend: &dyn StorageBackend,
        statement: &str,
        params: &Params,
    ) -> Result<RawQueryResult, QueryError> {
        raw::execute(backend, statement, params, &self.settings)
    }
}

fn summaries(nodes: Vec<&Node>) -> Vec<NodeSummary> {
    nodes.into_iter().map(NodeSummary::from).collect()
}

fn search(graph: &KnowledgeGraph, text: &str, limit: usize) -> Vec<SearchHit> {
    let needle = text.trim();
    if needle.is_empty() {
        return Vec::new();
    }
    let lowered = needle.to_lowercase();
    let mut hits: Vec<(MatchKind, &Node)> = graph
        .nodes()
        .filter(|n| n.label.is_symbol())
        .filter_map(|n| {
            let name = n.name.to_lowercase();
            let kind = if n.name == needle {
                MatchKind::Exact
            } else if name.starts_with(&lowered) {
                MatchKind::Prefix
            } else if name.contains(&lowered) || n.qualified_name.to_lowercase().contains(&lowered) {
                MatchKind::Substring
            } else {
                return None;
            };
            Some((kind, n))
        })
        .collect();
    hits.sort_by(|a, b| {
        a.0.cmp(&b.0)
            .then_with(|| a.1.name.len().cmp(&b.1.name.len()))
            .then_with(|| a.1.id.cmp(&b.1.id))
    });
    hits.into_iter()
        .take(limit)
        .map(|(match_kind, n)| SearchHit {
            node: NodeSummary::from(n),
            match_kind,
            process: primary_process(graph, &n.id),
        })
        .collect()
}

/// The flow `id` appears earliest in; ties go to the process name.
fn primary_process(graph: &KnowledgeGraph, id: &NodeId) -> Option<String> {
    graph
        .neighbors(id, &[EdgeType::StepInProcess], Direction::Outgoing)
        .into_iter()
        .min_by(|(a, pa), (b, pb)| {
            let step = |e: &Edge| e.prop_u64("step").unwrap_or(u64::MAX);
            step(a).cmp(&step(b)).then_with(|| pa.name.cmp(&pb.name))
        })
        .map(|(_, process)| process.name.clone())
}

/// A node id, or the best name match. Exact names win; among several,
/// non-test files first, then id order.
fn resolve_symbol<'g>(graph: &'g KnowledgeGraph, symbol: &str) -> Result<&'g Node, QueryError> {
    if let Some(node) = graph.node(&NodeId::from_raw(symbol)) {
        return Ok(node);
    }
    let is_test = |n: &Node| {
        graph
            .node(&NodeId::file(&n.file_path))
            .map(|f| f.prop_bool("is_test"))
            .unwrap_or(false)
    };
    let mut exact: Vec<&Node> = graph.nodes_named(symbol).filter(|n| n.label.is_symbol()).collect();
    exact.sort_by(|a, b| is_test(a).cmp(&is_test(b)).then_with(|| a.id.cmp(&b.id)));
    if let Some(node) = exact.first().copied() {
        return Ok(node);
    }
    search(graph, symbol, 1)
        .first()
        .and_then(|hit| graph.node(&NodeId::from_raw(hit.node.id.clone())))
        .ok_or_else(|| QueryError::NotFound(symbol.to_string()))
}
