//! Five-pass dead-code classification.
//!
//! Pass 1 marks every Function, Method and Class without an incoming CALLS
//! edge from another symbol. Passes 2 to 5 only ever clear marks:
//!
//! 2. exemptions (matcher registry, exported symbols, package re-exports)
//! 3. overrides of a live ancestor method (same name and arity, to a fixpoint)
//! 4. methods of a class implementing an interface that declares the name
//! 5. methods declared directly on an interface
//!
//! The verdict is recomputed in full on every run and written to every
//! candidate as `is_dead` / `dead_reason`.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::matchers::{MatcherKind, MatcherRegistry};
use crate::graph::query::{ancestors, methods_of, owner_of, targets};
use crate::graph::{EdgeType, KnowledgeGraph, Label, Node, NodeId};
use crate::ingest::{is_test_path, Language};
use crate::resolve::imports::is_package_index;
use crate::resolve::ImportBindings;

/// Labels the analyzer classifies.
pub const CANDIDATE_LABELS: [Label; 3] = [Label::Function, Label::Method, Label::Class];

/// Why a symbol is (or is not) dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadReason {
    /// No caller anywhere in the indexed code
    Unreferenced,
    /// Has at least one indexed caller
    Called,
    EntryPoint,
    Exported,
    Constructor,
    Test,
    Lifecycle,
    Marker,
    ReExport,
    Override,
    ProtocolConformance,
    ProtocolStub,
}

impl DeadReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadReason::Unreferenced => "unreferenced",
            DeadReason::Called => "called",
            DeadReason::EntryPoint => "entry_point",
            DeadReason::Exported => "exported",
            DeadReason::Constructor => "constructor",
            DeadReason::Test => "test",
            DeadReason::Lifecycle => "lifecycle",
            DeadReason::Marker => "marker",
            DeadReason::ReExport => "re_export",
            DeadReason::Override => "override",
            DeadReason::ProtocolConformance => "protocol_conformance",
            DeadReason::ProtocolStub => "protocol_stub",
        }
    }

    pub fn is_dead(&self) -> bool {
        *self == DeadReason::Unreferenced
    }

    fn from_matcher(kind: MatcherKind) -> Self {
        match kind {
            MatcherKind::EntryPoint => DeadReason::EntryPoint,
            MatcherKind::Constructor => DeadReason::Constructor,
            MatcherKind::Test => DeadReason::Test,
            MatcherKind::Lifecycle => DeadReason::Lifecycle,
            MatcherKind::Marker => DeadReason::Marker,
        }
    }
}

/// Verdicts for every candidate plus the dead set after each pass.
#[derive(Debug, Clone, Default)]
pub struct DeadCodeReport {
    pub verdicts: BTreeMap<NodeId, DeadReason>,
    /// `pass_dead_sets[i]` is the dead set after pass `i + 1`
    pub pass_dead_sets: Vec<BTreeSet<NodeId>>,
}

impl DeadCodeReport {
    pub fn is_dead(&self, id: &NodeId) -> bool {
        self.verdicts.get(id).map(DeadReason::is_dead).unwrap_or(false)
    }

    pub fn reason(&self, id: &NodeId) -> Option<DeadReason> {
        self.verdicts.get(id).copied()
    }

    pub fn dead(&self) -> impl Iterator<Item = &NodeId> {
        self.verdicts
            .iter()
            .filter(|(_, r)| r.is_dead())
            .map(|(id, _)| id)
    }

    pub fn dead_count(&self) -> usize {
        self.dead().count()
    }

    fn snapshot_pass(&mut self) {
        self.pass_dead_sets.push(self.dead().cloned().collect());
    }

    fn clear(&mut self, id: &NodeId, reason: DeadReason) -> bool {
        match self.verdicts.get_mut(id) {
            Some(current) if current.is_dead() => {
                *current = reason;
                true
            }
            _ => false,
        }
    }
}

/// Exemption order for pass 2.
const MATCHER_ORDER: [MatcherKind; 5] = [
    MatcherKind::EntryPoint,
    MatcherKind::Constructor,
    MatcherKind::Test,
    MatcherKind::Lifecycle,
    MatcherKind::Marker,
];

pub struct DeadCodeAnalyzer<'a> {
    matchers: &'a MatcherRegistry,
}

impl<'a> DeadCodeAnalyzer<'a> {
    pub fn new(matchers: &'a MatcherRegistry) -> Self {
        Self { matchers }
    }

    /// Classify every candidate in `graph`. Pure; see [`apply`](Self::apply).
    pub fn analyze(&self, graph: &KnowledgeGraph) -> DeadCodeReport {
        let mut report = DeadCodeReport::default();
        self.mark_unreferenced(graph, &mut report);
        report.snapshot_pass();
        self.clear_exempt(graph, &mut report);
        report.snapshot_pass();
        self.clear_overrides(graph, &mut report);
        report.snapshot_pass();
        self.clear_conformance(graph, &mut report);
        report.snapshot_pass();
        self.clear_interface_stubs(graph, &mut report);
        report.snapshot_pass();
        report
    }

    /// Write `is_dead` and `dead_reason` on every candidate. Returns the
    /// number of dead symbols.
    pub fn apply(report: &DeadCodeReport, graph: &mut KnowledgeGraph) -> usize {
        for (id, reason) in &report.verdicts {
            graph.set_node_property(id, "is_dead", serde_json::json!(reason.is_dead()));
            graph.set_node_property(id, "dead_reason", serde_json::json!(reason.as_str()));
        }
        report.dead_count()
    }

    fn mark_unreferenced(&self, graph: &KnowledgeGraph, report: &mut DeadCodeReport) {
        for label in CANDIDATE_LABELS {
            for node in graph.nodes_with_label(label) {
                let called = graph
                    .incoming(&node.id)
                    .any(|e| e.edge_type == EdgeType::Calls && e.source != node.id);
                let reason = if called {
                    DeadReason::Called
                } else {
                    DeadReason::Unreferenced
                };
                report.verdicts.insert(node.id.clone(), reason);
            }
        }
    }

    fn clear_exempt(&self, graph: &KnowledgeGraph, report: &mut DeadCodeReport) {
        let reexported = reexported_symbols(graph);
        let dead: Vec<NodeId> = report.dead().cloned().collect();
        for id in dead {
            let Some(node) = graph.node(&id) else {
                continue;
            };
            if let Some(reason) = self.exemption(graph, node, &reexported) {
                report.clear(&id, reason);
            }
        }
    }

    fn exemption(
        &self,
        graph: &KnowledgeGraph,
        node: &Node,
        reexported: &BTreeSet<NodeId>,
    ) -> Option<DeadReason> {
        let language = file_language(graph, &node.file_path);
        if self.matchers.matches(MatcherKind::EntryPoint, node, language) {
            return Some(DeadReason::EntryPoint);
        }
        if node.prop_bool("exported") {
            return Some(DeadReason::Exported);
        }
        if let Some(kind) = self.matchers.first_match(&MATCHER_ORDER[1..], node, language) {
            return Some(DeadReason::from_matcher(kind));
        }
        if is_test_path(&node.file_path) {
            return Some(DeadReason::Test);
        }
        if reexported.contains(&node.id) {
            return Some(DeadReason::ReExport);
        }
        None
    }

    fn clear_overrides(&self, graph: &KnowledgeGraph, report: &mut DeadCodeReport) {
        loop {
            let mut changed = false;
            let dead: Vec<NodeId> = report.dead().cloned().collect();
            for id in dead {
                let Some(method) = graph.node(&id).filter(|n| n.label == Label::Method) else {
                    continue;
                };
                let Some(owner) = owner_of(graph, method) else {
                    continue;
                };
                let arity = method.prop_u64("arity");
                let overrides_live = ancestors(graph, &owner.id).into_iter().any(|ancestor| {
                    methods_of(graph, ancestor).into_iter().any(|base| {
                        base.name == method.name
                            && base.prop_u64("arity") == arity
                            && !report.is_dead(&base.id)
                    })
                });
                if overrides_live && report.clear(&id, DeadReason::Override) {
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    fn clear_conformance(&self, graph: &KnowledgeGraph, report: &mut DeadCodeReport) {
        let dead: Vec<NodeId> = report.dead().cloned().collect();
        for id in dead {
            let Some(method) = graph.node(&id).filter(|n| n.label == Label::Method) else {
                continue;
            };
            let Some(owner) = owner_of(graph, method) else {
                continue;
            };
            let mut classes = vec![owner];
            classes.extend(ancestors(graph, &owner.id));
            let declared = classes.iter().any(|class| {
                interfaces_of(graph, &class.id).into_iter().any(|iface| {
                    methods_of(graph, iface)
                        .into_iter()
                        .any(|m| m.name == method.name)
                })
            });
            if declared {
                report.clear(&id, DeadReason::ProtocolConformance);
            }
        }
    }

    fn clear_interface_stubs(&self, graph: &KnowledgeGraph, report: &mut DeadCodeReport) {
        let dead: Vec<NodeId> = report.dead().cloned().collect();
        for id in dead {
            let on_interface = graph
                .node(&id)
                .filter(|n| n.label == Label::Method)
                .and_then(|m| owner_of(graph, m))
                .map(|owner| owner.label == Label::Interface)
                .unwrap_or(false);
            if on_interface {
                report.clear(&id, DeadReason::ProtocolStub);
            }
        }
    }
}

/// Interfaces `class` implements, including interfaces those extend.
fn interfaces_of<'g>(graph: &'g KnowledgeGraph, class: &NodeId) -> Vec<&'g Node> {
    let mut out: Vec<&Node> = Vec::new();
    let mut seen = BTreeSet::new();
    for iface in targets(graph, class, EdgeType::Implements) {
        if seen.insert(iface.id.clone()) {
            out.push(iface);
        }
        for parent in ancestors(graph, &iface.id) {
            if seen.insert(parent.id.clone()) {
                out.push(parent);
            }
        }
    }
    out
}

fn file_language(graph: &KnowledgeGraph, path: &str) -> Option<Language> {
    graph
        .node(&NodeId::file(path))
        .and_then(|f| f.prop_str("language"))
        .and_then(Language::parse)
}

/// Symbols a package index file (`__init__.py`, `index.ts`, `mod.rs`,
/// `lib.rs`) imports by name, which makes them part of the package surface.
fn reexported_symbols(graph: &KnowledgeGraph) -> BTreeSet<NodeId> {
    let mut out = BTreeSet::new();
    for edge in graph.edges_of_type(EdgeType::Imports) {
        let Some(source) = graph.node(&edge.source) else {
            continue;
        };
        if !is_package_index(&source.file_path) {
            continue;
        }
        let Some(target) = graph.node(&edge.target) else {
            continue;
        };
        let bindings = ImportBindings::from_edge(edge);
        for node in graph.nodes_in_file(&target.file_path) {
            if node.label.is_symbol() && bindings.names.contains(&node.name) {
                out.insert(node.id.clone());
            }
        }
    }
    out
}
