//! File-local phases: structure, imports, calls, heritage, types.
//!
//! Every phase reads the whole working graph but writes only edges that
//! originate from the batch's own files. Records are consumed here and
//! dropped; only nodes, edges and the per-file `open_refs` survive.

use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use super::{PhaseReport, PhaseStatus};
use crate::diagnostics::{DiagnosticStage, RunDiagnostic};
use crate::error::EngineError;
use crate::graph::query::methods_of;
use crate::graph::{Edge, EdgeType, FileContribution, KnowledgeGraph, Label, Node, NodeId};
use crate::ingest::{is_test_path, HeritageKind, ParsedFile, SymbolKind, SymbolRecord};
use crate::resolve::{module_key, module_spec, CallResolver, CallSite, ImportBindings, ModuleIndex, ModuleSpec};

/// A parsed file and the hash of the content it was parsed from.
#[derive(Debug, Clone)]
pub struct ParsedSource {
    pub parsed: ParsedFile,
    pub hash: String,
}

/// Prefix marking an unresolved module (rather than symbol) in `open_refs`.
pub const MODULE_REF_PREFIX: &str = "mod:";

/// Node id a symbol record will get.
pub fn symbol_id(path: &str, record: &SymbolRecord) -> NodeId {
    NodeId::symbol(record.kind.label(), path, &record.qualified_name)
}

/// Id of the class or interface declaring a method record.
fn owner_id(parsed: &ParsedFile, owner: &str) -> NodeId {
    let label = parsed
        .symbols
        .iter()
        .find(|s| s.qualified_name == owner && matches!(s.kind, SymbolKind::Class | SymbolKind::Interface | SymbolKind::Enum))
        .map(|s| s.kind.label())
        .unwrap_or(Label::Class);
    NodeId::symbol(label, &parsed.path, owner)
}

/// File node, symbol nodes and DEFINES/EXPORTS edges for one file.
pub fn contribution(source: &ParsedSource) -> FileContribution {
    let parsed = &source.parsed;
    let path = parsed.path.as_str();
    let file_node = Node::file(path)
        .with_property("hash", source.hash.clone())
        .with_property("language", parsed.language.as_str())
        .with_property("is_test", is_test_path(path))
        .with_property("open_refs", json!([]));

    let mut symbols = Vec::with_capacity(parsed.symbols.len());
    let mut edges = Vec::new();
    for record in &parsed.symbols {
        let mut node = Node::new(
            record.kind.label(),
            path,
            record.qualified_name.as_str(),
            record.name.as_str(),
            record.span,
        )
        .with_property("markers", json!(record.markers))
        .with_property("exported", record.exported);
        if let Some(signature) = &record.signature {
            node = node.with_property("signature", signature.clone());
        }
        if let Some(arity) = record.arity() {
            node = node.with_property("arity", arity as u64);
        }
        if let Some(owner) = &record.owner {
            node = node.with_property("owner", owner_id(parsed, owner).to_string());
        }

        edges.push(Edge::new(file_node.id.clone(), EdgeType::Defines, node.id.clone()));
        if record.exported {
            edges.push(Edge::new(file_node.id.clone(), EdgeType::Exports, node.id.clone()));
        }
        symbols.push(node);
    }

    FileContribution {
        path: path.to_string(),
        file_node,
        symbols,
        edges,
    }
}

/// Result of one file-local batch.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub phases: Vec<PhaseReport>,
    pub diagnostics: Vec<RunDiagnostic>,
}

/// Names each batch file referenced without an exact resolution.
type OpenRefs = BTreeMap<String, BTreeSet<String>>;

/// Apply one file-local batch to `graph`: remove `removed`, then run every
/// file-local phase over `files`.
pub fn apply_batch(graph: &mut KnowledgeGraph, removed: &[String], files: &[ParsedSource]) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();
    let mut open: OpenRefs = files
        .iter()
        .map(|f| (f.parsed.path.clone(), BTreeSet::new()))
        .collect();

    timed(&mut outcome, DiagnosticStage::Structure, |out| {
        structure(graph, removed, files, &mut out.diagnostics)
    });
    timed(&mut outcome, DiagnosticStage::Imports, |_| done(imports(graph, files, &mut open)));
    timed(&mut outcome, DiagnosticStage::Calls, |_| done(calls(graph, files, &mut open)));
    timed(&mut outcome, DiagnosticStage::Heritage, |_| done(heritage(graph, files, &mut open)));
    timed(&mut outcome, DiagnosticStage::Types, |_| done(types(graph, files, &mut open)));

    for (path, refs) in open {
        graph.set_node_property(&NodeId::file(&path), "open_refs", json!(refs));
    }
    outcome
}

/// Items written and the phase's status.
type PhaseResult = (usize, PhaseStatus);

fn done(items: usize) -> PhaseResult {
    (items, PhaseStatus::Succeeded)
}

fn timed<F>(outcome: &mut BatchOutcome, phase: DiagnosticStage, run: F)
where
    F: FnOnce(&mut BatchOutcome) -> PhaseResult,
{
    let start = Instant::now();
    let (items, status) = run(outcome);
    tracing::debug!(phase = %phase, items, ?status, "file-local phase done");
    outcome.phases.push(PhaseReport {
        phase,
        status,
        duration_ms: start.elapsed().as_millis() as u64,
        items,
    });
}

fn structure(
    graph: &mut KnowledgeGraph,
    removed: &[String],
    files: &[ParsedSource],
    diagnostics: &mut Vec<RunDiagnostic>,
) -> PhaseResult {
    for path in removed {
        let count = graph.remove_file(path);
        tracing::debug!(path = %path, nodes = count, "file removed");
    }
    let mut nodes = 0;
    let mut conflicts = 0;
    for source in files {
        let result = graph.replace_file(contribution(source));
        nodes += source.parsed.symbols.len() + 1;
        conflicts += result.conflicts.len();
        for id in result.conflicts {
            let err = EngineError::Conflict {
                id: id.clone(),
                existing: graph.node(&NodeId::from_raw(id.as_str())).map(|n| n.label).unwrap_or(Label::File),
                incoming: NodeId::from_raw(id.as_str()).label().unwrap_or(Label::File),
            };
            diagnostics.push(RunDiagnostic::error(
                source.parsed.path.as_str(),
                DiagnosticStage::Structure,
                err.code(),
                err.to_string(),
            ));
        }
    }
    if conflicts > 0 {
        let reason = format!("{} node identity conflicts", conflicts);
        return (nodes.saturating_sub(conflicts), PhaseStatus::Failed { reason });
    }
    done(nodes)
}

fn imports(graph: &mut KnowledgeGraph, files: &[ParsedSource], open: &mut OpenRefs) -> usize {
    let index = ModuleIndex::build(graph);
    let mut edges = Vec::new();

    for source in files {
        let path = source.parsed.path.as_str();
        let refs = open.entry(path.to_string()).or_default();
        let mut by_target: BTreeMap<String, ImportBindings> = BTreeMap::new();

        for record in &source.parsed.imports {
            let spec = module_spec(&record.module, path);
            if let Some(suffix @ ModuleSpec::Suffix(_)) = &spec {
                // A closer file with the same key could appear later
                refs.insert(format!("{}{}", MODULE_REF_PREFIX, suffix.key()));
            }
            let Some(target) = index.resolve(&record.module, path) else {
                if let Some(spec) = &spec {
                    refs.insert(format!("{}{}", MODULE_REF_PREFIX, spec.key()));
                }
                for name in &record.names {
                    refs.insert(name.name.clone());
                }
                continue;
            };
            if target == path {
                continue;
            }

            let mut bindings = ImportBindings {
                module: record.module.clone(),
                ..ImportBindings::default()
            };
            for name in &record.names {
                bindings.names.insert(name.name.clone());
                if let Some(alias) = &name.alias {
                    bindings.aliases.insert(alias.clone(), name.name.clone());
                }
            }
            if record.names.is_empty() {
                match &record.alias {
                    Some(alias) => {
                        bindings.module_aliases.insert(alias.clone());
                    }
                    None => {
                        bindings.module_aliases.insert(record.module.clone());
                        let last = record
                            .module
                            .rsplit(['.', '/', ':'])
                            .next()
                            .unwrap_or(&record.module);
                        if !last.is_empty() {
                            bindings.module_aliases.insert(last.to_string());
                        }
                    }
                }
            } else if let Some(alias) = &record.alias {
                bindings.module_aliases.insert(alias.clone());
            }
            by_target.entry(target).or_default().merge(bindings);
        }

        let file_id = NodeId::file(path);
        for (target, bindings) in by_target {
            edges.push(bindings.apply(Edge::new(file_id.clone(), EdgeType::Imports, NodeId::file(&target))));
        }
    }

    upsert_all(graph, edges)
}

/// Qualified name to node id for the symbols of one parsed file.
fn local_symbols(parsed: &ParsedFile) -> BTreeMap<&str, NodeId> {
    parsed
        .symbols
        .iter()
        .map(|s| (s.qualified_name.as_str(), symbol_id(&parsed.path, s)))
        .collect()
}

fn bare_name(reference: &str) -> String {
    crate::resolve::split_reference(reference, None).1.to_string()
}

fn calls(graph: &mut KnowledgeGraph, files: &[ParsedSource], open: &mut OpenRefs) -> usize {
    let mut edges = Vec::new();
    {
        let resolver = CallResolver::for_calls(graph);
        for source in files {
            let parsed = &source.parsed;
            let path = parsed.path.as_str();
            let local = local_symbols(parsed);
            let file_id = NodeId::file(path);
            let refs = open.entry(path.to_string()).or_default();

            for call in &parsed.calls {
                let caller = local
                    .get(call.caller.as_str())
                    .filter(|id| graph.contains_node(id))
                    .unwrap_or(&file_id);
                let site = CallSite {
                    file: path,
                    caller,
                    reference: &call.callee,
                    receiver: call.receiver.as_deref(),
                };
                match resolver.resolve(&site) {
                    Some(resolution) => {
                        if !resolution.is_exact() {
                            refs.insert(bare_name(&call.callee));
                        }
                        edges.push(
                            Edge::new(caller.clone(), EdgeType::Calls, resolution.target)
                                .with_property("confidence", resolution.confidence)
                                .with_property("call_sites", 1u64),
                        );
                    }
                    None => {
                        let name = bare_name(&call.callee);
                        if !name.is_empty() {
                            refs.insert(name);
                        }
                    }
                }
            }
        }
    }
    upsert_all(graph, edges)
}

fn heritage(graph: &mut KnowledgeGraph, files: &[ParsedSource], open: &mut OpenRefs) -> usize {
    let mut edges = Vec::new();
    {
        let resolver = CallResolver::for_types(graph);
        let mut explicit: BTreeSet<(NodeId, NodeId)> = BTreeSet::new();

        for source in files {
            let parsed = &source.parsed;
            let path = parsed.path.as_str();
            let local = local_symbols(parsed);
            let refs = open.entry(path.to_string()).or_default();

            for record in &parsed.heritage {
                let Some(class_id) = local.get(record.class.as_str()) else {
                    continue;
                };
                let Some(class) = graph.node(class_id) else {
                    continue;
                };
                let site = CallSite {
                    file: path,
                    caller: class_id,
                    reference: &record.parent,
                    receiver: None,
                };
                let Some(resolution) = resolver.resolve(&site) else {
                    refs.insert(bare_name(&record.parent));
                    continue;
                };
                if !resolution.is_exact() {
                    refs.insert(bare_name(&record.parent));
                }
                if resolution.target == *class_id {
                    continue;
                }
                let parent_label = graph.node(&resolution.target).map(|n| n.label);
                let edge_type = match (record.kind, class.label, parent_label) {
                    (HeritageKind::Implements, _, _) => EdgeType::Implements,
                    (HeritageKind::Extends, Label::Class, Some(Label::Interface)) => EdgeType::Implements,
                    (HeritageKind::Extends, _, _) => EdgeType::Extends,
                };
                explicit.insert((class_id.clone(), resolution.target.clone()));
                edges.push(Edge::new(class_id.clone(), edge_type, resolution.target));
            }
        }

        // Structural conformance: every method name of a non-empty
        // interface is present on the class.
        let interfaces: Vec<(NodeId, BTreeSet<String>)> = graph
            .nodes_with_label(Label::Interface)
            .map(|i| (i.id.clone(), methods_of(graph, i).into_iter().map(|m| m.name.clone()).collect()))
            .filter(|(_, methods): &(NodeId, BTreeSet<String>)| !methods.is_empty())
            .collect();
        for source in files {
            for class in graph
                .nodes_in_file(&source.parsed.path)
                .filter(|n| n.label == Label::Class)
            {
                let methods: BTreeSet<String> = methods_of(graph, class).into_iter().map(|m| m.name.clone()).collect();
                for (interface, required) in &interfaces {
                    if explicit.contains(&(class.id.clone(), interface.clone())) {
                        continue;
                    }
                    if required.is_subset(&methods) {
                        edges.push(
                            Edge::new(class.id.clone(), EdgeType::Implements, interface.clone())
                                .with_property("structural", true),
                        );
                    }
                }
            }
        }
    }
    upsert_all(graph, edges)
}

fn types(graph: &mut KnowledgeGraph, files: &[ParsedSource], open: &mut OpenRefs) -> usize {
    let mut first_role: BTreeMap<(NodeId, NodeId), &'static str> = BTreeMap::new();
    {
        let resolver = CallResolver::for_types(graph);
        for source in files {
            let parsed = &source.parsed;
            let path = parsed.path.as_str();
            let local = local_symbols(parsed);
            let refs = open.entry(path.to_string()).or_default();

            for type_ref in &parsed.type_refs {
                let Some(symbol) = local.get(type_ref.symbol.as_str()).filter(|id| graph.contains_node(id)) else {
                    continue;
                };
                let site = CallSite {
                    file: path,
                    caller: symbol,
                    reference: &type_ref.type_name,
                    receiver: None,
                };
                let Some(resolution) = resolver.resolve(&site) else {
                    refs.insert(bare_name(&type_ref.type_name));
                    continue;
                };
                if !resolution.is_exact() {
                    refs.insert(bare_name(&type_ref.type_name));
                }
                if resolution.target == *symbol {
                    continue;
                }
                first_role
                    .entry((symbol.clone(), resolution.target))
                    .or_insert(type_ref.role.as_str());
            }
        }
    }
    let edges = first_role
        .into_iter()
        .map(|((source, target), role)| Edge::new(source, EdgeType::UsesType, target).with_property("role", role))
        .collect();
    upsert_all(graph, edges)
}

fn upsert_all(graph: &mut KnowledgeGraph, edges: Vec<Edge>) -> usize {
    let mut written = 0;
    for edge in edges {
        match graph.upsert_edge(edge) {
            Ok(()) => written += 1,
            Err(e) => tracing::debug!(error = %e, "edge dropped"),
        }
    }
    written
}

/// Names and module keys whose appearance or disappearance can change how
/// other files resolve: every symbol name plus the file's module key.
pub fn exposed_names<'a, I>(path: &str, names: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut out: BTreeSet<String> = names.into_iter().map(str::to_string).collect();
    out.insert(format!("{}{}", MODULE_REF_PREFIX, module_key(path)));
    out
}
