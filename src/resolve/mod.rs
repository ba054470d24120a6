//! Call and type reference resolution.
//!
//! A reference found in one file is resolved to a defining symbol in three
//! steps, stopping at the first hit:
//!
//! 1. an import binding of the file names it (confidence 1.0)
//! 2. a symbol of that name is defined in the same file (confidence 1.0)
//! 3. any symbol of that name in the graph, ranked by proximity (confidence 0.5)
//!
//! No hit is not an error; the reference just produces no edge.

pub mod imports;

pub use imports::{module_key, module_path, module_spec, ModuleIndex, ModuleSpec};

use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

use crate::graph::identity::{dir_depth, shared_dir_prefix};
use crate::graph::query::ancestors;
use crate::graph::{Edge, EdgeType, KnowledgeGraph, Label, Node, NodeId};
use crate::ingest::is_test_path;

/// Re-export chains are followed at most this deep.
pub const MAX_REEXPORT_DEPTH: usize = 3;

/// Receivers that refer to the enclosing class.
const SELF_RECEIVERS: &[&str] = &["self", "this", "cls", "Self", "super"];

/// How a reference was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    ImportBinding,
    SameFile,
    GlobalName,
}

impl Strategy {
    pub fn confidence(&self) -> f64 {
        match self {
            Strategy::ImportBinding | Strategy::SameFile => 1.0,
            Strategy::GlobalName => 0.5,
        }
    }
}

/// A resolved reference.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub target: NodeId,
    pub confidence: f64,
    pub strategy: Strategy,
}

impl Resolution {
    fn new(target: &Node, strategy: Strategy) -> Self {
        Self {
            target: target.id.clone(),
            confidence: strategy.confidence(),
            strategy,
        }
    }

    pub fn is_exact(&self) -> bool {
        self.confidence >= 1.0
    }
}

/// One reference to resolve.
#[derive(Debug, Clone, Copy)]
pub struct CallSite<'a> {
    /// File the reference appears in
    pub file: &'a str,
    /// Enclosing symbol, or the File node for module-level code
    pub caller: &'a NodeId,
    /// Reference text (`helper`, `self.save`, `utils.parse`, `models::User`)
    pub reference: &'a str,
    /// Receiver or module alias when the parser separated it
    pub receiver: Option<&'a str>,
}

/// Split a reference into (receiver, bare name).
///
/// `self.save` is `(Some("self"), "save")`; `crate::db::connect` is
/// `(Some("crate::db"), "connect")`. Generic arguments are dropped.
pub fn split_reference<'a>(reference: &'a str, receiver: Option<&'a str>) -> (Option<&'a str>, &'a str) {
    let cut = reference
        .find(['[', '<', '('])
        .map(|idx| &reference[..idx])
        .unwrap_or(reference)
        .trim();
    let (prefix, name) = match (cut.rfind("::"), cut.rfind('.')) {
        (Some(a), Some(b)) if b > a => (Some(&cut[..b]), &cut[b + 1..]),
        (Some(a), _) => (Some(&cut[..a]), &cut[a + 2..]),
        (None, Some(b)) => (Some(&cut[..b]), &cut[b + 1..]),
        (None, None) => (None, cut),
    };
    let prefix = prefix.filter(|p| !p.is_empty());
    (receiver.or(prefix), name)
}

/// Names an IMPORTS edge brings into scope.
///
/// Stored on the edge as `names` (original names), `aliases`
/// (local alias to original name) and `module_aliases` (names bound to the
/// module itself).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportBindings {
    pub module: String,
    pub names: BTreeSet<String>,
    pub aliases: BTreeMap<String, String>,
    pub module_aliases: BTreeSet<String>,
}

impl ImportBindings {
    pub fn from_edge(edge: &Edge) -> Self {
        let strings = |key: &str| -> BTreeSet<String> {
            edge.properties
                .get(key)
                .and_then(|v| v.as_array())
                .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default()
        };
        let aliases = edge
            .properties
            .get("aliases")
            .and_then(|v| v.as_object())
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            module: edge
                .properties
                .get("module")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            names: strings("names"),
            aliases,
            module_aliases: strings("module_aliases"),
        }
    }

    /// Write these bindings onto an IMPORTS edge.
    pub fn apply(&self, edge: Edge) -> Edge {
        edge.with_property("module", self.module.clone())
            .with_property("names", serde_json::json!(self.names))
            .with_property("aliases", serde_json::json!(self.aliases))
            .with_property("module_aliases", serde_json::json!(self.module_aliases))
    }

    /// Fold another import statement of the same target file into this one.
    pub fn merge(&mut self, other: ImportBindings) {
        if self.module.is_empty() {
            self.module = other.module;
        }
        self.names.extend(other.names);
        self.aliases.extend(other.aliases);
        self.module_aliases.extend(other.module_aliases);
    }

    /// Original name bound to `local`, if this import binds it.
    pub fn binds(&self, local: &str) -> Option<&str> {
        if let Some(original) = self.aliases.get(local) {
            return Some(original);
        }
        self.names.get(local).map(String::as_str)
    }
}

/// Pick the best of several file keys for a reference made from `from`:
/// longest shared directory prefix, then non-test, then shallower, then key.
pub(crate) fn rank_paths<'a, I>(from: &str, candidates: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    candidates.into_iter().min_by_key(|p| {
        (
            Reverse(shared_dir_prefix(from, p)),
            is_test_path(p),
            dir_depth(p),
            *p,
        )
    })
}

/// Resolves references against a graph. Stateless; resolving the same
/// site against the same graph always gives the same answer.
pub struct CallResolver<'g> {
    graph: &'g KnowledgeGraph,
    accepts: fn(&Label) -> bool,
}

impl<'g> CallResolver<'g> {
    /// Resolver for call expressions (functions, methods, constructors).
    pub fn for_calls(graph: &'g KnowledgeGraph) -> Self {
        Self {
            graph,
            accepts: Label::is_callable,
        }
    }

    /// Resolver for type names (classes, interfaces, aliases, enums).
    pub fn for_types(graph: &'g KnowledgeGraph) -> Self {
        Self {
            graph,
            accepts: Label::is_type,
        }
    }

    pub fn resolve(&self, site: &CallSite<'_>) -> Option<Resolution> {
        let (receiver, name) = split_reference(site.reference, site.receiver);
        if name.is_empty() {
            return None;
        }
        if let Some(node) = self.via_imports(site.file, receiver, name) {
            return Some(Resolution::new(node, Strategy::ImportBinding));
        }
        if let Some(node) = self.in_same_file(site, receiver, name) {
            return Some(Resolution::new(node, Strategy::SameFile));
        }
        self.by_global_name(site.file, name)
            .map(|node| Resolution::new(node, Strategy::GlobalName))
    }

    fn via_imports(&self, file: &str, receiver: Option<&str>, name: &str) -> Option<&'g Node> {
        let file_id = NodeId::file(file);
        for edge in self.graph.outgoing(&file_id) {
            if edge.edge_type != EdgeType::Imports {
                continue;
            }
            let Some(target) = self.graph.node(&edge.target) else {
                continue;
            };
            let bindings = ImportBindings::from_edge(edge);
            match receiver {
                None => {
                    if let Some(original) = bindings.binds(name) {
                        if let Some(node) = self.exported(&target.file_path, original, 0) {
                            return Some(node);
                        }
                    }
                }
                Some(recv) => {
                    // `import utils` then `utils.parse()`
                    if bindings.module_aliases.contains(recv) {
                        if let Some(node) = self.exported(&target.file_path, name, 0) {
                            return Some(node);
                        }
                    }
                    // `from models import User` then `User.create()`
                    if let Some(original) = bindings.binds(recv) {
                        if let Some(owner) = self.top_level(&target.file_path, original, Label::is_type) {
                            if let Some(method) = self.member(owner, name) {
                                return Some(method);
                            }
                        }
                    }
                }
            }
        }
        None
    }

    /// Top-level symbol `name` defined in `file`, following re-exports
    /// (an index file importing the name from elsewhere).
    fn exported(&self, file: &str, name: &str, depth: usize) -> Option<&'g Node> {
        if let Some(node) = self.top_level(file, name, self.accepts) {
            return Some(node);
        }
        if depth >= MAX_REEXPORT_DEPTH {
            return None;
        }
        let file_id = NodeId::file(file);
        for edge in self.graph.outgoing(&file_id) {
            if edge.edge_type != EdgeType::Imports {
                continue;
            }
            let bindings = ImportBindings::from_edge(edge);
            let Some(original) = bindings.binds(name) else {
                continue;
            };
            if let Some(target) = self.graph.node(&edge.target) {
                if let Some(node) = self.exported(&target.file_path, original, depth + 1) {
                    return Some(node);
                }
            }
        }
        None
    }

    fn top_level(&self, file: &str, name: &str, accepts: fn(&Label) -> bool) -> Option<&'g Node> {
        self.graph
            .nodes_in_file(file)
            .filter(|n| n.name == name && accepts(&n.label))
            .min_by_key(|n| (n.label == Label::Method, n.span.start_line, &n.id))
    }

    fn member(&self, owner: &Node, name: &str) -> Option<&'g Node> {
        self.graph
            .nodes_in_file(&owner.file_path)
            .filter(|n| {
                n.label == Label::Method
                    && n.name == name
                    && n.prop_str("owner") == Some(owner.id.as_str())
            })
            .min_by_key(|n| &n.id)
    }

    /// Method `name` on `owner`, or on the nearest ancestor that defines it.
    fn member_or_inherited(&self, owner: &Node, name: &str) -> Option<&'g Node> {
        if let Some(method) = self.member(owner, name) {
            return Some(method);
        }
        ancestors(self.graph, &owner.id)
            .into_iter()
            .find_map(|parent| self.member(parent, name))
    }

    fn in_same_file(&self, site: &CallSite<'_>, receiver: Option<&str>, name: &str) -> Option<&'g Node> {
        // `Derived.run()` names its class: its own member, then its bases'
        if let Some(recv) = receiver.filter(|r| !SELF_RECEIVERS.contains(r)) {
            let owner = self.top_level(site.file, recv, Label::is_type);
            if let Some(method) = owner.and_then(|o| self.member_or_inherited(o, name)) {
                return Some(method);
            }
        }
        let caller_owner = self
            .graph
            .node(site.caller)
            .and_then(|n| n.prop_str("owner"));
        let self_call = receiver.map(|r| SELF_RECEIVERS.contains(&r)).unwrap_or(false);
        self.graph
            .nodes_in_file(site.file)
            .filter(|n| n.name == name && (self.accepts)(&n.label))
            .min_by_key(|n| {
                let same_owner = caller_owner.is_some()
                    && (self_call || receiver.is_none())
                    && n.prop_str("owner") == caller_owner;
                let shape_mismatch = (n.label == Label::Method) != receiver.is_some();
                (!same_owner, shape_mismatch, n.span.start_line, &n.id)
            })
    }

    fn by_global_name(&self, file: &str, name: &str) -> Option<&'g Node> {
        self.graph
            .nodes_named(name)
            .filter(|n| (self.accepts)(&n.label) && n.file_path != file)
            .min_by_key(|n| {
                (
                    Reverse(shared_dir_prefix(file, &n.file_path)),
                    is_test_path(&n.file_path),
                    dir_depth(&n.file_path),
                    &n.id,
                )
            })
    }
}
