//! In-memory knowledge graph with incrementally maintained indexes.
//!
//! Node and edge payloads are held behind `Arc`, so cloning a graph to build
//! the next snapshot copies pointers, not payloads. Every mutation updates
//! the secondary indexes in place; nothing is rebuilt wholesale.

use ahash::AHashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::identity::{ancestor_dirs, NodeId};
use super::schema::{Direction, Edge, EdgeKey, EdgeOwner, EdgeType, Label, Node};
use crate::error::{EngineError, EngineResult};

/// Everything one source file contributes from the structure and parse
/// phases: its File node, its symbols, and edges originating from them.
#[derive(Debug, Clone)]
pub struct FileContribution {
    pub path: String,
    pub file_node: Node,
    pub symbols: Vec<Node>,
    pub edges: Vec<Edge>,
}

/// Summary of one `replace_file` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaceOutcome {
    pub added_nodes: usize,
    pub removed_nodes: usize,
    /// Ids skipped because another node already owns them with a different label
    pub conflicts: Vec<String>,
    pub skipped_edges: usize,
}

#[derive(Debug, Clone, Default)]
struct GraphIndexes {
    outgoing: AHashMap<NodeId, BTreeSet<EdgeKey>>,
    incoming: AHashMap<NodeId, BTreeSet<EdgeKey>>,
    by_label: AHashMap<Label, BTreeSet<NodeId>>,
    /// File-attributed nodes only (File and symbols)
    by_file: AHashMap<String, BTreeSet<NodeId>>,
    by_name: AHashMap<String, BTreeSet<NodeId>>,
    by_edge_type: AHashMap<EdgeType, BTreeSet<EdgeKey>>,
}

impl GraphIndexes {
    fn add_node(&mut self, node: &Node) {
        self.by_label
            .entry(node.label)
            .or_default()
            .insert(node.id.clone());
        if node.label.is_file_attributed() {
            self.by_file
                .entry(node.file_path.clone())
                .or_default()
                .insert(node.id.clone());
        }
        if node.label.is_symbol() {
            self.by_name
                .entry(node.name.clone())
                .or_default()
                .insert(node.id.clone());
        }
    }

    fn remove_node(&mut self, node: &Node) {
        remove_from(&mut self.by_label, &node.label, &node.id);
        if node.label.is_file_attributed() {
            remove_from(&mut self.by_file, &node.file_path, &node.id);
        }
        if node.label.is_symbol() {
            remove_from(&mut self.by_name, &node.name, &node.id);
        }
    }

    fn add_edge(&mut self, key: &EdgeKey) {
        self.outgoing
            .entry(key.source.clone())
            .or_default()
            .insert(key.clone());
        self.incoming
            .entry(key.target.clone())
            .or_default()
            .insert(key.clone());
        self.by_edge_type
            .entry(key.edge_type)
            .or_default()
            .insert(key.clone());
    }

    fn remove_edge(&mut self, key: &EdgeKey) {
        remove_from(&mut self.outgoing, &key.source, key);
        remove_from(&mut self.incoming, &key.target, key);
        remove_from(&mut self.by_edge_type, &key.edge_type, key);
    }
}

fn remove_from<K, V>(map: &mut AHashMap<K, BTreeSet<V>>, key: &K, value: &V)
where
    K: std::hash::Hash + Eq,
    V: Ord,
{
    if let Some(set) = map.get_mut(key) {
        set.remove(value);
        if set.is_empty() {
            map.remove(key);
        }
    }
}

/// The authoritative graph for one repository.
#[derive(Debug, Clone, Default)]
pub struct KnowledgeGraph {
    nodes: BTreeMap<NodeId, Arc<Node>>,
    edges: BTreeMap<EdgeKey, Arc<Edge>>,
    indexes: GraphIndexes,
}

impl KnowledgeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id).map(|n| n.as_ref())
    }

    pub fn contains_node(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn edge(&self, key: &EdgeKey) -> Option<&Edge> {
        self.edges.get(key).map(|e| e.as_ref())
    }

    /// All nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values().map(|n| n.as_ref())
    }

    /// All edges in key order.
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values().map(|e| e.as_ref())
    }

    /// Nodes with `label`, in id order.
    pub fn nodes_with_label(&self, label: Label) -> impl Iterator<Item = &Node> {
        self.indexes
            .by_label
            .get(&label)
            .into_iter()
            .flat_map(|ids| ids.iter())
            .filter_map(|id| self.node(id))
    }

    /// File-attributed nodes of `path` (its File node and symbols).
    pub fn nodes_in_file(&self, path: &str) -> impl Iterator<Item = &Node> {
        self.indexes
            .by_file
            .get(path)
            .into_iter()
            .flat_map(|ids| ids.iter())
            .filter_map(|id| self.node(id))
    }

    /// Symbols whose short name is `name`.
    pub fn nodes_named(&self, name: &str) -> impl Iterator<Item = &Node> {
        self.indexes
            .by_name
            .get(name)
            .into_iter()
            .flat_map(|ids| ids.iter())
            .filter_map(|id| self.node(id))
    }

    /// Distinct symbol names, sorted.
    pub fn symbol_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.indexes.by_name.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn file_paths(&self) -> impl Iterator<Item = &str> {
        self.nodes_with_label(Label::File)
            .map(|n| n.file_path.as_str())
    }

    pub fn edges_of_type(&self, edge_type: EdgeType) -> impl Iterator<Item = &Edge> {
        self.indexes
            .by_edge_type
            .get(&edge_type)
            .into_iter()
            .flat_map(|keys| keys.iter())
            .filter_map(|k| self.edge(k))
    }

    pub fn outgoing(&self, id: &NodeId) -> impl Iterator<Item = &Edge> {
        self.indexes
            .outgoing
            .get(id)
            .into_iter()
            .flat_map(|keys| keys.iter())
            .filter_map(|k| self.edge(k))
    }

    pub fn incoming(&self, id: &NodeId) -> impl Iterator<Item = &Edge> {
        self.indexes
            .incoming
            .get(id)
            .into_iter()
            .flat_map(|keys| keys.iter())
            .filter_map(|k| self.edge(k))
    }

    /// Edges adjacent to `id` in `direction`, restricted to `edge_types`
    /// (all types when empty), paired with the node on the other end.
    pub fn neighbors(
        &self,
        id: &NodeId,
        edge_types: &[EdgeType],
        direction: Direction,
    ) -> Vec<(&Edge, &Node)> {
        let wanted = |e: &Edge| edge_types.is_empty() || edge_types.contains(&e.edge_type);
        let mut out = Vec::new();
        if matches!(direction, Direction::Outgoing | Direction::Both) {
            for edge in self.outgoing(id).filter(|e| wanted(e)) {
                if let Some(node) = self.node(&edge.target) {
                    out.push((edge, node));
                }
            }
        }
        if matches!(direction, Direction::Incoming | Direction::Both) {
            for edge in self.incoming(id).filter(|e| wanted(e)) {
                if let Some(node) = self.node(&edge.source) {
                    out.push((edge, node));
                }
            }
        }
        out
    }

    /// Insert or replace a node.
    ///
    /// Re-upserting an id replaces its payload. An id already held by a node
    /// with a different label is a conflict and leaves the graph unchanged.
    pub fn upsert_node(&mut self, node: Node) -> EngineResult<()> {
        if let Some(existing) = self.nodes.get(&node.id) {
            if existing.label != node.label {
                return Err(EngineError::Conflict {
                    id: node.id.to_string(),
                    existing: existing.label,
                    incoming: node.label,
                });
            }
            let existing = Arc::clone(existing);
            self.indexes.remove_node(&existing);
        }
        self.indexes.add_node(&node);
        self.nodes.insert(node.id.clone(), Arc::new(node));
        Ok(())
    }

    /// Insert an edge, merging with an existing edge of the same key.
    ///
    /// CALLS edges keep the highest confidence and count call sites; other
    /// types take the incoming properties.
    pub fn upsert_edge(&mut self, edge: Edge) -> EngineResult<()> {
        for endpoint in [&edge.source, &edge.target] {
            if !self.nodes.contains_key(endpoint) {
                return Err(EngineError::DanglingEdge {
                    edge_type: edge.edge_type,
                    missing: endpoint.to_string(),
                });
            }
        }
        let key = edge.key();
        let merged = match self.edges.get(&key) {
            Some(existing) if edge.edge_type == EdgeType::Calls => {
                let mut merged = existing.as_ref().clone();
                let confidence = existing.confidence().max(edge.confidence());
                let sites = existing.prop_u64("call_sites").unwrap_or(1)
                    + edge.prop_u64("call_sites").unwrap_or(1);
                merged.properties.extend(edge.properties);
                merged
                    .properties
                    .insert("confidence".into(), serde_json::json!(confidence));
                merged
                    .properties
                    .insert("call_sites".into(), serde_json::json!(sites));
                merged
            }
            _ => edge,
        };
        if !self.edges.contains_key(&key) {
            self.indexes.add_edge(&key);
        }
        self.edges.insert(key, Arc::new(merged));
        Ok(())
    }

    pub fn remove_edge(&mut self, key: &EdgeKey) -> Option<Edge> {
        let removed = self.edges.remove(key)?;
        self.indexes.remove_edge(key);
        Some(Arc::try_unwrap(removed).unwrap_or_else(|arc| arc.as_ref().clone()))
    }

    /// Remove every edge with `id` as source or target.
    pub fn remove_edges_touching(&mut self, id: &NodeId) -> usize {
        let mut keys: BTreeSet<EdgeKey> = BTreeSet::new();
        if let Some(out) = self.indexes.outgoing.get(id) {
            keys.extend(out.iter().cloned());
        }
        if let Some(inc) = self.indexes.incoming.get(id) {
            keys.extend(inc.iter().cloned());
        }
        let count = keys.len();
        for key in keys {
            self.remove_edge(&key);
        }
        count
    }

    /// Remove a node and every edge touching it.
    pub fn remove_node(&mut self, id: &NodeId) -> Option<Node> {
        self.remove_edges_touching(id);
        let removed = self.nodes.remove(id)?;
        self.indexes.remove_node(&removed);
        Some(Arc::try_unwrap(removed).unwrap_or_else(|arc| arc.as_ref().clone()))
    }

    pub fn remove_edges_of_type(&mut self, edge_type: EdgeType) -> usize {
        let keys: Vec<EdgeKey> = self
            .indexes
            .by_edge_type
            .get(&edge_type)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        for key in &keys {
            self.remove_edge(key);
        }
        keys.len()
    }

    pub fn remove_nodes_with_label(&mut self, label: Label) -> usize {
        let ids: Vec<NodeId> = self
            .indexes
            .by_label
            .get(&label)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        for id in &ids {
            self.remove_node(id);
        }
        ids.len()
    }

    /// Set one property on an existing node. Returns false if absent.
    pub fn set_node_property(&mut self, id: &NodeId, key: &str, value: serde_json::Value) -> bool {
        match self.nodes.get_mut(id) {
            Some(node) => {
                Arc::make_mut(node).properties.insert(key.to_string(), value);
                true
            }
            None => false,
        }
    }

    /// Atomically replace everything `contribution.path` contributed.
    ///
    /// - old nodes missing from the new set are removed with all their edges
    /// - file-local edges originating from kept nodes are dropped
    /// - incoming edges from other files into kept nodes survive
    /// - the folder chain above the file is created on demand
    /// - new edges must originate from this file's nodes
    pub fn replace_file(&mut self, contribution: FileContribution) -> ReplaceOutcome {
        let FileContribution {
            path,
            file_node,
            symbols,
            edges,
        } = contribution;
        let mut outcome = ReplaceOutcome::default();

        let old_ids: BTreeSet<NodeId> = self
            .indexes
            .by_file
            .get(&path)
            .cloned()
            .unwrap_or_default();
        let mut new_ids: BTreeSet<NodeId> = BTreeSet::new();
        new_ids.insert(file_node.id.clone());
        new_ids.extend(symbols.iter().map(|n| n.id.clone()));

        for id in old_ids.difference(&new_ids) {
            self.remove_node(id);
            outcome.removed_nodes += 1;
        }
        for id in old_ids.intersection(&new_ids) {
            let stale: Vec<EdgeKey> = self
                .indexes
                .outgoing
                .get(id)
                .map(|keys| {
                    keys.iter()
                        .filter(|k| k.edge_type.owner() == EdgeOwner::FileLocal)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            for key in stale {
                self.remove_edge(&key);
            }
        }

        let mut accepted: BTreeSet<NodeId> = BTreeSet::new();
        let mut seen: BTreeSet<NodeId> = BTreeSet::new();
        for node in std::iter::once(file_node).chain(symbols) {
            if !seen.insert(node.id.clone()) {
                tracing::warn!(id = %node.id, path = %path, "duplicate symbol in one file, keeping first");
                continue;
            }
            let id = node.id.clone();
            let existed = old_ids.contains(&id);
            let incoming_label = node.label;
            match self.upsert_node(node) {
                Ok(()) => {
                    if !existed {
                        outcome.added_nodes += 1;
                    }
                    accepted.insert(id);
                }
                Err(e) => {
                    if let Some(existing) = self.node(&id) {
                        tracing::warn!(
                            code = e.code(),
                            id = %id,
                            existing_label = %existing.label,
                            existing_file = %existing.file_path,
                            incoming_label = %incoming_label,
                            incoming_file = %path,
                            "identity conflict, upsert skipped"
                        );
                    }
                    outcome.conflicts.push(id.to_string());
                }
            }
        }

        self.ensure_folders(&path);

        for edge in edges {
            if !accepted.contains(&edge.source) {
                outcome.skipped_edges += 1;
                continue;
            }
            if let Err(e) = self.upsert_edge(edge) {
                tracing::debug!(path = %path, error = %e, "edge skipped");
                outcome.skipped_edges += 1;
            }
        }
        outcome
    }

    /// Remove everything `path` contributed and prune empty folders.
    pub fn remove_file(&mut self, path: &str) -> usize {
        let ids: Vec<NodeId> = self
            .indexes
            .by_file
            .get(path)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        for id in &ids {
            self.remove_node(id);
        }
        self.prune_folders(path);
        ids.len()
    }

    fn ensure_folders(&mut self, path: &str) {
        let dirs = ancestor_dirs(path);
        let mut parent: Option<NodeId> = None;
        for dir in &dirs {
            let id = NodeId::folder(dir);
            if !self.nodes.contains_key(&id) {
                if let Err(e) = self.upsert_node(Node::folder(dir.clone())) {
                    tracing::warn!(code = e.code(), folder = %dir, error = %e, "folder node skipped");
                }
            }
            if let Some(parent_id) = parent.take() {
                let key = EdgeKey {
                    source: parent_id.clone(),
                    edge_type: EdgeType::Contains,
                    target: id.clone(),
                };
                if !self.edges.contains_key(&key) {
                    if let Err(e) = self.upsert_edge(Edge::new(parent_id, EdgeType::Contains, id.clone())) {
                        tracing::warn!(code = e.code(), folder = %dir, error = %e, "folder edge skipped");
                    }
                }
            }
            parent = Some(id);
        }
        if let Some(folder) = parent {
            let file_id = NodeId::file(path);
            if self.nodes.contains_key(&file_id) {
                if let Err(e) = self.upsert_edge(Edge::new(folder, EdgeType::Contains, file_id)) {
                    tracing::warn!(code = e.code(), path, error = %e, "file containment edge skipped");
                }
            }
        }
    }

    fn prune_folders(&mut self, path: &str) {
        for dir in ancestor_dirs(path).iter().rev() {
            let id = NodeId::folder(dir);
            let has_children = self
                .indexes
                .outgoing
                .get(&id)
                .map(|keys| keys.iter().any(|k| k.edge_type == EdgeType::Contains))
                .unwrap_or(false);
            if has_children {
                break;
            }
            self.remove_node(&id);
        }
    }

    /// Check every edge endpoint exists. Returns the first violation.
    pub fn check_integrity(&self) -> EngineResult<()> {
        for edge in self.edges() {
            for endpoint in [&edge.source, &edge.target] {
                if !self.contains_node(endpoint) {
                    return Err(EngineError::DanglingEdge {
                        edge_type: edge.edge_type,
                        missing: endpoint.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Structural equality of node and edge sets, ignoring index layout.
    pub fn same_content(&self, other: &KnowledgeGraph) -> bool {
        self.nodes.len() == other.nodes.len()
            && self.edges.len() == other.edges.len()
            && self
                .nodes
                .iter()
                .zip(other.nodes.iter())
                .all(|((ka, a), (kb, b))| ka == kb && a == b)
            && self
                .edges
                .iter()
                .zip(other.edges.iter())
                .all(|((ka, a), (kb, b))| ka == kb && a == b)
    }
}
