//! In-memory storage backend.
//!
//! Holds a committed copy and, inside a unit, a staged copy. Reads see the
//! committed copy only. Clones share state, so a test (or the query layer)
//! can keep a handle while the sync driver owns another.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{Params, Row, StorageBackend, StorageError};
use crate::graph::{Edge, EdgeKey, Node, NodeId};

/// Read statements understood by [`MemoryBackend::execute_read`], with the
/// parameter each one binds.
pub const STATEMENTS: &[(&str, &str)] = &[
    ("nodes_by_file", "path"),
    ("node_by_id", "id"),
    ("nodes_by_name", "name"),
    ("nodes_by_label", "label"),
    ("edges_by_type", "type"),
    ("callers", "id"),
    ("callees", "id"),
];

#[derive(Debug, Clone, Default)]
struct Tables {
    nodes: BTreeMap<String, Node>,
    edges: BTreeMap<EdgeKey, Edge>,
}

impl Tables {
    fn delete_file(&mut self, path: &str) {
        let doomed: Vec<String> = self
            .nodes
            .values()
            .filter(|n| n.label.is_file_attributed() && n.file_path == path)
            .map(|n| n.id.to_string())
            .collect();
        for id in &doomed {
            self.nodes.remove(id);
        }
        self.edges
            .retain(|k, _| !doomed.contains(&k.source.to_string()) && !doomed.contains(&k.target.to_string()));
    }

    fn delete_node(&mut self, id: &NodeId) {
        self.nodes.remove(id.as_str());
        self.edges.retain(|k, _| &k.source != id && &k.target != id);
    }
}

#[derive(Debug, Default)]
struct State {
    committed: Tables,
    staged: Option<Tables>,
    connected: bool,
    /// Inserts whose id contains this text fail
    fail_pattern: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                connected: true,
                ..State::default()
            })),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StorageError> {
        let state = self
            .state
            .lock()
            .map_err(|e| StorageError::Connection(format!("state mutex poisoned: {}", e)))?;
        if !state.connected {
            return Err(StorageError::Connection("backend disconnected".into()));
        }
        Ok(state)
    }

    fn staged<'s>(state: &'s mut State) -> Result<&'s mut Tables, StorageError> {
        state
            .staged
            .as_mut()
            .ok_or_else(|| StorageError::Statement("write outside a unit".into()))
    }

    /// Committed node count; 0 if the state is unavailable.
    pub fn node_count(&self) -> usize {
        self.state.lock().map(|s| s.committed.nodes.len()).unwrap_or(0)
    }

    pub fn edge_count(&self) -> usize {
        self.state.lock().map(|s| s.committed.edges.len()).unwrap_or(0)
    }

    /// Make every later insert touching an id that contains `pattern` fail.
    pub fn fail_writes_containing(&self, pattern: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_pattern = Some(pattern.to_string());
        }
    }

    /// Simulate an unreachable store.
    pub fn disconnect(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.connected = false;
        }
    }

    fn rejects(state: &State, ids: &[&str]) -> bool {
        state
            .fail_pattern
            .as_deref()
            .map(|p| ids.iter().any(|id| id.contains(p)))
            .unwrap_or(false)
    }
}

fn node_row(node: &Node) -> Row {
    let mut row = Row::new();
    row.insert("id".into(), node.id.to_string().into());
    row.insert("label".into(), node.label.to_string().into());
    row.insert("name".into(), node.name.clone().into());
    row.insert("qualified_name".into(), node.qualified_name.clone().into());
    row.insert("file_path".into(), node.file_path.clone().into());
    row.insert("start_line".into(), node.span.start_line.into());
    row.insert("end_line".into(), node.span.end_line.into());
    row.insert(
        "properties".into(),
        serde_json::to_value(&node.properties).unwrap_or_default(),
    );
    row
}

fn edge_row(edge: &Edge) -> Row {
    let mut row = Row::new();
    row.insert("source".into(), edge.source.to_string().into());
    row.insert("type".into(), edge.edge_type.as_str().into());
    row.insert("target".into(), edge.target.to_string().into());
    row.insert(
        "properties".into(),
        serde_json::to_value(&edge.properties).unwrap_or_default(),
    );
    row
}

fn param<'p>(params: &'p Params, name: &str) -> Result<&'p str, StorageError> {
    params
        .get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| StorageError::Statement(format!("missing string parameter ${}", name)))
}

impl StorageBackend for MemoryBackend {
    fn begin(&self, unit: &str) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        if state.staged.is_some() {
            return Err(StorageError::Statement(format!("unit {} started inside another unit", unit)));
        }
        state.staged = Some(state.committed.clone());
        Ok(())
    }

    fn delete_file(&self, path: &str) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        Self::staged(&mut state)?.delete_file(path);
        Ok(())
    }

    fn delete_node(&self, id: &NodeId) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        Self::staged(&mut state)?.delete_node(id);
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        *Self::staged(&mut state)? = Tables::default();
        Ok(())
    }

    fn insert_node(&self, node: &Node) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        if Self::rejects(&state, &[node.id.as_str()]) {
            return Err(StorageError::Write {
                record: node.id.to_string(),
                message: "rejected".into(),
            });
        }
        Self::staged(&mut state)?
            .nodes
            .insert(node.id.to_string(), node.clone());
        Ok(())
    }

    fn insert_edge(&self, edge: &Edge) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        if Self::rejects(&state, &[edge.source.as_str(), edge.target.as_str()]) {
            return Err(StorageError::Write {
                record: format!("{} -{}-> {}", edge.source, edge.edge_type, edge.target),
                message: "rejected".into(),
            });
        }
        Self::staged(&mut state)?.edges.insert(edge.key(), edge.clone());
        Ok(())
    }

    fn commit(&self) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        let staged = state
            .staged
            .take()
            .ok_or_else(|| StorageError::Statement("commit outside a unit".into()))?;
        state.committed = staged;
        Ok(())
    }

    fn rollback(&self) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        state.staged = None;
        Ok(())
    }

    fn execute_read(&self, statement: &str, params: &Params) -> Result<Vec<Row>, StorageError> {
        let state = self.lock()?;
        let tables = &state.committed;
        let rows = match statement.trim() {
            "nodes_by_file" => {
                let path = param(params, "path")?;
                tables
                    .nodes
                    .values()
                    .filter(|n| n.file_path == path)
                    .map(node_row)
                    .collect()
            }
            "node_by_id" => {
                let id = param(params, "id")?;
                tables.nodes.get(id).map(node_row).into_iter().collect()
            }
            "nodes_by_name" => {
                let name = param(params, "name")?;
                tables
                    .nodes
                    .values()
                    .filter(|n| n.name == name)
                    .map(node_row)
                    .collect()
            }
            "nodes_by_label" => {
                let label = param(params, "label")?;
                tables
                    .nodes
                    .values()
                    .filter(|n| n.label.to_string() == label || n.label.as_str() == label)
                    .map(node_row)
                    .collect()
            }
            "edges_by_type" => {
                let edge_type = param(params, "type")?;
                tables
                    .edges
                    .values()
                    .filter(|e| e.edge_type.as_str() == edge_type)
                    .map(edge_row)
                    .collect()
            }
            "callers" | "callees" => {
                let id = param(params, "id")?;
                let incoming = statement.trim() == "callers";
                tables
                    .edges
                    .values()
                    .filter(|e| e.edge_type == crate::graph::EdgeType::Calls)
                    .filter(|e| {
                        if incoming {
                            e.target.as_str() == id
                        } else {
                            e.source.as_str() == id
                        }
                    })
                    .map(edge_row)
                    .collect()
            }
            other => {
                return Err(StorageError::Statement(format!("unknown statement {:?}", other)));
            }
        };
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{EdgeType, Label, Span};

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::from(*v)))
            .collect()
    }

    fn loaded() -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend.begin("t").unwrap();
        let f = Node::new(Label::Function, "a.py", "f", "f", Span::new(1, 2));
        let g = Node::new(Label::Function, "b.py", "g", "g", Span::new(1, 2));
        backend.insert_node(&f).unwrap();
        backend.insert_node(&g).unwrap();
        backend
            .insert_edge(&Edge::new(g.id.clone(), EdgeType::Calls, f.id.clone()))
            .unwrap();
        backend.commit().unwrap();
        backend
    }

    #[test]
    fn test_reads_bind_parameters() {
        let backend = loaded();
        let rows = backend
            .execute_read("nodes_by_name", &params(&[("name", "f")]))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["file_path"], "a.py");

        // a value that looks like a statement is just a value
        let rows = backend
            .execute_read("nodes_by_name", &params(&[("name", "f' OR 1=1 --")]))
            .unwrap();
        assert!(rows.is_empty());

        let callers = backend
            .execute_read("callers", &params(&[("id", "function:a.py:f")]))
            .unwrap();
        assert_eq!(callers.len(), 1);
        assert_eq!(callers[0]["source"], "function:b.py:g");
    }

    #[test]
    fn test_unknown_statement_and_missing_param() {
        let backend = loaded();
        assert!(matches!(
            backend.execute_read("drop_everything", &Params::new()),
            Err(StorageError::Statement(_))
        ));
        assert!(matches!(
            backend.execute_read("nodes_by_file", &Params::new()),
            Err(StorageError::Statement(_))
        ));
    }

    #[test]
    fn test_rollback_discards_unit() {
        let backend = loaded();
        backend.begin("u").unwrap();
        backend.delete_file("a.py").unwrap();
        backend.rollback().unwrap();
        assert_eq!(backend.node_count(), 2);
        assert_eq!(backend.edge_count(), 1);

        backend.begin("u").unwrap();
        backend.delete_file("a.py").unwrap();
        backend.commit().unwrap();
        assert_eq!(backend.node_count(), 1);
        assert_eq!(backend.edge_count(), 0);
    }

    #[test]
    fn test_write_outside_unit_rejected() {
        let backend = MemoryBackend::new();
        let node = Node::file("a.py");
        assert!(backend.insert_node(&node).is_err());
    }
}
