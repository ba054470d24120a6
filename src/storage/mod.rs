//! Storage backend interface and the sync driver that feeds it.
//!
//! The engine's working state is the in-memory graph. A storage backend
//! only receives copies: one delete+insert unit per changed file after a
//! file-local commit, and a full bulk load after a global refresh.
//!
//! Write failures are counted per unit. A unit whose failures exceed the
//! configured threshold is rolled back and reported; it is never committed
//! half-written. An unreachable backend is fatal for the run.

pub mod memory;

pub use memory::MemoryBackend;

use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::EngineError;
use crate::graph::identity::ancestor_dirs;
use crate::graph::{Edge, EdgeType, KnowledgeGraph, Node, NodeId};

/// Bound parameters for a read statement.
pub type Params = BTreeMap<String, serde_json::Value>;

/// One result row: column name to value.
pub type Row = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    /// Backend unreachable
    #[error("connection lost: {0}")]
    Connection(String),

    /// One record could not be written
    #[error("write of {record} failed: {message}")]
    Write { record: String, message: String },

    /// Unknown statement or missing parameter
    #[error("bad statement: {0}")]
    Statement(String),
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Connection(msg) => EngineError::Connection(msg),
            StorageError::Statement(msg) => EngineError::QueryRejected(msg),
            other => EngineError::External(other.to_string()),
        }
    }
}

/// A persistent graph/search store.
///
/// Writes happen inside `begin`/`commit`; `rollback` discards everything
/// since `begin`. Reads take a statement and bound parameters only.
pub trait StorageBackend: Send + Sync {
    fn begin(&self, unit: &str) -> Result<(), StorageError>;

    /// Drop every node attributed to `path` and the edges touching them.
    fn delete_file(&self, path: &str) -> Result<(), StorageError>;

    /// Drop one node and the edges touching it.
    fn delete_node(&self, id: &NodeId) -> Result<(), StorageError>;

    /// Drop everything. Used before a bulk load.
    fn clear(&self) -> Result<(), StorageError>;

    fn insert_node(&self, node: &Node) -> Result<(), StorageError>;

    fn insert_edge(&self, edge: &Edge) -> Result<(), StorageError>;

    fn commit(&self) -> Result<(), StorageError>;

    fn rollback(&self) -> Result<(), StorageError>;

    /// Run a read-only statement. Untrusted values travel in `params`.
    fn execute_read(&self, statement: &str, params: &Params) -> Result<Vec<Row>, StorageError>;
}

/// Result of pushing one or more units.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    pub units_committed: usize,
    /// Units rolled back after exceeding the failure threshold, with their
    /// failure counts
    pub units_aborted: Vec<(String, usize)>,
    /// Failures inside committed units (below the threshold)
    pub tolerated_failures: usize,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.units_aborted.is_empty() && self.tolerated_failures == 0
    }

    fn merge(&mut self, other: SyncReport) {
        self.units_committed += other.units_committed;
        self.units_aborted.extend(other.units_aborted);
        self.tolerated_failures += other.tolerated_failures;
    }
}

/// Pushes graph state into a [`StorageBackend`] with failure accounting.
pub struct StorageSync {
    backend: Box<dyn StorageBackend>,
    failure_threshold: usize,
}

impl StorageSync {
    pub fn new(backend: Box<dyn StorageBackend>, failure_threshold: usize) -> Self {
        Self {
            backend,
            failure_threshold,
        }
    }

    pub fn backend(&self) -> &dyn StorageBackend {
        self.backend.as_ref()
    }

    /// Replace the stored copy of each file in `paths` with what `graph`
    /// holds now. A path the graph no longer has is simply deleted.
    ///
    /// The folder chain above each path travels in the same unit: folders
    /// the graph still has are rewritten with their CONTAINS edges, pruned
    /// ones are deleted.
    ///
    /// Returns `Err` only for a lost connection.
    pub fn sync_files(&self, graph: &KnowledgeGraph, paths: &[String]) -> Result<SyncReport, EngineError> {
        let mut report = SyncReport::default();
        for path in paths {
            let mut nodes: Vec<&Node> = Vec::new();
            let mut edges: Vec<&Edge> = Vec::new();
            let mut pruned: Vec<NodeId> = Vec::new();
            for dir in ancestor_dirs(path) {
                let id = NodeId::folder(&dir);
                match graph.node(&id) {
                    Some(folder) => {
                        nodes.push(folder);
                        edges.extend(graph.incoming(&id).filter(|e| e.edge_type == EdgeType::Contains));
                    }
                    None => pruned.push(id),
                }
            }

            let file_nodes: Vec<&Node> = graph.nodes_in_file(path).collect();
            let ids: Vec<&NodeId> = file_nodes.iter().map(|n| &n.id).collect();
            for id in &ids {
                edges.extend(graph.outgoing(id));
                // Incoming edges from other files are dropped by delete_file
                edges.extend(graph.incoming(id).filter(|e| !ids.contains(&&e.source)));
            }
            nodes.extend(file_nodes.iter().copied());

            let unit = format!("file:{}", path);
            let prepare = |backend: &dyn StorageBackend| {
                backend.delete_file(path)?;
                pruned.iter().try_for_each(|id| backend.delete_node(id))
            };
            let outcome = self.write_unit(&unit, prepare, &nodes, &edges)?;
            report.merge(outcome);
        }
        Ok(report)
    }

    /// Replace the whole stored graph with `graph`.
    pub fn bulk_load(&self, graph: &KnowledgeGraph) -> Result<SyncReport, EngineError> {
        let nodes: Vec<&Node> = graph.nodes().collect();
        let edges: Vec<&Edge> = graph.edges().collect();
        self.write_unit("bulk", |backend| backend.clear(), &nodes, &edges)
    }

    fn write_unit<F>(&self, unit: &str, prepare: F, nodes: &[&Node], edges: &[&Edge]) -> Result<SyncReport, EngineError>
    where
        F: FnOnce(&dyn StorageBackend) -> Result<(), StorageError>,
    {
        let backend = self.backend.as_ref();
        backend.begin(unit).map_err(EngineError::from)?;

        let mut failures = 0usize;
        let written = (|| -> Result<(), EngineError> {
            tally(unit, prepare(backend), &mut failures)?;
            for node in nodes {
                tally(unit, backend.insert_node(node), &mut failures)?;
            }
            for edge in edges {
                tally(unit, backend.insert_edge(edge), &mut failures)?;
            }
            Ok(())
        })();
        if let Err(e) = written {
            if let Err(rollback) = backend.rollback() {
                tracing::warn!(unit, error = %rollback, "rollback after lost connection failed");
            }
            tracing::error!(unit, code = e.code(), "storage unreachable, unit rolled back");
            return Err(e);
        }

        let mut report = SyncReport::default();
        if failures > self.failure_threshold {
            backend.rollback().map_err(EngineError::from)?;
            let err = EngineError::StorageThreshold {
                unit: unit.to_string(),
                failures,
                threshold: self.failure_threshold,
            };
            tracing::error!(code = err.code(), "{}", err);
            report.units_aborted.push((unit.to_string(), failures));
            return Ok(report);
        }

        backend.commit().map_err(EngineError::from)?;
        report.units_committed = 1;
        report.tolerated_failures = failures;
        if failures > 0 {
            tracing::warn!(unit, failures, "storage unit committed with failures");
        }
        Ok(report)
    }
}

/// Count a failed write; a lost connection stops the unit.
fn tally(unit: &str, result: Result<(), StorageError>, failures: &mut usize) -> Result<(), EngineError> {
    match result {
        Ok(()) => Ok(()),
        Err(StorageError::Connection(msg)) => Err(EngineError::Connection(msg)),
        Err(e) => {
            tracing::warn!(unit, error = %e, "storage write failed");
            *failures += 1;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{EdgeType, FileContribution, Label, Span};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn add_file(graph: &mut KnowledgeGraph, path: &str) {
        let file_node = Node::file(path);
        let f = Node::new(Label::Function, path, "f", "f", Span::new(1, 2));
        let edges = vec![Edge::new(file_node.id.clone(), EdgeType::Defines, f.id.clone())];
        graph.replace_file(FileContribution {
            path: path.to_string(),
            file_node,
            symbols: vec![f],
            edges,
        });
    }

    fn graph_with(paths: &[&str]) -> KnowledgeGraph {
        let mut graph = KnowledgeGraph::new();
        for path in paths {
            add_file(&mut graph, path);
        }
        graph
    }

    #[test]
    fn test_bulk_load_then_file_sync() {
        let backend = MemoryBackend::new();
        let sync = StorageSync::new(Box::new(backend.clone()), 10);
        let mut graph = graph_with(&["a.py", "b.py"]);

        let report = sync.bulk_load(&graph).unwrap();
        assert!(report.is_clean());
        assert_eq!(backend.node_count(), graph.node_count());

        graph.remove_file("b.py");
        let report = sync.sync_files(&graph, &["b.py".to_string()]).unwrap();
        assert_eq!(report.units_committed, 1);
        assert_eq!(backend.node_count(), graph.node_count());
        assert_eq!(backend.edge_count(), graph.edge_count());
    }

    #[test]
    fn test_file_sync_carries_folder_chain() {
        let backend = MemoryBackend::new();
        let sync = StorageSync::new(Box::new(backend.clone()), 10);
        let mut graph = graph_with(&["a.py"]);
        sync.bulk_load(&graph).unwrap();

        add_file(&mut graph, "pkg/sub/x.py");
        let mut folder = Params::new();
        folder.insert("id".into(), serde_json::Value::from("folder:pkg/sub"));
        sync.sync_files(&graph, &["pkg/sub/x.py".to_string()]).unwrap();
        assert_eq!(backend.node_count(), graph.node_count());
        assert_eq!(backend.edge_count(), graph.edge_count());
        assert_eq!(backend.execute_read("node_by_id", &folder).unwrap().len(), 1);

        graph.remove_file("pkg/sub/x.py");
        sync.sync_files(&graph, &["pkg/sub/x.py".to_string()]).unwrap();
        assert_eq!(backend.node_count(), graph.node_count());
        assert_eq!(backend.edge_count(), graph.edge_count());
        assert!(backend.execute_read("node_by_id", &folder).unwrap().is_empty());
    }

    #[test]
    fn test_threshold_rolls_back_unit() {
        let backend = MemoryBackend::new();
        let sync = StorageSync::new(Box::new(backend.clone()), 1);
        let graph = graph_with(&["a.py"]);
        sync.bulk_load(&graph).unwrap();
        let before = backend.node_count();

        // every write under a.py fails: 2 nodes + 1 edge
        backend.fail_writes_containing("a.py");
        let report = sync.sync_files(&graph, &["a.py".to_string()]).unwrap();
        assert_eq!(report.units_committed, 0);
        assert_eq!(report.units_aborted, vec![("file:a.py".to_string(), 3)]);
        assert_eq!(backend.node_count(), before);
    }

    #[test]
    fn test_failures_below_threshold_are_counted() {
        let backend = MemoryBackend::new();
        let sync = StorageSync::new(Box::new(backend.clone()), 10);
        backend.fail_writes_containing("function:");
        let report = sync.bulk_load(&graph_with(&["a.py", "b.py"])).unwrap();
        assert_eq!(report.units_committed, 1);
        // 2 function nodes + 2 DEFINES edges pointing at them
        assert_eq!(report.tolerated_failures, 4);
        assert!(!report.is_clean());
    }

    /// Drops the connection on the first node insert; rollback fails too.
    #[derive(Default)]
    struct DroppingBackend {
        rollbacks: Arc<AtomicUsize>,
    }

    impl StorageBackend for DroppingBackend {
        fn begin(&self, _unit: &str) -> Result<(), StorageError> {
            Ok(())
        }
        fn delete_file(&self, _path: &str) -> Result<(), StorageError> {
            Ok(())
        }
        fn delete_node(&self, _id: &NodeId) -> Result<(), StorageError> {
            Ok(())
        }
        fn clear(&self) -> Result<(), StorageError> {
            Ok(())
        }
        fn insert_node(&self, _node: &Node) -> Result<(), StorageError> {
            Err(StorageError::Connection("reset by peer".into()))
        }
        fn insert_edge(&self, _edge: &Edge) -> Result<(), StorageError> {
            Ok(())
        }
        fn commit(&self) -> Result<(), StorageError> {
            Ok(())
        }
        fn rollback(&self) -> Result<(), StorageError> {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::Connection("gone".into()))
        }
        fn execute_read(&self, _statement: &str, _params: &Params) -> Result<Vec<Row>, StorageError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_failed_rollback_keeps_connection_error() {
        let backend = DroppingBackend::default();
        let rollbacks = backend.rollbacks.clone();
        let sync = StorageSync::new(Box::new(backend), 10);
        let err = sync.sync_files(&graph_with(&["a.py"]), &["a.py".to_string()]).unwrap_err();
        assert!(matches!(&err, EngineError::Connection(msg) if msg == "reset by peer"));
        assert_eq!(rollbacks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lost_connection_is_fatal() {
        let backend = MemoryBackend::new();
        let sync = StorageSync::new(Box::new(backend.clone()), 10);
        backend.disconnect();
        let err = sync.bulk_load(&graph_with(&["a.py"])).unwrap_err();
        assert!(err.is_fatal());
    }
}
