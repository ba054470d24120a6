//! Structural comparison of two refs.
//!
//! Each ref is checked out into its own temporary worktree and indexed by
//! its own pipeline with a private graph. The two pipelines run in
//! parallel and share nothing mutable. Worktrees are removed on every
//! exit path.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use crate::config::EngineConfig;
use crate::graph::{EdgeKey, KnowledgeGraph, NodeId};
use crate::ingest::SourceParser;
use crate::pipeline::{Pipeline, RunOutcome, RunReport};
use crate::validation::validate_ref;
use crate::vcs::VersionControl;

/// Differences between the graphs of `base` and `head`.
#[derive(Debug, Clone, Serialize)]
pub struct BranchComparison {
    pub base: String,
    pub head: String,
    pub added_nodes: Vec<NodeId>,
    pub removed_nodes: Vec<NodeId>,
    /// Present in both with different span, name or properties
    pub changed_nodes: Vec<NodeId>,
    pub added_edges: Vec<EdgeKey>,
    pub removed_edges: Vec<EdgeKey>,
    pub base_outcome: RunOutcome,
    pub head_outcome: RunOutcome,
}

impl BranchComparison {
    pub fn is_identical(&self) -> bool {
        self.added_nodes.is_empty()
            && self.removed_nodes.is_empty()
            && self.changed_nodes.is_empty()
            && self.added_edges.is_empty()
            && self.removed_edges.is_empty()
    }
}

/// A checked-out worktree, removed again on drop.
struct Worktree<'a> {
    vcs: &'a dyn VersionControl,
    path: PathBuf,
    // Keeps the parent directory alive until the worktree is gone
    _dir: TempDir,
}

impl<'a> Worktree<'a> {
    fn create(vcs: &'a dyn VersionControl, git_ref: &str) -> Result<Self> {
        let dir = TempDir::new().context("cannot create temporary directory for worktree")?;
        let path = dir.path().join("tree");
        vcs.create_worktree(git_ref, &path)
            .map_err(crate::error::EngineError::from)
            .with_context(|| format!("cannot check out {}", git_ref))?;
        Ok(Self { vcs, path, _dir: dir })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Worktree<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.vcs.remove_worktree(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "worktree cleanup failed");
        }
    }
}

/// Index `base` and `head` side by side and diff the resulting graphs.
///
/// Both refs are validated before anything touches the repository.
pub fn compare_branches(
    vcs: &dyn VersionControl,
    base: &str,
    head: &str,
    config: &EngineConfig,
    parser: Arc<dyn SourceParser>,
) -> Result<BranchComparison> {
    validate_ref(base)?;
    validate_ref(head)?;

    let base_tree = Worktree::create(vcs, base)?;
    let head_tree = Worktree::create(vcs, head)?;
    tracing::info!(base, head, "comparing refs");

    let (base_run, head_run) = rayon::join(
        || index_tree(base_tree.path(), config.clone(), Arc::clone(&parser)),
        || index_tree(head_tree.path(), config.clone(), Arc::clone(&parser)),
    );
    let (base_graph, base_report) = base_run.with_context(|| format!("indexing {} failed", base))?;
    let (head_graph, head_report) = head_run.with_context(|| format!("indexing {} failed", head))?;

    let mut comparison = diff_graphs(&base_graph, &head_graph);
    comparison.base = base.to_string();
    comparison.head = head.to_string();
    comparison.base_outcome = base_report.outcome;
    comparison.head_outcome = head_report.outcome;
    tracing::info!(
        added = comparison.added_nodes.len(),
        removed = comparison.removed_nodes.len(),
        changed = comparison.changed_nodes.len(),
        "comparison done"
    );
    Ok(comparison)
}

fn index_tree(root: &Path, config: EngineConfig, parser: Arc<dyn SourceParser>) -> Result<(KnowledgeGraph, RunReport)> {
    let pipeline = Pipeline::new(root, config, parser)?;
    let report = pipeline.run_full();
    if let RunOutcome::Failure { reason } = &report.outcome {
        anyhow::bail!("{}", reason);
    }
    let graph = pipeline.snapshots().working_copy();
    Ok((graph, report))
}

/// Node and edge differences from `base` to `head`, ids in sorted order.
pub fn diff_graphs(base: &KnowledgeGraph, head: &KnowledgeGraph) -> BranchComparison {
    let mut added_nodes = Vec::new();
    let mut changed_nodes = Vec::new();
    for node in head.nodes() {
        match base.node(&node.id) {
            None => added_nodes.push(node.id.clone()),
            Some(old) if old != node => changed_nodes.push(node.id.clone()),
            Some(_) => {}
        }
    }
    let mut removed_nodes: Vec<NodeId> = base
        .nodes()
        .filter(|n| !head.contains_node(&n.id))
        .map(|n| n.id.clone())
        .collect();

    let mut added_edges: Vec<EdgeKey> = head
        .edges()
        .map(|e| e.key())
        .filter(|k| base.edge(k).is_none())
        .collect();
    let mut removed_edges: Vec<EdgeKey> = base
        .edges()
        .map(|e| e.key())
        .filter(|k| head.edge(k).is_none())
        .collect();

    added_nodes.sort();
    changed_nodes.sort();
    removed_nodes.sort();
    added_edges.sort();
    removed_edges.sort();

    BranchComparison {
        base: String::new(),
        head: String::new(),
        added_nodes,
        removed_nodes,
        changed_nodes,
        added_edges,
        removed_edges,
        base_outcome: RunOutcome::Success,
        head_outcome: RunOutcome::Success,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Edge, EdgeType, Label, Node, Span};

    fn graph(functions: &[(&str, u32)], calls: &[(&str, &str)]) -> KnowledgeGraph {
        let mut graph = KnowledgeGraph::new();
        graph.upsert_node(Node::file("app.py")).unwrap();
        for (name, line) in functions {
            graph
                .upsert_node(Node::new(Label::Function, "app.py", *name, *name, Span::new(*line, *line + 2)))
                .unwrap();
        }
        for (from, to) in calls {
            graph
                .upsert_edge(Edge::new(
                    NodeId::symbol(Label::Function, "app.py", from),
                    EdgeType::Calls,
                    NodeId::symbol(Label::Function, "app.py", to),
                ))
                .unwrap();
        }
        graph
    }

    #[test]
    fn test_diff_graphs() {
        let base = graph(&[("main", 1), ("old", 5), ("shared", 10)], &[("main", "old")]);
        let head = graph(&[("main", 1), ("new", 5), ("shared", 20)], &[("main", "new")]);
        let diff = diff_graphs(&base, &head);

        assert_eq!(diff.added_nodes, vec![NodeId::from_raw("function:app.py:new")]);
        assert_eq!(diff.removed_nodes, vec![NodeId::from_raw("function:app.py:old")]);
        assert_eq!(diff.changed_nodes, vec![NodeId::from_raw("function:app.py:shared")]);
        assert_eq!(diff.added_edges.len(), 1);
        assert_eq!(diff.removed_edges[0].target, NodeId::from_raw("function:app.py:old"));
        assert!(!diff.is_identical());
        assert!(diff_graphs(&base, &base).is_identical());
    }
}
