//! Community detection over the CALLS subgraph.
//!
//! The detector is a pluggable pure function of the graph. The default
//! groups symbols into weakly connected components of the call graph.

use std::collections::{BTreeMap, BTreeSet};

use crate::graph::identity::dir_of;
use crate::graph::{Edge, EdgeType, KnowledgeGraph, Label, Node, NodeId, Span};

/// One detected community.
#[derive(Debug, Clone, PartialEq)]
pub struct CommunityAssignment {
    /// Member symbols in id order
    pub members: Vec<NodeId>,
    /// Internal edge density in `[0, 1]`
    pub cohesion: f64,
    pub label: String,
}

pub trait CommunityDetector: Send + Sync {
    fn detect(&self, graph: &KnowledgeGraph) -> Vec<CommunityAssignment>;
}

/// Weakly connected components of the CALLS graph.
#[derive(Debug, Clone)]
pub struct ConnectedComponents {
    pub min_size: usize,
}

impl Default for ConnectedComponents {
    fn default() -> Self {
        Self { min_size: 2 }
    }
}

struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // smaller index becomes the root, keeps output independent of edge order
            let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[child] = root;
        }
    }
}

impl CommunityDetector for ConnectedComponents {
    fn detect(&self, graph: &KnowledgeGraph) -> Vec<CommunityAssignment> {
        let calls: Vec<&Edge> = graph
            .edges_of_type(EdgeType::Calls)
            .filter(|e| e.source != e.target)
            .filter(|e| {
                let symbol = |id: &NodeId| graph.node(id).map(|n| n.label.is_symbol()).unwrap_or(false);
                symbol(&e.source) && symbol(&e.target)
            })
            .collect();

        let ids: BTreeSet<&NodeId> = calls.iter().flat_map(|e| [&e.source, &e.target]).collect();
        let ids: Vec<&NodeId> = ids.into_iter().collect();
        let index: BTreeMap<&NodeId, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

        let mut sets = DisjointSet::new(ids.len());
        for edge in &calls {
            sets.union(index[&edge.source], index[&edge.target]);
        }

        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for i in 0..ids.len() {
            let root = sets.find(i);
            groups.entry(root).or_default().push(i);
        }

        let mut internal: BTreeMap<usize, usize> = BTreeMap::new();
        for edge in &calls {
            let root = sets.find(index[&edge.source]);
            *internal.entry(root).or_default() += 1;
        }

        groups
            .into_iter()
            .filter(|(_, members)| members.len() >= self.min_size)
            .map(|(root, members)| {
                let n = members.len() as f64;
                let edges = internal.get(&root).copied().unwrap_or(0) as f64;
                let members: Vec<NodeId> = members.into_iter().map(|i| ids[i].clone()).collect();
                CommunityAssignment {
                    cohesion: (edges / (n * (n - 1.0))).min(1.0),
                    label: community_label(graph, &members),
                    members,
                }
            })
            .collect()
    }
}

/// Most common directory among members, or the first member's name.
fn community_label(graph: &KnowledgeGraph, members: &[NodeId]) -> String {
    let mut dirs: BTreeMap<&str, usize> = BTreeMap::new();
    for id in members {
        if let Some(node) = graph.node(id) {
            *dirs.entry(dir_of(&node.file_path)).or_default() += 1;
        }
    }
    let best = dirs
        .iter()
        .filter(|(dir, _)| !dir.is_empty())
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(dir, _)| dir.to_string());
    best.or_else(|| {
        members
            .first()
            .and_then(|id| graph.node(id))
            .map(|n| n.name.clone())
    })
    .unwrap_or_default()
}

/// Replace every Community node and MEMBER_OF edge with `assignments`.
/// Returns the number of communities written.
pub fn apply_communities(graph: &mut KnowledgeGraph, assignments: &[CommunityAssignment]) -> usize {
    graph.remove_nodes_with_label(Label::Community);
    let mut written = 0;
    for (index, assignment) in assignments.iter().enumerate() {
        let mut node = Node::new(Label::Community, "", &assignment.label, &assignment.label, Span::default())
            .with_property("cohesion", assignment.cohesion)
            .with_property("size", assignment.members.len());
        node.id = NodeId::community(index);
        let community = node.id.clone();
        if let Err(e) = graph.upsert_node(node) {
            tracing::warn!(code = e.code(), community = %community, error = %e, "community node skipped");
            continue;
        }
        for member in &assignment.members {
            if let Err(e) = graph.upsert_edge(Edge::new(member.clone(), EdgeType::MemberOf, community.clone())) {
                tracing::warn!(code = e.code(), member = %member, error = %e, "membership edge skipped");
            }
        }
        written += 1;
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with_calls(calls: &[(&str, &str)]) -> KnowledgeGraph {
        let mut graph = KnowledgeGraph::new();
        for (a, b) in calls {
            for name in [a, b] {
                let node = Node::new(Label::Function, "src/m.py", *name, *name, Span::new(1, 2));
                graph.upsert_node(node).unwrap();
            }
            graph
                .upsert_edge(Edge::new(
                    NodeId::symbol(Label::Function, "src/m.py", a),
                    EdgeType::Calls,
                    NodeId::symbol(Label::Function, "src/m.py", b),
                ))
                .unwrap();
        }
        graph
    }

    #[test]
    fn test_components_and_density() {
        let graph = graph_with_calls(&[("a", "b"), ("b", "c"), ("x", "y"), ("y", "x")]);
        let found = ConnectedComponents::default().detect(&graph);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].members.len(), 3);
        assert!((found[0].cohesion - 2.0 / 6.0).abs() < 1e-9);
        assert_eq!(found[1].members.len(), 2);
        assert!((found[1].cohesion - 1.0).abs() < 1e-9);
        assert_eq!(found[0].label, "src");
    }

    #[test]
    fn test_detection_is_deterministic() {
        let graph = graph_with_calls(&[("d", "e"), ("a", "b"), ("e", "a")]);
        let first = ConnectedComponents::default().detect(&graph);
        let second = ConnectedComponents::default().detect(&graph.clone());
        assert_eq!(first, second);
    }

    #[test]
    fn test_apply_replaces_previous_communities() {
        let mut graph = graph_with_calls(&[("a", "b"), ("c", "d")]);
        let found = ConnectedComponents::default().detect(&graph);
        assert_eq!(apply_communities(&mut graph, &found), 2);
        assert_eq!(graph.nodes_with_label(Label::Community).count(), 2);

        let fewer = &found[..1];
        apply_communities(&mut graph, fewer);
        assert_eq!(graph.nodes_with_label(Label::Community).count(), 1);
        assert_eq!(graph.edges_of_type(EdgeType::MemberOf).count(), 2);
        graph.check_integrity().unwrap();
    }

    #[test]
    fn test_apply_skips_vanished_members() {
        let mut graph = graph_with_calls(&[("a", "b")]);
        let mut found = ConnectedComponents::default().detect(&graph);
        found[0].members.push(NodeId::symbol(Label::Function, "src/m.py", "gone"));

        assert_eq!(apply_communities(&mut graph, &found), 1);
        assert_eq!(graph.edges_of_type(EdgeType::MemberOf).count(), 2);
        graph.check_integrity().unwrap();
    }
}
