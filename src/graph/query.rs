//! Read helpers layered on the store: class membership, inheritance
//! chains, confidence-aware neighbors and upstream traversal.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use super::identity::NodeId;
use super::schema::{Direction, EdgeType, Label, Node};
use super::store::KnowledgeGraph;

/// Class or interface that declares `method`, via its `owner` property.
pub fn owner_of<'g>(graph: &'g KnowledgeGraph, method: &Node) -> Option<&'g Node> {
    let owner = method.prop_str("owner")?;
    graph.node(&NodeId::from_raw(owner))
}

/// Methods declared directly on `owner`, in id order.
pub fn methods_of<'g>(graph: &'g KnowledgeGraph, owner: &Node) -> Vec<&'g Node> {
    graph
        .nodes_in_file(&owner.file_path)
        .filter(|n| n.label == Label::Method && n.prop_str("owner") == Some(owner.id.as_str()))
        .collect()
}

/// Targets of outgoing `edge_type` edges from `id`.
pub fn targets<'g>(graph: &'g KnowledgeGraph, id: &NodeId, edge_type: EdgeType) -> Vec<&'g Node> {
    graph
        .outgoing(id)
        .filter(|e| e.edge_type == edge_type)
        .filter_map(|e| graph.node(&e.target))
        .collect()
}

/// Every class reachable through EXTENDS from `class`, nearest first.
/// Cycles in malformed hierarchies are tolerated.
pub fn ancestors<'g>(graph: &'g KnowledgeGraph, class: &NodeId) -> Vec<&'g Node> {
    let mut seen = BTreeSet::new();
    seen.insert(class.clone());
    let mut queue: VecDeque<NodeId> = VecDeque::new();
    queue.push_back(class.clone());
    let mut out = Vec::new();
    while let Some(current) = queue.pop_front() {
        for parent in targets(graph, &current, EdgeType::Extends) {
            if seen.insert(parent.id.clone()) {
                out.push(parent);
                queue.push_back(parent.id.clone());
            }
        }
    }
    out
}

/// Callers of `id` with the confidence of each CALLS edge.
pub fn callers_with_confidence<'g>(graph: &'g KnowledgeGraph, id: &NodeId) -> Vec<(&'g Node, f64)> {
    graph
        .neighbors(id, &[EdgeType::Calls], Direction::Incoming)
        .into_iter()
        .map(|(e, n)| (n, e.confidence()))
        .collect()
}

/// Callees of `id` with the confidence of each CALLS edge.
pub fn callees_with_confidence<'g>(graph: &'g KnowledgeGraph, id: &NodeId) -> Vec<(&'g Node, f64)> {
    graph
        .neighbors(id, &[EdgeType::Calls], Direction::Outgoing)
        .into_iter()
        .map(|(e, n)| (n, e.confidence()))
        .collect()
}

/// Files co-changing with `path`, with coupling strength.
pub fn coupled_files<'g>(graph: &'g KnowledgeGraph, path: &str) -> Vec<(&'g Node, f64)> {
    let id = NodeId::file(path);
    graph
        .neighbors(&id, &[EdgeType::CoupledWith], Direction::Both)
        .into_iter()
        .map(|(e, n)| (n, e.prop_f64("strength").unwrap_or(0.0)))
        .collect()
}

/// Options for [`traverse_upstream`].
#[derive(Debug, Clone)]
pub struct TraversalOptions {
    pub max_depth: usize,
    /// CALLS edges below this confidence are not followed
    pub min_confidence: f64,
    pub follow_type_refs: bool,
    pub follow_coupling: bool,
}

impl Default for TraversalOptions {
    fn default() -> Self {
        Self {
            max_depth: 3,
            min_confidence: 1.0,
            follow_type_refs: true,
            follow_coupling: true,
        }
    }
}

/// Breadth-first upstream walk from `start`: callers, type users and
/// co-changing files. Returns each reached node with the depth at which
/// it was first reached, ordered by (depth, id). `start` is excluded.
pub fn traverse_upstream(
    graph: &KnowledgeGraph,
    start: &NodeId,
    options: &TraversalOptions,
) -> Vec<(NodeId, usize)> {
    let mut depths: BTreeMap<NodeId, usize> = BTreeMap::new();
    let mut frontier = vec![start.clone()];
    let mut visited = BTreeSet::new();
    visited.insert(start.clone());

    for depth in 1..=options.max_depth {
        let mut next = BTreeSet::new();
        for id in &frontier {
            for neighbor in upstream_neighbors(graph, id, options) {
                if visited.insert(neighbor.clone()) {
                    depths.insert(neighbor.clone(), depth);
                    next.insert(neighbor);
                }
            }
        }
        if next.is_empty() {
            break;
        }
        frontier = next.into_iter().collect();
    }

    let mut out: Vec<(NodeId, usize)> = depths.into_iter().collect();
    out.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    out
}

fn upstream_neighbors(graph: &KnowledgeGraph, id: &NodeId, options: &TraversalOptions) -> Vec<NodeId> {
    let mut out = Vec::new();
    for edge in graph.incoming(id) {
        match edge.edge_type {
            EdgeType::Calls if edge.confidence() >= options.min_confidence => {
                out.push(edge.source.clone())
            }
            EdgeType::UsesType if options.follow_type_refs => out.push(edge.source.clone()),
            _ => {}
        }
    }
    if options.follow_coupling {
        if let Some(node) = graph.node(id) {
            if node.label.is_file_attributed() {
                for (partner, _) in coupled_files(graph, &node.file_path) {
                    out.push(partner.id.clone());
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::schema::{Edge, Span};

    fn add(graph: &mut KnowledgeGraph, label: Label, path: &str, qn: &str) -> NodeId {
        let name = qn.rsplit('.').next().unwrap_or(qn);
        let node = Node::new(label, path, qn, name, Span::new(1, 1));
        let id = node.id.clone();
        graph.upsert_node(node).unwrap();
        id
    }

    #[test]
    fn test_ancestors_tolerate_cycles() {
        let mut graph = KnowledgeGraph::new();
        let a = add(&mut graph, Label::Class, "m.py", "A");
        let b = add(&mut graph, Label::Class, "m.py", "B");
        let c = add(&mut graph, Label::Class, "m.py", "C");
        graph.upsert_edge(Edge::new(c.clone(), EdgeType::Extends, b.clone())).unwrap();
        graph.upsert_edge(Edge::new(b.clone(), EdgeType::Extends, a.clone())).unwrap();
        graph.upsert_edge(Edge::new(a.clone(), EdgeType::Extends, c.clone())).unwrap();

        let chain: Vec<&str> = ancestors(&graph, &c).iter().map(|n| n.name.as_str()).collect();
        assert_eq!(chain, vec!["B", "A"]);
    }

    #[test]
    fn test_upstream_excludes_uncertain_calls_by_default() {
        let mut graph = KnowledgeGraph::new();
        let target = add(&mut graph, Label::Function, "a.py", "target");
        let sure = add(&mut graph, Label::Function, "b.py", "sure");
        let guess = add(&mut graph, Label::Function, "c.py", "guess");
        let far = add(&mut graph, Label::Function, "d.py", "far");
        graph.upsert_edge(Edge::new(sure.clone(), EdgeType::Calls, target.clone())).unwrap();
        graph
            .upsert_edge(Edge::new(guess.clone(), EdgeType::Calls, target.clone()).with_property("confidence", 0.5))
            .unwrap();
        graph.upsert_edge(Edge::new(far.clone(), EdgeType::Calls, sure.clone())).unwrap();

        let options = TraversalOptions {
            follow_coupling: false,
            ..Default::default()
        };
        let reached = traverse_upstream(&graph, &target, &options);
        assert_eq!(reached, vec![(sure.clone(), 1), (far.clone(), 2)]);

        let options = TraversalOptions {
            min_confidence: 0.0,
            follow_coupling: false,
            ..Default::default()
        };
        let reached = traverse_upstream(&graph, &target, &options);
        assert!(reached.contains(&(guess, 1)));
    }

    #[test]
    fn test_upstream_respects_depth() {
        let mut graph = KnowledgeGraph::new();
        let mut prev = add(&mut graph, Label::Function, "a.py", "f0");
        let start = prev.clone();
        for i in 1..6 {
            let next = add(&mut graph, Label::Function, "a.py", &format!("f{}", i));
            graph.upsert_edge(Edge::new(next.clone(), EdgeType::Calls, prev.clone())).unwrap();
            prev = next;
        }
        let options = TraversalOptions {
            max_depth: 2,
            ..Default::default()
        };
        assert_eq!(traverse_upstream(&graph, &start, &options).len(), 2);
    }
}
