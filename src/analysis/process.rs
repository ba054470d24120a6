//! Execution flow detection.
//!
//! A flow is a breadth-first walk over CALLS edges from an entry symbol.
//! Entry symbols come from the matcher registry, or are call-graph roots
//! (no callers, at least one callee) outside test files.

use std::collections::{BTreeSet, VecDeque};

use super::matchers::{MatcherKind, MatcherRegistry};
use crate::graph::{Edge, EdgeType, KnowledgeGraph, Label, Node, NodeId, Span};
use crate::ingest::{is_test_path, Language};

/// An ordered flow. `steps[0]` is the entry symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct Flow {
    pub entry: NodeId,
    pub steps: Vec<NodeId>,
}

pub trait ProcessDetector: Send + Sync {
    fn detect(&self, graph: &KnowledgeGraph, matchers: &MatcherRegistry) -> Vec<Flow>;
}

#[derive(Debug, Clone)]
pub struct BfsFlowDetector {
    pub max_depth: usize,
    pub max_steps: usize,
    /// Flows shorter than this are dropped
    pub min_steps: usize,
    /// CALLS edges below this confidence are not followed
    pub min_confidence: f64,
}

impl Default for BfsFlowDetector {
    fn default() -> Self {
        Self {
            max_depth: 10,
            max_steps: 25,
            min_steps: 2,
            min_confidence: 0.5,
        }
    }
}

impl BfsFlowDetector {
    fn entries<'g>(&self, graph: &'g KnowledgeGraph, matchers: &MatcherRegistry) -> Vec<&'g Node> {
        let mut out = Vec::new();
        for label in [Label::Function, Label::Method] {
            for node in graph.nodes_with_label(label) {
                if is_test_path(&node.file_path) {
                    continue;
                }
                let language = graph
                    .node(&NodeId::file(&node.file_path))
                    .and_then(|f| f.prop_str("language"))
                    .and_then(Language::parse);
                let registered = matchers.matches(MatcherKind::EntryPoint, node, language);
                let has_callers = graph
                    .incoming(&node.id)
                    .any(|e| e.edge_type == EdgeType::Calls && e.source != node.id);
                let has_callees = graph
                    .outgoing(&node.id)
                    .any(|e| e.edge_type == EdgeType::Calls && e.target != node.id);
                if registered || (!has_callers && has_callees) {
                    out.push(node);
                }
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    fn walk(&self, graph: &KnowledgeGraph, entry: &NodeId) -> Vec<NodeId> {
        let mut steps = vec![entry.clone()];
        let mut seen = BTreeSet::new();
        seen.insert(entry.clone());
        let mut queue = VecDeque::new();
        queue.push_back((entry.clone(), 0usize));

        while let Some((current, depth)) = queue.pop_front() {
            if depth >= self.max_depth {
                continue;
            }
            for edge in graph.outgoing(&current) {
                if edge.edge_type != EdgeType::Calls || edge.confidence() < self.min_confidence {
                    continue;
                }
                if steps.len() >= self.max_steps {
                    return steps;
                }
                if seen.insert(edge.target.clone()) {
                    steps.push(edge.target.clone());
                    queue.push_back((edge.target.clone(), depth + 1));
                }
            }
        }
        steps
    }
}

impl ProcessDetector for BfsFlowDetector {
    fn detect(&self, graph: &KnowledgeGraph, matchers: &MatcherRegistry) -> Vec<Flow> {
        self.entries(graph, matchers)
            .into_iter()
            .map(|entry| Flow {
                entry: entry.id.clone(),
                steps: self.walk(graph, &entry.id),
            })
            .filter(|flow| flow.steps.len() >= self.min_steps)
            .collect()
    }
}

/// Replace every Process node and STEP_IN_PROCESS edge with `flows`.
pub fn apply_processes(graph: &mut KnowledgeGraph, flows: &[Flow]) -> usize {
    graph.remove_nodes_with_label(Label::Process);
    let mut written = 0;
    for flow in flows {
        let Some(entry) = graph.node(&flow.entry) else {
            continue;
        };
        let name = format!("{} flow", entry.name);
        let mut node = Node::new(Label::Process, "", &name, &name, Span::default())
            .with_property("entry", flow.entry.to_string())
            .with_property("step_count", flow.steps.len());
        node.id = NodeId::process(&flow.entry);
        let process = node.id.clone();
        if let Err(e) = graph.upsert_node(node) {
            tracing::warn!(code = e.code(), process = %process, error = %e, "process node skipped");
            continue;
        }
        for (i, step) in flow.steps.iter().enumerate() {
            let edge = Edge::new(step.clone(), EdgeType::StepInProcess, process.clone())
                .with_property("step", i + 1);
            if let Err(e) = graph.upsert_edge(edge) {
                tracing::warn!(code = e.code(), step = %step, error = %e, "flow step skipped");
            }
        }
        written += 1;
    }
    written
}
