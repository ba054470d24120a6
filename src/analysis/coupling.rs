//! Change coupling from commit history.
//!
//! `coupling(A, B) = co_changes(A, B) / max(changes(A), changes(B))`, over
//! commits that survive the mass-change guard. Pairs are kept in one
//! canonical order so the measure is symmetric by construction.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::CouplingSettings;
use crate::graph::{Edge, EdgeType, KnowledgeGraph, NodeId};
use crate::vcs::Commit;

/// A file pair that passed both thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct CouplingPair {
    /// Lexicographically smaller key
    pub a: String,
    pub b: String,
    pub co_changes: u32,
    pub strength: f64,
}

/// Change and co-change counts over one commit window.
#[derive(Debug, Clone, Default)]
pub struct CouplingMatrix {
    changes: BTreeMap<String, u32>,
    co_changes: BTreeMap<(String, String), u32>,
    retained_commits: usize,
    discarded_commits: usize,
}

fn ordered<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl CouplingMatrix {
    /// Count commits, discarding any that touch more than
    /// `max_files_per_commit` distinct files.
    pub fn from_commits(commits: &[Commit], max_files_per_commit: usize) -> Self {
        let mut matrix = Self::default();
        for commit in commits {
            let files: BTreeSet<&str> = commit.files.iter().map(String::as_str).collect();
            if files.is_empty() {
                continue;
            }
            if files.len() > max_files_per_commit {
                tracing::debug!(commit = %commit.id, files = files.len(), "mass change discarded");
                matrix.discarded_commits += 1;
                continue;
            }
            matrix.retained_commits += 1;
            for file in &files {
                *matrix.changes.entry(file.to_string()).or_default() += 1;
            }
            let files: Vec<&str> = files.into_iter().collect();
            for (i, a) in files.iter().enumerate() {
                for b in &files[i + 1..] {
                    *matrix
                        .co_changes
                        .entry((a.to_string(), b.to_string()))
                        .or_default() += 1;
                }
            }
        }
        matrix
    }

    pub fn retained_commits(&self) -> usize {
        self.retained_commits
    }

    pub fn discarded_commits(&self) -> usize {
        self.discarded_commits
    }

    pub fn changes(&self, file: &str) -> u32 {
        self.changes.get(file).copied().unwrap_or(0)
    }

    pub fn co_changes(&self, a: &str, b: &str) -> u32 {
        let (x, y) = ordered(a, b);
        self.co_changes
            .get(&(x.to_string(), y.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn coupling(&self, a: &str, b: &str) -> f64 {
        let denominator = self.changes(a).max(self.changes(b));
        if denominator == 0 {
            return 0.0;
        }
        f64::from(self.co_changes(a, b)) / f64::from(denominator)
    }

    /// Pairs meeting both thresholds, in key order.
    pub fn pairs(&self, settings: &CouplingSettings) -> Vec<CouplingPair> {
        self.co_changes
            .iter()
            .filter(|&(_, &co)| co >= settings.min_co_changes)
            .filter_map(|((a, b), &co)| {
                let strength = self.coupling(a, b);
                (strength >= settings.min_strength).then(|| CouplingPair {
                    a: a.clone(),
                    b: b.clone(),
                    co_changes: co,
                    strength,
                })
            })
            .collect()
    }
}

/// Replace every COUPLED_WITH edge in `graph` with `pairs`. Pairs naming a
/// file the graph does not hold are dropped. Returns the edge count.
pub fn apply_coupling(graph: &mut KnowledgeGraph, pairs: &[CouplingPair]) -> usize {
    graph.remove_edges_of_type(EdgeType::CoupledWith);
    let mut written = 0;
    for pair in pairs {
        let a = NodeId::file(&pair.a);
        let b = NodeId::file(&pair.b);
        if !graph.contains_node(&a) || !graph.contains_node(&b) {
            continue;
        }
        let edge = Edge::new(a, EdgeType::CoupledWith, b)
            .with_property("strength", pair.strength)
            .with_property("co_changes", pair.co_changes);
        if graph.upsert_edge(edge).is_ok() {
            written += 1;
        }
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Node;

    fn commit(id: &str, files: &[&str]) -> Commit {
        Commit {
            id: id.to_string(),
            files: files.iter().map(|f| f.to_string()).collect(),
        }
    }

    /// A and B together in 4 of 10 commits; A in all 10, B in 5.
    fn scenario() -> Vec<Commit> {
        let mut commits = Vec::new();
        for i in 0..4 {
            commits.push(commit(&format!("ab{}", i), &["src/a.py", "src/b.py"]));
        }
        for i in 0..6 {
            commits.push(commit(&format!("a{}", i), &["src/a.py"]));
        }
        commits.push(commit("b", &["src/b.py", "README.md"]));
        commits
    }

    #[test]
    fn test_scenario_emits_edge() {
        let matrix = CouplingMatrix::from_commits(&scenario(), 50);
        assert_eq!(matrix.co_changes("src/a.py", "src/b.py"), 4);
        assert_eq!(matrix.changes("src/a.py"), 10);
        assert_eq!(matrix.changes("src/b.py"), 5);
        assert!((matrix.coupling("src/a.py", "src/b.py") - 0.4).abs() < 1e-9);

        let pairs = matrix.pairs(&CouplingSettings::default());
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].a, "src/a.py");
        assert_eq!(pairs[0].co_changes, 4);
    }

    #[test]
    fn test_symmetry() {
        let matrix = CouplingMatrix::from_commits(&scenario(), 50);
        for (x, y) in [("src/a.py", "src/b.py"), ("src/b.py", "README.md")] {
            assert_eq!(matrix.co_changes(x, y), matrix.co_changes(y, x));
            assert_eq!(matrix.coupling(x, y), matrix.coupling(y, x));
        }
    }

    #[test]
    fn test_thresholds() {
        let commits: Vec<Commit> = (0..2)
            .map(|i| commit(&format!("c{}", i), &["x.py", "y.py"]))
            .collect();
        let matrix = CouplingMatrix::from_commits(&commits, 50);
        // strength 1.0 but only 2 co-changes
        assert!(matrix.pairs(&CouplingSettings::default()).is_empty());

        let mut commits = commits;
        commits.push(commit("c2", &["x.py", "y.py"]));
        for i in 0..8 {
            commits.push(commit(&format!("x{}", i), &["x.py"]));
        }
        let matrix = CouplingMatrix::from_commits(&commits, 50);
        // 3 co-changes but strength 3/11
        assert!(matrix.pairs(&CouplingSettings::default()).is_empty());
    }

    #[test]
    fn test_mass_change_guard() {
        let big: Vec<String> = (0..60).map(|i| format!("f{}.py", i)).collect();
        let big_refs: Vec<&str> = big.iter().map(String::as_str).collect();
        let commits = vec![commit("huge", &big_refs), commit("small", &["f0.py", "f1.py"])];
        let matrix = CouplingMatrix::from_commits(&commits, 50);
        assert_eq!(matrix.retained_commits(), 1);
        assert_eq!(matrix.discarded_commits(), 1);
        assert_eq!(matrix.changes("f0.py"), 1);
        assert_eq!(matrix.changes("f30.py"), 0);
    }

    #[test]
    fn test_duplicate_paths_in_commit_count_once() {
        let commits = vec![commit("c", &["a.py", "a.py", "b.py"])];
        let matrix = CouplingMatrix::from_commits(&commits, 50);
        assert_eq!(matrix.changes("a.py"), 1);
        assert_eq!(matrix.co_changes("a.py", "b.py"), 1);
    }

    #[test]
    fn test_apply_replaces_and_skips_unknown_files() {
        let mut graph = KnowledgeGraph::new();
        for path in ["src/a.py", "src/b.py", "src/c.py"] {
            graph.upsert_node(Node::file(path)).unwrap();
        }
        let stale = CouplingPair {
            a: "src/a.py".into(),
            b: "src/c.py".into(),
            co_changes: 9,
            strength: 0.9,
        };
        assert_eq!(apply_coupling(&mut graph, &[stale]), 1);

        let pairs = vec![
            CouplingPair {
                a: "src/a.py".into(),
                b: "src/b.py".into(),
                co_changes: 4,
                strength: 0.4,
            },
            CouplingPair {
                a: "deleted.py".into(),
                b: "src/a.py".into(),
                co_changes: 5,
                strength: 1.0,
            },
        ];
        assert_eq!(apply_coupling(&mut graph, &pairs), 1);
        let edges: Vec<_> = graph.edges_of_type(EdgeType::CoupledWith).collect();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].source.as_str(), "file:src/a.py");
        assert_eq!(edges[0].prop_u64("co_changes"), Some(4));
    }
}
