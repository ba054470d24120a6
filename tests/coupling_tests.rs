//! Change coupling from commit history, end to end.

mod common;

use std::sync::Arc;

use common::{commit, graph_of, FakeVcs, OutlineParser, TestRepo};
use meridian::analysis::CouplingMatrix;
use meridian::config::{CouplingSettings, EngineConfig};
use meridian::diagnostics::DiagnosticStage;
use meridian::graph::{EdgeType, NodeId};
use meridian::pipeline::{PhaseStatus, Pipeline};
use meridian::vcs::Commit;

/// A and B co-change in 4 commits; A changes in 10, B in 5. One extra
/// commit is large enough to be discarded.
fn history() -> Vec<Commit> {
    let mut commits = Vec::new();
    for i in 0..4 {
        commits.push(commit(&format!("ab{}", i), &["a.py", "b.py"]));
    }
    for i in 0..6 {
        commits.push(commit(&format!("a{}", i), &["a.py"]));
    }
    commits.push(commit("b-only", &["b.py", "c.py"]));
    // Mass refactor, discarded by the guard
    let many: Vec<String> = (0..60).map(|i| format!("gen/f{}.py", i)).collect();
    let mut files: Vec<&str> = many.iter().map(String::as_str).collect();
    files.extend(["a.py", "b.py"]);
    commits.push(commit("bulk", &files));
    commits
}

#[test]
fn test_scenario_pair_is_coupled() {
    let matrix = CouplingMatrix::from_commits(&history(), 50);
    assert_eq!(matrix.discarded_commits(), 1);
    assert_eq!(matrix.retained_commits(), 11);

    let pairs = matrix.pairs(&CouplingSettings::default());
    assert_eq!(pairs.len(), 1);
    let pair = &pairs[0];
    assert_eq!((pair.a.as_str(), pair.b.as_str()), ("a.py", "b.py"));
    assert_eq!(pair.co_changes, 4);
    assert!((pair.strength - 0.4).abs() < 1e-9);
}

#[test]
fn test_coupling_is_symmetric() {
    let matrix = CouplingMatrix::from_commits(&history(), 50);
    assert_eq!(matrix.co_changes("a.py", "b.py"), matrix.co_changes("b.py", "a.py"));
    assert_eq!(matrix.coupling("a.py", "b.py"), matrix.coupling("b.py", "a.py"));
    assert_eq!(matrix.co_changes("b.py", "c.py"), 1);
}

#[test]
fn test_pipeline_writes_coupled_with_edges() {
    let repo = TestRepo::new(&[
        ("a.py", "def a()\n"),
        ("b.py", "def b()\n"),
        ("c.py", "def c()\n"),
    ]);
    let pipeline = Pipeline::new(repo.root(), EngineConfig::default(), Arc::new(OutlineParser))
        .unwrap()
        .with_vcs(Box::new(FakeVcs::with_commits(history())));
    let report = pipeline.run_full();
    assert_eq!(
        report.phase(DiagnosticStage::Coupling).unwrap().status,
        PhaseStatus::Succeeded
    );

    let graph = graph_of(&pipeline);
    let edges: Vec<_> = graph.edges_of_type(EdgeType::CoupledWith).collect();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].source, NodeId::file("a.py"));
    assert_eq!(edges[0].target, NodeId::file("b.py"));
    assert_eq!(edges[0].prop_u64("co_changes"), Some(4));

    // Reachable from either side
    let from_b = graph
        .incoming(&NodeId::file("b.py"))
        .filter(|e| e.edge_type == EdgeType::CoupledWith)
        .count();
    assert_eq!(from_b, 1);
}

#[test]
fn test_files_missing_from_graph_are_not_coupled() {
    // b.py was deleted from the tree but still appears in history
    let repo = TestRepo::new(&[("a.py", "def a()\n")]);
    let pipeline = Pipeline::new(repo.root(), EngineConfig::default(), Arc::new(OutlineParser))
        .unwrap()
        .with_vcs(Box::new(FakeVcs::with_commits(history())));
    let report = pipeline.run_full();
    assert!(report.is_success());
    assert_eq!(graph_of(&pipeline).edges_of_type(EdgeType::CoupledWith).count(), 0);
}
