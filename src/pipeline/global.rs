//! Global phases: communities, processes, dead code, change coupling.
//!
//! Each phase takes its own working copy of the published graph, rewrites
//! only the edges and nodes it owns, checks integrity, and publishes. A
//! phase that fails leaves the previous snapshot (and so the previous
//! results of that phase) in place; later phases still run.

use chrono::Utc;
use std::time::Instant;

use super::{PhaseReport, PhaseStatus};
use crate::analysis::{
    apply_communities, apply_coupling, apply_processes, CommunityDetector, CouplingMatrix, DeadCodeAnalyzer,
    MatcherRegistry, ProcessDetector,
};
use crate::config::CouplingSettings;
use crate::diagnostics::DiagnosticStage;
use crate::error::{EngineError, EngineResult};
use crate::graph::{KnowledgeGraph, SnapshotCell};
use crate::vcs::{lookback_start, VersionControl};

/// What the global phases need from the pipeline.
pub struct GlobalContext<'a> {
    pub cell: &'a SnapshotCell,
    pub matchers: &'a MatcherRegistry,
    pub community: &'a dyn CommunityDetector,
    pub process: &'a dyn ProcessDetector,
    pub vcs: Option<&'a dyn VersionControl>,
    pub coupling: &'a CouplingSettings,
}

/// Run every global phase in order. One report per phase.
pub fn run_global_phases(ctx: &GlobalContext<'_>) -> Vec<PhaseReport> {
    let mut reports = Vec::with_capacity(4);

    reports.push(run_phase(ctx.cell, DiagnosticStage::Community, |graph| {
        let assignments = ctx.community.detect(graph);
        Ok(apply_communities(graph, &assignments))
    }));

    reports.push(run_phase(ctx.cell, DiagnosticStage::Process, |graph| {
        let flows = ctx.process.detect(graph, ctx.matchers);
        Ok(apply_processes(graph, &flows))
    }));

    reports.push(run_phase(ctx.cell, DiagnosticStage::DeadCode, |graph| {
        let report = DeadCodeAnalyzer::new(ctx.matchers).analyze(graph);
        Ok(DeadCodeAnalyzer::apply(&report, graph))
    }));

    match ctx.vcs {
        Some(vcs) => reports.push(run_phase(ctx.cell, DiagnosticStage::Coupling, |graph| {
            coupling_phase(graph, vcs, ctx.coupling)
        })),
        None => reports.push(PhaseReport {
            phase: DiagnosticStage::Coupling,
            status: PhaseStatus::Skipped {
                reason: "no version control configured".to_string(),
            },
            duration_ms: 0,
            items: 0,
        }),
    }

    reports
}

fn coupling_phase(
    graph: &mut KnowledgeGraph,
    vcs: &dyn VersionControl,
    settings: &CouplingSettings,
) -> EngineResult<usize> {
    let since = lookback_start(Utc::now(), settings.lookback_months);
    let commits = vcs.log(since, &[])?;
    let matrix = CouplingMatrix::from_commits(&commits, settings.max_files_per_commit);
    tracing::debug!(
        retained = matrix.retained_commits(),
        discarded = matrix.discarded_commits(),
        "commit window loaded"
    );
    Ok(apply_coupling(graph, &matrix.pairs(settings)))
}

/// Run `work` on a fresh working copy and publish it if it succeeds and the
/// result is consistent.
///
/// Soft errors (timeouts, external command failures) skip the phase; any
/// other error, or a graph that fails its integrity check, discards the
/// copy and reports the phase failed.
pub fn run_phase<F>(cell: &SnapshotCell, phase: DiagnosticStage, work: F) -> PhaseReport
where
    F: FnOnce(&mut KnowledgeGraph) -> EngineResult<usize>,
{
    let start = Instant::now();
    let mut graph = cell.working_copy();

    let status = match work(&mut graph).and_then(|items| graph.check_integrity().map(|()| items)) {
        Ok(items) => {
            let generation = cell.publish(graph);
            tracing::debug!(phase = %phase, items, generation, "global phase published");
            return PhaseReport {
                phase,
                status: PhaseStatus::Succeeded,
                duration_ms: start.elapsed().as_millis() as u64,
                items,
            };
        }
        Err(e) if e.is_soft() => {
            tracing::warn!(phase = %phase, code = e.code(), error = %e, "global phase skipped");
            PhaseStatus::Skipped { reason: e.to_string() }
        }
        Err(e) => {
            let err = EngineError::SnapshotSwap {
                phase: phase.description().to_string(),
                reason: e.to_string(),
            };
            tracing::error!(code = err.code(), "{}", err);
            PhaseStatus::Failed { reason: err.to_string() }
        }
    };

    PhaseReport {
        phase,
        status,
        duration_ms: start.elapsed().as_millis() as u64,
        items: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Edge, EdgeType, Label, Node, NodeId, Span};
    use crate::vcs::{Commit, VcsError};
    use chrono::DateTime;
    use std::path::Path;
    use std::time::Duration;

    fn seeded() -> std::sync::Arc<SnapshotCell> {
        let mut graph = KnowledgeGraph::new();
        for path in ["a.py", "b.py"] {
            graph.upsert_node(Node::file(path)).unwrap();
        }
        SnapshotCell::new(graph)
    }

    struct FixedLog(Vec<Commit>);

    impl VersionControl for FixedLog {
        fn log(&self, _since: DateTime<Utc>, _paths: &[String]) -> Result<Vec<Commit>, VcsError> {
            Ok(self.0.clone())
        }
        fn create_worktree(&self, _git_ref: &str, _dest: &Path) -> Result<(), VcsError> {
            Ok(())
        }
        fn remove_worktree(&self, _dest: &Path) -> Result<(), VcsError> {
            Ok(())
        }
    }

    struct SlowLog;

    impl VersionControl for SlowLog {
        fn log(&self, _since: DateTime<Utc>, _paths: &[String]) -> Result<Vec<Commit>, VcsError> {
            Err(VcsError::Timeout {
                command: "git log".into(),
                timeout: Duration::from_secs(30),
            })
        }
        fn create_worktree(&self, _git_ref: &str, _dest: &Path) -> Result<(), VcsError> {
            Ok(())
        }
        fn remove_worktree(&self, _dest: &Path) -> Result<(), VcsError> {
            Ok(())
        }
    }

    #[test]
    fn test_successful_phase_publishes() {
        let cell = seeded();
        let before = cell.generation();
        let report = run_phase(&cell, DiagnosticStage::Community, |graph| {
            graph.upsert_node(Node::new(Label::Function, "a.py", "f", "f", Span::new(1, 2)))?;
            Ok(1)
        });
        assert_eq!(report.status, PhaseStatus::Succeeded);
        assert_eq!(cell.generation(), before + 1);
    }

    #[test]
    fn test_dangling_edge_fails_phase() {
        let cell = seeded();
        let report = run_phase(&cell, DiagnosticStage::Process, |graph| {
            graph.upsert_edge(Edge::new(
                NodeId::file("a.py"),
                EdgeType::StepInProcess,
                NodeId::from_raw("process:missing"),
            ))?;
            Ok(1)
        });
        match report.status {
            PhaseStatus::Failed { reason } => assert!(reason.contains("process:missing")),
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(cell.generation(), 0);
    }

    #[test]
    fn test_error_discards_copy() {
        let cell = seeded();
        let before = cell.generation();
        let report = run_phase(&cell, DiagnosticStage::DeadCode, |graph| {
            graph.remove_file("a.py");
            Err(EngineError::Config("boom".into()))
        });
        assert!(matches!(report.status, PhaseStatus::Failed { .. }));
        assert_eq!(cell.generation(), before);
        assert!(cell.load().graph().contains_node(&NodeId::file("a.py")));
    }

    #[test]
    fn test_vcs_timeout_skips_coupling_and_keeps_edges() {
        let cell = seeded();
        let mut graph = cell.working_copy();
        graph
            .upsert_edge(
                Edge::new(NodeId::file("a.py"), EdgeType::CoupledWith, NodeId::file("b.py"))
                    .with_property("strength", 0.8),
            )
            .unwrap();
        cell.publish(graph);

        let settings = CouplingSettings::default();
        let report = run_phase(&cell, DiagnosticStage::Coupling, |g| coupling_phase(g, &SlowLog, &settings));
        assert!(matches!(report.status, PhaseStatus::Skipped { .. }));
        assert_eq!(cell.load().graph().edges_of_type(EdgeType::CoupledWith).count(), 1);
    }

    #[test]
    fn test_coupling_phase_replaces_edges() {
        let cell = seeded();
        let commits: Vec<Commit> = (0..3)
            .map(|i| Commit {
                id: format!("c{}", i),
                files: vec!["a.py".into(), "b.py".into()],
            })
            .collect();
        let settings = CouplingSettings::default();
        let vcs = FixedLog(commits);
        let report = run_phase(&cell, DiagnosticStage::Coupling, |g| coupling_phase(g, &vcs, &settings));
        assert_eq!(report.status, PhaseStatus::Succeeded);
        assert_eq!(report.items, 1);
        let snapshot = cell.load();
        let edge = snapshot.graph().edges_of_type(EdgeType::CoupledWith).next().unwrap();
        assert_eq!(edge.source, NodeId::file("a.py"));
        assert_eq!(edge.prop_f64("strength"), Some(1.0));
    }
}
