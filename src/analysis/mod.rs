//! Global analyses over the whole graph.
//!
//! Each analysis is a pure function from a graph to a result, plus an
//! `apply_*` step that replaces the analysis' own derived slice of the graph
//! wholesale. The pipeline runs each pair against a private working copy.

pub mod community;
pub mod coupling;
pub mod dead_code;
pub mod matchers;
pub mod process;

pub use community::{apply_communities, CommunityAssignment, CommunityDetector, ConnectedComponents};
pub use coupling::{apply_coupling, CouplingMatrix, CouplingPair};
pub use dead_code::{DeadCodeAnalyzer, DeadCodeReport, DeadReason};
pub use matchers::{MatcherKind, MatcherRegistry, MatcherSpec, MatcherTable};
pub use process::{apply_processes, BfsFlowDetector, Flow, ProcessDetector};
