//! Meridian: an incremental code knowledge graph.
//!
//! Meridian keeps a typed graph of a codebase (files, symbols, imports,
//! calls, inheritance, type references, execution flows, change coupling)
//! and keeps it current while files change, without ever showing a reader
//! a half-applied update.
//!
//! # Layout
//!
//! - [`graph`]: node/edge model, the in-memory store, copy-on-write snapshots
//! - [`ingest`]: parser interface and the records parsers produce
//! - [`resolve`]: call resolution with confidence scores
//! - [`analysis`]: dead code, change coupling, communities, processes
//! - [`pipeline`]: file-local and global phases, full and incremental runs
//! - [`indexer`] / [`watcher`]: live reindexing from filesystem events
//! - [`query`]: search, context, blast radius, change detection
//! - [`storage`] / [`vcs`] / [`branch`]: external collaborators
//!
//! # Position Conventions
//!
//! Line numbers in spans are 1-indexed and inclusive. File keys are
//! repository-relative with `/` separators.

pub mod analysis;
pub mod branch;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod error_codes;
pub mod graph;
pub mod indexer;
pub mod ingest;
pub mod logging;
pub mod pipeline;
pub mod query;
pub mod resolve;
pub mod storage;
pub mod validation;
pub mod vcs;
pub mod watcher;

pub use analysis::{
    CommunityDetector, CouplingMatrix, DeadCodeAnalyzer, DeadReason, MatcherRegistry, ProcessDetector,
};
pub use branch::{compare_branches, BranchComparison};
pub use config::EngineConfig;
pub use diagnostics::{DiagnosticStage, RunDiagnostic, SkipReason};
pub use error::{EngineError, EngineResult};
pub use graph::{
    Edge, EdgeType, FileFilter, KnowledgeGraph, Label, Node, NodeId, Snapshot, SnapshotCell, SnapshotReader, Span,
};
pub use indexer::{BatchSummary, ChangeKind, WatchCoordinator};
pub use ingest::{detect_language, Language, ParsedFile, SourceParser};
pub use pipeline::{GlobalMode, Pipeline, RunMode, RunOutcome, RunReport};
pub use query::{GroupedSearch, QueryError, QueryService};
pub use resolve::CallResolver;
pub use storage::{MemoryBackend, StorageBackend, StorageSync};
pub use validation::{validate_file_key, validate_path_within_root, validate_ref, PathValidationError};
pub use vcs::{GitCli, VersionControl};
pub use watcher::{FileSystemWatcher, WatcherBatch, WatcherConfig};
