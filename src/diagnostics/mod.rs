//! Structured diagnostics for pipeline runs.
//!
//! Deterministic, sortable records for skipped files and per-file errors,
//! collected into the run report alongside the tracing output.

pub mod run_diagnostics;

pub use run_diagnostics::{DiagnosticStage, RunDiagnostic, SkipReason};
