//! Skip reasons, pipeline stages and per-file diagnostic records.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Reason why a file was not ingested.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// File is not a regular file (directory, broken symlink, ...)
    NotAFile,
    /// No parser language for this extension
    UnsupportedLanguage,
    /// Internal hard-coded ignore rules (.git/, node_modules/, ...)
    IgnoredInternal,
    /// Matched by gitignore-style rules (.gitignore, .ignore)
    IgnoredByGitignore,
    /// Excluded by a configured glob
    ExcludedByGlob,
    /// Content hash unchanged since the last ingest
    Unchanged,
}

impl SkipReason {
    /// Stable sort key for deterministic ordering.
    pub fn sort_key(&self) -> u8 {
        match self {
            SkipReason::IgnoredInternal => 0,
            SkipReason::IgnoredByGitignore => 1,
            SkipReason::ExcludedByGlob => 2,
            SkipReason::UnsupportedLanguage => 3,
            SkipReason::NotAFile => 4,
            SkipReason::Unchanged => 5,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            SkipReason::NotAFile => "not a regular file",
            SkipReason::UnsupportedLanguage => "language not supported",
            SkipReason::IgnoredInternal => "internal ignore rule",
            SkipReason::IgnoredByGitignore => "matched by gitignore",
            SkipReason::ExcludedByGlob => "excluded by pattern",
            SkipReason::Unchanged => "content unchanged",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

impl PartialOrd for SkipReason {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SkipReason {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

/// Pipeline stage a diagnostic was raised in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DiagnosticStage {
    Read,
    Parse,
    Structure,
    Imports,
    Calls,
    Heritage,
    Types,
    Community,
    Process,
    DeadCode,
    Coupling,
    Storage,
}

impl DiagnosticStage {
    pub fn sort_key(&self) -> u8 {
        match self {
            DiagnosticStage::Read => 0,
            DiagnosticStage::Parse => 1,
            DiagnosticStage::Structure => 2,
            DiagnosticStage::Imports => 3,
            DiagnosticStage::Calls => 4,
            DiagnosticStage::Heritage => 5,
            DiagnosticStage::Types => 6,
            DiagnosticStage::Community => 7,
            DiagnosticStage::Process => 8,
            DiagnosticStage::DeadCode => 9,
            DiagnosticStage::Coupling => 10,
            DiagnosticStage::Storage => 11,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            DiagnosticStage::Read => "reading file",
            DiagnosticStage::Parse => "parsing source",
            DiagnosticStage::Structure => "building structure",
            DiagnosticStage::Imports => "resolving imports",
            DiagnosticStage::Calls => "tracing calls",
            DiagnosticStage::Heritage => "resolving heritage",
            DiagnosticStage::Types => "extracting type references",
            DiagnosticStage::Community => "detecting communities",
            DiagnosticStage::Process => "detecting processes",
            DiagnosticStage::DeadCode => "classifying dead code",
            DiagnosticStage::Coupling => "computing change coupling",
            DiagnosticStage::Storage => "syncing storage",
        }
    }
}

impl fmt::Display for DiagnosticStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

impl PartialOrd for DiagnosticStage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DiagnosticStage {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

/// A skipped file or a per-file error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunDiagnostic {
    Skipped {
        /// Path relative to root
        path: String,
        reason: SkipReason,
    },
    Error {
        path: String,
        stage: DiagnosticStage,
        /// Stable error code
        code: String,
        message: String,
    },
}

impl RunDiagnostic {
    pub fn path(&self) -> &str {
        match self {
            RunDiagnostic::Skipped { path, .. } => path,
            RunDiagnostic::Error { path, .. } => path,
        }
    }

    /// Primary: path. Secondary: errors before skips. Tertiary: stage/reason.
    pub fn sort_key(&self) -> (&str, u8, u8) {
        match self {
            RunDiagnostic::Error { path, stage, .. } => (path, 0, stage.sort_key()),
            RunDiagnostic::Skipped { path, reason } => (path, 1, reason.sort_key()),
        }
    }

    pub fn skipped(path: impl Into<String>, reason: SkipReason) -> Self {
        RunDiagnostic::Skipped {
            path: path.into(),
            reason,
        }
    }

    pub fn error(
        path: impl Into<String>,
        stage: DiagnosticStage,
        code: &str,
        message: impl Into<String>,
    ) -> Self {
        RunDiagnostic::Error {
            path: path.into(),
            stage,
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RunDiagnostic::Error { .. })
    }
}

impl fmt::Display for RunDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunDiagnostic::Skipped { path, reason } => write!(f, "SKIP {}: {}", path, reason),
            RunDiagnostic::Error {
                path,
                stage,
                code,
                message,
            } => write!(f, "ERROR {} [{}]: {}: {}", path, code, stage, message),
        }
    }
}

impl PartialOrd for RunDiagnostic {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RunDiagnostic {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_reason_ord() {
        assert!(SkipReason::IgnoredInternal < SkipReason::IgnoredByGitignore);
        assert!(SkipReason::IgnoredByGitignore < SkipReason::ExcludedByGlob);
        assert!(SkipReason::NotAFile < SkipReason::Unchanged);
    }

    #[test]
    fn test_stage_order_follows_pipeline() {
        assert!(DiagnosticStage::Parse < DiagnosticStage::Imports);
        assert!(DiagnosticStage::Imports < DiagnosticStage::Calls);
        assert!(DiagnosticStage::Types < DiagnosticStage::Community);
        assert!(DiagnosticStage::DeadCode < DiagnosticStage::Coupling);
    }

    #[test]
    fn test_errors_sort_before_skips_for_same_path() {
        let error = RunDiagnostic::error("src/a.py", DiagnosticStage::Parse, "MER-PRS-001", "bad");
        let skipped = RunDiagnostic::skipped("src/a.py", SkipReason::Unchanged);
        assert!(error < skipped);

        let other = RunDiagnostic::skipped("src/0.py", SkipReason::Unchanged);
        assert!(other < error);
    }

    #[test]
    fn test_display() {
        let diag = RunDiagnostic::skipped("node_modules/x.js", SkipReason::IgnoredInternal);
        assert_eq!(diag.to_string(), "SKIP node_modules/x.js: internal ignore rule");

        let diag = RunDiagnostic::error("src/bad.py", DiagnosticStage::Parse, "MER-PRS-001", "eof");
        assert_eq!(diag.to_string(), "ERROR src/bad.py [MER-PRS-001]: parsing source: eof");
    }
}
