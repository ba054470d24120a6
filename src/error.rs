//! Engine error taxonomy.
//!
//! Resolution misses are not errors: an unresolved call simply produces no
//! edge. Everything else the engine can fail with is an [`EngineError`],
//! each variant mapped to a stable code from [`crate::error_codes`].

use std::time::Duration;

use crate::error_codes::*;
use crate::graph::{EdgeType, Label};

/// Result alias used across the engine.
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// One file could not be parsed. The batch continues without it.
    #[error("parse failure in {path}: {message}")]
    Parse { path: String, message: String },

    /// A node id is already taken by a node with a different label.
    #[error("identity conflict for {id}: existing {existing}, incoming {incoming}")]
    Conflict {
        id: String,
        existing: Label,
        incoming: Label,
    },

    /// An edge endpoint does not exist in the graph.
    #[error("{edge_type} edge references missing node {missing}")]
    DanglingEdge { edge_type: EdgeType, missing: String },

    /// Storage backend unreachable. Fatal for the run.
    #[error("storage backend unreachable: {0}")]
    Connection(String),

    /// External subprocess exceeded its timeout.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    /// External subprocess failed.
    #[error("external command failed: {0}")]
    External(String),

    /// A global phase failed before its working copy was complete.
    #[error("{phase} aborted, previous snapshot kept: {reason}")]
    SnapshotSwap { phase: String, reason: String },

    /// Too many storage write failures inside one mutation unit.
    #[error("storage unit {unit} aborted after {failures} write failures (threshold {threshold})")]
    StorageThreshold {
        unit: String,
        failures: usize,
        threshold: usize,
    },

    #[error("invalid ref {0:?}")]
    InvalidRef(String),

    #[error("query rejected: {0}")]
    QueryRejected(String),

    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    /// Stable diagnostic code.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Parse { .. } => MER_PRS_001_PARSE_FAILURE,
            EngineError::Conflict { .. } => MER_GRF_001_IDENTITY_CONFLICT,
            EngineError::DanglingEdge { .. } => MER_GRF_002_DANGLING_EDGE,
            EngineError::SnapshotSwap { .. } => MER_GRF_003_SNAPSHOT_SWAP,
            EngineError::Connection(_) => MER_STO_001_CONNECTION,
            EngineError::StorageThreshold { .. } => MER_STO_002_THRESHOLD_EXCEEDED,
            EngineError::Timeout { .. } => MER_VCS_001_TIMEOUT,
            EngineError::External(_) => MER_VCS_002_COMMAND_FAILED,
            EngineError::InvalidRef(_) => MER_VCS_003_INVALID_REF,
            EngineError::QueryRejected(_) => MER_QRY_001_REJECTED,
            EngineError::SymbolNotFound(_) => MER_QRY_002_SYMBOL_NOT_FOUND,
            EngineError::Config(_) => MER_CFG_001_INVALID,
            EngineError::Io { .. } => MER_IO_001_READ_FAILED,
        }
    }

    /// Soft failures skip one derived analysis for one run and keep prior
    /// results. Everything else fails the unit it happened in.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            EngineError::Timeout { .. } | EngineError::External(_) | EngineError::Parse { .. }
        )
    }

    /// Fatal for the whole run rather than one unit.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Connection(_))
    }
}
