//! Knowledge graph model and store.
//!
//! - [`schema`]: labels, edge types, node/edge payloads
//! - [`identity`]: deterministic ids and relative path keys
//! - [`store`]: [`KnowledgeGraph`] with per-file atomic replace
//! - [`query`]: traversal and relationship helpers
//! - [`snapshot`]: copy-on-write publication to concurrent readers
//! - [`filter`]: which files participate at all

pub mod filter;
pub mod identity;
pub mod query;
pub mod schema;
pub mod snapshot;
pub mod store;

pub use filter::FileFilter;
pub use identity::NodeId;
pub use schema::{Direction, Edge, EdgeKey, EdgeOwner, EdgeType, Label, Node, Properties, Span};
pub use snapshot::{Snapshot, SnapshotCell, SnapshotReader};
pub use store::{FileContribution, KnowledgeGraph, ReplaceOutcome};
