//! Node and edge payloads for the knowledge graph.
//!
//! Labels and edge types are closed sets. Free-form per-node data lives in
//! the property map (`serde_json::Value`), which is also what storage
//! backends receive.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::identity::NodeId;

/// Property map attached to nodes and edges. Ordered so that serialized
/// output is deterministic.
pub type Properties = BTreeMap<String, serde_json::Value>;

/// Node label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Label {
    File,
    Folder,
    Function,
    Class,
    Method,
    Interface,
    TypeAlias,
    Enum,
    Community,
    Process,
}

impl Label {
    pub const ALL: [Label; 10] = [
        Label::File,
        Label::Folder,
        Label::Function,
        Label::Class,
        Label::Method,
        Label::Interface,
        Label::TypeAlias,
        Label::Enum,
        Label::Community,
        Label::Process,
    ];

    /// Lower-case prefix used in node ids.
    pub fn as_str(&self) -> &'static str {
        match self {
            Label::File => "file",
            Label::Folder => "folder",
            Label::Function => "function",
            Label::Class => "class",
            Label::Method => "method",
            Label::Interface => "interface",
            Label::TypeAlias => "type_alias",
            Label::Enum => "enum",
            Label::Community => "community",
            Label::Process => "process",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Label> {
        Label::ALL.iter().copied().find(|l| l.as_str() == prefix)
    }

    /// Symbols are the nodes a parser produces from source text.
    pub fn is_symbol(&self) -> bool {
        matches!(
            self,
            Label::Function
                | Label::Class
                | Label::Method
                | Label::Interface
                | Label::TypeAlias
                | Label::Enum
        )
    }

    /// Labels a call expression may resolve to.
    pub fn is_callable(&self) -> bool {
        matches!(self, Label::Function | Label::Method | Label::Class)
    }

    /// Labels a type reference may resolve to.
    pub fn is_type(&self) -> bool {
        matches!(
            self,
            Label::Class | Label::Interface | Label::TypeAlias | Label::Enum
        )
    }

    /// Nodes owned by exactly one source file.
    pub fn is_file_attributed(&self) -> bool {
        *self == Label::File || self.is_symbol()
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Label::File => "File",
            Label::Folder => "Folder",
            Label::Function => "Function",
            Label::Class => "Class",
            Label::Method => "Method",
            Label::Interface => "Interface",
            Label::TypeAlias => "TypeAlias",
            Label::Enum => "Enum",
            Label::Community => "Community",
            Label::Process => "Process",
        };
        write!(f, "{}", s)
    }
}

/// Which phase family owns edges of a given type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeOwner {
    /// Written by structure/parse phases; independent of any single file's content
    Structure,
    /// Written by file-local phases; attributed to the file of the source node
    FileLocal,
    /// Written by a global phase and replaced wholesale by it
    Global,
}

/// Edge type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EdgeType {
    Contains,
    Defines,
    Calls,
    Imports,
    Extends,
    Implements,
    UsesType,
    Exports,
    MemberOf,
    StepInProcess,
    CoupledWith,
}

impl EdgeType {
    pub const ALL: [EdgeType; 11] = [
        EdgeType::Contains,
        EdgeType::Defines,
        EdgeType::Calls,
        EdgeType::Imports,
        EdgeType::Extends,
        EdgeType::Implements,
        EdgeType::UsesType,
        EdgeType::Exports,
        EdgeType::MemberOf,
        EdgeType::StepInProcess,
        EdgeType::CoupledWith,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::Contains => "CONTAINS",
            EdgeType::Defines => "DEFINES",
            EdgeType::Calls => "CALLS",
            EdgeType::Imports => "IMPORTS",
            EdgeType::Extends => "EXTENDS",
            EdgeType::Implements => "IMPLEMENTS",
            EdgeType::UsesType => "USES_TYPE",
            EdgeType::Exports => "EXPORTS",
            EdgeType::MemberOf => "MEMBER_OF",
            EdgeType::StepInProcess => "STEP_IN_PROCESS",
            EdgeType::CoupledWith => "COUPLED_WITH",
        }
    }

    pub fn parse(s: &str) -> Option<EdgeType> {
        EdgeType::ALL.iter().copied().find(|t| t.as_str() == s)
    }

    pub fn owner(&self) -> EdgeOwner {
        match self {
            EdgeType::Contains => EdgeOwner::Structure,
            EdgeType::Defines
            | EdgeType::Calls
            | EdgeType::Imports
            | EdgeType::Extends
            | EdgeType::Implements
            | EdgeType::UsesType
            | EdgeType::Exports => EdgeOwner::FileLocal,
            EdgeType::MemberOf | EdgeType::StepInProcess | EdgeType::CoupledWith => {
                EdgeOwner::Global
            }
        }
    }
}

impl fmt::Display for EdgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Inclusive 1-indexed line range of a symbol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start_line: u32,
    pub end_line: u32,
}

impl Span {
    pub fn new(start_line: u32, end_line: u32) -> Self {
        Self {
            start_line,
            end_line: end_line.max(start_line),
        }
    }

    /// Whether this span intersects the inclusive range `[start, end]`.
    pub fn overlaps(&self, start: u32, end: u32) -> bool {
        self.start_line <= end && self.end_line >= start
    }
}

/// A graph node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub label: Label,
    /// Repository-relative path, empty for Community and Process nodes
    pub file_path: String,
    pub name: String,
    pub qualified_name: String,
    pub span: Span,
    #[serde(default)]
    pub properties: Properties,
}

impl Node {
    pub fn new(
        label: Label,
        file_path: impl Into<String>,
        qualified_name: impl Into<String>,
        name: impl Into<String>,
        span: Span,
    ) -> Self {
        let file_path = file_path.into();
        let qualified_name = qualified_name.into();
        Self {
            id: NodeId::symbol(label, &file_path, &qualified_name),
            label,
            file_path,
            name: name.into(),
            qualified_name,
            span,
            properties: Properties::new(),
        }
    }

    pub fn file(path: impl Into<String>) -> Self {
        let path = path.into();
        let name = path.rsplit('/').next().unwrap_or(&path).to_string();
        Self {
            id: NodeId::file(&path),
            label: Label::File,
            file_path: path.clone(),
            name,
            qualified_name: path,
            span: Span::default(),
            properties: Properties::new(),
        }
    }

    pub fn folder(path: impl Into<String>) -> Self {
        let path = path.into();
        let name = path.rsplit('/').next().unwrap_or(&path).to_string();
        Self {
            id: NodeId::folder(&path),
            label: Label::Folder,
            file_path: path.clone(),
            name,
            qualified_name: path,
            span: Span::default(),
            properties: Properties::new(),
        }
    }

    pub fn with_property(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    pub fn prop_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(|v| v.as_str())
    }

    pub fn prop_bool(&self, key: &str) -> bool {
        self.properties
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn prop_u64(&self, key: &str) -> Option<u64> {
        self.properties.get(key).and_then(|v| v.as_u64())
    }

    /// String-array property, empty when absent.
    pub fn prop_strings(&self, key: &str) -> Vec<String> {
        match self.properties.get(key) {
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Identity of an edge: at most one edge per (source, type, target).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeKey {
    pub source: NodeId,
    pub edge_type: EdgeType,
    pub target: NodeId,
}

/// A graph edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
    pub edge_type: EdgeType,
    #[serde(default)]
    pub properties: Properties,
}

impl Edge {
    pub fn new(source: NodeId, edge_type: EdgeType, target: NodeId) -> Self {
        Self {
            source,
            target,
            edge_type,
            properties: Properties::new(),
        }
    }

    pub fn with_property(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    pub fn key(&self) -> EdgeKey {
        EdgeKey {
            source: self.source.clone(),
            edge_type: self.edge_type,
            target: self.target.clone(),
        }
    }

    /// Confidence of a CALLS edge; 1.0 for edges that carry none.
    pub fn confidence(&self) -> f64 {
        self.properties
            .get("confidence")
            .and_then(|v| v.as_f64())
            .unwrap_or(1.0)
    }

    pub fn prop_f64(&self, key: &str) -> Option<f64> {
        self.properties.get(key).and_then(|v| v.as_f64())
    }

    pub fn prop_u64(&self, key: &str) -> Option<u64> {
        self.properties.get(key).and_then(|v| v.as_u64())
    }
}

/// Traversal direction for neighbor queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
    Both,
}
