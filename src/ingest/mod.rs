//! Parser interface and the records it produces.
//!
//! Parsing itself is pluggable: anything implementing [`SourceParser`] can
//! feed the pipeline. Records are intermediate; the file-local phases turn
//! them into nodes and edges and then drop them.

pub mod detect;

pub use detect::{detect_language, is_test_path, Language};

use serde::{Deserialize, Serialize};

use crate::graph::{Label, Span};

/// Kind of symbol extracted from source code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SymbolKind {
    Function,
    /// Function declared inside a class or interface body
    Method,
    /// Class, struct or record type
    Class,
    /// Interface, trait or protocol
    Interface,
    TypeAlias,
    Enum,
}

impl SymbolKind {
    pub fn label(&self) -> Label {
        match self {
            SymbolKind::Function => Label::Function,
            SymbolKind::Method => Label::Method,
            SymbolKind::Class => Label::Class,
            SymbolKind::Interface => Label::Interface,
            SymbolKind::TypeAlias => Label::TypeAlias,
            SymbolKind::Enum => Label::Enum,
        }
    }
}

/// One symbol definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolRecord {
    pub name: String,
    /// Name qualified by enclosing scopes inside the file (`Service.run`)
    pub qualified_name: String,
    pub kind: SymbolKind,
    pub span: Span,
    #[serde(default)]
    pub signature: Option<String>,
    /// Decorators, annotations, attributes (`@app.route`, `#[test]`)
    #[serde(default)]
    pub markers: Vec<String>,
    #[serde(default)]
    pub exported: bool,
    /// Qualified name of the enclosing class or interface, for methods
    #[serde(default)]
    pub owner: Option<String>,
}

impl SymbolRecord {
    pub fn new(kind: SymbolKind, name: &str, span: Span) -> Self {
        Self {
            name: name.to_string(),
            qualified_name: name.to_string(),
            kind,
            span,
            signature: None,
            markers: Vec::new(),
            exported: false,
            owner: None,
        }
    }

    /// A method declared in `owner`; qualified as `Owner.name`.
    pub fn method(owner: &str, name: &str, span: Span) -> Self {
        Self {
            qualified_name: format!("{}.{}", owner, name),
            owner: Some(owner.to_string()),
            ..Self::new(SymbolKind::Method, name, span)
        }
    }

    pub fn with_signature(mut self, signature: &str) -> Self {
        self.signature = Some(signature.to_string());
        self
    }

    pub fn with_marker(mut self, marker: &str) -> Self {
        self.markers.push(marker.to_string());
        self
    }

    pub fn exported(mut self) -> Self {
        self.exported = true;
        self
    }

    /// Parameter count parsed from the signature, excluding a leading
    /// receiver (`self`, `cls`, `this`, `&self`, `&mut self`).
    pub fn arity(&self) -> Option<usize> {
        signature_arity(self.signature.as_deref()?)
    }
}

/// Count the parameters in the outermost parenthesized list of `signature`.
pub fn signature_arity(signature: &str) -> Option<usize> {
    let open = signature.find('(')?;
    let mut depth = 0usize;
    let mut close = None;
    let mut prev = ' ';
    for (idx, ch) in signature[open..].char_indices() {
        let arrow = ch == '>' && matches!(prev, '-' | '=');
        prev = ch;
        match ch {
            _ if arrow => {}
            '(' | '[' | '<' | '{' => depth += 1,
            ')' | ']' | '>' | '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    close = Some(open + idx);
                    break;
                }
            }
            _ => {}
        }
    }
    let inner = &signature[open + 1..close?];

    let mut params = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    let mut prev = ' ';
    for ch in inner.chars() {
        let arrow = ch == '>' && matches!(prev, '-' | '=');
        prev = ch;
        match ch {
            _ if arrow => current.push(ch),
            '(' | '[' | '<' | '{' => {
                depth += 1;
                current.push(ch);
            }
            ')' | ']' | '>' | '}' => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            ',' if depth == 0 => {
                params.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    params.push(current);

    let count = params
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .enumerate()
        .filter(|(i, p)| {
            let receiver = matches!(*p, "self" | "cls" | "this" | "&self" | "&mut self" | "mut self")
                || p.starts_with("self:")
                || p.starts_with("this:");
            !(*i == 0 && receiver)
        })
        .count();
    Some(count)
}

/// A call site inside one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    /// Qualified name of the enclosing symbol; empty for module-level code
    pub caller: String,
    /// Callee text as written (`helper`, `self.save`, `utils.parse`)
    pub callee: String,
    /// Explicit receiver or alias when the parser separated it
    #[serde(default)]
    pub receiver: Option<String>,
    #[serde(default)]
    pub line: u32,
}

impl CallRecord {
    pub fn new(caller: &str, callee: &str) -> Self {
        Self {
            caller: caller.to_string(),
            callee: callee.to_string(),
            receiver: None,
            line: 0,
        }
    }
}

/// A name brought into scope by an import statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportedName {
    pub name: String,
    #[serde(default)]
    pub alias: Option<String>,
}

/// One import statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRecord {
    /// Module text as written (`app.router`, `./util`, `crate::db`)
    pub module: String,
    /// Names imported from the module; empty for whole-module imports
    #[serde(default)]
    pub names: Vec<ImportedName>,
    /// Alias bound to the module itself (`import numpy as np`)
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub line: u32,
}

impl ImportRecord {
    pub fn module(module: &str) -> Self {
        Self {
            module: module.to_string(),
            names: Vec::new(),
            alias: None,
            line: 0,
        }
    }

    pub fn names(module: &str, names: &[&str]) -> Self {
        Self {
            names: names
                .iter()
                .map(|n| ImportedName {
                    name: n.to_string(),
                    alias: None,
                })
                .collect(),
            ..Self::module(module)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeritageKind {
    Extends,
    Implements,
}

/// `class` declares `parent` as a base class or implemented interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeritageRecord {
    /// Qualified name of the declaring class in this file
    pub class: String,
    /// Parent name as written
    pub parent: String,
    pub kind: HeritageKind,
}

/// Where a type appears in a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeRole {
    Parameter,
    Return,
    Variable,
}

impl TypeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TypeRole::Parameter => "parameter",
            TypeRole::Return => "return",
            TypeRole::Variable => "variable",
        }
    }
}

/// A type named inside a symbol's signature or body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeRefRecord {
    /// Qualified name of the referencing symbol in this file
    pub symbol: String,
    pub type_name: String,
    pub role: TypeRole,
}

/// Everything a parser extracted from one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedFile {
    /// Repository-relative key
    pub path: String,
    pub language: Language,
    #[serde(default)]
    pub symbols: Vec<SymbolRecord>,
    #[serde(default)]
    pub calls: Vec<CallRecord>,
    #[serde(default)]
    pub imports: Vec<ImportRecord>,
    #[serde(default)]
    pub heritage: Vec<HeritageRecord>,
    #[serde(default)]
    pub type_refs: Vec<TypeRefRecord>,
}

impl ParsedFile {
    pub fn new(path: &str, language: Language) -> Self {
        Self {
            path: path.to_string(),
            language,
            symbols: Vec::new(),
            calls: Vec::new(),
            imports: Vec::new(),
            heritage: Vec::new(),
            type_refs: Vec::new(),
        }
    }
}

/// Per-file parse failure. Never aborts a batch.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ParseFailure {
    pub message: String,
}

impl ParseFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Extracts symbol, call and import records from source text.
///
/// Implementations must be pure with respect to `(path, source)`: the
/// pipeline relies on identical input yielding identical records.
pub trait SourceParser: Send + Sync {
    fn parse(&self, path: &str, language: Language, source: &str) -> Result<ParsedFile, ParseFailure>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_arity() {
        assert_eq!(signature_arity("def run(self, job, retries=3)"), Some(2));
        assert_eq!(signature_arity("def run(self)"), Some(0));
        assert_eq!(signature_arity("fn apply(&mut self, f: impl Fn(u8, u8) -> u8)"), Some(1));
        assert_eq!(signature_arity("function f(a, b: Map<string, number>)"), Some(2));
        assert_eq!(signature_arity("def f()"), Some(0));
        assert_eq!(signature_arity("no parens"), None);
    }

    #[test]
    fn test_method_record_is_qualified() {
        let rec = SymbolRecord::method("Service", "run", Span::new(3, 9));
        assert_eq!(rec.qualified_name, "Service.run");
        assert_eq!(rec.owner.as_deref(), Some("Service"));
        assert_eq!(rec.kind.label(), Label::Method);
    }

    #[test]
    fn test_parsed_file_deserializes_with_defaults() {
        let json = r#"{ "path": "a.py", "language": "Python", "symbols": [] }"#;
        let parsed: ParsedFile = serde_json::from_str(json).unwrap();
        assert!(parsed.calls.is_empty());
        assert_eq!(parsed.language, Language::Python);
    }
}
