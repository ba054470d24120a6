//! Unified diff to affected symbols.

use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use super::NodeSummary;
use crate::graph::KnowledgeGraph;

fn file_header() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^diff --git a/(.+?) b/(.+?)$").ok())
        .as_ref()
}

fn new_file_marker() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\+\+\+ b/(.+?)\s*$").ok()).as_ref()
}

fn hunk_header() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^@@ -\d+(?:,\d+)? \+(\d+)(?:,(\d+))? @@").ok())
        .as_ref()
}

/// Changed line ranges (inclusive, new-file numbering) per path, in path
/// order. A hunk that only deletes lines marks the line it deleted at.
pub fn parse_unified_diff(text: &str) -> BTreeMap<String, Vec<(u32, u32)>> {
    let mut changed: BTreeMap<String, Vec<(u32, u32)>> = BTreeMap::new();
    let (Some(file_re), Some(plus_re), Some(hunk_re)) = (file_header(), new_file_marker(), hunk_header()) else {
        return changed;
    };

    let mut current: Option<String> = None;
    for line in text.lines() {
        if let Some(caps) = file_re.captures(line) {
            let path = caps[2].to_string();
            changed.entry(path.clone()).or_default();
            current = Some(path);
            continue;
        }
        // Diffs without a `diff --git` line still name the file here
        if let Some(caps) = plus_re.captures(line) {
            let path = caps[1].to_string();
            if current.as_deref() != Some(path.as_str()) {
                changed.entry(path.clone()).or_default();
                current = Some(path);
            }
            continue;
        }
        if let (Some(caps), Some(path)) = (hunk_re.captures(line), current.as_ref()) {
            let start: u32 = caps[1].parse().unwrap_or(0);
            let count: u32 = caps.get(2).and_then(|m| m.as_str().parse().ok()).unwrap_or(1);
            let start = start.max(1);
            let end = start.saturating_add(count.max(1) - 1);
            if let Some(ranges) = changed.get_mut(path) {
                ranges.push((start, end));
            }
        }
    }
    changed
}

#[derive(Debug, Clone, Serialize)]
pub struct ChangedFile {
    pub path: String,
    pub ranges: Vec<(u32, u32)>,
    /// Symbols whose span overlaps a changed range, in line order
    pub symbols: Vec<NodeSummary>,
    /// Whether the graph knows this file at all
    pub indexed: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChangeImpact {
    pub files: Vec<ChangedFile>,
}

impl ChangeImpact {
    pub fn total_symbols(&self) -> usize {
        self.files.iter().map(|f| f.symbols.len()).sum()
    }
}

pub(crate) fn map_changes(graph: &KnowledgeGraph, changed: &BTreeMap<String, Vec<(u32, u32)>>) -> ChangeImpact {
    let files = changed
        .iter()
        .map(|(path, ranges)| {
            let mut symbols: Vec<NodeSummary> = graph
                .nodes_in_file(path)
                .filter(|n| n.label.is_symbol() && n.span.start_line > 0)
                .filter(|n| ranges.iter().any(|&(s, e)| n.span.overlaps(s, e)))
                .map(NodeSummary::from)
                .collect();
            symbols.sort_by(|a, b| a.start_line.cmp(&b.start_line).then_with(|| a.id.cmp(&b.id)));
            ChangedFile {
                path: path.clone(),
                ranges: ranges.clone(),
                symbols,
                indexed: graph.contains_node(&crate::graph::NodeId::file(path)),
            }
        })
        .collect();
    ChangeImpact { files }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Label, Node, Span};

    const DIFF: &str = "\
diff --git a/src/auth.py b/src/auth.py
index 1111111..2222222 100644
--- a/src/auth.py
+++ b/src/auth.py
@@ -10,3 +10,4 @@ def login():
+    check()
@@ -40 +41 @@ def logout():
-    pass
+    return None
diff --git a/docs/readme.md b/docs/readme.md
--- a/docs/readme.md
+++ b/docs/readme.md
@@ -1,2 +1,0 @@
";

    #[test]
    fn test_parse_ranges() {
        let changed = parse_unified_diff(DIFF);
        assert_eq!(changed["src/auth.py"], vec![(10, 13), (41, 41)]);
        assert_eq!(changed["docs/readme.md"], vec![(1, 1)]);
    }

    #[test]
    fn test_oversized_hunk_is_clamped() {
        let changed = parse_unified_diff("+++ b/x.py\n@@ -1 +4294967290,100 @@\n");
        assert_eq!(changed["x.py"], vec![(4294967290, u32::MAX)]);
    }

    #[test]
    fn test_plus_header_without_git_line() {
        let changed = parse_unified_diff("--- a/x.py\n+++ b/x.py\n@@ -1 +1,2 @@\n");
        assert_eq!(changed["x.py"], vec![(1, 2)]);
    }

    #[test]
    fn test_map_to_overlapping_symbols() {
        let mut graph = KnowledgeGraph::new();
        graph.upsert_node(Node::file("src/auth.py")).unwrap();
        for (name, start, end) in [("login", 8, 20), ("helper", 25, 30), ("logout", 40, 45)] {
            graph
                .upsert_node(Node::new(Label::Function, "src/auth.py", name, name, Span::new(start, end)))
                .unwrap();
        }
        let impact = map_changes(&graph, &parse_unified_diff(DIFF));
        let auth = impact.files.iter().find(|f| f.path == "src/auth.py").unwrap();
        let names: Vec<&str> = auth.symbols.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["login", "logout"]);
        assert!(auth.indexed);
        assert_eq!(impact.total_symbols(), 2);

        let docs = impact.files.iter().find(|f| f.path == "docs/readme.md").unwrap();
        assert!(!docs.indexed);
    }
}
