//! Language and test-file detection from paths alone.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Source languages the engine knows how to route to a parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Language {
    Python,
    JavaScript,
    TypeScript,
    Rust,
    Go,
    Java,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Rust => "rust",
            Language::Go => "go",
            Language::Java => "java",
        }
    }

    pub fn parse(s: &str) -> Option<Language> {
        match s {
            "python" => Some(Language::Python),
            "javascript" => Some(Language::JavaScript),
            "typescript" => Some(Language::TypeScript),
            "rust" => Some(Language::Rust),
            "go" => Some(Language::Go),
            "java" => Some(Language::Java),
            _ => None,
        }
    }

    /// File stems that stand for their directory when imported as a module.
    pub fn package_index_stems(&self) -> &'static [&'static str] {
        match self {
            Language::Python => &["__init__"],
            Language::JavaScript | Language::TypeScript => &["index"],
            Language::Rust => &["mod", "lib"],
            Language::Go | Language::Java => &[],
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detect language from file extension.
pub fn detect_language(path: &Path) -> Option<Language> {
    let ext = path.extension()?.to_str()?;
    match ext {
        "py" | "pyi" => Some(Language::Python),
        "js" | "jsx" | "mjs" | "cjs" => Some(Language::JavaScript),
        "ts" | "tsx" | "mts" | "cts" => Some(Language::TypeScript),
        "rs" => Some(Language::Rust),
        "go" => Some(Language::Go),
        "java" => Some(Language::Java),
        _ => None,
    }
}

/// Whether a repository-relative key names a test file by convention.
pub fn is_test_path(path: &str) -> bool {
    let with_root = format!("/{}", path);
    if with_root.contains("/tests/")
        || with_root.contains("/test/")
        || with_root.contains("/__tests__/")
        || with_root.contains("/spec/")
    {
        return true;
    }
    let file_name = path.rsplit('/').next().unwrap_or(path);
    let stem = match file_name.find('.') {
        Some(idx) => &file_name[..idx],
        None => file_name,
    };
    if stem.starts_with("test_") || stem.ends_with("_test") || stem == "conftest" {
        return true;
    }
    // foo.test.ts, foo.spec.js, FooTest.java
    let lower = file_name.to_ascii_lowercase();
    lower.contains(".test.")
        || lower.contains(".spec.")
        || (file_name.ends_with("Test.java") && file_name.len() > "Test.java".len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_language() {
        assert_eq!(detect_language(Path::new("a/b.py")), Some(Language::Python));
        assert_eq!(detect_language(Path::new("a/b.tsx")), Some(Language::TypeScript));
        assert_eq!(detect_language(Path::new("lib.rs")), Some(Language::Rust));
        assert_eq!(detect_language(Path::new("README.md")), None);
        assert_eq!(detect_language(Path::new("Makefile")), None);
    }

    #[test]
    fn test_is_test_path() {
        assert!(is_test_path("tests/test_auth.py"));
        assert!(is_test_path("src/auth_test.go"));
        assert!(is_test_path("src/auth.spec.ts"));
        assert!(is_test_path("web/__tests__/app.js"));
        assert!(is_test_path("src/main/java/AuthTest.java"));
        assert!(is_test_path("conftest.py"));

        assert!(!is_test_path("src/app/router.py"));
        assert!(!is_test_path("src/contest.py"));
        assert!(!is_test_path("src/Test.java"));
    }

    #[test]
    fn test_language_roundtrip() {
        for lang in [Language::Python, Language::Rust, Language::TypeScript] {
            assert_eq!(Language::parse(lang.as_str()), Some(lang));
        }
    }
}
