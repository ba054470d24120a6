//! File filtering for discovery and watching.
//!
//! Precedence:
//! 1. Hard internal ignores (.git/, node_modules/, virtualenvs, ...)
//! 2. Gitignore-style rules (.gitignore, .ignore)
//! 3. Language detection
//! 4. Configured include globs (if any)
//! 5. Configured exclude globs
//!
//! Same inputs always produce the same decision.

use anyhow::Result;
use ignore::gitignore::Gitignore;
use std::path::{Path, PathBuf};

use crate::diagnostics::{RunDiagnostic, SkipReason};
use crate::ingest::detect_language;

/// Directories that are always ignored.
const INTERNAL_IGNORE_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".meridian",
    "target",
    "node_modules",
    ".venv",
    "venv",
    "__pycache__",
    "dist",
    "build",
];

pub struct FileFilter {
    root: PathBuf,
    gitignore: Option<Gitignore>,
    /// Empty = include all
    include_patterns: Vec<globset::GlobMatcher>,
    exclude_patterns: Vec<globset::GlobMatcher>,
}

impl FileFilter {
    /// Create a filter rooted at `root`.
    ///
    /// # Arguments
    /// * `root` - Repository root; globs and gitignore rules are relative to it
    /// * `include_patterns` - Include globs (empty = include all)
    /// * `exclude_patterns` - Exclude globs
    pub fn new(root: &Path, include_patterns: &[String], exclude_patterns: &[String]) -> Result<Self> {
        let root = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        let gitignore = Self::load_gitignore(&root)?;
        let include_patterns = Self::compile_globs(include_patterns)?;
        let exclude_patterns = Self::compile_globs(exclude_patterns)?;
        Ok(Self {
            root,
            gitignore,
            include_patterns,
            exclude_patterns,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn load_gitignore(root: &Path) -> Result<Option<Gitignore>> {
        let mut builder = ignore::gitignore::GitignoreBuilder::new(root);
        for name in [".gitignore", ".ignore"] {
            let path = root.join(name);
            if path.exists() {
                // Malformed rules are logged, not fatal
                if let Some(err) = builder.add(&path) {
                    tracing::warn!("Failed to load {}: {}", path.display(), err);
                }
            }
        }
        Ok(Some(builder.build()?))
    }

    fn compile_globs(patterns: &[String]) -> Result<Vec<globset::GlobMatcher>> {
        patterns
            .iter()
            .map(|pattern| {
                globset::Glob::new(pattern)
                    .map(|g| g.compile_matcher())
                    .map_err(|e| anyhow::anyhow!("Invalid glob pattern '{}': {}", pattern, e))
            })
            .collect()
    }

    /// Return the reason `path` should be skipped, or `None` to ingest it.
    ///
    /// Expects an existing path; deleted files are classified by the caller.
    pub fn should_skip(&self, path: &Path) -> Option<SkipReason> {
        if !path.is_file() {
            return Some(SkipReason::NotAFile);
        }
        self.should_skip_name(path)
    }

    /// Same as [`should_skip`](Self::should_skip) without touching the
    /// filesystem. Used for paths that no longer exist.
    pub fn should_skip_name(&self, path: &Path) -> Option<SkipReason> {
        let rel = self.relative_path(path);

        if Self::is_internal_ignore(&rel) {
            return Some(SkipReason::IgnoredInternal);
        }

        if let Some(ref gitignore) = self.gitignore {
            let rel_path = Path::new(&rel);
            if gitignore.matched(rel_path, false).is_ignore() {
                return Some(SkipReason::IgnoredByGitignore);
            }
            // "build/" style rules match the directory, not the file
            let mut current = rel_path.parent();
            while let Some(ancestor) = current {
                if ancestor.as_os_str().is_empty() {
                    break;
                }
                if gitignore.matched(ancestor, true).is_ignore() {
                    return Some(SkipReason::IgnoredByGitignore);
                }
                current = ancestor.parent();
            }
        }

        if detect_language(path).is_none() {
            return Some(SkipReason::UnsupportedLanguage);
        }

        if !self.include_patterns.is_empty()
            && !self.include_patterns.iter().any(|m| m.is_match(&rel))
        {
            return Some(SkipReason::ExcludedByGlob);
        }

        if self.exclude_patterns.iter().any(|m| m.is_match(&rel)) {
            return Some(SkipReason::ExcludedByGlob);
        }

        None
    }

    fn is_internal_ignore(rel: &str) -> bool {
        rel.split('/')
            .rev()
            .skip(1)
            .any(|dir| INTERNAL_IGNORE_DIRS.contains(&dir))
    }

    /// Path relative to root with forward slashes.
    fn relative_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_else(|_| path.to_string_lossy().replace('\\', "/"))
    }
}

/// Diagnostic for a skipped file.
pub fn skip_diagnostic(root: &Path, path: &Path, reason: SkipReason) -> RunDiagnostic {
    let rel_path = path
        .strip_prefix(root)
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .unwrap_or_else(|_| path.to_string_lossy().into_owned());
    RunDiagnostic::skipped(rel_path, reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (TempDir, PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let root = fs::canonicalize(temp_dir.path()).unwrap();
        (temp_dir, root)
    }

    #[test]
    fn test_internal_ignore_dirs() {
        let (_guard, root) = setup();
        fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        fs::create_dir_all(root.join(".venv/lib")).unwrap();
        fs::write(root.join("node_modules/pkg/index.js"), "x").unwrap();
        fs::write(root.join(".venv/lib/site.py"), "x").unwrap();

        let filter = FileFilter::new(&root, &[], &[]).unwrap();
        assert_eq!(
            filter.should_skip(&root.join("node_modules/pkg/index.js")),
            Some(SkipReason::IgnoredInternal)
        );
        assert_eq!(
            filter.should_skip(&root.join(".venv/lib/site.py")),
            Some(SkipReason::IgnoredInternal)
        );
    }

    #[test]
    fn test_unsupported_language() {
        let (_guard, root) = setup();
        fs::write(root.join("notes.txt"), "text").unwrap();
        let filter = FileFilter::new(&root, &[], &[]).unwrap();
        assert_eq!(
            filter.should_skip(&root.join("notes.txt")),
            Some(SkipReason::UnsupportedLanguage)
        );
    }

    #[test]
    fn test_supported_language_not_skipped() {
        let (_guard, root) = setup();
        fs::write(root.join("app.py"), "def f(): pass").unwrap();
        let filter = FileFilter::new(&root, &[], &[]).unwrap();
        assert_eq!(filter.should_skip(&root.join("app.py")), None);
    }

    #[test]
    fn test_gitignore_filtering() {
        let (_guard, root) = setup();
        fs::write(root.join(".gitignore"), "ignored.py\ngenerated/\n").unwrap();
        fs::write(root.join("ignored.py"), "x").unwrap();
        fs::write(root.join("kept.py"), "x").unwrap();
        fs::create_dir_all(root.join("generated")).unwrap();
        fs::write(root.join("generated/out.py"), "x").unwrap();

        let filter = FileFilter::new(&root, &[], &[]).unwrap();
        assert_eq!(
            filter.should_skip(&root.join("ignored.py")),
            Some(SkipReason::IgnoredByGitignore)
        );
        assert_eq!(
            filter.should_skip(&root.join("generated/out.py")),
            Some(SkipReason::IgnoredByGitignore)
        );
        assert_eq!(filter.should_skip(&root.join("kept.py")), None);
    }

    #[test]
    fn test_include_and_exclude_globs() {
        let (_guard, root) = setup();
        fs::create_dir_all(root.join("src/gen")).unwrap();
        fs::write(root.join("src/app.py"), "x").unwrap();
        fs::write(root.join("src/gen/schema.py"), "x").unwrap();
        fs::write(root.join("setup.py"), "x").unwrap();

        let filter = FileFilter::new(
            &root,
            &["src/**".to_string()],
            &["src/gen/**".to_string()],
        )
        .unwrap();
        assert_eq!(filter.should_skip(&root.join("src/app.py")), None);
        assert_eq!(
            filter.should_skip(&root.join("src/gen/schema.py")),
            Some(SkipReason::ExcludedByGlob)
        );
        assert_eq!(
            filter.should_skip(&root.join("setup.py")),
            Some(SkipReason::ExcludedByGlob)
        );
    }

    #[test]
    fn test_deleted_path_classified_by_name() {
        let (_guard, root) = setup();
        let filter = FileFilter::new(&root, &[], &[]).unwrap();
        assert_eq!(filter.should_skip_name(&root.join("gone.py")), None);
        assert_eq!(
            filter.should_skip_name(&root.join("node_modules/gone.js")),
            Some(SkipReason::IgnoredInternal)
        );
    }

    #[test]
    fn test_invalid_glob_is_error() {
        let (_guard, root) = setup();
        assert!(FileFilter::new(&root, &["src/[".to_string()], &[]).is_err());
    }
}
