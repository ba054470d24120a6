//! Version control access: commit logs for change coupling and isolated
//! worktrees for branch comparison.
//!
//! Every subprocess runs under a timeout and is killed when it expires.
//! A timeout or failure is soft for the caller: the analysis that needed
//! it is skipped and prior results stay in place.

use chrono::{DateTime, Utc};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use wait_timeout::ChildExt;

use crate::error::EngineError;
use crate::validation::validate_ref;

/// Record separator emitted before each commit by the log format.
const RECORD_SEPARATOR: char = '\u{1e}';

/// One commit and the files it changed, as repository-relative keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub id: String,
    pub files: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    #[error("{command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("{command} exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("cannot run git: {0}")]
    Spawn(#[from] std::io::Error),

    #[error(transparent)]
    InvalidRef(#[from] EngineError),
}

impl From<VcsError> for EngineError {
    fn from(err: VcsError) -> Self {
        match err {
            VcsError::Timeout { command, timeout } => EngineError::Timeout {
                operation: command,
                timeout,
            },
            VcsError::InvalidRef(inner) => inner,
            other => EngineError::External(other.to_string()),
        }
    }
}

pub trait VersionControl: Send + Sync {
    /// Non-merge commits since `since`, optionally limited to `paths`.
    fn log(&self, since: DateTime<Utc>, paths: &[String]) -> Result<Vec<Commit>, VcsError>;

    /// Check out `git_ref` into a new detached worktree at `dest`.
    fn create_worktree(&self, git_ref: &str, dest: &Path) -> Result<(), VcsError>;

    fn remove_worktree(&self, dest: &Path) -> Result<(), VcsError>;
}

/// `git` command-line adapter.
#[derive(Debug, Clone)]
pub struct GitCli {
    repo: PathBuf,
    timeout: Duration,
}

impl GitCli {
    pub fn new(repo: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            repo: repo.into(),
            timeout,
        }
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    /// Run `git -C <repo> <args>` and return stdout.
    fn run(&self, args: &[String]) -> Result<String, VcsError> {
        let command = format!("git {}", args.first().map(String::as_str).unwrap_or_default());
        let mut child = Command::new("git")
            .arg("-C")
            .arg(&self.repo)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Drain both pipes while waiting so a large log cannot fill the
        // pipe buffer and stall the child past the timeout.
        let stdout_reader = child.stdout.take().map(|mut out| {
            thread::spawn(move || {
                let mut buf = String::new();
                let _ = out.read_to_string(&mut buf);
                buf
            })
        });
        let stderr_reader = child.stderr.take().map(|mut err| {
            thread::spawn(move || {
                let mut buf = String::new();
                let _ = err.read_to_string(&mut buf);
                buf
            })
        });

        let status = match child.wait_timeout(self.timeout)? {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                tracing::warn!(command = %command, timeout = ?self.timeout, "git timed out, killed");
                return Err(VcsError::Timeout {
                    command,
                    timeout: self.timeout,
                });
            }
        };

        let stdout = stdout_reader
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        let stderr = stderr_reader
            .and_then(|h| h.join().ok())
            .unwrap_or_default();

        if !status.success() {
            return Err(VcsError::Failed {
                command,
                status: status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(stdout)
    }
}

/// Arguments for a log query. Paths always follow `--`.
pub fn log_args(since: DateTime<Utc>, paths: &[String]) -> Vec<String> {
    let mut args = vec![
        "log".to_string(),
        "--no-merges".to_string(),
        format!("--since={}", since.to_rfc3339()),
        "--name-only".to_string(),
        "--format=%x1e%H".to_string(),
        "--".to_string(),
    ];
    args.extend(paths.iter().cloned());
    args
}

/// Parse `git log --name-only --format=%x1e%H` output.
pub fn parse_log(output: &str) -> Vec<Commit> {
    output
        .split(RECORD_SEPARATOR)
        .filter_map(|record| {
            let mut lines = record.lines().map(str::trim).filter(|l| !l.is_empty());
            let id = lines.next()?.to_string();
            let files = lines.map(|l| l.replace('\\', "/")).collect();
            Some(Commit { id, files })
        })
        .collect()
}

impl VersionControl for GitCli {
    fn log(&self, since: DateTime<Utc>, paths: &[String]) -> Result<Vec<Commit>, VcsError> {
        let output = self.run(&log_args(since, paths))?;
        let commits = parse_log(&output);
        tracing::debug!(commits = commits.len(), "git log parsed");
        Ok(commits)
    }

    fn create_worktree(&self, git_ref: &str, dest: &Path) -> Result<(), VcsError> {
        let git_ref = validate_ref(git_ref)?;
        self.run(&[
            "worktree".to_string(),
            "add".to_string(),
            "--detach".to_string(),
            dest.to_string_lossy().to_string(),
            git_ref.to_string(),
        ])?;
        Ok(())
    }

    fn remove_worktree(&self, dest: &Path) -> Result<(), VcsError> {
        self.run(&[
            "worktree".to_string(),
            "remove".to_string(),
            "--force".to_string(),
            dest.to_string_lossy().to_string(),
        ])?;
        Ok(())
    }
}

/// Start of a lookback window of `months` months before `now`.
pub fn lookback_start(now: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    now.checked_sub_months(chrono::Months::new(months))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
