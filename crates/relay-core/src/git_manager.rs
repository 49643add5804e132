//! Thin wrapper over the `git` binary used by the Task Runner's auto-commit
//! and the Plan Subsystem's repo-context seeding. Kept close to its
//! ancestor's shape: synchronous subprocess calls with exponential-backoff
//! retry on lock/timeout-flavored errors.

use crate::error::{RelayError, RelayResult};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

const DEFAULT_MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 100;

pub struct GitManager {
    working_dir: PathBuf,
    commit_prefix: String,
    max_retries: u32,
}

impl GitManager {
    pub fn new(working_dir: impl Into<PathBuf>, commit_prefix: impl Into<String>) -> Self {
        GitManager {
            working_dir: working_dir.into(),
            commit_prefix: commit_prefix.into(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn run_git(&self, args: &[&str]) -> RelayResult<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.working_dir)
            .output()
            .map_err(RelayError::Filesystem)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(RelayError::transient(format!("git {} failed: {stderr}", args.join(" "))));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn run_git_with_retry(&self, args: &[&str]) -> RelayResult<String> {
        let mut attempt = 0;
        loop {
            match self.run_git(args) {
                Ok(out) => return Ok(out),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = RETRY_BASE_DELAY_MS * (1u64 << attempt);
                    std::thread::sleep(Duration::from_millis(delay));
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn current_branch(&self) -> RelayResult<String> {
        self.run_git_with_retry(&["rev-parse", "--abbrev-ref", "HEAD"])
    }

    pub fn current_commit(&self) -> RelayResult<String> {
        self.run_git_with_retry(&["rev-parse", "--short", "HEAD"])
    }

    pub fn has_uncommitted_changes(&self) -> RelayResult<bool> {
        let status = self.run_git_with_retry(&["status", "--porcelain"])?;
        Ok(!status.is_empty())
    }

    pub fn diff_stat(&self, since_commit: &str) -> RelayResult<String> {
        self.run_git_with_retry(&["diff", "--stat", since_commit])
    }

    /// Stage everything and commit, using the subject format the Task
    /// Runner and Plan apply flow share: `<prefix> <id> <title>`.
    pub fn create_checkpoint(&self, id: &str, title: &str) -> RelayResult<Option<String>> {
        self.run_git_with_retry(&["add", "-A"])?;
        if !self.has_uncommitted_changes()? {
            return Ok(None);
        }
        let subject = format!("{} {id} {title}", self.commit_prefix);
        self.run_git_with_retry(&["commit", "-m", &subject])?;
        Ok(Some(self.current_commit()?))
    }

    pub fn is_repo(path: &Path) -> bool {
        path.join(".git").is_dir()
    }
}
