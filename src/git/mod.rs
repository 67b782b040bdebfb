//! Git collaborators: branch/commit operations and worktree management.

pub mod cli;
pub mod worktree;

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::errors::GitError;
use crate::workflow::PrMetrics;

pub use cli::{GitCli, run_command, run_output};
pub use worktree::GitWorktrees;

/// Branch and commit operations against a working directory.
#[async_trait]
pub trait GitClient: Send + Sync {
    async fn current_branch(&self, dir: &Path) -> Result<String, GitError>;

    /// Commits reachable from HEAD but not from `base`, oldest first.
    async fn commits_since(&self, dir: &Path, base: &str) -> Result<Vec<String>, GitError>;

    async fn diff_stats(&self, dir: &Path, base: &str) -> Result<PrMetrics, GitError>;

    /// Create `name` from `from` and check it out.
    async fn create_branch(&self, dir: &Path, name: &str, from: &str) -> Result<(), GitError>;

    async fn checkout(&self, dir: &Path, branch: &str) -> Result<(), GitError>;

    async fn commit_empty(&self, dir: &Path, message: &str) -> Result<(), GitError>;

    async fn cherry_pick(&self, dir: &Path, commit: &str) -> Result<(), GitError>;

    /// Bring `files` over from `branch` into the index.
    async fn checkout_files(&self, dir: &Path, branch: &str, files: &[String])
    -> Result<(), GitError>;

    /// Commit whatever is staged.
    async fn commit(&self, dir: &Path, message: &str) -> Result<(), GitError>;

    async fn push_branch(&self, dir: &Path, branch: &str) -> Result<(), GitError>;

    async fn delete_remote_branch(&self, dir: &Path, branch: &str) -> Result<(), GitError>;

    async fn delete_local_branch(&self, dir: &Path, branch: &str) -> Result<(), GitError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: String,
}

/// Isolated working copies, one per workflow.
#[async_trait]
pub trait WorktreeManager: Send + Sync {
    async fn create(&self, name: &str, base: &str) -> Result<WorktreeInfo, GitError>;

    async fn remove(&self, path: &Path) -> Result<(), GitError>;
}
