use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::cli::run_command;
use super::{WorktreeInfo, WorktreeManager};
use crate::errors::GitError;

/// Worktrees created with `git worktree` under a fixed directory.
#[derive(Debug, Clone)]
pub struct GitWorktrees {
    repo_dir: PathBuf,
    worktree_dir: PathBuf,
    branch_prefix: String,
    timeout: Duration,
}

impl GitWorktrees {
    pub fn new(repo_dir: PathBuf, worktree_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            repo_dir,
            worktree_dir,
            branch_prefix: "shepherd/".to_string(),
            timeout,
        }
    }

    pub fn branch_for(&self, name: &str) -> String {
        format!("{}{}", self.branch_prefix, name)
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.worktree_dir.join(name)
    }
}

#[async_trait]
impl WorktreeManager for GitWorktrees {
    async fn create(&self, name: &str, base: &str) -> Result<WorktreeInfo, GitError> {
        let path = self.path_for(name);
        let branch = self.branch_for(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| GitError::Spawn {
                command: format!("mkdir {}", parent.display()),
                source,
            })?;
        }
        let path_str = path.to_string_lossy().to_string();
        run_command(
            "git",
            &["worktree", "add", "-B", &branch, &path_str, base],
            &self.repo_dir,
            self.timeout,
        )
        .await?;
        tracing::info!(branch = %branch, path = %path.display(), "created worktree");
        Ok(WorktreeInfo { path, branch })
    }

    async fn remove(&self, path: &Path) -> Result<(), GitError> {
        let path_str = path.to_string_lossy().to_string();
        run_command(
            "git",
            &["worktree", "remove", "--force", &path_str],
            &self.repo_dir,
            self.timeout,
        )
        .await?;
        tracing::info!(path = %path.display(), "removed worktree");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        let wt = GitWorktrees::new(
            PathBuf::from("/repo"),
            PathBuf::from("/repo/.shepherd/worktrees"),
            Duration::from_secs(30),
        );
        assert_eq!(wt.branch_for("auth"), "shepherd/auth");
        assert_eq!(
            wt.path_for("auth"),
            PathBuf::from("/repo/.shepherd/worktrees/auth")
        );
    }
}
