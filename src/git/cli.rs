use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;

use super::GitClient;
use crate::errors::GitError;
use crate::tracker::DiffTracker;
use crate::workflow::PrMetrics;

/// Run `program args` in `dir`, returning the raw output whatever the exit code.
pub async fn run_output(
    program: &str,
    args: &[&str],
    dir: &Path,
    timeout: Duration,
) -> Result<Output, GitError> {
    let command = format!("{} {}", program, args.join(" "));
    tracing::debug!(command = %command, dir = %dir.display(), "running");

    let child = Command::new(program)
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| GitError::Spawn {
            command: command.clone(),
            source,
        })?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|source| GitError::Spawn { command, source }),
        Err(_) => Err(GitError::Timeout { command, timeout }),
    }
}

/// Run `program args` in `dir` and return trimmed stdout, failing on a
/// non-zero exit.
pub async fn run_command(
    program: &str,
    args: &[&str],
    dir: &Path,
    timeout: Duration,
) -> Result<String, GitError> {
    let output = run_output(program, args, dir, timeout).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(GitError::Command {
            command: format!("{} {}", program, args.join(" ")),
            stderr,
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// [`GitClient`] backed by the `git` binary, with diff stats from libgit2.
#[derive(Debug, Clone)]
pub struct GitCli {
    timeout: Duration,
}

impl GitCli {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> Result<String, GitError> {
        run_command("git", args, dir, self.timeout).await
    }
}

#[async_trait]
impl GitClient for GitCli {
    async fn current_branch(&self, dir: &Path) -> Result<String, GitError> {
        self.git(dir, &["rev-parse", "--abbrev-ref", "HEAD"]).await
    }

    async fn commits_since(&self, dir: &Path, base: &str) -> Result<Vec<String>, GitError> {
        let range = format!("{}..HEAD", base);
        let out = self.git(dir, &["rev-list", "--reverse", &range]).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn diff_stats(&self, dir: &Path, base: &str) -> Result<PrMetrics, GitError> {
        let dir: PathBuf = dir.to_path_buf();
        let base = base.to_string();
        tokio::task::spawn_blocking(move || DiffTracker::new(&dir)?.metrics_against(&base))
            .await
            .map_err(|e| GitError::Repository(format!("diff task failed: {}", e)))?
    }

    async fn create_branch(&self, dir: &Path, name: &str, from: &str) -> Result<(), GitError> {
        self.git(dir, &["checkout", "-b", name, from]).await.map(drop)
    }

    async fn checkout(&self, dir: &Path, branch: &str) -> Result<(), GitError> {
        self.git(dir, &["checkout", branch]).await.map(drop)
    }

    async fn commit_empty(&self, dir: &Path, message: &str) -> Result<(), GitError> {
        self.git(dir, &["commit", "--allow-empty", "-m", message])
            .await
            .map(drop)
    }

    async fn cherry_pick(&self, dir: &Path, commit: &str) -> Result<(), GitError> {
        let result = self.git(dir, &["cherry-pick", commit]).await;
        if result.is_err() {
            // Leave the tree clean for rollback.
            let _ = self.git(dir, &["cherry-pick", "--abort"]).await;
        }
        result.map(drop)
    }

    async fn checkout_files(
        &self,
        dir: &Path,
        branch: &str,
        files: &[String],
    ) -> Result<(), GitError> {
        let mut args = vec!["checkout", branch, "--"];
        args.extend(files.iter().map(String::as_str));
        self.git(dir, &args).await.map(drop)
    }

    async fn commit(&self, dir: &Path, message: &str) -> Result<(), GitError> {
        self.git(dir, &["commit", "-m", message]).await.map(drop)
    }

    async fn push_branch(&self, dir: &Path, branch: &str) -> Result<(), GitError> {
        self.git(dir, &["push", "-u", "origin", branch]).await.map(drop)
    }

    async fn delete_remote_branch(&self, dir: &Path, branch: &str) -> Result<(), GitError> {
        self.git(dir, &["push", "origin", "--delete", branch])
            .await
            .map(drop)
    }

    async fn delete_local_branch(&self, dir: &Path, branch: &str) -> Result<(), GitError> {
        self.git(dir, &["branch", "-D", branch]).await.map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_command_returns_trimmed_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_command("sh", &["-c", "echo '  hi  '"], dir.path(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out, "hi");
    }

    #[tokio::test]
    async fn test_run_command_reports_stderr_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_command(
            "sh",
            &["-c", "echo nope >&2; exit 3"],
            dir.path(),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        match err {
            GitError::Command { stderr, .. } => assert_eq!(stderr, "nope"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_run_command_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_command("sh", &["-c", "sleep 5"], dir.path(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, GitError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_command(
            "definitely-not-a-real-binary-xyz",
            &[],
            dir.path(),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GitError::Spawn { .. }));
    }
}
