use crate::errors::GitError;
use crate::workflow::PrMetrics;
use git2::{Delta, DiffOptions, Oid, Repository};
use std::path::Path;

/// Measures the size of a worktree's changes relative to a base branch.
pub struct DiffTracker {
    repo: Repository,
}

impl DiffTracker {
    pub fn new(dir: &Path) -> Result<Self, GitError> {
        let repo = Repository::discover(dir)?;
        Ok(Self { repo })
    }

    fn resolve_branch(&self, branch: &str) -> Result<Oid, GitError> {
        for refname in [
            format!("refs/heads/{}", branch),
            format!("refs/remotes/origin/{}", branch),
        ] {
            if let Ok(reference) = self.repo.find_reference(&refname)
                && let Ok(commit) = reference.peel_to_commit()
            {
                return Ok(commit.id());
            }
        }
        Err(GitError::Repository(format!("branch '{}' not found", branch)))
    }

    /// Changes from the merge base of `base` and HEAD to the working tree,
    /// including staged and untracked files.
    pub fn metrics_against(&self, base: &str) -> Result<PrMetrics, GitError> {
        let base_oid = self.resolve_branch(base)?;
        let head_oid = self.repo.head()?.peel_to_commit()?.id();
        let fork_point = self.repo.merge_base(base_oid, head_oid)?;
        let tree = self.repo.find_commit(fork_point)?.tree()?;

        let mut opts = DiffOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .show_untracked_content(true);

        let diff = self
            .repo
            .diff_tree_to_workdir_with_index(Some(&tree), Some(&mut opts))?;

        let mut metrics = PrMetrics::default();
        let mut added = 0usize;
        let mut removed = 0usize;

        for delta in diff.deltas() {
            let Some(path) = delta.new_file().path().or_else(|| delta.old_file().path()) else {
                continue;
            };
            let path = path.to_path_buf();
            match delta.status() {
                Delta::Added | Delta::Untracked | Delta::Copied => metrics.files_added.push(path),
                Delta::Modified | Delta::Renamed | Delta::Typechange => {
                    metrics.files_modified.push(path)
                }
                Delta::Deleted => metrics.files_deleted.push(path),
                _ => {}
            }
        }

        diff.foreach(
            &mut |_delta, _progress| true,
            None,
            None,
            Some(&mut |_delta, _hunk, line| {
                match line.origin() {
                    '+' => added += 1,
                    '-' => removed += 1,
                    _ => {}
                }
                true
            }),
        )?;

        metrics.lines_added = added;
        metrics.lines_removed = removed;
        metrics.finalize();
        Ok(metrics)
    }
}
