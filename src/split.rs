//! Splitting an oversized change into a parent PR and a chain of child PRs.
//!
//! The parent branch is cut from the main branch and anchored by an empty
//! commit. Each child branches off the previous one, so the children form a
//! stack that can be reviewed and merged in order.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::errors::{GitError, SplitError};
use crate::git::GitClient;
use crate::github::{PrInfo, PrRequest, PullRequestClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitStrategy {
    Commits,
    Files,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildPrPlan {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub commits: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrSplitPlan {
    pub strategy: SplitStrategy,
    pub parent_title: String,
    #[serde(default)]
    pub parent_description: String,
    pub children: Vec<ChildPrPlan>,
}

impl PrSplitPlan {
    pub fn validate(&self) -> Result<(), SplitError> {
        if self.children.is_empty() {
            return Err(SplitError::InvalidPlan("plan has no child PRs".into()));
        }
        if self.parent_title.trim().is_empty() {
            return Err(SplitError::InvalidPlan("parent title is empty".into()));
        }
        for (i, child) in self.children.iter().enumerate() {
            let items = match self.strategy {
                SplitStrategy::Commits => &child.commits,
                SplitStrategy::Files => &child.files,
            };
            if items.is_empty() {
                return Err(SplitError::InvalidPlan(format!(
                    "child {} ('{}') lists no {}",
                    i + 1,
                    child.title,
                    match self.strategy {
                        SplitStrategy::Commits => "commits",
                        SplitStrategy::Files => "files",
                    }
                )));
            }
        }
        Ok(())
    }
}

/// Everything a split created so far, in creation order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrSplitResult {
    pub source_branch: String,
    pub parent: Option<PrInfo>,
    pub children: Vec<PrInfo>,
    pub branches: Vec<String>,
}

impl PrSplitResult {
    fn new(source_branch: &str) -> Self {
        Self {
            source_branch: source_branch.to_string(),
            ..Self::default()
        }
    }
}

/// A failed split together with whatever it had already created.
#[derive(Debug)]
pub struct SplitFailure {
    pub error: SplitError,
    pub partial: PrSplitResult,
}

pub fn parent_branch_name(source: &str) -> String {
    format!("{}-split", source)
}

pub fn child_branch_name(source: &str, index: usize) -> String {
    format!("{}-split-{}", source, index + 1)
}

pub struct PrSplitManager {
    git: Arc<dyn GitClient>,
    prs: Arc<dyn PullRequestClient>,
}

impl PrSplitManager {
    pub fn new(git: Arc<dyn GitClient>, prs: Arc<dyn PullRequestClient>) -> Self {
        Self { git, prs }
    }

    pub async fn execute_split(
        &self,
        plan: &PrSplitPlan,
        source_branch: &str,
        main_branch: &str,
        dir: &Path,
    ) -> Result<PrSplitResult, SplitFailure> {
        self.execute_split_recorded(plan, source_branch, main_branch, dir, &|_| {})
            .await
    }

    /// Like [`execute_split`](Self::execute_split), calling `record` with the
    /// partial result each time a branch or PR is created.
    pub async fn execute_split_recorded(
        &self,
        plan: &PrSplitPlan,
        source_branch: &str,
        main_branch: &str,
        dir: &Path,
        record: &(dyn Fn(&PrSplitResult) + Send + Sync),
    ) -> Result<PrSplitResult, SplitFailure> {
        let mut result = PrSplitResult::new(source_branch);

        let precondition = if source_branch.trim().is_empty() || main_branch.trim().is_empty() {
            Err(SplitError::InvalidPlan("branch names must not be empty".into()))
        } else {
            plan.validate()
        };
        if let Err(error) = precondition {
            return Err(SplitFailure {
                error,
                partial: result,
            });
        }

        match self
            .run_steps(plan, source_branch, main_branch, dir, &mut result, record)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    source = source_branch,
                    children = result.children.len(),
                    "split complete"
                );
                Ok(result)
            }
            Err(error) => {
                tracing::warn!(source = source_branch, error = %error, "split failed");
                Err(SplitFailure {
                    error,
                    partial: result,
                })
            }
        }
    }

    async fn run_steps(
        &self,
        plan: &PrSplitPlan,
        source: &str,
        main: &str,
        dir: &Path,
        result: &mut PrSplitResult,
        record: &(dyn Fn(&PrSplitResult) + Send + Sync),
    ) -> Result<(), SplitError> {
        let parent_branch = parent_branch_name(source);
        self.git
            .create_branch(dir, &parent_branch, main)
            .await
            .map_err(step("create parent branch", None))?;
        result.branches.push(parent_branch.clone());
        record(result);

        self.git
            .commit_empty(dir, &format!("Split parent: {}", plan.parent_title))
            .await
            .map_err(step("anchor parent branch", None))?;
        self.git
            .push_branch(dir, &parent_branch)
            .await
            .map_err(step("push parent branch", None))?;
        let parent = self
            .prs
            .create_pr(
                dir,
                &PrRequest {
                    title: plan.parent_title.clone(),
                    body: plan.parent_description.clone(),
                    base: main.to_string(),
                    head: parent_branch.clone(),
                },
            )
            .await
            .map_err(step("open parent PR", None))?;
        result.parent = Some(parent.clone());
        record(result);

        let mut previous = parent_branch;
        for (i, child) in plan.children.iter().enumerate() {
            let branch = child_branch_name(source, i);
            self.git
                .create_branch(dir, &branch, &previous)
                .await
                .map_err(step("create child branch", Some(i)))?;
            result.branches.push(branch.clone());
            record(result);

            match plan.strategy {
                SplitStrategy::Commits => {
                    for commit in &child.commits {
                        self.git
                            .cherry_pick(dir, commit)
                            .await
                            .map_err(step("cherry-pick", Some(i)))?;
                    }
                }
                SplitStrategy::Files => {
                    self.git
                        .checkout_files(dir, source, &child.files)
                        .await
                        .map_err(step("check out files", Some(i)))?;
                    self.git
                        .commit(dir, &child.title)
                        .await
                        .map_err(step("commit files", Some(i)))?;
                }
            }

            self.git
                .push_branch(dir, &branch)
                .await
                .map_err(step("push child branch", Some(i)))?;
            let pr = self
                .prs
                .create_pr(
                    dir,
                    &PrRequest {
                        title: child.title.clone(),
                        body: child.description.clone(),
                        base: previous.clone(),
                        head: branch.clone(),
                    },
                )
                .await
                .map_err(step("open child PR", Some(i)))?;
            tracing::info!(pr = pr.number, branch = %branch, "opened child PR");
            result.children.push(pr);
            record(result);
            previous = branch;
        }

        let body = parent_body(&plan.parent_description, &result.children);
        self.prs
            .edit_pr_body(dir, parent.number, &body)
            .await
            .map_err(step("link child PRs", None))?;

        self.git
            .checkout(dir, source)
            .await
            .map_err(step("return to source branch", None))?;
        Ok(())
    }

    /// Undo a (possibly partial) split. Every step is attempted even when
    /// earlier ones fail.
    pub async fn rollback(&self, result: &PrSplitResult, dir: &Path) -> Result<(), SplitError> {
        let mut errors = Vec::new();

        if !result.source_branch.is_empty()
            && let Err(e) = self.git.checkout(dir, &result.source_branch).await
        {
            errors.push(format!("checkout {}: {}", result.source_branch, e));
        }

        let prs = result.children.iter().rev().chain(result.parent.iter());
        for pr in prs {
            if let Err(e) = self.prs.close_pr(dir, pr.number).await {
                errors.push(format!("close PR #{}: {}", pr.number, e));
            }
        }

        for branch in result.branches.iter().rev() {
            if let Err(e) = self.git.delete_remote_branch(dir, branch).await {
                errors.push(format!("delete remote branch {}: {}", branch, e));
            }
            if let Err(e) = self.git.delete_local_branch(dir, branch).await {
                errors.push(format!("delete local branch {}: {}", branch, e));
            }
        }

        if errors.is_empty() {
            tracing::info!(branches = result.branches.len(), "split rolled back");
            Ok(())
        } else {
            tracing::warn!(errors = errors.len(), "split rollback incomplete");
            Err(SplitError::Rollback(errors))
        }
    }
}

fn step(name: &'static str, child: Option<usize>) -> impl FnOnce(GitError) -> SplitError {
    move |source| SplitError::Step {
        step: name,
        child,
        source,
    }
}

fn parent_body(description: &str, children: &[PrInfo]) -> String {
    let mut body = description.trim().to_string();
    if !body.is_empty() {
        body.push_str("\n\n");
    }
    body.push_str("## Child PRs\n\nMerge in order:\n\n");
    for (i, child) in children.iter().enumerate() {
        body.push_str(&format!("{}. #{} {}\n", i + 1, child.number, child.title));
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeGit, FakePrClient, OpLog};

    fn plan(strategy: SplitStrategy) -> PrSplitPlan {
        PrSplitPlan {
            strategy,
            parent_title: "Add auth".into(),
            parent_description: "Auth in two parts".into(),
            children: vec![
                ChildPrPlan {
                    title: "Models".into(),
                    description: "user model".into(),
                    commits: vec!["c1".into()],
                    files: vec!["src/models.rs".into()],
                },
                ChildPrPlan {
                    title: "Routes".into(),
                    description: "login route".into(),
                    commits: vec!["c2".into(), "c3".into()],
                    files: vec!["src/routes.rs".into()],
                },
            ],
        }
    }

    fn manager(log: &OpLog) -> (PrSplitManager, Arc<FakeGit>, Arc<FakePrClient>) {
        let git = Arc::new(FakeGit::new(log.clone()));
        let prs = Arc::new(FakePrClient::new(log.clone()));
        (PrSplitManager::new(git.clone(), prs.clone()), git, prs)
    }

    #[tokio::test]
    async fn test_two_child_split_by_commits_runs_in_order() {
        let log = OpLog::default();
        let (manager, _, prs) = manager(&log);
        let result = manager
            .execute_split(&plan(SplitStrategy::Commits), "feat", "main", Path::new("."))
            .await
            .unwrap();

        assert_eq!(
            log.entries(),
            vec![
                "create_branch feat-split from main",
                "commit_empty",
                "push feat-split",
                "create_pr #100 feat-split -> main",
                "create_branch feat-split-1 from feat-split",
                "cherry_pick c1",
                "push feat-split-1",
                "create_pr #101 feat-split-1 -> feat-split",
                "create_branch feat-split-2 from feat-split-1",
                "cherry_pick c2",
                "cherry_pick c3",
                "push feat-split-2",
                "create_pr #102 feat-split-2 -> feat-split-1",
                "edit_pr #100",
                "checkout feat",
            ]
        );
        assert_eq!(result.branches, vec!["feat-split", "feat-split-1", "feat-split-2"]);
        assert_eq!(result.parent.as_ref().map(|p| p.number), Some(100));
        assert_eq!(
            result.children.iter().map(|c| c.number).collect::<Vec<_>>(),
            vec![101, 102]
        );
        let body = prs.body(100).unwrap();
        assert!(body.contains("#101 Models"));
        assert!(body.contains("#102 Routes"));
    }

    #[tokio::test]
    async fn test_split_by_files_checks_out_and_commits() {
        let log = OpLog::default();
        let (manager, _, _) = manager(&log);
        manager
            .execute_split(&plan(SplitStrategy::Files), "feat", "main", Path::new("."))
            .await
            .unwrap();
        let entries = log.entries();
        assert!(entries.contains(&"checkout_files feat src/models.rs".to_string()));
        assert!(entries.contains(&"commit Models".to_string()));
    }

    #[tokio::test]
    async fn test_invalid_plan_has_no_side_effects() {
        let log = OpLog::default();
        let (manager, _, _) = manager(&log);
        let mut bad = plan(SplitStrategy::Commits);
        bad.children[1].commits.clear();
        let failure = manager
            .execute_split(&bad, "feat", "main", Path::new("."))
            .await
            .unwrap_err();
        assert!(matches!(failure.error, SplitError::InvalidPlan(_)));
        assert!(log.entries().is_empty());

        let empty = PrSplitPlan {
            children: vec![],
            ..plan(SplitStrategy::Files)
        };
        assert!(manager
            .execute_split(&empty, "feat", "main", Path::new("."))
            .await
            .is_err());
        assert!(manager
            .execute_split(&plan(SplitStrategy::Files), "", "main", Path::new("."))
            .await
            .is_err());
        assert!(log.entries().is_empty());
    }

    #[tokio::test]
    async fn test_failure_reports_step_and_partial_result() {
        let log = OpLog::default();
        let (manager, git, _) = manager(&log);
        git.fail_on("push feat-split-2");
        let failure = manager
            .execute_split(&plan(SplitStrategy::Commits), "feat", "main", Path::new("."))
            .await
            .unwrap_err();
        match &failure.error {
            SplitError::Step { step, child, .. } => {
                assert_eq!(*step, "push child branch");
                assert_eq!(*child, Some(1));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            failure.partial.branches,
            vec!["feat-split", "feat-split-1", "feat-split-2"]
        );
        assert_eq!(failure.partial.children.len(), 1);
    }

    #[tokio::test]
    async fn test_recorded_progress_tracks_each_created_resource() {
        let log = OpLog::default();
        let (manager, git, _) = manager(&log);
        git.fail_on("cherry_pick c2");
        let seen = std::sync::Mutex::new(Vec::new());
        let failure = manager
            .execute_split_recorded(
                &plan(SplitStrategy::Commits),
                "feat",
                "main",
                Path::new("."),
                &|partial| seen.lock().unwrap().push(partial.clone()),
            )
            .await
            .unwrap_err();

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 5);
        assert_eq!(seen[0].branches, vec!["feat-split"]);
        assert!(seen[0].parent.is_none());
        assert_eq!(seen[1].parent.as_ref().map(|p| p.number), Some(100));
        assert_eq!(seen.last(), Some(&failure.partial));
        assert_eq!(
            failure.partial.branches,
            vec!["feat-split", "feat-split-1", "feat-split-2"]
        );
    }

    #[tokio::test]
    async fn test_rollback_undoes_everything_in_reverse() {
        let log = OpLog::default();
        let (manager, _, _) = manager(&log);
        let result = manager
            .execute_split(&plan(SplitStrategy::Commits), "feat", "main", Path::new("."))
            .await
            .unwrap();
        log.clear();

        manager.rollback(&result, Path::new(".")).await.unwrap();
        assert_eq!(
            log.entries(),
            vec![
                "checkout feat",
                "close_pr #102",
                "close_pr #101",
                "close_pr #100",
                "delete_remote feat-split-2",
                "delete_local feat-split-2",
                "delete_remote feat-split-1",
                "delete_local feat-split-1",
                "delete_remote feat-split",
                "delete_local feat-split",
            ]
        );
    }

    #[tokio::test]
    async fn test_rollback_continues_through_failures_and_aggregates() {
        let log = OpLog::default();
        let (manager, git, prs) = manager(&log);
        let result = manager
            .execute_split(&plan(SplitStrategy::Commits), "feat", "main", Path::new("."))
            .await
            .unwrap();
        log.clear();
        prs.fail_on("close_pr #101");
        git.fail_on("delete_remote feat-split-2");

        let err = manager.rollback(&result, Path::new(".")).await.unwrap_err();
        match err {
            SplitError::Rollback(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
        let entries = log.entries();
        assert!(entries.contains(&"close_pr #100".to_string()));
        assert!(entries.contains(&"delete_local feat-split-2".to_string()));
        assert!(entries.contains(&"delete_local feat-split".to_string()));
    }
}
