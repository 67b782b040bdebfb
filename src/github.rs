//! Pull requests and check runs through the `gh` CLI.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use crate::ci::{CheckJob, CiChecker};
use crate::errors::{CiError, GitError};
use crate::git::{run_command, run_output};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrRequest {
    pub title: String,
    pub body: String,
    pub base: String,
    pub head: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrInfo {
    pub number: u64,
    pub url: String,
    pub title: String,
    pub base: String,
    pub head: String,
}

#[async_trait]
pub trait PullRequestClient: Send + Sync {
    async fn create_pr(&self, dir: &Path, request: &PrRequest) -> Result<PrInfo, GitError>;

    async fn edit_pr_body(&self, dir: &Path, number: u64, body: &str) -> Result<(), GitError>;

    async fn close_pr(&self, dir: &Path, number: u64) -> Result<(), GitError>;

    /// Open PR whose head is `branch`, if any.
    async fn find_pr_for_branch(&self, dir: &Path, branch: &str) -> Result<Option<u64>, GitError>;
}

/// `gh`-backed pull request and check-run client.
#[derive(Debug, Clone)]
pub struct GhCli {
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhCheck {
    name: String,
    state: String,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GhPrNumber {
    number: u64,
}

/// gh reports unset timestamps as the zero date.
fn real_timestamp(ts: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    ts.filter(|t| t.year() > 1970)
}

impl From<GhCheck> for CheckJob {
    fn from(c: GhCheck) -> Self {
        CheckJob {
            name: c.name,
            state: c.state,
            started_at: real_timestamp(c.started_at),
            completed_at: real_timestamp(c.completed_at),
            link: c.link.filter(|l| !l.is_empty()),
        }
    }
}

/// Parse `gh pr checks --json` output.
pub fn parse_checks_json(stdout: &str) -> Result<Vec<CheckJob>, serde_json::Error> {
    let checks: Vec<GhCheck> = serde_json::from_str(stdout)?;
    Ok(checks.into_iter().map(CheckJob::from).collect())
}

/// Workflow run ids referenced by check links, deduplicated.
pub fn run_ids_from_links<'a>(
    links: impl IntoIterator<Item = &'a str>,
) -> Result<Vec<u64>, regex::Error> {
    let re = Regex::new(r"/actions/runs/(\d+)")?;
    let ids: BTreeSet<u64> = links
        .into_iter()
        .filter_map(|l| re.captures(l))
        .filter_map(|c| c.get(1)?.as_str().parse().ok())
        .collect();
    Ok(ids.into_iter().collect())
}

/// PR number from a `.../pull/<n>` URL.
pub fn pr_number_from_url(url: &str) -> Option<u64> {
    url.trim_end_matches('/').rsplit('/').next()?.parse().ok()
}

impl GhCli {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn gh(&self, dir: &Path, args: &[&str]) -> Result<String, GitError> {
        run_command("gh", args, dir, self.timeout).await
    }
}

#[async_trait]
impl PullRequestClient for GhCli {
    async fn create_pr(&self, dir: &Path, request: &PrRequest) -> Result<PrInfo, GitError> {
        let url = self
            .gh(
                dir,
                &[
                    "pr",
                    "create",
                    "--title",
                    &request.title,
                    "--body",
                    &request.body,
                    "--base",
                    &request.base,
                    "--head",
                    &request.head,
                ],
            )
            .await?;
        let url = url.lines().last().unwrap_or_default().trim().to_string();
        let number = pr_number_from_url(&url).ok_or_else(|| GitError::Output {
            command: "gh pr create".into(),
            message: format!("no PR number in '{}'", url),
        })?;
        tracing::info!(pr = number, head = %request.head, base = %request.base, "created pull request");
        Ok(PrInfo {
            number,
            url,
            title: request.title.clone(),
            base: request.base.clone(),
            head: request.head.clone(),
        })
    }

    async fn edit_pr_body(&self, dir: &Path, number: u64, body: &str) -> Result<(), GitError> {
        let n = number.to_string();
        self.gh(dir, &["pr", "edit", &n, "--body", body])
            .await
            .map(drop)
    }

    async fn close_pr(&self, dir: &Path, number: u64) -> Result<(), GitError> {
        let n = number.to_string();
        self.gh(dir, &["pr", "close", &n]).await.map(drop)
    }

    async fn find_pr_for_branch(&self, dir: &Path, branch: &str) -> Result<Option<u64>, GitError> {
        let output = run_output(
            "gh",
            &["pr", "view", branch, "--json", "number"],
            dir,
            self.timeout,
        )
        .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("no pull requests found") {
                return Ok(None);
            }
            return Err(GitError::Command {
                command: format!("gh pr view {}", branch),
                stderr: stderr.trim().to_string(),
            });
        }
        let parsed: GhPrNumber =
            serde_json::from_slice(&output.stdout).map_err(|e| GitError::Output {
                command: "gh pr view".into(),
                message: e.to_string(),
            })?;
        Ok(Some(parsed.number))
    }
}

#[async_trait]
impl CiChecker for GhCli {
    async fn check(&self, dir: &Path, pr: u64) -> Result<Vec<CheckJob>, CiError> {
        let n = pr.to_string();
        let output = run_output(
            "gh",
            &[
                "pr",
                "checks",
                &n,
                "--json",
                "name,state,startedAt,completedAt,link",
            ],
            dir,
            self.timeout,
        )
        .await?;

        // gh exits non-zero when any check failed or is pending, with valid JSON on stdout.
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty()
            && let Ok(jobs) = parse_checks_json(&stdout)
        {
            return Ok(jobs);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("no checks reported") {
            return Ok(Vec::new());
        }
        if !output.status.success() {
            return Err(CiError::Command(stderr.trim().to_string()));
        }
        Err(CiError::Parse(format!(
            "unexpected gh pr checks output: {}",
            stdout.trim()
        )))
    }

    async fn rerun(&self, dir: &Path, pr: u64) -> Result<(), CiError> {
        let jobs = self.check(dir, pr).await?;
        let ids = run_ids_from_links(jobs.iter().filter_map(|j| j.link.as_deref()))
            .map_err(|e| CiError::Parse(e.to_string()))?;
        if ids.is_empty() {
            return Err(CiError::Command(format!(
                "no workflow runs found to rerun for PR #{}",
                pr
            )));
        }
        for id in ids {
            let id = id.to_string();
            run_command("gh", &["run", "rerun", &id], dir, self.timeout).await?;
            tracing::info!(pr, run = %id, "requested rerun");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_checks_json() {
        let json = r#"[
            {"name":"build","state":"SUCCESS","startedAt":"2024-05-01T10:00:00Z","completedAt":"2024-05-01T10:02:00Z","link":"https://github.com/o/r/actions/runs/42/job/1"},
            {"name":"test","state":"IN_PROGRESS","startedAt":"2024-05-01T10:00:00Z","completedAt":"0001-01-01T00:00:00Z","link":""}
        ]"#;
        let jobs = parse_checks_json(json).unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].duration(), Some(Duration::from_secs(120)));
        assert_eq!(jobs[1].completed_at, None);
        assert_eq!(jobs[1].duration(), None);
        assert_eq!(jobs[1].link, None);
    }

    #[test]
    fn test_run_ids_deduplicated() {
        let links = [
            "https://github.com/o/r/actions/runs/42/job/1",
            "https://github.com/o/r/actions/runs/42/job/2",
            "https://github.com/o/r/actions/runs/7/job/3",
            "https://example.com/status",
        ];
        assert_eq!(run_ids_from_links(links).unwrap(), vec![7, 42]);
    }

    #[test]
    fn test_pr_number_from_url() {
        assert_eq!(
            pr_number_from_url("https://github.com/o/r/pull/123"),
            Some(123)
        );
        assert_eq!(
            pr_number_from_url("https://github.com/o/r/pull/123/"),
            Some(123)
        );
        assert_eq!(pr_number_from_url("not a url"), None);
    }
}
