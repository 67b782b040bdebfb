use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// One check run as reported by the status collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckJob {
    pub name: String,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

impl CheckJob {
    pub fn new(name: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: state.into(),
            started_at: None,
            completed_at: None,
            link: None,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        let start = Utc::now();
        let span = chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        self.started_at = Some(start);
        self.completed_at = Some(start + span);
        self
    }

    /// Observed run time, when both timestamps are present and ordered.
    pub fn duration(&self) -> Option<Duration> {
        let (start, end) = (self.started_at?, self.completed_at?);
        (end - start).to_std().ok()
    }
}

/// Normalized state of a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Success,
    Failure,
    Cancelled,
    Pending,
}

/// Overall status of a CI run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CiStatus {
    Success,
    Failure,
    Pending,
}

impl fmt::Display for CiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CiStatus::Success => "success",
            CiStatus::Failure => "failure",
            CiStatus::Pending => "pending",
        })
    }
}

/// Interpreted CI result for one pull request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CiResult {
    pub passed: bool,
    pub status: CiStatus,
    pub failed_jobs: Vec<String>,
    pub cancelled_jobs: Vec<String>,
    /// Jobs left out of the pass/fail decision by the end-to-end filter.
    #[serde(default)]
    pub ignored_jobs: Vec<String>,
    /// Raw per-job listing, unfiltered.
    pub output: String,
    #[serde(default)]
    pub jobs: Vec<CheckJob>,
}

impl CiResult {
    pub fn is_terminal(&self) -> bool {
        self.status != CiStatus::Pending
    }

    /// Failed only because jobs were cancelled, with no genuine failure.
    pub fn is_cancelled_only(&self) -> bool {
        !self.passed && self.failed_jobs.is_empty() && !self.cancelled_jobs.is_empty()
    }

    pub fn job(&self, name: &str) -> Option<&CheckJob> {
        self.jobs.iter().find(|j| j.name == name)
    }

    /// Failure text handed back to the agent in a fix prompt.
    pub fn failure_summary(&self) -> String {
        let mut text = String::new();
        if !self.failed_jobs.is_empty() {
            text.push_str(&format!("Failed jobs: {}\n", self.failed_jobs.join(", ")));
        }
        if !self.cancelled_jobs.is_empty() {
            text.push_str(&format!(
                "Cancelled jobs: {}\n",
                self.cancelled_jobs.join(", ")
            ));
        }
        text.push_str("\nCheck status:\n");
        text.push_str(&self.output);
        text
    }
}
