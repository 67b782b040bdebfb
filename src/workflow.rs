//! Persisted workflow state and the structured artifacts each phase produces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::errors::StateError;
use crate::phase::{Phase, PhaseState, PhaseStatus};
use crate::split::{PrSplitPlan, PrSplitResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowType {
    Feature,
    Fix,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowType::Feature => "feature",
            WorkflowType::Fix => "fix",
        }
    }
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowType {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "feature" => Ok(WorkflowType::Feature),
            "fix" => Ok(WorkflowType::Fix),
            _ => Err(StateError::InvalidType(s.to_string())),
        }
    }
}

/// Which failure path stopped the workflow; decides how `resume` re-enters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureType {
    /// Agent, parse, git or split failure: the phase restarts from attempt one.
    #[default]
    Execution,
    /// CI failure or CI command failure: the fix loop resumes at attempt two.
    Ci,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowError {
    pub message: String,
    pub phase: Phase,
    pub timestamp: DateTime<Utc>,
    pub recoverable: bool,
    #[serde(default)]
    pub failure_type: FailureType,
}

/// Size of a change set relative to the main branch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrMetrics {
    pub lines_added: usize,
    pub lines_removed: usize,
    pub total_lines: usize,
    pub files_changed: usize,
    #[serde(default)]
    pub files_added: Vec<PathBuf>,
    #[serde(default)]
    pub files_modified: Vec<PathBuf>,
    #[serde(default)]
    pub files_deleted: Vec<PathBuf>,
}

impl PrMetrics {
    /// Recompute the derived totals from the line counts and file lists.
    pub fn finalize(&mut self) {
        self.total_lines = self.lines_added + self.lines_removed;
        self.files_changed =
            self.files_added.len() + self.files_modified.len() + self.files_deleted.len();
    }

    pub fn exceeds(&self, max_lines: usize, max_files: usize) -> bool {
        self.total_lines > max_lines || self.files_changed > max_files
    }
}

/// The single durable record for one workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub name: String,
    #[serde(rename = "type")]
    pub workflow_type: WorkflowType,
    pub description: String,
    pub current_phase: Phase,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub phases: BTreeMap<Phase, PhaseState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkflowError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
}

impl WorkflowState {
    /// Fresh state: Planning in progress, every later phase pending.
    pub fn new(name: &str, description: &str, workflow_type: WorkflowType) -> Self {
        let now = Utc::now();
        let mut phases = BTreeMap::new();
        for phase in Phase::ORDERED {
            let state = if phase == Phase::Planning {
                PhaseState::in_progress()
            } else {
                PhaseState::pending()
            };
            phases.insert(phase, state);
        }
        Self {
            name: name.to_string(),
            workflow_type,
            description: description.to_string(),
            current_phase: Phase::Planning,
            created_at: now,
            updated_at: now,
            phases,
            error: None,
            worktree_path: None,
            branch: None,
            pr_number: None,
        }
    }

    pub fn phase(&self, phase: Phase) -> PhaseState {
        self.phases.get(&phase).cloned().unwrap_or_default()
    }

    pub fn phase_mut(&mut self, phase: Phase) -> &mut PhaseState {
        self.phases.entry(phase).or_default()
    }

    /// Coarse status shown by `list`.
    pub fn status(&self) -> WorkflowStatus {
        match self.current_phase {
            Phase::Completed => WorkflowStatus::Completed,
            Phase::Failed => WorkflowStatus::Failed,
            _ if self.error.is_some() => WorkflowStatus::Failed,
            _ => WorkflowStatus::InProgress,
        }
    }

    /// First phase, in execution order, that was left failed or in progress.
    pub fn interrupted_phase(&self) -> Option<Phase> {
        Phase::ORDERED.into_iter().find(|p| {
            matches!(
                self.phases.get(p).map(|s| s.status),
                Some(PhaseStatus::Failed | PhaseStatus::InProgress)
            )
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    InProgress,
    Completed,
    Failed,
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WorkflowStatus::InProgress => "in_progress",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
        })
    }
}

/// One row of `list`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowSummary {
    pub name: String,
    pub workflow_type: WorkflowType,
    pub description: String,
    pub current_phase: Phase,
    pub status: WorkflowStatus,
    pub updated_at: DateTime<Utc>,
}

impl From<&WorkflowState> for WorkflowSummary {
    fn from(state: &WorkflowState) -> Self {
        Self {
            name: state.name.clone(),
            workflow_type: state.workflow_type,
            description: state.description.clone(),
            current_phase: state.current_phase,
            status: state.status(),
            updated_at: state.updated_at,
        }
    }
}

/// Structured output of the planning agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanOutput {
    pub summary: String,
    #[serde(default)]
    pub approach: String,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub files_to_change: Vec<String>,
    #[serde(default)]
    pub risks: Vec<String>,
    #[serde(default)]
    pub test_strategy: String,
}

impl PlanOutput {
    /// Human-readable rendering saved next to `plan.json`.
    pub fn to_markdown(&self, title: &str) -> String {
        let mut md = format!("# Plan: {}\n\n## Summary\n\n{}\n", title, self.summary);
        if !self.approach.is_empty() {
            md.push_str(&format!("\n## Approach\n\n{}\n", self.approach));
        }
        push_list(&mut md, "Steps", &self.steps, true);
        push_list(&mut md, "Files to change", &self.files_to_change, false);
        push_list(&mut md, "Risks", &self.risks, false);
        if !self.test_strategy.is_empty() {
            md.push_str(&format!("\n## Test strategy\n\n{}\n", self.test_strategy));
        }
        md
    }
}

fn push_list(md: &mut String, heading: &str, items: &[String], numbered: bool) {
    if items.is_empty() {
        return;
    }
    md.push_str(&format!("\n## {}\n\n", heading));
    for (i, item) in items.iter().enumerate() {
        if numbered {
            md.push_str(&format!("{}. {}\n", i + 1, item));
        } else {
            md.push_str(&format!("- {}\n", item));
        }
    }
}

/// Structured output of the implementation agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImplementationOutput {
    pub summary: String,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub tests_added: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
}

/// Structured output of the refactoring agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefactoringOutput {
    pub summary: String,
    #[serde(default)]
    pub changes: Vec<String>,
}

/// Structured output of the PR split agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrSplitOutput {
    pub plan: PrSplitPlan,
    #[serde(default)]
    pub rationale: String,
}

/// Artifact persisted once every child PR of a split has passed CI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrSplitRecord {
    pub plan: PrSplitPlan,
    pub result: PrSplitResult,
    pub attempts: u32,
}
