//! Workflow phases and per-phase bookkeeping.
//!
//! This module provides:
//! - `Phase`, the fixed enumeration the state machine moves through
//! - `PhaseStatus`, the lifecycle of a single phase
//! - `PhaseState`, the persisted record of one phase (attempts, feedback, metrics)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::workflow::PrMetrics;

/// A stage of the workflow.
///
/// The derived ordering follows execution order; `Failed` sorts last and is
/// reachable from every other phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Confirmation,
    Implementation,
    Refactoring,
    PrSplit,
    Completed,
    Failed,
}

impl Phase {
    /// Every non-terminal-error phase in execution order.
    pub const ORDERED: [Phase; 6] = [
        Phase::Planning,
        Phase::Confirmation,
        Phase::Implementation,
        Phase::Refactoring,
        Phase::PrSplit,
        Phase::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Planning => "planning",
            Phase::Confirmation => "confirmation",
            Phase::Implementation => "implementation",
            Phase::Refactoring => "refactoring",
            Phase::PrSplit => "pr_split",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
        }
    }

    /// The phase that normally follows this one.
    pub fn next(&self) -> Option<Phase> {
        match self {
            Phase::Planning => Some(Phase::Confirmation),
            Phase::Confirmation => Some(Phase::Implementation),
            Phase::Implementation => Some(Phase::Refactoring),
            Phase::Refactoring => Some(Phase::PrSplit),
            Phase::PrSplit => Some(Phase::Completed),
            Phase::Completed | Phase::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }

    /// Phases that run the implement-then-poll-CI fix loop.
    pub fn has_fix_loop(&self) -> bool {
        matches!(self, Phase::Implementation | Phase::Refactoring)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "planning" => Ok(Phase::Planning),
            "confirmation" => Ok(Phase::Confirmation),
            "implementation" => Ok(Phase::Implementation),
            "refactoring" => Ok(Phase::Refactoring),
            "pr_split" | "prsplit" => Ok(Phase::PrSplit),
            "completed" => Ok(Phase::Completed),
            "failed" => Ok(Phase::Failed),
            other => Err(format!("invalid phase '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Skipped,
    Failed,
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::InProgress => "in_progress",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Skipped => "skipped",
            PhaseStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Persisted record of a single phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseState {
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Attempt counter; for fix-loop phases this is the current fix attempt.
    #[serde(default)]
    pub attempts: u32,
    /// Operator feedback (planning) or CI failure text (fix loops), oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub feedback: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<PrMetrics>,
}

impl PhaseState {
    pub fn pending() -> Self {
        Self::default()
    }

    pub fn in_progress() -> Self {
        Self {
            status: PhaseStatus::InProgress,
            started_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn mark_in_progress(&mut self) {
        self.status = PhaseStatus::InProgress;
        self.completed_at = None;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    pub fn mark_completed(&mut self) {
        self.status = PhaseStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn last_feedback(&self) -> Option<&str> {
        self.feedback.last().map(String::as_str)
    }
}
