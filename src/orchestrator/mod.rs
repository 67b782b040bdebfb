//! The phase state machine.
//!
//! `Orchestrator` owns the state store and drives one workflow at a time
//! through Planning, Confirmation, Implementation, Refactoring, PR split and
//! Completed. Every external system is reached through a trait object in
//! [`Collaborators`], so tests can substitute scripted doubles.

pub mod confirm;
mod engine;
mod phases;

use std::sync::Arc;
use std::time::Duration;

use crate::agent::{AgentExecutor, AgentProgress};
use crate::ci::{CiPoller, CiProgress};
use crate::git::{GitClient, WorktreeManager};
use crate::github::PullRequestClient;
use crate::phase::Phase;
use crate::prompts::PromptGenerator;

pub use confirm::{AutoApprove, ConfirmDecision, Confirmer, InteractiveConfirmer};
pub use engine::Orchestrator;

/// Limits and timeouts the state machine runs under.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub main_branch: String,
    pub max_fix_attempts: u32,
    pub max_split_attempts: u32,
    pub max_lines: usize,
    pub max_files: usize,
    pub planning_timeout: Duration,
    pub implementation_timeout: Duration,
    pub refactoring_timeout: Duration,
    pub pr_split_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            main_branch: "main".to_string(),
            max_fix_attempts: 3,
            max_split_attempts: 2,
            max_lines: 500,
            max_files: 20,
            planning_timeout: Duration::from_secs(600),
            implementation_timeout: Duration::from_secs(1800),
            refactoring_timeout: Duration::from_secs(1200),
            pr_split_timeout: Duration::from_secs(600),
        }
    }
}

impl Settings {
    pub fn agent_timeout(&self, phase: Phase) -> Duration {
        match phase {
            Phase::Implementation => self.implementation_timeout,
            Phase::Refactoring => self.refactoring_timeout,
            Phase::PrSplit => self.pr_split_timeout,
            _ => self.planning_timeout,
        }
    }
}

/// External systems the orchestrator talks to.
pub struct Collaborators {
    pub agent: Arc<dyn AgentExecutor>,
    pub git: Arc<dyn GitClient>,
    pub prs: Arc<dyn PullRequestClient>,
    pub worktrees: Arc<dyn WorktreeManager>,
    pub prompts: Arc<dyn PromptGenerator>,
    pub confirmer: Arc<dyn Confirmer>,
    pub ci: CiPoller,
}

/// Display hooks. Never consulted for control flow.
pub trait WorkflowObserver: Send + Sync {
    fn phase_started(&self, _workflow: &str, _phase: Phase, _attempt: u32) {}

    fn phase_finished(&self, _workflow: &str, _phase: Phase, _next: Phase) {}

    fn agent_progress(&self, _event: &AgentProgress) {}

    fn ci_progress(&self, _event: &CiProgress) {}

    fn notice(&self, _message: &str) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl WorkflowObserver for NoopObserver {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_timeout_per_phase() {
        let settings = Settings {
            planning_timeout: Duration::from_secs(1),
            implementation_timeout: Duration::from_secs(2),
            refactoring_timeout: Duration::from_secs(3),
            pr_split_timeout: Duration::from_secs(4),
            ..Settings::default()
        };
        assert_eq!(settings.agent_timeout(Phase::Planning), Duration::from_secs(1));
        assert_eq!(settings.agent_timeout(Phase::Implementation), Duration::from_secs(2));
        assert_eq!(settings.agent_timeout(Phase::Refactoring), Duration::from_secs(3));
        assert_eq!(settings.agent_timeout(Phase::PrSplit), Duration::from_secs(4));
    }
}
