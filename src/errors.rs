//! Typed error hierarchy for shepherd.
//!
//! One enum per subsystem, composed by the orchestrator:
//! - `StateError`: workflow directory persistence and locking
//! - `AgentError`: agent subprocess failures
//! - `CiError`: check-status queries and polling
//! - `GitError`: git / gh command failures
//! - `SplitError`: PR split execution and rollback
//! - `OrchestratorError`: phase state machine failures

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::phase::Phase;
use crate::workflow::FailureType;

/// Errors from the workflow state store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Invalid workflow name '{0}': use 1-64 letters, digits, '-' or '_'")]
    InvalidName(String),

    #[error("Invalid workflow type '{0}': expected 'feature' or 'fix'")]
    InvalidType(String),

    #[error("Invalid description: must not be empty")]
    EmptyDescription,

    #[error("Invalid prompt: {0}")]
    InvalidPrompt(String),

    #[error("Workflow '{0}' already exists")]
    AlreadyExists(String),

    #[error("Workflow '{0}' not found")]
    NotFound(String),

    #[error("Corrupted state file at {path}: {source}")]
    Corrupted {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Workflow '{0}' is locked by another process")]
    Locked(String),

    #[error("Artifact not found at {0}")]
    ArtifactNotFound(PathBuf),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize {what}: {source}")]
    Serialize {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl StateError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StateError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors from an agent invocation.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Agent timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("Prompt is too long for the agent context window")]
    PromptTooLong,

    #[error("Agent failed with exit code {exit_code}: {message}")]
    Failed { exit_code: i32, message: String },

    #[error("Agent command '{0}' not found")]
    NotFound(String),

    #[error("Agent invocation cancelled")]
    Cancelled,

    #[error("Agent I/O error: {0}")]
    Io(#[source] std::io::Error),
}

/// Errors from CI status queries and polling.
#[derive(Debug, Error)]
pub enum CiError {
    #[error("CI check command timed out after {}s", .0.as_secs())]
    CommandTimeout(Duration),

    #[error("CI check command failed: {0}")]
    Command(String),

    #[error("Failed to parse CI check output: {0}")]
    Parse(String),

    #[error("CI polling timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("CI polling cancelled")]
    Cancelled,
}

impl CiError {
    /// Only a timeout of the underlying check command is worth polling again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CiError::CommandTimeout(_))
    }
}

/// Errors from git and gh subprocesses.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("`{command}` timed out after {}s", .timeout.as_secs())]
    Timeout { command: String, timeout: Duration },

    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unexpected output from `{command}`: {message}")]
    Output { command: String, message: String },

    #[error("Repository error: {0}")]
    Repository(String),
}

impl From<git2::Error> for GitError {
    fn from(e: git2::Error) -> Self {
        GitError::Repository(e.message().to_string())
    }
}

impl From<GitError> for CiError {
    fn from(e: GitError) -> Self {
        match e {
            GitError::Timeout { timeout, .. } => CiError::CommandTimeout(timeout),
            GitError::Output { message, .. } => CiError::Parse(message),
            other => CiError::Command(other.to_string()),
        }
    }
}

fn child_suffix(child: &Option<usize>) -> String {
    child
        .map(|i| format!(" (child {})", i + 1))
        .unwrap_or_default()
}

/// Errors from PR split execution and rollback.
#[derive(Debug, Error)]
pub enum SplitError {
    #[error("Invalid split plan: {0}")]
    InvalidPlan(String),

    #[error("Split step '{step}' failed{}: {source}", child_suffix(.child))]
    Step {
        step: &'static str,
        child: Option<usize>,
        #[source]
        source: GitError,
    },

    #[error("Rollback finished with {} error(s): {}", .0.len(), .0.join("; "))]
    Rollback(Vec<String>),
}

/// Errors from the phase state machine.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("Failed to parse agent output for {phase}: {message}")]
    Parse { phase: Phase, message: String },

    #[error(transparent)]
    Ci(#[from] CiError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Split(#[from] SplitError),

    #[error("Exceeded maximum fix attempts ({attempts}) in {phase}")]
    FixAttemptsExceeded { phase: Phase, attempts: u32 },

    #[error("Exceeded maximum PR split attempts ({attempts})")]
    SplitAttemptsExceeded { attempts: u32 },

    #[error("CI failure persists across attempts in {phase}: {action}")]
    PersistentFailure { phase: Phase, action: String },

    #[error("Plan confirmation failed: {0}")]
    Confirmation(#[source] std::io::Error),

    #[error("No pull request found for branch '{0}'")]
    MissingPullRequest(String),

    #[error("Workflow '{name}' cannot be resumed: {reason}")]
    NotResumable { name: String, reason: String },

    #[error("Workflow cancelled")]
    Cancelled,

    #[error("{phase} phase failed: {source}")]
    Phase {
        phase: Phase,
        #[source]
        source: Box<OrchestratorError>,
    },
}

impl OrchestratorError {
    /// The error underneath any phase wrapper.
    pub fn root(&self) -> &OrchestratorError {
        match self {
            OrchestratorError::Phase { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.root(),
            OrchestratorError::Cancelled
                | OrchestratorError::Agent(AgentError::Cancelled)
                | OrchestratorError::Ci(CiError::Cancelled)
        )
    }

    /// Whether `resume` may retry after this failure.
    ///
    /// Invalid input and workflows that cannot be resumed need operator
    /// action; timeouts, agent failures, parse errors and CI failures can be
    /// retried.
    pub fn is_recoverable(&self) -> bool {
        match self.root() {
            OrchestratorError::Validation(_) | OrchestratorError::NotResumable { .. } => false,
            OrchestratorError::State(e) => !matches!(
                e,
                StateError::InvalidName(_)
                    | StateError::InvalidType(_)
                    | StateError::EmptyDescription
                    | StateError::InvalidPrompt(_)
            ),
            _ => true,
        }
    }

    /// Which resume path a failure of a fix-loop phase takes.
    pub fn failure_type(&self) -> FailureType {
        match self.root() {
            OrchestratorError::Ci(_)
            | OrchestratorError::FixAttemptsExceeded { .. }
            | OrchestratorError::PersistentFailure { .. } => FailureType::Ci,
            _ => FailureType::Execution,
        }
    }
}
