use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{Collaborators, NoopObserver, Settings, WorkflowObserver};
use crate::agent::{AgentProgress, AgentRequest};
use crate::errors::{OrchestratorError, StateError};
use crate::phase::{Phase, PhaseStatus};
use crate::prompts::schema_for;
use crate::split::PrSplitManager;
use crate::state::{StateStore, validate_name};
use crate::util::parse_embedded_json;
use crate::workflow::{FailureType, WorkflowError, WorkflowState, WorkflowStatus, WorkflowSummary, WorkflowType};

/// Drives workflows through their phases and owns their persisted state.
pub struct Orchestrator {
    pub(super) store: StateStore,
    pub(super) settings: Settings,
    pub(super) collab: Collaborators,
    pub(super) split: PrSplitManager,
    pub(super) observer: Arc<dyn WorkflowObserver>,
}

fn validation(e: StateError) -> OrchestratorError {
    match e {
        StateError::InvalidName(_)
        | StateError::InvalidType(_)
        | StateError::EmptyDescription
        | StateError::InvalidPrompt(_) => OrchestratorError::Validation(e.to_string()),
        other => OrchestratorError::State(other),
    }
}

impl Orchestrator {
    pub fn new(store: StateStore, settings: Settings, collab: Collaborators) -> Self {
        let split = PrSplitManager::new(collab.git.clone(), collab.prs.clone());
        Self {
            store,
            settings,
            collab,
            split,
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn WorkflowObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Create a workflow, give it a worktree and run it until it completes,
    /// fails or is cancelled.
    pub async fn start(
        &self,
        name: &str,
        description: &str,
        workflow_type: WorkflowType,
        cancel: &CancellationToken,
    ) -> Result<WorkflowState, OrchestratorError> {
        validate_name(name).map_err(validation)?;
        if description.trim().is_empty() {
            return Err(validation(StateError::EmptyDescription));
        }

        let mut state = self
            .store
            .init_state(name, description, workflow_type)
            .map_err(validation)?;
        let _lock = self.store.lock(name)?;
        tracing::info!(workflow = name, r#type = %workflow_type, "starting workflow");

        if let Err(e) = self.ensure_worktree(&mut state).await {
            return Err(self.fail_workflow(&mut state, Phase::Planning, e, FailureType::Execution));
        }

        self.run_loop(&mut state, cancel).await?;
        Ok(state)
    }

    /// Continue a failed or interrupted workflow.
    pub async fn resume(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<WorkflowState, OrchestratorError> {
        self.store.load_state(name)?;
        let _lock = self.store.lock(name)?;
        let mut state = self.store.load_state(name)?;

        if state.current_phase == Phase::Completed {
            return Err(OrchestratorError::NotResumable {
                name: name.to_string(),
                reason: "workflow already completed".into(),
            });
        }
        if let Some(error) = &state.error
            && !error.recoverable
        {
            return Err(OrchestratorError::NotResumable {
                name: name.to_string(),
                reason: format!("last error is not recoverable: {}", error.message),
            });
        }

        let phase = prepare_resume(&mut state);
        tracing::info!(
            workflow = name,
            phase = %phase,
            attempt = state.phase(phase).attempts,
            "resuming workflow"
        );
        self.store.save_state(name, &mut state)?;

        if let Err(e) = self.ensure_worktree(&mut state).await {
            return Err(self.fail_workflow(&mut state, phase, e, FailureType::Execution));
        }

        self.run_loop(&mut state, cancel).await?;
        Ok(state)
    }

    /// Create the workflow's worktree unless one is already recorded.
    async fn ensure_worktree(&self, state: &mut WorkflowState) -> Result<(), OrchestratorError> {
        if state.worktree_path.is_some() {
            return Ok(());
        }
        let name = state.name.clone();
        let info = self
            .collab
            .worktrees
            .create(&name, &self.settings.main_branch)
            .await?;
        tracing::info!(
            workflow = %name,
            path = %info.path.display(),
            branch = %info.branch,
            "created worktree"
        );
        state.worktree_path = Some(info.path);
        state.branch = Some(info.branch);
        self.store.save_state(&name, state)?;
        Ok(())
    }

    pub fn status(&self, name: &str) -> Result<WorkflowState, OrchestratorError> {
        Ok(self.store.load_state(name)?)
    }

    pub fn list(&self) -> Result<Vec<WorkflowSummary>, OrchestratorError> {
        Ok(self.store.list_workflows()?)
    }

    /// Remove a workflow's worktree (best effort) and its state directory.
    pub async fn delete(&self, name: &str) -> Result<(), OrchestratorError> {
        validate_name(name).map_err(validation)?;
        if !self.store.workflow_dir(name)?.exists() {
            return Err(StateError::NotFound(name.to_string()).into());
        }
        let state = self.store.load_state(name).ok();
        let lock = self.store.lock(name)?;

        if let Some(path) = state.and_then(|s| s.worktree_path)
            && let Err(e) = self.collab.worktrees.remove(&path).await
        {
            tracing::warn!(workflow = name, path = %path.display(), error = %e, "failed to remove worktree");
        }
        drop(lock);
        self.store.delete_workflow(name)?;
        Ok(())
    }

    /// Delete every completed workflow. Locked workflows are skipped.
    pub async fn clean(&self) -> Result<Vec<String>, OrchestratorError> {
        let mut removed = Vec::new();
        for summary in self.store.list_workflows()? {
            if summary.status != WorkflowStatus::Completed {
                continue;
            }
            match self.delete(&summary.name).await {
                Ok(()) => removed.push(summary.name),
                Err(OrchestratorError::State(StateError::Locked(name))) => {
                    tracing::warn!(workflow = %name, "workflow is locked, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }

    /// Run phase handlers until the workflow reaches Completed or Failed.
    pub(super) async fn run_loop(
        &self,
        state: &mut WorkflowState,
        cancel: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        let name = state.name.clone();
        while !state.current_phase.is_terminal() {
            if cancel.is_cancelled() {
                self.store.save_state(&name, state)?;
                return Err(OrchestratorError::Cancelled);
            }

            let phase = state.current_phase;
            let outcome = match phase {
                Phase::Planning => self.run_planning(state, cancel).await,
                Phase::Confirmation => self.run_confirmation(state).await,
                Phase::Implementation | Phase::Refactoring => {
                    self.run_fix_phase(state, phase, cancel).await
                }
                Phase::PrSplit => self.run_pr_split(state, cancel).await,
                Phase::Completed | Phase::Failed => break,
            };

            match outcome {
                Ok(next) => {
                    tracing::info!(workflow = %name, from = %phase, to = %next, "phase transition");
                    state.current_phase = next;
                    self.store.save_state(&name, state)?;
                    self.observer.phase_finished(&name, phase, next);
                }
                Err(e) if e.is_cancelled() => {
                    tracing::info!(workflow = %name, phase = %phase, "workflow cancelled");
                    self.store.save_state(&name, state)?;
                    return Err(e);
                }
                Err(e) => {
                    // PR split failures always restart the phase from attempt one.
                    let failure_type = match phase {
                        Phase::PrSplit => FailureType::Execution,
                        _ => e.failure_type(),
                    };
                    return Err(self.fail_workflow(state, phase, e, failure_type));
                }
            }
        }

        if state.current_phase == Phase::Completed {
            state.phase_mut(Phase::Completed).mark_completed();
            state.error = None;
            self.store.save_state(&name, state)?;
            tracing::info!(workflow = %name, "workflow completed");
        }
        Ok(())
    }

    /// Record a failure on the state, persist it and return the error wrapped
    /// with its phase.
    pub(super) fn fail_workflow(
        &self,
        state: &mut WorkflowState,
        phase: Phase,
        error: OrchestratorError,
        failure_type: FailureType,
    ) -> OrchestratorError {
        let message = error.to_string();
        let recoverable = error.is_recoverable();
        state.error = Some(WorkflowError {
            message: message.clone(),
            phase,
            timestamp: Utc::now(),
            recoverable,
            failure_type,
        });
        let phase_state = state.phase_mut(phase);
        phase_state.status = PhaseStatus::Failed;
        phase_state.completed_at = None;
        state.current_phase = Phase::Failed;

        tracing::error!(
            workflow = %state.name,
            phase = %phase,
            recoverable,
            failure_type = ?failure_type,
            error = %message,
            "workflow failed"
        );

        let name = state.name.clone();
        if let Err(e) = self.store.save_state(&name, state) {
            tracing::error!(workflow = %name, error = %e, "failed to persist workflow failure");
            return OrchestratorError::State(e);
        }
        OrchestratorError::Phase {
            phase,
            source: Box::new(error),
        }
    }

    pub(super) fn work_dir(&self, state: &WorkflowState) -> Result<PathBuf, OrchestratorError> {
        state
            .worktree_path
            .clone()
            .ok_or_else(|| OrchestratorError::NotResumable {
                name: state.name.clone(),
                reason: "no worktree recorded for this workflow".into(),
            })
    }

    /// Mark a phase in progress with the given attempt number and persist.
    pub(super) fn begin_attempt(
        &self,
        state: &mut WorkflowState,
        phase: Phase,
        attempt: u32,
    ) -> Result<(), OrchestratorError> {
        let phase_state = state.phase_mut(phase);
        phase_state.mark_in_progress();
        phase_state.attempts = attempt;
        self.store.save_state(&state.name.clone(), state)?;
        tracing::info!(workflow = %state.name, phase = %phase, attempt, "phase attempt");
        self.observer.phase_started(&state.name, phase, attempt);
        Ok(())
    }

    /// Save the prompt, run the agent and parse its structured answer.
    ///
    /// The parsed answer is stored as the phase artifact; output that does not
    /// parse is kept next to it as raw text.
    pub(super) async fn invoke_agent<T: DeserializeOwned + Serialize>(
        &self,
        state: &WorkflowState,
        phase: Phase,
        attempt: u32,
        prompt: String,
        cancel: &CancellationToken,
    ) -> Result<T, OrchestratorError> {
        let name = &state.name;
        self.store.save_prompt(name, phase, attempt, &prompt)?;

        let mut request = AgentRequest::new(
            prompt,
            self.work_dir(state)?,
            self.settings.agent_timeout(phase),
        );
        if let Some(schema) = schema_for(phase) {
            request = request.with_schema(schema);
        }
        request
            .env
            .insert("SHEPHERD_WORKFLOW".to_string(), name.clone());
        request
            .env
            .insert("SHEPHERD_PHASE".to_string(), phase.to_string());

        let observer = self.observer.clone();
        let on_progress = move |event: AgentProgress| observer.agent_progress(&event);
        let response = self
            .collab
            .agent
            .execute_streaming(request, cancel, &on_progress)
            .await?;

        let parsed = match response.structured.clone() {
            Some(value) => serde_json::from_value(value).map_err(|e| e.to_string()),
            None => parse_embedded_json(&response.output),
        };
        match parsed {
            Ok(output) => {
                self.store.save_phase_output(name, phase, &output)?;
                Ok(output)
            }
            Err(message) => {
                let path = self.store.save_raw_output(name, phase, &response.output)?;
                tracing::warn!(
                    workflow = %name,
                    phase = %phase,
                    raw = %path.display(),
                    error = %message,
                    "agent output did not parse"
                );
                Err(OrchestratorError::Parse {
                    phase,
                    message: format!("{} (raw output saved to {})", message, path.display()),
                })
            }
        }
    }
}

/// Put a failed or interrupted workflow back into a runnable phase and
/// return that phase.
///
/// A CI failure in a fix loop keeps its feedback and re-enters the loop at
/// attempt two. Any other failure clears the attempt counter so the phase
/// starts over. An interrupted phase keeps its persisted attempt.
pub(crate) fn prepare_resume(state: &mut WorkflowState) -> Phase {
    if state.current_phase != Phase::Failed {
        let phase = state.current_phase;
        state.phase_mut(phase).mark_in_progress();
        return phase;
    }

    let error = state.error.take();
    let phase = error
        .as_ref()
        .map(|e| e.phase)
        .filter(|p| !p.is_terminal())
        .or_else(|| state.interrupted_phase())
        .unwrap_or(Phase::Planning);
    let failure_type = error.map(|e| e.failure_type).unwrap_or_default();

    state.current_phase = phase;
    let phase_state = state.phase_mut(phase);
    phase_state.mark_in_progress();
    if failure_type == FailureType::Ci
        && phase.has_fix_loop()
        && phase_state.last_feedback().is_some()
    {
        phase_state.attempts = 2;
    } else {
        phase_state.attempts = 0;
    }
    phase
}
