//! Phase handlers. Each returns the phase to move to next.

use std::path::Path;
use tokio_util::sync::CancellationToken;

use super::confirm::ConfirmDecision;
use super::engine::Orchestrator;
use crate::ci::{CiFailureHistory, CiProgress, FailureCategory, PollOptions};
use crate::errors::{CiError, OrchestratorError};
use crate::github::pr_number_from_url;
use crate::phase::{Phase, PhaseState, PhaseStatus};
use crate::prompts::SplitContext;
use crate::split::PrSplitResult;
use crate::workflow::{
    ImplementationOutput, PlanOutput, PrSplitOutput, PrSplitRecord, RefactoringOutput,
    WorkflowState,
};

const DEFAULT_REJECT_FEEDBACK: &str = "The operator rejected the plan without comments; revise it.";

impl Orchestrator {
    pub(super) async fn run_planning(
        &self,
        state: &mut WorkflowState,
        cancel: &CancellationToken,
    ) -> Result<Phase, OrchestratorError> {
        let attempt = state.phase(Phase::Planning).attempts + 1;
        self.begin_attempt(state, Phase::Planning, attempt)?;

        let feedback = state.phase(Phase::Planning).feedback;
        let prompt = self.collab.prompts.planning(state, &feedback);
        let plan: PlanOutput = self
            .invoke_agent(state, Phase::Planning, attempt, prompt, cancel)
            .await?;
        if plan.summary.trim().is_empty() && plan.steps.is_empty() {
            return Err(OrchestratorError::Parse {
                phase: Phase::Planning,
                message: "plan has neither a summary nor steps".into(),
            });
        }

        self.store.save_plan(&state.name, &plan)?;
        self.store
            .save_plan_markdown(&state.name, &plan.to_markdown(&state.name))?;
        state.phase_mut(Phase::Planning).mark_completed();
        Ok(Phase::Confirmation)
    }

    pub(super) async fn run_confirmation(
        &self,
        state: &mut WorkflowState,
    ) -> Result<Phase, OrchestratorError> {
        let plan = self.store.load_plan(&state.name)?;
        // Counts how many times a plan was put in front of the operator.
        let attempt = state.phase(Phase::Confirmation).attempts + 1;
        self.begin_attempt(state, Phase::Confirmation, attempt)?;

        let markdown = plan.to_markdown(&state.name);
        let decision = self
            .collab
            .confirmer
            .confirm(&state.name, &plan, &markdown)
            .await
            .map_err(OrchestratorError::Confirmation)?;

        match decision {
            ConfirmDecision::Approve => {
                tracing::info!(workflow = %state.name, "plan approved");
                state.phase_mut(Phase::Confirmation).mark_completed();
                Ok(Phase::Implementation)
            }
            ConfirmDecision::Reject { feedback } => {
                let feedback = match feedback.trim() {
                    "" => DEFAULT_REJECT_FEEDBACK.to_string(),
                    text => text.to_string(),
                };
                tracing::info!(workflow = %state.name, feedback = %feedback, "plan rejected");
                let planning = state.phase_mut(Phase::Planning);
                planning.feedback.push(feedback);
                planning.mark_in_progress();
                *state.phase_mut(Phase::Confirmation) = PhaseState {
                    attempts: attempt,
                    ..PhaseState::pending()
                };
                Ok(Phase::Planning)
            }
            ConfirmDecision::Abort => {
                tracing::info!(workflow = %state.name, "confirmation aborted by operator");
                Err(OrchestratorError::Cancelled)
            }
        }
    }

    /// Implementation or Refactoring: run the agent, then poll CI, feeding each
    /// failure back into the next attempt until CI passes or attempts run out.
    pub(super) async fn run_fix_phase(
        &self,
        state: &mut WorkflowState,
        phase: Phase,
        cancel: &CancellationToken,
    ) -> Result<Phase, OrchestratorError> {
        let max_attempts = self.settings.max_fix_attempts.max(1);
        let dir = self.work_dir(state)?;
        let current = state.phase(phase);
        let mut attempt = match current.status {
            PhaseStatus::InProgress if current.attempts > 0 => current.attempts,
            _ => 1,
        };
        let mut history = CiFailureHistory::new();

        loop {
            if attempt > max_attempts {
                return Err(OrchestratorError::FixAttemptsExceeded {
                    phase,
                    attempts: max_attempts,
                });
            }
            self.begin_attempt(state, phase, attempt)?;

            let prompt = match state.phase(phase).last_feedback() {
                Some(failure) if attempt > 1 => {
                    self.collab.prompts.fix_ci(state, phase, failure, attempt)
                }
                _ => self.phase_prompt(state, phase)?,
            };

            let reported_pr = if phase == Phase::Implementation {
                let output: ImplementationOutput = self
                    .invoke_agent(state, phase, attempt, prompt, cancel)
                    .await?;
                output
                    .pr_number
                    .or_else(|| output.pr_url.as_deref().and_then(pr_number_from_url))
            } else {
                let _: RefactoringOutput = self
                    .invoke_agent(state, phase, attempt, prompt, cancel)
                    .await?;
                None
            };

            let pr = self.resolve_pr(state, reported_pr, &dir).await?;
            if state.pr_number != Some(pr) {
                state.pr_number = Some(pr);
                self.store.save_state(&state.name.clone(), state)?;
            }

            let observer = self.observer.clone();
            let progress = move |event: CiProgress| observer.ci_progress(&event);
            let outcome = match self
                .collab
                .ci
                .wait_for_ci(&dir, pr, PollOptions::default(), &mut history, cancel, &progress)
                .await
            {
                Ok(outcome) => outcome,
                Err(CiError::Cancelled) => return Err(CiError::Cancelled.into()),
                Err(e) => {
                    // Keep the reason so a resumed fix loop has something to act on.
                    state
                        .phase_mut(phase)
                        .feedback
                        .push(format!("CI status could not be determined: {}", e));
                    self.store.save_state(&state.name.clone(), state)?;
                    return Err(e.into());
                }
            };

            if outcome.result.passed {
                tracing::info!(workflow = %state.name, phase = %phase, attempt, pr, "CI passed");
                break;
            }

            let failure = outcome.result.failure_summary();
            tracing::warn!(
                workflow = %state.name,
                phase = %phase,
                attempt,
                pr,
                failed = ?outcome.result.failed_jobs,
                cancelled = ?outcome.result.cancelled_jobs,
                "CI failed"
            );
            state.phase_mut(phase).feedback.push(failure);
            self.store.save_state(&state.name.clone(), state)?;

            if let Some(classified) = &outcome.classification
                && classified.category == FailureCategory::Persistent
            {
                return Err(OrchestratorError::PersistentFailure {
                    phase,
                    action: classified.recommended_action.clone(),
                });
            }
            if attempt >= max_attempts {
                return Err(OrchestratorError::FixAttemptsExceeded {
                    phase,
                    attempts: attempt,
                });
            }
            self.observer
                .notice(&format!("CI failed on attempt {}, asking the agent for a fix", attempt));
            attempt += 1;
        }

        match phase {
            Phase::Implementation => {
                state.phase_mut(phase).mark_completed();
                Ok(Phase::Refactoring)
            }
            _ => self.route_after_refactoring(state, &dir).await,
        }
    }

    fn phase_prompt(&self, state: &WorkflowState, phase: Phase) -> Result<String, OrchestratorError> {
        let prompts = &self.collab.prompts;
        Ok(match phase {
            Phase::Implementation => {
                let plan = self.store.load_plan(&state.name)?;
                prompts.implementation(state, &plan)
            }
            _ => {
                let plan = self.store.load_plan(&state.name).ok();
                prompts.refactoring(state, plan.as_ref())
            }
        })
    }

    /// PR number for the workflow branch: what the agent reported, else the
    /// stored number, else a lookup by branch.
    async fn resolve_pr(
        &self,
        state: &WorkflowState,
        reported: Option<u64>,
        dir: &Path,
    ) -> Result<u64, OrchestratorError> {
        if let Some(number) = reported.or(state.pr_number) {
            return Ok(number);
        }
        let branch = match &state.branch {
            Some(branch) => branch.clone(),
            None => self.collab.git.current_branch(dir).await?,
        };
        self.collab
            .prs
            .find_pr_for_branch(dir, &branch)
            .await?
            .ok_or(OrchestratorError::MissingPullRequest(branch))
    }

    /// Measure the change and decide whether it needs splitting.
    async fn route_after_refactoring(
        &self,
        state: &mut WorkflowState,
        dir: &Path,
    ) -> Result<Phase, OrchestratorError> {
        let metrics = self
            .collab
            .git
            .diff_stats(dir, &self.settings.main_branch)
            .await?;
        let needs_split = metrics.exceeds(self.settings.max_lines, self.settings.max_files);
        tracing::info!(
            workflow = %state.name,
            lines = metrics.total_lines,
            files = metrics.files_changed,
            max_lines = self.settings.max_lines,
            max_files = self.settings.max_files,
            needs_split,
            "measured change size"
        );

        let refactoring = state.phase_mut(Phase::Refactoring);
        refactoring.metrics = Some(metrics);
        refactoring.mark_completed();

        let split = state.phase_mut(Phase::PrSplit);
        split.required = Some(needs_split);
        if needs_split {
            Ok(Phase::PrSplit)
        } else {
            split.status = PhaseStatus::Skipped;
            Ok(Phase::Completed)
        }
    }

    /// Ask the agent for a split plan, execute it and verify CI on every
    /// child. Any failure rolls the split back and retries with feedback.
    pub(super) async fn run_pr_split(
        &self,
        state: &mut WorkflowState,
        cancel: &CancellationToken,
    ) -> Result<Phase, OrchestratorError> {
        let dir = self.work_dir(state)?;
        let main = self.settings.main_branch.clone();
        let source = match &state.branch {
            Some(branch) => branch.clone(),
            None => self.collab.git.current_branch(&dir).await?,
        };
        let metrics = match state.phase(Phase::Refactoring).metrics {
            Some(metrics) => metrics,
            None => self.collab.git.diff_stats(&dir, &main).await?,
        };
        let commits = self.collab.git.commits_since(&dir, &main).await?;
        let max_attempts = self.settings.max_split_attempts.max(1);

        if let Some(stale) = self.store.load_split_progress(&state.name)? {
            tracing::warn!(
                workflow = %state.name,
                branches = stale.branches.len(),
                "rolling back split left by an interrupted run"
            );
            self.observer
                .notice("Rolling back a PR split left by an interrupted run");
            self.rollback(&state.name, &stale, &dir).await?;
        }

        for attempt in 1..=max_attempts {
            self.begin_attempt(state, Phase::PrSplit, attempt)?;

            let feedback = state.phase(Phase::PrSplit).feedback;
            let prompt = self.collab.prompts.pr_split(
                state,
                SplitContext {
                    source_branch: &source,
                    main_branch: &main,
                    commits: &commits,
                    metrics: &metrics,
                    max_lines: self.settings.max_lines,
                    max_files: self.settings.max_files,
                    feedback: &feedback,
                },
            );

            let output: PrSplitOutput = match self
                .invoke_agent(state, Phase::PrSplit, attempt, prompt, cancel)
                .await
            {
                Ok(output) => output,
                Err(e @ OrchestratorError::Parse { .. }) => {
                    self.record_split_failure(state, attempt, &e.to_string())?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let name = state.name.clone();
            let store = &self.store;
            let record = move |progress: &PrSplitResult| {
                if let Err(e) = store.save_split_progress(&name, progress) {
                    tracing::warn!(workflow = %name, error = %e, "failed to record split progress");
                }
            };
            let result = match self
                .split
                .execute_split_recorded(&output.plan, &source, &main, &dir, &record)
                .await
            {
                Ok(result) => result,
                Err(failure) => {
                    self.rollback(&state.name, &failure.partial, &dir).await?;
                    self.record_split_failure(state, attempt, &failure.error.to_string())?;
                    continue;
                }
            };

            match self.verify_children(&result, &dir, cancel).await {
                Ok(None) => {
                    let record = PrSplitRecord {
                        plan: output.plan,
                        result,
                        attempts: attempt,
                    };
                    self.store
                        .save_phase_output(&state.name, Phase::PrSplit, &record)?;
                    self.store.clear_split_progress(&state.name)?;
                    state.phase_mut(Phase::PrSplit).mark_completed();
                    tracing::info!(
                        workflow = %state.name,
                        children = record.result.children.len(),
                        attempt,
                        "PR split verified"
                    );
                    return Ok(Phase::Completed);
                }
                Ok(Some(failure)) => {
                    self.rollback(&state.name, &result, &dir).await?;
                    self.record_split_failure(state, attempt, &failure)?;
                }
                Err(CiError::Cancelled) => {
                    self.rollback(&state.name, &result, &dir).await?;
                    return Err(CiError::Cancelled.into());
                }
                Err(e) => {
                    self.rollback(&state.name, &result, &dir).await?;
                    self.record_split_failure(state, attempt, &e.to_string())?;
                }
            }
        }

        Err(OrchestratorError::SplitAttemptsExceeded {
            attempts: max_attempts,
        })
    }

    /// Wait for CI on each child PR in order. Returns the first failure text.
    async fn verify_children(
        &self,
        result: &PrSplitResult,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, CiError> {
        let last = result.children.len().saturating_sub(1);
        for (i, child) in result.children.iter().enumerate() {
            let opts = PollOptions { skip_e2e: i < last };
            let mut history = CiFailureHistory::new();
            let observer = self.observer.clone();
            let progress = move |event: CiProgress| observer.ci_progress(&event);
            let outcome = self
                .collab
                .ci
                .wait_for_ci(dir, child.number, opts, &mut history, cancel, &progress)
                .await?;
            if !outcome.result.passed {
                return Ok(Some(format!(
                    "Child PR #{} ({}) failed CI.\n{}",
                    child.number,
                    child.title,
                    outcome.result.failure_summary()
                )));
            }
            tracing::info!(pr = child.number, skip_e2e = opts.skip_e2e, "child PR passed CI");
        }
        Ok(None)
    }

    /// Undo a split and forget its recorded progress. An incomplete rollback
    /// is reported but does not stop the workflow.
    async fn rollback(
        &self,
        name: &str,
        result: &PrSplitResult,
        dir: &Path,
    ) -> Result<(), OrchestratorError> {
        if let Err(e) = self.split.rollback(result, dir).await {
            tracing::warn!(workflow = %name, error = %e, "split rollback incomplete");
            self.observer.notice(&format!("Split rollback incomplete: {}", e));
        }
        self.store.clear_split_progress(name)?;
        Ok(())
    }

    fn record_split_failure(
        &self,
        state: &mut WorkflowState,
        attempt: u32,
        message: &str,
    ) -> Result<(), OrchestratorError> {
        tracing::warn!(workflow = %state.name, attempt, error = %message, "PR split attempt failed");
        state
            .phase_mut(Phase::PrSplit)
            .feedback
            .push(format!("Split attempt {} failed: {}", attempt, message));
        self.store.save_state(&state.name.clone(), state)?;
        Ok(())
    }
}
