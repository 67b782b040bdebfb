//! Workflow scenarios driven end to end through the orchestrator with
//! scripted collaborators.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use shepherd::ci::poller::DEFAULT_E2E_PATTERN;
use shepherd::ci::{CheckJob, CiPoller, FailureClassifier, PollConfig};
use shepherd::errors::{CiError, OrchestratorError};
use shepherd::github::PrInfo;
use shepherd::orchestrator::{Collaborators, ConfirmDecision, Orchestrator, Settings};
use shepherd::phase::{Phase, PhaseStatus};
use shepherd::prompts::TemplatePrompts;
use shepherd::split::PrSplitResult;
use shepherd::state::StateStore;
use shepherd::testing::{
    FakeClock, FakeGit, FakePrClient, FakeWorktrees, OpLog, ScriptedAgent, ScriptedCi,
    ScriptedConfirmer,
};
use shepherd::workflow::{
    FailureType, PrMetrics, PrSplitRecord, WorkflowState, WorkflowStatus, WorkflowType,
};

const NAME: &str = "auth-feature";
const PLAN: &str = r#"{"summary": "Add JWT auth", "steps": ["add middleware", "add tests"]}"#;
const IMPLEMENTATION: &str = r#"Done. {"summary": "middleware added", "pr_number": 42}"#;
const REFACTORING: &str = r#"{"summary": "extracted token helpers"}"#;
const SPLIT: &str = r#"{
    "plan": {
        "strategy": "commits",
        "parent_title": "JWT auth",
        "children": [
            {"title": "Part 1", "commits": ["c1"]},
            {"title": "Part 2", "commits": ["c2"]}
        ]
    },
    "rationale": "middleware first, tests second"
}"#;

struct Harness {
    _dir: TempDir,
    base: PathBuf,
    worktree_root: PathBuf,
    log: OpLog,
    agent: Arc<ScriptedAgent>,
    git: Arc<FakeGit>,
    prs: Arc<FakePrClient>,
    ci: Arc<ScriptedCi>,
    clock: Arc<FakeClock>,
    confirmer: Arc<ScriptedConfirmer>,
}

impl Harness {
    fn new(confirmer: ScriptedConfirmer) -> Self {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("workflows");
        let worktree_root = dir.path().join("worktrees");
        let log = OpLog::default();
        Self {
            base,
            worktree_root,
            agent: Arc::new(ScriptedAgent::new()),
            git: Arc::new(FakeGit::new(log.clone())),
            prs: Arc::new(FakePrClient::new(log.clone())),
            ci: Arc::new(ScriptedCi::new()),
            clock: Arc::new(FakeClock::new()),
            confirmer: Arc::new(confirmer),
            log,
            _dir: dir,
        }
    }

    /// A harness whose agent answers every phase and whose CI always passes.
    fn scripted() -> Self {
        let h = Self::new(ScriptedConfirmer::approving());
        h.agent.respond(Phase::Planning, PLAN);
        h.agent.respond(Phase::Implementation, IMPLEMENTATION);
        h.agent.respond(Phase::Refactoring, REFACTORING);
        h.ci.always(vec![CheckJob::new("test", "SUCCESS")]);
        h
    }

    fn orchestrator(&self, settings: Settings) -> Orchestrator {
        self.orchestrator_with(settings, self.worktrees())
    }

    fn worktrees(&self) -> FakeWorktrees {
        FakeWorktrees::new(&self.worktree_root, self.log.clone())
    }

    fn orchestrator_with(&self, settings: Settings, worktrees: FakeWorktrees) -> Orchestrator {
        let config = PollConfig::new(
            Duration::from_secs(5),
            Duration::from_secs(10),
            Duration::from_secs(600),
            DEFAULT_E2E_PATTERN,
        )
        .unwrap();
        let collab = Collaborators {
            agent: self.agent.clone(),
            git: self.git.clone(),
            prs: self.prs.clone(),
            worktrees: Arc::new(worktrees),
            prompts: Arc::new(TemplatePrompts),
            confirmer: self.confirmer.clone(),
            ci: CiPoller::new(
                self.ci.clone(),
                self.clock.clone(),
                config,
                FailureClassifier::default(),
            ),
        };
        Orchestrator::new(StateStore::new(&self.base), settings, collab)
    }

    async fn resume(&self, settings: Settings) -> Result<WorkflowState, OrchestratorError> {
        self.orchestrator(settings)
            .resume(NAME, &CancellationToken::new())
            .await
    }

    async fn start(&self, settings: Settings) -> Result<(), OrchestratorError> {
        self.orchestrator(settings)
            .start(NAME, "add JWT auth", WorkflowType::Feature, &CancellationToken::new())
            .await
            .map(|_| ())
    }
}

fn oversized() -> PrMetrics {
    PrMetrics {
        lines_added: 700,
        lines_removed: 100,
        files_added: vec![PathBuf::from("src/auth.rs")],
        ..PrMetrics::default()
    }
}

#[tokio::test]
async fn happy_path_completes_without_split() {
    let h = Harness::scripted();
    h.start(Settings::default()).await.unwrap();

    let state = h.orchestrator(Settings::default()).status(NAME).unwrap();
    assert_eq!(state.current_phase, Phase::Completed);
    assert_eq!(state.status(), WorkflowStatus::Completed);
    assert!(state.error.is_none());
    assert_eq!(state.pr_number, Some(42));
    assert_eq!(state.branch.as_deref(), Some("shepherd/auth-feature"));
    assert_eq!(state.phase(Phase::PrSplit).status, PhaseStatus::Skipped);
    assert_eq!(state.phase(Phase::PrSplit).required, Some(false));
    for phase in [Phase::Planning, Phase::Confirmation, Phase::Implementation, Phase::Refactoring] {
        assert_eq!(state.phase(phase).status, PhaseStatus::Completed, "{}", phase);
    }

    assert_eq!(h.log.entries(), vec!["worktree_add auth-feature from main".to_string()]);
    assert_eq!(h.confirmer.seen(), vec!["Add JWT auth".to_string()]);
    let worktree = h.worktree_root.join(NAME);
    assert!(h.agent.calls().iter().all(|c| c.working_dir == worktree));
    assert_eq!(h.ci.checks(), vec![42, 42]);
}

#[tokio::test]
async fn ci_failures_exhaust_fix_attempts_then_resume_uses_fix_prompt() {
    let h = Harness::scripted();
    h.ci.always(vec![
        CheckJob::new("build", "SUCCESS"),
        CheckJob::new("test", "FAILURE"),
    ]);

    let err = h.start(Settings::default()).await.unwrap_err();
    assert!(matches!(
        err.root(),
        OrchestratorError::FixAttemptsExceeded { phase: Phase::Implementation, attempts: 3 }
    ));

    let state = h.orchestrator(Settings::default()).status(NAME).unwrap();
    assert_eq!(state.current_phase, Phase::Failed);
    assert_eq!(state.status(), WorkflowStatus::Failed);
    let error = state.error.clone().unwrap();
    assert_eq!(error.phase, Phase::Implementation);
    assert_eq!(error.failure_type, FailureType::Ci);
    assert!(error.recoverable);
    assert_eq!(state.phase(Phase::Implementation).attempts, 3);
    assert_eq!(state.phase(Phase::Implementation).status, PhaseStatus::Failed);
    assert_eq!(h.ci.checks(), vec![42, 42, 42]);

    let prompts = h.agent.prompts(Phase::Implementation);
    assert_eq!(prompts.len(), 3);
    assert!(!prompts[0].contains("CI failed"));
    assert!(prompts[1].contains("fix attempt 2"));
    assert!(prompts[1].contains("Failed jobs: test"));
    assert!(prompts[2].contains("fix attempt 3"));

    // CI is green from now on.
    h.ci.push(42, vec![CheckJob::new("test", "SUCCESS")]);
    let state = h
        .orchestrator(Settings::default())
        .resume(NAME, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(state.current_phase, Phase::Completed);
    assert!(state.error.is_none());
    assert_eq!(state.phase(Phase::Implementation).attempts, 2);
    let prompts = h.agent.prompts(Phase::Implementation);
    assert_eq!(prompts.len(), 4);
    assert!(prompts[3].contains("fix attempt 2"));
}

#[tokio::test]
async fn rejected_plan_goes_back_to_planning_with_feedback() {
    let h = Harness::new(ScriptedConfirmer::new(vec![
        ConfirmDecision::Reject {
            feedback: "cover token refresh".into(),
        },
        ConfirmDecision::Approve,
    ]));
    h.agent.respond(Phase::Planning, r#"{"summary": "first plan"}"#);
    h.agent.respond(Phase::Planning, r#"{"summary": "second plan"}"#);
    h.agent.respond(Phase::Implementation, IMPLEMENTATION);
    h.agent.respond(Phase::Refactoring, REFACTORING);
    h.ci.always(vec![CheckJob::new("test", "SUCCESS")]);

    h.start(Settings::default()).await.unwrap();

    assert_eq!(
        h.confirmer.seen(),
        vec!["first plan".to_string(), "second plan".to_string()]
    );
    let prompts = h.agent.prompts(Phase::Planning);
    assert_eq!(prompts.len(), 2);
    assert!(!prompts[0].contains("cover token refresh"));
    assert!(prompts[1].contains("cover token refresh"));

    let state = h.orchestrator(Settings::default()).status(NAME).unwrap();
    assert_eq!(state.phase(Phase::Planning).attempts, 2);
    assert_eq!(state.phase(Phase::Confirmation).status, PhaseStatus::Completed);
    assert_eq!(state.phase(Phase::Confirmation).attempts, 2);
    assert_eq!(state.current_phase, Phase::Completed);
}

#[tokio::test]
async fn aborted_confirmation_is_resumable() {
    let h = Harness::new(ScriptedConfirmer::new(vec![
        ConfirmDecision::Abort,
        ConfirmDecision::Approve,
    ]));
    h.agent.respond(Phase::Planning, PLAN);
    h.agent.respond(Phase::Implementation, IMPLEMENTATION);
    h.agent.respond(Phase::Refactoring, REFACTORING);
    h.ci.always(vec![CheckJob::new("test", "SUCCESS")]);

    let err = h.start(Settings::default()).await.unwrap_err();
    assert!(err.is_cancelled());
    let state = h.orchestrator(Settings::default()).status(NAME).unwrap();
    assert_eq!(state.current_phase, Phase::Confirmation);
    assert!(state.error.is_none());

    let state = h
        .orchestrator(Settings::default())
        .resume(NAME, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(state.current_phase, Phase::Completed);
    assert_eq!(h.confirmer.seen().len(), 2);
    assert_eq!(h.agent.prompts(Phase::Planning).len(), 1);
    assert_eq!(state.phase(Phase::Confirmation).attempts, 2);
}

#[tokio::test]
async fn cancellation_mid_phase_keeps_workflow_in_progress() {
    let h = Harness::new(ScriptedConfirmer::approving());
    let cancel = CancellationToken::new();
    h.agent.respond(Phase::Planning, PLAN);
    h.agent.cancel_on(Phase::Implementation, cancel.clone());
    h.agent.respond(Phase::Implementation, IMPLEMENTATION);
    h.agent.respond(Phase::Refactoring, REFACTORING);
    h.ci.always(vec![CheckJob::new("test", "SUCCESS")]);

    let err = h
        .orchestrator(Settings::default())
        .start(NAME, "add JWT auth", WorkflowType::Feature, &cancel)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());

    let state = h.orchestrator(Settings::default()).status(NAME).unwrap();
    assert_eq!(state.current_phase, Phase::Implementation);
    assert_eq!(state.status(), WorkflowStatus::InProgress);
    assert!(state.error.is_none());

    let state = h
        .orchestrator(Settings::default())
        .resume(NAME, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(state.current_phase, Phase::Completed);
    assert_eq!(state.phase(Phase::Implementation).attempts, 1);
}

#[tokio::test]
async fn oversized_change_is_split_into_stacked_prs() {
    let h = Harness::scripted();
    h.agent.respond(Phase::PrSplit, SPLIT);
    h.git.set_metrics(oversized());
    h.git.set_commits(vec!["c1".into(), "c2".into()]);

    h.start(Settings::default()).await.unwrap();

    let orchestrator = h.orchestrator(Settings::default());
    let state = orchestrator.status(NAME).unwrap();
    assert_eq!(state.current_phase, Phase::Completed);
    assert_eq!(state.phase(Phase::PrSplit).required, Some(true));
    assert_eq!(state.phase(Phase::PrSplit).status, PhaseStatus::Completed);
    assert_eq!(
        state.phase(Phase::Refactoring).metrics.as_ref().map(|m| m.total_lines),
        Some(800)
    );

    let entries = h.log.entries();
    for expected in [
        "create_branch shepherd/auth-feature-split from main",
        "create_pr #100 shepherd/auth-feature-split -> main",
        "cherry_pick c1",
        "create_pr #101 shepherd/auth-feature-split-1 -> shepherd/auth-feature-split",
        "cherry_pick c2",
        "create_pr #102 shepherd/auth-feature-split-2 -> shepherd/auth-feature-split-1",
        "edit_pr #100",
    ] {
        assert!(entries.iter().any(|e| e == expected), "missing {:?} in {:?}", expected, entries);
    }
    assert!(!entries.iter().any(|e| e.starts_with("close_pr")));
    assert!(h.prs.body(100).unwrap().contains("#101"));
    assert_eq!(h.ci.checks(), vec![42, 42, 101, 102]);

    let record: PrSplitRecord = orchestrator
        .store()
        .load_phase_output(NAME, Phase::PrSplit)
        .unwrap();
    assert_eq!(record.attempts, 1);
    assert_eq!(record.result.children.len(), 2);
    assert_eq!(orchestrator.store().load_split_progress(NAME).unwrap(), None);
}

#[tokio::test]
async fn failed_child_ci_rolls_back_and_retries_split() {
    let h = Harness::scripted();
    h.agent.respond(Phase::PrSplit, SPLIT);
    h.git.set_metrics(oversized());
    h.git.set_commits(vec!["c1".into(), "c2".into()]);
    h.ci.push(102, vec![CheckJob::new("test", "FAILURE")]);

    h.start(Settings::default()).await.unwrap();

    let entries = h.log.entries();
    let pos = |needle: &str| entries.iter().position(|e| e == needle);
    let close_child = pos("close_pr #102").expect("child PR closed");
    let close_parent = pos("close_pr #100").expect("parent PR closed");
    assert!(close_child < close_parent);
    assert!(pos("delete_remote shepherd/auth-feature-split-2").is_some());
    assert!(pos("delete_local shepherd/auth-feature-split").is_some());
    assert!(pos("create_pr #103 shepherd/auth-feature-split -> main").unwrap() > close_parent);

    let prompts = h.agent.prompts(Phase::PrSplit);
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].contains("Split attempt 1 failed"));
    assert!(prompts[1].contains("#102"));

    let state = h.orchestrator(Settings::default()).status(NAME).unwrap();
    assert_eq!(state.current_phase, Phase::Completed);
    assert_eq!(state.phase(Phase::PrSplit).attempts, 2);
}

#[tokio::test]
async fn split_attempts_exhausted_fails_as_execution() {
    let h = Harness::scripted();
    h.agent
        .respond(Phase::PrSplit, r#"{"plan": {"strategy": "files", "parent_title": "x", "children": []}}"#);
    h.git.set_metrics(oversized());

    let err = h.start(Settings::default()).await.unwrap_err();
    assert!(matches!(
        err.root(),
        OrchestratorError::SplitAttemptsExceeded { attempts: 2 }
    ));

    let state = h.orchestrator(Settings::default()).status(NAME).unwrap();
    let error = state.error.as_ref().unwrap();
    assert_eq!(error.phase, Phase::PrSplit);
    assert_eq!(error.failure_type, FailureType::Execution);
    assert!(error.recoverable);
    assert_eq!(state.phase(Phase::PrSplit).feedback.len(), 2);
}

#[tokio::test]
async fn duplicate_start_is_rejected_and_delete_removes_everything() {
    let h = Harness::scripted();
    h.start(Settings::default()).await.unwrap();

    let err = h.start(Settings::default()).await.unwrap_err();
    assert!(err.to_string().contains("already exists"));

    let orchestrator = h.orchestrator(Settings::default());
    assert_eq!(orchestrator.list().unwrap().len(), 1);
    let removed = orchestrator.clean().await.unwrap();
    assert_eq!(removed, vec![NAME.to_string()]);
    assert!(orchestrator.list().unwrap().is_empty());
    assert!(
        h.log
            .entries()
            .iter()
            .any(|e| e.starts_with("worktree_remove"))
    );
    assert!(orchestrator.status(NAME).is_err());
}

#[tokio::test]
async fn invalid_name_is_a_validation_error() {
    let h = Harness::scripted();
    let err = h
        .orchestrator(Settings::default())
        .start("../escape", "x", WorkflowType::Fix, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));
    assert!(!err.is_recoverable());
    assert!(h.agent.calls().is_empty());
}

#[tokio::test]
async fn failed_worktree_creation_is_retried_on_resume() {
    let h = Harness::scripted();
    let broken = h.worktrees();
    broken.fail_create();

    let err = h
        .orchestrator_with(Settings::default(), broken)
        .start(NAME, "add JWT auth", WorkflowType::Feature, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_recoverable());
    assert!(h.agent.calls().is_empty());

    let state = h.orchestrator(Settings::default()).status(NAME).unwrap();
    assert_eq!(state.current_phase, Phase::Failed);
    assert!(state.worktree_path.is_none());
    let error = state.error.unwrap();
    assert_eq!(error.phase, Phase::Planning);
    assert!(error.recoverable);

    let state = h.resume(Settings::default()).await.unwrap();
    assert_eq!(state.current_phase, Phase::Completed);
    assert_eq!(state.worktree_path, Some(h.worktree_root.join(NAME)));
    assert_eq!(state.branch.as_deref(), Some("shepherd/auth-feature"));
    let adds = h
        .log
        .entries()
        .into_iter()
        .filter(|e| e.starts_with("worktree_add"))
        .count();
    assert_eq!(adds, 2);
}

#[tokio::test]
async fn ci_command_error_resumes_fix_loop_with_its_reason() {
    let h = Harness::scripted();
    h.ci.push_error(42, CiError::Command("gh: HTTP 502".into()));

    let err = h.start(Settings::default()).await.unwrap_err();
    assert!(matches!(err.root(), OrchestratorError::Ci(CiError::Command(_))));

    let state = h.orchestrator(Settings::default()).status(NAME).unwrap();
    let error = state.error.clone().unwrap();
    assert_eq!(error.phase, Phase::Implementation);
    assert_eq!(error.failure_type, FailureType::Ci);
    assert!(error.recoverable);
    let implementation = state.phase(Phase::Implementation);
    let feedback = implementation.last_feedback().unwrap();
    assert!(feedback.contains("CI status could not be determined"));
    assert!(feedback.contains("HTTP 502"));

    let state = h.resume(Settings::default()).await.unwrap();
    assert_eq!(state.current_phase, Phase::Completed);
    assert_eq!(state.phase(Phase::Implementation).attempts, 2);
    let prompts = h.agent.prompts(Phase::Implementation);
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].contains("fix attempt 2"));
    assert!(prompts[1].contains("CI status could not be determined"));
}

#[tokio::test]
async fn repeated_cancelled_jobs_stop_the_fix_loop_early() {
    let h = Harness::scripted();
    h.ci.always(vec![
        CheckJob::new("build", "SUCCESS"),
        CheckJob::new("test", "CANCELLED"),
    ]);
    let settings = Settings {
        max_fix_attempts: 5,
        ..Settings::default()
    };

    let err = h.start(settings.clone()).await.unwrap_err();
    match err.root() {
        OrchestratorError::PersistentFailure { phase, action } => {
            assert_eq!(*phase, Phase::Implementation);
            assert!(action.contains("stop retrying"));
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(h.ci.reruns(), vec![42, 42, 42]);
    let state = h.orchestrator(settings).status(NAME).unwrap();
    assert_eq!(state.phase(Phase::Implementation).attempts, 3);
    let error = state.error.unwrap();
    assert_eq!(error.failure_type, FailureType::Ci);
    assert!(error.recoverable);
}

#[tokio::test]
async fn refactoring_fix_loop_exhausts_attempts_and_resumes_in_refactoring() {
    let h = Harness::scripted();
    h.ci.push(42, vec![CheckJob::new("test", "SUCCESS")]);
    h.ci.push(42, vec![CheckJob::new("lint", "FAILURE")]);

    let err = h.start(Settings::default()).await.unwrap_err();
    assert!(matches!(
        err.root(),
        OrchestratorError::FixAttemptsExceeded { phase: Phase::Refactoring, attempts: 3 }
    ));

    let state = h.orchestrator(Settings::default()).status(NAME).unwrap();
    assert_eq!(state.phase(Phase::Implementation).status, PhaseStatus::Completed);
    assert_eq!(state.phase(Phase::Refactoring).status, PhaseStatus::Failed);
    assert_eq!(state.phase(Phase::Refactoring).attempts, 3);
    let error = state.error.unwrap();
    assert_eq!(error.phase, Phase::Refactoring);
    assert_eq!(error.failure_type, FailureType::Ci);
    let prompts = h.agent.prompts(Phase::Refactoring);
    assert_eq!(prompts.len(), 3);
    assert!(prompts[1].contains("Failed jobs: lint"));

    // One more red run, then green.
    h.ci.push(42, vec![CheckJob::new("test", "SUCCESS")]);
    let state = h.resume(Settings::default()).await.unwrap();
    assert_eq!(state.current_phase, Phase::Completed);
    assert_eq!(state.phase(Phase::Refactoring).attempts, 3);
    assert_eq!(h.agent.prompts(Phase::Implementation).len(), 1);
    let prompts = h.agent.prompts(Phase::Refactoring);
    assert_eq!(prompts.len(), 5);
    assert!(prompts[3].contains("fix attempt 2"));
}

#[tokio::test]
async fn split_left_by_an_interrupted_run_is_rolled_back_before_retrying() {
    let h = Harness::scripted();
    h.git.set_metrics(oversized());
    h.git.set_commits(vec!["c1".into(), "c2".into()]);

    // No split plan scripted yet, so the first run stops in the split phase.
    let err = h.start(Settings::default()).await.unwrap_err();
    assert!(err.is_recoverable());

    let source = "shepherd/auth-feature";
    let pr = |number: u64, head: &str, base: &str| PrInfo {
        number,
        url: format!("https://github.com/acme/app/pull/{}", number),
        title: format!("PR {}", number),
        base: base.to_string(),
        head: head.to_string(),
    };
    let stale = PrSplitResult {
        source_branch: source.to_string(),
        parent: Some(pr(90, "shepherd/auth-feature-split", "main")),
        children: vec![pr(91, "shepherd/auth-feature-split-1", "shepherd/auth-feature-split")],
        branches: vec![
            "shepherd/auth-feature-split".to_string(),
            "shepherd/auth-feature-split-1".to_string(),
        ],
    };
    let orchestrator = h.orchestrator(Settings::default());
    orchestrator.store().save_split_progress(NAME, &stale).unwrap();
    h.log.clear();

    h.agent.respond(Phase::PrSplit, SPLIT);
    let state = h.resume(Settings::default()).await.unwrap();
    assert_eq!(state.current_phase, Phase::Completed);

    let entries = h.log.entries();
    let pos = |needle: &str| entries.iter().position(|e| e == needle);
    let close_child = pos("close_pr #91").expect("stale child closed");
    let close_parent = pos("close_pr #90").expect("stale parent closed");
    assert!(close_child < close_parent);
    let delete_parent = pos("delete_local shepherd/auth-feature-split").expect("stale branch deleted");
    let recreate = pos("create_branch shepherd/auth-feature-split from main").expect("split retried");
    assert!(delete_parent < recreate);
    assert_eq!(orchestrator.store().load_split_progress(NAME).unwrap(), None);
}
