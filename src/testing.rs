//! Scripted doubles for every collaborator trait.
//!
//! Used by the unit tests and by the workflow scenarios under `tests/`. Each
//! double records what it was asked to do so tests can assert on order.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentExecutor, AgentProgress, AgentRequest, AgentResponse};
use crate::ci::{CheckJob, CiChecker};
use crate::clock::{Clock, WaitOutcome};
use crate::errors::{AgentError, CiError, GitError};
use crate::git::{GitClient, WorktreeInfo, WorktreeManager};
use crate::github::{PrInfo, PrRequest, PullRequestClient};
use crate::orchestrator::{ConfirmDecision, Confirmer};
use crate::phase::Phase;
use crate::workflow::{PlanOutput, PrMetrics};

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Pop the next scripted item, repeating the last one once the queue is down
/// to a single entry.
fn next_or_repeat<T: Clone>(queue: &mut VecDeque<T>) -> Option<T> {
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

/// Virtual clock: waits return immediately and advance virtual time.
#[derive(Debug)]
pub struct FakeClock {
    start: Instant,
    offset: Mutex<Duration>,
    waits: Mutex<Vec<Duration>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
            waits: Mutex::new(Vec::new()),
        }
    }

    pub fn waits(&self) -> Vec<Duration> {
        guard(&self.waits).clone()
    }

    pub fn advance(&self, by: Duration) {
        *guard(&self.offset) += by;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.start + *guard(&self.offset)
    }

    async fn wait(&self, duration: Duration, cancel: &CancellationToken) -> WaitOutcome {
        if cancel.is_cancelled() {
            return WaitOutcome::Cancelled;
        }
        guard(&self.waits).push(duration);
        self.advance(duration);
        WaitOutcome::Elapsed
    }
}

#[derive(Debug, Clone)]
enum CiScript {
    Jobs(Vec<CheckJob>),
    Error(Arc<Mutex<Option<CiError>>>),
}

/// CI checker answering from per-PR scripts.
///
/// A PR without a script falls back to the jobs given to [`ScriptedCi::always`].
#[derive(Debug, Default)]
pub struct ScriptedCi {
    scripts: Mutex<HashMap<u64, VecDeque<CiScript>>>,
    fallback: Mutex<Option<Vec<CheckJob>>>,
    checks: Mutex<Vec<u64>>,
    reruns: Mutex<Vec<u64>>,
}

impl ScriptedCi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, pr: u64, jobs: Vec<CheckJob>) {
        guard(&self.scripts)
            .entry(pr)
            .or_default()
            .push_back(CiScript::Jobs(jobs));
    }

    /// Queue an error. Errors are returned once and never repeated.
    pub fn push_error(&self, pr: u64, error: CiError) {
        guard(&self.scripts)
            .entry(pr)
            .or_default()
            .push_back(CiScript::Error(Arc::new(Mutex::new(Some(error)))));
    }

    pub fn always(&self, jobs: Vec<CheckJob>) {
        *guard(&self.fallback) = Some(jobs);
    }

    pub fn checks(&self) -> Vec<u64> {
        guard(&self.checks).clone()
    }

    pub fn reruns(&self) -> Vec<u64> {
        guard(&self.reruns).clone()
    }
}

#[async_trait]
impl CiChecker for ScriptedCi {
    async fn check(&self, _dir: &Path, pr: u64) -> Result<Vec<CheckJob>, CiError> {
        guard(&self.checks).push(pr);
        let next = {
            let mut scripts = guard(&self.scripts);
            let queue = scripts.get_mut(&pr);
            match queue {
                Some(queue) if matches!(queue.front(), Some(CiScript::Error(_))) => queue.pop_front(),
                Some(queue) => next_or_repeat(queue),
                None => None,
            }
        };
        match next {
            Some(CiScript::Jobs(jobs)) => Ok(jobs),
            Some(CiScript::Error(slot)) => {
                let error = guard(&*slot).take();
                Err(error.unwrap_or_else(|| CiError::Command("scripted error already used".into())))
            }
            None => guard(&self.fallback)
                .clone()
                .ok_or_else(|| CiError::Command(format!("no scripted CI result for PR #{}", pr))),
        }
    }

    async fn rerun(&self, _dir: &Path, pr: u64) -> Result<(), CiError> {
        guard(&self.reruns).push(pr);
        Ok(())
    }
}

/// Shared, ordered log of side-effecting operations.
#[derive(Debug, Clone, Default)]
pub struct OpLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl OpLog {
    pub fn push(&self, entry: impl Into<String>) {
        guard(&self.entries).push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        guard(&self.entries).clone()
    }

    pub fn clear(&self) {
        guard(&self.entries).clear();
    }
}

/// Logs an operation and fails it when it starts with a registered prefix.
#[derive(Debug, Default)]
struct FailPlan {
    prefixes: Mutex<Vec<String>>,
}

impl FailPlan {
    fn add(&self, prefix: &str) {
        guard(&self.prefixes).push(prefix.to_string());
    }

    fn run(&self, log: &OpLog, entry: String) -> Result<(), GitError> {
        log.push(entry.clone());
        if guard(&self.prefixes).iter().any(|p| entry.starts_with(p.as_str())) {
            return Err(GitError::Command {
                command: entry,
                stderr: "scripted failure".into(),
            });
        }
        Ok(())
    }
}

/// In-memory git client. Queries return configured values; mutations are logged.
#[derive(Debug)]
pub struct FakeGit {
    log: OpLog,
    fail: FailPlan,
    branch: Mutex<String>,
    commits: Mutex<Vec<String>>,
    metrics: Mutex<PrMetrics>,
}

impl FakeGit {
    pub fn new(log: OpLog) -> Self {
        Self {
            log,
            fail: FailPlan::default(),
            branch: Mutex::new("main".into()),
            commits: Mutex::new(Vec::new()),
            metrics: Mutex::new(PrMetrics::default()),
        }
    }

    pub fn fail_on(&self, prefix: &str) {
        self.fail.add(prefix);
    }

    pub fn set_current_branch(&self, branch: &str) {
        *guard(&self.branch) = branch.to_string();
    }

    pub fn set_commits(&self, commits: Vec<String>) {
        *guard(&self.commits) = commits;
    }

    pub fn set_metrics(&self, mut metrics: PrMetrics) {
        metrics.finalize();
        *guard(&self.metrics) = metrics;
    }
}

#[async_trait]
impl GitClient for FakeGit {
    async fn current_branch(&self, _dir: &Path) -> Result<String, GitError> {
        Ok(guard(&self.branch).clone())
    }

    async fn commits_since(&self, _dir: &Path, _base: &str) -> Result<Vec<String>, GitError> {
        Ok(guard(&self.commits).clone())
    }

    async fn diff_stats(&self, _dir: &Path, _base: &str) -> Result<PrMetrics, GitError> {
        Ok(guard(&self.metrics).clone())
    }

    async fn create_branch(&self, _dir: &Path, name: &str, from: &str) -> Result<(), GitError> {
        self.fail.run(&self.log, format!("create_branch {} from {}", name, from))?;
        self.set_current_branch(name);
        Ok(())
    }

    async fn checkout(&self, _dir: &Path, branch: &str) -> Result<(), GitError> {
        self.fail.run(&self.log, format!("checkout {}", branch))?;
        self.set_current_branch(branch);
        Ok(())
    }

    async fn commit_empty(&self, _dir: &Path, _message: &str) -> Result<(), GitError> {
        self.fail.run(&self.log, "commit_empty".to_string())
    }

    async fn cherry_pick(&self, _dir: &Path, commit: &str) -> Result<(), GitError> {
        self.fail.run(&self.log, format!("cherry_pick {}", commit))
    }

    async fn checkout_files(
        &self,
        _dir: &Path,
        branch: &str,
        files: &[String],
    ) -> Result<(), GitError> {
        self.fail
            .run(&self.log, format!("checkout_files {} {}", branch, files.join(" ")))
    }

    async fn commit(&self, _dir: &Path, message: &str) -> Result<(), GitError> {
        self.fail.run(&self.log, format!("commit {}", message))
    }

    async fn push_branch(&self, _dir: &Path, branch: &str) -> Result<(), GitError> {
        self.fail.run(&self.log, format!("push {}", branch))
    }

    async fn delete_remote_branch(&self, _dir: &Path, branch: &str) -> Result<(), GitError> {
        self.fail.run(&self.log, format!("delete_remote {}", branch))
    }

    async fn delete_local_branch(&self, _dir: &Path, branch: &str) -> Result<(), GitError> {
        self.fail.run(&self.log, format!("delete_local {}", branch))
    }
}

/// In-memory pull request host. PR numbers start at 100.
#[derive(Debug)]
pub struct FakePrClient {
    log: OpLog,
    fail: FailPlan,
    next_number: AtomicU64,
    bodies: Mutex<HashMap<u64, String>>,
    by_branch: Mutex<HashMap<String, u64>>,
}

impl FakePrClient {
    pub fn new(log: OpLog) -> Self {
        Self {
            log,
            fail: FailPlan::default(),
            next_number: AtomicU64::new(100),
            bodies: Mutex::new(HashMap::new()),
            by_branch: Mutex::new(HashMap::new()),
        }
    }

    pub fn fail_on(&self, prefix: &str) {
        self.fail.add(prefix);
    }

    pub fn body(&self, number: u64) -> Option<String> {
        guard(&self.bodies).get(&number).cloned()
    }

    /// Make `find_pr_for_branch` answer `number` for `branch`.
    pub fn set_branch_pr(&self, branch: &str, number: u64) {
        guard(&self.by_branch).insert(branch.to_string(), number);
    }
}

#[async_trait]
impl PullRequestClient for FakePrClient {
    async fn create_pr(&self, _dir: &Path, request: &PrRequest) -> Result<PrInfo, GitError> {
        let number = self.next_number.fetch_add(1, Ordering::SeqCst);
        self.fail.run(
            &self.log,
            format!("create_pr #{} {} -> {}", number, request.head, request.base),
        )?;
        guard(&self.bodies).insert(number, request.body.clone());
        guard(&self.by_branch).insert(request.head.clone(), number);
        Ok(PrInfo {
            number,
            url: format!("https://github.com/acme/app/pull/{}", number),
            title: request.title.clone(),
            base: request.base.clone(),
            head: request.head.clone(),
        })
    }

    async fn edit_pr_body(&self, _dir: &Path, number: u64, body: &str) -> Result<(), GitError> {
        self.fail.run(&self.log, format!("edit_pr #{}", number))?;
        guard(&self.bodies).insert(number, body.to_string());
        Ok(())
    }

    async fn close_pr(&self, _dir: &Path, number: u64) -> Result<(), GitError> {
        self.fail.run(&self.log, format!("close_pr #{}", number))
    }

    async fn find_pr_for_branch(&self, _dir: &Path, branch: &str) -> Result<Option<u64>, GitError> {
        Ok(guard(&self.by_branch).get(branch).copied())
    }
}

#[derive(Debug, Clone)]
enum AgentScript {
    Output(String),
    Error(Arc<Mutex<Option<AgentError>>>),
    Cancel(CancellationToken),
}

/// One recorded agent invocation.
#[derive(Debug, Clone)]
pub struct AgentCall {
    pub phase: Option<Phase>,
    pub prompt: String,
    pub working_dir: PathBuf,
}

/// Agent answering from per-phase scripts.
///
/// The phase is read from the `SHEPHERD_PHASE` variable the orchestrator sets
/// on every request.
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    scripts: Mutex<HashMap<Phase, VecDeque<AgentScript>>>,
    calls: Mutex<Vec<AgentCall>>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, phase: Phase, script: AgentScript) {
        guard(&self.scripts).entry(phase).or_default().push_back(script);
    }

    pub fn respond(&self, phase: Phase, output: impl Into<String>) {
        self.queue(phase, AgentScript::Output(output.into()));
    }

    /// Queue an error. Errors are returned once and never repeated.
    pub fn fail(&self, phase: Phase, error: AgentError) {
        self.queue(phase, AgentScript::Error(Arc::new(Mutex::new(Some(error)))));
    }

    /// Cancel `token` when this invocation happens, as Ctrl-C would.
    pub fn cancel_on(&self, phase: Phase, token: CancellationToken) {
        self.queue(phase, AgentScript::Cancel(token));
    }

    pub fn calls(&self) -> Vec<AgentCall> {
        guard(&self.calls).clone()
    }

    pub fn prompts(&self, phase: Phase) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.phase == Some(phase))
            .map(|c| c.prompt)
            .collect()
    }
}

#[async_trait]
impl AgentExecutor for ScriptedAgent {
    async fn execute_streaming(
        &self,
        request: AgentRequest,
        cancel: &CancellationToken,
        on_progress: &(dyn Fn(AgentProgress) + Send + Sync),
    ) -> Result<AgentResponse, AgentError> {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        let phase = request
            .env
            .get("SHEPHERD_PHASE")
            .and_then(|p| p.parse::<Phase>().ok());
        guard(&self.calls).push(AgentCall {
            phase,
            prompt: request.prompt.clone(),
            working_dir: request.working_dir.clone(),
        });

        let next = phase.and_then(|phase| {
            let mut scripts = guard(&self.scripts);
            let queue = scripts.get_mut(&phase)?;
            let next = if matches!(queue.front(), Some(AgentScript::Output(_))) {
                next_or_repeat(queue)
            } else {
                queue.pop_front()
            };
            next
        });

        match next {
            Some(AgentScript::Output(output)) => {
                on_progress(AgentProgress::Text(output.clone()));
                Ok(AgentResponse {
                    output,
                    structured: None,
                    exit_code: 0,
                    duration: Duration::from_millis(1),
                })
            }
            Some(AgentScript::Error(slot)) => {
                let error = guard(&*slot).take();
                Err(error.unwrap_or(AgentError::Failed {
                    exit_code: 1,
                    message: "scripted error already used".into(),
                }))
            }
            Some(AgentScript::Cancel(token)) => {
                token.cancel();
                Err(AgentError::Cancelled)
            }
            None => Err(AgentError::Failed {
                exit_code: 1,
                message: format!("no scripted response for phase {:?}", phase),
            }),
        }
    }
}

/// Worktree manager that only creates plain directories.
#[derive(Debug)]
pub struct FakeWorktrees {
    root: PathBuf,
    log: OpLog,
    fail_create: Mutex<bool>,
}

impl FakeWorktrees {
    pub fn new(root: impl Into<PathBuf>, log: OpLog) -> Self {
        Self {
            root: root.into(),
            log,
            fail_create: Mutex::new(false),
        }
    }

    pub fn fail_create(&self) {
        *guard(&self.fail_create) = true;
    }
}

#[async_trait]
impl WorktreeManager for FakeWorktrees {
    async fn create(&self, name: &str, base: &str) -> Result<WorktreeInfo, GitError> {
        self.log.push(format!("worktree_add {} from {}", name, base));
        if *guard(&self.fail_create) {
            return Err(GitError::Command {
                command: format!("git worktree add {}", name),
                stderr: "scripted failure".into(),
            });
        }
        let path = self.root.join(name);
        std::fs::create_dir_all(&path).map_err(|source| GitError::Spawn {
            command: format!("mkdir {}", path.display()),
            source,
        })?;
        Ok(WorktreeInfo {
            path,
            branch: format!("shepherd/{}", name),
        })
    }

    async fn remove(&self, path: &Path) -> Result<(), GitError> {
        self.log.push(format!("worktree_remove {}", path.display()));
        Ok(())
    }
}

/// Confirmer answering from a script; the last decision repeats.
#[derive(Debug)]
pub struct ScriptedConfirmer {
    decisions: Mutex<VecDeque<ConfirmDecision>>,
    seen: Mutex<Vec<String>>,
}

impl ScriptedConfirmer {
    pub fn new(decisions: Vec<ConfirmDecision>) -> Self {
        Self {
            decisions: Mutex::new(decisions.into()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn approving() -> Self {
        Self::new(vec![ConfirmDecision::Approve])
    }

    /// Plan summaries shown so far.
    pub fn seen(&self) -> Vec<String> {
        guard(&self.seen).clone()
    }
}

#[async_trait]
impl Confirmer for ScriptedConfirmer {
    async fn confirm(
        &self,
        _workflow: &str,
        plan: &PlanOutput,
        _markdown: &str,
    ) -> std::io::Result<ConfirmDecision> {
        guard(&self.seen).push(plan.summary.clone());
        let mut decisions = guard(&self.decisions);
        next_or_repeat(&mut *decisions)
            .ok_or_else(|| std::io::Error::other("no scripted confirmation"))
    }
}
