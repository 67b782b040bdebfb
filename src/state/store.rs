use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::lock::LockTable;
use crate::errors::StateError;
use crate::phase::Phase;
use crate::split::PrSplitResult;
use crate::workflow::{PlanOutput, WorkflowState, WorkflowSummary, WorkflowType};

const STATE_FILE: &str = "state.json";
const PLAN_FILE: &str = "plan.json";
const PLAN_MARKDOWN_FILE: &str = "plan.md";
const PHASES_DIR: &str = "phases";
const PROMPTS_DIR: &str = "prompts";
const SPLIT_PROGRESS_FILE: &str = "pr_split_progress.json";
const MAX_NAME_LEN: usize = 64;

/// Check that a workflow name is safe to use as a directory name.
pub fn validate_name(name: &str) -> Result<(), StateError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        && !name.starts_with(['-', '_']);
    if valid {
        Ok(())
    } else {
        Err(StateError::InvalidName(name.to_string()))
    }
}

/// Write `contents` to `path` through a temp file in the same directory and a
/// rename, so readers only ever observe the old or the new file. The parent
/// directory is synced afterwards so the rename survives a crash.
pub fn atomic_write(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    sync_dir(parent)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::File::open(dir)?.sync_all()
}

// Directory handles cannot be fsynced on this platform.
#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Durable store for workflow state and phase artifacts.
///
/// Layout under the base directory:
///
/// ```text
/// <name>/state.json
/// <name>/plan.json, plan.md
/// <name>/phases/<phase>.json, <phase>_raw.txt
/// <name>/phases/pr_split_progress.json   (only while a split is in flight)
/// <name>/prompts/<phase>_<attempt>.md
/// <name>/.lock
/// ```
#[derive(Debug)]
pub struct StateStore {
    base_dir: PathBuf,
    locks: LockTable,
}

/// Held write lock; released on drop.
#[derive(Debug)]
pub struct WorkflowLock<'a> {
    store: &'a StateStore,
    name: String,
}

impl WorkflowLock<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for WorkflowLock<'_> {
    fn drop(&mut self) {
        self.store.unlock(&self.name);
    }
}

impl StateStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            locks: LockTable::default(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn workflow_dir(&self, name: &str) -> Result<PathBuf, StateError> {
        validate_name(name)?;
        Ok(self.base_dir.join(name))
    }

    /// Create the workflow directory and its `phases/` and `prompts/` subdirectories.
    pub fn ensure_workflow_dir(&self, name: &str) -> Result<PathBuf, StateError> {
        let dir = self.workflow_dir(name)?;
        for sub in [dir.join(PHASES_DIR), dir.join(PROMPTS_DIR)] {
            std::fs::create_dir_all(&sub).map_err(|e| StateError::io(&sub, e))?;
        }
        Ok(dir)
    }

    pub fn workflow_exists(&self, name: &str) -> bool {
        self.workflow_dir(name)
            .map(|dir| dir.join(STATE_FILE).is_file())
            .unwrap_or(false)
    }

    /// Create and persist a fresh workflow in the Planning phase.
    pub fn init_state(
        &self,
        name: &str,
        description: &str,
        workflow_type: WorkflowType,
    ) -> Result<WorkflowState, StateError> {
        validate_name(name)?;
        if description.trim().is_empty() {
            return Err(StateError::EmptyDescription);
        }
        if self.workflow_exists(name) {
            return Err(StateError::AlreadyExists(name.to_string()));
        }

        self.ensure_workflow_dir(name)?;
        let mut state = WorkflowState::new(name, description.trim(), workflow_type);
        self.save_state(name, &mut state)?;
        tracing::info!(workflow = name, r#type = %workflow_type, "initialized workflow");
        Ok(state)
    }

    /// Stamp `updated_at` and atomically replace the state file.
    pub fn save_state(&self, name: &str, state: &mut WorkflowState) -> Result<(), StateError> {
        let dir = self.ensure_workflow_dir(name)?;
        state.updated_at = Utc::now();
        self.write_json(&dir.join(STATE_FILE), state, "workflow state")?;
        tracing::debug!(workflow = name, phase = %state.current_phase, "saved state");
        Ok(())
    }

    pub fn load_state(&self, name: &str) -> Result<WorkflowState, StateError> {
        let path = self.workflow_dir(name)?.join(STATE_FILE);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StateError::NotFound(name.to_string()));
            }
            Err(e) => return Err(StateError::io(&path, e)),
        };
        serde_json::from_str(&content).map_err(|source| StateError::Corrupted { path, source })
    }

    pub fn save_plan(&self, name: &str, plan: &PlanOutput) -> Result<(), StateError> {
        let dir = self.ensure_workflow_dir(name)?;
        self.write_json(&dir.join(PLAN_FILE), plan, "plan")
    }

    pub fn load_plan(&self, name: &str) -> Result<PlanOutput, StateError> {
        self.read_json(&self.workflow_dir(name)?.join(PLAN_FILE))
    }

    pub fn save_plan_markdown(&self, name: &str, markdown: &str) -> Result<(), StateError> {
        let path = self.ensure_workflow_dir(name)?.join(PLAN_MARKDOWN_FILE);
        atomic_write(&path, markdown.as_bytes()).map_err(|e| StateError::io(&path, e))
    }

    pub fn save_phase_output<T: Serialize>(
        &self,
        name: &str,
        phase: Phase,
        output: &T,
    ) -> Result<(), StateError> {
        let path = self.phase_output_path(name, phase)?;
        self.ensure_workflow_dir(name)?;
        self.write_json(&path, output, "phase output")
    }

    pub fn load_phase_output<T: DeserializeOwned>(
        &self,
        name: &str,
        phase: Phase,
    ) -> Result<T, StateError> {
        self.read_json(&self.phase_output_path(name, phase)?)
    }

    /// Record what an in-flight PR split has created so far.
    pub fn save_split_progress(&self, name: &str, progress: &PrSplitResult) -> Result<(), StateError> {
        let path = self.split_progress_path(name)?;
        self.ensure_workflow_dir(name)?;
        self.write_json(&path, progress, "split progress")
    }

    /// The split left behind by an interrupted run, if any.
    pub fn load_split_progress(&self, name: &str) -> Result<Option<PrSplitResult>, StateError> {
        match self.read_json(&self.split_progress_path(name)?) {
            Ok(progress) => Ok(Some(progress)),
            Err(StateError::ArtifactNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn clear_split_progress(&self, name: &str) -> Result<(), StateError> {
        let path = self.split_progress_path(name)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::io(&path, e)),
        }
    }

    /// Keep unparsable agent output around for offline inspection.
    pub fn save_raw_output(&self, name: &str, phase: Phase, raw: &str) -> Result<PathBuf, StateError> {
        let path = self
            .ensure_workflow_dir(name)?
            .join(PHASES_DIR)
            .join(format!("{}_raw.txt", phase));
        atomic_write(&path, raw.as_bytes()).map_err(|e| StateError::io(&path, e))?;
        Ok(path)
    }

    /// Save the prompt for one attempt; re-running an attempt overwrites it.
    pub fn save_prompt(
        &self,
        name: &str,
        phase: Phase,
        attempt: u32,
        text: &str,
    ) -> Result<PathBuf, StateError> {
        if text.trim().is_empty() {
            return Err(StateError::InvalidPrompt("prompt must not be empty".into()));
        }
        if attempt == 0 {
            return Err(StateError::InvalidPrompt(
                "attempt number must be positive".into(),
            ));
        }
        let path = self
            .ensure_workflow_dir(name)?
            .join(PROMPTS_DIR)
            .join(format!("{}_{}.md", phase, attempt));
        atomic_write(&path, text.as_bytes()).map_err(|e| StateError::io(&path, e))?;
        Ok(path)
    }

    /// Summaries of every readable workflow, sorted by name.
    ///
    /// Directories whose state file is missing or fails to parse are skipped.
    pub fn list_workflows(&self) -> Result<Vec<WorkflowSummary>, StateError> {
        let entries = match std::fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StateError::io(&self.base_dir, e)),
        };

        let mut summaries = Vec::new();
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if validate_name(&name).is_err() {
                continue;
            }
            match self.load_state(&name) {
                Ok(state) => summaries.push(WorkflowSummary::from(&state)),
                Err(e) => tracing::debug!(workflow = %name, error = %e, "skipping unreadable workflow"),
            }
        }
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(summaries)
    }

    pub fn delete_workflow(&self, name: &str) -> Result<(), StateError> {
        let dir = self.workflow_dir(name)?;
        if !dir.exists() {
            return Err(StateError::NotFound(name.to_string()));
        }
        std::fs::remove_dir_all(&dir).map_err(|e| StateError::io(&dir, e))?;
        tracing::info!(workflow = name, "deleted workflow");
        Ok(())
    }

    /// Take the write lock for a workflow, failing immediately if it is held.
    pub fn lock(&self, name: &str) -> Result<WorkflowLock<'_>, StateError> {
        let dir = self.ensure_workflow_dir(name)?;
        self.locks.acquire(name, &dir)?;
        tracing::debug!(workflow = name, "acquired workflow lock");
        Ok(WorkflowLock {
            store: self,
            name: name.to_string(),
        })
    }

    /// Release a lock taken by this store. Unlocking an unlocked workflow is a no-op.
    pub fn unlock(&self, name: &str) {
        self.locks.release(name);
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.locks.is_held(name)
    }

    fn phase_output_path(&self, name: &str, phase: Phase) -> Result<PathBuf, StateError> {
        Ok(self
            .workflow_dir(name)?
            .join(PHASES_DIR)
            .join(format!("{}.json", phase)))
    }

    fn split_progress_path(&self, name: &str) -> Result<PathBuf, StateError> {
        Ok(self
            .workflow_dir(name)?
            .join(PHASES_DIR)
            .join(SPLIT_PROGRESS_FILE))
    }

    fn write_json<T: Serialize + ?Sized>(
        &self,
        path: &Path,
        value: &T,
        what: &'static str,
    ) -> Result<(), StateError> {
        let content = serde_json::to_string_pretty(value)
            .map_err(|source| StateError::Serialize { what, source })?;
        atomic_write(path, content.as_bytes()).map_err(|e| StateError::io(path, e))
    }

    fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<T, StateError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StateError::ArtifactNotFound(path.to_path_buf()));
            }
            Err(e) => return Err(StateError::io(path, e)),
        };
        serde_json::from_str(&content).map_err(|source| StateError::Corrupted {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::PhaseStatus;
    use crate::workflow::{FailureType, PrMetrics, WorkflowError, WorkflowStatus};
    use tempfile::tempdir;

    fn make_store() -> (StateStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        (StateStore::new(dir.path().join("workflows")), dir)
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("auth-feature").is_ok());
        assert!(validate_name("fix_42").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("../escape").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("-leading").is_err());
        assert!(validate_name(&"x".repeat(65)).is_err());
    }

    #[test]
    fn test_init_state_starts_in_planning() {
        let (store, _dir) = make_store();
        let state = store
            .init_state("auth-feature", "add JWT auth", WorkflowType::Feature)
            .unwrap();
        assert_eq!(state.current_phase, Phase::Planning);
        assert_eq!(state.phase(Phase::Planning).status, PhaseStatus::InProgress);
        assert_eq!(state.phase(Phase::Completed).status, PhaseStatus::Pending);
        assert!(store.workflow_exists("auth-feature"));
        assert!(store.workflow_dir("auth-feature").unwrap().join("phases").is_dir());
        assert!(store.workflow_dir("auth-feature").unwrap().join("prompts").is_dir());
    }

    #[test]
    fn test_init_state_rejects_bad_input() {
        let (store, _dir) = make_store();
        assert!(matches!(
            store.init_state("bad name", "d", WorkflowType::Fix),
            Err(StateError::InvalidName(_))
        ));
        assert!(matches!(
            store.init_state("ok", "   ", WorkflowType::Fix),
            Err(StateError::EmptyDescription)
        ));
        store.init_state("ok", "d", WorkflowType::Fix).unwrap();
        assert!(matches!(
            store.init_state("ok", "d", WorkflowType::Fix),
            Err(StateError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let (store, _dir) = make_store();
        let mut state = store
            .init_state("roundtrip", "desc", WorkflowType::Feature)
            .unwrap();
        state.current_phase = Phase::Failed;
        state.worktree_path = Some("/tmp/wt/roundtrip".into());
        state.branch = Some("shepherd/roundtrip".into());
        state.pr_number = Some(42);
        {
            let implementation = state.phase_mut(Phase::Implementation);
            implementation.status = PhaseStatus::Failed;
            implementation.attempts = 3;
            implementation.feedback = vec!["test failed".into(), "test failed again".into()];
            implementation.required = Some(true);
        }
        state.phase_mut(Phase::Refactoring).metrics = Some(PrMetrics {
            lines_added: 10,
            files_added: vec!["src/a.rs".into()],
            ..Default::default()
        });
        state.error = Some(WorkflowError {
            message: "Exceeded maximum fix attempts (3) in implementation".into(),
            phase: Phase::Implementation,
            timestamp: Utc::now(),
            recoverable: true,
            failure_type: FailureType::Ci,
        });

        store.save_state("roundtrip", &mut state).unwrap();
        let loaded = store.load_state("roundtrip").unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_save_state_stamps_updated_at() {
        let (store, _dir) = make_store();
        let mut state = store.init_state("stamp", "desc", WorkflowType::Fix).unwrap();
        let before = state.updated_at;
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.save_state("stamp", &mut state).unwrap();
        assert!(state.updated_at > before);
    }

    #[test]
    fn test_load_state_not_found_vs_corrupted() {
        let (store, _dir) = make_store();
        assert!(matches!(store.load_state("missing"), Err(StateError::NotFound(_))));

        let dir = store.ensure_workflow_dir("broken").unwrap();
        std::fs::write(dir.join(STATE_FILE), "{ not json").unwrap();
        assert!(matches!(
            store.load_state("broken"),
            Err(StateError::Corrupted { .. })
        ));
    }

    #[test]
    fn test_plan_and_phase_output_round_trip() {
        let (store, _dir) = make_store();
        store.init_state("plan", "desc", WorkflowType::Feature).unwrap();
        let plan = PlanOutput {
            summary: "do it".into(),
            steps: vec!["one".into()],
            ..Default::default()
        };
        store.save_plan("plan", &plan).unwrap();
        store
            .save_plan_markdown("plan", &plan.to_markdown("plan"))
            .unwrap();
        assert_eq!(store.load_plan("plan").unwrap(), plan);
        assert!(
            store
                .workflow_dir("plan")
                .unwrap()
                .join(PLAN_MARKDOWN_FILE)
                .exists()
        );

        let value = serde_json::json!({"summary": "done", "pr_number": 7});
        store
            .save_phase_output("plan", Phase::Implementation, &value)
            .unwrap();
        let loaded: serde_json::Value = store
            .load_phase_output("plan", Phase::Implementation)
            .unwrap();
        assert_eq!(loaded, value);
        assert!(matches!(
            store.load_phase_output::<serde_json::Value>("plan", Phase::Refactoring),
            Err(StateError::ArtifactNotFound(_))
        ));
    }

    #[test]
    fn test_save_raw_output() {
        let (store, _dir) = make_store();
        let path = store
            .save_raw_output("raw", Phase::Planning, "not json at all")
            .unwrap();
        assert!(path.ends_with("phases/planning_raw.txt"));
        assert_eq!(std::fs::read_to_string(path).unwrap(), "not json at all");
    }

    #[test]
    fn test_save_prompt_overwrites_and_validates() {
        let (store, _dir) = make_store();
        let first = store
            .save_prompt("p", Phase::Implementation, 2, "first")
            .unwrap();
        let second = store
            .save_prompt("p", Phase::Implementation, 2, "second")
            .unwrap();
        assert_eq!(first, second);
        assert!(first.ends_with("prompts/implementation_2.md"));
        assert_eq!(std::fs::read_to_string(&second).unwrap(), "second");

        assert!(matches!(
            store.save_prompt("p", Phase::Planning, 1, "  "),
            Err(StateError::InvalidPrompt(_))
        ));
        assert!(matches!(
            store.save_prompt("p", Phase::Planning, 0, "text"),
            Err(StateError::InvalidPrompt(_))
        ));
    }

    #[test]
    fn test_list_workflows_derives_status_and_skips_corrupt() {
        let (store, _dir) = make_store();
        assert!(store.list_workflows().unwrap().is_empty());

        store.init_state("b-running", "d", WorkflowType::Feature).unwrap();
        let mut done = store.init_state("a-done", "d", WorkflowType::Fix).unwrap();
        done.current_phase = Phase::Completed;
        store.save_state("a-done", &mut done).unwrap();
        let mut failed = store.init_state("c-failed", "d", WorkflowType::Fix).unwrap();
        failed.current_phase = Phase::Failed;
        store.save_state("c-failed", &mut failed).unwrap();

        let corrupt = store.ensure_workflow_dir("d-corrupt").unwrap();
        std::fs::write(corrupt.join(STATE_FILE), "garbage").unwrap();

        let list = store.list_workflows().unwrap();
        let names: Vec<_> = list.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a-done", "b-running", "c-failed"]);
        assert_eq!(list[0].status, WorkflowStatus::Completed);
        assert_eq!(list[1].status, WorkflowStatus::InProgress);
        assert_eq!(list[2].status, WorkflowStatus::Failed);
    }

    #[test]
    fn test_delete_workflow() {
        let (store, _dir) = make_store();
        store.init_state("gone", "d", WorkflowType::Fix).unwrap();
        store.delete_workflow("gone").unwrap();
        assert!(!store.workflow_exists("gone"));
        assert!(matches!(
            store.delete_workflow("gone"),
            Err(StateError::NotFound(_))
        ));
    }

    #[test]
    fn test_second_lock_fails_until_released() {
        let (store, _dir) = make_store();
        store.init_state("locked", "d", WorkflowType::Fix).unwrap();

        let guard = store.lock("locked").unwrap();
        assert!(store.is_locked("locked"));
        assert!(matches!(store.lock("locked"), Err(StateError::Locked(_))));

        let other = StateStore::new(store.base_dir());
        assert!(matches!(other.lock("locked"), Err(StateError::Locked(_))));

        drop(guard);
        assert!(!store.is_locked("locked"));
        let _again = other.lock("locked").unwrap();
    }

    #[test]
    fn test_unlock_when_unlocked_is_noop() {
        let (store, _dir) = make_store();
        store.unlock("never-locked");
        let guard = store.lock("twice").unwrap();
        store.unlock("twice");
        store.unlock("twice");
        drop(guard);
        assert!(store.lock("twice").is_ok());
    }

    #[test]
    fn test_split_progress_lifecycle() {
        let (store, _dir) = make_store();
        assert_eq!(store.load_split_progress("split").unwrap(), None);
        store.clear_split_progress("split").unwrap();

        let progress = PrSplitResult {
            source_branch: "shepherd/split".into(),
            branches: vec!["shepherd/split-split".into()],
            ..PrSplitResult::default()
        };
        store.save_split_progress("split", &progress).unwrap();
        assert_eq!(store.load_split_progress("split").unwrap(), Some(progress));

        store.clear_split_progress("split").unwrap();
        assert_eq!(store.load_split_progress("split").unwrap(), None);
    }

    #[test]
    fn test_atomic_write_syncs_parent_directory() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("nested");
        std::fs::create_dir_all(&nested).unwrap();
        let path = nested.join("state.json");
        atomic_write(&path, b"{}").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"{}");
        #[cfg(unix)]
        sync_dir(&nested).unwrap();
    }

    #[test]
    fn test_atomic_write_replaces_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.json");
        atomic_write(&path, b"old").unwrap();
        atomic_write(&path, b"new").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new");
        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
