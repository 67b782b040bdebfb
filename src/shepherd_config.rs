//! File configuration read from `.shepherd/shepherd.toml`.
//!
//! Every field has a default, so an empty or missing file is valid.
//! Values are layered file → environment → CLI; the environment and CLI
//! layers are applied when resolving the runtime [`crate::config::Config`].
//!
//! ```toml
//! [project]
//! main_branch = "main"
//!
//! [agent]
//! command = "claude"
//! skip_permissions = true
//! implementation_timeout_secs = 1800
//!
//! [ci]
//! initial_delay_secs = 30
//! poll_interval_secs = 30
//! timeout_secs = 1800
//! e2e_pattern = "(?i)e2e|end-to-end"
//!
//! [limits]
//! max_fix_attempts = 3
//! max_split_attempts = 2
//!
//! [pr_split]
//! max_lines = 500
//! max_files = 20
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::ci::poller::DEFAULT_E2E_PATTERN;

pub const CONFIG_FILE: &str = "shepherd.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSection {
    #[serde(default = "default_main_branch")]
    pub main_branch: String,
    /// Workflow state directory (default `.shepherd/workflows`)
    #[serde(default)]
    pub base_dir: Option<String>,
    /// Worktree directory (default `.shepherd/worktrees`)
    #[serde(default)]
    pub worktree_dir: Option<String>,
}

fn default_main_branch() -> String {
    "main".to_string()
}

impl Default for ProjectSection {
    fn default() -> Self {
        Self {
            main_branch: default_main_branch(),
            base_dir: None,
            worktree_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default = "default_true")]
    pub skip_permissions: bool,
    #[serde(default = "default_planning_timeout")]
    pub planning_timeout_secs: u64,
    #[serde(default = "default_implementation_timeout")]
    pub implementation_timeout_secs: u64,
    #[serde(default = "default_refactoring_timeout")]
    pub refactoring_timeout_secs: u64,
    #[serde(default = "default_split_timeout")]
    pub pr_split_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_planning_timeout() -> u64 {
    600
}

fn default_implementation_timeout() -> u64 {
    1800
}

fn default_refactoring_timeout() -> u64 {
    1200
}

fn default_split_timeout() -> u64 {
    600
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command: None,
            skip_permissions: default_true(),
            planning_timeout_secs: default_planning_timeout(),
            implementation_timeout_secs: default_implementation_timeout(),
            refactoring_timeout_secs: default_refactoring_timeout(),
            pr_split_timeout_secs: default_split_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CiSection {
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_ci_timeout")]
    pub timeout_secs: u64,
    /// Per-invocation limit for git and gh commands
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_e2e_pattern")]
    pub e2e_pattern: String,
    #[serde(default = "default_persistence_window")]
    pub persistence_window: usize,
    #[serde(default = "default_short_cancel")]
    pub short_cancel_secs: u64,
    #[serde(default = "default_long_cancel")]
    pub long_cancel_secs: u64,
}

fn default_initial_delay() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    30
}

fn default_ci_timeout() -> u64 {
    1800
}

fn default_command_timeout() -> u64 {
    60
}

fn default_e2e_pattern() -> String {
    DEFAULT_E2E_PATTERN.to_string()
}

fn default_persistence_window() -> usize {
    3
}

fn default_short_cancel() -> u64 {
    60
}

fn default_long_cancel() -> u64 {
    300
}

impl Default for CiSection {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_initial_delay(),
            poll_interval_secs: default_poll_interval(),
            timeout_secs: default_ci_timeout(),
            command_timeout_secs: default_command_timeout(),
            e2e_pattern: default_e2e_pattern(),
            persistence_window: default_persistence_window(),
            short_cancel_secs: default_short_cancel(),
            long_cancel_secs: default_long_cancel(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsSection {
    #[serde(default = "default_max_fix_attempts")]
    pub max_fix_attempts: u32,
    #[serde(default = "default_max_split_attempts")]
    pub max_split_attempts: u32,
}

fn default_max_fix_attempts() -> u32 {
    3
}

fn default_max_split_attempts() -> u32 {
    2
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_fix_attempts: default_max_fix_attempts(),
            max_split_attempts: default_max_split_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrSplitSection {
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

fn default_max_lines() -> usize {
    500
}

fn default_max_files() -> usize {
    20
}

impl Default for PrSplitSection {
    fn default() -> Self {
        Self {
            max_lines: default_max_lines(),
            max_files: default_max_files(),
        }
    }
}

/// The complete shepherd.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShepherdToml {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub ci: CiSection,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub pr_split: PrSplitSection,
}

impl ShepherdToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse shepherd.toml")
    }

    /// Load `<dir>/shepherd.toml`, or defaults when it does not exist.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = self.to_toml()?;
        crate::state::atomic_write(path, content.as_bytes())
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize shepherd.toml")
    }

    /// Apply `SHEPHERD_*` overrides from `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(cmd) = lookup("SHEPHERD_AGENT_CMD").filter(|v| !v.trim().is_empty()) {
            self.agent.command = Some(cmd);
        }
        if let Some(dir) = lookup("SHEPHERD_BASE_DIR").filter(|v| !v.trim().is_empty()) {
            self.project.base_dir = Some(dir);
        }
        if let Some(n) = lookup("SHEPHERD_MAX_FIX_ATTEMPTS").and_then(|v| v.trim().parse().ok()) {
            self.limits.max_fix_attempts = n;
        }
    }

    pub fn agent_command(&self) -> String {
        self.agent
            .command
            .clone()
            .unwrap_or_else(|| "claude".to_string())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Err(e) = regex::Regex::new(&self.ci.e2e_pattern) {
            warnings.push(format!(
                "Invalid e2e_pattern '{}': {}",
                self.ci.e2e_pattern, e
            ));
        }
        if self.limits.max_fix_attempts == 0 {
            warnings.push("max_fix_attempts is 0: CI failures can never be fixed".to_string());
        }
        if self.limits.max_split_attempts == 0 {
            warnings.push("max_split_attempts is 0: oversized changes always fail".to_string());
        }
        if self.ci.poll_interval_secs == 0 {
            warnings.push("poll_interval_secs is 0: CI will be polled in a tight loop".to_string());
        }
        if self.ci.short_cancel_secs >= self.ci.long_cancel_secs {
            warnings.push(format!(
                "short_cancel_secs ({}) should be below long_cancel_secs ({})",
                self.ci.short_cancel_secs, self.ci.long_cancel_secs
            ));
        }
        if self.ci.persistence_window < 2 {
            warnings.push(format!(
                "persistence_window {} treats every failure as persistent",
                self.ci.persistence_window
            ));
        }
        if self.project.main_branch.trim().is_empty() {
            warnings.push("main_branch is empty".to_string());
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_file_gives_defaults() {
        let toml = ShepherdToml::parse("").unwrap();
        assert_eq!(toml.project.main_branch, "main");
        assert_eq!(toml.limits.max_fix_attempts, 3);
        assert_eq!(toml.pr_split.max_lines, 500);
        assert_eq!(toml.ci.e2e_pattern, DEFAULT_E2E_PATTERN);
        assert_eq!(toml.agent_command(), "claude");
        assert!(toml.validate().is_empty());
    }

    #[test]
    fn test_partial_sections() {
        let toml = ShepherdToml::parse(
            r#"
[project]
main_branch = "trunk"

[limits]
max_fix_attempts = 5

[pr_split]
max_files = 10
"#,
        )
        .unwrap();
        assert_eq!(toml.project.main_branch, "trunk");
        assert_eq!(toml.limits.max_fix_attempts, 5);
        assert_eq!(toml.limits.max_split_attempts, 2);
        assert_eq!(toml.pr_split.max_files, 10);
        assert_eq!(toml.pr_split.max_lines, 500);
    }

    #[test]
    fn test_invalid_toml_is_error() {
        assert!(ShepherdToml::parse("[limits\nmax = ").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("SHEPHERD_AGENT_CMD", "/opt/claude"),
            ("SHEPHERD_MAX_FIX_ATTEMPTS", "7"),
        ]
        .into_iter()
        .collect();
        let mut toml = ShepherdToml::default();
        toml.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(toml.agent_command(), "/opt/claude");
        assert_eq!(toml.limits.max_fix_attempts, 7);
        assert_eq!(toml.project.base_dir, None);
    }

    #[test]
    fn test_unparsable_env_number_is_ignored() {
        let mut toml = ShepherdToml::default();
        toml.apply_env(|k| (k == "SHEPHERD_MAX_FIX_ATTEMPTS").then(|| "many".to_string()));
        assert_eq!(toml.limits.max_fix_attempts, 3);
    }

    #[test]
    fn test_validate_reports_problems() {
        let mut toml = ShepherdToml::default();
        toml.ci.e2e_pattern = "(unclosed".into();
        toml.limits.max_fix_attempts = 0;
        toml.ci.short_cancel_secs = 400;
        let warnings = toml.validate();
        assert_eq!(warnings.len(), 3);
        assert!(warnings[0].contains("Invalid e2e_pattern"));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut toml = ShepherdToml::default();
        toml.limits.max_split_attempts = 4;
        toml.save(&dir.path().join(CONFIG_FILE)).unwrap();
        let loaded = ShepherdToml::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.limits.max_split_attempts, 4);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = ShepherdToml::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.project.main_branch, "main");
    }
}
