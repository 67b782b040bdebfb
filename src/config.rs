use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ci::{ClassifierConfig, PollConfig};
use crate::orchestrator::Settings;
use crate::phase::Phase;
use crate::shepherd_config::ShepherdToml;

/// Overrides taken from the command line.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub verbose: bool,
    pub yes: bool,
    pub base_dir: Option<PathBuf>,
    pub max_fix_attempts: Option<u32>,
}

/// Runtime configuration resolved from shepherd.toml, environment and CLI.
#[derive(Debug, Clone)]
pub struct Config {
    pub repo_dir: PathBuf,
    pub shepherd_dir: PathBuf,
    pub base_dir: PathBuf,
    pub worktree_dir: PathBuf,
    pub log_dir: PathBuf,
    pub verbose: bool,
    pub yes: bool,
    toml: ShepherdToml,
}

impl Config {
    /// Resolve configuration for the repository at `repo_dir`, reading the
    /// process environment.
    pub fn load(repo_dir: &Path, cli: CliOverrides) -> Result<Self> {
        Self::load_with_env(repo_dir, cli, |key| std::env::var(key).ok())
    }

    pub fn load_with_env(
        repo_dir: &Path,
        cli: CliOverrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let repo_dir = repo_dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve repository directory {}", repo_dir.display()))?;
        let shepherd_dir = repo_dir.join(".shepherd");
        let mut toml = ShepherdToml::load_or_default(&shepherd_dir)?;
        toml.apply_env(env);
        if let Some(n) = cli.max_fix_attempts {
            toml.limits.max_fix_attempts = n;
        }

        let resolve = |configured: &Option<String>, default: &str| -> PathBuf {
            match configured {
                Some(p) if Path::new(p).is_absolute() => PathBuf::from(p),
                Some(p) => repo_dir.join(p),
                None => shepherd_dir.join(default),
            }
        };
        let base_dir = cli
            .base_dir
            .clone()
            .unwrap_or_else(|| resolve(&toml.project.base_dir, "workflows"));
        let worktree_dir = resolve(&toml.project.worktree_dir, "worktrees");
        let log_dir = shepherd_dir.join("logs");

        Ok(Self {
            repo_dir,
            shepherd_dir,
            base_dir,
            worktree_dir,
            log_dir,
            verbose: cli.verbose,
            yes: cli.yes,
            toml,
        })
    }

    pub fn toml(&self) -> &ShepherdToml {
        &self.toml
    }

    pub fn config_file(&self) -> PathBuf {
        self.shepherd_dir.join(crate::shepherd_config::CONFIG_FILE)
    }

    pub fn main_branch(&self) -> &str {
        &self.toml.project.main_branch
    }

    pub fn agent_command(&self) -> String {
        self.toml.agent_command()
    }

    pub fn skip_permissions(&self) -> bool {
        self.toml.agent.skip_permissions
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.ci.command_timeout_secs)
    }

    pub fn agent_timeout(&self, phase: Phase) -> Duration {
        let agent = &self.toml.agent;
        Duration::from_secs(match phase {
            Phase::Planning => agent.planning_timeout_secs,
            Phase::Implementation => agent.implementation_timeout_secs,
            Phase::Refactoring => agent.refactoring_timeout_secs,
            Phase::PrSplit => agent.pr_split_timeout_secs,
            _ => agent.planning_timeout_secs,
        })
    }

    pub fn poll_config(&self) -> Result<PollConfig> {
        let ci = &self.toml.ci;
        PollConfig::new(
            Duration::from_secs(ci.initial_delay_secs),
            Duration::from_secs(ci.poll_interval_secs),
            Duration::from_secs(ci.timeout_secs),
            &ci.e2e_pattern,
        )
        .with_context(|| format!("Invalid e2e_pattern '{}'", ci.e2e_pattern))
    }

    pub fn classifier_config(&self) -> ClassifierConfig {
        let ci = &self.toml.ci;
        ClassifierConfig {
            short_threshold: Duration::from_secs(ci.short_cancel_secs),
            long_threshold: Duration::from_secs(ci.long_cancel_secs),
            persistence_window: ci.persistence_window,
            ..ClassifierConfig::default()
        }
    }

    pub fn settings(&self) -> Settings {
        Settings {
            main_branch: self.main_branch().to_string(),
            max_fix_attempts: self.toml.limits.max_fix_attempts,
            max_split_attempts: self.toml.limits.max_split_attempts,
            max_lines: self.toml.pr_split.max_lines,
            max_files: self.toml.pr_split.max_files,
            planning_timeout: self.agent_timeout(Phase::Planning),
            implementation_timeout: self.agent_timeout(Phase::Implementation),
            refactoring_timeout: self.agent_timeout(Phase::Refactoring),
            pr_split_timeout: self.agent_timeout(Phase::PrSplit),
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [&self.base_dir, &self.log_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
