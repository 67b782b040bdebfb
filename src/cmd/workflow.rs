//! Workflow lifecycle commands: `shepherd start|resume|status|list|delete|clean`.

use anyhow::{Context, Result};
use console::style;
use dialoguer::Confirm;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use shepherd::agent::ClaudeExecutor;
use shepherd::ci::{CiPoller, FailureClassifier};
use shepherd::clock::SystemClock;
use shepherd::config::Config;
use shepherd::errors::OrchestratorError;
use shepherd::git::{GitCli, GitWorktrees};
use shepherd::github::GhCli;
use shepherd::orchestrator::{
    AutoApprove, Collaborators, Confirmer, InteractiveConfirmer, Orchestrator,
};
use shepherd::prompts::TemplatePrompts;
use shepherd::state::StateStore;
use shepherd::ui::{TerminalObserver, render_list, render_status};
use shepherd::workflow::{WorkflowState, WorkflowStatus, WorkflowType};

/// Wire the production collaborators from configuration.
fn build_orchestrator(config: &Config) -> Result<Orchestrator> {
    let command_timeout = config.command_timeout();
    let gh = Arc::new(GhCli::new(command_timeout));
    let confirmer: Arc<dyn Confirmer> = if config.yes {
        Arc::new(AutoApprove)
    } else {
        Arc::new(InteractiveConfirmer)
    };
    let ci = CiPoller::new(
        gh.clone(),
        Arc::new(SystemClock),
        config.poll_config()?,
        FailureClassifier::new(config.classifier_config()),
    );
    let collab = Collaborators {
        agent: Arc::new(ClaudeExecutor::new(
            config.agent_command(),
            config.skip_permissions(),
        )),
        git: Arc::new(GitCli::new(command_timeout)),
        prs: gh,
        worktrees: Arc::new(GitWorktrees::new(
            config.repo_dir.clone(),
            config.worktree_dir.clone(),
            command_timeout,
        )),
        prompts: Arc::new(TemplatePrompts),
        confirmer,
        ci,
    };
    Ok(Orchestrator::new(
        StateStore::new(config.base_dir.clone()),
        config.settings(),
        collab,
    ))
}

/// Cancel the token on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping after the current step");
            token.cancel();
        }
    });
    cancel
}

fn report_outcome(
    name: &str,
    observer: &TerminalObserver,
    result: Result<WorkflowState, OrchestratorError>,
) -> Result<()> {
    match result {
        Ok(state) if state.status() == WorkflowStatus::Completed => {
            observer.finish(true, &format!("Workflow '{}' completed", name));
            if let Some(pr) = state.pr_number {
                println!("  Pull request: #{}", pr);
            }
            Ok(())
        }
        Ok(state) => {
            observer.finish(false, &format!("Workflow '{}' stopped", name));
            anyhow::bail!(
                "Workflow '{}' stopped in {} ({})",
                name,
                state.current_phase,
                state.status()
            )
        }
        Err(e) if e.is_cancelled() => {
            observer.finish(false, &format!("Workflow '{}' cancelled", name));
            println!(
                "  Progress is saved. Continue with {}",
                style(format!("shepherd resume {}", name)).cyan()
            );
            Err(e).with_context(|| format!("Workflow '{}' did not finish", name))
        }
        Err(e) => {
            observer.finish(false, &format!("Workflow '{}' failed", name));
            if e.is_recoverable() {
                println!(
                    "  Fix the cause and continue with {}",
                    style(format!("shepherd resume {}", name)).cyan()
                );
            }
            Err(e).with_context(|| format!("Workflow '{}' did not finish", name))
        }
    }
}

pub async fn cmd_start(
    config: &Config,
    name: &str,
    description: &str,
    workflow_type: &str,
) -> Result<()> {
    let workflow_type: WorkflowType = workflow_type.parse()?;
    let observer = Arc::new(TerminalObserver::new(config.verbose));
    let orchestrator = build_orchestrator(config)?.with_observer(observer.clone());
    let cancel = cancel_on_ctrl_c();

    println!(
        "{} {} ({})",
        style("Starting workflow").bold(),
        style(name).cyan(),
        workflow_type
    );
    let result = orchestrator
        .start(name, description, workflow_type, &cancel)
        .await;
    report_outcome(name, &observer, result)
}

pub async fn cmd_resume(config: &Config, name: &str) -> Result<()> {
    let observer = Arc::new(TerminalObserver::new(config.verbose));
    let orchestrator = build_orchestrator(config)?.with_observer(observer.clone());
    let cancel = cancel_on_ctrl_c();

    println!(
        "{} {}",
        style("Resuming workflow").bold(),
        style(name).cyan()
    );
    let result = orchestrator.resume(name, &cancel).await;
    report_outcome(name, &observer, result)
}

pub fn cmd_status(config: &Config, name: &str) -> Result<()> {
    let state = build_orchestrator(config)?.status(name)?;
    print!("{}", render_status(&state));
    Ok(())
}

pub fn cmd_list(config: &Config) -> Result<()> {
    let summaries = build_orchestrator(config)?.list()?;
    print!("{}", render_list(&summaries));
    Ok(())
}

pub async fn cmd_delete(config: &Config, name: &str, force: bool) -> Result<()> {
    if !force {
        let confirm = Confirm::new()
            .with_prompt(format!("Delete workflow '{}' and its worktree?", name))
            .default(false)
            .interact()
            .unwrap_or(false);

        if !confirm {
            println!("Deletion cancelled.");
            return Ok(());
        }
    }

    build_orchestrator(config)?.delete(name).await?;
    println!("Deleted workflow '{}'", name);
    Ok(())
}

pub async fn cmd_clean(config: &Config) -> Result<()> {
    let removed = build_orchestrator(config)?.clean().await?;
    if removed.is_empty() {
        println!("No completed workflows to clean.");
    } else {
        for name in &removed {
            println!("Removed '{}'", name);
        }
    }
    Ok(())
}
