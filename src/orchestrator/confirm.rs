//! Operator confirmation of the plan before any code is written.

use async_trait::async_trait;
use console::style;
use dialoguer::{Input, Select, theme::ColorfulTheme};

use crate::workflow::PlanOutput;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmDecision {
    Approve,
    /// Send the plan back to Planning with this feedback.
    Reject { feedback: String },
    Abort,
}

#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn confirm(
        &self,
        workflow: &str,
        plan: &PlanOutput,
        markdown: &str,
    ) -> std::io::Result<ConfirmDecision>;
}

/// Approves every plan. Used for `--yes`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl Confirmer for AutoApprove {
    async fn confirm(
        &self,
        workflow: &str,
        _plan: &PlanOutput,
        _markdown: &str,
    ) -> std::io::Result<ConfirmDecision> {
        tracing::info!(workflow, "plan auto-approved");
        println!("  {} (--yes flag)", style("Plan auto-approved").dim());
        Ok(ConfirmDecision::Approve)
    }
}

/// Shows the plan and asks on the terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct InteractiveConfirmer;

fn prompt_decision(workflow: &str, markdown: &str) -> std::io::Result<ConfirmDecision> {
    if !console::Term::stderr().is_term() {
        return Err(std::io::Error::other(
            "plan confirmation needs a terminal; rerun with --yes to auto-approve",
        ));
    }

    println!();
    println!("{}", style(format!("Plan for '{}'", workflow)).bold().cyan());
    println!("{}", markdown);

    let options = &[
        "Approve, start implementing",
        "Request changes to the plan",
        "Abort for now",
    ];
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Proceed with this plan?")
        .items(options)
        .default(0)
        .interact()?;

    match selection {
        0 => Ok(ConfirmDecision::Approve),
        1 => {
            let feedback: String = Input::with_theme(&ColorfulTheme::default())
                .with_prompt("What should change?")
                .interact_text()?;
            Ok(ConfirmDecision::Reject { feedback })
        }
        _ => Ok(ConfirmDecision::Abort),
    }
}

#[async_trait]
impl Confirmer for InteractiveConfirmer {
    async fn confirm(
        &self,
        workflow: &str,
        _plan: &PlanOutput,
        markdown: &str,
    ) -> std::io::Result<ConfirmDecision> {
        let workflow = workflow.to_string();
        let markdown = markdown.to_string();
        tokio::task::spawn_blocking(move || prompt_decision(&workflow, &markdown))
            .await
            .map_err(std::io::Error::other)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_auto_approve() {
        let decision = AutoApprove
            .confirm("auth", &PlanOutput::default(), "# Plan")
            .await
            .unwrap();
        assert_eq!(decision, ConfirmDecision::Approve);
    }
}
