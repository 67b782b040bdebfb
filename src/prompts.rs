//! Prompt text and output schemas for each phase.

use crate::phase::Phase;
use crate::workflow::{PlanOutput, PrMetrics, WorkflowState};

pub const PLAN_SCHEMA: &str = r#"{
  "type": "object",
  "required": ["summary", "steps"],
  "properties": {
    "summary": {"type": "string"},
    "approach": {"type": "string"},
    "steps": {"type": "array", "items": {"type": "string"}},
    "files_to_change": {"type": "array", "items": {"type": "string"}},
    "risks": {"type": "array", "items": {"type": "string"}},
    "test_strategy": {"type": "string"}
  }
}"#;

pub const IMPLEMENTATION_SCHEMA: &str = r#"{
  "type": "object",
  "required": ["summary"],
  "properties": {
    "summary": {"type": "string"},
    "files_changed": {"type": "array", "items": {"type": "string"}},
    "tests_added": {"type": "array", "items": {"type": "string"}},
    "pr_number": {"type": "integer"},
    "pr_url": {"type": "string"}
  }
}"#;

pub const REFACTORING_SCHEMA: &str = r#"{
  "type": "object",
  "required": ["summary"],
  "properties": {
    "summary": {"type": "string"},
    "changes": {"type": "array", "items": {"type": "string"}}
  }
}"#;

pub const PR_SPLIT_SCHEMA: &str = r#"{
  "type": "object",
  "required": ["plan"],
  "properties": {
    "rationale": {"type": "string"},
    "plan": {
      "type": "object",
      "required": ["strategy", "parent_title", "children"],
      "properties": {
        "strategy": {"enum": ["commits", "files"]},
        "parent_title": {"type": "string"},
        "parent_description": {"type": "string"},
        "children": {
          "type": "array",
          "minItems": 1,
          "items": {
            "type": "object",
            "required": ["title"],
            "properties": {
              "title": {"type": "string"},
              "description": {"type": "string"},
              "commits": {"type": "array", "items": {"type": "string"}},
              "files": {"type": "array", "items": {"type": "string"}}
            }
          }
        }
      }
    }
  }
}"#;

/// Schema for the structured answer a phase expects, if any.
pub fn schema_for(phase: Phase) -> Option<&'static str> {
    match phase {
        Phase::Planning => Some(PLAN_SCHEMA),
        Phase::Implementation => Some(IMPLEMENTATION_SCHEMA),
        Phase::Refactoring => Some(REFACTORING_SCHEMA),
        Phase::PrSplit => Some(PR_SPLIT_SCHEMA),
        _ => None,
    }
}

/// Inputs for the PR split prompt.
#[derive(Debug, Clone, Copy)]
pub struct SplitContext<'a> {
    pub source_branch: &'a str,
    pub main_branch: &'a str,
    pub commits: &'a [String],
    pub metrics: &'a PrMetrics,
    pub max_lines: usize,
    pub max_files: usize,
    pub feedback: &'a [String],
}

pub trait PromptGenerator: Send + Sync {
    fn planning(&self, state: &WorkflowState, feedback: &[String]) -> String;

    fn implementation(&self, state: &WorkflowState, plan: &PlanOutput) -> String;

    fn refactoring(&self, state: &WorkflowState, plan: Option<&PlanOutput>) -> String;

    fn pr_split(&self, state: &WorkflowState, ctx: SplitContext<'_>) -> String;

    /// Follow-up prompt after CI failed on the agent's previous push.
    fn fix_ci(&self, state: &WorkflowState, phase: Phase, failure: &str, attempt: u32) -> String;
}

/// Built-in prompt templates.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplatePrompts;

fn header(state: &WorkflowState) -> String {
    let mut text = format!(
        "# Workflow: {} ({})\n\n## Request\n\n{}\n",
        state.name, state.workflow_type, state.description
    );
    if let Some(branch) = &state.branch {
        text.push_str(&format!("\nYou are working on branch `{}`.\n", branch));
    }
    text
}

fn feedback_section(feedback: &[String]) -> String {
    if feedback.is_empty() {
        return String::new();
    }
    let mut text = String::from("\n## Feedback to address\n\n");
    for item in feedback {
        text.push_str(&format!("- {}\n", item.trim()));
    }
    text
}

impl PromptGenerator for TemplatePrompts {
    fn planning(&self, state: &WorkflowState, feedback: &[String]) -> String {
        format!(
            "{}{}\n## Task\n\nStudy the repository and write an implementation plan for the request. \
             Do not modify any files. List the concrete steps, the files you expect to change, \
             the risks, and how the change will be tested.\n",
            header(state),
            feedback_section(feedback)
        )
    }

    fn implementation(&self, state: &WorkflowState, plan: &PlanOutput) -> String {
        format!(
            "{}\n{}\n## Task\n\nImplement the approved plan. Add or update tests, commit your work, \
             push the branch and open a pull request against the main branch. \
             Report the pull request number in your answer.\n",
            header(state),
            plan.to_markdown(&state.name)
        )
    }

    fn refactoring(&self, state: &WorkflowState, plan: Option<&PlanOutput>) -> String {
        let plan_text = plan.map(|p| p.to_markdown(&state.name)).unwrap_or_default();
        format!(
            "{}\n{}\n## Task\n\nThe implementation is in place and CI passes. Review the change for \
             duplication, naming and structure, and refactor without changing behavior. \
             Keep tests green, commit and push to the same branch.\n",
            header(state),
            plan_text
        )
    }

    fn pr_split(&self, state: &WorkflowState, ctx: SplitContext<'_>) -> String {
        let mut text = header(state);
        text.push_str(&format!(
            "\n## Change size\n\n{} lines changed across {} files (limits: {} lines, {} files).\n",
            ctx.metrics.total_lines, ctx.metrics.files_changed, ctx.max_lines, ctx.max_files
        ));
        text.push_str(&format!(
            "\n## Commits on `{}` since `{}`\n\n",
            ctx.source_branch, ctx.main_branch
        ));
        for commit in ctx.commits {
            text.push_str(&format!("- {}\n", commit));
        }
        text.push_str(&feedback_section(ctx.feedback));
        text.push_str(
            "\n## Task\n\nThe change is too large to review as one pull request. Propose a split into \
             an ordered chain of smaller pull requests. Use the `commits` strategy when the commits \
             above group cleanly, otherwise the `files` strategy. Every child must be independently \
             buildable on top of the previous one. Do not run git commands yourself.\n",
        );
        text
    }

    fn fix_ci(&self, state: &WorkflowState, phase: Phase, failure: &str, attempt: u32) -> String {
        format!(
            "{}\n## CI failed (fix attempt {} in the {} phase)\n\n```\n{}\n```\n\n## Task\n\n\
             Find the cause of the failing checks, fix it, commit and push to the same branch. \
             Do not disable or skip tests.\n",
            header(state),
            attempt,
            phase,
            failure.trim()
        )
    }
}
