//! The AI coding agent collaborator.

pub mod claude;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::errors::AgentError;

pub use claude::ClaudeExecutor;

#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    /// JSON schema the final answer must follow.
    pub schema: Option<String>,
    pub working_dir: PathBuf,
    pub env: HashMap<String, String>,
    pub timeout: Duration,
}

impl AgentRequest {
    pub fn new(prompt: impl Into<String>, working_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            prompt: prompt.into(),
            schema: None,
            working_dir,
            env: HashMap::new(),
            timeout,
        }
    }

    pub fn with_schema(mut self, schema: &str) -> Self {
        self.schema = Some(schema.to_string());
        self
    }
}

#[derive(Debug, Clone)]
pub struct AgentResponse {
    /// Final answer text.
    pub output: String,
    /// Structured answer, when the agent produced one directly.
    pub structured: Option<Value>,
    pub exit_code: i32,
    pub duration: Duration,
}

/// Streaming display events. Never used for control flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentProgress {
    ToolUse { name: String, description: String },
    ToolResult { is_error: bool },
    Text(String),
    Thinking(String),
}

#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute_streaming(
        &self,
        request: AgentRequest,
        cancel: &CancellationToken,
        on_progress: &(dyn Fn(AgentProgress) + Send + Sync),
    ) -> Result<AgentResponse, AgentError>;

    async fn execute(
        &self,
        request: AgentRequest,
        cancel: &CancellationToken,
    ) -> Result<AgentResponse, AgentError> {
        self.execute_streaming(request, cancel, &|_| {}).await
    }
}
