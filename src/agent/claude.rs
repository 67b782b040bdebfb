use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{AgentExecutor, AgentProgress, AgentRequest, AgentResponse};
use crate::errors::AgentError;
use crate::stream::StreamEvent;

/// Runs the `claude` CLI in print mode with stream-json output.
#[derive(Debug, Clone)]
pub struct ClaudeExecutor {
    command: String,
    skip_permissions: bool,
}

struct StreamOutcome {
    text: String,
    result: Option<String>,
    structured: Option<Value>,
    is_error: bool,
}

impl ClaudeExecutor {
    pub fn new(command: impl Into<String>, skip_permissions: bool) -> Self {
        Self {
            command: command.into(),
            skip_permissions,
        }
    }

    pub fn flags(&self) -> Vec<&'static str> {
        let mut flags = vec!["--print", "--output-format", "stream-json", "--verbose"];
        if self.skip_permissions {
            flags.push("--dangerously-skip-permissions");
        }
        flags
    }

    fn full_prompt(request: &AgentRequest) -> String {
        match &request.schema {
            Some(schema) => format!(
                "{}\n\n## OUTPUT FORMAT\n\nWhen finished, reply with a single JSON object matching this schema and nothing else:\n\n```json\n{}\n```\n",
                request.prompt, schema
            ),
            None => request.prompt.clone(),
        }
    }

    async fn read_stream(
        stdout: tokio::process::ChildStdout,
        on_progress: &(dyn Fn(AgentProgress) + Send + Sync),
    ) -> Result<StreamOutcome, AgentError> {
        let mut reader = BufReader::new(stdout).lines();
        let mut outcome = StreamOutcome {
            text: String::new(),
            result: None,
            structured: None,
            is_error: false,
        };

        while let Some(line) = reader.next_line().await.map_err(AgentError::Io)? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<StreamEvent>(&line) {
                Ok(event) => {
                    for progress in event.progress_events() {
                        on_progress(progress);
                    }
                    match event {
                        StreamEvent::Assistant { message, .. } => {
                            for block in message.content {
                                if let crate::stream::ContentBlock::Text { text } = block {
                                    outcome.text.push_str(&text);
                                    outcome.text.push('\n');
                                }
                            }
                        }
                        StreamEvent::Result {
                            result,
                            is_error,
                            structured_output,
                            ..
                        } => {
                            outcome.result = result;
                            outcome.is_error = is_error;
                            outcome.structured = structured_output;
                        }
                        _ => {}
                    }
                }
                Err(_) => {
                    // Not a stream event; keep it as plain output.
                    outcome.text.push_str(&line);
                    outcome.text.push('\n');
                }
            }
        }
        Ok(outcome)
    }
}

fn is_prompt_too_long(text: &str) -> bool {
    text.to_lowercase().contains("prompt is too long")
}

#[async_trait]
impl AgentExecutor for ClaudeExecutor {
    async fn execute_streaming(
        &self,
        request: AgentRequest,
        cancel: &CancellationToken,
        on_progress: &(dyn Fn(AgentProgress) + Send + Sync),
    ) -> Result<AgentResponse, AgentError> {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        let prompt = Self::full_prompt(&request);
        let start = Instant::now();

        let mut child = Command::new(&self.command)
            .args(self.flags())
            .envs(&request.env)
            .current_dir(&request.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => AgentError::NotFound(self.command.clone()),
                _ => AgentError::Io(e),
            })?;

        tracing::debug!(
            pid = child.id().unwrap_or(0),
            prompt_chars = prompt.len(),
            dir = %request.working_dir.display(),
            "spawned agent"
        );

        // Fed from its own task so a child that never drains stdin cannot
        // hold the call past its timeout or cancellation.
        let writer = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                stdin.write_all(prompt.as_bytes()).await?;
                stdin.shutdown().await
            })
        });

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Io(std::io::Error::other("agent stdout unavailable")))?;
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let run = async {
            let outcome = Self::read_stream(stdout, on_progress).await?;
            let status = child.wait().await.map_err(AgentError::Io)?;
            Ok::<_, AgentError>((outcome, status))
        };

        let finished = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!("agent cancelled");
                Err(AgentError::Cancelled)
            }
            res = tokio::time::timeout(request.timeout, run) => match res {
                Ok(inner) => inner,
                Err(_) => {
                    tracing::warn!(timeout_secs = request.timeout.as_secs(), "agent timed out");
                    Err(AgentError::Timeout(request.timeout))
                }
            },
        };
        let (outcome, status) = match finished {
            Ok(done) => done,
            Err(e) => {
                if let Some(writer) = &writer {
                    writer.abort();
                }
                return Err(e);
            }
        };
        if let Some(writer) = writer {
            match writer.await {
                Ok(Ok(())) => {}
                // The agent may exit without reading all of its input; its
                // exit status decides the outcome.
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    tracing::debug!("agent closed stdin before reading the whole prompt");
                }
                Ok(Err(e)) => return Err(AgentError::Io(e)),
                Err(e) => return Err(AgentError::Io(std::io::Error::other(e))),
            }
        }

        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        let exit_code = status.code().unwrap_or(-1);
        let output = outcome.result.unwrap_or(outcome.text);
        let duration = start.elapsed();

        tracing::info!(
            exit_code,
            duration_secs = duration.as_secs(),
            output_chars = output.len(),
            "agent finished"
        );

        if exit_code != 0 || outcome.is_error {
            if is_prompt_too_long(&output) || is_prompt_too_long(&stderr) {
                return Err(AgentError::PromptTooLong);
            }
            let message = if stderr.trim().is_empty() {
                output.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(AgentError::Failed { exit_code, message });
        }

        Ok(AgentResponse {
            output,
            structured: outcome.structured,
            exit_code,
            duration,
        })
    }
}
