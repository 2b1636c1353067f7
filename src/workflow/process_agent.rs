//! Concrete [`CodeAgent`] that shells out to an external agent command,
//! feeding it the prompt on stdin and reading its response from stdout.
//! The actual model call is the explicitly out-of-scope boundary (§1); this
//! adapter only has to get bytes to and from whatever process the operator
//! configured, the same way the teacher's bash tool invokes `sh -c` under a
//! timeout rather than linking a shell.
//!
//! Token accounting has no ground truth once that process is a black box,
//! so usage is estimated at four characters per token — rough, but stable
//! enough for handoff-policy math, which only needs a monotonic proxy.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::domain::TaskContext;
use crate::error::CoreError;

use super::agent::{AgentResponse, CodeAgent};

const CHARS_PER_TOKEN: usize = 4;

pub struct ProcessCodeAgent {
    command: String,
    timeout: Duration,
}

impl ProcessCodeAgent {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self { command: command.into(), timeout }
    }

    async fn invoke(&self, prompt: &str) -> Result<AgentResponse, CoreError> {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CoreError::Agent(format!("failed to spawn agent command: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| CoreError::Agent(format!("failed to write prompt to agent stdin: {e}")))?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| CoreError::Agent(format!("agent call timed out after {:?}", self.timeout)))?
            .map_err(|e| CoreError::Agent(format!("agent process failed: {e}")))?;

        if !output.status.success() {
            return Err(CoreError::Agent(format!(
                "agent command exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        let tokens_in = (prompt.len() / CHARS_PER_TOKEN) as u64;
        let tokens_out = (text.len() / CHARS_PER_TOKEN) as u64;
        Ok(AgentResponse { text, tokens_in, tokens_out })
    }
}

#[async_trait]
impl CodeAgent for ProcessCodeAgent {
    async fn generate_code(&self, prompt: &str, _context: &TaskContext) -> Result<AgentResponse, CoreError> {
        self.invoke(prompt).await
    }

    async fn repair_json(&self, malformed: &str) -> Result<AgentResponse, CoreError> {
        let prompt = format!("Return only well-formed JSON with keys `files` and `summary`, repairing this:\n{malformed}");
        self.invoke(&prompt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_prompt_back_through_a_trivial_command() {
        let agent = ProcessCodeAgent::new("cat", Duration::from_secs(5));
        let response = agent.invoke("hello world").await.unwrap();
        assert_eq!(response.text, "hello world");
        assert!(response.tokens_in > 0);
    }

    #[tokio::test]
    async fn nonzero_exit_is_surfaced_as_an_agent_error() {
        let agent = ProcessCodeAgent::new("exit 1", Duration::from_secs(5));
        let err = agent.invoke("x").await.unwrap_err();
        assert!(matches!(err, CoreError::Agent(_)));
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let agent = ProcessCodeAgent::new("sleep 5", Duration::from_millis(50));
        let err = agent.invoke("x").await.unwrap_err();
        assert!(matches!(err, CoreError::Agent(_)));
    }
}
