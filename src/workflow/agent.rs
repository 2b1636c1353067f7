//! `CodeAgent`: the external code-generation collaborator boundary (§1).
//!
//! Mirrors the teacher's `LlmClient` trait — a stateless, fresh-context call
//! per request plus a `#[cfg(test)] mod mock` double — generalized to the
//! two calls the step graph actually needs: generating code for a task, and
//! repairing malformed JSON when the extraction pipeline exhausts its other
//! strategies.

use async_trait::async_trait;

use crate::domain::TaskContext;
use crate::error::CoreError;

/// Raw text response from one agent call, alongside the token accounting
/// the step graph folds into its metrics delta.
#[derive(Debug, Clone)]
pub struct AgentResponse {
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

#[async_trait]
pub trait CodeAgent: Send + Sync {
    /// Generate a response for one task, given its prompt and context. The
    /// caller parses the returned text into `CodeChanges` via the JSON
    /// recovery pipeline — the agent itself makes no structural promise.
    async fn generate_code(&self, prompt: &str, context: &TaskContext) -> Result<AgentResponse, CoreError>;

    /// Secondary call used only by the JSON recovery pipeline's AI-fallback
    /// strategy, asked to reduce `malformed` to well-formed JSON.
    async fn repair_json(&self, malformed: &str) -> Result<AgentResponse, CoreError>;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Mock agent returning a fixed script of responses, in order.
    pub struct MockCodeAgent {
        responses: Mutex<Vec<Result<AgentResponse, String>>>,
        call_count: AtomicUsize,
    }

    impl MockCodeAgent {
        pub fn new(responses: Vec<Result<AgentResponse, String>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                call_count: AtomicUsize::new(0),
            }
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }

        fn next(&self) -> Result<AgentResponse, CoreError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(CoreError::Agent("no more mock responses".into()));
            }
            responses.remove(0).map_err(CoreError::Agent)
        }
    }

    #[async_trait]
    impl CodeAgent for MockCodeAgent {
        async fn generate_code(&self, _prompt: &str, _context: &TaskContext) -> Result<AgentResponse, CoreError> {
            self.next()
        }

        async fn repair_json(&self, _malformed: &str) -> Result<AgentResponse, CoreError> {
            self.next()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::domain::{Priority, Task, TaskStatus, TaskType};

        fn ctx() -> TaskContext {
            TaskContext {
                task: Task {
                    id: "T1".into(),
                    title: "t".into(),
                    description: String::new(),
                    priority: Priority::Medium,
                    status: TaskStatus::Pending,
                    task_type: TaskType::Generate,
                    dependencies: vec![],
                    parent: None,
                    details: None,
                    prd_set_id: None,
                },
                codebase_context: String::new(),
                prd_id: None,
                phase_id: None,
                prd_set_id: None,
                target_module: None,
            }
        }

        #[tokio::test]
        async fn returns_scripted_responses_in_order() {
            let agent = MockCodeAgent::new(vec![Ok(AgentResponse {
                text: "hello".into(),
                tokens_in: 1,
                tokens_out: 2,
            })]);
            let resp = agent.generate_code("p", &ctx()).await.unwrap();
            assert_eq!(resp.text, "hello");
            assert_eq!(agent.call_count(), 1);
        }

        #[tokio::test]
        async fn errors_when_exhausted() {
            let agent = MockCodeAgent::new(vec![]);
            assert!(agent.generate_code("p", &ctx()).await.is_err());
        }
    }
}
