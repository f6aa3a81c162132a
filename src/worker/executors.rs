//! Task executors: the worker-side handlers for each task kind.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::TaskError;
use crate::llm::{ChatMessage, CompletionRequest, LlmClient, SearchClient};
use crate::task::{TaskKind, TaskRequest};

/// Handles one task kind. Executors must be safe to re-run: a task whose
/// worker died mid-flight comes back after the claim lease expires.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    fn kind(&self) -> TaskKind;

    /// Run the task and produce the response payload persisted on complete.
    async fn run(&self, request: TaskRequest) -> Result<Value, TaskError>;
}

fn wrong_kind(executor: TaskKind, got: TaskKind) -> TaskError {
    TaskError::Executor {
        kind: executor.to_string(),
        reason: format!("dispatched a {got} request"),
    }
}

pub struct ChatCompletionExecutor {
    llm: Arc<dyn LlmClient>,
}

impl ChatCompletionExecutor {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl TaskExecutor for ChatCompletionExecutor {
    fn kind(&self) -> TaskKind {
        TaskKind::ChatCompletion
    }

    async fn run(&self, request: TaskRequest) -> Result<Value, TaskError> {
        let TaskRequest::ChatCompletion {
            model,
            system_prompt,
            prompt,
            max_tokens,
            temperature,
        } = request
        else {
            return Err(wrong_kind(self.kind(), request.kind()));
        };

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system_prompt {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(prompt));

        let mut completion_request = CompletionRequest::new(messages).with_model(model);
        if let Some(max_tokens) = max_tokens {
            completion_request = completion_request.with_max_tokens(max_tokens);
        }
        if let Some(temperature) = temperature {
            completion_request = completion_request.with_temperature(temperature);
        }

        let completion =
            self.llm
                .complete(completion_request)
                .await
                .map_err(|e| TaskError::Executor {
                    kind: self.kind().to_string(),
                    reason: e.to_string(),
                })?;
        Ok(serde_json::json!({
            "content": completion.content,
            "total_tokens": completion.total_tokens,
        }))
    }
}

pub struct SearchExecutor {
    search: Arc<dyn SearchClient>,
}

impl SearchExecutor {
    pub fn new(search: Arc<dyn SearchClient>) -> Self {
        Self { search }
    }
}

#[async_trait]
impl TaskExecutor for SearchExecutor {
    fn kind(&self) -> TaskKind {
        TaskKind::Search
    }

    async fn run(&self, request: TaskRequest) -> Result<Value, TaskError> {
        let TaskRequest::Search {
            query,
            system_prompt,
            recency,
        } = request
        else {
            return Err(wrong_kind(self.kind(), request.kind()));
        };

        let outcome = self
            .search
            .search(&query, system_prompt.as_deref(), recency.as_deref())
            .await
            .map_err(|e| TaskError::Executor {
                kind: self.kind().to_string(),
                reason: e.to_string(),
            })?;
        serde_json::to_value(&outcome).map_err(|e| TaskError::Executor {
            kind: self.kind().to_string(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::SearchOutcome;

    struct CannedSearch;

    #[async_trait]
    impl SearchClient for CannedSearch {
        async fn search(
            &self,
            query: &str,
            _system_prompt: Option<&str>,
            _recency: Option<&str>,
        ) -> Result<SearchOutcome, LlmError> {
            Ok(SearchOutcome {
                content: format!("results for {query}"),
                citations: vec!["https://example.com".to_string()],
            })
        }
    }

    #[tokio::test]
    async fn test_search_executor_round_trip() {
        let executor = SearchExecutor::new(Arc::new(CannedSearch));
        let response = executor
            .run(TaskRequest::Search {
                query: "rust async".to_string(),
                system_prompt: None,
                recency: Some("week".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(response["content"], "results for rust async");
    }

    #[tokio::test]
    async fn test_executor_rejects_mismatched_request() {
        let executor = SearchExecutor::new(Arc::new(CannedSearch));
        let err = executor
            .run(TaskRequest::ChatCompletion {
                model: None,
                system_prompt: None,
                prompt: "hi".to_string(),
                max_tokens: None,
                temperature: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Executor { .. }));
    }
}
