//! Queued units of external work.
//!
//! A task is created by a phase's EXECUTE step and consumed by a worker.
//! Request payloads are typed per kind; an enqueue with a payload that does
//! not deserialize for its declared kind is rejected up front and never
//! persisted.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TaskError;

/// Queue states of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Discriminates which executor handles a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    ChatCompletion,
    Search,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::ChatCompletion => "chat_completion",
            TaskKind::Search => "search",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat_completion" => Ok(TaskKind::ChatCompletion),
            "search" => Ok(TaskKind::Search),
            other => Err(format!("unknown task kind: {other}")),
        }
    }
}

/// Typed request payload, persisted as jsonb.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskRequest {
    /// One chat-completion call against the configured LLM provider.
    ChatCompletion {
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        system_prompt: Option<String>,
        prompt: String,
        #[serde(default)]
        max_tokens: Option<u32>,
        #[serde(default)]
        temperature: Option<f32>,
    },
    /// One online-search call against the configured search provider.
    Search {
        query: String,
        #[serde(default)]
        system_prompt: Option<String>,
        /// Recency window hint, e.g. "day" or "week".
        #[serde(default)]
        recency: Option<String>,
    },
}

impl TaskRequest {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskRequest::ChatCompletion { .. } => TaskKind::ChatCompletion,
            TaskRequest::Search { .. } => TaskKind::Search,
        }
    }

    /// Check a raw payload against a declared kind.
    ///
    /// Used by `enqueue`: a payload that does not deserialize for its kind
    /// is a `TaskError::Validation` and never reaches the table.
    pub fn validate(kind: TaskKind, payload: &serde_json::Value) -> Result<Self, TaskError> {
        let request: TaskRequest =
            serde_json::from_value(payload.clone()).map_err(|e| TaskError::Validation {
                kind: kind.to_string(),
                reason: e.to_string(),
            })?;
        if request.kind() != kind {
            return Err(TaskError::Validation {
                kind: kind.to_string(),
                reason: format!("payload is a {} request", request.kind()),
            });
        }
        Ok(request)
    }
}

/// One persisted unit of external work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub session_id: Uuid,
    pub phase_number: u32,
    pub step_name: String,
    pub kind: TaskKind,
    pub request: serde_json::Value,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub response: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Settled means no further worker attention: completed, or failed past
    /// the retry bound.
    pub fn is_settled(&self, max_retries: u32) -> bool {
        match self.status {
            TaskStatus::Completed => true,
            TaskStatus::Failed => self.retry_count >= max_retries,
            _ => false,
        }
    }

    /// Parse the typed request back out of the stored payload.
    pub fn typed_request(&self) -> Result<TaskRequest, TaskError> {
        TaskRequest::validate(self.kind, &self.request)
    }
}

/// Hourly queue counters, logged by the worker and served on `/stats`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_validation_accepts_matching_kind() {
        let payload = json!({
            "kind": "search",
            "query": "latest ai tooling",
            "recency": "week",
        });
        let request = TaskRequest::validate(TaskKind::Search, &payload).unwrap();
        assert_eq!(request.kind(), TaskKind::Search);
    }

    #[test]
    fn test_request_validation_rejects_kind_mismatch() {
        let payload = json!({
            "kind": "search",
            "query": "latest ai tooling",
        });
        let err = TaskRequest::validate(TaskKind::ChatCompletion, &payload).unwrap_err();
        assert!(matches!(err, TaskError::Validation { .. }));
    }

    #[test]
    fn test_request_validation_rejects_missing_fields() {
        let payload = json!({ "kind": "search" });
        assert!(TaskRequest::validate(TaskKind::Search, &payload).is_err());
    }

    #[test]
    fn test_settled_respects_retry_bound() {
        let mut task = Task {
            id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            phase_number: 1,
            step_name: "execute".to_string(),
            kind: TaskKind::Search,
            request: json!({"kind": "search", "query": "q"}),
            status: TaskStatus::Failed,
            retry_count: 1,
            response: None,
            error: Some("boom".to_string()),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        assert!(!task.is_settled(3));
        task.retry_count = 3;
        assert!(task.is_settled(3));
        task.status = TaskStatus::Completed;
        task.retry_count = 0;
        assert!(task.is_settled(3));
    }
}
