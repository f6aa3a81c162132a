//! Error types, one enum per concern.
//!
//! Every failure that can stall a pipeline is persisted (session
//! `last_error`, task `error`) before it is logged; nothing is dropped on the
//! floor. `anyhow` appears only at the binary edge.

use thiserror::Error;
use uuid::Uuid;

/// Errors from the storage layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("row not found: {entity} {id}")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid stored value: {0}")]
    InvalidValue(String),
}

impl From<deadpool_postgres::PoolError> for DatabaseError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        DatabaseError::Pool(e.to_string())
    }
}

/// Errors from the task queue and its executors.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Request payload does not match the task kind's schema. Rejected
    /// synchronously at enqueue; never persisted as a task.
    #[error("invalid {kind} request: {reason}")]
    Validation { kind: String, reason: String },

    /// The task's external call failed. Recorded via `fail`, retried up to
    /// the configured bound.
    #[error("executor failed for {kind}: {reason}")]
    Executor { kind: String, reason: String },

    #[error("no executor registered for task kind {0}")]
    UnknownKind(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Errors raised by a phase strategy's THINK/EXECUTE/INTEGRATE functions.
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("llm call failed: {0}")]
    Llm(#[from] LlmError),

    #[error("malformed step output: {0}")]
    MalformedOutput(String),

    #[error("missing prerequisite: {0}")]
    MissingPrerequisite(String),

    #[error("{0}")]
    Other(String),
}

/// Errors from the session state machine.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(Uuid),

    #[error("no strategy configured for phase {0}")]
    UnknownPhase(u32),

    #[error("cannot {verb} a session in status {from}")]
    InvalidTransition {
        from: crate::session::SessionStatus,
        verb: &'static str,
    },

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Strategy(#[from] StrategyError),

    #[error(transparent)]
    Task(#[from] TaskError),
}

/// Errors from LLM and search providers.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("{provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("{provider} returned an invalid response: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("{provider} authentication failed")]
    AuthFailed { provider: String },

    #[error("{provider} rate limited")]
    RateLimited { provider: String },

    #[error("{provider} is not configured (missing API key)")]
    NotConfigured { provider: String },
}
