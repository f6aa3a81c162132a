//! Storage abstraction.
//!
//! Everything above this layer programs against these traits; `PgStore` is
//! the production backend and `MemoryStore` backs tests and ephemeral runs.
//! Both enforce the same claim and idempotence semantics.

pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::drafts::Draft;
use crate::error::{DatabaseError, TaskError};
use crate::session::{Phase, Session};
use crate::task::{QueueStats, Task, TaskKind};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Session and phase persistence.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, session: &Session) -> Result<(), DatabaseError>;

    async fn get_session(&self, id: Uuid) -> Result<Option<Session>, DatabaseError>;

    /// Write the full session row back; bumps `updated_at`.
    async fn update_session(&self, session: &Session) -> Result<(), DatabaseError>;

    /// Fetch the phase row, inserting a fresh Pending one if absent.
    ///
    /// Insertion races resolve through the (session_id, phase_number)
    /// uniqueness constraint; the surviving row is returned either way.
    async fn get_or_create_phase(
        &self,
        session_id: Uuid,
        phase_number: u32,
    ) -> Result<Phase, DatabaseError>;

    async fn update_phase(&self, phase: &Phase) -> Result<(), DatabaseError>;

    async fn list_phases(&self, session_id: Uuid) -> Result<Vec<Phase>, DatabaseError>;

    /// Non-terminal, non-paused sessions whose `updated_at` is older than the
    /// applicable cutoff (`execute_cutoff` while Executing, `cutoff`
    /// otherwise), plus failed-step sessions whose `next_retry_at` has come
    /// due.
    async fn sessions_needing_attention(
        &self,
        cutoff: DateTime<Utc>,
        execute_cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Uuid>, DatabaseError>;

    /// Completed sessions with zero draft rows.
    async fn completed_sessions_without_drafts(
        &self,
        limit: usize,
    ) -> Result<Vec<Uuid>, DatabaseError>;
}

/// Durable task queue.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a Queued task. The payload must deserialize for `kind` or the
    /// call fails with `TaskError::Validation` without persisting anything.
    async fn enqueue(
        &self,
        session_id: Uuid,
        phase_number: u32,
        kind: TaskKind,
        request: serde_json::Value,
    ) -> Result<Uuid, TaskError>;

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// Atomically claim up to `limit` Queued tasks with retry_count below
    /// `max_retry`, FIFO by creation time, moving them to Processing.
    ///
    /// Concurrent claimers never block on each other and never receive the
    /// same task (skip-locked semantics).
    async fn claim_batch(&self, limit: usize, max_retry: u32) -> Result<Vec<Task>, DatabaseError>;

    /// Processing -> Completed with the response persisted. A duplicate
    /// complete logs and no-ops.
    async fn complete_task(
        &self,
        id: Uuid,
        response: serde_json::Value,
    ) -> Result<(), DatabaseError>;

    /// Processing -> Failed, retry_count += 1. Does not requeue; the caller
    /// decides whether to retry or abandon.
    async fn fail_task(&self, id: Uuid, error: &str) -> Result<(), DatabaseError>;

    /// Failed -> Queued for another attempt. Retry accounting is unchanged.
    async fn requeue_task(&self, id: Uuid) -> Result<(), DatabaseError>;

    /// All tasks for one (session, phase, step).
    async fn tasks_for_step(
        &self,
        session_id: Uuid,
        phase_number: u32,
        step_name: &str,
    ) -> Result<Vec<Task>, DatabaseError>;

    /// Revert tasks stuck in Processing longer than the lease to Queued,
    /// retry_count unchanged. Returns how many were released.
    async fn release_stale_claims(&self, older_than: DateTime<Utc>) -> Result<u64, DatabaseError>;

    /// Queue counters over a trailing window.
    async fn queue_stats(&self, window: Duration) -> Result<QueueStats, DatabaseError>;
}

/// Draft persistence.
#[async_trait]
pub trait DraftStore: Send + Sync {
    /// Insert all drafts in one transaction. Returns `false` when the
    /// (session_id, concept_number) constraint fired, meaning a previous
    /// materialization already ran.
    async fn insert_drafts(&self, drafts: &[Draft]) -> Result<bool, DatabaseError>;

    async fn list_drafts(&self, session_id: Uuid) -> Result<Vec<Draft>, DatabaseError>;
}
