//! In-process store with the same semantics as the Postgres backend.
//!
//! All tables live behind a single mutex, which makes the claim trivially
//! exclusive: a batch is selected and flipped to Processing inside one
//! critical section, mirroring the skip-locked transaction on Postgres.
//! Backs tests and `--ephemeral` local runs.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::drafts::Draft;
use crate::error::{DatabaseError, TaskError};
use crate::session::{Phase, Session, SessionStatus};
use crate::store::{DraftStore, SessionStore, TaskStore};
use crate::task::{QueueStats, Task, TaskKind, TaskRequest, TaskStatus};

#[derive(Default)]
struct Tables {
    sessions: HashMap<Uuid, Session>,
    phases: HashMap<(Uuid, u32), Phase>,
    tasks: HashMap<Uuid, Task>,
    drafts: HashMap<Uuid, Vec<Draft>>,
}

/// In-memory implementation of all store traits.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backdate a session's `updated_at`, for stall-recovery tests.
    pub async fn backdate_session(&self, id: Uuid, updated_at: DateTime<Utc>) {
        let mut tables = self.tables.lock().await;
        if let Some(session) = tables.sessions.get_mut(&id) {
            session.updated_at = updated_at;
        }
    }

    /// Backdate a task's `started_at`, for stale-claim tests.
    pub async fn backdate_task_start(&self, id: Uuid, started_at: DateTime<Utc>) {
        let mut tables = self.tables.lock().await;
        if let Some(task) = tables.tasks.get_mut(&id) {
            task.started_at = Some(started_at);
        }
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_session(&self, session: &Session) -> Result<(), DatabaseError> {
        let mut tables = self.tables.lock().await;
        tables.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<Session>, DatabaseError> {
        let tables = self.tables.lock().await;
        Ok(tables.sessions.get(&id).cloned())
    }

    async fn update_session(&self, session: &Session) -> Result<(), DatabaseError> {
        let mut tables = self.tables.lock().await;
        if !tables.sessions.contains_key(&session.id) {
            return Err(DatabaseError::NotFound {
                entity: "session",
                id: session.id,
            });
        }
        let mut updated = session.clone();
        updated.updated_at = Utc::now();
        tables.sessions.insert(session.id, updated);
        Ok(())
    }

    async fn get_or_create_phase(
        &self,
        session_id: Uuid,
        phase_number: u32,
    ) -> Result<Phase, DatabaseError> {
        let mut tables = self.tables.lock().await;
        let phase = tables
            .phases
            .entry((session_id, phase_number))
            .or_insert_with(|| Phase::new(session_id, phase_number));
        Ok(phase.clone())
    }

    async fn update_phase(&self, phase: &Phase) -> Result<(), DatabaseError> {
        let mut tables = self.tables.lock().await;
        tables
            .phases
            .insert((phase.session_id, phase.phase_number), phase.clone());
        Ok(())
    }

    async fn list_phases(&self, session_id: Uuid) -> Result<Vec<Phase>, DatabaseError> {
        let tables = self.tables.lock().await;
        let mut phases: Vec<Phase> = tables
            .phases
            .values()
            .filter(|p| p.session_id == session_id)
            .cloned()
            .collect();
        phases.sort_by_key(|p| p.phase_number);
        Ok(phases)
    }

    async fn sessions_needing_attention(
        &self,
        cutoff: DateTime<Utc>,
        execute_cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Uuid>, DatabaseError> {
        let now = Utc::now();
        let tables = self.tables.lock().await;
        let mut hits: Vec<&Session> = tables
            .sessions
            .values()
            .filter(|s| {
                !s.status.is_terminal() && s.status != SessionStatus::Paused
            })
            .filter(|s| {
                let stalled = match s.status {
                    SessionStatus::Executing => s.updated_at < execute_cutoff,
                    _ => s.updated_at < cutoff,
                };
                let retry_due = s.next_retry_at.map(|at| at <= now).unwrap_or(false);
                stalled || retry_due
            })
            .collect();
        hits.sort_by_key(|s| s.created_at);
        Ok(hits.into_iter().take(limit).map(|s| s.id).collect())
    }

    async fn completed_sessions_without_drafts(
        &self,
        limit: usize,
    ) -> Result<Vec<Uuid>, DatabaseError> {
        let tables = self.tables.lock().await;
        let mut hits: Vec<&Session> = tables
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Completed)
            .filter(|s| tables.drafts.get(&s.id).map(Vec::len).unwrap_or(0) == 0)
            .collect();
        hits.sort_by_key(|s| s.created_at);
        Ok(hits.into_iter().take(limit).map(|s| s.id).collect())
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn enqueue(
        &self,
        session_id: Uuid,
        phase_number: u32,
        kind: TaskKind,
        request: serde_json::Value,
    ) -> Result<Uuid, TaskError> {
        TaskRequest::validate(kind, &request)?;

        let task = Task {
            id: Uuid::new_v4(),
            session_id,
            phase_number,
            step_name: "execute".to_string(),
            kind,
            request,
            status: TaskStatus::Queued,
            retry_count: 0,
            response: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        let id = task.id;
        let mut tables = self.tables.lock().await;
        tables.tasks.insert(id, task);
        Ok(id)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let tables = self.tables.lock().await;
        Ok(tables.tasks.get(&id).cloned())
    }

    async fn claim_batch(&self, limit: usize, max_retry: u32) -> Result<Vec<Task>, DatabaseError> {
        let mut tables = self.tables.lock().await;
        let mut queued: Vec<(DateTime<Utc>, Uuid)> = tables
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Queued && t.retry_count < max_retry)
            .map(|t| (t.created_at, t.id))
            .collect();
        queued.sort();
        let eligible: Vec<Uuid> = queued.into_iter().take(limit).map(|(_, id)| id).collect();

        let now = Utc::now();
        let mut claimed = Vec::with_capacity(eligible.len());
        for id in eligible {
            if let Some(task) = tables.tasks.get_mut(&id) {
                task.status = TaskStatus::Processing;
                task.started_at = Some(now);
                claimed.push(task.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete_task(
        &self,
        id: Uuid,
        response: serde_json::Value,
    ) -> Result<(), DatabaseError> {
        let mut tables = self.tables.lock().await;
        let task = tables
            .tasks
            .get_mut(&id)
            .ok_or(DatabaseError::NotFound { entity: "task", id })?;
        if task.status == TaskStatus::Completed {
            tracing::debug!(task_id = %id, "Duplicate complete, ignoring");
            return Ok(());
        }
        task.status = TaskStatus::Completed;
        task.response = Some(response);
        task.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn fail_task(&self, id: Uuid, error: &str) -> Result<(), DatabaseError> {
        let mut tables = self.tables.lock().await;
        let task = tables
            .tasks
            .get_mut(&id)
            .ok_or(DatabaseError::NotFound { entity: "task", id })?;
        task.status = TaskStatus::Failed;
        task.error = Some(error.to_string());
        task.retry_count += 1;
        Ok(())
    }

    async fn requeue_task(&self, id: Uuid) -> Result<(), DatabaseError> {
        let mut tables = self.tables.lock().await;
        let task = tables
            .tasks
            .get_mut(&id)
            .ok_or(DatabaseError::NotFound { entity: "task", id })?;
        if task.status == TaskStatus::Failed {
            task.status = TaskStatus::Queued;
            task.started_at = None;
        }
        Ok(())
    }

    async fn tasks_for_step(
        &self,
        session_id: Uuid,
        phase_number: u32,
        step_name: &str,
    ) -> Result<Vec<Task>, DatabaseError> {
        let tables = self.tables.lock().await;
        let mut tasks: Vec<Task> = tables
            .tasks
            .values()
            .filter(|t| {
                t.session_id == session_id
                    && t.phase_number == phase_number
                    && t.step_name == step_name
            })
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.created_at, t.id));
        Ok(tasks)
    }

    async fn release_stale_claims(&self, older_than: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let mut tables = self.tables.lock().await;
        let mut released = 0;
        for task in tables.tasks.values_mut() {
            if task.status == TaskStatus::Processing
                && task.started_at.map(|at| at < older_than).unwrap_or(false)
            {
                task.status = TaskStatus::Queued;
                task.started_at = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn queue_stats(&self, window: Duration) -> Result<QueueStats, DatabaseError> {
        let since = Utc::now() - chrono::TimeDelta::seconds(window.as_secs() as i64);
        let tables = self.tables.lock().await;
        let mut stats = QueueStats::default();
        for task in tables.tasks.values().filter(|t| t.created_at > since) {
            match task.status {
                TaskStatus::Queued => stats.queued += 1,
                TaskStatus::Processing => stats.processing += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl DraftStore for MemoryStore {
    async fn insert_drafts(&self, drafts: &[Draft]) -> Result<bool, DatabaseError> {
        let Some(first) = drafts.first() else {
            return Ok(true);
        };
        let mut tables = self.tables.lock().await;
        let existing = tables.drafts.entry(first.session_id).or_default();
        // Uniqueness on (session_id, concept_number): any overlap means an
        // earlier materialization won.
        if drafts
            .iter()
            .any(|d| existing.iter().any(|e| e.concept_number == d.concept_number))
        {
            return Ok(false);
        }
        existing.extend(drafts.iter().cloned());
        existing.sort_by_key(|d| d.concept_number);
        Ok(true)
    }

    async fn list_drafts(&self, session_id: Uuid) -> Result<Vec<Draft>, DatabaseError> {
        let tables = self.tables.lock().await;
        Ok(tables.drafts.get(&session_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn search_request() -> serde_json::Value {
        json!({"kind": "search", "query": "test query"})
    }

    async fn seed_session(store: &MemoryStore) -> Uuid {
        let session = Session::new(crate::session::SessionConfig {
            theme: "test".to_string(),
            style: None,
            platform: "twitter".to_string(),
            model: None,
        });
        let id = session.id;
        store.create_session(&session).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_enqueue_rejects_bad_payload() {
        let store = MemoryStore::new();
        let session_id = seed_session(&store).await;
        let err = store
            .enqueue(session_id, 1, TaskKind::Search, json!({"kind": "search"}))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Validation { .. }));
        // Nothing persisted.
        assert!(store.tasks_for_step(session_id, 1, "execute").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_is_fifo_and_exclusive() {
        let store = MemoryStore::new();
        let session_id = seed_session(&store).await;
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(
                store
                    .enqueue(session_id, 1, TaskKind::Search, search_request())
                    .await
                    .unwrap(),
            );
        }

        let first = store.claim_batch(3, 3).await.unwrap();
        let second = store.claim_batch(3, 3).await.unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 2);

        let claimed: std::collections::HashSet<Uuid> = first
            .iter()
            .chain(second.iter())
            .map(|t| t.id)
            .collect();
        assert_eq!(claimed.len(), 5);

        // Third claim finds nothing.
        assert!(store.claim_batch(3, 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_skips_exhausted_retries() {
        let store = MemoryStore::new();
        let session_id = seed_session(&store).await;
        let id = store
            .enqueue(session_id, 1, TaskKind::Search, search_request())
            .await
            .unwrap();

        for _ in 0..3 {
            let claimed = store.claim_batch(1, 3).await.unwrap();
            assert_eq!(claimed.len(), 1);
            store.fail_task(id, "boom").await.unwrap();
            store.requeue_task(id).await.unwrap();
        }

        // retry_count == 3 now; no longer claimable.
        assert!(store.claim_batch(1, 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_complete_is_noop() {
        let store = MemoryStore::new();
        let session_id = seed_session(&store).await;
        let id = store
            .enqueue(session_id, 1, TaskKind::Search, search_request())
            .await
            .unwrap();
        store.claim_batch(1, 3).await.unwrap();
        store.complete_task(id, json!({"content": "a"})).await.unwrap();
        store.complete_task(id, json!({"content": "b"})).await.unwrap();

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.response, Some(json!({"content": "a"})));
    }

    #[tokio::test]
    async fn test_stale_claims_released_without_retry_penalty() {
        let store = MemoryStore::new();
        let session_id = seed_session(&store).await;
        let id = store
            .enqueue(session_id, 1, TaskKind::Search, search_request())
            .await
            .unwrap();
        store.claim_batch(1, 3).await.unwrap();
        store
            .backdate_task_start(id, Utc::now() - chrono::TimeDelta::minutes(30))
            .await;

        let released = store
            .release_stale_claims(Utc::now() - chrono::TimeDelta::minutes(10))
            .await
            .unwrap();
        assert_eq!(released, 1);

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.retry_count, 0);
    }

    #[tokio::test]
    async fn test_insert_drafts_conflict_detection() {
        let store = MemoryStore::new();
        let session_id = seed_session(&store).await;
        let draft = Draft {
            id: Uuid::new_v4(),
            session_id,
            concept_number: 1,
            title: "t".to_string(),
            hook: None,
            angle: None,
            format: None,
            content: None,
            visual_guide: None,
            timing: None,
            hashtags: vec![],
            status: crate::drafts::DraftStatus::Draft,
            viral_score: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(store.insert_drafts(&[draft.clone()]).await.unwrap());
        assert!(!store.insert_drafts(&[draft]).await.unwrap());
        assert_eq!(store.list_drafts(session_id).await.unwrap().len(), 1);
    }
}
