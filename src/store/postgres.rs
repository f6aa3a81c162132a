//! PostgreSQL store.
//!
//! Claim safety lives here: `claim_batch` selects with
//! `FOR UPDATE SKIP LOCKED` and flips rows to Processing in the same
//! statement, so concurrent claimers neither block nor double-claim. Draft
//! inserts run in one transaction and read a unique-constraint violation as
//! "already materialized".

use std::ops::DerefMut;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, Pool, Runtime};
use tokio_postgres::error::SqlState;
use tokio_postgres::{NoTls, Row};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::drafts::{Draft, DraftStatus};
use crate::error::{DatabaseError, TaskError};
use crate::session::{Phase, Session, SessionConfig, SessionStatus, Step};
use crate::store::{DraftStore, SessionStore, TaskStore};
use crate::task::{QueueStats, Task, TaskKind, TaskRequest};

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// Postgres-backed store shared by the API, workers, and the scanner.
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    /// Create a store and verify connectivity.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let mut cfg = Config::new();
        cfg.url = Some(config.url.clone());
        cfg.pool = Some(deadpool_postgres::PoolConfig {
            max_size: config.pool_size,
            ..Default::default()
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| DatabaseError::Pool(e.to_string()))?;

        // Test connection
        let _ = pool.get().await?;

        Ok(Self { pool })
    }

    /// Apply embedded migrations.
    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let mut conn = self.pool.get().await?;
        let client = conn.deref_mut().deref_mut();
        let report = embedded::migrations::runner()
            .run_async(client)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        for migration in report.applied_migrations() {
            tracing::info!("Applied migration {}", migration);
        }
        Ok(())
    }

    async fn conn(&self) -> Result<deadpool_postgres::Object, DatabaseError> {
        Ok(self.pool.get().await?)
    }
}

fn parse<T>(value: &str, what: &str) -> Result<T, DatabaseError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| DatabaseError::InvalidValue(format!("{what}: {e}")))
}

fn row_to_session(row: &Row) -> Result<Session, DatabaseError> {
    let status: String = row.get("status");
    let step: String = row.get("current_step");
    let config: SessionConfig = serde_json::from_value(row.get("config"))?;
    Ok(Session {
        id: row.get("id"),
        config,
        status: parse::<SessionStatus>(&status, "session status")?,
        current_phase: row.get::<_, i32>("current_phase") as u32,
        current_step: parse::<Step>(&step, "session step")?,
        retry_count: row.get::<_, i32>("retry_count") as u32,
        last_error: row.get("last_error"),
        next_retry_at: row.get("next_retry_at"),
        total_tokens: row.get("total_tokens"),
        total_duration_ms: row.get("total_duration_ms"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        completed_at: row.get("completed_at"),
    })
}

fn row_to_phase(row: &Row) -> Result<Phase, DatabaseError> {
    let status: String = row.get("status");
    Ok(Phase {
        id: row.get("id"),
        session_id: row.get("session_id"),
        phase_number: row.get::<_, i32>("phase_number") as u32,
        status: parse(&status, "phase status")?,
        think_result: row.get("think_result"),
        think_tokens: row.get("think_tokens"),
        think_at: row.get("think_at"),
        execute_result: row.get("execute_result"),
        execute_duration_ms: row.get("execute_duration_ms"),
        execute_at: row.get("execute_at"),
        integrate_result: row.get("integrate_result"),
        integrate_tokens: row.get("integrate_tokens"),
        integrate_at: row.get("integrate_at"),
    })
}

fn row_to_task(row: &Row) -> Result<Task, DatabaseError> {
    let status: String = row.get("status");
    let kind: String = row.get("kind");
    Ok(Task {
        id: row.get("id"),
        session_id: row.get("session_id"),
        phase_number: row.get::<_, i32>("phase_number") as u32,
        step_name: row.get("step_name"),
        kind: parse(&kind, "task kind")?,
        request: row.get("request"),
        status: parse(&status, "task status")?,
        retry_count: row.get::<_, i32>("retry_count") as u32,
        response: row.get("response"),
        error: row.get("error"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    })
}

fn row_to_draft(row: &Row) -> Result<Draft, DatabaseError> {
    let status: String = row.get("status");
    Ok(Draft {
        id: row.get("id"),
        session_id: row.get("session_id"),
        concept_number: row.get::<_, i32>("concept_number") as u32,
        title: row.get("title"),
        hook: row.get("hook"),
        angle: row.get("angle"),
        format: row.get("format"),
        content: row.get("content"),
        visual_guide: row.get("visual_guide"),
        timing: row.get("timing"),
        hashtags: row.get("hashtags"),
        status: parse::<DraftStatus>(&status, "draft status")?,
        viral_score: row.get("viral_score"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

const SESSION_COLUMNS: &str = "id, config, status, current_phase, current_step, retry_count, \
     last_error, next_retry_at, total_tokens, total_duration_ms, created_at, updated_at, \
     completed_at";

const PHASE_COLUMNS: &str = "id, session_id, phase_number, status, think_result, think_tokens, \
     think_at, execute_result, execute_duration_ms, execute_at, integrate_result, \
     integrate_tokens, integrate_at";

const TASK_COLUMNS: &str = "id, session_id, phase_number, step_name, kind, request, status, \
     retry_count, response, error, created_at, started_at, completed_at";

#[async_trait]
impl SessionStore for PgStore {
    async fn create_session(&self, session: &Session) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO sessions (id, config, status, current_phase, current_step, \
             retry_count, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            &[
                &session.id,
                &serde_json::to_value(&session.config)?,
                &session.status.as_str(),
                &(session.current_phase as i32),
                &session.current_step.as_str(),
                &(session.retry_count as i32),
                &session.created_at,
                &session.updated_at,
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<Session>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1"),
                &[&id],
            )
            .await?;
        row.as_ref().map(row_to_session).transpose()
    }

    async fn update_session(&self, session: &Session) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .execute(
                "UPDATE sessions SET config = $2, status = $3, current_phase = $4, \
                 current_step = $5, retry_count = $6, last_error = $7, next_retry_at = $8, \
                 total_tokens = $9, total_duration_ms = $10, completed_at = $11, \
                 updated_at = NOW() \
                 WHERE id = $1",
                &[
                    &session.id,
                    &serde_json::to_value(&session.config)?,
                    &session.status.as_str(),
                    &(session.current_phase as i32),
                    &session.current_step.as_str(),
                    &(session.retry_count as i32),
                    &session.last_error,
                    &session.next_retry_at,
                    &session.total_tokens,
                    &session.total_duration_ms,
                    &session.completed_at,
                ],
            )
            .await?;
        if rows == 0 {
            return Err(DatabaseError::NotFound {
                entity: "session",
                id: session.id,
            });
        }
        Ok(())
    }

    async fn get_or_create_phase(
        &self,
        session_id: Uuid,
        phase_number: u32,
    ) -> Result<Phase, DatabaseError> {
        let conn = self.conn().await?;
        // Insertion races resolve through the unique constraint; the select
        // below returns whichever row won.
        conn.execute(
            "INSERT INTO phases (id, session_id, phase_number, status) \
             VALUES ($1, $2, $3, 'pending') \
             ON CONFLICT (session_id, phase_number) DO NOTHING",
            &[&Uuid::new_v4(), &session_id, &(phase_number as i32)],
        )
        .await?;
        let row = conn
            .query_one(
                &format!(
                    "SELECT {PHASE_COLUMNS} FROM phases \
                     WHERE session_id = $1 AND phase_number = $2"
                ),
                &[&session_id, &(phase_number as i32)],
            )
            .await?;
        row_to_phase(&row)
    }

    async fn update_phase(&self, phase: &Phase) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE phases SET status = $2, think_result = $3, think_tokens = $4, \
             think_at = $5, execute_result = $6, execute_duration_ms = $7, execute_at = $8, \
             integrate_result = $9, integrate_tokens = $10, integrate_at = $11 \
             WHERE id = $1",
            &[
                &phase.id,
                &phase.status.as_str(),
                &phase.think_result,
                &phase.think_tokens,
                &phase.think_at,
                &phase.execute_result,
                &phase.execute_duration_ms,
                &phase.execute_at,
                &phase.integrate_result,
                &phase.integrate_tokens,
                &phase.integrate_at,
            ],
        )
        .await?;
        Ok(())
    }

    async fn list_phases(&self, session_id: Uuid) -> Result<Vec<Phase>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {PHASE_COLUMNS} FROM phases \
                     WHERE session_id = $1 ORDER BY phase_number ASC"
                ),
                &[&session_id],
            )
            .await?;
        rows.iter().map(row_to_phase).collect()
    }

    async fn sessions_needing_attention(
        &self,
        cutoff: DateTime<Utc>,
        execute_cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Uuid>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT id FROM sessions \
                 WHERE status NOT IN ('completed', 'failed', 'paused') \
                 AND ( \
                     (status = 'executing' AND updated_at < $2) \
                     OR (status <> 'executing' AND updated_at < $1) \
                     OR (next_retry_at IS NOT NULL AND next_retry_at <= NOW()) \
                 ) \
                 ORDER BY created_at ASC \
                 LIMIT $3",
                &[&cutoff, &execute_cutoff, &(limit as i64)],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    async fn completed_sessions_without_drafts(
        &self,
        limit: usize,
    ) -> Result<Vec<Uuid>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT s.id FROM sessions s \
                 LEFT JOIN drafts d ON d.session_id = s.id \
                 WHERE s.status = 'completed' \
                 GROUP BY s.id, s.created_at \
                 HAVING COUNT(d.id) = 0 \
                 ORDER BY s.created_at ASC \
                 LIMIT $1",
                &[&(limit as i64)],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }
}

#[async_trait]
impl TaskStore for PgStore {
    async fn enqueue(
        &self,
        session_id: Uuid,
        phase_number: u32,
        kind: TaskKind,
        request: serde_json::Value,
    ) -> Result<Uuid, TaskError> {
        TaskRequest::validate(kind, &request)?;

        let conn = self.conn().await.map_err(DatabaseError::from)?;
        let id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO tasks (id, session_id, phase_number, step_name, kind, request, status) \
             VALUES ($1, $2, $3, 'execute', $4, $5, 'queued')",
            &[
                &id,
                &session_id,
                &(phase_number as i32),
                &kind.as_str(),
                &request,
            ],
        )
        .await
        .map_err(DatabaseError::from)?;
        Ok(id)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"),
                &[&id],
            )
            .await?;
        row.as_ref().map(row_to_task).transpose()
    }

    async fn claim_batch(&self, limit: usize, max_retry: u32) -> Result<Vec<Task>, DatabaseError> {
        let conn = self.conn().await?;
        // Select and transition in one statement; SKIP LOCKED makes
        // concurrent claimers pass over each other's rows instead of
        // blocking or double-claiming.
        let rows = conn
            .query(
                &format!(
                    "UPDATE tasks SET status = 'processing', started_at = NOW() \
                     WHERE id IN ( \
                         SELECT id FROM tasks \
                         WHERE status = 'queued' AND retry_count < $2 \
                         ORDER BY created_at ASC \
                         LIMIT $1 \
                         FOR UPDATE SKIP LOCKED \
                     ) \
                     RETURNING {TASK_COLUMNS}"
                ),
                &[&(limit as i64), &(max_retry as i32)],
            )
            .await?;
        rows.iter().map(row_to_task).collect()
    }

    async fn complete_task(
        &self,
        id: Uuid,
        response: serde_json::Value,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .execute(
                "UPDATE tasks SET status = 'completed', response = $2, completed_at = NOW() \
                 WHERE id = $1 AND status <> 'completed'",
                &[&id, &response],
            )
            .await?;
        if rows == 0 {
            tracing::debug!(task_id = %id, "Duplicate complete, ignoring");
        }
        Ok(())
    }

    async fn fail_task(&self, id: Uuid, error: &str) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE tasks SET status = 'failed', error = $2, retry_count = retry_count + 1 \
             WHERE id = $1",
            &[&id, &error],
        )
        .await?;
        Ok(())
    }

    async fn requeue_task(&self, id: Uuid) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE tasks SET status = 'queued', started_at = NULL \
             WHERE id = $1 AND status = 'failed'",
            &[&id],
        )
        .await?;
        Ok(())
    }

    async fn tasks_for_step(
        &self,
        session_id: Uuid,
        phase_number: u32,
        step_name: &str,
    ) -> Result<Vec<Task>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE session_id = $1 AND phase_number = $2 AND step_name = $3 \
                     ORDER BY created_at ASC, id ASC"
                ),
                &[&session_id, &(phase_number as i32), &step_name],
            )
            .await?;
        rows.iter().map(row_to_task).collect()
    }

    async fn release_stale_claims(&self, older_than: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let conn = self.conn().await?;
        let released = conn
            .execute(
                "UPDATE tasks SET status = 'queued', started_at = NULL \
                 WHERE status = 'processing' AND started_at < $1",
                &[&older_than],
            )
            .await?;
        Ok(released)
    }

    async fn queue_stats(&self, window: Duration) -> Result<QueueStats, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "SELECT \
                     COUNT(*) FILTER (WHERE status = 'queued') AS queued, \
                     COUNT(*) FILTER (WHERE status = 'processing') AS processing, \
                     COUNT(*) FILTER (WHERE status = 'completed') AS completed, \
                     COUNT(*) FILTER (WHERE status = 'failed') AS failed \
                 FROM tasks \
                 WHERE created_at > NOW() - make_interval(secs => $1)",
                &[&(window.as_secs() as f64)],
            )
            .await?;
        Ok(QueueStats {
            queued: row.get("queued"),
            processing: row.get("processing"),
            completed: row.get("completed"),
            failed: row.get("failed"),
        })
    }
}

#[async_trait]
impl DraftStore for PgStore {
    async fn insert_drafts(&self, drafts: &[Draft]) -> Result<bool, DatabaseError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;
        for draft in drafts {
            let result = tx
                .execute(
                    "INSERT INTO drafts (id, session_id, concept_number, title, hook, angle, \
                     format, content, visual_guide, timing, hashtags, status, viral_score) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
                    &[
                        &draft.id,
                        &draft.session_id,
                        &(draft.concept_number as i32),
                        &draft.title,
                        &draft.hook,
                        &draft.angle,
                        &draft.format,
                        &draft.content,
                        &draft.visual_guide,
                        &draft.timing,
                        &draft.hashtags,
                        &draft.status.as_str(),
                        &draft.viral_score,
                    ],
                )
                .await;
            if let Err(e) = result {
                if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
                    // Concurrent or repeated materialization; the first
                    // writer's rows stand.
                    tx.rollback().await?;
                    return Ok(false);
                }
                return Err(e.into());
            }
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn list_drafts(&self, session_id: Uuid) -> Result<Vec<Draft>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT id, session_id, concept_number, title, hook, angle, format, content, \
                 visual_guide, timing, hashtags, status, viral_score, created_at, updated_at \
                 FROM drafts WHERE session_id = $1 ORDER BY concept_number ASC",
                &[&session_id],
            )
            .await?;
        rows.iter().map(row_to_draft).collect()
    }
}
