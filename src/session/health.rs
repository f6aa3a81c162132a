//! Session health inspection and operator controls.
//!
//! `health` answers "why is this session not moving" without mutating
//! anything. The operator verbs (`pause`, `resume`, `retry`) are the only
//! sanctioned ways to move a session across the Paused and Failed edges.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::config::RecoveryConfig;
use crate::error::SessionError;
use crate::session::machine::SessionEngine;
use crate::session::{SessionStatus, Step};
use crate::store::{DraftStore, SessionStore, TaskStore};

/// Point-in-time diagnosis of one session.
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub current_phase: u32,
    pub current_step: Step,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub stalled_for_secs: Option<i64>,
    pub healthy: bool,
    pub issues: Vec<String>,
}

impl<S> SessionEngine<S>
where
    S: SessionStore + TaskStore + DraftStore + 'static,
{
    pub async fn health(
        &self,
        session_id: Uuid,
        recovery: &RecoveryConfig,
    ) -> Result<HealthReport, SessionError> {
        let session = self
            .store()
            .get_session(session_id)
            .await?
            .ok_or(SessionError::NotFound(session_id))?;

        let mut issues = Vec::new();
        let now = Utc::now();

        let stall_budget = if session.status == SessionStatus::Executing {
            recovery.execute_stall_timeout
        } else {
            recovery.stall_timeout
        };
        let idle = (now - session.updated_at).num_seconds().max(0);
        let stalled_for_secs = if !session.status.is_terminal()
            && session.status != SessionStatus::Paused
            && idle as u64 > stall_budget.as_secs()
        {
            issues.push(format!(
                "no progress for {idle}s while {}",
                session.status
            ));
            Some(idle)
        } else {
            None
        };

        if session.status == SessionStatus::Failed {
            issues.push(format!(
                "failed after {} attempts: {}",
                session.retry_count,
                session.last_error.as_deref().unwrap_or("unknown error")
            ));
        } else if session.retry_count > 0 {
            issues.push(format!(
                "step has failed {} time(s): {}",
                session.retry_count,
                session.last_error.as_deref().unwrap_or("unknown error")
            ));
        }

        // Cursor consistency: the step before the cursor must have a result.
        if !session.status.is_terminal() {
            if let Some(phase) = self
                .store()
                .list_phases(session_id)
                .await?
                .into_iter()
                .find(|p| p.phase_number == session.current_phase)
            {
                match session.current_step {
                    Step::Think => {}
                    Step::Execute => {
                        if phase.think_result.is_none() {
                            issues.push("cursor is on execute without a think result".to_string());
                        }
                    }
                    Step::Integrate => {
                        if phase.execute_result.is_none() {
                            issues
                                .push("cursor is on integrate without an execute result".to_string());
                        }
                    }
                }
            }
        }

        if session.status == SessionStatus::Executing {
            let tasks = self
                .store()
                .tasks_for_step(session_id, session.current_phase, Step::Execute.as_str())
                .await?;
            let dead = tasks
                .iter()
                .filter(|t| t.status == crate::task::TaskStatus::Failed)
                .count();
            if tasks.is_empty() {
                issues.push("executing with no tasks enqueued".to_string());
            }
            if dead > 0 {
                issues.push(format!("{dead} of {} tasks have failed", tasks.len()));
            }
        }

        Ok(HealthReport {
            session_id,
            status: session.status,
            current_phase: session.current_phase,
            current_step: session.current_step,
            retry_count: session.retry_count,
            last_error: session.last_error,
            next_retry_at: session.next_retry_at,
            stalled_for_secs,
            healthy: issues.is_empty(),
            issues,
        })
    }

    /// Put a running session on hold. Completed and Failed sessions cannot be
    /// paused.
    pub async fn pause(&self, session_id: Uuid) -> Result<(), SessionError> {
        let mut session = self
            .store()
            .get_session(session_id)
            .await?
            .ok_or(SessionError::NotFound(session_id))?;
        if session.status.is_terminal() {
            return Err(SessionError::InvalidTransition {
                from: session.status,
                verb: "pause",
            });
        }
        if session.status == SessionStatus::Paused {
            return Ok(());
        }
        session.status = SessionStatus::Paused;
        self.store().update_session(&session).await?;
        info!(session_id = %session_id, "session paused");
        Ok(())
    }

    /// Release a Paused session back to Pending. The caller (or the next
    /// sweep) advances it.
    pub async fn resume(&self, session_id: Uuid) -> Result<(), SessionError> {
        let mut session = self
            .store()
            .get_session(session_id)
            .await?
            .ok_or(SessionError::NotFound(session_id))?;
        if session.status != SessionStatus::Paused {
            return Err(SessionError::InvalidTransition {
                from: session.status,
                verb: "resume",
            });
        }
        session.status = SessionStatus::Pending;
        session.next_retry_at = None;
        self.store().update_session(&session).await?;
        info!(session_id = %session_id, "session resumed");
        Ok(())
    }

    /// Give a Failed (or Paused) session a fresh retry budget and re-arm it
    /// at its current phase and step. Completed work is never redone; the
    /// first `advance` skips every step with a persisted result.
    pub async fn retry(&self, session_id: Uuid) -> Result<(), SessionError> {
        let mut session = self
            .store()
            .get_session(session_id)
            .await?
            .ok_or(SessionError::NotFound(session_id))?;
        if !matches!(
            session.status,
            SessionStatus::Failed | SessionStatus::Paused
        ) {
            return Err(SessionError::InvalidTransition {
                from: session.status,
                verb: "retry",
            });
        }
        session.status = SessionStatus::Pending;
        session.retry_count = 0;
        session.next_retry_at = None;
        self.store().update_session(&session).await?;
        info!(session_id = %session_id, phase = session.current_phase, step = %session.current_step, "failed session re-armed");
        Ok(())
    }
}
