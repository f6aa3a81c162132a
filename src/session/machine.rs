//! The session state machine.
//!
//! `advance` is the single entry point for making progress on a session. It
//! is re-entrant and idempotent: every step checks for an already-persisted
//! result before running, so workers, the recovery sweep, and operators can
//! all call it concurrently or repeatedly without double-running a step.
//! Each step's result commits before the cursor moves past it.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::SessionPolicy;
use crate::drafts::{DraftMaterializer, MaterializeOutcome};
use crate::error::{SessionError, StrategyError};
use crate::phase::{ExecuteDisposition, PhaseContext, StrategySet};
use crate::session::{retry_backoff, Phase, PhaseStatus, Session, SessionConfig, SessionStatus, Step};
use crate::store::{DraftStore, SessionStore, TaskStore};
use uuid::Uuid;

pub struct SessionEngine<S> {
    store: Arc<S>,
    strategies: Arc<StrategySet>,
    materializer: DraftMaterializer<S>,
    policy: SessionPolicy,
    /// Mirrors the worker's retry bound so "settled" means the same thing on
    /// both sides of the queue.
    max_task_retries: u32,
}

impl<S> SessionEngine<S>
where
    S: SessionStore + TaskStore + DraftStore + 'static,
{
    pub fn new(
        store: Arc<S>,
        strategies: Arc<StrategySet>,
        policy: SessionPolicy,
        max_task_retries: u32,
    ) -> Self {
        let materializer = DraftMaterializer::new(
            store.clone(),
            strategies.concepts_phase(),
            strategies.content_phase(),
        );
        Self {
            store,
            strategies,
            materializer,
            policy,
            max_task_retries,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn strategies(&self) -> &Arc<StrategySet> {
        &self.strategies
    }

    /// Create a new Pending session at phase 1.
    pub async fn create(&self, config: SessionConfig) -> Result<Session, SessionError> {
        let session = Session::new(config);
        self.store.create_session(&session).await?;
        info!(session_id = %session.id, theme = %session.config.theme, "session created");
        Ok(session)
    }

    /// Drive the session as far as it can go without waiting on queued
    /// tasks. Returns with the session Executing when tasks are outstanding,
    /// or in a terminal state when the pipeline finishes or fails.
    pub async fn advance(&self, session_id: Uuid) -> Result<Session, SessionError> {
        let mut session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or(SessionError::NotFound(session_id))?;

        if session.status.is_terminal() {
            debug!(session_id = %session_id, status = %session.status, "advance on terminal session is a no-op");
            return Ok(session);
        }
        if session.status == SessionStatus::Paused {
            debug!(session_id = %session_id, "session is paused; not advancing");
            return Ok(session);
        }
        if let Some(at) = session.next_retry_at {
            if at > Utc::now() {
                debug!(session_id = %session_id, retry_at = %at, "inside retry backoff window; not advancing");
                return Ok(session);
            }
        }

        loop {
            let phase_number = session.current_phase;
            let strategy = self
                .strategies
                .get(phase_number)
                .ok_or(SessionError::UnknownPhase(phase_number))?
                .clone();
            let mut phase = self
                .store
                .get_or_create_phase(session_id, phase_number)
                .await?;
            let ctx = self.build_context(&session, phase_number).await?;

            match session.current_step {
                Step::Think => {
                    if phase.think_result.is_none() {
                        session.status = SessionStatus::Thinking;
                        self.store.update_session(&session).await?;

                        let started = Instant::now();
                        let output = match strategy.think(&ctx).await {
                            Ok(output) => output,
                            Err(e) => return self.record_failure(session, phase, e).await,
                        };
                        phase.think_result = Some(output.value);
                        phase.think_tokens = Some(output.tokens);
                        phase.think_at = Some(Utc::now());
                        phase.status = PhaseStatus::Thinking;
                        self.store.update_phase(&phase).await?;

                        session.total_tokens += output.tokens;
                        session.total_duration_ms += started.elapsed().as_millis() as i64;
                        debug!(session_id = %session_id, phase = phase_number, "think committed");
                    }
                    self.step_done(&mut session, Step::Execute).await?;
                }
                Step::Execute => {
                    if phase.execute_result.is_some() {
                        self.step_done(&mut session, Step::Integrate).await?;
                        continue;
                    }
                    // A crash can leave the cursor on EXECUTE with no plan
                    // persisted; fall back one step rather than run blind.
                    let Some(think) = phase.think_result.clone() else {
                        warn!(session_id = %session_id, phase = phase_number, "execute reached without a think result; rewinding");
                        session.current_step = Step::Think;
                        self.store.update_session(&session).await?;
                        continue;
                    };

                    let tasks = self
                        .store
                        .tasks_for_step(session_id, phase_number, Step::Execute.as_str())
                        .await?;
                    let started = Instant::now();
                    if !tasks.is_empty() {
                        // Previously enqueued; either everything has settled
                        // and we can assemble, or we keep waiting.
                        if tasks.iter().any(|t| !t.is_settled(self.max_task_retries)) {
                            if session.status != SessionStatus::Executing {
                                session.status = SessionStatus::Executing;
                                self.store.update_session(&session).await?;
                            }
                            debug!(session_id = %session_id, phase = phase_number, "tasks outstanding; session suspended");
                            return Ok(session);
                        }
                        let assembled = match strategy.assemble(&ctx, &tasks) {
                            Ok(value) => value,
                            Err(e) => return self.record_failure(session, phase, e).await,
                        };
                        self.commit_execute(&mut session, &mut phase, assembled, started)
                            .await?;
                    } else {
                        match strategy.execute(&ctx, &think).await {
                            Ok(ExecuteDisposition::Completed(output)) => {
                                session.total_tokens += output.tokens;
                                self.commit_execute(&mut session, &mut phase, output.value, started)
                                    .await?;
                            }
                            Ok(ExecuteDisposition::Enqueued(specs)) => {
                                // An empty fan-out would leave the session
                                // Executing with nothing that can ever settle.
                                if specs.is_empty() {
                                    let e = StrategyError::MalformedOutput(
                                        "execute produced an empty task list".to_string(),
                                    );
                                    return self.record_failure(session, phase, e).await;
                                }
                                let count = specs.len();
                                for spec in specs {
                                    self.store
                                        .enqueue(session_id, phase_number, spec.kind, spec.request)
                                        .await
                                        .map_err(SessionError::Task)?;
                                }
                                phase.status = PhaseStatus::Executing;
                                self.store.update_phase(&phase).await?;
                                session.status = SessionStatus::Executing;
                                self.store.update_session(&session).await?;
                                info!(session_id = %session_id, phase = phase_number, tasks = count, "execute suspended on queued tasks");
                                return Ok(session);
                            }
                            Err(e) => return self.record_failure(session, phase, e).await,
                        }
                    }
                    self.step_done(&mut session, Step::Integrate).await?;
                }
                Step::Integrate => {
                    if phase.integrate_result.is_none() {
                        session.status = SessionStatus::Integrating;
                        self.store.update_session(&session).await?;

                        let think = phase.think_result.clone().unwrap_or(Value::Null);
                        let execute = phase.execute_result.clone().unwrap_or(Value::Null);
                        let started = Instant::now();
                        let output = match strategy.integrate(&ctx, &think, &execute).await {
                            Ok(output) => output,
                            Err(e) => return self.record_failure(session, phase, e).await,
                        };
                        phase.integrate_result = Some(output.value);
                        phase.integrate_tokens = Some(output.tokens);
                        phase.integrate_at = Some(Utc::now());
                        phase.status = PhaseStatus::Completed;
                        self.store.update_phase(&phase).await?;

                        session.total_tokens += output.tokens;
                        session.total_duration_ms += started.elapsed().as_millis() as i64;
                        info!(session_id = %session_id, phase = phase_number, strategy = strategy.name(), "phase completed");
                    } else if phase.status != PhaseStatus::Completed {
                        phase.status = PhaseStatus::Completed;
                        self.store.update_phase(&phase).await?;
                    }

                    session.retry_count = 0;
                    session.last_error = None;
                    session.next_retry_at = None;

                    if self.strategies.is_last_phase(phase_number) {
                        session.status = SessionStatus::Completed;
                        session.completed_at = Some(Utc::now());
                        self.store.update_session(&session).await?;
                        info!(session_id = %session_id, tokens = session.total_tokens, "session completed");

                        match self.materializer.materialize(session_id).await? {
                            MaterializeOutcome::Created(n) => {
                                info!(session_id = %session_id, drafts = n, "drafts materialized")
                            }
                            MaterializeOutcome::AlreadyMaterialized => {
                                debug!(session_id = %session_id, "drafts already materialized")
                            }
                            MaterializeOutcome::Empty => {
                                warn!(session_id = %session_id, "session completed with no draftable output")
                            }
                        }
                        return Ok(session);
                    }

                    session.current_phase += 1;
                    session.current_step = Step::Think;
                    session.status = SessionStatus::Pending;
                    self.store.update_session(&session).await?;
                }
            }
        }
    }

    /// Re-run draft materialization for a completed session. Used by the
    /// recovery sweep for sessions that finished but crashed before writing
    /// drafts.
    pub async fn materialize_drafts(
        &self,
        session_id: Uuid,
    ) -> Result<MaterializeOutcome, SessionError> {
        self.materializer.materialize(session_id).await
    }

    async fn commit_execute(
        &self,
        session: &mut Session,
        phase: &mut Phase,
        value: Value,
        started: Instant,
    ) -> Result<(), SessionError> {
        let elapsed = started.elapsed().as_millis() as i64;
        phase.execute_result = Some(value);
        phase.execute_duration_ms = Some(elapsed);
        phase.execute_at = Some(Utc::now());
        phase.status = PhaseStatus::Integrating;
        self.store.update_phase(phase).await?;
        session.total_duration_ms += elapsed;
        debug!(session_id = %session.id, phase = phase.phase_number, "execute committed");
        Ok(())
    }

    /// Advance the cursor past a committed step and clear retry bookkeeping.
    async fn step_done(&self, session: &mut Session, next: Step) -> Result<(), SessionError> {
        session.current_step = next;
        session.status = SessionStatus::Pending;
        session.retry_count = 0;
        session.last_error = None;
        session.next_retry_at = None;
        self.store.update_session(session).await?;
        Ok(())
    }

    /// Record a strategy failure against the session's retry budget. Under
    /// budget the session returns to Pending with a backoff deadline; at
    /// budget it goes Failed for good.
    async fn record_failure(
        &self,
        mut session: Session,
        mut phase: Phase,
        error: StrategyError,
    ) -> Result<Session, SessionError> {
        session.retry_count += 1;
        session.last_error = Some(error.to_string());

        if session.retry_count >= self.policy.max_retries {
            session.status = SessionStatus::Failed;
            session.next_retry_at = None;
            phase.status = PhaseStatus::Failed;
            self.store.update_phase(&phase).await?;
            warn!(
                session_id = %session.id,
                phase = phase.phase_number,
                step = %session.current_step,
                error = %error,
                "retry budget exhausted; session failed"
            );
        } else {
            let delay = retry_backoff(self.policy.retry_base_delay, session.retry_count - 1);
            session.status = SessionStatus::Pending;
            session.next_retry_at = Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
            warn!(
                session_id = %session.id,
                phase = phase.phase_number,
                step = %session.current_step,
                attempt = session.retry_count,
                retry_in_secs = delay.as_secs(),
                error = %error,
                "step failed; will retry"
            );
        }
        self.store.update_session(&session).await?;
        Err(SessionError::Strategy(error))
    }

    /// Context for a phase: the session config plus every earlier phase's
    /// integrate result. Think and execute intermediates stay private to
    /// their own phase.
    async fn build_context(
        &self,
        session: &Session,
        phase_number: u32,
    ) -> Result<PhaseContext, SessionError> {
        let phases = self.store.list_phases(session.id).await?;
        let prior_results = phases
            .into_iter()
            .filter(|p| p.phase_number < phase_number)
            .filter_map(|p| p.integrate_result.map(|r| (p.phase_number, r)))
            .collect();
        Ok(PhaseContext {
            session_id: session.id,
            phase_number,
            config: session.config.clone(),
            prior_results,
        })
    }
}
