//! The queue worker.
//!
//! Polls the task table, claims batches, runs executors with bounded
//! concurrency, and nudges the owning session forward after every settled
//! task. Multiple workers can run against the same database; the claim
//! query guarantees no task is handed out twice.

pub mod executors;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::TaskError;
use crate::session::machine::SessionEngine;
use crate::store::{DraftStore, SessionStore, TaskStore};
use crate::task::{Task, TaskKind};

pub use executors::{ChatCompletionExecutor, SearchExecutor, TaskExecutor};

pub struct Worker<S> {
    store: Arc<S>,
    engine: Arc<SessionEngine<S>>,
    executors: HashMap<TaskKind, Arc<dyn TaskExecutor>>,
    config: WorkerConfig,
}

impl<S> Worker<S>
where
    S: SessionStore + TaskStore + DraftStore + 'static,
{
    pub fn new(store: Arc<S>, engine: Arc<SessionEngine<S>>, config: WorkerConfig) -> Self {
        Self {
            store,
            engine,
            executors: HashMap::new(),
            config,
        }
    }

    pub fn register(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executors.insert(executor.kind(), executor);
        self
    }

    /// Poll-and-drain loop. Runs until the future is dropped.
    pub async fn run(&self) {
        info!(
            batch_size = self.config.batch_size,
            concurrency = self.config.concurrency,
            poll_secs = self.config.poll_interval.as_secs(),
            "worker started"
        );
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let stats_every = if self.config.stats_interval.is_zero() {
            // Effectively never.
            Duration::from_secs(u64::MAX / 4)
        } else {
            self.config.stats_interval
        };
        let mut stats = tokio::time::interval(stats_every);
        stats.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        stats.tick().await; // immediate first tick

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    // Drain until the queue is empty, then go back to idling.
                    loop {
                        match self.drain_once().await {
                            Ok(0) => break,
                            Ok(n) => debug!(processed = n, "batch drained"),
                            Err(e) => {
                                error!(error = %e, "claim failed; backing off to next poll");
                                break;
                            }
                        }
                    }
                }
                _ = stats.tick() => {
                    self.log_stats().await;
                }
            }
        }
    }

    /// Claim one batch and process it to completion. Returns how many tasks
    /// were claimed.
    pub async fn drain_once(&self) -> Result<usize, TaskError> {
        let batch = self
            .store
            .claim_batch(self.config.batch_size, self.config.max_task_retries)
            .await?;
        if batch.is_empty() {
            return Ok(0);
        }
        let count = batch.len();
        debug!(count, "claimed batch");

        let touched: Vec<Uuid> = stream::iter(batch)
            .map(|task| self.process(task))
            .buffer_unordered(self.config.concurrency)
            .filter_map(|session_id| async move { session_id })
            .collect()
            .await;

        // One callback per session, after the whole batch settles, so a
        // phase with several tasks is not advanced once per task.
        let mut seen = Vec::new();
        for session_id in touched {
            if seen.contains(&session_id) {
                continue;
            }
            seen.push(session_id);
            self.advance_session(session_id).await;
        }
        Ok(count)
    }

    /// Run one claimed task. Returns the session id when the task settled
    /// (completed, or failed past its retry bound) and the session should be
    /// advanced.
    async fn process(&self, task: Task) -> Option<Uuid> {
        let task_id = task.id;
        let session_id = task.session_id;
        let kind = task.kind;

        let outcome = match self.execute(&task).await {
            Ok(response) => {
                if let Err(e) = self.store.complete_task(task_id, response).await {
                    error!(task_id = %task_id, error = %e, "failed to persist task completion");
                    return None;
                }
                debug!(task_id = %task_id, %kind, "task completed");
                true
            }
            Err(e) => {
                warn!(task_id = %task_id, %kind, attempt = task.retry_count + 1, error = %e, "task failed");
                if let Err(e) = self.store.fail_task(task_id, &e.to_string()).await {
                    error!(task_id = %task_id, error = %e, "failed to persist task failure");
                    return None;
                }
                // fail_task bumped retry_count; requeue while attempts remain.
                if task.retry_count + 1 < self.config.max_task_retries {
                    if let Err(e) = self.store.requeue_task(task_id).await {
                        error!(task_id = %task_id, error = %e, "failed to requeue task");
                    }
                    return None;
                }
                warn!(task_id = %task_id, %kind, "task retries exhausted");
                true
            }
        };
        outcome.then_some(session_id)
    }

    async fn execute(&self, task: &Task) -> Result<serde_json::Value, TaskError> {
        let executor = self
            .executors
            .get(&task.kind)
            .ok_or_else(|| TaskError::UnknownKind(task.kind.to_string()))?;
        let request = task.typed_request()?;
        executor.run(request).await
    }

    /// Nudge the session after a settled task, under a timeout so one slow
    /// LLM call cannot wedge the worker. A timed-out or failed advance is
    /// only logged; the recovery sweep retries it.
    async fn advance_session(&self, session_id: Uuid) {
        match tokio::time::timeout(self.config.callback_timeout, self.engine.advance(session_id))
            .await
        {
            Ok(Ok(session)) => {
                debug!(session_id = %session_id, status = %session.status, "session advanced after task")
            }
            Ok(Err(e)) => {
                warn!(session_id = %session_id, error = %e, "advance after task failed; sweep will retry")
            }
            Err(_) => {
                warn!(session_id = %session_id, "advance after task timed out; sweep will retry")
            }
        }
    }

    async fn log_stats(&self) {
        match self.store.queue_stats(Duration::from_secs(3600)).await {
            Ok(stats) => info!(
                queued = stats.queued,
                processing = stats.processing,
                completed_1h = stats.completed,
                failed_1h = stats.failed,
                "queue stats"
            ),
            Err(e) => warn!(error = %e, "failed to read queue stats"),
        }
    }
}
