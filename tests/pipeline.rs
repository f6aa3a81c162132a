//! End-to-end pipeline tests against the in-memory store.
//!
//! These drive the real engine, worker, and recovery sweep with scripted
//! strategies and executors, so the durability properties (idempotent
//! advance, bounded retries, crash recovery, exactly-once materialization)
//! are exercised without a database or any network.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

use draftline::config::{RecoveryConfig, SessionPolicy, WorkerConfig};
use draftline::error::{StrategyError, TaskError};
use draftline::phase::{
    ExecuteDisposition, PhaseContext, PhaseStrategy, StepOutput, StrategySet, TaskSpec,
};
use draftline::recovery::RecoveryScanner;
use draftline::session::machine::SessionEngine;
use draftline::session::{SessionConfig, SessionStatus, Step};
use draftline::store::{MemoryStore, SessionStore, TaskStore};
use draftline::task::{Task, TaskKind, TaskStatus};
use draftline::worker::{TaskExecutor, Worker};

fn test_config() -> SessionConfig {
    SessionConfig {
        theme: "rust tooling".to_string(),
        style: Some("direct".to_string()),
        platform: "twitter".to_string(),
        model: None,
    }
}

fn fast_policy() -> SessionPolicy {
    SessionPolicy {
        max_retries: 3,
        retry_base_delay: Duration::from_millis(1),
    }
}

fn worker_config() -> WorkerConfig {
    WorkerConfig {
        poll_interval: Duration::from_millis(10),
        batch_size: 10,
        concurrency: 3,
        max_task_retries: 2,
        callback_timeout: Duration::from_secs(5),
        stats_interval: Duration::ZERO,
    }
}

/// Phase 1: fans out one search task per planned query, integrates into a
/// concept list shaped like the production concepts phase.
struct FanOutStrategy {
    think_calls: AtomicUsize,
    integrate_calls: AtomicUsize,
}

impl FanOutStrategy {
    fn new() -> Self {
        Self {
            think_calls: AtomicUsize::new(0),
            integrate_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PhaseStrategy for FanOutStrategy {
    fn name(&self) -> &'static str {
        "fan_out"
    }

    async fn think(&self, _ctx: &PhaseContext) -> Result<StepOutput, StrategyError> {
        self.think_calls.fetch_add(1, Ordering::SeqCst);
        Ok(StepOutput::with_tokens(
            json!({ "queries": ["rust 2026", "async runtimes"] }),
            100,
        ))
    }

    async fn execute(
        &self,
        _ctx: &PhaseContext,
        think: &Value,
    ) -> Result<ExecuteDisposition, StrategyError> {
        let queries = think["queries"].as_array().cloned().unwrap_or_default();
        Ok(ExecuteDisposition::Enqueued(
            queries
                .into_iter()
                .map(|q| TaskSpec {
                    kind: TaskKind::Search,
                    request: json!({ "kind": "search", "query": q }),
                })
                .collect(),
        ))
    }

    fn assemble(&self, _ctx: &PhaseContext, tasks: &[Task]) -> Result<Value, StrategyError> {
        let answers: Vec<Value> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .filter_map(|t| t.response.clone())
            .collect();
        if answers.is_empty() {
            return Err(StrategyError::Other("no answers".to_string()));
        }
        Ok(json!({ "answers": answers }))
    }

    async fn integrate(
        &self,
        _ctx: &PhaseContext,
        _think: &Value,
        execute: &Value,
    ) -> Result<StepOutput, StrategyError> {
        self.integrate_calls.fetch_add(1, Ordering::SeqCst);
        let count = execute["answers"].as_array().map(|a| a.len()).unwrap_or(0);
        Ok(StepOutput::with_tokens(
            json!({
                "concepts": [{
                    "title": format!("built from {count} answers"),
                    "hook": "you will not believe this",
                    "hashtags": ["#rust"],
                    "viral_score": 0.9,
                }]
            }),
            50,
        ))
    }
}

/// Phase 2: fully synchronous, produces the content set the materializer
/// zips against phase 1's concepts.
struct InlineContentStrategy;

#[async_trait]
impl PhaseStrategy for InlineContentStrategy {
    fn name(&self) -> &'static str {
        "inline_content"
    }

    async fn think(&self, ctx: &PhaseContext) -> Result<StepOutput, StrategyError> {
        // Context isolation: only phase 1's integrate result is visible.
        let prior = ctx
            .prior_results
            .get(&1)
            .ok_or_else(|| StrategyError::MissingPrerequisite("phase 1".to_string()))?;
        assert!(prior.get("concepts").is_some());
        assert!(prior.get("answers").is_none());
        Ok(StepOutput::new(prior.clone()))
    }

    async fn execute(
        &self,
        _ctx: &PhaseContext,
        think: &Value,
    ) -> Result<ExecuteDisposition, StrategyError> {
        Ok(ExecuteDisposition::Completed(StepOutput::new(think.clone())))
    }

    async fn integrate(
        &self,
        _ctx: &PhaseContext,
        _think: &Value,
        _execute: &Value,
    ) -> Result<StepOutput, StrategyError> {
        Ok(StepOutput::new(json!({
            "contents": [{
                "concept_number": 1,
                "title": "final post",
                "body": "the finished text",
                "hashtags": ["#rust", "#async"],
            }]
        })))
    }
}

/// A strategy that fails a configurable number of times before succeeding.
struct FlakyStrategy {
    failures: AtomicUsize,
    fail_times: usize,
}

#[async_trait]
impl PhaseStrategy for FlakyStrategy {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn think(&self, _ctx: &PhaseContext) -> Result<StepOutput, StrategyError> {
        if self.failures.fetch_add(1, Ordering::SeqCst) < self.fail_times {
            return Err(StrategyError::Other("provider hiccup".to_string()));
        }
        Ok(StepOutput::new(json!({ "ok": true })))
    }

    async fn execute(
        &self,
        _ctx: &PhaseContext,
        _think: &Value,
    ) -> Result<ExecuteDisposition, StrategyError> {
        Ok(ExecuteDisposition::Completed(StepOutput::new(json!({}))))
    }

    async fn integrate(
        &self,
        _ctx: &PhaseContext,
        _think: &Value,
        _execute: &Value,
    ) -> Result<StepOutput, StrategyError> {
        Ok(StepOutput::new(json!({ "concepts": [] })))
    }
}

/// A strategy whose plan never yields any tasks to run.
struct EmptyFanOutStrategy {
    execute_calls: AtomicUsize,
}

#[async_trait]
impl PhaseStrategy for EmptyFanOutStrategy {
    fn name(&self) -> &'static str {
        "empty_fan_out"
    }

    async fn think(&self, _ctx: &PhaseContext) -> Result<StepOutput, StrategyError> {
        Ok(StepOutput::new(json!({ "queries": [] })))
    }

    async fn execute(
        &self,
        _ctx: &PhaseContext,
        _think: &Value,
    ) -> Result<ExecuteDisposition, StrategyError> {
        self.execute_calls.fetch_add(1, Ordering::SeqCst);
        Ok(ExecuteDisposition::Enqueued(Vec::new()))
    }

    async fn integrate(
        &self,
        _ctx: &PhaseContext,
        _think: &Value,
        _execute: &Value,
    ) -> Result<StepOutput, StrategyError> {
        Ok(StepOutput::new(json!({ "concepts": [] })))
    }
}

struct CannedSearchExecutor;

#[async_trait]
impl TaskExecutor for CannedSearchExecutor {
    fn kind(&self) -> TaskKind {
        TaskKind::Search
    }

    async fn run(
        &self,
        request: draftline::task::TaskRequest,
    ) -> Result<Value, TaskError> {
        let draftline::task::TaskRequest::Search { query, .. } = request else {
            panic!("search executor got a non-search task");
        };
        Ok(json!({ "content": format!("findings for {query}"), "citations": [] }))
    }
}

struct FailingExecutor;

#[async_trait]
impl TaskExecutor for FailingExecutor {
    fn kind(&self) -> TaskKind {
        TaskKind::Search
    }

    async fn run(
        &self,
        _request: draftline::task::TaskRequest,
    ) -> Result<Value, TaskError> {
        Err(TaskError::Executor {
            kind: "search".to_string(),
            reason: "upstream 500".to_string(),
        })
    }
}

fn two_phase_set() -> Arc<StrategySet> {
    Arc::new(StrategySet::new(
        vec![
            Arc::new(FanOutStrategy::new()),
            Arc::new(InlineContentStrategy),
        ],
        1,
        2,
    ))
}

fn engine_with(
    store: Arc<MemoryStore>,
    strategies: Arc<StrategySet>,
) -> Arc<SessionEngine<MemoryStore>> {
    Arc::new(SessionEngine::new(
        store,
        strategies,
        fast_policy(),
        worker_config().max_task_retries,
    ))
}

#[tokio::test]
async fn test_two_phase_pipeline_end_to_end() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_with(store.clone(), two_phase_set());
    let worker = Worker::new(store.clone(), engine.clone(), worker_config())
        .register(Arc::new(CannedSearchExecutor));

    let session = engine.create(test_config()).await.unwrap();

    // First advance runs THINK, enqueues the searches, and suspends.
    let after = engine.advance(session.id).await.unwrap();
    assert_eq!(after.status, SessionStatus::Executing);
    assert_eq!(after.current_phase, 1);
    assert_eq!(after.current_step, Step::Execute);

    let tasks = store
        .tasks_for_step(session.id, 1, "execute")
        .await
        .unwrap();
    assert_eq!(tasks.len(), 2);

    // The worker drains the queue; its callback carries the session through
    // assemble, integrate, phase 2, completion, and draft materialization.
    let claimed = worker.drain_once().await.unwrap();
    assert_eq!(claimed, 2);

    let done = store.get_session(session.id).await.unwrap().unwrap();
    assert_eq!(done.status, SessionStatus::Completed);
    assert!(done.completed_at.is_some());
    assert!(done.total_tokens >= 150);

    let drafts = draftline::store::DraftStore::list_drafts(store.as_ref(), session.id)
        .await
        .unwrap();
    assert_eq!(drafts.len(), 1);
    assert_eq!(drafts[0].concept_number, 1);
    assert_eq!(drafts[0].content.as_deref(), Some("the finished text"));
    assert_eq!(drafts[0].hashtags, vec!["#rust", "#async"]);
}

#[tokio::test]
async fn test_advance_is_idempotent_per_step() {
    let store = Arc::new(MemoryStore::new());
    let fan_out = Arc::new(FanOutStrategy::new());
    let strategies = Arc::new(StrategySet::new(
        vec![fan_out.clone(), Arc::new(InlineContentStrategy)],
        1,
        2,
    ));
    let engine = engine_with(store.clone(), strategies);

    let session = engine.create(test_config()).await.unwrap();
    engine.advance(session.id).await.unwrap();
    // Re-advancing while suspended must neither re-think nor re-enqueue.
    engine.advance(session.id).await.unwrap();
    engine.advance(session.id).await.unwrap();

    assert_eq!(fan_out.think_calls.load(Ordering::SeqCst), 1);
    let tasks = store
        .tasks_for_step(session.id, 1, "execute")
        .await
        .unwrap();
    assert_eq!(tasks.len(), 2);

    // Finish it, then confirm terminal advance is a no-op.
    let worker = Worker::new(store.clone(), engine.clone(), worker_config())
        .register(Arc::new(CannedSearchExecutor));
    worker.drain_once().await.unwrap();

    let done = engine.advance(session.id).await.unwrap();
    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(fan_out.integrate_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_retry_budget_fails_session_then_operator_rearms() {
    let store = Arc::new(MemoryStore::new());
    let strategies = Arc::new(StrategySet::new(
        vec![Arc::new(FlakyStrategy {
            failures: AtomicUsize::new(0),
            fail_times: usize::MAX,
        })],
        1,
        1,
    ));
    let engine = engine_with(store.clone(), strategies);
    let session = engine.create(test_config()).await.unwrap();

    for attempt in 1..=2u32 {
        engine.advance(session.id).await.unwrap_err();
        let s = store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(s.status, SessionStatus::Pending);
        assert_eq!(s.retry_count, attempt);
        assert!(s.next_retry_at.is_some());
        assert!(s.last_error.as_deref().unwrap().contains("hiccup"));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Third failure exhausts the budget.
    engine.advance(session.id).await.unwrap_err();
    let s = store.get_session(session.id).await.unwrap().unwrap();
    assert_eq!(s.status, SessionStatus::Failed);

    // Advance on a failed session is a no-op, retry re-arms it.
    let same = engine.advance(session.id).await.unwrap();
    assert_eq!(same.status, SessionStatus::Failed);

    engine.retry(session.id).await.unwrap();
    let s = store.get_session(session.id).await.unwrap().unwrap();
    assert_eq!(s.status, SessionStatus::Pending);
    assert_eq!(s.retry_count, 0);
}

#[tokio::test]
async fn test_transient_failure_recovers_within_budget() {
    let store = Arc::new(MemoryStore::new());
    let strategies = Arc::new(StrategySet::new(
        vec![Arc::new(FlakyStrategy {
            failures: AtomicUsize::new(0),
            fail_times: 2,
        })],
        1,
        1,
    ));
    let engine = engine_with(store.clone(), strategies);
    let session = engine.create(test_config()).await.unwrap();

    engine.advance(session.id).await.unwrap_err();
    tokio::time::sleep(Duration::from_millis(20)).await;
    engine.advance(session.id).await.unwrap_err();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let done = engine.advance(session.id).await.unwrap();

    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(done.retry_count, 0);
    assert_eq!(done.last_error, None);
}

#[tokio::test]
async fn test_empty_fan_out_counts_against_retry_budget() {
    let store = Arc::new(MemoryStore::new());
    let empty = Arc::new(EmptyFanOutStrategy {
        execute_calls: AtomicUsize::new(0),
    });
    let strategies = Arc::new(StrategySet::new(vec![empty.clone()], 1, 1));
    let engine = engine_with(store.clone(), strategies);
    let session = engine.create(test_config()).await.unwrap();

    // Enqueueing nothing must not suspend the session on a queue that will
    // never drain; it fails the attempt instead.
    engine.advance(session.id).await.unwrap_err();
    let s = store.get_session(session.id).await.unwrap().unwrap();
    assert_eq!(s.status, SessionStatus::Pending);
    assert_eq!(s.retry_count, 1);
    assert!(s.last_error.as_deref().unwrap().contains("empty task list"));
    let tasks = store
        .tasks_for_step(session.id, 1, "execute")
        .await
        .unwrap();
    assert!(tasks.is_empty());

    // Kept re-advancing, it burns the budget and lands Failed rather than
    // spinning in Executing forever.
    for _ in 0..2 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.advance(session.id).await.unwrap_err();
    }
    let s = store.get_session(session.id).await.unwrap().unwrap();
    assert_eq!(s.status, SessionStatus::Failed);
    assert_eq!(empty.execute_calls.load(Ordering::SeqCst), 3);

    let same = engine.advance(session.id).await.unwrap();
    assert_eq!(same.status, SessionStatus::Failed);
    assert_eq!(empty.execute_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_advance_honors_backoff_window() {
    let store = Arc::new(MemoryStore::new());
    let flaky = Arc::new(FlakyStrategy {
        failures: AtomicUsize::new(0),
        fail_times: usize::MAX,
    });
    let strategies = Arc::new(StrategySet::new(vec![flaky.clone()], 1, 1));
    let policy = SessionPolicy {
        max_retries: 3,
        retry_base_delay: Duration::from_secs(60),
    };
    let engine = Arc::new(SessionEngine::new(
        store.clone(),
        strategies,
        policy,
        worker_config().max_task_retries,
    ));
    let session = engine.create(test_config()).await.unwrap();

    engine.advance(session.id).await.unwrap_err();
    assert_eq!(flaky.failures.load(Ordering::SeqCst), 1);

    // Inside the backoff window a manual advance is a no-op: the strategy
    // does not run again and no extra attempt is charged.
    let held = engine.advance(session.id).await.unwrap();
    assert_eq!(held.status, SessionStatus::Pending);
    assert_eq!(held.retry_count, 1);
    assert_eq!(flaky.failures.load(Ordering::SeqCst), 1);

    // An operator pause + retry clears the deadline and re-arms immediately.
    engine.pause(session.id).await.unwrap();
    engine.retry(session.id).await.unwrap();
    let s = store.get_session(session.id).await.unwrap().unwrap();
    assert_eq!(s.next_retry_at, None);
    engine.advance(session.id).await.unwrap_err();
    assert_eq!(flaky.failures.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_sweep_revives_session_stalled_after_tasks_settled() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_with(store.clone(), two_phase_set());
    let session = engine.create(test_config()).await.unwrap();
    engine.advance(session.id).await.unwrap();

    // Simulate a worker that completed the tasks but died before its
    // advance callback ran.
    let claimed = store.claim_batch(10, 2).await.unwrap();
    assert_eq!(claimed.len(), 2);
    for task in claimed {
        store
            .complete_task(task.id, json!({ "content": "x", "citations": [] }))
            .await
            .unwrap();
    }
    let frozen = store.get_session(session.id).await.unwrap().unwrap();
    assert_eq!(frozen.status, SessionStatus::Executing);

    store
        .backdate_session(session.id, Utc::now() - chrono::Duration::hours(1))
        .await;

    let recovery = RecoveryConfig {
        interval: Duration::from_secs(60),
        stall_timeout: Duration::from_secs(300),
        execute_stall_timeout: Duration::from_secs(900),
        lease_timeout: Duration::from_secs(600),
    };
    let scanner = RecoveryScanner::new(store.clone(), engine.clone(), recovery);
    let report = scanner.sweep_once().await.unwrap();
    assert_eq!(report.sessions_advanced, 1);

    let done = store.get_session(session.id).await.unwrap().unwrap();
    assert_eq!(done.status, SessionStatus::Completed);
}

#[tokio::test]
async fn test_materialization_runs_exactly_once() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_with(store.clone(), two_phase_set());
    let worker = Worker::new(store.clone(), engine.clone(), worker_config())
        .register(Arc::new(CannedSearchExecutor));

    let session = engine.create(test_config()).await.unwrap();
    engine.advance(session.id).await.unwrap();
    worker.drain_once().await.unwrap();

    // A second materialization (as the orphan sweep would trigger) must not
    // duplicate rows.
    use draftline::drafts::MaterializeOutcome;
    let outcome = engine.materialize_drafts(session.id).await.unwrap();
    assert!(matches!(outcome, MaterializeOutcome::AlreadyMaterialized));

    let drafts = draftline::store::DraftStore::list_drafts(store.as_ref(), session.id)
        .await
        .unwrap();
    assert_eq!(drafts.len(), 1);
}

#[tokio::test]
async fn test_exhausted_tasks_settle_and_session_retries_assembly() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_with(store.clone(), two_phase_set());
    let worker = Worker::new(store.clone(), engine.clone(), worker_config())
        .register(Arc::new(FailingExecutor));

    let session = engine.create(test_config()).await.unwrap();
    engine.advance(session.id).await.unwrap();

    // Attempt 1 fails and requeues, attempt 2 fails for good.
    worker.drain_once().await.unwrap();
    worker.drain_once().await.unwrap();

    let tasks = store
        .tasks_for_step(session.id, 1, "execute")
        .await
        .unwrap();
    for task in &tasks {
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 2);
        assert!(task.is_settled(2));
    }
    // Nothing left to claim.
    assert!(store.claim_batch(10, 2).await.unwrap().is_empty());

    // Every task settled as failed, so assembly errors and counts against
    // the session's own retry budget.
    let s = store.get_session(session.id).await.unwrap().unwrap();
    assert_eq!(s.status, SessionStatus::Pending);
    assert!(s.retry_count >= 1);
    assert!(s.last_error.as_deref().unwrap().contains("no answers"));
}

#[tokio::test]
async fn test_pause_blocks_advance_until_resume() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_with(store.clone(), two_phase_set());
    let session = engine.create(test_config()).await.unwrap();

    engine.pause(session.id).await.unwrap();
    let held = engine.advance(session.id).await.unwrap();
    assert_eq!(held.status, SessionStatus::Paused);
    assert_eq!(held.current_phase, 1);
    assert_eq!(held.current_step, Step::Think);

    // Paused sessions are invisible to the stall sweep.
    store
        .backdate_session(session.id, Utc::now() - chrono::Duration::hours(2))
        .await;
    let stalled = store
        .sessions_needing_attention(
            Utc::now() - chrono::Duration::minutes(5),
            Utc::now() - chrono::Duration::minutes(15),
            10,
        )
        .await
        .unwrap();
    assert!(stalled.is_empty());

    engine.resume(session.id).await.unwrap();
    let moving = engine.advance(session.id).await.unwrap();
    assert_eq!(moving.status, SessionStatus::Executing);
}
