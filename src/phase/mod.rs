//! Phase strategy seam.
//!
//! A strategy owns one phase's THINK/EXECUTE/INTEGRATE behavior. The state
//! machine never sees prompts or providers, only opaque jsonb step results
//! and the dispositions below.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::StrategyError;
use crate::session::SessionConfig;
use crate::task::{Task, TaskKind, TaskStatus};

/// What a strategy sees: the original session configuration plus all prior
/// phases' integrate results (never their think/execute intermediates),
/// keyed by phase number.
#[derive(Debug, Clone)]
pub struct PhaseContext {
    pub session_id: Uuid,
    pub phase_number: u32,
    pub config: SessionConfig,
    pub prior_results: BTreeMap<u32, Value>,
}

/// Result of a THINK or INTEGRATE call.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub value: Value,
    pub tokens: i64,
}

impl StepOutput {
    pub fn new(value: Value) -> Self {
        Self { value, tokens: 0 }
    }

    pub fn with_tokens(value: Value, tokens: i64) -> Self {
        Self { value, tokens }
    }
}

/// A task to enqueue for an EXECUTE step.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub kind: TaskKind,
    pub request: Value,
}

/// How an EXECUTE step resolved.
#[derive(Debug, Clone)]
pub enum ExecuteDisposition {
    /// Ran synchronously; the step is done.
    Completed(StepOutput),
    /// External work was queued; the session suspends until every task for
    /// this phase/step settles.
    Enqueued(Vec<TaskSpec>),
}

/// One phase's behavior.
#[async_trait]
pub trait PhaseStrategy: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Plan. Runs synchronously inside `advance`; never suspends.
    async fn think(&self, ctx: &PhaseContext) -> Result<StepOutput, StrategyError>;

    /// Perform external work, either inline or by queueing tasks.
    async fn execute(
        &self,
        ctx: &PhaseContext,
        think: &Value,
    ) -> Result<ExecuteDisposition, StrategyError>;

    /// Fold settled task responses into the persisted execute result. Called
    /// once every task for the phase's EXECUTE step has settled.
    ///
    /// The default keeps completed responses in task-creation order and
    /// drops exhausted failures, so a phase can proceed on partial results.
    fn assemble(&self, _ctx: &PhaseContext, tasks: &[Task]) -> Result<Value, StrategyError> {
        let results: Vec<Value> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .filter_map(|t| t.response.clone())
            .collect();
        Ok(serde_json::json!({ "results": results }))
    }

    /// Synthesize. Sees the current phase's own think and execute results on
    /// top of the context.
    async fn integrate(
        &self,
        ctx: &PhaseContext,
        think: &Value,
        execute: &Value,
    ) -> Result<StepOutput, StrategyError>;
}

/// Ordered strategy table, indexed by 1-based phase number.
pub struct StrategySet {
    strategies: Vec<Arc<dyn PhaseStrategy>>,
    concepts_phase: u32,
    content_phase: u32,
}

impl StrategySet {
    /// `concepts_phase` and `content_phase` name the phases whose integrate
    /// results the draft materializer zips together.
    pub fn new(
        strategies: Vec<Arc<dyn PhaseStrategy>>,
        concepts_phase: u32,
        content_phase: u32,
    ) -> Self {
        debug_assert!(concepts_phase >= 1 && concepts_phase as usize <= strategies.len());
        debug_assert!(content_phase >= 1 && content_phase as usize <= strategies.len());
        Self {
            strategies,
            concepts_phase,
            content_phase,
        }
    }

    pub fn get(&self, phase_number: u32) -> Option<&Arc<dyn PhaseStrategy>> {
        phase_number
            .checked_sub(1)
            .and_then(|i| self.strategies.get(i as usize))
    }

    pub fn phase_count(&self) -> u32 {
        self.strategies.len() as u32
    }

    pub fn is_last_phase(&self, phase_number: u32) -> bool {
        phase_number >= self.phase_count()
    }

    pub fn concepts_phase(&self) -> u32 {
        self.concepts_phase
    }

    pub fn content_phase(&self) -> u32 {
        self.content_phase
    }
}
