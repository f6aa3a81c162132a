//! Built-in three-phase content pipeline.
//!
//! Phase 1 (research): THINK plans search queries, EXECUTE fans them out as
//! queued search tasks, INTEGRATE distills trend opportunities.
//! Phase 2 (concepts): EXECUTE ranks opportunities inline, INTEGRATE emits
//! the concept list the materializer later projects.
//! Phase 3 (content): INTEGRATE writes one content item per concept.
//!
//! Step outputs are typed; the engine persists them as jsonb and the types
//! here parse them back at the seams.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StrategyError;
use crate::llm::{strip_json_fence, ChatMessage, CompletionRequest, LlmClient, SearchOutcome};
use crate::phase::{
    ExecuteDisposition, PhaseContext, PhaseStrategy, StepOutput, StrategySet, TaskSpec,
};
use crate::task::{Task, TaskKind, TaskStatus};

// --- Typed step outputs ---

/// Phase 1 THINK output: the search plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchPlan {
    pub queries: Vec<PlannedQuery>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedQuery {
    pub query: String,
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub recency: Option<String>,
}

/// Phase 1 EXECUTE output: raw search results in query order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResults {
    pub results: Vec<SearchOutcome>,
}

/// Phase 1 INTEGRATE output: ranked trend opportunities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendAnalysis {
    pub opportunities: Vec<Opportunity>,
    #[serde(default)]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub topic: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub viral_score: Option<f64>,
    #[serde(default)]
    pub sources: Vec<String>,
}

/// Phase 2 INTEGRATE output: the concept list, one draft per entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConceptList {
    #[serde(default)]
    pub concepts: Vec<Concept>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Concept {
    pub title: String,
    #[serde(default)]
    pub hook: Option<String>,
    #[serde(default)]
    pub angle: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub timing: Option<String>,
    #[serde(default)]
    pub hashtags: Vec<String>,
    #[serde(default)]
    pub viral_score: Option<f64>,
    #[serde(default)]
    pub opportunity: Option<String>,
}

/// Phase 3 INTEGRATE output: finished content, positionally aligned with the
/// concept list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentSet {
    #[serde(default)]
    pub contents: Vec<ContentItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentItem {
    pub concept_number: u32,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub hashtags: Vec<String>,
    #[serde(default)]
    pub visual_guide: Option<String>,
}

// --- Shared LLM plumbing ---

async fn complete_json<T: for<'de> Deserialize<'de>>(
    llm: &dyn LlmClient,
    ctx: &PhaseContext,
    system: &str,
    prompt: String,
    max_tokens: u32,
    temperature: f32,
) -> Result<(T, i64), StrategyError> {
    let request = CompletionRequest::new(vec![
        ChatMessage::system(system),
        ChatMessage::user(prompt),
    ])
    .with_model(ctx.config.model.clone())
    .with_max_tokens(max_tokens)
    .with_temperature(temperature)
    .json();

    let completion = llm.complete(request).await?;
    let parsed = serde_json::from_str(strip_json_fence(&completion.content))
        .map_err(|e| StrategyError::MalformedOutput(e.to_string()))?;
    Ok((parsed, completion.total_tokens))
}

fn style_line(ctx: &PhaseContext) -> String {
    format!(
        "Theme: {}\nStyle: {}\nPlatform: {}",
        ctx.config.theme,
        ctx.config.style.as_deref().unwrap_or("neutral"),
        ctx.config.platform,
    )
}

fn prior_result<T: for<'de> Deserialize<'de>>(
    ctx: &PhaseContext,
    phase_number: u32,
    what: &str,
) -> Result<T, StrategyError> {
    let value = ctx.prior_results.get(&phase_number).ok_or_else(|| {
        StrategyError::MissingPrerequisite(format!("phase {phase_number} result ({what})"))
    })?;
    serde_json::from_value(value.clone())
        .map_err(|e| StrategyError::MalformedOutput(format!("{what}: {e}")))
}

// --- Phase 1: research ---

/// Plans searches, fans them out as tasks, distills trends.
pub struct ResearchStrategy {
    llm: Arc<dyn LlmClient>,
}

impl ResearchStrategy {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl PhaseStrategy for ResearchStrategy {
    fn name(&self) -> &'static str {
        "research"
    }

    async fn think(&self, ctx: &PhaseContext) -> Result<StepOutput, StrategyError> {
        let prompt = format!(
            "{}\n\nPlan 2 to 5 web searches that surface current, discussion-worthy \
             developments for this theme. Respond as JSON: \
             {{\"queries\": [{{\"query\": \"...\", \"intent\": \"...\", \"recency\": \"week\"}}]}}",
            style_line(ctx)
        );
        let (plan, tokens): (SearchPlan, i64) = complete_json(
            self.llm.as_ref(),
            ctx,
            "You are a research planner.",
            prompt,
            2000,
            0.7,
        )
        .await?;
        if plan.queries.is_empty() {
            return Err(StrategyError::MalformedOutput(
                "search plan contains no queries".to_string(),
            ));
        }
        Ok(StepOutput::with_tokens(serde_json::to_value(&plan).unwrap(), tokens))
    }

    async fn execute(
        &self,
        _ctx: &PhaseContext,
        think: &Value,
    ) -> Result<ExecuteDisposition, StrategyError> {
        let plan: SearchPlan = serde_json::from_value(think.clone())
            .map_err(|e| StrategyError::MalformedOutput(format!("search plan: {e}")))?;
        let specs = plan
            .queries
            .into_iter()
            .map(|q| TaskSpec {
                kind: TaskKind::Search,
                request: serde_json::json!({
                    "kind": "search",
                    "query": q.query,
                    "system_prompt": q.intent,
                    "recency": q.recency.unwrap_or_else(|| "week".to_string()),
                }),
            })
            .collect();
        Ok(ExecuteDisposition::Enqueued(specs))
    }

    fn assemble(&self, _ctx: &PhaseContext, tasks: &[Task]) -> Result<Value, StrategyError> {
        let results: Vec<SearchOutcome> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .filter_map(|t| t.response.clone())
            .map(|v| serde_json::from_value(v))
            .collect::<Result<_, _>>()
            .map_err(|e| StrategyError::MalformedOutput(format!("search response: {e}")))?;
        if results.is_empty() {
            return Err(StrategyError::Other(
                "every search task failed; nothing to integrate".to_string(),
            ));
        }
        Ok(serde_json::to_value(SearchResults { results }).unwrap())
    }

    async fn integrate(
        &self,
        ctx: &PhaseContext,
        _think: &Value,
        execute: &Value,
    ) -> Result<StepOutput, StrategyError> {
        let results: SearchResults = serde_json::from_value(execute.clone())
            .map_err(|e| StrategyError::MalformedOutput(format!("search results: {e}")))?;
        let digest: String = results
            .results
            .iter()
            .enumerate()
            .map(|(i, r)| format!("## Result {}\n{}\n", i + 1, r.content))
            .collect();
        let prompt = format!(
            "{}\n\nFrom the research below, identify 3 to 5 topics with genuine \
             traction. Respond as JSON: {{\"opportunities\": [{{\"topic\": \"...\", \
             \"summary\": \"...\", \"viral_score\": 0.0, \"sources\": []}}], \
             \"summary\": \"...\"}}\n\n{digest}",
            style_line(ctx)
        );
        let (analysis, tokens): (TrendAnalysis, i64) = complete_json(
            self.llm.as_ref(),
            ctx,
            "You are a trend analyst.",
            prompt,
            4000,
            0.5,
        )
        .await?;
        Ok(StepOutput::with_tokens(
            serde_json::to_value(&analysis).unwrap(),
            tokens,
        ))
    }
}

// --- Phase 2: concepts ---

/// Ranks phase 1 opportunities and turns the best into content concepts.
pub struct ConceptStrategy {
    llm: Arc<dyn LlmClient>,
    max_concepts: usize,
}

impl ConceptStrategy {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            max_concepts: 3,
        }
    }
}

#[async_trait]
impl PhaseStrategy for ConceptStrategy {
    fn name(&self) -> &'static str {
        "concepts"
    }

    async fn think(&self, ctx: &PhaseContext) -> Result<StepOutput, StrategyError> {
        // Planning here is deterministic: carry the prior analysis forward so
        // EXECUTE and INTEGRATE read from the phase's own record.
        let analysis: TrendAnalysis = prior_result(ctx, 1, "trend analysis")?;
        Ok(StepOutput::new(serde_json::to_value(&analysis).unwrap()))
    }

    async fn execute(
        &self,
        _ctx: &PhaseContext,
        think: &Value,
    ) -> Result<ExecuteDisposition, StrategyError> {
        // Cheap and deterministic: rank inline, no tasks.
        let mut analysis: TrendAnalysis = serde_json::from_value(think.clone())
            .map_err(|e| StrategyError::MalformedOutput(format!("trend analysis: {e}")))?;
        analysis.opportunities.sort_by(|a, b| {
            b.viral_score
                .unwrap_or(0.0)
                .total_cmp(&a.viral_score.unwrap_or(0.0))
        });
        analysis.opportunities.truncate(self.max_concepts);
        Ok(ExecuteDisposition::Completed(StepOutput::new(
            serde_json::to_value(&analysis).unwrap(),
        )))
    }

    async fn integrate(
        &self,
        ctx: &PhaseContext,
        _think: &Value,
        execute: &Value,
    ) -> Result<StepOutput, StrategyError> {
        let ranked: TrendAnalysis = serde_json::from_value(execute.clone())
            .map_err(|e| StrategyError::MalformedOutput(format!("ranked analysis: {e}")))?;
        let topics: Vec<String> = ranked
            .opportunities
            .iter()
            .map(|o| {
                format!(
                    "- {} (score {:.2}): {}",
                    o.topic,
                    o.viral_score.unwrap_or(0.0),
                    o.summary.as_deref().unwrap_or("")
                )
            })
            .collect();
        let prompt = format!(
            "{}\n\nDraft one content concept per topic below. Respond as JSON: \
             {{\"concepts\": [{{\"title\": \"...\", \"hook\": \"...\", \"angle\": \"...\", \
             \"format\": \"...\", \"hashtags\": [], \"viral_score\": 0.0, \
             \"opportunity\": \"...\"}}]}}\n\n{}",
            style_line(ctx),
            topics.join("\n")
        );
        let (concepts, tokens): (ConceptList, i64) = complete_json(
            self.llm.as_ref(),
            ctx,
            "You are a content strategist.",
            prompt,
            3000,
            0.6,
        )
        .await?;
        if concepts.concepts.is_empty() {
            return Err(StrategyError::MalformedOutput(
                "no concepts produced".to_string(),
            ));
        }
        Ok(StepOutput::with_tokens(
            serde_json::to_value(&concepts).unwrap(),
            tokens,
        ))
    }
}

// --- Phase 3: content ---

/// Writes the finished content for each concept.
pub struct ContentStrategy {
    llm: Arc<dyn LlmClient>,
    concepts_phase: u32,
}

impl ContentStrategy {
    pub fn new(llm: Arc<dyn LlmClient>, concepts_phase: u32) -> Self {
        Self {
            llm,
            concepts_phase,
        }
    }
}

#[async_trait]
impl PhaseStrategy for ContentStrategy {
    fn name(&self) -> &'static str {
        "content"
    }

    async fn think(&self, ctx: &PhaseContext) -> Result<StepOutput, StrategyError> {
        let concepts: ConceptList = prior_result(ctx, self.concepts_phase, "concept list")?;
        Ok(StepOutput::new(serde_json::to_value(&concepts).unwrap()))
    }

    async fn execute(
        &self,
        _ctx: &PhaseContext,
        think: &Value,
    ) -> Result<ExecuteDisposition, StrategyError> {
        // Nothing external to do; the concepts pass straight through.
        Ok(ExecuteDisposition::Completed(StepOutput::new(think.clone())))
    }

    async fn integrate(
        &self,
        ctx: &PhaseContext,
        _think: &Value,
        execute: &Value,
    ) -> Result<StepOutput, StrategyError> {
        let concepts: ConceptList = serde_json::from_value(execute.clone())
            .map_err(|e| StrategyError::MalformedOutput(format!("concept list: {e}")))?;
        let listing: Vec<String> = concepts
            .concepts
            .iter()
            .enumerate()
            .map(|(i, c)| {
                format!(
                    "{}. {} — hook: {}, angle: {}",
                    i + 1,
                    c.title,
                    c.hook.as_deref().unwrap_or(""),
                    c.angle.as_deref().unwrap_or("")
                )
            })
            .collect();
        let prompt = format!(
            "{}\n\nWrite the final post for each concept, keeping platform \
             conventions. Respond as JSON: {{\"contents\": [{{\"concept_number\": 1, \
             \"title\": \"...\", \"body\": \"...\", \"hashtags\": [], \
             \"visual_guide\": \"...\"}}]}}\n\n{}",
            style_line(ctx),
            listing.join("\n")
        );
        let (contents, tokens): (ContentSet, i64) = complete_json(
            self.llm.as_ref(),
            ctx,
            "You are a copywriter.",
            prompt,
            4000,
            0.7,
        )
        .await?;
        Ok(StepOutput::with_tokens(
            serde_json::to_value(&contents).unwrap(),
            tokens,
        ))
    }
}

/// The default pipeline: research -> concepts -> content. Drafts zip the
/// concepts phase (2) with the content phase (3).
pub fn default_pipeline(llm: Arc<dyn LlmClient>) -> StrategySet {
    StrategySet::new(
        vec![
            Arc::new(ResearchStrategy::new(llm.clone())),
            Arc::new(ConceptStrategy::new(llm.clone())),
            Arc::new(ContentStrategy::new(llm, 2)),
        ],
        2,
        3,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pipeline_shape() {
        struct NoLlm;
        #[async_trait]
        impl LlmClient for NoLlm {
            async fn complete(
                &self,
                _request: crate::llm::CompletionRequest,
            ) -> Result<crate::llm::Completion, crate::error::LlmError> {
                Err(crate::error::LlmError::NotConfigured {
                    provider: "test".to_string(),
                })
            }
        }

        let set = default_pipeline(Arc::new(NoLlm));
        assert_eq!(set.phase_count(), 3);
        assert_eq!(set.concepts_phase(), 2);
        assert_eq!(set.content_phase(), 3);
        assert!(set.get(1).is_some());
        assert!(set.get(4).is_none());
        assert!(set.is_last_phase(3));
    }

    #[test]
    fn test_concept_list_tolerates_sparse_fields() {
        let value = serde_json::json!({
            "concepts": [{ "title": "Just a title" }]
        });
        let list: ConceptList = serde_json::from_value(value).unwrap();
        assert_eq!(list.concepts.len(), 1);
        assert!(list.concepts[0].hashtags.is_empty());
    }
}
