//! Draft records and the materializer that projects a completed session
//! into them.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{SessionError, StrategyError};
use crate::store::{DraftStore, SessionStore};
use crate::strategies::{ConceptList, ContentSet};

/// Editorial states of a draft.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftStatus {
    Draft,
    Edited,
    Scheduled,
    Posted,
    Archived,
}

impl DraftStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DraftStatus::Draft => "draft",
            DraftStatus::Edited => "edited",
            DraftStatus::Scheduled => "scheduled",
            DraftStatus::Posted => "posted",
            DraftStatus::Archived => "archived",
        }
    }
}

impl fmt::Display for DraftStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DraftStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(DraftStatus::Draft),
            "edited" => Ok(DraftStatus::Edited),
            "scheduled" => Ok(DraftStatus::Scheduled),
            "posted" => Ok(DraftStatus::Posted),
            "archived" => Ok(DraftStatus::Archived),
            other => Err(format!("unknown draft status: {other}")),
        }
    }
}

/// One finished content proposal derived from a completed session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Draft {
    pub id: Uuid,
    pub session_id: Uuid,
    /// Stable position in the concept list, 1-based.
    pub concept_number: u32,
    pub title: String,
    pub hook: Option<String>,
    pub angle: Option<String>,
    pub format: Option<String>,
    pub content: Option<String>,
    pub visual_guide: Option<String>,
    pub timing: Option<String>,
    pub hashtags: Vec<String>,
    pub status: DraftStatus,
    pub viral_score: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of a materialization attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterializeOutcome {
    /// Drafts were inserted in this call.
    Created(usize),
    /// A previous call already inserted them. Treated as success.
    AlreadyMaterialized,
    /// The session has no concepts to project (nothing to do).
    Empty,
}

/// Projects a completed session's phase outputs into draft rows.
///
/// Idempotent and safe under concurrent invocation: the whole insert runs in
/// one transaction keyed by the (session_id, concept_number) uniqueness
/// constraint, and a constraint violation is read as "already materialized",
/// not an error.
pub struct DraftMaterializer<S> {
    store: Arc<S>,
    concepts_phase: u32,
    content_phase: u32,
}

impl<S> DraftMaterializer<S>
where
    S: SessionStore + DraftStore,
{
    pub fn new(store: Arc<S>, concepts_phase: u32, content_phase: u32) -> Self {
        Self {
            store,
            concepts_phase,
            content_phase,
        }
    }

    /// Materialize drafts for a completed session.
    pub async fn materialize(&self, session_id: Uuid) -> Result<MaterializeOutcome, SessionError> {
        let phases = self.store.list_phases(session_id).await?;

        let concepts = phases
            .iter()
            .find(|p| p.phase_number == self.concepts_phase)
            .and_then(|p| p.integrate_result.as_ref())
            .map(|v| serde_json::from_value::<ConceptList>(v.clone()))
            .transpose()
            .map_err(|e| {
                StrategyError::MalformedOutput(format!("concepts phase result: {e}"))
            })?;

        let Some(concepts) = concepts else {
            tracing::warn!(%session_id, "No concepts to materialize");
            return Ok(MaterializeOutcome::Empty);
        };
        if concepts.concepts.is_empty() {
            return Ok(MaterializeOutcome::Empty);
        }

        let contents = phases
            .iter()
            .find(|p| p.phase_number == self.content_phase)
            .and_then(|p| p.integrate_result.as_ref())
            .map(|v| serde_json::from_value::<ContentSet>(v.clone()))
            .transpose()
            .map_err(|e| StrategyError::MalformedOutput(format!("content phase result: {e}")))?
            .unwrap_or_default();

        // Zip positionally: concept i pairs with content i when present.
        let now = Utc::now();
        let drafts: Vec<Draft> = concepts
            .concepts
            .iter()
            .enumerate()
            .map(|(i, concept)| {
                let content = contents.contents.get(i);
                Draft {
                    id: Uuid::new_v4(),
                    session_id,
                    concept_number: (i + 1) as u32,
                    title: concept.title.clone(),
                    hook: concept.hook.clone(),
                    angle: concept.angle.clone(),
                    format: concept.format.clone(),
                    content: content.map(|c| c.body.clone()),
                    visual_guide: content.and_then(|c| c.visual_guide.clone()),
                    timing: concept.timing.clone(),
                    hashtags: content
                        .map(|c| c.hashtags.clone())
                        .unwrap_or_else(|| concept.hashtags.clone()),
                    status: DraftStatus::Draft,
                    viral_score: concept.viral_score,
                    created_at: now,
                    updated_at: now,
                }
            })
            .collect();

        match self.store.insert_drafts(&drafts).await {
            Ok(true) => {
                tracing::info!(%session_id, count = drafts.len(), "Materialized drafts");
                Ok(MaterializeOutcome::Created(drafts.len()))
            }
            Ok(false) => {
                tracing::debug!(%session_id, "Drafts already materialized");
                Ok(MaterializeOutcome::AlreadyMaterialized)
            }
            Err(e) => Err(e.into()),
        }
    }
}
