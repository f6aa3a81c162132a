//! Session and phase records for the chain-of-thought pipeline.
//!
//! A session is one pipeline run through N phases, each phase cycling
//! THINK -> EXECUTE -> INTEGRATE. Statuses are stored as text and parsed at
//! the edges.

pub mod health;
pub mod machine;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle states of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created, or between steps and ready to be advanced.
    Pending,
    /// A THINK call is in flight.
    Thinking,
    /// Suspended on queued tasks for the EXECUTE step.
    Executing,
    /// An INTEGRATE call is in flight.
    Integrating,
    /// Operator hold. Resumable back to Pending.
    Paused,
    /// Terminal success.
    Completed,
    /// Terminal failure (retry budget exhausted or unrecoverable).
    Failed,
}

impl SessionStatus {
    /// Terminal for automatic processing. Paused is not terminal: an
    /// operator can resume it, but sweeps and workers skip it.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Thinking => "thinking",
            SessionStatus::Executing => "executing",
            SessionStatus::Integrating => "integrating",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SessionStatus::Pending),
            "thinking" => Ok(SessionStatus::Thinking),
            "executing" => Ok(SessionStatus::Executing),
            "integrating" => Ok(SessionStatus::Integrating),
            "paused" => Ok(SessionStatus::Paused),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// The three steps of a phase, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Think,
    Execute,
    Integrate,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Step::Think => "think",
            Step::Execute => "execute",
            Step::Integrate => "integrate",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Step {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "think" => Ok(Step::Think),
            "execute" => Ok(Step::Execute),
            "integrate" => Ok(Step::Integrate),
            other => Err(format!("unknown step: {other}")),
        }
    }
}

/// Per-phase status, tracking which step last committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Thinking,
    Executing,
    Integrating,
    Completed,
    Failed,
}

impl PhaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Thinking => "thinking",
            PhaseStatus::Executing => "executing",
            PhaseStatus::Integrating => "integrating",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PhaseStatus::Pending),
            "thinking" => Ok(PhaseStatus::Thinking),
            "executing" => Ok(PhaseStatus::Executing),
            "integrating" => Ok(PhaseStatus::Integrating),
            "completed" => Ok(PhaseStatus::Completed),
            "failed" => Ok(PhaseStatus::Failed),
            other => Err(format!("unknown phase status: {other}")),
        }
    }
}

/// User-supplied pipeline configuration, persisted as jsonb.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Subject area the pipeline researches and writes about.
    pub theme: String,
    /// Voice/tone for generated content.
    #[serde(default)]
    pub style: Option<String>,
    /// Target platform for generated content.
    #[serde(default = "default_platform")]
    pub platform: String,
    /// Override for the chat model; provider default when absent.
    #[serde(default)]
    pub model: Option<String>,
}

fn default_platform() -> String {
    "twitter".to_string()
}

/// One pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub config: SessionConfig,
    pub status: SessionStatus,
    pub current_phase: u32,
    pub current_step: Step,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub total_tokens: i64,
    pub total_duration_ms: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Fresh Pending session at phase 1, step THINK.
    pub fn new(config: SessionConfig) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            config,
            status: SessionStatus::Pending,
            current_phase: 1,
            current_step: Step::Think,
            retry_count: 0,
            last_error: None,
            next_retry_at: None,
            total_tokens: 0,
            total_duration_ms: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// One (session, phase_number) record holding the three steps' results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub id: Uuid,
    pub session_id: Uuid,
    pub phase_number: u32,
    pub status: PhaseStatus,
    pub think_result: Option<serde_json::Value>,
    pub think_tokens: Option<i64>,
    pub think_at: Option<DateTime<Utc>>,
    pub execute_result: Option<serde_json::Value>,
    pub execute_duration_ms: Option<i64>,
    pub execute_at: Option<DateTime<Utc>>,
    pub integrate_result: Option<serde_json::Value>,
    pub integrate_tokens: Option<i64>,
    pub integrate_at: Option<DateTime<Utc>>,
}

impl Phase {
    pub fn new(session_id: Uuid, phase_number: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            phase_number,
            status: PhaseStatus::Pending,
            think_result: None,
            think_tokens: None,
            think_at: None,
            execute_result: None,
            execute_duration_ms: None,
            execute_at: None,
            integrate_result: None,
            integrate_tokens: None,
            integrate_at: None,
        }
    }
}

/// Exponential backoff with jitter for session retries.
///
/// attempt 0 -> base, attempt 1 -> 2*base, attempt 2 -> 4*base, capped at
/// one hour. Jitter spreads concurrent retries by up to 10%.
pub fn retry_backoff(base: Duration, attempt: u32) -> Duration {
    const MAX_BACKOFF: Duration = Duration::from_secs(3600);
    let exp = base.saturating_mul(1u32 << attempt.min(16));
    let capped = exp.min(MAX_BACKOFF);
    let jitter_ms = (capped.as_millis() as u64 / 10).max(1);
    capped + Duration::from_millis(rand::random::<u64>() % jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            SessionStatus::Pending,
            SessionStatus::Thinking,
            SessionStatus::Executing,
            SessionStatus::Integrating,
            SessionStatus::Paused,
            SessionStatus::Completed,
            SessionStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(!SessionStatus::Paused.is_terminal());
        assert!(!SessionStatus::Executing.is_terminal());
    }

    #[test]
    fn test_new_session_starts_at_phase_one_think() {
        let session = Session::new(SessionConfig {
            theme: "ai tooling".to_string(),
            style: None,
            platform: default_platform(),
            model: None,
        });
        assert_eq!(session.status, SessionStatus::Pending);
        assert_eq!(session.current_phase, 1);
        assert_eq!(session.current_step, Step::Think);
        assert_eq!(session.retry_count, 0);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let base = Duration::from_secs(30);
        let first = retry_backoff(base, 0);
        let second = retry_backoff(base, 1);
        assert!(first >= Duration::from_secs(30));
        assert!(second >= Duration::from_secs(60));
        // Large attempts cap at one hour plus jitter.
        let huge = retry_backoff(base, 30);
        assert!(huge <= Duration::from_secs(3600) + Duration::from_secs(360));
    }
}
