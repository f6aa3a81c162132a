//! The recovery sweep.
//!
//! Everything here is idempotent repair: re-driving sessions that stopped
//! moving, returning task claims whose worker died, and materializing drafts
//! for sessions that completed but crashed before the draft insert. The
//! sweep runs on an interval inside `serve` and once from `recover`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::RecoveryConfig;
use crate::drafts::MaterializeOutcome;
use crate::session::machine::SessionEngine;
use crate::store::{DraftStore, SessionStore, TaskStore};

/// Sessions and drafts handled per sweep. Anything beyond this waits for
/// the next interval.
const SWEEP_LIMIT: usize = 20;

/// What one sweep did.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub stale_claims_released: u64,
    pub sessions_advanced: usize,
    pub sessions_errored: usize,
    pub drafts_materialized: usize,
}

pub struct RecoveryScanner<S> {
    store: Arc<S>,
    engine: Arc<SessionEngine<S>>,
    config: RecoveryConfig,
}

impl<S> RecoveryScanner<S>
where
    S: SessionStore + TaskStore + DraftStore + 'static,
{
    pub fn new(store: Arc<S>, engine: Arc<SessionEngine<S>>, config: RecoveryConfig) -> Self {
        Self {
            store,
            engine,
            config,
        }
    }

    /// Sweep forever on the configured interval.
    pub async fn run(&self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            stall_secs = self.config.stall_timeout.as_secs(),
            "recovery scanner started"
        );
        let mut tick = tokio::time::interval(self.config.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            match self.sweep_once().await {
                Ok(report) => {
                    if report.stale_claims_released > 0
                        || report.sessions_advanced > 0
                        || report.drafts_materialized > 0
                    {
                        info!(
                            stale_claims = report.stale_claims_released,
                            advanced = report.sessions_advanced,
                            errored = report.sessions_errored,
                            drafts = report.drafts_materialized,
                            "sweep made progress"
                        );
                    } else {
                        debug!("sweep found nothing to do");
                    }
                }
                Err(e) => warn!(error = %e, "sweep failed"),
            }
        }
    }

    /// One full pass: stale claims, stalled sessions, orphaned drafts.
    pub async fn sweep_once(&self) -> Result<SweepReport, crate::error::DatabaseError> {
        let mut report = SweepReport::default();
        let now = Utc::now();

        let lease_cutoff = now - to_chrono(self.config.lease_timeout);
        report.stale_claims_released = self.store.release_stale_claims(lease_cutoff).await?;
        if report.stale_claims_released > 0 {
            info!(count = report.stale_claims_released, "released stale task claims");
        }

        let cutoff = now - to_chrono(self.config.stall_timeout);
        let execute_cutoff = now - to_chrono(self.config.execute_stall_timeout);
        let stalled = self
            .store
            .sessions_needing_attention(cutoff, execute_cutoff, SWEEP_LIMIT)
            .await?;
        for session_id in stalled {
            match self.engine.advance(session_id).await {
                Ok(session) => {
                    report.sessions_advanced += 1;
                    debug!(session_id = %session_id, status = %session.status, "stalled session advanced");
                }
                Err(e) => {
                    // The engine already persisted the retry bookkeeping;
                    // nothing more to do here but count it.
                    report.sessions_errored += 1;
                    warn!(session_id = %session_id, error = %e, "stalled session failed to advance");
                }
            }
        }

        let orphaned = self
            .store
            .completed_sessions_without_drafts(SWEEP_LIMIT)
            .await?;
        for session_id in orphaned {
            match self.engine.materialize_drafts(session_id).await {
                Ok(MaterializeOutcome::Created(n)) => {
                    report.drafts_materialized += n;
                    info!(session_id = %session_id, drafts = n, "materialized drafts for completed session");
                }
                Ok(MaterializeOutcome::AlreadyMaterialized) => {}
                Ok(MaterializeOutcome::Empty) => {
                    debug!(session_id = %session_id, "completed session has no draftable output")
                }
                Err(e) => warn!(session_id = %session_id, error = %e, "draft materialization failed"),
            }
        }

        Ok(report)
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1000))
}
