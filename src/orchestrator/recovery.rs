//! Crash recovery: scan for interrupted sessions and repair them.
//!
//! The checkpoint record is the single source of truth for "sub-problem
//! done": any `in_flight` contribution at or before the checkpoint was
//! superseded or abandoned and is rolled back; the sub-problem just past the
//! checkpoint is replayed. Repair is idempotent — running it twice on an
//! already-consistent session is a no-op.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

use crate::persistence::contribution_repo::ContributionRepo;
use crate::persistence::session_repo::SessionRepo;
use crate::Result;

use super::Engine;

/// What a repair pass did for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepairOutcome {
    /// Stale `in_flight` contributions rolled back at or before the checkpoint.
    pub rolled_back: u64,
    /// Sub-problem the driver should resume at, if any work remains.
    pub resume_sp_index: Option<u32>,
    /// Round that was mid-flight at crash time, to be replayed from scratch.
    pub replay_round: Option<u32>,
}

/// Summary of one recovery scan pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    /// Sessions examined by this pass.
    pub scanned: usize,
    /// Sessions repaired and handed back to a driver.
    pub resumed: usize,
    /// Sessions failed after exhausting resume attempts.
    pub failed: usize,
    /// Sessions skipped because a live driver already owns them.
    pub skipped_live: usize,
}

/// Repair one interrupted session's contribution state.
///
/// Rolls back stale `in_flight` rows at or before the checkpoint and
/// computes where a resumed driver should pick up. Does not clear
/// `recovery_needed` — the resumed driver does that once it has taken over.
///
/// # Errors
///
/// Returns `AppError::NotFound` if the session does not exist, or
/// `AppError::Db` on persistence failure.
pub async fn repair_session(
    sessions: &SessionRepo,
    contributions: &ContributionRepo,
    session_id: &str,
) -> Result<RepairOutcome> {
    let span = info_span!("repair_session", session_id);

    async move {
        let session = sessions.require(session_id).await?;

        // Stale rows: the checkpoint already advanced past them.
        let rolled_back = match session.last_completed_sp_index {
            Some(checkpoint) => {
                contributions
                    .roll_back_at_or_before(session_id, checkpoint)
                    .await?
            }
            None => 0,
        };

        let resume_sp_index = {
            let next = session.next_sp_index();
            if session.total_sub_problems == 0 || next < session.total_sub_problems {
                Some(next)
            } else {
                None
            }
        };

        // The in-progress sub-problem's rows stay in flight; the scheduler
        // supersedes them when it replays the round.
        let replay_round = match resume_sp_index {
            Some(sp) => contributions.max_in_flight_round(session_id, sp).await?,
            None => None,
        };

        if rolled_back > 0 {
            info!(rolled_back, "rolled back stale in-flight contributions");
        }

        Ok(RepairOutcome {
            rolled_back,
            resume_sp_index,
            replay_round,
        })
    }
    .instrument(span)
    .await
}

/// Spawn the periodic recovery-scan background task.
///
/// Runs once immediately at startup, then on the configured interval.
#[must_use]
pub fn spawn_recovery_task(engine: Arc<Engine>, cancel: CancellationToken) -> JoinHandle<()> {
    let interval = Duration::from_secs(engine.config().recovery.scan_interval_seconds);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("recovery scan task shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match engine.run_recovery_scan().await {
                        Ok(report) if report.scanned > 0 => {
                            info!(?report, "recovery scan pass complete");
                        }
                        Ok(_) => {}
                        Err(err) => error!(%err, "recovery scan failed"),
                    }
                }
            }
        }
    })
}
