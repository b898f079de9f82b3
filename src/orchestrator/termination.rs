//! Termination and kill handling.
//!
//! Termination requests land on clean boundaries: abandoning types cancel
//! the in-flight round via the signal's token, the rest are consumed by the
//! driver at the next suspension point. Finalization computes the billable
//! portion, emits the terminal event, writes the kill audit record, and only
//! then durably records the terminal status.

use std::sync::Mutex;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::models::event::EventType;
use crate::models::session::{Session, SessionStatus, TerminationType};
use crate::Result;

use super::SessionContext;

/// A pending request to end a session before natural completion.
#[derive(Debug, Clone)]
pub struct TerminationRequest {
    /// How the session is being ended.
    pub termination_type: TerminationType,
    /// Optional free-text reason.
    pub reason: Option<String>,
    /// Who triggered it: an operator id, or `system` for budget kills.
    pub actor: String,
}

impl TerminationRequest {
    /// Request attributed to the system (budget and duration kills).
    #[must_use]
    pub fn system(termination_type: TerminationType, reason: impl Into<String>) -> Self {
        Self {
            termination_type,
            reason: Some(reason.into()),
            actor: "system".into(),
        }
    }
}

/// Shared termination flag between the engine API and a session driver.
///
/// The first request wins; later requests are ignored so a session never
/// flaps between termination types.
pub struct TerminationSignal {
    pending: Mutex<Option<TerminationRequest>>,
    abandon: CancellationToken,
}

impl Default for TerminationSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminationSignal {
    /// Create an empty signal.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(None),
            abandon: CancellationToken::new(),
        }
    }

    /// Register a termination request. Returns `false` if one was already
    /// pending (the original wins).
    pub fn request(&self, request: TerminationRequest) -> bool {
        let Ok(mut pending) = self.pending.lock() else {
            return false;
        };
        if pending.is_some() {
            return false;
        }
        if request.termination_type.abandons_round() {
            self.abandon.cancel();
        }
        *pending = Some(request);
        true
    }

    /// The pending request, if any.
    #[must_use]
    pub fn pending(&self) -> Option<TerminationRequest> {
        self.pending.lock().ok().and_then(|p| p.clone())
    }

    /// Token cancelled when an abandoning termination type is requested.
    #[must_use]
    pub fn abandon_token(&self) -> CancellationToken {
        self.abandon.clone()
    }
}

/// Billable fraction of planned work, clamped to [0, 1].
#[must_use]
pub fn billable_portion(completed_sub_problems: u32, total_sub_problems: u32) -> f64 {
    if total_sub_problems == 0 {
        return 0.0;
    }
    (f64::from(completed_sub_problems) / f64::from(total_sub_problems)).clamp(0.0, 1.0)
}

/// Finalize a termination: compute the billable portion, emit the terminal
/// event, audit kills, and record the terminal status.
///
/// The terminal event and audit record are written before the status flip so
/// a crash mid-finalization is re-driven by recovery rather than losing the
/// audit trail.
///
/// # Errors
///
/// Returns `AppError::Db` if a persistence step fails, or
/// `AppError::InvalidTransition` if the session cannot reach the terminal
/// status.
pub async fn finalize_termination(
    ctx: &SessionContext,
    request: &TerminationRequest,
) -> Result<Session> {
    let session = ctx.sessions.require(&ctx.session_id).await?;

    let completed = if request.termination_type == TerminationType::ContinueBestEffort {
        // Count sub-problems that actually reached synthesis; the checkpoint
        // index may be ahead of a mid-flight final sub-problem.
        ctx.recommendations.count_for_session(&ctx.session_id).await?
    } else {
        session.completed_sp_count()
    };
    let billable = billable_portion(completed, session.total_sub_problems);

    // Refresh the cost aggregate from the ledger; a ledger read failure
    // degrades to the last known aggregate rather than blocking termination.
    let cost_at_kill = match ctx.costs.total_for_session(&ctx.session_id).await {
        Ok(total) => {
            ctx.sessions.set_total_cost(&ctx.session_id, total).await?;
            total
        }
        Err(err) => {
            warn!(session_id = %ctx.session_id, %err, "cost aggregate unavailable at termination");
            ctx.sessions.flag_untracked_costs(&ctx.session_id).await?;
            session.total_cost
        }
    };

    let terminal_status = request.termination_type.terminal_status();
    let event_type = if terminal_status == SessionStatus::Killed {
        EventType::SessionKilled
    } else {
        EventType::SessionTerminated
    };

    ctx.sequencer
        .append(
            &ctx.session_id,
            event_type,
            json!({
                "termination_type": request.termination_type,
                "reason": request.reason,
                "billable_portion": billable,
            }),
        )
        .await?;

    if terminal_status == SessionStatus::Killed {
        let entry = crate::audit::KillAuditEntry::new(
            ctx.session_id.clone(),
            request.actor.clone(),
            request.termination_type,
            request.reason.clone(),
            cost_at_kill,
            billable,
        );
        if let Err(err) = ctx.audit.log_entry(entry) {
            warn!(session_id = %ctx.session_id, %err, "kill audit write failed");
        }
    }

    let finalized = ctx
        .sessions
        .set_terminal(
            &ctx.session_id,
            request.termination_type,
            request.reason.as_deref(),
            billable,
        )
        .await?;

    info!(
        session_id = %ctx.session_id,
        termination_type = ?request.termination_type,
        billable_portion = billable,
        "session finalized"
    );

    Ok(finalized)
}

/// Build the budget-kill request if the session is over its hard cost limit.
///
/// # Errors
///
/// Returns `AppError::Db` if the ledger query fails.
pub async fn check_cost_budget(ctx: &SessionContext) -> Result<Option<TerminationRequest>> {
    // The running aggregate is refreshed whether or not a hard budget is
    // configured; the ledger is the source of truth for `total_cost`.
    let total = ctx.costs.total_for_session(&ctx.session_id).await?;
    ctx.sessions.set_total_cost(&ctx.session_id, total).await?;

    let Some(max_cost) = ctx.config.budget.max_session_cost else {
        return Ok(None);
    };
    if total >= max_cost {
        return Ok(Some(TerminationRequest::system(
            TerminationType::CostExceeded,
            format!("session cost {total:.4} reached hard budget {max_cost:.4}"),
        )));
    }
    Ok(None)
}

/// Build the duration-kill request if the session exceeded its wall-clock
/// budget.
///
/// # Errors
///
/// Returns `AppError::Db` if the session read fails.
pub async fn check_duration_budget(ctx: &SessionContext) -> Result<Option<TerminationRequest>> {
    let Some(max_seconds) = ctx.config.budget.max_session_duration_seconds else {
        return Ok(None);
    };
    let session = ctx.sessions.require(&ctx.session_id).await?;
    let Some(started_at) = session.started_at else {
        return Ok(None);
    };

    let elapsed = chrono::Utc::now() - started_at;
    if elapsed.num_seconds() >= 0 && elapsed.num_seconds().unsigned_abs() >= max_seconds {
        return Ok(Some(TerminationRequest::system(
            TerminationType::DurationExceeded,
            format!(
                "session ran {}s, past the {max_seconds}s limit",
                elapsed.num_seconds()
            ),
        )));
    }
    Ok(None)
}
