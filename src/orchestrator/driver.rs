//! The per-session driver: owns the state machine loop.
//!
//! Exactly one driver runs a session at a time — entry into `running` is a
//! compare-and-swap on status performed by the engine before the driver is
//! spawned. The driver decomposes (first run only), walks sub-problems
//! strictly sequentially through the scheduler, and records the terminal
//! outcome. At every suspension point it polls for pause, termination, and
//! process shutdown.

use serde_json::json;
use tracing::{error, info, info_span, warn, Instrument};

use crate::models::cost::{CostFeature, CostRecord};
use crate::models::event::EventType;
use crate::models::session::{Session, SessionStatus, SubProblem};
use crate::orchestrator::scheduler::{self, SpOutcome};
use crate::orchestrator::termination;
use crate::{AppError, Result};

use super::SessionContext;

/// How the driver was launched.
#[derive(Debug, Clone, Copy)]
pub enum DriverMode {
    /// First start of the session (CAS into `running` already won).
    Fresh,
    /// Resume after a pause or a recovery repair.
    Resume {
        /// Round to replay for the in-progress sub-problem, from recovery.
        replay_round: Option<u32>,
        /// Whether this resume was initiated by the recovery scan.
        from_recovery: bool,
    },
}

/// Entry point spawned by the engine; logs and contains all errors.
pub(crate) async fn drive(ctx: SessionContext, mode: DriverMode) {
    let span = info_span!("session_driver", session_id = %ctx.session_id);
    if let Err(err) = run(&ctx, mode).instrument(span).await {
        error!(session_id = %ctx.session_id, %err, "session driver error");
        // Leave the session recoverable rather than wedged: the next scan
        // re-validates and either resumes or fails it.
        if let Err(flag_err) = ctx.sessions.set_recovery_needed(&ctx.session_id, true).await {
            error!(session_id = %ctx.session_id, %flag_err, "failed to flag recovery_needed");
        }
    }
}

async fn run(ctx: &SessionContext, mode: DriverMode) -> Result<()> {
    let mut replay_round: Option<u32> = None;

    match mode {
        DriverMode::Fresh => {
            let session = ctx.sessions.require(&ctx.session_id).await?;
            ctx.sequencer
                .append(
                    &ctx.session_id,
                    EventType::SessionStarted,
                    json!({
                        "persona_variant": session.persona_variant,
                        "problem_statement": session.problem_statement,
                    }),
                )
                .await?;
        }
        DriverMode::Resume {
            replay_round: round,
            from_recovery,
        } => {
            replay_round = round;
            if from_recovery {
                ctx.sessions
                    .set_recovery_needed(&ctx.session_id, false)
                    .await?;
            }
            ctx.sequencer
                .append(
                    &ctx.session_id,
                    EventType::SessionResumed,
                    json!({ "replay_round": round, "from_recovery": from_recovery }),
                )
                .await?;
        }
    }

    // ── Decomposition (first run only) ──────────────────────
    let session = ctx.sessions.require(&ctx.session_id).await?;
    if session.total_sub_problems == 0 {
        if let Err(err) = decompose(ctx, &session).await {
            fail_session(ctx, &err.to_string()).await;
            return Ok(());
        }
    }

    let sub_problems = ctx.sessions.load_sub_problems(&ctx.session_id).await?;
    let session = ctx.sessions.require(&ctx.session_id).await?;
    let total = session.total_sub_problems;
    let mut sp_index = session.next_sp_index();

    // ── Sequential sub-problem loop ─────────────────────────
    while sp_index < total {
        if ctx.shutdown.is_cancelled() {
            park_for_recovery(ctx).await;
            return Ok(());
        }
        let current = ctx.sessions.require(&ctx.session_id).await?;
        if current.status == SessionStatus::Paused {
            ctx.sequencer
                .append(&ctx.session_id, EventType::SessionPaused, json!({}))
                .await?;
            info!("session paused; driver exiting");
            return Ok(());
        }
        if let Some(request) = ctx.signal.pending() {
            termination::finalize_termination(ctx, &request).await?;
            return Ok(());
        }

        let Some(sub_problem) = usize::try_from(sp_index)
            .ok()
            .and_then(|i| sub_problems.get(i))
        else {
            fail_session(ctx, &format!("sub-problem spec {sp_index} missing")).await;
            return Ok(());
        };

        let start_round = replay_round.take();
        let outcome = scheduler::run_sub_problem(
            ctx,
            sub_problem,
            start_round.unwrap_or(1),
            start_round.is_some(),
        )
        .await;

        match outcome {
            Ok(SpOutcome::Completed) => {
                sp_index += 1;
            }
            Ok(SpOutcome::Interrupted(request)) => {
                termination::finalize_termination(ctx, &request).await?;
                return Ok(());
            }
            Ok(SpOutcome::Shutdown) => {
                park_for_recovery(ctx).await;
                return Ok(());
            }
            Ok(SpOutcome::RecoveryDeferred) => {
                info!("checkpoint deferred to recovery; driver exiting");
                return Ok(());
            }
            Err(err) => {
                let reason = match &err {
                    AppError::Quorum(msg)
                    | AppError::Synthesis(msg)
                    | AppError::Decomposition(msg) => msg.clone(),
                    other => other.to_string(),
                };
                fail_session(ctx, &reason).await;
                return Ok(());
            }
        }
    }

    // ── Natural completion ──────────────────────────────────
    let total_cost = ctx.costs.total_for_session(&ctx.session_id).await?;
    ctx.sessions
        .set_total_cost(&ctx.session_id, total_cost)
        .await?;
    ctx.sequencer
        .append(
            &ctx.session_id,
            EventType::SessionCompleted,
            json!({ "total_sub_problems": total, "total_cost": total_cost }),
        )
        .await?;
    ctx.sessions
        .update_status(&ctx.session_id, SessionStatus::Completed)
        .await?;
    info!(total_sub_problems = total, "session completed");
    Ok(())
}

/// Run decomposition and persist the resulting sub-problem specs.
async fn decompose(ctx: &SessionContext, session: &Session) -> Result<()> {
    let outcome = ctx
        .collaborators
        .decomposer
        .decompose(&session.problem_statement)
        .await
        .map_err(|err| AppError::Decomposition(format!("decomposition call failed: {err}")))?;

    ctx.record_cost(CostRecord::for_sub_problem(
        ctx.session_id.clone(),
        None,
        outcome.cost,
        CostFeature::Decomposition,
    ))
    .await;

    if outcome.sub_problems.is_empty() {
        return Err(AppError::Decomposition(
            "decomposition produced zero sub-problems".into(),
        ));
    }
    if outcome.sub_problems.len() > 5 {
        return Err(AppError::Decomposition(format!(
            "decomposition produced {} sub-problems, maximum is 5",
            outcome.sub_problems.len()
        )));
    }

    // Indices are positional regardless of what the collaborator set.
    let mut specs: Vec<SubProblem> = Vec::with_capacity(outcome.sub_problems.len());
    for (position, mut spec) in outcome.sub_problems.into_iter().enumerate() {
        spec.index = u32::try_from(position)
            .map_err(|_| AppError::Decomposition("sub-problem index overflow".into()))?;
        if spec.personas.is_empty() {
            return Err(AppError::Decomposition(format!(
                "sub-problem {} has an empty persona set",
                spec.index
            )));
        }
        specs.push(spec);
    }

    ctx.sessions.set_decomposed(&ctx.session_id, &specs).await?;
    info!(total_sub_problems = specs.len(), "problem decomposed");
    Ok(())
}

/// Record an unrecoverable failure: event first, then the durable status.
async fn fail_session(ctx: &SessionContext, reason: &str) {
    warn!(session_id = %ctx.session_id, reason, "session failed");
    if let Err(err) = ctx
        .sequencer
        .append(
            &ctx.session_id,
            EventType::SessionFailed,
            json!({ "reason": reason }),
        )
        .await
    {
        error!(%err, "failed to sequence session_failed event");
    }
    if let Err(err) = ctx.sessions.set_failed(&ctx.session_id, reason).await {
        error!(%err, "failed to record session failure");
    }
}

/// Leave a shutting-down session `running` with `recovery_needed` so the
/// next boot's scan resumes it from the checkpoint.
async fn park_for_recovery(ctx: &SessionContext) {
    if let Err(err) = ctx.sessions.set_recovery_needed(&ctx.session_id, true).await {
        error!(session_id = %ctx.session_id, %err, "failed to park session for recovery");
    } else {
        info!(session_id = %ctx.session_id, "session parked for recovery at shutdown");
    }
}
