//! Sub-problem scheduling: concurrent persona rounds, quorum fan-in,
//! convergence, synthesis, and the checkpoint advance.
//!
//! One driver processes sub-problems strictly sequentially; within a round,
//! persona tasks run concurrently (bounded by panel size) and the driver
//! blocks at the fan-in barrier until quorum, timeout, or cancellation.
//! Cancellation is polled at suspension points only — a contribution write
//! is never interrupted once started.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::models::contribution::{Contribution, ContributionStatus, Recommendation};
use crate::models::cost::CostRecord;
use crate::models::event::EventType;
use crate::models::session::SubProblem;
use crate::orchestrator::collaborators::{ContributionPayload, RecommendationPayload};
use crate::orchestrator::termination::{self, TerminationRequest};
use crate::{AppError, Result};

use super::SessionContext;

const CHECKPOINT_RETRIES: u32 = 3;

/// Why a sub-problem run stopped.
pub enum SpOutcome {
    /// Synthesis succeeded and the checkpoint advanced.
    Completed,
    /// A termination request fired; the driver must finalize it.
    Interrupted(TerminationRequest),
    /// Process shutdown; the driver must leave the session recoverable.
    Shutdown,
    /// The checkpoint advance could not be persisted; the session stays
    /// `running` with `recovery_needed` set for the next scan.
    RecoveryDeferred,
}

enum RoundRun {
    Resolved { success_count: u32, failure_count: u32 },
    Abandoned,
    TimedOut,
}

enum FanIn {
    Done(Vec<TaskResult>),
    TimedOut,
    Abandoned,
}

enum TaskResult {
    Success(Contribution),
    Failed(String),
    Cancelled,
}

enum InvokeOutcome {
    Success(ContributionPayload),
    Failed,
    Cancelled,
}

/// Run one sub-problem to completion: rounds until convergence or the round
/// cap, then synthesis and the atomic checkpoint advance.
///
/// `start_round` and `replay` come from recovery: a replayed round first
/// supersedes any stale `in_flight` contributions it left behind.
///
/// # Errors
///
/// Returns `AppError::Quorum` if a round fails to resolve,
/// `AppError::Synthesis` if synthesis exhausts retries, or
/// `AppError::Decomposition` if the sub-problem has no personas assigned.
#[allow(clippy::too_many_lines)] // The round loop is inherently multi-step.
pub async fn run_sub_problem(
    ctx: &SessionContext,
    sub_problem: &SubProblem,
    start_round: u32,
    replay: bool,
) -> Result<SpOutcome> {
    let span = info_span!(
        "sub_problem",
        session_id = %ctx.session_id,
        sp_index = sub_problem.index
    );

    async move {
        let panel = assigned_panel(ctx, sub_problem)?;
        let quorum = ctx.config.quorum_for(panel_size(&panel));
        let mut round = start_round.max(1);
        let mut replay_round = replay;

        loop {
            // ── Clean-boundary polls before each round ───────
            if ctx.shutdown.is_cancelled() {
                return Ok(SpOutcome::Shutdown);
            }
            if let Some(request) = ctx.signal.pending() {
                return Ok(SpOutcome::Interrupted(request));
            }
            if let Some(request) = termination::check_cost_budget(ctx).await? {
                ctx.signal.request(request.clone());
                return Ok(SpOutcome::Interrupted(request));
            }
            if let Some(request) = termination::check_duration_budget(ctx).await? {
                ctx.signal.request(request.clone());
                return Ok(SpOutcome::Interrupted(request));
            }

            // ── Fan out one task per persona ─────────────────
            let run = run_round(ctx, sub_problem, &panel, round, replay_round).await?;
            replay_round = false;

            let (success_count, failure_count) = match run {
                RoundRun::Resolved {
                    success_count,
                    failure_count,
                } => (success_count, failure_count),
                RoundRun::Abandoned => {
                    if let Some(request) = ctx.signal.pending() {
                        return Ok(SpOutcome::Interrupted(request));
                    }
                    return Ok(SpOutcome::Shutdown);
                }
                RoundRun::TimedOut => {
                    return Err(AppError::Quorum(format!(
                        "quorum_not_reached: round {round} of sub-problem {} timed out",
                        sub_problem.index
                    )));
                }
            };

            if success_count < quorum {
                return Err(AppError::Quorum(format!(
                    "quorum_not_reached: {success_count}/{} personas succeeded, need {quorum}",
                    panel.len()
                )));
            }

            ctx.sequencer
                .append(
                    &ctx.session_id,
                    EventType::RoundResolved,
                    json!({
                        "sub_problem_index": sub_problem.index,
                        "round_number": round,
                        "successes": success_count,
                        "failures": failure_count,
                    }),
                )
                .await?;

            // ── Round boundary: finish-round terminations land here ──
            if let Some(request) = ctx.signal.pending() {
                return Ok(SpOutcome::Interrupted(request));
            }

            // ── Continuation decision ────────────────────────
            if round >= ctx.config.round.max_rounds {
                break;
            }
            let contributions = ctx
                .contributions
                .list_for_sub_problem(
                    &ctx.session_id,
                    sub_problem.index,
                    ContributionStatus::InFlight,
                )
                .await?;
            match ctx
                .collaborators
                .convergence
                .should_continue_round(sub_problem.index, round, &contributions)
                .await
            {
                Ok(outcome) => {
                    ctx.record_cost(CostRecord::for_sub_problem(
                        ctx.session_id.clone(),
                        Some(sub_problem.index),
                        outcome.cost,
                        crate::models::cost::CostFeature::Convergence,
                    ))
                    .await;
                    if outcome.should_continue {
                        round += 1;
                        continue;
                    }
                }
                Err(err) => {
                    warn!(%err, "convergence call failed; proceeding to synthesis");
                }
            }
            break;
        }

        // ── Synthesis ────────────────────────────────────────
        if ctx.shutdown.is_cancelled() {
            return Ok(SpOutcome::Shutdown);
        }
        let inputs = ctx
            .contributions
            .list_for_sub_problem(
                &ctx.session_id,
                sub_problem.index,
                ContributionStatus::InFlight,
            )
            .await?;
        let payload = synthesize_with_retry(ctx, sub_problem, &inputs).await?;
        let recommendation = Recommendation::new(
            ctx.session_id.clone(),
            sub_problem.index,
            payload.content.clone(),
        );
        ctx.record_cost(CostRecord::for_recommendation(
            ctx.session_id.clone(),
            recommendation.id.clone(),
            sub_problem.index,
            payload.cost,
        ))
        .await;

        // ── Atomic checkpoint advance ────────────────────────
        let committed = match advance_checkpoint_with_retry(ctx, sub_problem.index, &recommendation)
            .await
        {
            Ok(committed) => committed,
            Err(err) => {
                warn!(%err, "checkpoint advance failed; deferring to recovery");
                return Ok(SpOutcome::RecoveryDeferred);
            }
        };

        ctx.sequencer
            .append(
                &ctx.session_id,
                EventType::SubproblemCompleted,
                json!({
                    "sub_problem_index": sub_problem.index,
                    "recommendation_id": recommendation.id,
                    "committed_contributions": committed,
                }),
            )
            .await?;

        info!(committed, "sub-problem completed");
        Ok(SpOutcome::Completed)
    }
    .instrument(span)
    .await
}

/// Panel assigned by decomposition, truncated to the session's variant size.
fn assigned_panel(ctx: &SessionContext, sub_problem: &SubProblem) -> Result<Vec<String>> {
    if sub_problem.personas.is_empty() {
        return Err(AppError::Decomposition(format!(
            "sub-problem {} has an empty persona set",
            sub_problem.index
        )));
    }
    let size = usize::try_from(ctx.panel_size).unwrap_or(usize::MAX);
    Ok(sub_problem.personas.iter().take(size).cloned().collect())
}

fn panel_size(panel: &[String]) -> u32 {
    u32::try_from(panel.len()).unwrap_or(u32::MAX)
}

/// One concurrent round: spawn persona tasks, wait at the fan-in barrier.
async fn run_round(
    ctx: &SessionContext,
    sub_problem: &SubProblem,
    panel: &[String],
    round: u32,
    replay: bool,
) -> Result<RoundRun> {
    if replay {
        let superseded = ctx
            .contributions
            .supersede_round(&ctx.session_id, sub_problem.index, round)
            .await?;
        if superseded > 0 {
            info!(
                superseded,
                round, "superseded stale in-flight contributions before replay"
            );
        }
    }

    let prior_context: Arc<Vec<Contribution>> = Arc::new(
        ctx.contributions
            .list_for_sub_problem(
                &ctx.session_id,
                sub_problem.index,
                ContributionStatus::InFlight,
            )
            .await?,
    );

    let round_cancel = CancellationToken::new();
    let mut tasks: JoinSet<TaskResult> = JoinSet::new();
    for persona_code in panel {
        let task = PersonaTask {
            ctx: ctx.clone(),
            sub_problem: sub_problem.clone(),
            round,
            persona_code: persona_code.clone(),
            prior_context: Arc::clone(&prior_context),
            round_cancel: round_cancel.clone(),
        };
        let span = info_span!("persona_task", persona_code = %persona_code, round);
        tasks.spawn(run_persona_task(task).instrument(span));
    }

    ctx.sessions
        .record_round(&ctx.session_id, round, panel_size(panel))
        .await?;

    // ── Fan-in barrier ───────────────────────────────────────
    let mut collect = Box::pin(async move {
        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(err) => {
                    warn!(%err, "persona task aborted unexpectedly");
                    results.push(TaskResult::Cancelled);
                }
            }
        }
        results
    });

    let round_timeout = Duration::from_secs(ctx.config.round.round_timeout_seconds);
    let abandon = ctx.signal.abandon_token();
    let shutdown = ctx.shutdown.clone();

    let fan_in = tokio::select! {
        results = &mut collect => FanIn::Done(results),
        () = tokio::time::sleep(round_timeout) => FanIn::TimedOut,
        () = abandon.cancelled() => FanIn::Abandoned,
        () = shutdown.cancelled() => FanIn::Abandoned,
    };

    match fan_in {
        FanIn::Done(results) => {
            let mut success_count = 0u32;
            let mut failure_count = 0u32;
            for result in &results {
                match result {
                    TaskResult::Success(_) => success_count += 1,
                    TaskResult::Failed(persona_code) => {
                        warn!(persona_code = %persona_code, round, "persona task failed");
                        failure_count += 1;
                    }
                    TaskResult::Cancelled => failure_count += 1,
                }
            }
            Ok(RoundRun::Resolved {
                success_count,
                failure_count,
            })
        }
        FanIn::TimedOut => {
            // Signal tasks to wind down, then drain without forcing an
            // abort: a task past its invocation is finishing its write and
            // must not be interrupted mid-write.
            round_cancel.cancel();
            let _ = collect.await;
            Ok(RoundRun::TimedOut)
        }
        FanIn::Abandoned => {
            round_cancel.cancel();
            let _ = collect.await;
            Ok(RoundRun::Abandoned)
        }
    }
}

struct PersonaTask {
    ctx: SessionContext,
    sub_problem: SubProblem,
    round: u32,
    persona_code: String,
    prior_context: Arc<Vec<Contribution>>,
    round_cancel: CancellationToken,
}

/// One persona task: invoke (with retries), then the two-step durable write.
///
/// The write path appends `contribution_started`, writes the contribution as
/// `in_flight`, ledgers the cost, and appends `contribution_complete` — in
/// that order, with no cancellation point in between.
async fn run_persona_task(task: PersonaTask) -> TaskResult {
    let payload = match invoke_with_retries(&task).await {
        InvokeOutcome::Success(payload) => payload,
        InvokeOutcome::Failed => return TaskResult::Failed(task.persona_code),
        InvokeOutcome::Cancelled => return TaskResult::Cancelled,
    };

    let ctx = &task.ctx;
    let contribution = Contribution::new(
        ctx.session_id.clone(),
        task.persona_code.clone(),
        task.sub_problem.index,
        task.round,
        payload.content,
        payload.embedding,
    );

    let started = ctx
        .sequencer
        .append(
            &ctx.session_id,
            EventType::ContributionStarted,
            json!({
                "persona_code": task.persona_code,
                "sub_problem_index": task.sub_problem.index,
                "round_number": task.round,
                "contribution_id": contribution.id,
            }),
        )
        .await;
    if let Err(err) = started {
        warn!(%err, "failed to sequence contribution_started");
        return TaskResult::Failed(task.persona_code);
    }

    if let Err(err) = ctx.contributions.create(&contribution).await {
        warn!(%err, "contribution write failed");
        return TaskResult::Failed(task.persona_code);
    }

    ctx.record_cost(CostRecord::for_contribution(
        ctx.session_id.clone(),
        contribution.id.clone(),
        task.sub_problem.index,
        payload.cost,
    ))
    .await;

    // The contribution is durably in flight; a failed completion event
    // leaves it for recovery rather than undoing the write.
    if let Err(err) = ctx
        .sequencer
        .append(
            &ctx.session_id,
            EventType::ContributionComplete,
            json!({
                "persona_code": task.persona_code,
                "sub_problem_index": task.sub_problem.index,
                "round_number": task.round,
                "contribution_id": contribution.id,
            }),
        )
        .await
    {
        warn!(%err, "failed to sequence contribution_complete");
    }

    TaskResult::Success(contribution)
}

/// Invoke the persona with per-attempt timeout and bounded linear backoff.
///
/// Cancellation is honored between attempts and during the invocation
/// itself, never after a successful payload is returned.
async fn invoke_with_retries(task: &PersonaTask) -> InvokeOutcome {
    let ctx = &task.ctx;
    let per_attempt = Duration::from_secs(ctx.config.round.persona_timeout_seconds);
    let retry_limit = ctx.config.round.persona_retry_limit;
    let mut attempt = 0u32;

    loop {
        if task.round_cancel.is_cancelled() {
            return InvokeOutcome::Cancelled;
        }
        attempt += 1;

        let invocation = ctx.collaborators.personas.invoke_persona(
            &ctx.session_id,
            &task.sub_problem,
            task.round,
            &task.persona_code,
            &task.prior_context,
        );

        let outcome = tokio::select! {
            () = task.round_cancel.cancelled() => return InvokeOutcome::Cancelled,
            outcome = tokio::time::timeout(per_attempt, invocation) => outcome,
        };

        match outcome {
            Ok(Ok(payload)) => return InvokeOutcome::Success(payload),
            Ok(Err(err)) => {
                warn!(attempt, %err, "persona invocation failed");
            }
            Err(_elapsed) => {
                warn!(attempt, "persona invocation timed out");
            }
        }

        if attempt > retry_limit {
            return InvokeOutcome::Failed;
        }

        let backoff =
            Duration::from_millis(ctx.config.round.retry_backoff_ms * u64::from(attempt));
        tokio::select! {
            () = task.round_cancel.cancelled() => return InvokeOutcome::Cancelled,
            () = tokio::time::sleep(backoff) => {}
        }
    }
}

/// Synthesis with bounded retries; exhaustion fails the session.
async fn synthesize_with_retry(
    ctx: &SessionContext,
    sub_problem: &SubProblem,
    contributions: &[Contribution],
) -> Result<RecommendationPayload> {
    let retry_limit = ctx.config.round.persona_retry_limit;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match ctx
            .collaborators
            .synthesizer
            .synthesize(sub_problem.index, contributions)
            .await
        {
            Ok(payload) => return Ok(payload),
            Err(err) if attempt <= retry_limit => {
                warn!(attempt, %err, "synthesis failed, retrying");
                let backoff =
                    Duration::from_millis(ctx.config.round.retry_backoff_ms * u64::from(attempt));
                tokio::time::sleep(backoff).await;
            }
            Err(err) => {
                return Err(AppError::Synthesis(format!(
                    "synthesis_failed: sub-problem {}: {err}",
                    sub_problem.index
                )));
            }
        }
    }
}

/// Retry the checkpoint-advance transaction; on exhaustion leave the session
/// `running` with `recovery_needed` so the next scan picks it up.
async fn advance_checkpoint_with_retry(
    ctx: &SessionContext,
    sub_problem_index: u32,
    recommendation: &Recommendation,
) -> Result<u64> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match ctx
            .sessions
            .advance_checkpoint(&ctx.session_id, sub_problem_index, recommendation)
            .await
        {
            Ok(committed) => return Ok(committed),
            Err(err) if attempt < CHECKPOINT_RETRIES => {
                warn!(attempt, %err, "checkpoint advance failed, retrying");
                tokio::time::sleep(Duration::from_millis(
                    ctx.config.round.retry_backoff_ms * u64::from(attempt),
                ))
                .await;
            }
            Err(err) => {
                if let Err(flag_err) = ctx
                    .sessions
                    .set_recovery_needed(&ctx.session_id, true)
                    .await
                {
                    warn!(%flag_err, "failed to flag recovery_needed");
                }
                return Err(err);
            }
        }
    }
}
