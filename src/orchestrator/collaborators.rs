//! Opaque external collaborator seams.
//!
//! The engine never interprets persona or synthesis content; it drives these
//! calls, ledgers their cost, and persists their output. Deterministic stub
//! implementations live with the tests.

use async_trait::async_trait;

use crate::models::contribution::Contribution;
use crate::models::session::SubProblem;
use crate::Result;

/// Payload returned by a successful persona invocation.
#[derive(Debug, Clone)]
pub struct ContributionPayload {
    /// Opaque contribution content.
    pub content: String,
    /// Optional embedding vector for downstream dedup/similarity.
    pub embedding: Option<Vec<f32>>,
    /// Cost of the call, ledgered against the contribution.
    pub cost: f64,
}

/// Payload returned by a successful synthesis call.
#[derive(Debug, Clone)]
pub struct RecommendationPayload {
    /// Opaque synthesis content.
    pub content: String,
    /// Cost of the call, ledgered against the recommendation.
    pub cost: f64,
}

/// Output of the decomposition call.
#[derive(Debug, Clone)]
pub struct DecompositionOutcome {
    /// Ordered sub-problem specs, each with its persona panel.
    pub sub_problems: Vec<SubProblem>,
    /// Cost of the call, ledgered against the session.
    pub cost: f64,
}

/// Output of the round-continuation convergence call.
#[derive(Debug, Clone)]
pub struct ConvergenceOutcome {
    /// Whether another round should run for this sub-problem.
    pub should_continue: bool,
    /// Cost of the call, ledgered against the sub-problem.
    pub cost: f64,
}

/// Invokes one persona for one (sub-problem, round).
#[async_trait]
pub trait PersonaInvoker: Send + Sync {
    /// Produce a contribution payload, or fail.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Persona` on invocation failure; the scheduler
    /// retries transient failures with bounded backoff.
    async fn invoke_persona(
        &self,
        session_id: &str,
        sub_problem: &SubProblem,
        round_number: u32,
        persona_code: &str,
        prior_context: &[Contribution],
    ) -> Result<ContributionPayload>;
}

/// Decomposes a problem statement into ordered sub-problem specs.
#[async_trait]
pub trait Decomposer: Send + Sync {
    /// Decompose the problem. Called once at session start.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Decomposition` on failure; decomposition failure
    /// is fatal to the session.
    async fn decompose(&self, problem_statement: &str) -> Result<DecompositionOutcome>;
}

/// Decides whether a sub-problem needs another round.
#[async_trait]
pub trait ConvergenceSignal: Send + Sync {
    /// Inspect the contributions so far and decide continuation.
    ///
    /// # Errors
    ///
    /// Returns an error if the decision call fails; treated as transient.
    async fn should_continue_round(
        &self,
        sub_problem_index: u32,
        round_number: u32,
        contributions: &[Contribution],
    ) -> Result<ConvergenceOutcome>;
}

/// Synthesizes a sub-problem's contributions into a recommendation.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Produce the per-sub-problem recommendation payload.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Synthesis` on failure; the scheduler retries with
    /// bounded backoff before failing the session.
    async fn synthesize(
        &self,
        sub_problem_index: u32,
        contributions: &[Contribution],
    ) -> Result<RecommendationPayload>;
}

/// The full set of external collaborators the engine drives.
pub struct Collaborators {
    /// Persona invocation seam.
    pub personas: std::sync::Arc<dyn PersonaInvoker>,
    /// Decomposition seam.
    pub decomposer: std::sync::Arc<dyn Decomposer>,
    /// Round-continuation seam.
    pub convergence: std::sync::Arc<dyn ConvergenceSignal>,
    /// Synthesis seam.
    pub synthesizer: std::sync::Arc<dyn Synthesizer>,
}
