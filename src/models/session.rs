//! Session model and lifecycle helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status for a deliberation session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Session created but not yet started.
    Created,
    /// Session actively driven by exactly one driver task.
    Running,
    /// Session paused by operator.
    Paused,
    /// All sub-problems synthesized successfully.
    Completed,
    /// Session hit an unrecoverable error.
    Failed,
    /// Session force-killed by an administrator or a budget limit.
    Killed,
    /// Session ended early by the user or a blocker, with partial credit.
    Terminated,
    /// Session soft-deleted; data retained until the purge removes it.
    Deleted,
}

impl SessionStatus {
    /// Whether no further deliberation can happen in this status.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Killed | Self::Terminated | Self::Deleted
        )
    }
}

/// How a session was ended before natural completion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TerminationType {
    /// A blocker was identified mid-flight.
    BlockerIdentified,
    /// The user cancelled the session.
    UserCancelled,
    /// The user asked for best-effort settlement of work done so far.
    ContinueBestEffort,
    /// An administrator forced the kill.
    AdminTerminated,
    /// The hard cost budget was exceeded.
    CostExceeded,
    /// The hard duration budget was exceeded.
    DurationExceeded,
}

impl TerminationType {
    /// Terminal status the session lands in for this termination type.
    #[must_use]
    pub fn terminal_status(self) -> SessionStatus {
        match self {
            Self::BlockerIdentified | Self::UserCancelled | Self::ContinueBestEffort => {
                SessionStatus::Terminated
            }
            Self::AdminTerminated | Self::CostExceeded | Self::DurationExceeded => {
                SessionStatus::Killed
            }
        }
    }

    /// Whether the in-flight round is abandoned immediately rather than
    /// allowed to finish at the next clean boundary.
    #[must_use]
    pub fn abandons_round(self) -> bool {
        matches!(
            self,
            Self::AdminTerminated | Self::CostExceeded | Self::DurationExceeded
        )
    }
}

/// Panel-size experiment variant, fixed when the session is created.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PersonaVariant {
    /// Three-persona panel.
    Three,
    /// Five-persona panel.
    Five,
}

impl PersonaVariant {
    /// Number of personas fanned out per round.
    #[must_use]
    pub fn panel_size(self) -> u32 {
        match self {
            Self::Three => 3,
            Self::Five => 5,
        }
    }
}

/// One decomposed unit of the problem, processed sequentially.
///
/// Produced by the decomposition collaborator at session start and persisted
/// so a resumed driver can re-invoke personas without re-decomposing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SubProblem {
    /// Position within the session, 0-based.
    pub index: u32,
    /// The sub-problem statement handed to personas.
    pub statement: String,
    /// Persona codes assigned to this sub-problem's panel.
    pub personas: Vec<String>,
}

/// Session domain entity persisted in `SQLite`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Session {
    /// Unique record identifier.
    pub id: String,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Problem statement handed to decomposition.
    pub problem_statement: String,
    /// Panel-size variant; never re-randomized mid-session.
    pub persona_variant: PersonaVariant,
    /// Round currently (or last) in flight for the active sub-problem.
    pub round_number: u32,
    /// Number of sub-problems produced by decomposition; 0 before it runs.
    pub total_sub_problems: u32,
    /// Durable recovery anchor: highest fully-synthesized sub-problem index.
    pub last_completed_sp_index: Option<u32>,
    /// Timestamp of the last checkpoint advance.
    pub sp_checkpoint_at: Option<DateTime<Utc>>,
    /// Set when a crash or failed checkpoint left the session inconsistent.
    pub recovery_needed: bool,
    /// Set when a cost write failed and the ledger is incomplete.
    pub has_untracked_costs: bool,
    /// When the session reached a terminal status.
    pub terminated_at: Option<DateTime<Utc>>,
    /// How the session was ended, if ended early.
    pub termination_type: Option<TerminationType>,
    /// Free-text reason supplied with the termination.
    pub termination_reason: Option<String>,
    /// Human-readable reason for `failed` sessions.
    pub failure_reason: Option<String>,
    /// Fraction of planned work completed, for prorated billing.
    pub billable_portion: Option<f64>,
    /// Personas assigned to the panel.
    pub expert_count: u32,
    /// Committed contributions across all sub-problems.
    pub contribution_count: u32,
    /// Focus areas (sub-problems) produced by decomposition.
    pub focus_area_count: u32,
    /// Persona tasks launched over the session's lifetime.
    pub task_count: u32,
    /// Running cost aggregate from the ledger.
    pub total_cost: f64,
    /// Resume attempts consumed by recovery.
    pub resume_attempts: u32,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
    /// When the session first entered `running` (for the duration budget).
    pub started_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Construct a new session with a generated identifier.
    #[must_use]
    pub fn new(problem_statement: String, persona_variant: PersonaVariant) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), problem_statement, persona_variant)
    }

    /// Construct a new session with a caller-supplied identifier.
    #[must_use]
    pub fn with_id(id: String, problem_statement: String, persona_variant: PersonaVariant) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: SessionStatus::Created,
            problem_statement,
            persona_variant,
            round_number: 0,
            total_sub_problems: 0,
            last_completed_sp_index: None,
            sp_checkpoint_at: None,
            recovery_needed: false,
            has_untracked_costs: false,
            terminated_at: None,
            termination_type: None,
            termination_reason: None,
            failure_reason: None,
            billable_portion: None,
            expert_count: persona_variant.panel_size(),
            contribution_count: 0,
            focus_area_count: 0,
            task_count: 0,
            total_cost: 0.0,
            resume_attempts: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
        }
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(
            (self.status, next),
            (
                SessionStatus::Created | SessionStatus::Paused,
                SessionStatus::Running
            ) | (
                SessionStatus::Running,
                SessionStatus::Paused
                    | SessionStatus::Completed
                    | SessionStatus::Failed
                    | SessionStatus::Killed
                    | SessionStatus::Terminated
            ) | (
                SessionStatus::Paused,
                SessionStatus::Failed | SessionStatus::Killed | SessionStatus::Terminated
            ) | (
                SessionStatus::Completed
                    | SessionStatus::Failed
                    | SessionStatus::Killed
                    | SessionStatus::Terminated,
                SessionStatus::Deleted
            )
        )
    }

    /// Index of the next sub-problem the driver should work on.
    #[must_use]
    pub fn next_sp_index(&self) -> u32 {
        self.last_completed_sp_index.map_or(0, |i| i + 1)
    }

    /// Count of sub-problems fully synthesized, from the checkpoint anchor.
    #[must_use]
    pub fn completed_sp_count(&self) -> u32 {
        self.last_completed_sp_index.map_or(0, |i| i + 1)
    }
}
