//! Contribution model: one persona's output for one (sub-problem, round).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Write status of a contribution.
///
/// Status only ever leaves `InFlight`; a contribution never re-enters it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContributionStatus {
    /// Written by a persona task, not yet confirmed by a checkpoint.
    InFlight,
    /// Confirmed by the sub-problem's checkpoint advance.
    Committed,
    /// Superseded or abandoned; never part of a synthesis.
    RolledBack,
}

/// Contribution domain entity persisted in `SQLite`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Contribution {
    /// Unique record identifier.
    pub id: String,
    /// Owning session identifier.
    pub session_id: String,
    /// Persona that produced this contribution.
    pub persona_code: String,
    /// Sub-problem the contribution belongs to.
    pub sub_problem_index: u32,
    /// Round within the sub-problem.
    pub round_number: u32,
    /// Write status.
    pub status: ContributionStatus,
    /// Opaque contribution payload.
    pub content: String,
    /// Optional embedding vector for downstream dedup/similarity.
    pub embedding: Option<Vec<f32>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Contribution {
    /// Construct a new in-flight contribution.
    #[must_use]
    pub fn new(
        session_id: String,
        persona_code: String,
        sub_problem_index: u32,
        round_number: u32,
        content: String,
        embedding: Option<Vec<f32>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id,
            persona_code,
            sub_problem_index,
            round_number,
            status: ContributionStatus::InFlight,
            content,
            embedding,
            created_at: Utc::now(),
        }
    }
}

/// Per-sub-problem synthesis output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Recommendation {
    /// Unique record identifier.
    pub id: String,
    /// Owning session identifier.
    pub session_id: String,
    /// Sub-problem this recommendation synthesizes.
    pub sub_problem_index: u32,
    /// Opaque synthesis payload.
    pub content: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Recommendation {
    /// Construct a new recommendation.
    #[must_use]
    pub fn new(session_id: String, sub_problem_index: u32, content: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id,
            sub_problem_index,
            content,
            created_at: Utc::now(),
        }
    }
}
