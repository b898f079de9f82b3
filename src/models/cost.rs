//! Cost attribution ledger entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which external call a cost record pays for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CostFeature {
    /// Problem decomposition at session start.
    Decomposition,
    /// A persona contribution call.
    Contribution,
    /// A round-continuation convergence call.
    Convergence,
    /// A per-sub-problem synthesis call.
    Synthesis,
}

/// Immutable ledger entry: exactly one per external call.
///
/// Tagged with the most specific entity available — `contribution_id` when
/// the call produced a contribution, `recommendation_id` for synthesis calls,
/// otherwise just the sub-problem index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct CostRecord {
    /// Unique record identifier.
    pub id: String,
    /// Owning session identifier.
    pub session_id: String,
    /// Contribution the call produced, if any.
    pub contribution_id: Option<String>,
    /// Recommendation the call produced, if any.
    pub recommendation_id: Option<String>,
    /// Sub-problem the call worked on, when known.
    pub sub_problem_index: Option<u32>,
    /// Cost amount in account currency units.
    pub amount: f64,
    /// Which feature incurred the cost.
    pub feature: CostFeature,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl CostRecord {
    /// Ledger entry for a persona contribution call.
    #[must_use]
    pub fn for_contribution(
        session_id: String,
        contribution_id: String,
        sub_problem_index: u32,
        amount: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id,
            contribution_id: Some(contribution_id),
            recommendation_id: None,
            sub_problem_index: Some(sub_problem_index),
            amount,
            feature: CostFeature::Contribution,
            created_at: Utc::now(),
        }
    }

    /// Ledger entry for a synthesis call.
    #[must_use]
    pub fn for_recommendation(
        session_id: String,
        recommendation_id: String,
        sub_problem_index: u32,
        amount: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id,
            contribution_id: None,
            recommendation_id: Some(recommendation_id),
            sub_problem_index: Some(sub_problem_index),
            amount,
            feature: CostFeature::Synthesis,
            created_at: Utc::now(),
        }
    }

    /// Ledger entry attributable only to a sub-problem (or the session).
    #[must_use]
    pub fn for_sub_problem(
        session_id: String,
        sub_problem_index: Option<u32>,
        amount: f64,
        feature: CostFeature,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id,
            contribution_id: None,
            recommendation_id: None,
            sub_problem_index,
            amount,
            feature,
            created_at: Utc::now(),
        }
    }
}
