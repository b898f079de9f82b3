//! Ordered session event stream types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classification of an event within the single ordered stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    /// Phase transitions, checkpoints, terminations.
    Lifecycle,
    /// Contribution and round progress.
    Work,
}

/// Event type within a session's ordered stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Session entered `running`.
    SessionStarted,
    /// Session paused by operator.
    SessionPaused,
    /// Session resumed from pause.
    SessionResumed,
    /// A persona task began work on a contribution.
    ContributionStarted,
    /// A persona task durably wrote its contribution.
    ContributionComplete,
    /// A round reached quorum.
    RoundResolved,
    /// A sub-problem's synthesis succeeded and the checkpoint advanced.
    SubproblemCompleted,
    /// All sub-problems completed; session is done.
    SessionCompleted,
    /// Session hit an unrecoverable error.
    SessionFailed,
    /// Session ended early by user or blocker, with partial credit.
    SessionTerminated,
    /// Session force-killed by admin or budget limit.
    SessionKilled,
    /// Session soft-deleted.
    SessionDeleted,
}

impl EventType {
    /// Which class of the stream this event belongs to.
    #[must_use]
    pub fn class(self) -> EventClass {
        match self {
            Self::ContributionStarted | Self::ContributionComplete | Self::RoundResolved => {
                EventClass::Work
            }
            _ => EventClass::Lifecycle,
        }
    }
}

/// One entry in a session's append-only, gap-free event stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct SessionEvent {
    /// Owning session identifier.
    pub session_id: String,
    /// Strictly increasing, gap-free per session; assigned at durable append.
    pub sequence: i64,
    /// Event classification.
    pub event_type: EventType,
    /// Event payload.
    pub payload: serde_json::Value,
    /// Append timestamp.
    pub created_at: DateTime<Utc>,
}
