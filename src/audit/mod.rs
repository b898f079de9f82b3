//! Structured audit logging for session kill events.
//!
//! Provides the [`KillAuditLogger`] trait and associated types. The primary
//! implementation, [`JsonlAuditWriter`], appends JSONL records to
//! daily-rotating files in the configured audit directory.

pub mod writer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::session::TerminationType;

/// A structured record of a session kill or termination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillAuditEntry {
    /// ISO 8601 timestamp with timezone.
    pub timestamp: DateTime<Utc>,
    /// Session that was ended.
    pub session_id: String,
    /// Who triggered the kill: an operator id, or `system` for budget kills.
    pub actor: String,
    /// How the session was ended.
    pub termination_type: TerminationType,
    /// Free-text reason supplied with the termination.
    pub reason: Option<String>,
    /// Aggregate session cost at kill time.
    pub cost_at_kill: f64,
    /// Billable fraction settled for the session.
    pub billable_portion: f64,
}

impl KillAuditEntry {
    /// Construct an audit entry for a kill at the current instant.
    #[must_use]
    pub fn new(
        session_id: String,
        actor: String,
        termination_type: TerminationType,
        reason: Option<String>,
        cost_at_kill: f64,
        billable_portion: f64,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            session_id,
            actor,
            termination_type,
            reason,
            cost_at_kill,
            billable_portion,
        }
    }
}

/// Writes kill audit entries to a persistent store.
///
/// Implementations must be [`Send`] and [`Sync`] to allow sharing across
/// async task boundaries via [`std::sync::Arc`].
pub trait KillAuditLogger: Send + Sync {
    /// Record a single audit entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying write operation fails.
    fn log_entry(&self, entry: KillAuditEntry) -> crate::Result<()>;
}

pub use writer::JsonlAuditWriter;
