//! Append-only event log repository for `SQLite` persistence.
//!
//! Sequence numbers are assigned inside the insert transaction, never
//! pre-assigned — a failed write can never consume a number, so readers
//! backfilling from any point always see a gap-free prefix.

use std::sync::Arc;

use chrono::Utc;

use crate::models::event::{EventType, SessionEvent};
use crate::{AppError, Result};

use super::db::Database;

/// Repository wrapper around `SQLite` for event records.
#[derive(Clone)]
pub struct EventRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct EventRow {
    session_id: String,
    sequence: i64,
    event_type: String,
    payload: String,
    created_at: String,
}

impl EventRow {
    /// Convert a database row into the domain model.
    fn into_event(self) -> Result<SessionEvent> {
        let event_type = parse_event_type(&self.event_type)?;
        let payload = serde_json::from_str(&self.payload)
            .map_err(|e| AppError::Db(format!("invalid event payload: {e}")))?;
        let created_at = chrono::DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| AppError::Db(format!("invalid created_at: {e}")))?
            .with_timezone(&Utc);

        Ok(SessionEvent {
            session_id: self.session_id,
            sequence: self.sequence,
            event_type,
            payload,
            created_at,
        })
    }
}

fn parse_event_type(s: &str) -> Result<EventType> {
    match s {
        "session_started" => Ok(EventType::SessionStarted),
        "session_paused" => Ok(EventType::SessionPaused),
        "session_resumed" => Ok(EventType::SessionResumed),
        "contribution_started" => Ok(EventType::ContributionStarted),
        "contribution_complete" => Ok(EventType::ContributionComplete),
        "round_resolved" => Ok(EventType::RoundResolved),
        "subproblem_completed" => Ok(EventType::SubproblemCompleted),
        "session_completed" => Ok(EventType::SessionCompleted),
        "session_failed" => Ok(EventType::SessionFailed),
        "session_terminated" => Ok(EventType::SessionTerminated),
        "session_killed" => Ok(EventType::SessionKilled),
        "session_deleted" => Ok(EventType::SessionDeleted),
        other => Err(AppError::Db(format!("invalid event type: {other}"))),
    }
}

pub(crate) fn event_type_str(t: EventType) -> &'static str {
    match t {
        EventType::SessionStarted => "session_started",
        EventType::SessionPaused => "session_paused",
        EventType::SessionResumed => "session_resumed",
        EventType::ContributionStarted => "contribution_started",
        EventType::ContributionComplete => "contribution_complete",
        EventType::RoundResolved => "round_resolved",
        EventType::SubproblemCompleted => "subproblem_completed",
        EventType::SessionCompleted => "session_completed",
        EventType::SessionFailed => "session_failed",
        EventType::SessionTerminated => "session_terminated",
        EventType::SessionKilled => "session_killed",
        EventType::SessionDeleted => "session_deleted",
    }
}

impl EventRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Durably append an event, assigning the next sequence number inside
    /// the insert transaction.
    ///
    /// The `PRIMARY KEY (session_id, sequence)` constraint backs the
    /// assignment: a concurrent writer for the same session would collide
    /// rather than silently reorder. Callers serialize appends per session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the transaction fails; no sequence number
    /// is consumed in that case.
    pub async fn append(
        &self,
        session_id: &str,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<SessionEvent> {
        let payload_text = serde_json::to_string(&payload)
            .map_err(|e| AppError::Db(format!("failed to serialize payload: {e}")))?;
        let now = Utc::now();

        let mut tx = self.db.begin().await?;

        let (last,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(sequence), 0) FROM event WHERE session_id = ?1",
        )
        .bind(session_id)
        .fetch_one(&mut *tx)
        .await?;
        let sequence = last + 1;

        sqlx::query(
            "INSERT INTO event (session_id, sequence, event_type, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(session_id)
        .bind(sequence)
        .bind(event_type_str(event_type))
        .bind(&payload_text)
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(SessionEvent {
            session_id: session_id.to_owned(),
            sequence,
            event_type,
            payload,
            created_at: now,
        })
    }

    /// List all events with `sequence > from_sequence`, in order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_after(
        &self,
        session_id: &str,
        from_sequence: i64,
    ) -> Result<Vec<SessionEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT * FROM event WHERE session_id = ?1 AND sequence > ?2 ORDER BY sequence",
        )
        .bind(session_id)
        .bind(from_sequence)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(EventRow::into_event).collect()
    }

    /// Highest assigned sequence number for a session (0 if none).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn last_sequence(&self, session_id: &str) -> Result<i64> {
        let (last,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(sequence), 0) FROM event WHERE session_id = ?1",
        )
        .bind(session_id)
        .fetch_one(self.db.as_ref())
        .await?;
        Ok(last)
    }

    /// Delete all events for a session (retention purge).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete_for_session(&self, session_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM event WHERE session_id = ?1")
            .bind(session_id)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }
}
