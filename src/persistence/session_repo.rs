//! Session repository for `SQLite` persistence.
//!
//! Owns the session's lifecycle writes, the compare-and-swap `running` lock,
//! and the atomic checkpoint-advance transaction.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::contribution::Recommendation;
use crate::models::session::{PersonaVariant, Session, SessionStatus, SubProblem, TerminationType};
use crate::{AppError, Result};

use super::db::Database;

/// Repository wrapper around `SQLite` for session records.
#[derive(Clone)]
pub struct SessionRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    status: String,
    problem_statement: String,
    persona_variant: i64,
    round_number: i64,
    total_sub_problems: i64,
    last_completed_sp_index: Option<i64>,
    sp_checkpoint_at: Option<String>,
    recovery_needed: bool,
    has_untracked_costs: bool,
    terminated_at: Option<String>,
    termination_type: Option<String>,
    termination_reason: Option<String>,
    failure_reason: Option<String>,
    billable_portion: Option<f64>,
    expert_count: i64,
    contribution_count: i64,
    focus_area_count: i64,
    task_count: i64,
    total_cost: f64,
    resume_attempts: i64,
    created_at: String,
    updated_at: String,
    started_at: Option<String>,
}

impl SessionRow {
    /// Convert a database row into the domain model.
    fn into_session(self) -> Result<Session> {
        let status = parse_status(&self.status)?;
        let termination_type = self
            .termination_type
            .as_deref()
            .map(parse_termination_type)
            .transpose()?;
        Ok(Session {
            id: self.id,
            status,
            problem_statement: self.problem_statement,
            persona_variant: parse_variant(self.persona_variant)?,
            round_number: to_u32(self.round_number, "round_number")?,
            total_sub_problems: to_u32(self.total_sub_problems, "total_sub_problems")?,
            last_completed_sp_index: self
                .last_completed_sp_index
                .map(|v| to_u32(v, "last_completed_sp_index"))
                .transpose()?,
            sp_checkpoint_at: self
                .sp_checkpoint_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
            recovery_needed: self.recovery_needed,
            has_untracked_costs: self.has_untracked_costs,
            terminated_at: self
                .terminated_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
            termination_type,
            termination_reason: self.termination_reason,
            failure_reason: self.failure_reason,
            billable_portion: self.billable_portion,
            expert_count: to_u32(self.expert_count, "expert_count")?,
            contribution_count: to_u32(self.contribution_count, "contribution_count")?,
            focus_area_count: to_u32(self.focus_area_count, "focus_area_count")?,
            task_count: to_u32(self.task_count, "task_count")?,
            total_cost: self.total_cost,
            resume_attempts: to_u32(self.resume_attempts, "resume_attempts")?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            started_at: self
                .started_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
        })
    }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid timestamp: {e}")))
}

fn to_u32(value: i64, field: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| AppError::Db(format!("invalid {field}: {value}")))
}

fn parse_status(s: &str) -> Result<SessionStatus> {
    match s {
        "created" => Ok(SessionStatus::Created),
        "running" => Ok(SessionStatus::Running),
        "paused" => Ok(SessionStatus::Paused),
        "completed" => Ok(SessionStatus::Completed),
        "failed" => Ok(SessionStatus::Failed),
        "killed" => Ok(SessionStatus::Killed),
        "terminated" => Ok(SessionStatus::Terminated),
        "deleted" => Ok(SessionStatus::Deleted),
        other => Err(AppError::Db(format!("invalid session status: {other}"))),
    }
}

pub(crate) fn status_str(s: SessionStatus) -> &'static str {
    match s {
        SessionStatus::Created => "created",
        SessionStatus::Running => "running",
        SessionStatus::Paused => "paused",
        SessionStatus::Completed => "completed",
        SessionStatus::Failed => "failed",
        SessionStatus::Killed => "killed",
        SessionStatus::Terminated => "terminated",
        SessionStatus::Deleted => "deleted",
    }
}

fn parse_termination_type(s: &str) -> Result<TerminationType> {
    match s {
        "blocker_identified" => Ok(TerminationType::BlockerIdentified),
        "user_cancelled" => Ok(TerminationType::UserCancelled),
        "continue_best_effort" => Ok(TerminationType::ContinueBestEffort),
        "admin_terminated" => Ok(TerminationType::AdminTerminated),
        "cost_exceeded" => Ok(TerminationType::CostExceeded),
        "duration_exceeded" => Ok(TerminationType::DurationExceeded),
        other => Err(AppError::Db(format!("invalid termination type: {other}"))),
    }
}

pub(crate) fn termination_type_str(t: TerminationType) -> &'static str {
    match t {
        TerminationType::BlockerIdentified => "blocker_identified",
        TerminationType::UserCancelled => "user_cancelled",
        TerminationType::ContinueBestEffort => "continue_best_effort",
        TerminationType::AdminTerminated => "admin_terminated",
        TerminationType::CostExceeded => "cost_exceeded",
        TerminationType::DurationExceeded => "duration_exceeded",
    }
}

fn parse_variant(v: i64) -> Result<PersonaVariant> {
    match v {
        3 => Ok(PersonaVariant::Three),
        5 => Ok(PersonaVariant::Five),
        other => Err(AppError::Db(format!("invalid persona variant: {other}"))),
    }
}

impl SessionRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new session record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the database insert fails.
    pub async fn create(&self, session: &Session) -> Result<Session> {
        sqlx::query(
            "INSERT INTO session (id, status, problem_statement, persona_variant, round_number,
             total_sub_problems, last_completed_sp_index, sp_checkpoint_at, recovery_needed,
             has_untracked_costs, terminated_at, termination_type, termination_reason,
             failure_reason, billable_portion, expert_count, contribution_count,
             focus_area_count, task_count, total_cost, resume_attempts, created_at,
             updated_at, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
             ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)",
        )
        .bind(&session.id)
        .bind(status_str(session.status))
        .bind(&session.problem_statement)
        .bind(i64::from(session.persona_variant.panel_size()))
        .bind(i64::from(session.round_number))
        .bind(i64::from(session.total_sub_problems))
        .bind(session.last_completed_sp_index.map(i64::from))
        .bind(session.sp_checkpoint_at.map(|dt| dt.to_rfc3339()))
        .bind(session.recovery_needed)
        .bind(session.has_untracked_costs)
        .bind(session.terminated_at.map(|dt| dt.to_rfc3339()))
        .bind(session.termination_type.map(termination_type_str))
        .bind(&session.termination_reason)
        .bind(&session.failure_reason)
        .bind(session.billable_portion)
        .bind(i64::from(session.expert_count))
        .bind(i64::from(session.contribution_count))
        .bind(i64::from(session.focus_area_count))
        .bind(i64::from(session.task_count))
        .bind(session.total_cost)
        .bind(i64::from(session.resume_attempts))
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .bind(session.started_at.map(|dt| dt.to_rfc3339()))
        .execute(self.db.as_ref())
        .await?;

        Ok(session.clone())
    }

    /// Retrieve a session by identifier.
    ///
    /// Returns `Ok(None)` if the session does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as("SELECT * FROM session WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;

        row.map(SessionRow::into_session).transpose()
    }

    /// Retrieve a session by identifier, failing if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist.
    pub async fn require(&self, id: &str) -> Result<Session> {
        self.get_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session {id} not found")))
    }

    /// Compare-and-swap transition into `running`.
    ///
    /// Returns `true` if this caller won the lock. A `false` return means
    /// another driver holds the session (or it is already terminal) and the
    /// caller must not proceed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn try_acquire_running(&self, id: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE session SET status = 'running',
             started_at = COALESCE(started_at, ?1), updated_at = ?1
             WHERE id = ?2 AND status IN ('created', 'paused')",
        )
        .bind(&now)
        .bind(id)
        .execute(self.db.as_ref())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Update session status, respecting the state machine.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the transition is not
    /// permitted, or `AppError::Db` if persistence fails.
    pub async fn update_status(&self, id: &str, status: SessionStatus) -> Result<Session> {
        let current = self.require(id).await?;
        if !current.can_transition_to(status) {
            return Err(AppError::InvalidTransition(format!(
                "{} -> {}",
                status_str(current.status),
                status_str(status)
            )));
        }

        sqlx::query("UPDATE session SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status_str(status))
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(self.db.as_ref())
            .await?;

        self.require(id).await
    }

    /// Record decomposition output: persist the sub-problem specs and update
    /// the session's sub-problem and focus-area counts, in one transaction.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if any statement fails.
    pub async fn set_decomposed(&self, id: &str, sub_problems: &[SubProblem]) -> Result<()> {
        let total = u32::try_from(sub_problems.len())
            .map_err(|_| AppError::Db("sub-problem count overflow".into()))?;
        let now = Utc::now().to_rfc3339();

        let mut tx = self.db.begin().await?;

        for sp in sub_problems {
            let personas = serde_json::to_string(&sp.personas)
                .map_err(|e| AppError::Db(format!("failed to serialize personas: {e}")))?;
            sqlx::query(
                "INSERT INTO sub_problem (session_id, sub_problem_index, statement, personas,
                 created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(id)
            .bind(i64::from(sp.index))
            .bind(&sp.statement)
            .bind(&personas)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "UPDATE session SET total_sub_problems = ?1, focus_area_count = ?1,
             updated_at = ?2 WHERE id = ?3",
        )
        .bind(i64::from(total))
        .bind(&now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Load the persisted sub-problem specs for a session, in order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn load_sub_problems(&self, id: &str) -> Result<Vec<SubProblem>> {
        let rows: Vec<(i64, String, String)> = sqlx::query_as(
            "SELECT sub_problem_index, statement, personas FROM sub_problem
             WHERE session_id = ?1 ORDER BY sub_problem_index",
        )
        .bind(id)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter()
            .map(|(index, statement, personas)| {
                Ok(SubProblem {
                    index: to_u32(index, "sub_problem_index")?,
                    statement,
                    personas: serde_json::from_str(&personas)
                        .map_err(|e| AppError::Db(format!("invalid personas: {e}")))?,
                })
            })
            .collect()
    }

    /// Delete all sub-problem specs for a session (retention purge).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete_sub_problems(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sub_problem WHERE session_id = ?1")
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Record the current round number and newly launched persona tasks.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn record_round(&self, id: &str, round_number: u32, new_tasks: u32) -> Result<()> {
        sqlx::query(
            "UPDATE session SET round_number = ?1, task_count = task_count + ?2,
             updated_at = ?3 WHERE id = ?4",
        )
        .bind(i64::from(round_number))
        .bind(i64::from(new_tasks))
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Flag the session as having costs the ledger failed to record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn flag_untracked_costs(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE session SET has_untracked_costs = 1, updated_at = ?1 WHERE id = ?2")
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Set or clear the `recovery_needed` flag.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn set_recovery_needed(&self, id: &str, needed: bool) -> Result<()> {
        sqlx::query("UPDATE session SET recovery_needed = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(needed)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Increment and return the session's resume-attempt counter.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn increment_resume_attempts(&self, id: &str) -> Result<u32> {
        sqlx::query(
            "UPDATE session SET resume_attempts = resume_attempts + 1, updated_at = ?1
             WHERE id = ?2",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(self.db.as_ref())
        .await?;

        Ok(self.require(id).await?.resume_attempts)
    }

    /// Refresh the session's running cost aggregate.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn set_total_cost(&self, id: &str, total_cost: f64) -> Result<()> {
        sqlx::query("UPDATE session SET total_cost = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(total_cost)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Transition the session to `failed` with a human-readable reason.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the session cannot fail from
    /// its current status, or `AppError::Db` if persistence fails.
    pub async fn set_failed(&self, id: &str, reason: &str) -> Result<Session> {
        let current = self.require(id).await?;
        if !current.can_transition_to(SessionStatus::Failed) {
            return Err(AppError::InvalidTransition(format!(
                "{} -> failed",
                status_str(current.status)
            )));
        }

        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE session SET status = 'failed', failure_reason = ?1, terminated_at = ?2,
             updated_at = ?2 WHERE id = ?3",
        )
        .bind(reason)
        .bind(&now)
        .bind(id)
        .execute(self.db.as_ref())
        .await?;

        self.require(id).await
    }

    /// Record a termination: terminal status, type, reason, and billable
    /// portion in one write.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the session cannot reach the
    /// terminal status, or `AppError::Db` if persistence fails.
    pub async fn set_terminal(
        &self,
        id: &str,
        termination_type: TerminationType,
        reason: Option<&str>,
        billable_portion: f64,
    ) -> Result<Session> {
        let status = termination_type.terminal_status();
        let current = self.require(id).await?;
        if !current.can_transition_to(status) {
            return Err(AppError::InvalidTransition(format!(
                "{} -> {}",
                status_str(current.status),
                status_str(status)
            )));
        }

        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE session SET status = ?1, termination_type = ?2, termination_reason = ?3,
             billable_portion = ?4, terminated_at = ?5, updated_at = ?5 WHERE id = ?6",
        )
        .bind(status_str(status))
        .bind(termination_type_str(termination_type))
        .bind(reason)
        .bind(billable_portion)
        .bind(&now)
        .bind(id)
        .execute(self.db.as_ref())
        .await?;

        self.require(id).await
    }

    /// Atomic checkpoint advance for one sub-problem.
    ///
    /// In a single transaction: flips all `in_flight` contributions for the
    /// sub-problem to `committed`, persists the synthesis recommendation, and
    /// advances the session's recovery anchor. Returns the number of
    /// contributions committed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if any statement or the commit fails; no
    /// partial state is observable in that case.
    pub async fn advance_checkpoint(
        &self,
        session_id: &str,
        sub_problem_index: u32,
        recommendation: &Recommendation,
    ) -> Result<u64> {
        let mut tx = self.db.begin().await?;
        let now = Utc::now().to_rfc3339();

        let flipped = sqlx::query(
            "UPDATE contribution SET status = 'committed'
             WHERE session_id = ?1 AND sub_problem_index = ?2 AND status = 'in_flight'",
        )
        .bind(session_id)
        .bind(i64::from(sub_problem_index))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query(
            "INSERT INTO recommendation (id, session_id, sub_problem_index, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&recommendation.id)
        .bind(session_id)
        .bind(i64::from(sub_problem_index))
        .bind(&recommendation.content)
        .bind(recommendation.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE session SET last_completed_sp_index = ?1, sp_checkpoint_at = ?2,
             contribution_count = contribution_count + ?3, updated_at = ?2 WHERE id = ?4",
        )
        .bind(i64::from(sub_problem_index))
        .bind(&now)
        .bind(i64::try_from(flipped).map_err(|_| AppError::Db("row count overflow".into()))?)
        .bind(session_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(flipped)
    }

    /// Session ids explicitly flagged for recovery.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_recovery_needed(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM session WHERE status = 'running' AND recovery_needed = 1",
        )
        .fetch_all(self.db.as_ref())
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Session ids whose checkpoint lags committed contributions — the
    /// inconsistency signal scanned by recovery.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_checkpoint_lagging(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT s.id FROM session s
             JOIN contribution c ON c.session_id = s.id AND c.status = 'committed'
             WHERE s.status = 'running'
               AND (s.last_completed_sp_index IS NULL
                    OR c.sub_problem_index > s.last_completed_sp_index)",
        )
        .fetch_all(self.db.as_ref())
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// List all sessions currently in `running`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_running(&self) -> Result<Vec<Session>> {
        let rows: Vec<SessionRow> = sqlx::query_as("SELECT * FROM session WHERE status = 'running'")
            .fetch_all(self.db.as_ref())
            .await?;
        rows.into_iter().map(SessionRow::into_session).collect()
    }

    /// List sessions soft-deleted before the cutoff, for the retention purge.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_deleted_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM session WHERE status = 'deleted' AND updated_at < ?1",
        )
        .bind(cutoff.to_rfc3339())
        .fetch_all(self.db.as_ref())
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
