//! Contribution and recommendation repository for `SQLite` persistence.

use std::sync::Arc;

use chrono::Utc;

use crate::models::contribution::{Contribution, ContributionStatus, Recommendation};
use crate::{AppError, Result};

use super::db::Database;

/// Repository wrapper around `SQLite` for contribution records.
#[derive(Clone)]
pub struct ContributionRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct ContributionRow {
    id: String,
    session_id: String,
    persona_code: String,
    sub_problem_index: i64,
    round_number: i64,
    status: String,
    content: String,
    embedding: Option<String>,
    created_at: String,
}

impl ContributionRow {
    /// Convert a database row into the domain model.
    fn into_contribution(self) -> Result<Contribution> {
        let status = parse_contribution_status(&self.status)?;
        let embedding = self
            .embedding
            .as_deref()
            .map(|raw| {
                serde_json::from_str::<Vec<f32>>(raw)
                    .map_err(|e| AppError::Db(format!("invalid embedding: {e}")))
            })
            .transpose()?;
        let created_at = chrono::DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| AppError::Db(format!("invalid created_at: {e}")))?
            .with_timezone(&Utc);

        Ok(Contribution {
            id: self.id,
            session_id: self.session_id,
            persona_code: self.persona_code,
            sub_problem_index: u32::try_from(self.sub_problem_index)
                .map_err(|_| AppError::Db("invalid sub_problem_index".into()))?,
            round_number: u32::try_from(self.round_number)
                .map_err(|_| AppError::Db("invalid round_number".into()))?,
            status,
            content: self.content,
            embedding,
            created_at,
        })
    }
}

fn parse_contribution_status(s: &str) -> Result<ContributionStatus> {
    match s {
        "in_flight" => Ok(ContributionStatus::InFlight),
        "committed" => Ok(ContributionStatus::Committed),
        "rolled_back" => Ok(ContributionStatus::RolledBack),
        other => Err(AppError::Db(format!("invalid contribution status: {other}"))),
    }
}

fn contribution_status_str(s: ContributionStatus) -> &'static str {
    match s {
        ContributionStatus::InFlight => "in_flight",
        ContributionStatus::Committed => "committed",
        ContributionStatus::RolledBack => "rolled_back",
    }
}

impl ContributionRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new contribution record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the database insert fails.
    pub async fn create(&self, contribution: &Contribution) -> Result<Contribution> {
        let embedding = contribution
            .embedding
            .as_ref()
            .map(|e| {
                serde_json::to_string(e)
                    .map_err(|err| AppError::Db(format!("failed to serialize embedding: {err}")))
            })
            .transpose()?;

        sqlx::query(
            "INSERT INTO contribution (id, session_id, persona_code, sub_problem_index,
             round_number, status, content, embedding, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&contribution.id)
        .bind(&contribution.session_id)
        .bind(&contribution.persona_code)
        .bind(i64::from(contribution.sub_problem_index))
        .bind(i64::from(contribution.round_number))
        .bind(contribution_status_str(contribution.status))
        .bind(&contribution.content)
        .bind(&embedding)
        .bind(contribution.created_at.to_rfc3339())
        .execute(self.db.as_ref())
        .await?;

        Ok(contribution.clone())
    }

    /// Retrieve a contribution by identifier.
    ///
    /// Returns `Ok(None)` if the contribution does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<Contribution>> {
        let row: Option<ContributionRow> =
            sqlx::query_as("SELECT * FROM contribution WHERE id = ?1")
                .bind(id)
                .fetch_optional(self.db.as_ref())
                .await?;

        row.map(ContributionRow::into_contribution).transpose()
    }

    /// List all contributions for a session, ordered by sub-problem then round.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_for_session(&self, session_id: &str) -> Result<Vec<Contribution>> {
        let rows: Vec<ContributionRow> = sqlx::query_as(
            "SELECT * FROM contribution WHERE session_id = ?1
             ORDER BY sub_problem_index, round_number, persona_code",
        )
        .bind(session_id)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter()
            .map(ContributionRow::into_contribution)
            .collect()
    }

    /// List contributions for one sub-problem with the given status.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_for_sub_problem(
        &self,
        session_id: &str,
        sub_problem_index: u32,
        status: ContributionStatus,
    ) -> Result<Vec<Contribution>> {
        let rows: Vec<ContributionRow> = sqlx::query_as(
            "SELECT * FROM contribution
             WHERE session_id = ?1 AND sub_problem_index = ?2 AND status = ?3
             ORDER BY round_number, persona_code",
        )
        .bind(session_id)
        .bind(i64::from(sub_problem_index))
        .bind(contribution_status_str(status))
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter()
            .map(ContributionRow::into_contribution)
            .collect()
    }

    /// Roll back all `in_flight` contributions at or before the checkpoint.
    ///
    /// Used by the recovery scan: the checkpoint already advanced past these
    /// rows, so they were superseded or abandoned. Returns the number of
    /// rows rolled back.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn roll_back_at_or_before(
        &self,
        session_id: &str,
        sub_problem_index: u32,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE contribution SET status = 'rolled_back'
             WHERE session_id = ?1 AND sub_problem_index <= ?2 AND status = 'in_flight'",
        )
        .bind(session_id)
        .bind(i64::from(sub_problem_index))
        .execute(self.db.as_ref())
        .await?;

        Ok(result.rows_affected())
    }

    /// Supersede stale `in_flight` contributions for one round before it is
    /// replayed. Returns the number of rows rolled back.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn supersede_round(
        &self,
        session_id: &str,
        sub_problem_index: u32,
        round_number: u32,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE contribution SET status = 'rolled_back'
             WHERE session_id = ?1 AND sub_problem_index = ?2 AND round_number = ?3
               AND status = 'in_flight'",
        )
        .bind(session_id)
        .bind(i64::from(sub_problem_index))
        .bind(i64::from(round_number))
        .execute(self.db.as_ref())
        .await?;

        Ok(result.rows_affected())
    }

    /// Highest round with an `in_flight` contribution for a sub-problem, if any.
    ///
    /// Recovery uses this to find the round that was mid-flight at crash time.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn max_in_flight_round(
        &self,
        session_id: &str,
        sub_problem_index: u32,
    ) -> Result<Option<u32>> {
        let row: Option<(Option<i64>,)> = sqlx::query_as(
            "SELECT MAX(round_number) FROM contribution
             WHERE session_id = ?1 AND sub_problem_index = ?2 AND status = 'in_flight'",
        )
        .bind(session_id)
        .bind(i64::from(sub_problem_index))
        .fetch_optional(self.db.as_ref())
        .await?;

        row.and_then(|(max,)| max)
            .map(|v| u32::try_from(v).map_err(|_| AppError::Db("invalid round_number".into())))
            .transpose()
    }

    /// Delete all contributions for a session (retention purge).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete_for_session(&self, session_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM contribution WHERE session_id = ?1")
            .bind(session_id)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }
}

/// Repository wrapper around `SQLite` for recommendation records.
///
/// Inserts happen inside the checkpoint-advance transaction owned by
/// `SessionRepo`; this repo covers the read side.
#[derive(Clone)]
pub struct RecommendationRepo {
    db: Arc<Database>,
}

#[derive(sqlx::FromRow)]
struct RecommendationRow {
    id: String,
    session_id: String,
    sub_problem_index: i64,
    content: String,
    created_at: String,
}

impl RecommendationRow {
    fn into_recommendation(self) -> Result<Recommendation> {
        let created_at = chrono::DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| AppError::Db(format!("invalid created_at: {e}")))?
            .with_timezone(&Utc);
        Ok(Recommendation {
            id: self.id,
            session_id: self.session_id,
            sub_problem_index: u32::try_from(self.sub_problem_index)
                .map_err(|_| AppError::Db("invalid sub_problem_index".into()))?,
            content: self.content,
            created_at,
        })
    }
}

impl RecommendationRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// List all recommendations for a session, ordered by sub-problem.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_for_session(&self, session_id: &str) -> Result<Vec<Recommendation>> {
        let rows: Vec<RecommendationRow> = sqlx::query_as(
            "SELECT * FROM recommendation WHERE session_id = ?1 ORDER BY sub_problem_index",
        )
        .bind(session_id)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter()
            .map(RecommendationRow::into_recommendation)
            .collect()
    }

    /// Count sub-problems that reached synthesis for a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn count_for_session(&self, session_id: &str) -> Result<u32> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM recommendation WHERE session_id = ?1")
                .bind(session_id)
                .fetch_one(self.db.as_ref())
                .await?;
        u32::try_from(row.0).map_err(|_| AppError::Db("recommendation count overflow".into()))
    }

    /// Delete all recommendations for a session (retention purge).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete_for_session(&self, session_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM recommendation WHERE session_id = ?1")
            .bind(session_id)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }
}
