//! Cost attribution ledger repository for `SQLite` persistence.

use std::sync::Arc;

use chrono::Utc;

use crate::models::cost::{CostFeature, CostRecord};
use crate::{AppError, Result};

use super::db::Database;

/// Repository wrapper around `SQLite` for cost records.
#[derive(Clone)]
pub struct CostRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct CostRow {
    id: String,
    session_id: String,
    contribution_id: Option<String>,
    recommendation_id: Option<String>,
    sub_problem_index: Option<i64>,
    amount: f64,
    feature: String,
    created_at: String,
}

impl CostRow {
    /// Convert a database row into the domain model.
    fn into_cost_record(self) -> Result<CostRecord> {
        let feature = parse_feature(&self.feature)?;
        let created_at = chrono::DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| AppError::Db(format!("invalid created_at: {e}")))?
            .with_timezone(&Utc);

        Ok(CostRecord {
            id: self.id,
            session_id: self.session_id,
            contribution_id: self.contribution_id,
            recommendation_id: self.recommendation_id,
            sub_problem_index: self
                .sub_problem_index
                .map(|v| {
                    u32::try_from(v).map_err(|_| AppError::Db("invalid sub_problem_index".into()))
                })
                .transpose()?,
            amount: self.amount,
            feature,
            created_at,
        })
    }
}

fn parse_feature(s: &str) -> Result<CostFeature> {
    match s {
        "decomposition" => Ok(CostFeature::Decomposition),
        "contribution" => Ok(CostFeature::Contribution),
        "convergence" => Ok(CostFeature::Convergence),
        "synthesis" => Ok(CostFeature::Synthesis),
        other => Err(AppError::Db(format!("invalid cost feature: {other}"))),
    }
}

fn feature_str(f: CostFeature) -> &'static str {
    match f {
        CostFeature::Decomposition => "decomposition",
        CostFeature::Contribution => "contribution",
        CostFeature::Convergence => "convergence",
        CostFeature::Synthesis => "synthesis",
    }
}

impl CostRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new cost record. Records are immutable once written.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the database insert fails.
    pub async fn insert(&self, record: &CostRecord) -> Result<CostRecord> {
        sqlx::query(
            "INSERT INTO cost_record (id, session_id, contribution_id, recommendation_id,
             sub_problem_index, amount, feature, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&record.id)
        .bind(&record.session_id)
        .bind(&record.contribution_id)
        .bind(&record.recommendation_id)
        .bind(record.sub_problem_index.map(i64::from))
        .bind(record.amount)
        .bind(feature_str(record.feature))
        .bind(record.created_at.to_rfc3339())
        .execute(self.db.as_ref())
        .await?;

        Ok(record.clone())
    }

    /// Aggregate cost for a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn total_for_session(&self, session_id: &str) -> Result<f64> {
        let row: (f64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(amount), 0.0) FROM cost_record WHERE session_id = ?1",
        )
        .bind(session_id)
        .fetch_one(self.db.as_ref())
        .await?;
        Ok(row.0)
    }

    /// List all cost records for a session, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_for_session(&self, session_id: &str) -> Result<Vec<CostRecord>> {
        let rows: Vec<CostRow> = sqlx::query_as(
            "SELECT * FROM cost_record WHERE session_id = ?1 ORDER BY created_at",
        )
        .bind(session_id)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(CostRow::into_cost_record).collect()
    }

    /// Delete all cost records for a session (retention purge).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete_for_session(&self, session_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM cost_record WHERE session_id = ?1")
            .bind(session_id)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }
}
