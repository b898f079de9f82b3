//! Retention service for time-based data purge.
//!
//! Runs as a background task deleting children first
//! (contributions, recommendations, events, cost records),
//! then soft-deleted sessions older than `retention_days`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::Result;

use super::contribution_repo::{ContributionRepo, RecommendationRepo};
use super::cost_repo::CostRepo;
use super::db::Database;
use super::event_repo::EventRepo;
use super::session_repo::SessionRepo;

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Spawn the retention purge background task.
///
/// The task runs hourly. On each tick it deletes all associated records
/// for sessions that have been soft-deleted for longer than `retention_days`.
#[must_use]
pub fn spawn_retention_task(
    db: Arc<Database>,
    retention_days: u32,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("retention task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = purge(&db, retention_days).await {
                        error!(?err, "retention purge failed");
                    }
                }
            }
        }
    })
}

/// Purge soft-deleted sessions older than the cutoff, children first.
///
/// # Errors
///
/// Returns `AppError::Db` if any delete fails.
pub async fn purge(db: &Arc<Database>, retention_days: u32) -> Result<u32> {
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));

    let session_repo = SessionRepo::new(Arc::clone(db));
    let contribution_repo = ContributionRepo::new(Arc::clone(db));
    let recommendation_repo = RecommendationRepo::new(Arc::clone(db));
    let event_repo = EventRepo::new(Arc::clone(db));
    let cost_repo = CostRepo::new(Arc::clone(db));

    let expired = session_repo.list_deleted_before(cutoff).await?;
    let mut purged = 0u32;

    for session_id in &expired {
        // Children first to maintain referential integrity.
        session_repo.delete_sub_problems(session_id).await?;
        contribution_repo.delete_for_session(session_id).await?;
        recommendation_repo.delete_for_session(session_id).await?;
        event_repo.delete_for_session(session_id).await?;
        cost_repo.delete_for_session(session_id).await?;

        sqlx::query("DELETE FROM session WHERE id = ?1")
            .bind(session_id)
            .execute(db.as_ref())
            .await?;
        purged += 1;
    }

    if purged > 0 {
        info!(purged, retention_days, "retention purge completed");
    }
    Ok(purged)
}
