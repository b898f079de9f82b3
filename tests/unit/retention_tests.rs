use std::sync::Arc;

use deliberd::models::contribution::Contribution;
use deliberd::models::cost::CostRecord;
use deliberd::models::event::EventType;
use deliberd::models::session::{PersonaVariant, Session, SessionStatus};
use deliberd::persistence::contribution_repo::ContributionRepo;
use deliberd::persistence::cost_repo::CostRepo;
use deliberd::persistence::event_repo::EventRepo;
use deliberd::persistence::{db, retention, session_repo::SessionRepo};
use serde_json::json;

/// Build a soft-deleted session with children, backdated past retention.
async fn deleted_session_with_children(pool: &Arc<db::Database>, backdate_days: i64) -> String {
    let sessions = SessionRepo::new(Arc::clone(pool));
    let contributions = ContributionRepo::new(Arc::clone(pool));
    let events = EventRepo::new(Arc::clone(pool));
    let costs = CostRepo::new(Arc::clone(pool));

    let session = Session::new("p".into(), PersonaVariant::Three);
    sessions.create(&session).await.expect("create");
    sessions.try_acquire_running(&session.id).await.expect("cas");

    contributions
        .create(&Contribution::new(session.id.clone(), "architect".into(), 0, 1, "x".into(), None))
        .await
        .expect("contribution");
    events
        .append(&session.id, EventType::SessionStarted, json!({}))
        .await
        .expect("event");
    costs
        .insert(&CostRecord::for_contribution(session.id.clone(), "c".into(), 0, 1.0))
        .await
        .expect("cost");

    sessions.set_failed(&session.id, "fixture").await.expect("fail");
    sessions
        .update_status(&session.id, SessionStatus::Deleted)
        .await
        .expect("delete");

    // Backdate the soft delete so the cutoff catches it.
    let stamp = (chrono::Utc::now() - chrono::Duration::days(backdate_days)).to_rfc3339();
    sqlx::query("UPDATE session SET updated_at = ?1 WHERE id = ?2")
        .bind(&stamp)
        .bind(&session.id)
        .execute(pool.as_ref())
        .await
        .expect("backdate");

    session.id
}

#[tokio::test]
async fn purge_removes_expired_sessions_and_children() {
    let pool = Arc::new(db::connect_memory().await.expect("db connect"));
    let old_id = deleted_session_with_children(&pool, 60).await;

    let purged = retention::purge(&pool, 30).await.expect("purge");
    assert_eq!(purged, 1);

    let sessions = SessionRepo::new(Arc::clone(&pool));
    assert!(sessions.get_by_id(&old_id).await.expect("query").is_none());

    let contributions = ContributionRepo::new(Arc::clone(&pool));
    assert!(contributions
        .list_for_session(&old_id)
        .await
        .expect("list")
        .is_empty());

    let events = EventRepo::new(Arc::clone(&pool));
    assert!(events.list_after(&old_id, 0).await.expect("list").is_empty());

    let costs = CostRepo::new(Arc::clone(&pool));
    assert!(costs.list_for_session(&old_id).await.expect("list").is_empty());
}

#[tokio::test]
async fn purge_spares_recent_and_live_sessions() {
    let pool = Arc::new(db::connect_memory().await.expect("db connect"));

    let recent_id = deleted_session_with_children(&pool, 5).await;

    let sessions = SessionRepo::new(Arc::clone(&pool));
    let live = Session::new("live".into(), PersonaVariant::Three);
    sessions.create(&live).await.expect("create");
    sessions.try_acquire_running(&live.id).await.expect("cas");

    let purged = retention::purge(&pool, 30).await.expect("purge");
    assert_eq!(purged, 0);

    assert!(sessions.get_by_id(&recent_id).await.expect("query").is_some());
    assert!(sessions.get_by_id(&live.id).await.expect("query").is_some());
}
