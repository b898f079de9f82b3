use std::sync::Arc;

use deliberd::models::event::{EventClass, EventType};
use deliberd::persistence::db;
use deliberd::persistence::event_repo::EventRepo;
use serde_json::json;

async fn memory_repo() -> EventRepo {
    let pool = Arc::new(db::connect_memory().await.expect("db connect"));
    EventRepo::new(pool)
}

#[tokio::test]
async fn sequences_are_monotonic_and_gap_free() {
    let repo = memory_repo().await;

    for i in 0..5 {
        let event = repo
            .append("sess-1", EventType::ContributionStarted, json!({ "i": i }))
            .await
            .expect("append");
        assert_eq!(event.sequence, i + 1);
    }

    let all = repo.list_after("sess-1", 0).await.expect("list");
    let sequences: Vec<i64> = all.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn sequences_are_per_session() {
    let repo = memory_repo().await;

    repo.append("sess-a", EventType::SessionStarted, json!({}))
        .await
        .expect("append");
    repo.append("sess-a", EventType::RoundResolved, json!({}))
        .await
        .expect("append");
    let b_first = repo
        .append("sess-b", EventType::SessionStarted, json!({}))
        .await
        .expect("append");

    // Each session has its own counter, not a shared one.
    assert_eq!(b_first.sequence, 1);
    assert_eq!(repo.last_sequence("sess-a").await.expect("last"), 2);
    assert_eq!(repo.last_sequence("sess-b").await.expect("last"), 1);
}

#[tokio::test]
async fn list_after_returns_strict_suffix() {
    let repo = memory_repo().await;

    for _ in 0..4 {
        repo.append("sess-1", EventType::ContributionComplete, json!({}))
            .await
            .expect("append");
    }

    let tail = repo.list_after("sess-1", 2).await.expect("list");
    let sequences: Vec<i64> = tail.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![3, 4]);

    let empty = repo.list_after("sess-1", 99).await.expect("list");
    assert!(empty.is_empty());
}

#[tokio::test]
async fn payload_round_trips() {
    let repo = memory_repo().await;

    let payload = json!({
        "sub_problem_index": 1,
        "round_number": 2,
        "successes": 3,
    });
    repo.append("sess-1", EventType::RoundResolved, payload.clone())
        .await
        .expect("append");

    let stored = repo.list_after("sess-1", 0).await.expect("list");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].event_type, EventType::RoundResolved);
    assert_eq!(stored[0].payload, payload);
}

#[tokio::test]
async fn last_sequence_is_zero_for_fresh_session() {
    let repo = memory_repo().await;
    assert_eq!(repo.last_sequence("sess-1").await.expect("last"), 0);
}

#[test]
fn event_classes_split_lifecycle_from_work() {
    for work in [
        EventType::ContributionStarted,
        EventType::ContributionComplete,
        EventType::RoundResolved,
    ] {
        assert_eq!(work.class(), EventClass::Work);
    }
    for lifecycle in [
        EventType::SessionStarted,
        EventType::SubproblemCompleted,
        EventType::SessionKilled,
        EventType::SessionDeleted,
    ] {
        assert_eq!(lifecycle.class(), EventClass::Lifecycle);
    }
}
