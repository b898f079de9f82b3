use std::sync::Arc;

use deliberd::models::contribution::{Contribution, ContributionStatus};
use deliberd::persistence::contribution_repo::ContributionRepo;
use deliberd::persistence::db;

async fn memory_repo() -> ContributionRepo {
    let pool = Arc::new(db::connect_memory().await.expect("db connect"));
    ContributionRepo::new(pool)
}

fn in_flight(session: &str, persona: &str, sp: u32, round: u32) -> Contribution {
    Contribution::new(
        session.to_owned(),
        persona.to_owned(),
        sp,
        round,
        format!("{persona} on sp{sp} r{round}"),
        None,
    )
}

#[tokio::test]
async fn create_round_trips_with_embedding() {
    let repo = memory_repo().await;

    let mut contribution = in_flight("sess-1", "architect", 0, 1);
    contribution.embedding = Some(vec![0.25, -0.5, 1.0]);
    repo.create(&contribution).await.expect("create");

    let fetched = repo
        .get_by_id(&contribution.id)
        .await
        .expect("query")
        .expect("exists");
    assert_eq!(fetched.status, ContributionStatus::InFlight);
    assert_eq!(fetched.embedding, Some(vec![0.25, -0.5, 1.0]));
    assert_eq!(fetched.persona_code, "architect");
}

#[tokio::test]
async fn list_for_sub_problem_filters_status_and_index() {
    let repo = memory_repo().await;

    repo.create(&in_flight("sess-1", "architect", 0, 1)).await.expect("a");
    repo.create(&in_flight("sess-1", "sre", 0, 1)).await.expect("b");
    repo.create(&in_flight("sess-1", "architect", 1, 1)).await.expect("c");
    repo.create(&in_flight("sess-2", "architect", 0, 1)).await.expect("d");

    let sp0 = repo
        .list_for_sub_problem("sess-1", 0, ContributionStatus::InFlight)
        .await
        .expect("list");
    assert_eq!(sp0.len(), 2);
    assert!(sp0.iter().all(|c| c.sub_problem_index == 0 && c.session_id == "sess-1"));

    let committed = repo
        .list_for_sub_problem("sess-1", 0, ContributionStatus::Committed)
        .await
        .expect("list");
    assert!(committed.is_empty());
}

#[tokio::test]
async fn roll_back_at_or_before_spares_later_sub_problems() {
    let repo = memory_repo().await;

    repo.create(&in_flight("sess-1", "architect", 0, 1)).await.expect("a");
    repo.create(&in_flight("sess-1", "sre", 1, 1)).await.expect("b");
    repo.create(&in_flight("sess-1", "economist", 2, 1)).await.expect("c");

    let rolled = repo.roll_back_at_or_before("sess-1", 1).await.expect("rollback");
    assert_eq!(rolled, 2);

    let survivors = repo
        .list_for_sub_problem("sess-1", 2, ContributionStatus::InFlight)
        .await
        .expect("list");
    assert_eq!(survivors.len(), 1);

    let rolled_back = repo
        .list_for_sub_problem("sess-1", 0, ContributionStatus::RolledBack)
        .await
        .expect("list");
    assert_eq!(rolled_back.len(), 1);
}

#[tokio::test]
async fn roll_back_is_idempotent() {
    let repo = memory_repo().await;
    repo.create(&in_flight("sess-1", "architect", 0, 1)).await.expect("a");

    assert_eq!(repo.roll_back_at_or_before("sess-1", 0).await.expect("first"), 1);
    assert_eq!(repo.roll_back_at_or_before("sess-1", 0).await.expect("second"), 0);
}

#[tokio::test]
async fn supersede_round_only_touches_that_round() {
    let repo = memory_repo().await;

    repo.create(&in_flight("sess-1", "architect", 1, 1)).await.expect("a");
    repo.create(&in_flight("sess-1", "sre", 1, 2)).await.expect("b");

    let superseded = repo.supersede_round("sess-1", 1, 2).await.expect("supersede");
    assert_eq!(superseded, 1);

    let round_one = repo
        .list_for_sub_problem("sess-1", 1, ContributionStatus::InFlight)
        .await
        .expect("list");
    assert_eq!(round_one.len(), 1);
    assert_eq!(round_one[0].round_number, 1);
}

#[tokio::test]
async fn committed_rows_never_roll_back() {
    let repo = memory_repo().await;

    let mut committed = in_flight("sess-1", "architect", 0, 1);
    committed.status = ContributionStatus::Committed;
    repo.create(&committed).await.expect("create");

    // Only in_flight rows are eligible for rollback or supersession.
    assert_eq!(repo.roll_back_at_or_before("sess-1", 0).await.expect("rollback"), 0);
    assert_eq!(repo.supersede_round("sess-1", 0, 1).await.expect("supersede"), 0);

    let fetched = repo
        .get_by_id(&committed.id)
        .await
        .expect("query")
        .expect("exists");
    assert_eq!(fetched.status, ContributionStatus::Committed);
}

#[tokio::test]
async fn max_in_flight_round_finds_crash_point() {
    let repo = memory_repo().await;

    assert!(repo
        .max_in_flight_round("sess-1", 0)
        .await
        .expect("query")
        .is_none());

    repo.create(&in_flight("sess-1", "architect", 0, 1)).await.expect("a");
    repo.create(&in_flight("sess-1", "sre", 0, 2)).await.expect("b");

    assert_eq!(
        repo.max_in_flight_round("sess-1", 0).await.expect("query"),
        Some(2)
    );
}
