use std::sync::Arc;

use deliberd::models::contribution::{Contribution, ContributionStatus, Recommendation};
use deliberd::models::session::{PersonaVariant, Session, SubProblem};
use deliberd::orchestrator::recovery::repair_session;
use deliberd::persistence::contribution_repo::ContributionRepo;
use deliberd::persistence::{db, session_repo::SessionRepo};

struct Fixture {
    sessions: SessionRepo,
    contributions: ContributionRepo,
    session_id: String,
}

fn specs(n: u32) -> Vec<SubProblem> {
    (0..n)
        .map(|index| SubProblem {
            index,
            statement: format!("sub-problem {index}"),
            personas: vec!["architect".into(), "sre".into(), "economist".into()],
        })
        .collect()
}

/// Build a running session with sub-problem 0 checkpointed.
async fn checkpointed_fixture() -> Fixture {
    let pool = Arc::new(db::connect_memory().await.expect("db connect"));
    let sessions = SessionRepo::new(Arc::clone(&pool));
    let contributions = ContributionRepo::new(Arc::clone(&pool));

    let session = Session::new("problem".into(), PersonaVariant::Three);
    sessions.create(&session).await.expect("create");
    sessions.try_acquire_running(&session.id).await.expect("cas");
    sessions.set_decomposed(&session.id, &specs(3)).await.expect("decompose");

    for persona in ["architect", "sre", "economist"] {
        contributions
            .create(&Contribution::new(
                session.id.clone(),
                persona.into(),
                0,
                1,
                format!("{persona} take"),
                None,
            ))
            .await
            .expect("write");
    }
    let recommendation = Recommendation::new(session.id.clone(), 0, "synthesis 0".into());
    sessions
        .advance_checkpoint(&session.id, 0, &recommendation)
        .await
        .expect("checkpoint");

    sessions.set_recovery_needed(&session.id, true).await.expect("flag");

    Fixture {
        sessions,
        contributions,
        session_id: session.id,
    }
}

#[tokio::test]
async fn clean_crash_between_sub_problems_resumes_without_rollback() {
    // Crash after sub-problem 0's checkpoint committed, before sub-problem 1
    // started: nothing to roll back, resume at sub-problem 1.
    let fixture = checkpointed_fixture().await;

    let outcome = repair_session(&fixture.sessions, &fixture.contributions, &fixture.session_id)
        .await
        .expect("repair");

    assert_eq!(outcome.rolled_back, 0);
    assert_eq!(outcome.resume_sp_index, Some(1));
    assert_eq!(outcome.replay_round, None);

    let session = fixture.sessions.require(&fixture.session_id).await.expect("fetch");
    assert_eq!(session.last_completed_sp_index, Some(0));
}

#[tokio::test]
async fn mid_round_crash_replays_without_rolling_back_in_progress_rows() {
    // Crash mid-round for sub-problem 1 with two persona writes in flight:
    // the scan rolls neither back (sub-problem 1 is not checkpointed) but
    // schedules the round for replay.
    let fixture = checkpointed_fixture().await;

    for persona in ["architect", "sre"] {
        fixture
            .contributions
            .create(&Contribution::new(
                fixture.session_id.clone(),
                persona.into(),
                1,
                1,
                format!("{persona} partial"),
                None,
            ))
            .await
            .expect("write");
    }

    let outcome = repair_session(&fixture.sessions, &fixture.contributions, &fixture.session_id)
        .await
        .expect("repair");

    assert_eq!(outcome.rolled_back, 0);
    assert_eq!(outcome.resume_sp_index, Some(1));
    assert_eq!(outcome.replay_round, Some(1));

    let in_flight = fixture
        .contributions
        .list_for_sub_problem(&fixture.session_id, 1, ContributionStatus::InFlight)
        .await
        .expect("list");
    assert_eq!(in_flight.len(), 2, "in-progress rows stay in flight for the replay");
}

#[tokio::test]
async fn stale_rows_behind_the_checkpoint_roll_back() {
    // A write that landed late for an already-checkpointed sub-problem was
    // superseded; the checkpoint record is the source of truth.
    let fixture = checkpointed_fixture().await;

    fixture
        .contributions
        .create(&Contribution::new(
            fixture.session_id.clone(),
            "latecomer".into(),
            0,
            1,
            "landed after the checkpoint".into(),
            None,
        ))
        .await
        .expect("write");

    let outcome = repair_session(&fixture.sessions, &fixture.contributions, &fixture.session_id)
        .await
        .expect("repair");

    assert_eq!(outcome.rolled_back, 1);

    let rolled_back = fixture
        .contributions
        .list_for_sub_problem(&fixture.session_id, 0, ContributionStatus::RolledBack)
        .await
        .expect("list");
    assert_eq!(rolled_back.len(), 1);
    assert_eq!(rolled_back[0].persona_code, "latecomer");

    // Checkpointed rows are untouched.
    let committed = fixture
        .contributions
        .list_for_sub_problem(&fixture.session_id, 0, ContributionStatus::Committed)
        .await
        .expect("list");
    assert_eq!(committed.len(), 3);
}

#[tokio::test]
async fn repair_is_idempotent() {
    let fixture = checkpointed_fixture().await;

    for persona in ["architect", "sre"] {
        fixture
            .contributions
            .create(&Contribution::new(
                fixture.session_id.clone(),
                persona.into(),
                1,
                1,
                format!("{persona} partial"),
                None,
            ))
            .await
            .expect("write");
    }

    let first = repair_session(&fixture.sessions, &fixture.contributions, &fixture.session_id)
        .await
        .expect("first repair");
    let statuses_after_first = all_statuses(&fixture).await;

    let second = repair_session(&fixture.sessions, &fixture.contributions, &fixture.session_id)
        .await
        .expect("second repair");
    let statuses_after_second = all_statuses(&fixture).await;

    assert_eq!(first.resume_sp_index, second.resume_sp_index);
    assert_eq!(first.replay_round, second.replay_round);
    assert_eq!(second.rolled_back, 0, "second pass has nothing left to roll back");
    assert_eq!(statuses_after_first, statuses_after_second);

    let session = fixture.sessions.require(&fixture.session_id).await.expect("fetch");
    assert_eq!(session.last_completed_sp_index, Some(0));
}

async fn all_statuses(fixture: &Fixture) -> Vec<(String, ContributionStatus)> {
    fixture
        .contributions
        .list_for_session(&fixture.session_id)
        .await
        .expect("list")
        .into_iter()
        .map(|c| (c.id, c.status))
        .collect()
}
