use std::sync::Arc;

use deliberd::models::contribution::{Contribution, ContributionStatus, Recommendation};
use deliberd::models::event::EventType;
use deliberd::models::session::{PersonaVariant, Session, SessionStatus, SubProblem};
use deliberd::persistence::contribution_repo::ContributionRepo;
use deliberd::persistence::event_repo::EventRepo;
use deliberd::persistence::session_repo::SessionRepo;

use super::stubs::{harness, wait_for_terminal, HarnessOptions, PERSONA_POOL};

/// Seed the engine's database with a crashed session: sub-problem 0
/// checkpointed, sub-problem 1 mid-round with two writes in flight.
async fn seed_crashed_session(pool: &Arc<deliberd::persistence::db::Database>) -> String {
    let sessions = SessionRepo::new(Arc::clone(pool));
    let contributions = ContributionRepo::new(Arc::clone(pool));

    let session = Session::with_id("crashed-1".into(), "p".into(), PersonaVariant::Three);
    sessions.create(&session).await.expect("create");
    sessions.try_acquire_running(&session.id).await.expect("cas");

    let specs: Vec<SubProblem> = (0..3)
        .map(|index| SubProblem {
            index,
            statement: format!("sp {index}"),
            personas: PERSONA_POOL.iter().map(|p| (*p).to_owned()).collect(),
        })
        .collect();
    sessions.set_decomposed(&session.id, &specs).await.expect("decompose");

    for persona in ["architect", "sre", "economist"] {
        contributions
            .create(&Contribution::new(
                session.id.clone(),
                persona.into(),
                0,
                1,
                format!("{persona} sp0"),
                None,
            ))
            .await
            .expect("write");
    }
    let rec = Recommendation::new(session.id.clone(), 0, "rec 0".into());
    sessions
        .advance_checkpoint(&session.id, 0, &rec)
        .await
        .expect("checkpoint");

    // Two persona writes landed for sub-problem 1 before the crash.
    for persona in ["architect", "sre"] {
        contributions
            .create(&Contribution::new(
                session.id.clone(),
                persona.into(),
                1,
                1,
                format!("{persona} partial sp1"),
                None,
            ))
            .await
            .expect("write");
    }

    sessions.set_recovery_needed(&session.id, true).await.expect("flag");
    session.id
}

#[tokio::test]
async fn scan_resumes_crashed_session_to_completion() {
    let h = harness(HarnessOptions::default()).await;
    let session_id = seed_crashed_session(&h.pool).await;

    let report = h.engine.run_recovery_scan().await.expect("scan");
    assert_eq!(report.scanned, 1);
    assert_eq!(report.resumed, 1);
    assert_eq!(report.failed, 0);

    let session = wait_for_terminal(&h.pool, &session_id).await;
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.last_completed_sp_index, Some(2));
    assert!(!session.recovery_needed);

    let contributions = ContributionRepo::new(Arc::clone(&h.pool));

    // Sub-problem 0's checkpointed rows are untouched.
    let sp0 = contributions
        .list_for_sub_problem(&session_id, 0, ContributionStatus::Committed)
        .await
        .expect("list");
    assert_eq!(sp0.len(), 3);

    // The replayed round superseded the two partial writes and committed a
    // fresh full panel.
    let superseded = contributions
        .list_for_sub_problem(&session_id, 1, ContributionStatus::RolledBack)
        .await
        .expect("list");
    assert_eq!(superseded.len(), 2);
    let sp1 = contributions
        .list_for_sub_problem(&session_id, 1, ContributionStatus::Committed)
        .await
        .expect("list");
    assert_eq!(sp1.len(), 3);

    // The resume announced itself on the event stream.
    let events = EventRepo::new(Arc::clone(&h.pool));
    let all = events.list_after(&session_id, 0).await.expect("events");
    assert!(all.iter().any(|e| e.event_type == EventType::SessionResumed));
}

#[tokio::test]
async fn scan_skips_consistent_sessions() {
    let h = harness(HarnessOptions::default()).await;

    let sessions = SessionRepo::new(Arc::clone(&h.pool));
    let healthy = Session::with_id("healthy-1".into(), "p".into(), PersonaVariant::Three);
    sessions.create(&healthy).await.expect("create");

    let report = h.engine.run_recovery_scan().await.expect("scan");
    assert_eq!(report.scanned, 0);
    assert_eq!(report.resumed, 0);
}

#[tokio::test]
async fn exhausted_resume_attempts_fail_the_session() {
    let h = harness(HarnessOptions::default()).await;
    let session_id = seed_crashed_session(&h.pool).await;

    // Burn through the attempt budget (max_resume_attempts = 3).
    let sessions = SessionRepo::new(Arc::clone(&h.pool));
    for _ in 0..3 {
        sessions
            .increment_resume_attempts(&session_id)
            .await
            .expect("inc");
    }

    let report = h.engine.run_recovery_scan().await.expect("scan");
    assert_eq!(report.failed, 1);
    assert_eq!(report.resumed, 0);

    let session = sessions.require(&session_id).await.expect("fetch");
    assert_eq!(session.status, SessionStatus::Failed);
    assert!(session
        .failure_reason
        .expect("reason")
        .contains("recovery retries exhausted"));

    let events = EventRepo::new(Arc::clone(&h.pool));
    let all = events.list_after(&session_id, 0).await.expect("events");
    assert!(all.iter().any(|e| e.event_type == EventType::SessionFailed));
}

#[tokio::test]
async fn list_recovery_needed_surfaces_flagged_sessions() {
    let h = harness(HarnessOptions::default()).await;
    let session_id = seed_crashed_session(&h.pool).await;

    let pending = h.engine.list_recovery_needed().await.expect("list");
    assert_eq!(pending, vec![session_id]);
}
