use deliberd::models::session::{
    PersonaVariant, Session, SessionStatus, SubProblem, TerminationType,
};

fn session_in(status: SessionStatus) -> Session {
    let mut session = Session::new("problem".into(), PersonaVariant::Three);
    session.status = status;
    session
}

#[test]
fn new_session_starts_created_with_variant_counters() {
    let session = Session::new("scale the ingest tier".into(), PersonaVariant::Five);
    assert_eq!(session.status, SessionStatus::Created);
    assert_eq!(session.expert_count, 5);
    assert_eq!(session.total_sub_problems, 0);
    assert!(session.last_completed_sp_index.is_none());
    assert!(!session.recovery_needed);
    assert!(session.billable_portion.is_none());
}

#[test]
fn created_can_only_run() {
    let session = session_in(SessionStatus::Created);
    assert!(session.can_transition_to(SessionStatus::Running));
    assert!(!session.can_transition_to(SessionStatus::Completed));
    assert!(!session.can_transition_to(SessionStatus::Deleted));
    assert!(!session.can_transition_to(SessionStatus::Paused));
}

#[test]
fn running_reaches_every_outcome() {
    let session = session_in(SessionStatus::Running);
    for next in [
        SessionStatus::Paused,
        SessionStatus::Completed,
        SessionStatus::Failed,
        SessionStatus::Killed,
        SessionStatus::Terminated,
    ] {
        assert!(session.can_transition_to(next), "running -> {next:?}");
    }
    assert!(!session.can_transition_to(SessionStatus::Deleted));
}

#[test]
fn paused_resumes_or_ends() {
    let session = session_in(SessionStatus::Paused);
    assert!(session.can_transition_to(SessionStatus::Running));
    assert!(session.can_transition_to(SessionStatus::Terminated));
    assert!(session.can_transition_to(SessionStatus::Killed));
    assert!(!session.can_transition_to(SessionStatus::Completed));
    // Never deleted without going through termination first.
    assert!(!session.can_transition_to(SessionStatus::Deleted));
}

#[test]
fn only_terminal_states_delete() {
    for status in [
        SessionStatus::Completed,
        SessionStatus::Failed,
        SessionStatus::Killed,
        SessionStatus::Terminated,
    ] {
        assert!(session_in(status).can_transition_to(SessionStatus::Deleted));
    }
    assert!(!session_in(SessionStatus::Running).can_transition_to(SessionStatus::Deleted));
    assert!(!session_in(SessionStatus::Deleted).can_transition_to(SessionStatus::Running));
}

#[test]
fn terminal_states_accept_no_new_work() {
    for status in [
        SessionStatus::Completed,
        SessionStatus::Failed,
        SessionStatus::Killed,
        SessionStatus::Terminated,
        SessionStatus::Deleted,
    ] {
        assert!(status.is_terminal());
        assert!(!session_in(status).can_transition_to(SessionStatus::Running));
    }
}

#[test]
fn checkpoint_anchors_next_sub_problem() {
    let mut session = session_in(SessionStatus::Running);
    assert_eq!(session.next_sp_index(), 0);
    assert_eq!(session.completed_sp_count(), 0);

    session.last_completed_sp_index = Some(0);
    assert_eq!(session.next_sp_index(), 1);
    assert_eq!(session.completed_sp_count(), 1);

    session.last_completed_sp_index = Some(2);
    assert_eq!(session.next_sp_index(), 3);
    assert_eq!(session.completed_sp_count(), 3);
}

#[test]
fn termination_types_map_to_terminal_status() {
    for user_type in [
        TerminationType::BlockerIdentified,
        TerminationType::UserCancelled,
        TerminationType::ContinueBestEffort,
    ] {
        assert_eq!(user_type.terminal_status(), SessionStatus::Terminated);
    }
    for kill_type in [
        TerminationType::AdminTerminated,
        TerminationType::CostExceeded,
        TerminationType::DurationExceeded,
    ] {
        assert_eq!(kill_type.terminal_status(), SessionStatus::Killed);
    }
}

#[test]
fn abandoning_types_skip_the_round_boundary() {
    assert!(TerminationType::CostExceeded.abandons_round());
    assert!(TerminationType::DurationExceeded.abandons_round());
    assert!(TerminationType::AdminTerminated.abandons_round());
    assert!(!TerminationType::UserCancelled.abandons_round());
    assert!(!TerminationType::BlockerIdentified.abandons_round());
    assert!(!TerminationType::ContinueBestEffort.abandons_round());
}

#[test]
fn persona_variant_panel_sizes() {
    assert_eq!(PersonaVariant::Three.panel_size(), 3);
    assert_eq!(PersonaVariant::Five.panel_size(), 5);
}

#[test]
fn sub_problem_round_trips_through_serde() {
    let spec = SubProblem {
        index: 2,
        statement: "evaluate caching options".into(),
        personas: vec!["architect".into(), "sre".into(), "economist".into()],
    };
    let json = serde_json::to_string(&spec).expect("serialize");
    let back: SubProblem = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(back, spec);
}
