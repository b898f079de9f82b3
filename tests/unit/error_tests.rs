use deliberd::AppError;

#[test]
fn display_formats_carry_domain_prefix() {
    let cases = [
        (AppError::Config("bad toml".into()), "config: bad toml"),
        (AppError::Db("locked".into()), "db: locked"),
        (
            AppError::Decomposition("zero sub-problems".into()),
            "decomposition: zero sub-problems",
        ),
        (AppError::Persona("timeout".into()), "persona: timeout"),
        (
            AppError::Quorum("2/5 succeeded".into()),
            "quorum: 2/5 succeeded",
        ),
        (
            AppError::Synthesis("call failed".into()),
            "synthesis: call failed",
        ),
        (
            AppError::InvalidTransition("completed -> running".into()),
            "invalid transition: completed -> running",
        ),
        (
            AppError::DriverConflict("already held".into()),
            "driver conflict: already held",
        ),
        (
            AppError::Termination("already terminal".into()),
            "termination: already terminal",
        ),
        (AppError::NotFound("session x".into()), "not found: session x"),
        (AppError::Io("disk full".into()), "io: disk full"),
    ];

    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
    }
}

#[test]
fn toml_errors_convert_to_config() {
    let parse_err = toml::from_str::<deliberd::config::EngineConfig>("not = [valid")
        .expect_err("should fail to parse");
    let err: AppError = parse_err.into();
    assert!(matches!(err, AppError::Config(_)));
    assert!(err.to_string().starts_with("config:"));
}

#[test]
fn app_error_is_std_error() {
    let err: Box<dyn std::error::Error> = Box::new(AppError::Db("oops".into()));
    assert_eq!(err.to_string(), "db: oops");
}
