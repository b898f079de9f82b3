//! Error types shared across the engine.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// Decomposition returned no usable sub-problems or errored outright.
    Decomposition(String),
    /// Persona invocation failed after exhausting retries.
    Persona(String),
    /// A round failed to reach quorum.
    Quorum(String),
    /// Synthesis call failed after exhausting retries.
    Synthesis(String),
    /// A session status transition is not permitted by the state machine.
    InvalidTransition(String),
    /// Another driver already holds the `running` lock for the session.
    DriverConflict(String),
    /// Termination handling failure.
    Termination(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Decomposition(msg) => write!(f, "decomposition: {msg}"),
            Self::Persona(msg) => write!(f, "persona: {msg}"),
            Self::Quorum(msg) => write!(f, "quorum: {msg}"),
            Self::Synthesis(msg) => write!(f, "synthesis: {msg}"),
            Self::InvalidTransition(msg) => write!(f, "invalid transition: {msg}"),
            Self::DriverConflict(msg) => write!(f, "driver conflict: {msg}"),
            Self::Termination(msg) => write!(f, "termination: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}
