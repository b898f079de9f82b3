//! Engine configuration parsing and validation.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{AppError, Result};

/// Timeout and retry settings for persona rounds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RoundConfig {
    /// Per-attempt persona invocation timeout.
    #[serde(default = "default_persona_timeout_seconds")]
    pub persona_timeout_seconds: u64,
    /// Overall round timeout; the round fails if quorum never resolves.
    #[serde(default = "default_round_timeout_seconds")]
    pub round_timeout_seconds: u64,
    /// Maximum retries per persona task on transient failure.
    #[serde(default = "default_persona_retry_limit")]
    pub persona_retry_limit: u32,
    /// Base backoff between retries, in milliseconds (linear).
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Upper bound on rounds per sub-problem; convergence may stop earlier.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    /// Minimum successful contributions to resolve a 3-persona round.
    #[serde(default = "default_quorum_of_three")]
    pub quorum_of_three: u32,
    /// Minimum successful contributions to resolve a 5-persona round.
    #[serde(default = "default_quorum_of_five")]
    pub quorum_of_five: u32,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            persona_timeout_seconds: default_persona_timeout_seconds(),
            round_timeout_seconds: default_round_timeout_seconds(),
            persona_retry_limit: default_persona_retry_limit(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_rounds: default_max_rounds(),
            quorum_of_three: default_quorum_of_three(),
            quorum_of_five: default_quorum_of_five(),
        }
    }
}

fn default_persona_timeout_seconds() -> u64 {
    120
}

fn default_round_timeout_seconds() -> u64 {
    600
}

fn default_persona_retry_limit() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_max_rounds() -> u32 {
    4
}

fn default_quorum_of_three() -> u32 {
    2
}

fn default_quorum_of_five() -> u32 {
    3
}

/// Hard budget limits enforced before each round.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct BudgetConfig {
    /// Hard session cost ceiling; `None` disables the cost kill.
    #[serde(default)]
    pub max_session_cost: Option<f64>,
    /// Hard session duration ceiling in seconds; `None` disables it.
    #[serde(default)]
    pub max_session_duration_seconds: Option<u64>,
}

/// Recovery scan and retention settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RecoveryConfig {
    /// Interval between periodic recovery scans.
    #[serde(default = "default_scan_interval_seconds")]
    pub scan_interval_seconds: u64,
    /// Resume attempts per interrupted session before it is failed.
    #[serde(default = "default_max_resume_attempts")]
    pub max_resume_attempts: u32,
    /// Days soft-deleted sessions are kept before the purge removes them.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            scan_interval_seconds: default_scan_interval_seconds(),
            max_resume_attempts: default_max_resume_attempts(),
            retention_days: default_retention_days(),
        }
    }
}

fn default_scan_interval_seconds() -> u64 {
    60
}

fn default_max_resume_attempts() -> u32 {
    3
}

fn default_retention_days() -> u32 {
    30
}

/// Global engine configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    /// Path to the `SQLite` database file.
    pub db_path: PathBuf,
    /// Directory for the JSONL kill-audit log.
    #[serde(default = "default_audit_log_dir")]
    pub audit_log_dir: PathBuf,
    /// Round timeout and retry settings.
    #[serde(default)]
    pub round: RoundConfig,
    /// Hard budget limits.
    #[serde(default)]
    pub budget: BudgetConfig,
    /// Recovery scan and retention settings.
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

fn default_audit_log_dir() -> PathBuf {
    PathBuf::from(".deliberd/logs")
}

impl EngineConfig {
    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing fails or a value is out of range.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Construct a configuration suitable for tests: in-memory-style paths
    /// and short timeouts.
    #[must_use]
    pub fn for_tests(db_path: PathBuf) -> Self {
        Self {
            db_path,
            audit_log_dir: std::env::temp_dir().join("deliberd-audit"),
            round: RoundConfig {
                persona_timeout_seconds: 5,
                round_timeout_seconds: 10,
                persona_retry_limit: 1,
                retry_backoff_ms: 10,
                ..RoundConfig::default()
            },
            budget: BudgetConfig::default(),
            recovery: RecoveryConfig::default(),
        }
    }

    /// The configured database path.
    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn validate(&self) -> Result<()> {
        if self.round.quorum_of_three == 0 || self.round.quorum_of_three > 3 {
            return Err(AppError::Config(
                "quorum_of_three must be between 1 and 3".into(),
            ));
        }
        if self.round.quorum_of_five == 0 || self.round.quorum_of_five > 5 {
            return Err(AppError::Config(
                "quorum_of_five must be between 1 and 5".into(),
            ));
        }
        if self.round.max_rounds == 0 {
            return Err(AppError::Config("max_rounds must be at least 1".into()));
        }
        if self.round.round_timeout_seconds < self.round.persona_timeout_seconds {
            return Err(AppError::Config(
                "round_timeout_seconds must not be shorter than persona_timeout_seconds".into(),
            ));
        }
        if let Some(cost) = self.budget.max_session_cost {
            if cost <= 0.0 {
                return Err(AppError::Config(
                    "max_session_cost must be positive when set".into(),
                ));
            }
        }
        Ok(())
    }

    /// Quorum threshold for a panel of the given size.
    #[must_use]
    pub fn quorum_for(&self, panel_size: u32) -> u32 {
        if panel_size >= 5 {
            self.round.quorum_of_five
        } else {
            self.round.quorum_of_three
        }
    }
}
