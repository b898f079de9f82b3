//! `SQLite` schema bootstrap logic.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS` — safe to
//! re-run on every process startup. Produces a convergent result.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table definitions to the connected `SQLite` database.
///
/// Creates all six tables idempotently. Safe to call on every startup.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS session (
    id                      TEXT PRIMARY KEY NOT NULL,
    status                  TEXT NOT NULL CHECK(status IN ('created','running','paused','completed','failed','killed','terminated','deleted')),
    problem_statement       TEXT NOT NULL,
    persona_variant         INTEGER NOT NULL CHECK(persona_variant IN (3,5)),
    round_number            INTEGER NOT NULL DEFAULT 0,
    total_sub_problems      INTEGER NOT NULL DEFAULT 0,
    last_completed_sp_index INTEGER,
    sp_checkpoint_at        TEXT,
    recovery_needed         INTEGER NOT NULL DEFAULT 0,
    has_untracked_costs     INTEGER NOT NULL DEFAULT 0,
    terminated_at           TEXT,
    termination_type        TEXT CHECK(termination_type IN ('blocker_identified','user_cancelled','continue_best_effort','admin_terminated','cost_exceeded','duration_exceeded')),
    termination_reason      TEXT,
    failure_reason          TEXT,
    billable_portion        REAL,
    expert_count            INTEGER NOT NULL DEFAULT 0,
    contribution_count      INTEGER NOT NULL DEFAULT 0,
    focus_area_count        INTEGER NOT NULL DEFAULT 0,
    task_count              INTEGER NOT NULL DEFAULT 0,
    total_cost              REAL NOT NULL DEFAULT 0,
    resume_attempts         INTEGER NOT NULL DEFAULT 0,
    created_at              TEXT NOT NULL,
    updated_at              TEXT NOT NULL,
    started_at              TEXT
);

CREATE TABLE IF NOT EXISTS sub_problem (
    session_id        TEXT NOT NULL,
    sub_problem_index INTEGER NOT NULL,
    statement         TEXT NOT NULL,
    personas          TEXT NOT NULL,
    created_at        TEXT NOT NULL,
    PRIMARY KEY (session_id, sub_problem_index)
);

CREATE TABLE IF NOT EXISTS contribution (
    id                TEXT PRIMARY KEY NOT NULL,
    session_id        TEXT NOT NULL,
    persona_code      TEXT NOT NULL,
    sub_problem_index INTEGER NOT NULL,
    round_number      INTEGER NOT NULL,
    status            TEXT NOT NULL CHECK(status IN ('in_flight','committed','rolled_back')),
    content           TEXT NOT NULL,
    embedding         TEXT,
    created_at        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS recommendation (
    id                TEXT PRIMARY KEY NOT NULL,
    session_id        TEXT NOT NULL,
    sub_problem_index INTEGER NOT NULL,
    content           TEXT NOT NULL,
    created_at        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS event (
    session_id  TEXT NOT NULL,
    sequence    INTEGER NOT NULL,
    event_type  TEXT NOT NULL,
    payload     TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    PRIMARY KEY (session_id, sequence)
);

CREATE TABLE IF NOT EXISTS cost_record (
    id                TEXT PRIMARY KEY NOT NULL,
    session_id        TEXT NOT NULL,
    contribution_id   TEXT,
    recommendation_id TEXT,
    sub_problem_index INTEGER,
    amount            REAL NOT NULL,
    feature           TEXT NOT NULL CHECK(feature IN ('decomposition','contribution','convergence','synthesis')),
    created_at        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_contribution_session ON contribution(session_id);
CREATE INDEX IF NOT EXISTS idx_contribution_sp ON contribution(session_id, sub_problem_index, status);
CREATE INDEX IF NOT EXISTS idx_recommendation_session ON recommendation(session_id);
CREATE INDEX IF NOT EXISTS idx_cost_session ON cost_record(session_id);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
