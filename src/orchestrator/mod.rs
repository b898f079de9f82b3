//! Session orchestration modules.
//!
//! Covers the per-session driver (state machine), sub-problem scheduling,
//! event sequencing, termination handling, and crash recovery. The
//! [`Engine`] composes these behind the API exposed to collaborators.

pub mod collaborators;
pub mod driver;
pub mod recovery;
pub mod scheduler;
pub mod sequencer;
pub mod termination;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::audit::KillAuditLogger;
use crate::config::EngineConfig;
use crate::models::cost::CostRecord;
use crate::models::event::EventType;
use crate::models::session::{PersonaVariant, Session, SessionStatus, TerminationType};
use crate::persistence::contribution_repo::{ContributionRepo, RecommendationRepo};
use crate::persistence::cost_repo::CostRepo;
use crate::persistence::db::Database;
use crate::persistence::session_repo::SessionRepo;
use crate::{AppError, Result};

use collaborators::Collaborators;
use driver::DriverMode;
use recovery::ScanReport;
use sequencer::{EventSequencer, EventSubscription};
use termination::{TerminationRequest, TerminationSignal};

/// Everything a session driver needs, passed explicitly through every call.
///
/// The per-session `running` lock (CAS on status) is the only cross-driver
/// coordination point; there is no process-wide mutable session state beyond
/// the engine's driver registry.
#[derive(Clone)]
pub struct SessionContext {
    /// Session this context drives.
    pub session_id: String,
    /// Panel size fixed by the session's variant.
    pub panel_size: u32,
    /// Engine configuration.
    pub config: Arc<EngineConfig>,
    /// Session repository.
    pub sessions: SessionRepo,
    /// Contribution repository.
    pub contributions: ContributionRepo,
    /// Recommendation repository.
    pub recommendations: RecommendationRepo,
    /// Cost ledger repository.
    pub costs: CostRepo,
    /// Event sequencer shared across the engine.
    pub sequencer: Arc<EventSequencer>,
    /// External collaborator seams.
    pub collaborators: Arc<Collaborators>,
    /// Kill audit sink.
    pub audit: Arc<dyn KillAuditLogger>,
    /// Termination flag shared with the engine API.
    pub signal: Arc<TerminationSignal>,
    /// Process shutdown token.
    pub shutdown: CancellationToken,
}

impl SessionContext {
    /// Ledger a cost record; a failed write flips `has_untracked_costs`
    /// instead of failing the caller.
    pub async fn record_cost(&self, record: CostRecord) {
        if let Err(err) = self.costs.insert(&record).await {
            warn!(
                session_id = %self.session_id,
                %err,
                "cost write failed; flagging untracked costs"
            );
            if let Err(flag_err) = self.sessions.flag_untracked_costs(&self.session_id).await {
                warn!(%flag_err, "failed to flag untracked costs");
            }
        }
    }
}

/// Aggregate cost view exposed to billing collaborators.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionCost {
    /// Ledger sum for the session.
    pub total_cost: f64,
    /// Whether some costs could not be recorded and need reconciliation.
    pub has_untracked_costs: bool,
}

struct DriverHandle {
    signal: Arc<TerminationSignal>,
    join: JoinHandle<()>,
}

/// The session orchestration engine.
///
/// Owns the driver registry and composes the sequencer, scheduler,
/// termination handler, and recovery manager behind the exposed API.
pub struct Engine {
    config: Arc<EngineConfig>,
    db: Arc<Database>,
    collaborators: Arc<Collaborators>,
    sequencer: Arc<EventSequencer>,
    audit: Arc<dyn KillAuditLogger>,
    drivers: Mutex<HashMap<String, DriverHandle>>,
    shutdown: CancellationToken,
}

impl Engine {
    /// Construct an engine over a connected database.
    #[must_use]
    pub fn new(
        config: Arc<EngineConfig>,
        db: Arc<Database>,
        collaborators: Collaborators,
        audit: Arc<dyn KillAuditLogger>,
    ) -> Arc<Self> {
        let sequencer = Arc::new(EventSequencer::new(Arc::clone(&db)));
        Arc::new(Self {
            config,
            db,
            collaborators: Arc::new(collaborators),
            sequencer,
            audit,
            drivers: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn session_repo(&self) -> SessionRepo {
        SessionRepo::new(Arc::clone(&self.db))
    }

    fn context(&self, session_id: &str, panel_size: u32, signal: Arc<TerminationSignal>) -> SessionContext {
        SessionContext {
            session_id: session_id.to_owned(),
            panel_size,
            config: Arc::clone(&self.config),
            sessions: SessionRepo::new(Arc::clone(&self.db)),
            contributions: ContributionRepo::new(Arc::clone(&self.db)),
            recommendations: RecommendationRepo::new(Arc::clone(&self.db)),
            costs: CostRepo::new(Arc::clone(&self.db)),
            sequencer: Arc::clone(&self.sequencer),
            collaborators: Arc::clone(&self.collaborators),
            audit: Arc::clone(&self.audit),
            signal,
            shutdown: self.shutdown.child_token(),
        }
    }

    fn has_live_driver(&self, session_id: &str) -> bool {
        self.drivers
            .lock()
            .map(|drivers| {
                drivers
                    .get(session_id)
                    .is_some_and(|handle| !handle.join.is_finished())
            })
            .unwrap_or(false)
    }

    async fn spawn_driver(&self, session_id: &str, mode: DriverMode) -> Result<()> {
        let session = self.session_repo().require(session_id).await?;
        let signal = Arc::new(TerminationSignal::new());
        let ctx = self.context(
            session_id,
            session.persona_variant.panel_size(),
            Arc::clone(&signal),
        );

        let mut drivers = self
            .drivers
            .lock()
            .map_err(|_| AppError::DriverConflict("driver registry poisoned".into()))?;
        if let Some(existing) = drivers.get(session_id) {
            if !existing.join.is_finished() {
                return Err(AppError::DriverConflict(format!(
                    "session {session_id} already has a live driver"
                )));
            }
        }

        let join = tokio::spawn(driver::drive(ctx, mode));
        drivers.insert(session_id.to_owned(), DriverHandle { signal, join });
        Ok(())
    }

    /// Start (or idempotently re-start) a session.
    ///
    /// Creates the session row if absent, performs the compare-and-swap into
    /// `running`, and spawns the driver. A caller that loses the CAS race
    /// returns without side effects; calling on an already `running` or
    /// `completed` session is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the session is in a terminal
    /// failure state, or `AppError::Db` on persistence failure.
    pub async fn start_session(
        &self,
        session_id: &str,
        problem_statement: &str,
        persona_variant: PersonaVariant,
    ) -> Result<()> {
        let sessions = self.session_repo();

        let existing = sessions.get_by_id(session_id).await?;
        let session = if let Some(session) = existing {
            session
        } else {
            let fresh = Session::with_id(
                session_id.to_owned(),
                problem_statement.to_owned(),
                persona_variant,
            );
            match sessions.create(&fresh).await {
                Ok(created) => created,
                // Lost a creation race; the row exists now.
                Err(_) => sessions.require(session_id).await?,
            }
        };

        let was_paused = match session.status {
            SessionStatus::Running | SessionStatus::Completed => {
                info!(session_id, status = ?session.status, "start_session is a no-op");
                return Ok(());
            }
            SessionStatus::Created => false,
            SessionStatus::Paused => true,
            other => {
                return Err(AppError::InvalidTransition(format!(
                    "cannot start session in status {other:?}"
                )));
            }
        };

        if !sessions.try_acquire_running(session_id).await? {
            // CAS failure: another driver won. Idempotent for running and
            // completed sessions, an error otherwise.
            let current = sessions.require(session_id).await?;
            if matches!(
                current.status,
                SessionStatus::Running | SessionStatus::Completed
            ) {
                return Ok(());
            }
            return Err(AppError::DriverConflict(format!(
                "session {session_id} changed state during start"
            )));
        }

        let mode = if was_paused {
            DriverMode::Resume {
                replay_round: None,
                from_recovery: false,
            }
        } else {
            DriverMode::Fresh
        };
        self.spawn_driver(session_id, mode).await
    }

    /// Pause a running session. The driver observes the pause at its next
    /// suspension point, emits `session_paused`, and exits.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the session is not running.
    pub async fn pause_session(&self, session_id: &str) -> Result<Session> {
        let session = self
            .session_repo()
            .update_status(session_id, SessionStatus::Paused)
            .await?;
        info!(session_id, "session pause requested");
        Ok(session)
    }

    /// Resume a paused session with a fresh driver.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the session is not paused.
    pub async fn resume_session(&self, session_id: &str) -> Result<()> {
        let sessions = self.session_repo();
        let session = sessions.require(session_id).await?;
        if session.status != SessionStatus::Paused {
            return Err(AppError::InvalidTransition(format!(
                "cannot resume session in status {:?}",
                session.status
            )));
        }
        if !sessions.try_acquire_running(session_id).await? {
            return Err(AppError::DriverConflict(format!(
                "session {session_id} changed state during resume"
            )));
        }
        self.spawn_driver(
            session_id,
            DriverMode::Resume {
                replay_round: None,
                from_recovery: false,
            },
        )
        .await
    }

    /// Request termination of a session.
    ///
    /// With a live driver the request lands at the next clean boundary
    /// (immediately, for abandoning types). Without one — paused sessions,
    /// or crashed sessions not yet resumed — finalization runs inline.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Termination` if the session is already terminal,
    /// or `AppError::Db` on persistence failure.
    pub async fn request_termination(
        &self,
        session_id: &str,
        termination_type: TerminationType,
        reason: Option<String>,
    ) -> Result<()> {
        let actor = match termination_type {
            TerminationType::AdminTerminated => "admin",
            TerminationType::CostExceeded | TerminationType::DurationExceeded => "system",
            _ => "user",
        };
        let request = TerminationRequest {
            termination_type,
            reason,
            actor: actor.into(),
        };

        let live_signal = self
            .drivers
            .lock()
            .ok()
            .and_then(|drivers| {
                drivers
                    .get(session_id)
                    .filter(|handle| !handle.join.is_finished())
                    .map(|handle| Arc::clone(&handle.signal))
            });

        if let Some(signal) = live_signal {
            if !signal.request(request) {
                info!(session_id, "termination already pending; request ignored");
            }
            return Ok(());
        }

        let session = self.session_repo().require(session_id).await?;
        if session.status.is_terminal() {
            return Err(AppError::Termination(format!(
                "session {session_id} is already terminal"
            )));
        }

        let ctx = self.context(
            session_id,
            session.persona_variant.panel_size(),
            Arc::new(TerminationSignal::new()),
        );
        termination::finalize_termination(&ctx, &request).await?;
        Ok(())
    }

    /// Soft-delete a terminal session, emitting the final event.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the session is not in a
    /// terminal state.
    pub async fn delete_session(&self, session_id: &str) -> Result<Session> {
        let session = self
            .session_repo()
            .update_status(session_id, SessionStatus::Deleted)
            .await?;
        self.sequencer
            .append(session_id, EventType::SessionDeleted, json!({}))
            .await?;
        info!(session_id, "session soft-deleted");
        Ok(session)
    }

    /// Subscribe to a session's ordered event stream from `from_sequence`
    /// (exclusive). Reconnecting clients pass their last seen sequence.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the backlog query fails.
    pub async fn subscribe_events(
        &self,
        session_id: &str,
        from_sequence: i64,
    ) -> Result<EventSubscription> {
        self.sequencer.subscribe(session_id, from_sequence).await
    }

    /// Session ids awaiting recovery, for the scan job.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_recovery_needed(&self) -> Result<Vec<String>> {
        let sessions = self.session_repo();
        let mut candidates = sessions.list_recovery_needed().await?;
        for id in sessions.list_checkpoint_lagging().await? {
            if !candidates.contains(&id) {
                candidates.push(id);
            }
        }
        Ok(candidates)
    }

    /// Aggregate cost and untracked-cost flag for a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist.
    pub async fn get_session_cost(&self, session_id: &str) -> Result<SessionCost> {
        let session = self.session_repo().require(session_id).await?;
        let total_cost = CostRepo::new(Arc::clone(&self.db))
            .total_for_session(session_id)
            .await?;
        Ok(SessionCost {
            total_cost,
            has_untracked_costs: session.has_untracked_costs,
        })
    }

    /// One recovery scan pass: repair interrupted sessions and hand them
    /// back to drivers, failing any that exhausted their resume attempts.
    ///
    /// Idempotent: a pass over consistent sessions changes nothing.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if candidate listing fails; per-session
    /// repairs log and continue.
    pub async fn run_recovery_scan(&self) -> Result<ScanReport> {
        let sessions = self.session_repo();
        let contributions = ContributionRepo::new(Arc::clone(&self.db));
        let candidates = self.list_recovery_needed().await?;

        let mut report = ScanReport::default();
        for session_id in candidates {
            report.scanned += 1;

            if self.has_live_driver(&session_id) {
                report.skipped_live += 1;
                continue;
            }

            let attempts = match sessions.increment_resume_attempts(&session_id).await {
                Ok(attempts) => attempts,
                Err(err) => {
                    error!(session_id = %session_id, %err, "failed to count resume attempt");
                    continue;
                }
            };
            if attempts > self.config.recovery.max_resume_attempts {
                let reason = "recovery retries exhausted";
                if let Err(err) = self
                    .sequencer
                    .append(&session_id, EventType::SessionFailed, json!({ "reason": reason }))
                    .await
                {
                    error!(session_id = %session_id, %err, "failed to sequence session_failed event");
                }
                match sessions.set_failed(&session_id, reason).await {
                    Ok(_) => report.failed += 1,
                    Err(err) => error!(session_id = %session_id, %err, "failed to fail session"),
                }
                continue;
            }

            match recovery::repair_session(&sessions, &contributions, &session_id).await {
                Ok(outcome) => {
                    let mode = DriverMode::Resume {
                        replay_round: outcome.replay_round,
                        from_recovery: true,
                    };
                    match self.spawn_driver(&session_id, mode).await {
                        Ok(()) => report.resumed += 1,
                        Err(err) => error!(session_id = %session_id, %err, "failed to resume session"),
                    }
                }
                Err(err) => {
                    error!(session_id = %session_id, %err, "session repair failed");
                }
            }
        }

        Ok(report)
    }

    /// Graceful shutdown: cancel drivers at clean boundaries, wait for them,
    /// and leave still-running sessions flagged for the next boot's scan.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let handles: Vec<(String, DriverHandle)> = match self.drivers.lock() {
            Ok(mut drivers) => drivers.drain().collect(),
            Err(_) => Vec::new(),
        };
        for (session_id, handle) in handles {
            if let Err(err) = handle.join.await {
                error!(session_id = %session_id, %err, "driver task join failed during shutdown");
            }
        }

        let sessions = self.session_repo();
        match sessions.list_running().await {
            Ok(running) => {
                for session in running {
                    if let Err(err) = sessions.set_recovery_needed(&session.id, true).await {
                        error!(session_id = %session.id, %err, "failed to park session at shutdown");
                    }
                }
            }
            Err(err) => error!(%err, "failed to list running sessions at shutdown"),
        }

        info!("engine shut down");
    }
}
