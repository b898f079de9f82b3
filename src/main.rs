#![forbid(unsafe_code)]

//! `deliberd` — maintenance daemon binary.
//!
//! Bootstraps configuration and the database, reports sessions awaiting
//! recovery, and runs the retention purge until shutdown. Deliberation
//! itself runs wherever the embedding application constructs an
//! [`deliberd::Engine`] with its collaborator implementations.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use deliberd::config::EngineConfig;
use deliberd::persistence::{db, retention, session_repo::SessionRepo};
use deliberd::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "deliberd", about = "Deliberation session maintenance daemon", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("deliberd daemon bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config_text = std::fs::read_to_string(&args.config)
        .map_err(|err| AppError::Config(format!("cannot read config: {err}")))?;
    let config = Arc::new(EngineConfig::from_toml_str(&config_text)?);
    info!("configuration loaded");

    // ── Initialize database ─────────────────────────────
    let db_path = config.db_path().to_string_lossy().to_string();
    let db = Arc::new(db::connect(&db_path).await?);
    info!("database connected");

    // ── Report sessions awaiting recovery ───────────────
    report_recovery_backlog(&db).await;

    // ── Start retention service ─────────────────────────
    let ct = CancellationToken::new();
    let retention_handle = retention::spawn_retention_task(
        Arc::clone(&db),
        config.recovery.retention_days,
        ct.clone(),
    );
    info!("retention service started");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    let _ = retention_handle.await;
    info!("deliberd daemon shut down");
    Ok(())
}

/// Log sessions left `running` with `recovery_needed` by a prior crash.
async fn report_recovery_backlog(db: &Arc<db::Database>) {
    let _span = tracing::info_span!("startup_recovery_check").entered();
    let sessions = SessionRepo::new(Arc::clone(db));

    match sessions.list_recovery_needed().await {
        Ok(pending) if pending.is_empty() => {
            info!("no sessions awaiting recovery");
        }
        Ok(pending) => {
            info!(
                count = pending.len(),
                session_ids = ?pending,
                "sessions awaiting recovery; the engine will resume them on its next scan"
            );
        }
        Err(err) => error!(%err, "failed to query recovery backlog"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
