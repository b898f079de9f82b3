#![forbid(unsafe_code)]

//! `deliberd` — durable orchestration engine for multi-agent deliberation
//! sessions.
//!
//! A session's problem statement is decomposed into sub-problems; a panel of
//! expert personas produces rounds of concurrent contributions per
//! sub-problem; results are synthesized into per-sub-problem
//! recommendations. This crate owns the durable state machine that drives a
//! session through its phases, checkpoints progress at sub-problem
//! boundaries, and recovers cleanly after partial failure.

pub mod audit;
pub mod config;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod persistence;

pub use config::EngineConfig;
pub use errors::{AppError, Result};
pub use orchestrator::Engine;
