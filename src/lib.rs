//! # Screening Orchestrator
//!
//! Session core for remote psychological screenings. A respondent moves
//! through consent, a camera check and two assessment instruments, a
//! fixed-choice questionnaire (A) and a conversational interview (B), while
//! webcam captures are collected and linked to the instrument they were taken
//! during.
//!
//! ## Features
//!
//! - **Session state machine**: explicit transition table, timestamp-derived
//!   status and weighted completion percentage
//! - **Orchestration**: per-session content generation, instrument completion,
//!   reset, interruption and time-bounded recovery
//! - **Capture ledger**: pending capture grouping, idempotent linking on
//!   completion and orphan sweeping
//! - **Session manager**: quotas, settings pinning, access tokens, cascade
//!   deletion and bulk administration
//!
//! ## Architecture
//!
//! ```text
//! SessionManager → Orchestrator → ConversationEngine (HTTP pipes)
//!        ↓              ↓
//!  CaptureLedger → FileStore (media dir)
//!        ↓
//!  SQLite (sessions, instances, captures, settings, tokens)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use screening_orchestrator::{Config, SessionManager};
//! use screening_orchestrator::engine::PipeClient;
//! use screening_orchestrator::files::LocalFileStore;
//! use screening_orchestrator::storage::SqliteStorage;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let storage = SqliteStorage::new(&config.database).await?;
//!     let engine = PipeClient::new(&config.engine, config.request.clone(), config.pipes.clone())?;
//!     let files = LocalFileStore::new(&config.capture.media_dir);
//!     let manager = SessionManager::new(storage, Arc::new(engine), Arc::new(files), config.session.clone());
//!     let created = manager.create_session("respondent-42").await?;
//!     println!("{}", created.access_token);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

/// Capture ledger: pending grouping, linking and orphan sweeping.
pub mod capture;
/// Operator command line.
pub mod cli;
/// Configuration management.
pub mod config;
/// Conversational engine seam and HTTP pipe client.
pub mod engine;
/// Error types and result aliases for the application.
pub mod error;
/// Capture payload storage.
pub mod files;
/// Session manager and periodic sweeps.
pub mod manager;
/// Session lifecycle orchestration.
pub mod orchestrator;
/// System prompts for the conversational engine.
pub mod prompts;
/// Session state machine.
pub mod session;
/// SQLite storage layer for persistence.
pub mod storage;

pub use config::Config;
pub use error::{AppError, AppResult, ErrorKind};
pub use manager::{CreatedSession, SessionManager, Sweeper};
pub use orchestrator::Orchestrator;
pub use session::{InstrumentKind, SessionStatus};
