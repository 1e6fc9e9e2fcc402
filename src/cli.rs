//! Operator commands.
//!
//! Inspection and administration of sessions from the command line. The
//! continuous sweep loop is driven by the binary; everything else runs once
//! and returns a [`CliResult`].

use clap::Subcommand;

use crate::manager::{BulkReport, SessionManager, Sweeper};
use crate::session::SessionStatus;
use crate::storage::{CaptureEntry, InstrumentRecord, InstrumentResponse, Session};

/// Operator subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Expire lapsed sessions and remove orphaned captures
    Sweep {
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
    },

    /// Show a session with its instances and captures
    Show {
        /// Session id
        session_id: String,
    },

    /// List an owner's sessions
    List {
        /// Owner id
        owner_id: String,
    },

    /// Reset sessions for a new attempt
    Reset {
        /// Session ids
        #[arg(required = true)]
        session_ids: Vec<String>,

        /// Why the sessions are reset
        #[arg(long)]
        reason: String,
    },

    /// Fail a session
    Fail {
        /// Session id
        session_id: String,

        /// Why the session failed
        #[arg(long)]
        reason: String,
    },

    /// Delete sessions with everything they own
    Delete {
        /// Session ids
        #[arg(required = true)]
        session_ids: Vec<String>,
    },
}

/// Result of CLI command execution.
pub struct CliResult {
    /// Exit code (0 = success)
    pub exit_code: i32,
    /// Output message
    pub message: String,
}

impl CliResult {
    /// Create a success result with the given message.
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            message: message.into(),
        }
    }

    /// Create an error result with the given message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            message: message.into(),
        }
    }
}

/// Execute a one-shot command.
pub async fn execute_command(command: Commands, manager: &SessionManager, sweeper: &Sweeper) -> CliResult {
    match command {
        Commands::Sweep { .. } => execute_sweep(sweeper).await,
        Commands::Show { session_id } => execute_show(manager, &session_id).await,
        Commands::List { owner_id } => execute_list(manager, &owner_id).await,
        Commands::Reset {
            session_ids,
            reason,
        } => bulk_result("Reset", manager.reset_sessions(&session_ids, &reason).await),
        Commands::Fail { session_id, reason } => {
            match manager.fail_session(&session_id, &reason).await {
                Ok(session) => CliResult::success(format!(
                    "Session {} is {}\n",
                    session.id, session.status
                )),
                Err(e) => CliResult::error(format!("Failed to fail session: {}", e)),
            }
        }
        Commands::Delete { session_ids } => {
            bulk_result("Delete", manager.delete_sessions(&session_ids).await)
        }
    }
}

async fn execute_sweep(sweeper: &Sweeper) -> CliResult {
    match sweeper.run_once().await {
        Ok(summary) => CliResult::success(format!(
            "Sessions expired: {}\nOrphan entries removed: {}\nOrphan files removed: {} ({} errors)\n",
            summary.sessions_expired,
            summary.orphans.entries_removed,
            summary.orphans.files_removed,
            summary.orphans.file_errors
        )),
        Err(e) => CliResult::error(format!("Sweep failed: {}", e)),
    }
}

async fn execute_show(manager: &SessionManager, session_id: &str) -> CliResult {
    let session = match manager.get_session(session_id).await {
        Ok(session) => session,
        Err(e) => return CliResult::error(format!("Failed to load session: {}", e)),
    };
    let records = match manager.get_instrument_records(session_id).await {
        Ok(records) => records,
        Err(e) => return CliResult::error(format!("Failed to load instances: {}", e)),
    };
    let captures = match manager.get_captures(session_id).await {
        Ok(captures) => captures,
        Err(e) => return CliResult::error(format!("Failed to load captures: {}", e)),
    };

    let mut output = String::new();
    output.push_str(&format_session(&session));

    output.push_str(&format!("\nInstances: {}\n", records.len()));
    for record in &records {
        output.push_str(&format_record(record));
    }

    output.push_str(&format!("\nCapture entries: {}\n", captures.len()));
    for entry in &captures {
        output.push_str(&format_capture(entry));
    }

    CliResult::success(output)
}

async fn execute_list(manager: &SessionManager, owner_id: &str) -> CliResult {
    match manager.list_owner_sessions(owner_id).await {
        Ok(sessions) if sessions.is_empty() => {
            CliResult::success(format!("No sessions for owner {}\n", owner_id))
        }
        Ok(sessions) => {
            let mut output = format!("Sessions of {}: {}\n", owner_id, sessions.len());
            for session in &sessions {
                output.push_str(&format!(
                    "  {} | {} | {:>3}% | attempt {} | created {}\n",
                    session.id,
                    session.status,
                    session.completion_percentage(),
                    session.attempt_count,
                    session.created_at.format("%Y-%m-%d %H:%M:%S")
                ));
            }
            CliResult::success(output)
        }
        Err(e) => CliResult::error(format!("Failed to list sessions: {}", e)),
    }
}

fn bulk_result(action: &str, report: BulkReport) -> CliResult {
    let mut output = format!(
        "{}: {} succeeded, {} failed\n",
        action,
        report.succeeded(),
        report.failed()
    );
    for item in &report.items {
        match &item.error {
            None => output.push_str(&format!("  ✓ {}\n", item.session_id)),
            Some(e) => output.push_str(&format!("  ✗ {}: {}\n", item.session_id, e)),
        }
    }

    if report.failed() == 0 {
        CliResult::success(output)
    } else {
        CliResult::error(output)
    }
}

fn format_session(session: &Session) -> String {
    let mut output = String::new();
    output.push_str(&format!("Session {}\n", session.id));
    output.push_str(&format!("  Owner: {}\n", session.owner_id));
    output.push_str(&format!(
        "  Status: {}{}\n",
        session.status,
        session
            .status_reason
            .as_deref()
            .map(|r| format!(" ({})", r))
            .unwrap_or_default()
    ));
    if !session.is_consistent() && session.status != SessionStatus::Failed {
        output.push_str(&format!(
            "  ⚠ Timestamps imply {}\n",
            session.derived_status()
        ));
    }
    output.push_str(&format!("  Completion: {}%\n", session.completion_percentage()));
    output.push_str(&format!("  First instrument: {}\n", session.first_instrument));
    output.push_str(&format!(
        "  Attempt: {} (resets: {})\n",
        session.attempt_count, session.reset_count
    ));
    output.push_str(&format!(
        "  Active: {} | Recoverable: {}\n",
        session.is_active, session.is_recoverable
    ));
    if let Some(duration) = session.duration_secs {
        output.push_str(&format!("  Duration: {}s\n", duration));
    }
    if let Some(reason) = &session.last_reset_reason {
        output.push_str(&format!("  Last reset: {}\n", reason));
    }
    output
}

fn format_record(record: &InstrumentRecord) -> String {
    let detail = match &record.response {
        InstrumentResponse::Questionnaire { answers } => format!("{} answers", answers.len()),
        InstrumentResponse::Interview { turns, assessment } => format!(
            "{} turns{}",
            turns.len(),
            if assessment.is_some() { ", scored" } else { "" }
        ),
    };
    format!(
        "  {} | {} | attempt {} | {} | {}\n",
        record.id,
        record.kind(),
        record.attempt,
        if record.is_completed() { "completed" } else { "open" },
        detail
    )
}

fn format_capture(entry: &CaptureEntry) -> String {
    format!(
        "  {} | {} | {} files | {}\n",
        entry.id,
        entry.kind,
        entry.files.len(),
        entry
            .instrument_instance_id
            .as_deref()
            .unwrap_or("pending")
    )
}
