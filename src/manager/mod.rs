//! Session manager.
//!
//! The outer surface of the core: session creation with quota and settings
//! checks, lookups, the lifecycle operations of the orchestrator, capture
//! operations, cascade deletion, bulk administration and the periodic sweeps.

mod sweeper;

pub use sweeper::{SweepSummary, Sweeper};

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::capture::{CaptureLedger, CaptureUpload, OrphanSweepReport};
use crate::config::SessionConfig;
use crate::engine::ConversationEngine;
use crate::error::{AppError, AppResult};
use crate::files::FileStore;
use crate::orchestrator::{
    CameraCheckOutcome, CompletionOutcome, InterviewReply, Orchestrator, RecoveryOutcome,
    ResetOutcome,
};
use crate::session::{assign_first_instrument, InstrumentKind, SessionStatus};
use crate::storage::{
    AccessToken, Admission, AspectScore, CaptureEntry, InstrumentRecord, Session, SettingsKind,
    SettingsPins, SettingsProvider, SqliteStorage, Storage,
};

/// A freshly created session and its raw access token.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedSession {
    pub session: Session,
    /// Shown once; only its hash is stored.
    pub access_token: String,
}

/// What a cascade delete removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    /// Capture entries removed with the session.
    pub capture_entries: usize,
    /// Capture files removed from the file store.
    pub files_removed: usize,
    /// Capture files that could not be removed.
    pub file_errors: usize,
}

/// Per-session result of a bulk operation.
#[derive(Debug, Clone, Serialize)]
pub struct BulkItem {
    pub session_id: String,
    /// `None` on success.
    pub error: Option<String>,
}

/// Result of a bulk operation. One failing session does not stop the rest.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkReport {
    pub items: Vec<BulkItem>,
}

impl BulkReport {
    fn push<T>(&mut self, session_id: &str, result: AppResult<T>) {
        self.items.push(BulkItem {
            session_id: session_id.to_string(),
            error: result.err().map(|e| e.to_string()),
        });
    }

    /// Sessions the operation succeeded for.
    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|i| i.error.is_none()).count()
    }

    /// Sessions the operation failed for.
    pub fn failed(&self) -> usize {
        self.items.len() - self.succeeded()
    }
}

/// Session manager.
#[derive(Clone)]
pub struct SessionManager {
    storage: SqliteStorage,
    orchestrator: Orchestrator,
    ledger: CaptureLedger,
    config: SessionConfig,
}

impl SessionManager {
    /// Wire a manager over the store, the conversational engine and the file store.
    pub fn new(
        storage: SqliteStorage,
        engine: Arc<dyn ConversationEngine>,
        files: Arc<dyn FileStore>,
        config: SessionConfig,
    ) -> Self {
        let ledger = CaptureLedger::new(storage.clone(), files);
        let orchestrator =
            Orchestrator::new(storage.clone(), engine, ledger.clone(), config.clone());
        Self {
            storage,
            orchestrator,
            ledger,
            config,
        }
    }

    /// The orchestrator behind the lifecycle operations.
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// The capture ledger.
    pub fn ledger(&self) -> &CaptureLedger {
        &self.ledger
    }

    /// The underlying store.
    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    /// Create a session for an owner.
    ///
    /// Refused when the owner has reached the completed-session limit, when
    /// the owner still has an unresolved session, or when any settings kind
    /// lacks a default bundle. The new session pins the current defaults,
    /// gets its instrument order from the owner id and its content generated
    /// before it is stored.
    pub async fn create_session(&self, owner_id: &str) -> AppResult<CreatedSession> {
        let owner_id = owner_id.trim();
        if owner_id.is_empty() {
            return Err(AppError::Validation {
                field: "owner_id".to_string(),
                reason: "owner id is empty".to_string(),
            });
        }

        let config = &self.config;
        let existing = self.storage.get_owner_sessions(owner_id).await?;
        check_owner_quota(&existing, config, Utc::now()).map_err(|reason| {
            AppError::QuotaExceeded {
                owner_id: owner_id.to_string(),
                reason,
            }
        })?;

        let pins = self.default_pins().await?;
        let mut session = Session::new(owner_id, assign_first_instrument(owner_id), pins);
        self.orchestrator.initialize(&mut session).await?;

        // Checked again under the write lock against sessions created meanwhile.
        let check = |others: &[Session]| check_owner_quota(others, config, Utc::now());
        let (token, access_token) = AccessToken::issue(&session.id);
        match self
            .storage
            .create_owner_session(&session, &token, &check)
            .await?
        {
            Admission::Created => {}
            Admission::Refused(reason) => {
                return Err(AppError::QuotaExceeded {
                    owner_id: owner_id.to_string(),
                    reason,
                })
            }
        }

        info!(
            session_id = %session.id,
            owner_id = %owner_id,
            first_instrument = %session.first_instrument,
            "Session created"
        );
        Ok(CreatedSession {
            session,
            access_token,
        })
    }

    /// A session by id.
    pub async fn get_session(&self, session_id: &str) -> AppResult<Session> {
        self.orchestrator.get_session(session_id).await
    }

    /// The owner's session currently being worked on, if any.
    pub async fn get_active_session(&self, owner_id: &str) -> AppResult<Option<Session>> {
        let sessions = self.storage.get_owner_sessions(owner_id).await?;
        Ok(sessions.into_iter().rev().find(|s| {
            s.is_active && !s.status.is_terminal() && !s.status.is_interrupted()
        }))
    }

    /// The owner's interrupted session that can still be recovered, if any.
    pub async fn get_recoverable_session(&self, owner_id: &str) -> AppResult<Option<Session>> {
        let now = Utc::now();
        let sessions = self.storage.get_owner_sessions(owner_id).await?;
        Ok(sessions.into_iter().rev().find(|s| {
            s.status.is_interrupted()
                && s.is_recoverable
                && !s.is_expired(now, self.config.recovery_ttl_hours)
        }))
    }

    /// All sessions of an owner, oldest first.
    pub async fn list_owner_sessions(&self, owner_id: &str) -> AppResult<Vec<Session>> {
        Ok(self.storage.get_owner_sessions(owner_id).await?)
    }

    /// Resolve a raw access token to its session.
    pub async fn resolve_token(&self, raw_token: &str) -> AppResult<Session> {
        let token = self
            .storage
            .get_token(&AccessToken::hash(raw_token))
            .await?
            .ok_or_else(|| AppError::NotFound {
                entity: "Access token",
                id: "<redacted>".to_string(),
            })?;

        if !token.is_valid() {
            return Err(AppError::precondition("access token has been revoked"));
        }
        self.get_session(&token.session_id).await
    }

    /// Instrument instances of a session.
    pub async fn get_instrument_records(&self, session_id: &str) -> AppResult<Vec<InstrumentRecord>> {
        Ok(self.storage.get_session_instrument_records(session_id).await?)
    }

    // Lifecycle

    /// See [`Orchestrator::begin`].
    pub async fn begin_session(&self, session_id: &str) -> AppResult<Session> {
        self.orchestrator.begin(session_id).await
    }

    /// See [`Orchestrator::record_consent`].
    pub async fn record_consent(&self, session_id: &str) -> AppResult<Session> {
        self.orchestrator.record_consent(session_id).await
    }

    /// See [`Orchestrator::record_camera_check`].
    pub async fn record_camera_check(
        &self,
        session_id: &str,
        passed: bool,
    ) -> AppResult<CameraCheckOutcome> {
        self.orchestrator.record_camera_check(session_id, passed).await
    }

    /// See [`Orchestrator::start_instrument`].
    pub async fn start_instrument(
        &self,
        session_id: &str,
        kind: InstrumentKind,
    ) -> AppResult<InstrumentRecord> {
        self.orchestrator.start_instrument(session_id, kind).await
    }

    /// See [`Orchestrator::record_answers`].
    pub async fn record_answers(
        &self,
        session_id: &str,
        answers: std::collections::BTreeMap<String, u8>,
    ) -> AppResult<InstrumentRecord> {
        self.orchestrator.record_answers(session_id, answers).await
    }

    /// See [`Orchestrator::send_interview_message`].
    pub async fn send_interview_message(
        &self,
        session_id: &str,
        message: &str,
    ) -> AppResult<InterviewReply> {
        self.orchestrator.send_interview_message(session_id, message).await
    }

    /// See [`Orchestrator::complete_instrument`].
    pub async fn complete_instrument(
        &self,
        session_id: &str,
        kind: InstrumentKind,
    ) -> AppResult<CompletionOutcome> {
        self.orchestrator.complete_instrument(session_id, kind).await
    }

    /// See [`Orchestrator::score_interview`].
    pub async fn score_interview(
        &self,
        session_id: &str,
    ) -> AppResult<std::collections::BTreeMap<String, AspectScore>> {
        self.orchestrator.score_interview(session_id).await
    }

    /// See [`Orchestrator::reset`].
    pub async fn reset_session(&self, session_id: &str, reason: &str) -> AppResult<ResetOutcome> {
        self.orchestrator.reset(session_id, reason).await
    }

    /// See [`Orchestrator::abandon`].
    pub async fn abandon_session(&self, session_id: &str, reason: &str) -> AppResult<Session> {
        self.orchestrator.abandon(session_id, reason).await
    }

    /// See [`Orchestrator::mark_incomplete`].
    pub async fn mark_incomplete(&self, session_id: &str, reason: &str) -> AppResult<Session> {
        self.orchestrator.mark_incomplete(session_id, reason).await
    }

    /// See [`Orchestrator::fail`].
    pub async fn fail_session(&self, session_id: &str, reason: &str) -> AppResult<Session> {
        self.orchestrator.fail(session_id, reason).await
    }

    /// See [`Orchestrator::recover`].
    pub async fn recover_session(
        &self,
        session_id: &str,
        clear_data: bool,
    ) -> AppResult<RecoveryOutcome> {
        self.orchestrator.recover(session_id, clear_data).await
    }

    /// Delete a session with its instances, captures and tokens, then its capture files.
    pub async fn delete_session(&self, session_id: &str) -> AppResult<DeleteReport> {
        let removed = self.storage.delete_session(session_id).await.map_err(|e| match e {
            crate::error::StorageError::SessionNotFound { session_id } => {
                AppError::session_not_found(session_id)
            }
            other => other.into(),
        })?;

        let purge = self.ledger.purge_files(&removed).await;
        let report = DeleteReport {
            capture_entries: removed.len(),
            files_removed: purge.removed,
            file_errors: purge.failed,
        };

        info!(
            session_id = %session_id,
            captures = report.capture_entries,
            files = report.files_removed,
            "Session deleted"
        );
        Ok(report)
    }

    // Captures

    /// See [`CaptureLedger::append_capture`].
    pub async fn append_capture(
        &self,
        session_id: &str,
        bytes: &[u8],
        trigger: &str,
    ) -> AppResult<CaptureEntry> {
        self.ledger.append_capture(session_id, bytes, trigger).await
    }

    /// See [`CaptureLedger::append_linked_batch`].
    pub async fn append_linked_batch(
        &self,
        session_id: &str,
        instance_id: &str,
        kind: InstrumentKind,
        uploads: Vec<CaptureUpload>,
    ) -> AppResult<CaptureEntry> {
        self.ledger
            .append_linked_batch(session_id, instance_id, kind, uploads)
            .await
    }

    /// See [`CaptureLedger::link_pending_captures`].
    pub async fn link_pending_captures(
        &self,
        session_id: &str,
        instance_id: &str,
        kind: InstrumentKind,
    ) -> AppResult<Option<CaptureEntry>> {
        self.ledger
            .link_pending_captures(session_id, instance_id, kind)
            .await
    }

    /// See [`CaptureLedger::get_captures`].
    pub async fn get_captures(&self, session_id: &str) -> AppResult<Vec<CaptureEntry>> {
        self.ledger.get_captures(session_id).await
    }

    // Bulk administration

    /// Reset several sessions with one reason.
    pub async fn reset_sessions(&self, session_ids: &[String], reason: &str) -> BulkReport {
        let mut report = BulkReport::default();
        for id in session_ids {
            let result = self.orchestrator.reset(id, reason).await;
            report.push(id, result);
        }
        info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            "Bulk reset finished"
        );
        report
    }

    /// Delete several sessions.
    pub async fn delete_sessions(&self, session_ids: &[String]) -> BulkReport {
        let mut report = BulkReport::default();
        for id in session_ids {
            let result = self.delete_session(id).await;
            report.push(id, result);
        }
        info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            "Bulk delete finished"
        );
        report
    }

    // Sweeps

    /// Fail interrupted sessions whose recovery window has passed.
    pub async fn expire_recoverable_sessions(&self) -> AppResult<usize> {
        let now = Utc::now();
        let candidates = self
            .storage
            .get_sessions_by_status(&[SessionStatus::Incomplete, SessionStatus::Abandoned])
            .await?;

        let mut expired = 0;
        for session in candidates
            .iter()
            .filter(|s| s.is_expired(now, self.config.recovery_ttl_hours))
        {
            match self.orchestrator.expire(&session.id).await {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(e) => warn!(session_id = %session.id, error = %e, "Failed to expire session"),
            }
        }
        Ok(expired)
    }

    /// See [`CaptureLedger::sweep_orphans`].
    pub async fn sweep_orphan_captures(&self, max_age: Duration) -> AppResult<OrphanSweepReport> {
        self.ledger.sweep_orphans(max_age).await
    }

    async fn default_pins(&self) -> AppResult<SettingsPins> {
        let mut missing = Vec::new();
        let mut ids = Vec::with_capacity(SettingsKind::ALL.len());

        for kind in SettingsKind::ALL {
            match self.storage.get_default(kind).await? {
                Some(bundle) => ids.push(bundle.id),
                None => missing.push(kind.as_str()),
            }
        }

        if !missing.is_empty() {
            return Err(AppError::SettingsIncomplete {
                missing: missing.join(", "),
            });
        }

        let mut ids = ids.into_iter();
        match (ids.next(), ids.next(), ids.next()) {
            (Some(questionnaire), Some(interview), Some(capture)) => Ok(SettingsPins {
                questionnaire,
                interview,
                capture,
            }),
            _ => Err(AppError::Internal {
                message: "default bundle lookup returned too few bundles".to_string(),
            }),
        }
    }
}

/// Refuse an owner who has used up the completed-session limit or still has
/// an unresolved session. Interrupted sessions past their recovery window no
/// longer count as unresolved.
fn check_owner_quota(
    existing: &[Session],
    config: &SessionConfig,
    now: DateTime<Utc>,
) -> Result<(), String> {
    let completed = existing
        .iter()
        .filter(|s| s.status == SessionStatus::Completed)
        .count();
    if completed >= config.max_completed_sessions {
        return Err(format!(
            "{} completed sessions, limit is {}",
            completed, config.max_completed_sessions
        ));
    }

    if let Some(open) = existing.iter().find(|s| {
        !s.status.is_terminal()
            && !(s.status.is_interrupted() && s.is_expired(now, config.recovery_ttl_hours))
    }) {
        return Err(format!("session {} is still {}", open.id, open.status));
    }

    Ok(())
}
