//! Session orchestration.
//!
//! The [`Orchestrator`] owns every status change of a session after creation:
//! it generates per-session instrument content, drives consent, the camera
//! check and both instruments, and handles completion, reset, interruption
//! and recovery. Status moves are checked against the transition table in
//! [`crate::session`]; coupled writes go through the storage layer's
//! transactional commits.

pub mod generator;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::capture::CaptureLedger;
use crate::config::SessionConfig;
use crate::engine::ConversationEngine;
use crate::error::{AppError, AppResult, StorageError};
use crate::session::{next_status, progress_status, InstrumentKind, SessionStatus};
use crate::storage::{
    AccessToken, AspectScore, CaptureEntry, InstrumentRecord, InstrumentResponse,
    InterviewParams, InterviewPlan, QuestionnaireParams, Session, SessionMetadata,
    SettingsBundle, SettingsProvider, SqliteStorage, Storage, Turn,
};

use generator::{generate_interview, generate_questionnaire};

/// Runs of an operation before a lost write race is reported to the caller.
const MAX_WRITE_ATTEMPTS: u32 = 8;

/// Result of completing an instrument.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionOutcome {
    /// Session after the completion.
    pub session: Session,
    /// The completed instrument instance.
    pub record: InstrumentRecord,
    /// Capture entry linked to the instance, if one was pending.
    pub linked_captures: Option<CaptureEntry>,
    /// The instrument had already been completed before this call.
    pub already_completed: bool,
}

/// Result of a camera check.
#[derive(Debug, Clone, Serialize)]
pub struct CameraCheckOutcome {
    pub session: Session,
    pub passed: bool,
}

/// Interviewer reply to a respondent message.
#[derive(Debug, Clone, Serialize)]
pub struct InterviewReply {
    pub reply: String,
    /// Turns in the log after this exchange.
    pub turn_count: usize,
}

/// Result of a reset.
#[derive(Debug, Clone, Serialize)]
pub struct ResetOutcome {
    pub session: Session,
    /// Replacement access token. The previous one is revoked.
    pub access_token: String,
}

/// Result of a recovery.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryOutcome {
    pub session: Session,
    /// Set when recovery cleared the session data and rotated the token.
    pub access_token: Option<String>,
}

/// Session lifecycle orchestrator.
#[derive(Clone)]
pub struct Orchestrator {
    storage: SqliteStorage,
    engine: Arc<dyn ConversationEngine>,
    ledger: CaptureLedger,
    config: SessionConfig,
}

impl Orchestrator {
    /// Create a new orchestrator.
    pub fn new(
        storage: SqliteStorage,
        engine: Arc<dyn ConversationEngine>,
        ledger: CaptureLedger,
        config: SessionConfig,
    ) -> Self {
        Self {
            storage,
            engine,
            ledger,
            config,
        }
    }

    /// Session policy in effect.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The capture ledger completions link through.
    pub fn ledger(&self) -> &CaptureLedger {
        &self.ledger
    }

    /// Load a session or fail with not found.
    pub async fn get_session(&self, session_id: &str) -> AppResult<Session> {
        self.storage
            .get_session(session_id)
            .await?
            .ok_or_else(|| AppError::session_not_found(session_id))
    }

    /// Generate whichever instrument content the session lacks.
    ///
    /// Idempotent per part: generated content is never regenerated. Returns
    /// whether anything was generated. The caller persists the session.
    pub async fn initialize(&self, session: &mut Session) -> AppResult<bool> {
        let mut changed = false;

        if session.metadata.questionnaire.is_none() {
            let bundle = self.pinned_bundle(&session.settings.questionnaire).await?;
            let params: QuestionnaireParams = decode_params(&bundle)?;

            let mut pools = BTreeMap::new();
            for category in &params.categories {
                let pool = self.storage.get_active_questions(category).await?;
                pools.insert(category.clone(), pool);
            }

            let plan = generate_questionnaire(&bundle.id, &params, &pools, &mut rand::thread_rng());
            if plan.questions.is_empty() {
                warn!(
                    session_id = %session.id,
                    bundle_id = %bundle.id,
                    "Question bank has no active questions for the configured categories"
                );
            }
            session.metadata.questionnaire = Some(plan);
            changed = true;
        }

        if session.metadata.interview.is_none() {
            let bundle = self.pinned_bundle(&session.settings.interview).await?;
            let params: InterviewParams = decode_params(&bundle)?;
            session.metadata.interview = Some(generate_interview(&bundle.id, &params));
            changed = true;
        }

        if changed {
            session.updated_at = Utc::now();
            debug!(session_id = %session.id, "Session instruments generated");
        }
        Ok(changed)
    }

    /// Move CREATED to CONSENT.
    pub async fn begin(&self, session_id: &str) -> AppResult<Session> {
        retry_stale(session_id, move || self.try_begin(session_id)).await
    }

    async fn try_begin(&self, session_id: &str) -> AppResult<Session> {
        let mut session = self.get_session(session_id).await?;

        if session.status.is_terminal() {
            return Err(terminal_error(&session));
        }
        if session.status == SessionStatus::Created {
            transition(&mut session, SessionStatus::Consent)?;
            self.storage.update_session(&mut session).await?;
            info!(session_id = %session.id, "Session started");
        }
        Ok(session)
    }

    /// Record consent and move on to the camera check.
    pub async fn record_consent(&self, session_id: &str) -> AppResult<Session> {
        retry_stale(session_id, move || self.try_record_consent(session_id)).await
    }

    async fn try_record_consent(&self, session_id: &str) -> AppResult<Session> {
        let mut session = self.get_session(session_id).await?;

        if session.consent_at.is_some() {
            return Ok(session);
        }
        if !matches!(
            session.status,
            SessionStatus::Created | SessionStatus::Consent
        ) {
            return Err(AppError::precondition(format!(
                "session {} cannot record consent while {}",
                session.id, session.status
            )));
        }

        if session.status == SessionStatus::Created {
            transition(&mut session, SessionStatus::Consent)?;
        }
        session.consent_at = Some(Utc::now());
        transition(&mut session, SessionStatus::CameraCheck)?;
        self.storage.update_session(&mut session).await?;

        info!(session_id = %session.id, "Consent recorded");
        Ok(session)
    }

    /// Record a camera check. A pass moves the session to its first instrument.
    pub async fn record_camera_check(
        &self,
        session_id: &str,
        passed: bool,
    ) -> AppResult<CameraCheckOutcome> {
        retry_stale(session_id, move || self.try_record_camera_check(session_id, passed)).await
    }

    async fn try_record_camera_check(
        &self,
        session_id: &str,
        passed: bool,
    ) -> AppResult<CameraCheckOutcome> {
        let mut session = self.get_session(session_id).await?;

        if session.status.is_terminal() {
            return Err(terminal_error(&session));
        }
        if session.camera_check_at.is_some() {
            return Ok(CameraCheckOutcome {
                session,
                passed: true,
            });
        }
        if session.status != SessionStatus::CameraCheck {
            return Err(AppError::precondition(format!(
                "session {} is {}, not awaiting a camera check",
                session.id, session.status
            )));
        }
        if !passed {
            info!(session_id = %session.id, "Camera check failed");
            return Ok(CameraCheckOutcome {
                session,
                passed: false,
            });
        }

        self.heal_metadata(&mut session).await?;
        session.camera_check_at = Some(Utc::now());
        let first = session.first_instrument.in_progress();
        transition(&mut session, first)?;
        self.storage.update_session(&mut session).await?;

        info!(
            session_id = %session.id,
            first_instrument = %session.first_instrument,
            "Camera check passed"
        );
        Ok(CameraCheckOutcome {
            session,
            passed: true,
        })
    }

    /// Open an instrument and return its instance.
    ///
    /// Starting the second instrument while the first is unfinished moves
    /// the session to BOTH_IN_PROGRESS.
    pub async fn start_instrument(
        &self,
        session_id: &str,
        kind: InstrumentKind,
    ) -> AppResult<InstrumentRecord> {
        retry_stale(session_id, move || self.try_start_instrument(session_id, kind)).await
    }

    async fn try_start_instrument(
        &self,
        session_id: &str,
        kind: InstrumentKind,
    ) -> AppResult<InstrumentRecord> {
        let mut session = self.get_session(session_id).await?;

        if session.status.is_terminal() || session.status.is_interrupted() {
            return Err(AppError::precondition(format!(
                "session {} is {} and cannot start an instrument",
                session.id, session.status
            )));
        }
        if session.camera_check_at.is_none() {
            return Err(AppError::precondition(format!(
                "session {} has not passed the camera check",
                session.id
            )));
        }
        if session.completed_at(kind).is_some() {
            return Err(AppError::precondition(format!(
                "instrument {} of session {} is already completed",
                kind, session.id
            )));
        }

        let current = session.status;
        let target = if current.allows_instrument(kind) {
            current
        } else if current == kind.other().in_progress() {
            if session.completed_at(kind.other()).is_some() {
                kind.in_progress()
            } else {
                SessionStatus::BothInProgress
            }
        } else {
            return Err(AppError::precondition(format!(
                "session {} cannot start {} while {}",
                session.id, kind, current
            )));
        };

        let mut changed = self.heal_metadata(&mut session).await?;
        if target != current {
            transition(&mut session, target)?;
            changed = true;
        }
        if changed {
            self.storage.update_session(&mut session).await?;
        }

        let record = self.ensure_record(&session, kind).await?;
        debug!(session_id = %session.id, kind = %kind, instance_id = %record.id, "Instrument started");
        Ok(record)
    }

    /// Store questionnaire answers. Later answers to the same question overwrite earlier ones.
    pub async fn record_answers(
        &self,
        session_id: &str,
        answers: BTreeMap<String, u8>,
    ) -> AppResult<InstrumentRecord> {
        retry_stale(session_id, move || {
            self.try_record_answers(session_id, answers.clone())
        })
        .await
    }

    async fn try_record_answers(
        &self,
        session_id: &str,
        answers: BTreeMap<String, u8>,
    ) -> AppResult<InstrumentRecord> {
        let kind = InstrumentKind::Questionnaire;
        let mut session = self.get_session(session_id).await?;
        self.check_accepting(&session, kind)?;

        if self.heal_metadata(&mut session).await? {
            self.storage.update_session(&mut session).await?;
        }

        {
            let plan = session
                .metadata
                .questionnaire
                .as_ref()
                .ok_or_else(|| missing_plan(&session, kind))?;
            for (question_id, value) in &answers {
                if !plan.contains(question_id) {
                    return Err(AppError::Validation {
                        field: "answers".to_string(),
                        reason: format!("question {} is not part of this questionnaire", question_id),
                    });
                }
                if *value < plan.scale_min || *value > plan.scale_max {
                    return Err(AppError::Validation {
                        field: "answers".to_string(),
                        reason: format!(
                            "answer {} to {} is outside {}..={}",
                            value, question_id, plan.scale_min, plan.scale_max
                        ),
                    });
                }
            }
        }

        let mut record = self.ensure_record(&session, kind).await?;
        if record.is_completed() {
            return Err(AppError::precondition(format!(
                "instrument {} of session {} is already completed",
                kind, session.id
            )));
        }
        match &mut record.response {
            InstrumentResponse::Questionnaire { answers: stored } => stored.extend(answers),
            InstrumentResponse::Interview { .. } => {
                return Err(AppError::Internal {
                    message: format!("record {} holds an interview payload", record.id),
                })
            }
        }
        record.updated_at = Utc::now();
        self.storage.save_instrument_record(&mut record).await?;

        Ok(record)
    }

    /// Send a respondent message to the interviewer.
    ///
    /// Both turns are appended to the log only after the engine answers. An
    /// engine failure leaves the log untouched and is returned as is.
    pub async fn send_interview_message(
        &self,
        session_id: &str,
        message: &str,
    ) -> AppResult<InterviewReply> {
        let message = message.trim();
        if message.is_empty() {
            return Err(AppError::Validation {
                field: "message".to_string(),
                reason: "message is empty".to_string(),
            });
        }

        let (plan, attempt) =
            retry_stale(session_id, move || self.prepare_exchange(session_id)).await?;

        let mut history = plan.turns;
        let opening = if history.is_empty() && !plan.opening_instructions.trim().is_empty() {
            Some(Turn::interviewer(plan.opening_instructions.clone()))
        } else {
            None
        };
        history.extend(opening.clone());

        let reply = self
            .engine
            .generate_turn(&plan.system_context, &history, message)
            .await?;

        let exchange = Exchange {
            attempt,
            opening,
            respondent: Turn::respondent(message),
            reply: Turn::interviewer(reply.clone()),
        };
        let exchange = &exchange;
        let turn_count =
            retry_stale(session_id, move || self.record_exchange(session_id, exchange)).await?;

        debug!(session_id = %session_id, turns = turn_count, "Interview turn recorded");
        Ok(InterviewReply { reply, turn_count })
    }

    /// Check the interview accepts messages and return its plan and the attempt it belongs to.
    async fn prepare_exchange(&self, session_id: &str) -> AppResult<(InterviewPlan, u32)> {
        let kind = InstrumentKind::Interview;
        let mut session = self.get_session(session_id).await?;
        self.check_accepting(&session, kind)?;
        if self.heal_metadata(&mut session).await? {
            self.storage.update_session(&mut session).await?;
        }
        self.ensure_record(&session, kind).await?;

        let plan = session
            .metadata
            .interview
            .clone()
            .ok_or_else(|| missing_plan(&session, kind))?;
        Ok((plan, session.attempt_count))
    }

    /// Append an answered exchange to the turn log. Returns the log length.
    async fn record_exchange(&self, session_id: &str, exchange: &Exchange) -> AppResult<usize> {
        // The session may have moved on while the engine was answering.
        let mut session = self.get_session(session_id).await?;
        if session.attempt_count != exchange.attempt {
            return Err(AppError::precondition(format!(
                "session {} was reset while the interviewer was answering",
                session.id
            )));
        }
        self.check_accepting(&session, InstrumentKind::Interview)?;

        let turn_count = {
            let log = &mut session
                .metadata
                .interview
                .as_mut()
                .ok_or_else(|| AppError::Internal {
                    message: format!("interview plan of session {} disappeared", session_id),
                })?
                .turns;
            if log.is_empty() {
                log.extend(exchange.opening.clone());
            }
            log.push(exchange.respondent.clone());
            log.push(exchange.reply.clone());
            log.len()
        };
        session.updated_at = Utc::now();
        self.storage.update_session(&mut session).await?;

        Ok(turn_count)
    }

    /// Complete an instrument.
    ///
    /// Stamps the completion, advances the status, commits the session and
    /// the instance together, then links the pending capture entry to the
    /// instance. Completing an already completed instrument changes nothing
    /// and re-runs the idempotent link.
    pub async fn complete_instrument(
        &self,
        session_id: &str,
        kind: InstrumentKind,
    ) -> AppResult<CompletionOutcome> {
        retry_stale(session_id, move || self.try_complete_instrument(session_id, kind)).await
    }

    async fn try_complete_instrument(
        &self,
        session_id: &str,
        kind: InstrumentKind,
    ) -> AppResult<CompletionOutcome> {
        let mut session = self.get_session(session_id).await?;

        if session.completed_at(kind).is_some() {
            let record = match self.storage.get_instrument_record(&session.id, kind).await? {
                Some(record) => record,
                None => {
                    warn!(
                        session_id = %session.id,
                        kind = %kind,
                        "Completed instrument has no instance, creating one"
                    );
                    self.ensure_record(&session, kind).await?
                }
            };
            let linked_captures = self.ledger.link_pending(&session.id, &record.id, kind).await?;
            return Ok(CompletionOutcome {
                session,
                record,
                linked_captures,
                already_completed: true,
            });
        }

        if session.status.is_terminal() || session.status.is_interrupted() {
            return Err(AppError::precondition(format!(
                "session {} is {} and cannot complete an instrument",
                session.id, session.status
            )));
        }
        if !session.status.allows_instrument(kind) {
            return Err(AppError::precondition(format!(
                "instrument {} of session {} is not in progress (status {})",
                kind, session.id, session.status
            )));
        }

        self.heal_metadata(&mut session).await?;
        let mut record = self.ensure_record(&session, kind).await?;

        let now = Utc::now();
        if let InstrumentResponse::Interview { turns, .. } = &mut record.response {
            if let Some(plan) = &session.metadata.interview {
                *turns = plan.turns.clone();
            }
        }
        record.completed_at = Some(now);
        record.updated_at = now;

        session.set_completed_at(kind, now);
        let milestones = session.milestones();
        let next = next_status(
            milestones.questionnaire_done,
            milestones.interview_done,
            session.status,
        );
        transition(&mut session, next)?;

        if next == SessionStatus::Completed {
            session.ended_at = Some(now);
            session.duration_secs = Some((now - session.created_at).num_seconds().max(0));
            session.is_active = false;
        }

        self.storage.commit_instrument(&mut session, &mut record).await?;
        info!(
            session_id = %session.id,
            kind = %kind,
            instance_id = %record.id,
            status = %session.status,
            "Instrument completed"
        );

        let linked_captures = self.ledger.link_pending(&session.id, &record.id, kind).await?;

        Ok(CompletionOutcome {
            session,
            record,
            linked_captures,
            already_completed: false,
        })
    }

    /// Score the completed interview on its aspects.
    ///
    /// A stored assessment is returned without calling the engine again.
    pub async fn score_interview(&self, session_id: &str) -> AppResult<BTreeMap<String, AspectScore>> {
        let kind = InstrumentKind::Interview;
        let session = self.get_session(session_id).await?;

        if session.interview_completed_at.is_none() {
            return Err(AppError::precondition(format!(
                "interview of session {} is not completed",
                session.id
            )));
        }
        let record = self
            .storage
            .get_instrument_record(&session.id, kind)
            .await?
            .ok_or_else(|| AppError::NotFound {
                entity: "Instrument instance",
                id: format!("{}/{}", session.id, kind),
            })?;

        let turns = match &record.response {
            InstrumentResponse::Interview {
                assessment: Some(existing),
                ..
            } => return Ok(existing.clone()),
            InstrumentResponse::Interview { turns, .. } => turns.clone(),
            InstrumentResponse::Questionnaire { .. } => {
                return Err(AppError::Internal {
                    message: format!("record {} holds a questionnaire payload", record.id),
                })
            }
        };

        let aspects = session
            .metadata
            .interview
            .as_ref()
            .map(|plan| plan.aspects.clone())
            .unwrap_or_default();
        if aspects.is_empty() {
            return Err(AppError::precondition(format!(
                "interview of session {} has no aspects to score",
                session.id
            )));
        }

        let scores = self.engine.score_transcript(&turns, &aspects).await?;

        let (record_id, fresh) = (record.id.as_str(), &scores);
        let stored = retry_stale(session_id, move || self.store_assessment(record_id, fresh)).await?;

        info!(session_id = %session.id, aspects = stored.len(), "Interview scored");
        Ok(stored)
    }

    /// Store an assessment on the interview instance unless one landed first.
    /// Returns the assessment the instance holds afterwards.
    async fn store_assessment(
        &self,
        record_id: &str,
        scores: &BTreeMap<String, AspectScore>,
    ) -> AppResult<BTreeMap<String, AspectScore>> {
        // The instance may have been removed by a reset while scoring.
        let mut record = self
            .storage
            .get_instrument_record_by_id(record_id)
            .await?
            .ok_or_else(|| removed_while_scoring(record_id))?;

        match &mut record.response {
            InstrumentResponse::Interview {
                assessment: Some(existing),
                ..
            } => return Ok(existing.clone()),
            InstrumentResponse::Interview { assessment, .. } => *assessment = Some(scores.clone()),
            InstrumentResponse::Questionnaire { .. } => {
                return Err(AppError::Internal {
                    message: format!("record {} holds a questionnaire payload", record.id),
                })
            }
        }
        record.updated_at = Utc::now();
        match self.storage.save_instrument_record(&mut record).await {
            Err(StorageError::RecordNotFound { .. }) => Err(removed_while_scoring(record_id)),
            other => other.map(|()| scores.clone()).map_err(AppError::from),
        }
    }

    /// Reset a session for a new attempt.
    ///
    /// Keeps consent, deletes the instances and any capture entry not yet
    /// linked, regenerates content and rotates the access token.
    ///
    /// Consent is a one-time gate but the camera check is not: its stamp is
    /// cleared here and every attempt runs it again. Keeping the stamp would
    /// leave a CAMERA_CHECK session whose timestamps imply an instrument phase.
    pub async fn reset(&self, session_id: &str, reason: &str) -> AppResult<ResetOutcome> {
        retry_stale(session_id, move || self.try_reset(session_id, reason)).await
    }

    async fn try_reset(&self, session_id: &str, reason: &str) -> AppResult<ResetOutcome> {
        let mut session = self.get_session(session_id).await?;

        if session.status.is_terminal() {
            return Err(AppError::precondition(format!(
                "session {} is {} and cannot be reset",
                session.id, session.status
            )));
        }

        let access_token = self.apply_reset(&mut session, reason).await?;
        Ok(ResetOutcome {
            session,
            access_token,
        })
    }

    /// Mark a session as left by the respondent.
    pub async fn abandon(&self, session_id: &str, reason: &str) -> AppResult<Session> {
        self.interrupt(session_id, SessionStatus::Abandoned, reason).await
    }

    /// Mark a session as interrupted.
    pub async fn mark_incomplete(&self, session_id: &str, reason: &str) -> AppResult<Session> {
        self.interrupt(session_id, SessionStatus::Incomplete, reason).await
    }

    /// Fail a session. Failure is terminal and revokes the access token.
    pub async fn fail(&self, session_id: &str, reason: &str) -> AppResult<Session> {
        retry_stale(session_id, move || self.try_fail(session_id, reason)).await
    }

    async fn try_fail(&self, session_id: &str, reason: &str) -> AppResult<Session> {
        let mut session = self.get_session(session_id).await?;

        if session.status == SessionStatus::Failed {
            return Ok(session);
        }
        transition(&mut session, SessionStatus::Failed)?;
        session.status_reason = Some(reason.to_string());
        session.is_active = false;
        session.is_recoverable = false;
        self.storage.update_session(&mut session).await?;
        self.storage.revoke_session_tokens(&session.id).await?;

        warn!(session_id = %session.id, reason = %reason, "Session failed");
        Ok(session)
    }

    /// Reactivate an interrupted session within the recovery window.
    ///
    /// With `clear_data` the session is reset as well; otherwise it resumes
    /// at the phase its timestamps imply.
    pub async fn recover(&self, session_id: &str, clear_data: bool) -> AppResult<RecoveryOutcome> {
        retry_stale(session_id, move || self.try_recover(session_id, clear_data)).await
    }

    async fn try_recover(&self, session_id: &str, clear_data: bool) -> AppResult<RecoveryOutcome> {
        let mut session = self.get_session(session_id).await?;

        if !session.status.is_interrupted() {
            return Err(AppError::precondition(format!(
                "session {} is {}, only incomplete or abandoned sessions can be recovered",
                session.id, session.status
            )));
        }
        if !session.is_recoverable {
            return Err(AppError::precondition(format!(
                "session {} is not recoverable",
                session.id
            )));
        }
        if session.is_expired(Utc::now(), self.config.recovery_ttl_hours) {
            return Err(AppError::precondition(format!(
                "recovery window of {}h for session {} has passed",
                self.config.recovery_ttl_hours, session.id
            )));
        }

        if clear_data {
            let access_token = self.apply_reset(&mut session, "recovered with cleared data").await?;
            return Ok(RecoveryOutcome {
                session,
                access_token: Some(access_token),
            });
        }

        let target = progress_status(
            &session.milestones(),
            session.first_instrument,
            SessionStatus::Consent,
        );
        self.heal_metadata(&mut session).await?;
        transition(&mut session, target)?;
        session.status_reason = None;
        session.is_active = true;
        self.storage.update_session(&mut session).await?;

        info!(session_id = %session.id, status = %session.status, "Session recovered");
        Ok(RecoveryOutcome {
            session,
            access_token: None,
        })
    }

    /// Fail an interrupted session whose recovery window has passed.
    ///
    /// Returns whether the session was expired by this call.
    pub async fn expire(&self, session_id: &str) -> AppResult<bool> {
        retry_stale(session_id, move || self.try_expire(session_id)).await
    }

    async fn try_expire(&self, session_id: &str) -> AppResult<bool> {
        let mut session = self.get_session(session_id).await?;

        if !session.status.is_interrupted()
            || !session.is_expired(Utc::now(), self.config.recovery_ttl_hours)
        {
            return Ok(false);
        }

        transition(&mut session, SessionStatus::Failed)?;
        session.status_reason = Some("recovery window expired".to_string());
        session.is_active = false;
        session.is_recoverable = false;
        self.storage.update_session(&mut session).await?;
        self.storage.revoke_session_tokens(&session.id).await?;

        info!(session_id = %session.id, "Expired interrupted session");
        Ok(true)
    }

    async fn apply_reset(&self, session: &mut Session, reason: &str) -> AppResult<String> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(AppError::Validation {
                field: "reason".to_string(),
                reason: "a reset needs a reason".to_string(),
            });
        }

        let now = Utc::now();
        session.attempt_count += 1;
        session.reset_count += 1;
        session.last_reset_at = Some(now);
        session.last_reset_reason = Some(reason.to_string());
        session.camera_check_at = None;
        session.questionnaire_completed_at = None;
        session.interview_completed_at = None;
        session.ended_at = None;
        session.duration_secs = None;
        session.metadata = SessionMetadata::default();
        session.status_reason = None;
        session.is_active = true;
        session.is_recoverable = true;

        let target = if session.consent_at.is_some() {
            SessionStatus::CameraCheck
        } else {
            SessionStatus::Consent
        };
        transition(session, target)?;
        self.initialize(session).await?;

        let (token, raw) = AccessToken::issue(&session.id);
        let discarded = self.storage.commit_reset(session, &token).await?;

        if let Some(entry) = discarded {
            let purge = self.ledger.purge_files(std::slice::from_ref(&entry)).await;
            debug!(
                session_id = %session.id,
                entry_id = %entry.id,
                files = purge.removed,
                "Discarded pending captures of the previous attempt"
            );
        }

        info!(
            session_id = %session.id,
            attempt = session.attempt_count,
            reason = %reason,
            "Session reset"
        );
        Ok(raw)
    }

    async fn interrupt(
        &self,
        session_id: &str,
        status: SessionStatus,
        reason: &str,
    ) -> AppResult<Session> {
        retry_stale(session_id, move || self.try_interrupt(session_id, status, reason)).await
    }

    async fn try_interrupt(
        &self,
        session_id: &str,
        status: SessionStatus,
        reason: &str,
    ) -> AppResult<Session> {
        let mut session = self.get_session(session_id).await?;

        if session.status.is_terminal() {
            return Err(terminal_error(&session));
        }
        if session.status != status {
            transition(&mut session, status)?;
            session.status_reason = Some(reason.to_string());
            session.is_active = false;
            self.storage.update_session(&mut session).await?;
            info!(session_id = %session.id, status = %status, reason = %reason, "Session interrupted");
        }
        Ok(session)
    }

    /// Regenerate missing instrument content. Missing content past creation
    /// is a data integrity anomaly and is logged as such.
    async fn heal_metadata(&self, session: &mut Session) -> AppResult<bool> {
        let missing: Vec<&str> = InstrumentKind::ALL
            .iter()
            .filter(|kind| !session.metadata.is_generated(**kind))
            .map(|kind| kind.as_str())
            .collect();
        if missing.is_empty() {
            return Ok(false);
        }

        warn!(
            session_id = %session.id,
            missing = ?missing,
            "Session metadata missing, generating it now"
        );
        self.initialize(session).await
    }

    async fn ensure_record(
        &self,
        session: &Session,
        kind: InstrumentKind,
    ) -> AppResult<InstrumentRecord> {
        let record = InstrumentRecord::new(session, kind);
        Ok(self.storage.ensure_instrument_record(&record).await?)
    }

    async fn pinned_bundle(&self, bundle_id: &str) -> AppResult<SettingsBundle> {
        self.storage
            .get_bundle(bundle_id)
            .await?
            .ok_or_else(|| AppError::NotFound {
                entity: "Settings bundle",
                id: bundle_id.to_string(),
            })
    }

    fn check_accepting(&self, session: &Session, kind: InstrumentKind) -> AppResult<()> {
        if !session.status.allows_instrument(kind) {
            return Err(AppError::precondition(format!(
                "instrument {} of session {} is not in progress (status {})",
                kind, session.id, session.status
            )));
        }
        if session.completed_at(kind).is_some() {
            return Err(AppError::precondition(format!(
                "instrument {} of session {} is already completed",
                kind, session.id
            )));
        }
        Ok(())
    }
}

fn transition(session: &mut Session, next: SessionStatus) -> AppResult<()> {
    if !session.status.can_transition_to(next, session.first_instrument) {
        return Err(AppError::precondition(format!(
            "session {} cannot move from {} to {}",
            session.id, session.status, next
        )));
    }
    session.status = next;
    session.updated_at = Utc::now();
    Ok(())
}

/// Run `op` again while its conditional writes lose to concurrent updates.
/// Every run reloads the session, so each decision is made on fresh state.
async fn retry_stale<T, F, Fut>(session_id: &str, mut op: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_stale_write() && attempt < MAX_WRITE_ATTEMPTS => {
                debug!(session_id = %session_id, attempt, "Lost a concurrent write, retrying");
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// A respondent message and the interviewer reply, waiting to be logged.
struct Exchange {
    attempt: u32,
    opening: Option<Turn>,
    respondent: Turn,
    reply: Turn,
}

fn terminal_error(session: &Session) -> AppError {
    AppError::precondition(format!("session {} is {}", session.id, session.status))
}

fn removed_while_scoring(record_id: &str) -> AppError {
    AppError::precondition(format!(
        "interview instance {} was removed while scoring",
        record_id
    ))
}

fn missing_plan(session: &Session, kind: InstrumentKind) -> AppError {
    AppError::Internal {
        message: format!("session {} has no {} content", session.id, kind),
    }
}

fn decode_params<T: serde::de::DeserializeOwned>(bundle: &SettingsBundle) -> AppResult<T> {
    bundle.params().map_err(|e| AppError::Internal {
        message: format!("Invalid {} bundle {}: {}", bundle.kind, bundle.id, e),
    })
}
