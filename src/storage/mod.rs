//! Storage layer for screening session persistence.
//!
//! This module defines the persisted entities (sessions, instrument records,
//! capture entries, settings bundles, the question bank and access tokens),
//! the [`Storage`] and [`SettingsProvider`] traits the core consumes, and the
//! SQLite implementation.

mod sqlite;


pub use sqlite::SqliteStorage;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::StorageResult;
use crate::session::{
    completion_percentage, derive_status, InstrumentKind, Milestones, SessionStatus,
};

/// Settings bundle ids a session fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsPins {
    /// Questionnaire bundle id.
    pub questionnaire: String,
    /// Interview bundle id.
    pub interview: String,
    /// Capture bundle id.
    pub capture: String,
}

/// A respondent's pass through consent, camera check and both instruments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Opaque session identifier.
    pub id: String,
    /// Owner (respondent) reference.
    pub owner_id: String,
    /// Instrument the respondent takes first.
    pub first_instrument: InstrumentKind,
    /// Current status.
    pub status: SessionStatus,
    /// Reason for a failed, incomplete or abandoned status.
    pub status_reason: Option<String>,
    /// Whether the respondent is currently working in this session.
    pub is_active: bool,
    /// Whether the session may be reactivated after interruption.
    pub is_recoverable: bool,
    /// Attempt number, starting at 1.
    pub attempt_count: u32,
    /// Number of resets.
    pub reset_count: u32,
    /// Settings bundles pinned at creation.
    pub settings: SettingsPins,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// When the session was last updated.
    pub updated_at: DateTime<Utc>,
    /// When consent was given.
    pub consent_at: Option<DateTime<Utc>>,
    /// When the camera check passed. Cleared by a reset.
    pub camera_check_at: Option<DateTime<Utc>>,
    /// When the questionnaire was completed.
    pub questionnaire_completed_at: Option<DateTime<Utc>>,
    /// When the interview was completed.
    pub interview_completed_at: Option<DateTime<Utc>>,
    /// When both instruments were done.
    pub ended_at: Option<DateTime<Utc>>,
    /// Seconds from creation to end.
    pub duration_secs: Option<i64>,
    /// When the last reset happened.
    pub last_reset_at: Option<DateTime<Utc>>,
    /// Why the last reset happened.
    pub last_reset_reason: Option<String>,
    /// Generated instrument content and the interview turn log.
    pub metadata: SessionMetadata,
    /// Row version. Writes only apply to the version they were read at.
    pub version: i64,
}

/// Per-session instrument content, generated once per attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// Questionnaire content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub questionnaire: Option<QuestionnairePlan>,
    /// Interview content and turn log.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interview: Option<InterviewPlan>,
}

impl SessionMetadata {
    /// Whether the given instrument's content has been generated.
    pub fn is_generated(&self, kind: InstrumentKind) -> bool {
        match kind {
            InstrumentKind::Questionnaire => self.questionnaire.is_some(),
            InstrumentKind::Interview => self.interview.is_some(),
        }
    }
}

/// Frozen questionnaire content for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionnairePlan {
    /// Bundle the plan was generated from.
    pub settings_id: String,
    /// Questions in presentation order.
    pub questions: Vec<PlannedQuestion>,
    /// Whether the order was shuffled.
    pub randomized: bool,
    /// Lowest allowed answer value.
    pub scale_min: u8,
    /// Highest allowed answer value.
    pub scale_max: u8,
    /// When the plan was generated.
    pub generated_at: DateTime<Utc>,
}

impl QuestionnairePlan {
    /// Whether the plan contains the given question.
    pub fn contains(&self, question_id: &str) -> bool {
        self.questions.iter().any(|q| q.id == question_id)
    }
}

/// A question drawn into a session's questionnaire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedQuestion {
    pub id: String,
    pub category: String,
    pub text: String,
}

/// Frozen interview content plus the persisted turn log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterviewPlan {
    /// Bundle the plan was generated from.
    pub settings_id: String,
    /// Aspects the interview covers.
    pub aspects: Vec<String>,
    /// Opening instructions shown to the respondent.
    pub opening_instructions: String,
    /// System context sent with every engine call.
    pub system_context: String,
    /// Conversation so far.
    #[serde(default)]
    pub turns: Vec<Turn>,
    /// When the plan was generated.
    pub generated_at: DateTime<Utc>,
}

/// Who produced a conversational turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    /// The respondent.
    Respondent,
    /// The conversational engine.
    Interviewer,
}

/// One conversational turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    pub at: DateTime<Utc>,
}

impl Turn {
    /// A respondent turn stamped now.
    pub fn respondent(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Respondent,
            content: content.into(),
            at: Utc::now(),
        }
    }

    /// An interviewer turn stamped now.
    pub fn interviewer(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Interviewer,
            content: content.into(),
            at: Utc::now(),
        }
    }
}

/// Score for one interview aspect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AspectScore {
    /// 0 (absent) to 3 (severe).
    pub score: u8,
    /// Free-text justification.
    #[serde(default)]
    pub note: String,
}

/// Instrument-specific response data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InstrumentResponse {
    /// Chosen scale value per question id.
    Questionnaire { answers: BTreeMap<String, u8> },
    /// Transcript and optional engine assessment.
    Interview {
        turns: Vec<Turn>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        assessment: Option<BTreeMap<String, AspectScore>>,
    },
}

impl InstrumentResponse {
    /// Empty response for the given instrument.
    pub fn empty(kind: InstrumentKind) -> Self {
        match kind {
            InstrumentKind::Questionnaire => InstrumentResponse::Questionnaire {
                answers: BTreeMap::new(),
            },
            InstrumentKind::Interview => InstrumentResponse::Interview {
                turns: Vec::new(),
                assessment: None,
            },
        }
    }

    /// Which instrument this response belongs to.
    pub fn kind(&self) -> InstrumentKind {
        match self {
            InstrumentResponse::Questionnaire { .. } => InstrumentKind::Questionnaire,
            InstrumentResponse::Interview { .. } => InstrumentKind::Interview,
        }
    }
}

/// An instrument instance: one per instrument per session attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentRecord {
    /// Instance identifier, used to link captures.
    pub id: String,
    /// Owning session.
    pub session_id: String,
    /// Session attempt this instance belongs to.
    pub attempt: u32,
    /// Response payload.
    pub response: InstrumentResponse,
    /// When the instance was created.
    pub created_at: DateTime<Utc>,
    /// When the instance was last updated.
    pub updated_at: DateTime<Utc>,
    /// When the instance was completed.
    pub completed_at: Option<DateTime<Utc>>,
    /// Row version, as for [`Session::version`].
    pub version: i64,
}

impl InstrumentRecord {
    /// Create an empty instance for the session's current attempt.
    pub fn new(session: &Session, kind: InstrumentKind) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session.id.clone(),
            attempt: session.attempt_count,
            response: InstrumentResponse::empty(kind),
            created_at: now,
            updated_at: now,
            completed_at: None,
            version: 0,
        }
    }

    /// Which instrument this instance belongs to.
    pub fn kind(&self) -> InstrumentKind {
        self.response.kind()
    }

    /// Whether the instance has been completed.
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// Instrument tag on a capture entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureKind {
    /// Taken during the questionnaire.
    #[serde(rename = "A")]
    Questionnaire,
    /// Taken during the interview.
    #[serde(rename = "B")]
    Interview,
    /// Not yet attributed.
    #[default]
    #[serde(rename = "unknown")]
    Unknown,
}

impl CaptureKind {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureKind::Questionnaire => "A",
            CaptureKind::Interview => "B",
            CaptureKind::Unknown => "unknown",
        }
    }
}

impl From<InstrumentKind> for CaptureKind {
    fn from(kind: InstrumentKind) -> Self {
        match kind {
            InstrumentKind::Questionnaire => CaptureKind::Questionnaire,
            InstrumentKind::Interview => CaptureKind::Interview,
        }
    }
}

impl std::fmt::Display for CaptureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CaptureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "a" => Ok(CaptureKind::Questionnaire),
            "b" => Ok(CaptureKind::Interview),
            "unknown" => Ok(CaptureKind::Unknown),
            _ => Err(format!("Unknown capture kind: {}", s)),
        }
    }
}

/// A stored photo within a capture entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureFile {
    /// File store identifier.
    pub file_id: String,
    /// What caused the capture (e.g. "interval", "question_change").
    pub trigger: String,
    /// When the photo was taken.
    pub captured_at: DateTime<Utc>,
    /// Seconds since session creation at capture time.
    pub session_elapsed_secs: i64,
}

/// A group of captures, pending until linked to an instrument instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureEntry {
    /// Unique entry identifier.
    pub id: String,
    /// Owning session.
    pub session_id: String,
    /// Owning instrument instance; `None` while pending.
    pub instrument_instance_id: Option<String>,
    /// Instrument tag.
    pub kind: CaptureKind,
    /// Stored photos, in arrival order.
    pub files: Vec<CaptureFile>,
    /// When the entry was created.
    pub created_at: DateTime<Utc>,
    /// When a file was last appended.
    pub updated_at: DateTime<Utc>,
    /// When the entry was linked.
    pub linked_at: Option<DateTime<Utc>>,
}

impl CaptureEntry {
    /// An entry already linked to an instrument instance.
    pub fn linked(
        session_id: impl Into<String>,
        instance_id: impl Into<String>,
        kind: InstrumentKind,
        files: Vec<CaptureFile>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            instrument_instance_id: Some(instance_id.into()),
            kind: kind.into(),
            files,
            created_at: now,
            updated_at: now,
            linked_at: Some(now),
        }
    }

    /// Whether the entry still waits for an instrument instance.
    pub fn is_pending(&self) -> bool {
        self.instrument_instance_id.is_none()
    }
}

/// Kind of settings bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingsKind {
    Questionnaire,
    Interview,
    Capture,
}

impl SettingsKind {
    /// All bundle kinds.
    pub const ALL: [SettingsKind; 3] = [
        SettingsKind::Questionnaire,
        SettingsKind::Interview,
        SettingsKind::Capture,
    ];

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            SettingsKind::Questionnaire => "questionnaire",
            SettingsKind::Interview => "interview",
            SettingsKind::Capture => "capture",
        }
    }
}

impl std::fmt::Display for SettingsKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SettingsKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "questionnaire" => Ok(SettingsKind::Questionnaire),
            "interview" => Ok(SettingsKind::Interview),
            "capture" => Ok(SettingsKind::Capture),
            _ => Err(format!("Unknown settings kind: {}", s)),
        }
    }
}

/// A configuration bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsBundle {
    /// Unique bundle identifier.
    pub id: String,
    /// Bundle kind.
    pub kind: SettingsKind,
    /// Human-readable name.
    pub name: String,
    /// Whether this is the current default of its kind.
    pub is_default: bool,
    /// Kind-specific parameters.
    pub parameters: serde_json::Value,
    /// When the bundle was created.
    pub created_at: DateTime<Utc>,
    /// When the bundle was last updated.
    pub updated_at: DateTime<Utc>,
}

impl SettingsBundle {
    /// Create a bundle of the given kind.
    pub fn new(kind: SettingsKind, name: impl Into<String>, parameters: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            name: name.into(),
            is_default: false,
            parameters,
            created_at: now,
            updated_at: now,
        }
    }

    /// Mark as the current default.
    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }

    /// Decode the parameters into a typed struct.
    pub fn params<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.parameters.clone())
    }
}

/// Default questionnaire categories.
pub const DEFAULT_CATEGORIES: [&str; 3] = ["depression", "anxiety", "stress"];

/// Questionnaire bundle parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionnaireParams {
    #[serde(default = "default_categories")]
    pub categories: Vec<String>,
    #[serde(default = "default_questions_per_category")]
    pub questions_per_category: usize,
    #[serde(default)]
    pub randomize_order: bool,
    #[serde(default)]
    pub scale_min: u8,
    #[serde(default = "default_scale_max")]
    pub scale_max: u8,
}

fn default_categories() -> Vec<String> {
    DEFAULT_CATEGORIES.iter().map(|c| c.to_string()).collect()
}

fn default_questions_per_category() -> usize {
    7
}

fn default_scale_max() -> u8 {
    3
}

impl Default for QuestionnaireParams {
    fn default() -> Self {
        Self {
            categories: default_categories(),
            questions_per_category: default_questions_per_category(),
            randomize_order: false,
            scale_min: 0,
            scale_max: default_scale_max(),
        }
    }
}

/// Interview bundle parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterviewParams {
    #[serde(default)]
    pub aspects: Vec<String>,
    #[serde(default)]
    pub opening_instructions: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

/// Capture bundle parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureParams {
    #[serde(default = "default_capture_enabled")]
    pub enabled: bool,
    #[serde(default = "default_capture_interval")]
    pub interval_secs: u64,
}

fn default_capture_enabled() -> bool {
    true
}

fn default_capture_interval() -> u64 {
    30
}

impl Default for CaptureParams {
    fn default() -> Self {
        Self {
            enabled: default_capture_enabled(),
            interval_secs: default_capture_interval(),
        }
    }
}

/// A question in the bank instrument A draws from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub category: String,
    pub text: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Question {
    /// Create an active question.
    pub fn new(category: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            category: category.into(),
            text: text.into(),
            is_active: true,
            created_at: Utc::now(),
        }
    }

    /// Mark as inactive.
    pub fn as_inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}

/// Session access token record. Issued once, revoked once, never reissued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    /// SHA-256 of the raw token, hex encoded.
    pub token_hash: String,
    /// Session the token grants access to.
    pub session_id: String,
    /// When the token was issued.
    pub issued_at: DateTime<Utc>,
    /// When the token was revoked.
    pub revoked_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    /// Issue a fresh token for a session. Returns the record and the raw token.
    pub fn issue(session_id: impl Into<String>) -> (Self, String) {
        let raw = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        let record = Self {
            token_hash: Self::hash(&raw),
            session_id: session_id.into(),
            issued_at: Utc::now(),
            revoked_at: None,
        };
        (record, raw)
    }

    /// Hash a raw token the way it is stored.
    pub fn hash(raw: &str) -> String {
        format!("{:x}", Sha256::digest(raw.as_bytes()))
    }

    /// Whether the token is still valid.
    pub fn is_valid(&self) -> bool {
        self.revoked_at.is_none()
    }
}

impl Session {
    /// Create a new session in CREATED.
    pub fn new(
        owner_id: impl Into<String>,
        first_instrument: InstrumentKind,
        settings: SettingsPins,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            first_instrument,
            status: SessionStatus::Created,
            status_reason: None,
            is_active: true,
            is_recoverable: true,
            attempt_count: 1,
            reset_count: 0,
            settings,
            created_at: now,
            updated_at: now,
            consent_at: None,
            camera_check_at: None,
            questionnaire_completed_at: None,
            interview_completed_at: None,
            ended_at: None,
            duration_secs: None,
            last_reset_at: None,
            last_reset_reason: None,
            metadata: SessionMetadata::default(),
            version: 0,
        }
    }

    /// Set the status.
    pub fn with_status(mut self, status: SessionStatus) -> Self {
        self.status = status;
        self
    }

    /// Milestones reached, from timestamps.
    pub fn milestones(&self) -> Milestones {
        Milestones {
            consent: self.consent_at.is_some(),
            camera_check: self.camera_check_at.is_some(),
            questionnaire_done: self.questionnaire_completed_at.is_some(),
            interview_done: self.interview_completed_at.is_some(),
        }
    }

    /// Completion timestamp of an instrument.
    pub fn completed_at(&self, kind: InstrumentKind) -> Option<DateTime<Utc>> {
        match kind {
            InstrumentKind::Questionnaire => self.questionnaire_completed_at,
            InstrumentKind::Interview => self.interview_completed_at,
        }
    }

    /// Stamp an instrument's completion.
    pub fn set_completed_at(&mut self, kind: InstrumentKind, at: DateTime<Utc>) {
        match kind {
            InstrumentKind::Questionnaire => self.questionnaire_completed_at = Some(at),
            InstrumentKind::Interview => self.interview_completed_at = Some(at),
        }
    }

    /// Weighted completion percentage, derived from timestamps and status.
    pub fn completion_percentage(&self) -> u8 {
        completion_percentage(&self.milestones(), self.status)
    }

    /// Status implied by the timestamps.
    pub fn derived_status(&self) -> SessionStatus {
        derive_status(&self.milestones(), self.first_instrument, self.status)
    }

    /// Whether the stored status agrees with the timestamps.
    pub fn is_consistent(&self) -> bool {
        self.derived_status() == self.status
    }

    /// Whether the recovery window has closed. A window too large to
    /// represent never closes.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl_hours: i64) -> bool {
        match Duration::try_hours(ttl_hours.max(0)) {
            Some(ttl) => now - self.created_at > ttl,
            None => false,
        }
    }

    /// Seconds since creation.
    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_seconds().max(0)
    }
}

/// Read access to configuration bundles.
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    /// The current default bundle of a kind.
    async fn get_default(&self, kind: SettingsKind) -> StorageResult<Option<SettingsBundle>>;
    /// A bundle by id.
    async fn get_bundle(&self, id: &str) -> StorageResult<Option<SettingsBundle>>;
}

/// Outcome of creating a session under an owner check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The session was stored.
    Created,
    /// The check refused the owner, with its reason. Nothing was stored.
    Refused(String),
}

/// Owner check run against an owner's existing sessions.
pub type AdmissionCheck<'a> = &'a (dyn Fn(&[Session]) -> Result<(), String> + Send + Sync);

/// Storage backend trait for session persistence.
///
/// Every method is a single atomic mutation or read. Session and record
/// writes are conditional on the row version the caller read; a write
/// against a newer row fails with [`StorageError::StaleWrite`] and a
/// successful write bumps the caller's copy.
///
/// [`StorageError::StaleWrite`]: crate::error::StorageError::StaleWrite
#[async_trait]
pub trait Storage: Send + Sync {
    // Session operations

    /// Create a session together with its first access token.
    async fn create_session(&self, session: &Session, token: &AccessToken) -> StorageResult<()>;
    /// Create a session unless `check` refuses the owner's other sessions.
    /// The check sees every session committed before this write.
    async fn create_owner_session(
        &self,
        session: &Session,
        token: &AccessToken,
        check: AdmissionCheck<'_>,
    ) -> StorageResult<Admission>;
    /// Get a session by ID.
    async fn get_session(&self, id: &str) -> StorageResult<Option<Session>>;
    /// Update an existing session.
    async fn update_session(&self, session: &mut Session) -> StorageResult<()>;
    /// All sessions of an owner, oldest first.
    async fn get_owner_sessions(&self, owner_id: &str) -> StorageResult<Vec<Session>>;
    /// All sessions in any of the given statuses.
    async fn get_sessions_by_status(
        &self,
        statuses: &[SessionStatus],
    ) -> StorageResult<Vec<Session>>;
    /// Delete a session and everything it owns. Returns the removed capture entries.
    async fn delete_session(&self, id: &str) -> StorageResult<Vec<CaptureEntry>>;

    // Coupled mutations

    /// Save an instrument record and the session in one transaction.
    async fn commit_instrument(
        &self,
        session: &mut Session,
        record: &mut InstrumentRecord,
    ) -> StorageResult<()>;
    /// Delete all instrument records and the pending capture entry, rotate
    /// the access token and save the session, in one transaction. Returns
    /// the deleted pending entry so its files can be removed.
    async fn commit_reset(
        &self,
        session: &mut Session,
        token: &AccessToken,
    ) -> StorageResult<Option<CaptureEntry>>;

    // Instrument records

    /// Get the session's record for an instrument.
    async fn get_instrument_record(
        &self,
        session_id: &str,
        kind: InstrumentKind,
    ) -> StorageResult<Option<InstrumentRecord>>;
    /// Get an instrument record by instance id.
    async fn get_instrument_record_by_id(&self, id: &str)
        -> StorageResult<Option<InstrumentRecord>>;
    /// All instrument records of a session.
    async fn get_session_instrument_records(
        &self,
        session_id: &str,
    ) -> StorageResult<Vec<InstrumentRecord>>;
    /// Insert the record unless the session already has one of that kind.
    /// Returns whichever record is stored afterwards. Fails with a stale
    /// write when the session has moved past the record's attempt.
    async fn ensure_instrument_record(
        &self,
        record: &InstrumentRecord,
    ) -> StorageResult<InstrumentRecord>;
    /// Update an instrument record's payload and completion.
    async fn save_instrument_record(&self, record: &mut InstrumentRecord) -> StorageResult<()>;

    // Capture operations

    /// Append a file to the session's pending entry, creating it if needed.
    async fn append_pending_capture(
        &self,
        session_id: &str,
        file: &CaptureFile,
    ) -> StorageResult<CaptureEntry>;
    /// Insert a complete capture entry.
    async fn create_capture(&self, entry: &CaptureEntry) -> StorageResult<()>;
    /// Stamp the session's pending entry, if any, with an instance id and kind.
    /// Nothing is linked to an instance that no longer exists.
    async fn link_pending_capture(
        &self,
        session_id: &str,
        instance_id: &str,
        kind: InstrumentKind,
    ) -> StorageResult<Option<CaptureEntry>>;
    /// All capture entries of a session, oldest first.
    async fn get_session_captures(&self, session_id: &str) -> StorageResult<Vec<CaptureEntry>>;
    /// Pending entries not appended to since `cutoff`.
    async fn get_stale_pending_captures(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StorageResult<Vec<CaptureEntry>>;
    /// Delete a pending entry if it is still pending and stale. Returns the deleted entry.
    async fn delete_stale_pending_capture(
        &self,
        id: &str,
        cutoff: DateTime<Utc>,
    ) -> StorageResult<Option<CaptureEntry>>;

    // Question bank

    /// Add a question to the bank.
    async fn create_question(&self, question: &Question) -> StorageResult<()>;
    /// Active questions of a category.
    async fn get_active_questions(&self, category: &str) -> StorageResult<Vec<Question>>;

    // Access tokens

    /// Look up a token by hash.
    async fn get_token(&self, token_hash: &str) -> StorageResult<Option<AccessToken>>;
    /// Revoke every valid token of a session.
    async fn revoke_session_tokens(&self, session_id: &str) -> StorageResult<u64>;
}
