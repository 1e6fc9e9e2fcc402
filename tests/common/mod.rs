//! Shared harness for the end-to-end tests: an in-memory store seeded with
//! default bundles and a question bank, a scripted conversational engine and
//! a file store in a temporary directory.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, SecondsFormat, Utc};
use serde_json::json;
use tempfile::TempDir;

use screening_orchestrator::config::SessionConfig;
use screening_orchestrator::engine::ConversationEngine;
use screening_orchestrator::error::{EngineError, EngineResult};
use screening_orchestrator::files::LocalFileStore;
use screening_orchestrator::session::assign_first_instrument;
use screening_orchestrator::storage::{
    AspectScore, Question, Session, SettingsBundle, SettingsKind, SqliteStorage, Storage, Turn,
};
use screening_orchestrator::{InstrumentKind, SessionManager};

/// Engine that answers with numbered replies and scores every aspect 2.
#[derive(Default)]
pub struct ScriptedEngine {
    pub fail: AtomicBool,
    pub turn_calls: AtomicUsize,
    pub score_calls: AtomicUsize,
}

#[async_trait]
impl ConversationEngine for ScriptedEngine {
    async fn generate_turn(
        &self,
        _system_context: &str,
        _history: &[Turn],
        _message: &str,
    ) -> EngineResult<String> {
        let n = self.turn_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail.load(Ordering::SeqCst) {
            return Err(EngineError::Api {
                status: 503,
                message: "unavailable".to_string(),
            });
        }
        Ok(format!("Reply {n}"))
    }

    async fn score_transcript(
        &self,
        _history: &[Turn],
        aspects: &[String],
    ) -> EngineResult<BTreeMap<String, AspectScore>> {
        self.score_calls.fetch_add(1, Ordering::SeqCst);
        Ok(aspects
            .iter()
            .map(|a| {
                (
                    a.clone(),
                    AspectScore {
                        score: 2,
                        note: "scripted".to_string(),
                    },
                )
            })
            .collect())
    }
}

pub struct Harness {
    pub manager: SessionManager,
    pub storage: SqliteStorage,
    pub engine: Arc<ScriptedEngine>,
    pub media: TempDir,
}

impl Harness {
    pub fn file_store(&self) -> LocalFileStore {
        LocalFileStore::new(self.media.path())
    }

    /// Number of capture files currently on disk.
    pub fn files_on_disk(&self) -> usize {
        std::fs::read_dir(self.media.path())
            .map(|dir| dir.count())
            .unwrap_or(0)
    }
}

/// Storage with a full set of default bundles and a small question bank.
pub async fn seeded_storage(capture_params: serde_json::Value) -> SqliteStorage {
    let storage = SqliteStorage::new_in_memory().await.unwrap();

    let bundles = [
        SettingsBundle::new(
            SettingsKind::Questionnaire,
            "short",
            json!({ "categories": ["mood", "stress"], "questions_per_category": 2 }),
        ),
        SettingsBundle::new(
            SettingsKind::Interview,
            "default",
            json!({
                "aspects": ["sleep", "mood"],
                "opening_instructions": "Hello, let's talk about your week."
            }),
        ),
        SettingsBundle::new(SettingsKind::Capture, "default", capture_params),
    ];
    for bundle in bundles {
        storage.save_settings_bundle(&bundle.as_default()).await.unwrap();
    }

    for category in ["mood", "stress"] {
        for i in 0..3 {
            storage
                .create_question(&Question::new(category, format!("{category} question {i}")))
                .await
                .unwrap();
        }
    }
    storage
}

pub async fn harness() -> Harness {
    harness_with(seeded_storage(json!({})).await, SessionConfig::default()).await
}

pub async fn harness_with(storage: SqliteStorage, config: SessionConfig) -> Harness {
    let media = tempfile::tempdir().unwrap();
    let engine = Arc::new(ScriptedEngine::default());
    let manager = SessionManager::new(
        storage.clone(),
        engine.clone(),
        Arc::new(LocalFileStore::new(media.path())),
        config,
    );
    Harness {
        manager,
        storage,
        engine,
        media,
    }
}

/// An owner id whose assigned first instrument is `kind`.
pub fn owner_with_first(kind: InstrumentKind, prefix: &str) -> String {
    (0..)
        .map(|i| format!("{prefix}-{i}"))
        .find(|owner| assign_first_instrument(owner) == kind)
        .unwrap()
}

/// Drive a session through consent and the camera check.
pub async fn to_first_instrument(manager: &SessionManager, session_id: &str) -> Session {
    manager.begin_session(session_id).await.unwrap();
    manager.record_consent(session_id).await.unwrap();
    let outcome = manager.record_camera_check(session_id, true).await.unwrap();
    assert!(outcome.passed);
    outcome.session
}

/// Answer every planned question with `value`.
pub fn all_answers(session: &Session, value: u8) -> BTreeMap<String, u8> {
    session
        .metadata
        .questionnaire
        .as_ref()
        .unwrap()
        .questions
        .iter()
        .map(|q| (q.id.clone(), value))
        .collect()
}

/// Run a fresh session for `owner` to COMPLETED and return its id.
pub async fn complete_session(manager: &SessionManager, owner: &str) -> String {
    let created = manager.create_session(owner).await.unwrap();
    let id = created.session.id.clone();
    let session = to_first_instrument(manager, &id).await;

    let first = session.first_instrument;
    for kind in [first, first.other()] {
        manager.start_instrument(&id, kind).await.unwrap();
        match kind {
            InstrumentKind::Questionnaire => {
                manager
                    .record_answers(&id, all_answers(&session, 1))
                    .await
                    .unwrap();
            }
            InstrumentKind::Interview => {
                manager.send_interview_message(&id, "Fine.").await.unwrap();
            }
        }
        manager.complete_instrument(&id, kind).await.unwrap();
    }
    id
}

/// Move a session's creation time `hours` into the past.
pub async fn backdate(storage: &SqliteStorage, session_id: &str, hours: i64) {
    let created = (Utc::now() - Duration::hours(hours)).to_rfc3339_opts(SecondsFormat::Micros, true);
    sqlx::query("UPDATE sessions SET created_at = ? WHERE id = ?")
        .bind(created)
        .bind(session_id)
        .execute(storage.pool())
        .await
        .unwrap();
}
