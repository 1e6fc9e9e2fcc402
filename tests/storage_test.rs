//! Integration tests for SQLite storage layer
//!
//! Tests database operations using an in-memory SQLite database.

use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use serde_json::json;

use screening_orchestrator::error::StorageError;
use screening_orchestrator::session::{InstrumentKind, SessionStatus};
use screening_orchestrator::storage::{
    AccessToken, Admission, CaptureEntry, CaptureFile, CaptureKind, InstrumentRecord, InstrumentResponse,
    Question, Session, SettingsBundle, SettingsKind, SettingsPins, SettingsProvider,
    SqliteStorage, Storage,
};

/// Create an in-memory storage instance for testing
async fn create_test_storage() -> SqliteStorage {
    SqliteStorage::new_in_memory()
        .await
        .expect("Failed to create in-memory storage")
}

fn test_session(owner: &str) -> Session {
    let pins = SettingsPins {
        questionnaire: "qa".to_string(),
        interview: "ib".to_string(),
        capture: "cc".to_string(),
    };
    Session::new(owner, InstrumentKind::Questionnaire, pins)
}

async fn insert_session(storage: &SqliteStorage, owner: &str) -> (Session, String) {
    let session = test_session(owner);
    let (token, raw) = AccessToken::issue(&session.id);
    storage.create_session(&session, &token).await.unwrap();
    (session, raw)
}

fn capture_file(id: &str) -> CaptureFile {
    CaptureFile {
        file_id: id.to_string(),
        trigger: "interval".to_string(),
        captured_at: Utc::now(),
        session_elapsed_secs: 12,
    }
}

#[cfg(test)]
mod session_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_create_and_get_session() {
        let storage = create_test_storage().await;
        let (session, _) = insert_session(&storage, "owner-1").await;

        let retrieved = storage.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(retrieved.id, session.id);
        assert_eq!(retrieved.owner_id, "owner-1");
        assert_eq!(retrieved.status, SessionStatus::Created);
        assert_eq!(retrieved.first_instrument, InstrumentKind::Questionnaire);
        assert_eq!(retrieved.settings, session.settings);
        assert_eq!(retrieved.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_get_nonexistent_session() {
        let storage = create_test_storage().await;
        let result = storage.get_session("nonexistent-id").await.unwrap();
        assert!(result.is_none(), "Should return None for nonexistent session");
    }

    #[tokio::test]
    async fn test_update_session_roundtrips_metadata() {
        let storage = create_test_storage().await;
        let (mut session, _) = insert_session(&storage, "owner-1").await;

        session.status = SessionStatus::CameraCheck;
        session.consent_at = Some(Utc::now());
        session.status_reason = Some("note".to_string());
        session.reset_count = 2;
        storage.update_session(&mut session).await.unwrap();
        assert_eq!(session.version, 1);

        let retrieved = storage.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(retrieved.status, SessionStatus::CameraCheck);
        assert!(retrieved.consent_at.is_some());
        assert_eq!(retrieved.status_reason.as_deref(), Some("note"));
        assert_eq!(retrieved.reset_count, 2);
        assert_eq!(retrieved.metadata, session.metadata);
        assert_eq!(retrieved.version, 1);
    }

    #[tokio::test]
    async fn test_update_missing_session_fails() {
        let storage = create_test_storage().await;
        let mut session = test_session("ghost");
        let err = storage.update_session(&mut session).await.unwrap_err();
        assert!(matches!(err, StorageError::SessionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_update_from_stale_copy_is_rejected() {
        let storage = create_test_storage().await;
        let (session, _) = insert_session(&storage, "owner-1").await;
        let mut first = session.clone();
        let mut second = session.clone();

        first.consent_at = Some(Utc::now());
        first.status = SessionStatus::CameraCheck;
        storage.update_session(&mut first).await.unwrap();

        second.status = SessionStatus::Abandoned;
        let err = storage.update_session(&mut second).await.unwrap_err();
        assert!(matches!(err, StorageError::StaleWrite { table: "sessions", .. }));
        assert_eq!(second.version, 0);

        let stored = storage.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::CameraCheck);
        assert!(stored.consent_at.is_some());
        assert_eq!(stored.version, 1);

        let mut fresh = stored;
        fresh.status = SessionStatus::Abandoned;
        storage.update_session(&mut fresh).await.unwrap();
        assert_eq!(fresh.version, 2);
    }

    #[tokio::test]
    async fn test_create_owner_session_runs_check_against_other_sessions() {
        let storage = create_test_storage().await;
        let (existing, _) = insert_session(&storage, "owner-1").await;
        insert_session(&storage, "owner-2").await;

        let candidate = test_session("owner-1");
        let (token, raw) = AccessToken::issue(&candidate.id);
        let refuse = |others: &[Session]| -> Result<(), String> {
            assert_eq!(others.len(), 1);
            assert_eq!(others[0].id, existing.id);
            Err(format!("session {} is still open", others[0].id))
        };
        let admission = storage
            .create_owner_session(&candidate, &token, &refuse)
            .await
            .unwrap();
        assert_eq!(
            admission,
            Admission::Refused(format!("session {} is still open", existing.id))
        );
        assert!(storage.get_session(&candidate.id).await.unwrap().is_none());
        assert!(storage.get_token(&AccessToken::hash(&raw)).await.unwrap().is_none());

        let admit = |_: &[Session]| -> Result<(), String> { Ok(()) };
        let admission = storage
            .create_owner_session(&candidate, &token, &admit)
            .await
            .unwrap();
        assert_eq!(admission, Admission::Created);
        assert!(storage.get_session(&candidate.id).await.unwrap().is_some());
        assert_eq!(storage.get_owner_sessions("owner-1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_owner_and_status_queries() {
        let storage = create_test_storage().await;
        let (first, _) = insert_session(&storage, "owner-1").await;
        let (mut second, _) = insert_session(&storage, "owner-1").await;
        insert_session(&storage, "owner-2").await;

        second.status = SessionStatus::Abandoned;
        storage.update_session(&mut second).await.unwrap();

        let owned = storage.get_owner_sessions("owner-1").await.unwrap();
        assert_eq!(owned.len(), 2);
        assert!(owned.iter().any(|s| s.id == first.id));

        let abandoned = storage
            .get_sessions_by_status(&[SessionStatus::Abandoned, SessionStatus::Incomplete])
            .await
            .unwrap();
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].id, second.id);

        assert!(storage.get_sessions_by_status(&[]).await.unwrap().is_empty());
    }
}

#[cfg(test)]
mod instrument_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_ensure_record_keeps_first_instance() {
        let storage = create_test_storage().await;
        let (session, _) = insert_session(&storage, "o").await;

        let first = storage
            .ensure_instrument_record(&InstrumentRecord::new(&session, InstrumentKind::Questionnaire))
            .await
            .unwrap();
        let second = storage
            .ensure_instrument_record(&InstrumentRecord::new(&session, InstrumentKind::Questionnaire))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);

        let other = storage
            .ensure_instrument_record(&InstrumentRecord::new(&session, InstrumentKind::Interview))
            .await
            .unwrap();
        assert_ne!(other.id, first.id);

        let all = storage.get_session_instrument_records(&session.id).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_ensure_record_refuses_a_past_attempt() {
        let storage = create_test_storage().await;
        let (mut session, _) = insert_session(&storage, "o").await;
        let stale = session.clone();

        session.attempt_count = 2;
        let (token, _) = AccessToken::issue(&session.id);
        storage.commit_reset(&mut session, &token).await.unwrap();

        let err = storage
            .ensure_instrument_record(&InstrumentRecord::new(&stale, InstrumentKind::Questionnaire))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::StaleWrite { .. }));
        assert!(storage.get_session_instrument_records(&session.id).await.unwrap().is_empty());

        let current = storage
            .ensure_instrument_record(&InstrumentRecord::new(&session, InstrumentKind::Questionnaire))
            .await
            .unwrap();
        assert_eq!(current.attempt, 2);

        let err = storage
            .ensure_instrument_record(&InstrumentRecord::new(&stale, InstrumentKind::Questionnaire))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::StaleWrite { .. }));

        let ghost = test_session("ghost");
        let err = storage
            .ensure_instrument_record(&InstrumentRecord::new(&ghost, InstrumentKind::Interview))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::SessionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_commit_instrument_writes_both() {
        let storage = create_test_storage().await;
        let (mut session, _) = insert_session(&storage, "o").await;
        let mut record = storage
            .ensure_instrument_record(&InstrumentRecord::new(&session, InstrumentKind::Questionnaire))
            .await
            .unwrap();

        let now = Utc::now();
        record.completed_at = Some(now);
        record.response = InstrumentResponse::Questionnaire {
            answers: [("q1".to_string(), 3)].into_iter().collect(),
        };
        session.set_completed_at(InstrumentKind::Questionnaire, now);
        session.status = SessionStatus::InterviewInProgress;
        storage.commit_instrument(&mut session, &mut record).await.unwrap();
        assert_eq!((session.version, record.version), (1, 1));

        let stored = storage
            .get_instrument_record(&session.id, InstrumentKind::Questionnaire)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.is_completed());
        assert_eq!(stored.response, record.response);

        let stored_session = storage.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(stored_session.status, SessionStatus::InterviewInProgress);
        assert!(stored_session.questionnaire_completed_at.is_some());
    }

    #[tokio::test]
    async fn test_commit_reset_rotates_token_and_clears_records() {
        let storage = create_test_storage().await;
        let (mut session, old_raw) = insert_session(&storage, "o").await;
        storage
            .ensure_instrument_record(&InstrumentRecord::new(&session, InstrumentKind::Interview))
            .await
            .unwrap();

        storage
            .append_pending_capture(&session.id, &capture_file("before-reset"))
            .await
            .unwrap();

        session.attempt_count = 2;
        let (token, new_raw) = AccessToken::issue(&session.id);
        let discarded = storage.commit_reset(&mut session, &token).await.unwrap().unwrap();
        assert_eq!(discarded.files.len(), 1);
        assert_eq!(discarded.files[0].file_id, "before-reset");

        assert!(storage.get_session_instrument_records(&session.id).await.unwrap().is_empty());
        assert!(storage.get_session_captures(&session.id).await.unwrap().is_empty());

        let old = storage.get_token(&AccessToken::hash(&old_raw)).await.unwrap().unwrap();
        assert!(!old.is_valid());
        let new = storage.get_token(&AccessToken::hash(&new_raw)).await.unwrap().unwrap();
        assert!(new.is_valid());

        let stored = storage.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.attempt_count, 2);
    }

    #[tokio::test]
    async fn test_commit_reset_keeps_linked_captures_out_of_reach() {
        let storage = create_test_storage().await;
        let (mut session, _) = insert_session(&storage, "o").await;
        let record = storage
            .ensure_instrument_record(&InstrumentRecord::new(&session, InstrumentKind::Questionnaire))
            .await
            .unwrap();
        storage
            .append_pending_capture(&session.id, &capture_file("linked"))
            .await
            .unwrap();
        storage
            .link_pending_capture(&session.id, &record.id, InstrumentKind::Questionnaire)
            .await
            .unwrap();

        let (token, _) = AccessToken::issue(&session.id);
        let discarded = storage.commit_reset(&mut session, &token).await.unwrap();
        assert!(discarded.is_none());

        let captures = storage.get_session_captures(&session.id).await.unwrap();
        assert_eq!(captures.len(), 1);
        assert_eq!(captures[0].instrument_instance_id.as_deref(), Some(record.id.as_str()));
    }

    #[tokio::test]
    async fn test_record_write_from_stale_copy_is_rejected() {
        let storage = create_test_storage().await;
        let (session, _) = insert_session(&storage, "o").await;
        let record = storage
            .ensure_instrument_record(&InstrumentRecord::new(&session, InstrumentKind::Questionnaire))
            .await
            .unwrap();
        let mut first = record.clone();
        let mut second = record.clone();

        first.response = InstrumentResponse::Questionnaire {
            answers: [("q1".to_string(), 1)].into_iter().collect(),
        };
        storage.save_instrument_record(&mut first).await.unwrap();

        second.completed_at = Some(Utc::now());
        let err = storage.save_instrument_record(&mut second).await.unwrap_err();
        assert!(matches!(err, StorageError::StaleWrite { table: "instrument_records", .. }));

        let stored = storage.get_instrument_record_by_id(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.response, first.response);
        assert!(!stored.is_completed());
    }

    #[tokio::test]
    async fn test_record_write_after_delete_reports_missing() {
        let storage = create_test_storage().await;
        let (mut session, _) = insert_session(&storage, "o").await;
        let mut record = storage
            .ensure_instrument_record(&InstrumentRecord::new(&session, InstrumentKind::Interview))
            .await
            .unwrap();

        let (token, _) = AccessToken::issue(&session.id);
        storage.commit_reset(&mut session, &token).await.unwrap();

        let err = storage.save_instrument_record(&mut record).await.unwrap_err();
        assert!(matches!(err, StorageError::RecordNotFound { .. }));
    }
}

#[cfg(test)]
mod capture_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_pending_entry_is_shared_until_linked() {
        let storage = create_test_storage().await;
        let (session, _) = insert_session(&storage, "o").await;

        let first = storage.append_pending_capture(&session.id, &capture_file("1.jpg")).await.unwrap();
        let second = storage.append_pending_capture(&session.id, &capture_file("2.jpg")).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.kind, CaptureKind::Unknown);
        let ids: Vec<_> = second.files.iter().map(|f| f.file_id.as_str()).collect();
        assert_eq!(ids, vec!["1.jpg", "2.jpg"]);

        let record = storage
            .ensure_instrument_record(&InstrumentRecord::new(&session, InstrumentKind::Questionnaire))
            .await
            .unwrap();
        let linked = storage
            .link_pending_capture(&session.id, &record.id, InstrumentKind::Questionnaire)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(linked.id, first.id);
        assert_eq!(linked.kind, CaptureKind::Questionnaire);
        assert_eq!(linked.instrument_instance_id.as_deref(), Some(record.id.as_str()));

        let fresh = storage.append_pending_capture(&session.id, &capture_file("3.jpg")).await.unwrap();
        assert_ne!(fresh.id, first.id);
        assert_eq!(fresh.files.len(), 1);

        assert_eq!(storage.get_session_captures(&session.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_link_to_missing_instance_leaves_entry_pending() {
        let storage = create_test_storage().await;
        let (session, _) = insert_session(&storage, "o").await;
        storage.append_pending_capture(&session.id, &capture_file("1.jpg")).await.unwrap();

        let linked = storage
            .link_pending_capture(&session.id, "gone", InstrumentKind::Interview)
            .await
            .unwrap();
        assert!(linked.is_none());

        let captures = storage.get_session_captures(&session.id).await.unwrap();
        assert_eq!(captures.len(), 1);
        assert!(captures[0].is_pending());
    }

    #[tokio::test]
    async fn test_link_without_pending_is_noop() {
        let storage = create_test_storage().await;
        let (session, _) = insert_session(&storage, "o").await;
        let linked = storage
            .link_pending_capture(&session.id, "i", InstrumentKind::Interview)
            .await
            .unwrap();
        assert!(linked.is_none());
    }

    #[tokio::test]
    async fn test_create_linked_capture() {
        let storage = create_test_storage().await;
        let (session, _) = insert_session(&storage, "o").await;

        let entry = CaptureEntry::linked(
            &session.id,
            "instance-b",
            InstrumentKind::Interview,
            vec![capture_file("x.jpg")],
        );
        storage.create_capture(&entry).await.unwrap();

        let stored = storage.get_session_captures(&session.id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].files, entry.files);
        assert_eq!(stored[0].kind, CaptureKind::Interview);
    }

    #[tokio::test]
    async fn test_stale_pending_delete_is_conditional() {
        let storage = create_test_storage().await;
        let (session, _) = insert_session(&storage, "o").await;
        let entry = storage.append_pending_capture(&session.id, &capture_file("1.jpg")).await.unwrap();

        let past = Utc::now() - Duration::hours(1);
        assert!(storage.get_stale_pending_captures(past).await.unwrap().is_empty());
        assert!(storage.delete_stale_pending_capture(&entry.id, past).await.unwrap().is_none());

        let future = Utc::now() + Duration::seconds(5);
        let stale = storage.get_stale_pending_captures(future).await.unwrap();
        assert_eq!(stale.len(), 1);

        let deleted = storage
            .delete_stale_pending_capture(&entry.id, future)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(deleted.files.len(), 1);
        assert!(storage.get_session_captures(&session.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_session_cascades() {
        let storage = create_test_storage().await;
        let (session, raw) = insert_session(&storage, "o").await;
        let (other, _) = insert_session(&storage, "o2").await;

        storage.append_pending_capture(&session.id, &capture_file("1.jpg")).await.unwrap();
        storage.append_pending_capture(&other.id, &capture_file("2.jpg")).await.unwrap();
        storage
            .ensure_instrument_record(&InstrumentRecord::new(&session, InstrumentKind::Questionnaire))
            .await
            .unwrap();

        let removed = storage.delete_session(&session.id).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].files[0].file_id, "1.jpg");

        assert!(storage.get_session(&session.id).await.unwrap().is_none());
        assert!(storage.get_session_instrument_records(&session.id).await.unwrap().is_empty());
        assert!(storage.get_token(&AccessToken::hash(&raw)).await.unwrap().is_none());
        assert_eq!(storage.get_session_captures(&other.id).await.unwrap().len(), 1);

        assert!(storage.delete_session(&session.id).await.is_err());
    }
}

#[cfg(test)]
mod settings_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_new_default_demotes_previous() {
        let storage = create_test_storage().await;
        let old = SettingsBundle::new(SettingsKind::Interview, "v1", json!({})).as_default();
        let new = SettingsBundle::new(SettingsKind::Interview, "v2", json!({ "aspects": ["mood"] }))
            .as_default();
        storage.save_settings_bundle(&old).await.unwrap();
        storage.save_settings_bundle(&new).await.unwrap();

        let current = storage.get_default(SettingsKind::Interview).await.unwrap().unwrap();
        assert_eq!(current.id, new.id);
        assert_eq!(current.parameters, json!({ "aspects": ["mood"] }));

        let previous = storage.get_bundle(&old.id).await.unwrap().unwrap();
        assert!(!previous.is_default);
        assert!(storage.get_default(SettingsKind::Capture).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_active_questions_only() {
        let storage = create_test_storage().await;
        storage.create_question(&Question::new("stress", "Tense?")).await.unwrap();
        storage
            .create_question(&Question::new("stress", "Retired").as_inactive())
            .await
            .unwrap();
        storage.create_question(&Question::new("mood", "Low?")).await.unwrap();

        let stress = storage.get_active_questions("stress").await.unwrap();
        assert_eq!(stress.len(), 1);
        assert_eq!(stress[0].text, "Tense?");
    }
}
