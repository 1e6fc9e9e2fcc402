use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::{debug, info};

use super::{
    AccessToken, Admission, AdmissionCheck, CaptureEntry, CaptureFile, InstrumentRecord, Question,
    Session, SessionMetadata, SettingsBundle, SettingsKind, SettingsPins, SettingsProvider,
    Storage,
};
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};
use crate::session::{InstrumentKind, SessionStatus};

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const SESSION_COLUMNS: &str = "id, owner_id, first_instrument, status, status_reason, \
    is_active, is_recoverable, attempt_count, reset_count, questionnaire_settings_id, \
    interview_settings_id, capture_settings_id, created_at, updated_at, consent_at, \
    camera_check_at, questionnaire_completed_at, interview_completed_at, ended_at, \
    duration_secs, last_reset_at, last_reset_reason, metadata, version";

const RECORD_COLUMNS: &str =
    "id, session_id, kind, attempt, payload, created_at, updated_at, completed_at, version";

const CAPTURE_COLUMNS: &str =
    "id, session_id, instrument_instance_id, kind, files, created_at, updated_at, linked_at";

const BUNDLE_COLUMNS: &str = "id, kind, name, is_default, parameters, created_at, updated_at";

/// SQLite-backed storage implementation
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage instance
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                message: format!("Failed to create database directory: {}", e),
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Create a private in-memory database, for tests and dry runs.
    ///
    /// The pool holds exactly one connection that never expires, since each
    /// SQLite in-memory connection is its own database.
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to open in-memory database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Run database migrations using embedded sqlx migrations
    async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running database migrations...");

        MIGRATOR.run(&self.pool).await.map_err(|e| StorageError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying pool for advanced queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert or update a settings bundle. A default bundle demotes the
    /// previous default of its kind in the same transaction.
    pub async fn save_settings_bundle(&self, bundle: &SettingsBundle) -> StorageResult<()> {
        let parameters = serde_json::to_string(&bundle.parameters)?;
        let mut tx = self.pool.begin().await?;

        if bundle.is_default {
            sqlx::query("UPDATE settings_bundles SET is_default = 0 WHERE kind = ? AND id != ?")
                .bind(bundle.kind.as_str())
                .bind(&bundle.id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO settings_bundles (id, kind, name, is_default, parameters, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                is_default = excluded.is_default,
                parameters = excluded.parameters,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&bundle.id)
        .bind(bundle.kind.as_str())
        .bind(&bundle.name)
        .bind(bundle.is_default)
        .bind(&parameters)
        .bind(ts(&bundle.created_at))
        .bind(ts(&bundle.updated_at))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(bundle_id = %bundle.id, kind = %bundle.kind, "Settings bundle saved");
        Ok(())
    }
}

#[async_trait]
impl SettingsProvider for SqliteStorage {
    async fn get_default(&self, kind: SettingsKind) -> StorageResult<Option<SettingsBundle>> {
        let sql = format!(
            "SELECT {BUNDLE_COLUMNS} FROM settings_bundles WHERE kind = ? AND is_default = 1"
        );
        let row: Option<BundleRow> = sqlx::query_as(&sql)
            .bind(kind.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(SettingsBundle::try_from).transpose()
    }

    async fn get_bundle(&self, id: &str) -> StorageResult<Option<SettingsBundle>> {
        let sql = format!("SELECT {BUNDLE_COLUMNS} FROM settings_bundles WHERE id = ?");
        let row: Option<BundleRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(SettingsBundle::try_from).transpose()
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn create_session(&self, session: &Session, token: &AccessToken) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;
        insert_session(&mut tx, session).await?;
        insert_token(&mut tx, token).await?;
        tx.commit().await?;

        Ok(())
    }

    async fn create_owner_session(
        &self,
        session: &Session,
        token: &AccessToken,
        check: AdmissionCheck<'_>,
    ) -> StorageResult<Admission> {
        let mut tx = self.pool.begin().await?;

        // Inserting first takes the write lock, so concurrent creations for
        // the same owner run their checks one after the other.
        insert_session(&mut tx, session).await?;

        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE owner_id = ? AND id != ? \
             ORDER BY created_at ASC"
        );
        let rows: Vec<SessionRow> = sqlx::query_as(&sql)
            .bind(&session.owner_id)
            .bind(&session.id)
            .fetch_all(&mut *tx)
            .await?;
        let others = rows
            .into_iter()
            .map(Session::try_from)
            .collect::<StorageResult<Vec<_>>>()?;

        if let Err(reason) = check(others.as_slice()) {
            tx.rollback().await?;
            return Ok(Admission::Refused(reason));
        }

        insert_token(&mut tx, token).await?;
        tx.commit().await?;

        Ok(Admission::Created)
    }

    async fn get_session(&self, id: &str) -> StorageResult<Option<Session>> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?");
        let row: Option<SessionRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Session::try_from).transpose()
    }

    async fn update_session(&self, session: &mut Session) -> StorageResult<()> {
        let mut conn = self.pool.acquire().await?;
        write_session(&mut conn, session).await?;
        session.version += 1;
        Ok(())
    }

    async fn get_owner_sessions(&self, owner_id: &str) -> StorageResult<Vec<Session>> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE owner_id = ? ORDER BY created_at ASC"
        );
        let rows: Vec<SessionRow> = sqlx::query_as(&sql)
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Session::try_from).collect()
    }

    async fn get_sessions_by_status(
        &self,
        statuses: &[SessionStatus],
    ) -> StorageResult<Vec<Session>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE status IN ({placeholders}) \
             ORDER BY created_at ASC"
        );
        let mut query = sqlx::query_as::<_, SessionRow>(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;

        rows.into_iter().map(Session::try_from).collect()
    }

    async fn delete_session(&self, id: &str) -> StorageResult<Vec<CaptureEntry>> {
        let mut tx = self.pool.begin().await?;

        let sql = format!("SELECT {CAPTURE_COLUMNS} FROM captures WHERE session_id = ?");
        let captures: Vec<CaptureRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_all(&mut *tx)
            .await?;

        for table in ["captures", "instrument_records", "session_tokens"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE session_id = ?"))
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::SessionNotFound {
                session_id: id.to_string(),
            });
        }

        tx.commit().await?;

        captures.into_iter().map(CaptureEntry::try_from).collect()
    }

    async fn commit_instrument(
        &self,
        session: &mut Session,
        record: &mut InstrumentRecord,
    ) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;
        write_session(&mut tx, session).await?;
        write_record(&mut tx, record).await?;
        tx.commit().await?;

        session.version += 1;
        record.version += 1;
        Ok(())
    }

    async fn commit_reset(
        &self,
        session: &mut Session,
        token: &AccessToken,
    ) -> StorageResult<Option<CaptureEntry>> {
        let mut tx = self.pool.begin().await?;
        write_session(&mut tx, session).await?;

        sqlx::query("DELETE FROM instrument_records WHERE session_id = ?")
            .bind(&session.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE session_tokens SET revoked_at = ? WHERE session_id = ? AND revoked_at IS NULL",
        )
        .bind(ts(&Utc::now()))
        .bind(&session.id)
        .execute(&mut *tx)
        .await?;

        // Captures of the discarded attempt never reach the next one.
        let sql = format!(
            "DELETE FROM captures WHERE session_id = ? AND instrument_instance_id IS NULL \
             RETURNING {CAPTURE_COLUMNS}"
        );
        let pending: Option<CaptureRow> = sqlx::query_as(&sql)
            .bind(&session.id)
            .fetch_optional(&mut *tx)
            .await?;

        insert_token(&mut tx, token).await?;
        tx.commit().await?;

        session.version += 1;
        pending.map(CaptureEntry::try_from).transpose()
    }

    async fn get_instrument_record(
        &self,
        session_id: &str,
        kind: InstrumentKind,
    ) -> StorageResult<Option<InstrumentRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM instrument_records WHERE session_id = ? AND kind = ?"
        );
        let row: Option<RecordRow> = sqlx::query_as(&sql)
            .bind(session_id)
            .bind(kind.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(InstrumentRecord::try_from).transpose()
    }

    async fn get_instrument_record_by_id(
        &self,
        id: &str,
    ) -> StorageResult<Option<InstrumentRecord>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM instrument_records WHERE id = ?");
        let row: Option<RecordRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(InstrumentRecord::try_from).transpose()
    }

    async fn get_session_instrument_records(
        &self,
        session_id: &str,
    ) -> StorageResult<Vec<InstrumentRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM instrument_records WHERE session_id = ? \
             ORDER BY created_at ASC"
        );
        let rows: Vec<RecordRow> = sqlx::query_as(&sql)
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(InstrumentRecord::try_from).collect()
    }

    async fn ensure_instrument_record(
        &self,
        record: &InstrumentRecord,
    ) -> StorageResult<InstrumentRecord> {
        let payload = serde_json::to_string(&record.response)?;
        let mut tx = self.pool.begin().await?;

        // Only the session's current attempt may gain instances.
        let sql = format!(
            "INSERT INTO instrument_records ({RECORD_COLUMNS}) \
             SELECT ?, ?, ?, ?, ?, ?, ?, ?, ? \
             WHERE EXISTS (SELECT 1 FROM sessions WHERE id = ? AND attempt_count = ?) \
             ON CONFLICT(session_id, kind) DO NOTHING"
        );
        sqlx::query(&sql)
            .bind(&record.id)
            .bind(&record.session_id)
            .bind(record.kind().as_str())
            .bind(i64::from(record.attempt))
            .bind(&payload)
            .bind(ts(&record.created_at))
            .bind(ts(&record.updated_at))
            .bind(opt_ts(&record.completed_at))
            .bind(record.version)
            .bind(&record.session_id)
            .bind(i64::from(record.attempt))
            .execute(&mut *tx)
            .await?;

        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM instrument_records WHERE session_id = ? AND kind = ?"
        );
        let row: Option<RecordRow> = sqlx::query_as(&sql)
            .bind(&record.session_id)
            .bind(record.kind().as_str())
            .fetch_optional(&mut *tx)
            .await?;

        match row {
            Some(row) if row.attempt == i64::from(record.attempt) => {
                tx.commit().await?;
                InstrumentRecord::try_from(row)
            }
            _ if row_exists(&mut tx, "sessions", &record.session_id).await? => {
                Err(StorageError::StaleWrite {
                    table: "sessions",
                    id: record.session_id.clone(),
                })
            }
            _ => Err(StorageError::SessionNotFound {
                session_id: record.session_id.clone(),
            }),
        }
    }

    async fn save_instrument_record(&self, record: &mut InstrumentRecord) -> StorageResult<()> {
        let mut conn = self.pool.acquire().await?;
        write_record(&mut conn, record).await?;
        record.version += 1;
        Ok(())
    }

    async fn append_pending_capture(
        &self,
        session_id: &str,
        file: &CaptureFile,
    ) -> StorageResult<CaptureEntry> {
        let file_json = serde_json::to_string(file)?;
        let files_json = serde_json::to_string(std::slice::from_ref(file))?;
        let now = ts(&Utc::now());
        let mut tx = self.pool.begin().await?;

        // The partial unique index makes this insert-or-append atomic.
        sqlx::query(
            r#"
            INSERT INTO captures (id, session_id, instrument_instance_id, kind, files, created_at, updated_at, linked_at)
            VALUES (?, ?, NULL, 'unknown', ?, ?, ?, NULL)
            ON CONFLICT(session_id) WHERE instrument_instance_id IS NULL
            DO UPDATE SET
                files = json_insert(files, '$[#]', json(?)),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(session_id)
        .bind(&files_json)
        .bind(&now)
        .bind(&now)
        .bind(&file_json)
        .execute(&mut *tx)
        .await?;

        let sql = format!(
            "SELECT {CAPTURE_COLUMNS} FROM captures \
             WHERE session_id = ? AND instrument_instance_id IS NULL"
        );
        let row: CaptureRow = sqlx::query_as(&sql)
            .bind(session_id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        CaptureEntry::try_from(row)
    }

    async fn create_capture(&self, entry: &CaptureEntry) -> StorageResult<()> {
        let files = serde_json::to_string(&entry.files)?;

        let sql = format!("INSERT INTO captures ({CAPTURE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)");
        sqlx::query(&sql)
            .bind(&entry.id)
            .bind(&entry.session_id)
            .bind(&entry.instrument_instance_id)
            .bind(entry.kind.as_str())
            .bind(&files)
            .bind(ts(&entry.created_at))
            .bind(ts(&entry.updated_at))
            .bind(opt_ts(&entry.linked_at))
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn link_pending_capture(
        &self,
        session_id: &str,
        instance_id: &str,
        kind: InstrumentKind,
    ) -> StorageResult<Option<CaptureEntry>> {
        let now = ts(&Utc::now());
        let sql = format!(
            "UPDATE captures SET instrument_instance_id = ?, kind = ?, linked_at = ?, updated_at = ? \
             WHERE session_id = ? AND instrument_instance_id IS NULL \
               AND EXISTS (SELECT 1 FROM instrument_records WHERE id = ? AND session_id = ?) \
             RETURNING {CAPTURE_COLUMNS}"
        );
        let row: Option<CaptureRow> = sqlx::query_as(&sql)
            .bind(instance_id)
            .bind(kind.as_str())
            .bind(&now)
            .bind(&now)
            .bind(session_id)
            .bind(instance_id)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(CaptureEntry::try_from).transpose()
    }

    async fn get_session_captures(&self, session_id: &str) -> StorageResult<Vec<CaptureEntry>> {
        let sql = format!(
            "SELECT {CAPTURE_COLUMNS} FROM captures WHERE session_id = ? \
             ORDER BY created_at ASC, id ASC"
        );
        let rows: Vec<CaptureRow> = sqlx::query_as(&sql)
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(CaptureEntry::try_from).collect()
    }

    async fn get_stale_pending_captures(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StorageResult<Vec<CaptureEntry>> {
        let sql = format!(
            "SELECT {CAPTURE_COLUMNS} FROM captures \
             WHERE instrument_instance_id IS NULL AND updated_at < ? \
             ORDER BY updated_at ASC"
        );
        let rows: Vec<CaptureRow> = sqlx::query_as(&sql)
            .bind(ts(&cutoff))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(CaptureEntry::try_from).collect()
    }

    async fn delete_stale_pending_capture(
        &self,
        id: &str,
        cutoff: DateTime<Utc>,
    ) -> StorageResult<Option<CaptureEntry>> {
        let sql = format!(
            "DELETE FROM captures \
             WHERE id = ? AND instrument_instance_id IS NULL AND updated_at < ? \
             RETURNING {CAPTURE_COLUMNS}"
        );
        let row: Option<CaptureRow> = sqlx::query_as(&sql)
            .bind(id)
            .bind(ts(&cutoff))
            .fetch_optional(&self.pool)
            .await?;

        row.map(CaptureEntry::try_from).transpose()
    }

    async fn create_question(&self, question: &Question) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO questions (id, category, text, is_active, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&question.id)
        .bind(&question.category)
        .bind(&question.text)
        .bind(question.is_active)
        .bind(ts(&question.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_active_questions(&self, category: &str) -> StorageResult<Vec<Question>> {
        let rows: Vec<QuestionRow> = sqlx::query_as(
            r#"
            SELECT id, category, text, is_active, created_at
            FROM questions
            WHERE category = ? AND is_active = 1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(category)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Question::try_from).collect()
    }

    async fn get_token(&self, token_hash: &str) -> StorageResult<Option<AccessToken>> {
        let row: Option<TokenRow> = sqlx::query_as(
            r#"
            SELECT token_hash, session_id, issued_at, revoked_at
            FROM session_tokens
            WHERE token_hash = ?
            "#,
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.map(AccessToken::try_from).transpose()
    }

    async fn revoke_session_tokens(&self, session_id: &str) -> StorageResult<u64> {
        let result = sqlx::query(
            "UPDATE session_tokens SET revoked_at = ? WHERE session_id = ? AND revoked_at IS NULL",
        )
        .bind(ts(&Utc::now()))
        .bind(session_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

// Shared writers, usable on a pooled connection or inside a transaction.

async fn insert_session(conn: &mut SqliteConnection, session: &Session) -> StorageResult<()> {
    let metadata = serde_json::to_string(&session.metadata)?;

    let sql = format!(
        "INSERT INTO sessions ({SESSION_COLUMNS}) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    );
    sqlx::query(&sql)
        .bind(&session.id)
        .bind(&session.owner_id)
        .bind(session.first_instrument.as_str())
        .bind(session.status.as_str())
        .bind(&session.status_reason)
        .bind(session.is_active)
        .bind(session.is_recoverable)
        .bind(i64::from(session.attempt_count))
        .bind(i64::from(session.reset_count))
        .bind(&session.settings.questionnaire)
        .bind(&session.settings.interview)
        .bind(&session.settings.capture)
        .bind(ts(&session.created_at))
        .bind(ts(&session.updated_at))
        .bind(opt_ts(&session.consent_at))
        .bind(opt_ts(&session.camera_check_at))
        .bind(opt_ts(&session.questionnaire_completed_at))
        .bind(opt_ts(&session.interview_completed_at))
        .bind(opt_ts(&session.ended_at))
        .bind(session.duration_secs)
        .bind(opt_ts(&session.last_reset_at))
        .bind(&session.last_reset_reason)
        .bind(&metadata)
        .bind(session.version)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

/// Write a session read at `session.version`. The caller bumps its copy
/// once the surrounding transaction commits.
async fn write_session(conn: &mut SqliteConnection, session: &Session) -> StorageResult<()> {
    let metadata = serde_json::to_string(&session.metadata)?;

    let result = sqlx::query(
        r#"
        UPDATE sessions
        SET status = ?, status_reason = ?, is_active = ?, is_recoverable = ?,
            attempt_count = ?, reset_count = ?, updated_at = ?, consent_at = ?,
            camera_check_at = ?, questionnaire_completed_at = ?, interview_completed_at = ?,
            ended_at = ?, duration_secs = ?, last_reset_at = ?, last_reset_reason = ?,
            metadata = ?, version = version + 1
        WHERE id = ? AND version = ?
        "#,
    )
    .bind(session.status.as_str())
    .bind(&session.status_reason)
    .bind(session.is_active)
    .bind(session.is_recoverable)
    .bind(i64::from(session.attempt_count))
    .bind(i64::from(session.reset_count))
    .bind(ts(&session.updated_at))
    .bind(opt_ts(&session.consent_at))
    .bind(opt_ts(&session.camera_check_at))
    .bind(opt_ts(&session.questionnaire_completed_at))
    .bind(opt_ts(&session.interview_completed_at))
    .bind(opt_ts(&session.ended_at))
    .bind(session.duration_secs)
    .bind(opt_ts(&session.last_reset_at))
    .bind(&session.last_reset_reason)
    .bind(&metadata)
    .bind(&session.id)
    .bind(session.version)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(if row_exists(conn, "sessions", &session.id).await? {
            StorageError::StaleWrite {
                table: "sessions",
                id: session.id.clone(),
            }
        } else {
            StorageError::SessionNotFound {
                session_id: session.id.clone(),
            }
        });
    }

    Ok(())
}

/// Write a record's payload and completion, conditional like [`write_session`].
async fn write_record(conn: &mut SqliteConnection, record: &InstrumentRecord) -> StorageResult<()> {
    let payload = serde_json::to_string(&record.response)?;

    let result = sqlx::query(
        r#"
        UPDATE instrument_records
        SET payload = ?, updated_at = ?, completed_at = ?, version = version + 1
        WHERE id = ? AND version = ?
        "#,
    )
    .bind(&payload)
    .bind(ts(&record.updated_at))
    .bind(opt_ts(&record.completed_at))
    .bind(&record.id)
    .bind(record.version)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(if row_exists(conn, "instrument_records", &record.id).await? {
            StorageError::StaleWrite {
                table: "instrument_records",
                id: record.id.clone(),
            }
        } else {
            StorageError::RecordNotFound {
                record_id: record.id.clone(),
            }
        });
    }

    Ok(())
}

async fn row_exists(conn: &mut SqliteConnection, table: &str, id: &str) -> StorageResult<bool> {
    let found: Option<(i64,)> = sqlx::query_as(&format!("SELECT 1 FROM {table} WHERE id = ?"))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(found.is_some())
}

async fn insert_token(conn: &mut SqliteConnection, token: &AccessToken) -> StorageResult<()> {
    sqlx::query(
        r#"
        INSERT INTO session_tokens (token_hash, session_id, issued_at, revoked_at)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(&token.token_hash)
    .bind(&token.session_id)
    .bind(ts(&token.issued_at))
    .bind(opt_ts(&token.revoked_at))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

// Timestamps are stored as fixed-width RFC 3339 UTC so text comparison orders them.

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(dt: &Option<DateTime<Utc>>) -> Option<String> {
    dt.as_ref().map(ts)
}

fn parse_ts(table: &'static str, value: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt {
            table,
            message: format!("bad timestamp '{}': {}", value, e),
        })
}

fn parse_opt_ts(table: &'static str, value: Option<String>) -> StorageResult<Option<DateTime<Utc>>> {
    value.map(|v| parse_ts(table, &v)).transpose()
}

fn parse_enum<T: FromStr<Err = String>>(table: &'static str, value: &str) -> StorageResult<T> {
    value
        .parse()
        .map_err(|message| StorageError::Corrupt { table, message })
}

fn to_u32(table: &'static str, value: i64) -> StorageResult<u32> {
    u32::try_from(value).map_err(|_| StorageError::Corrupt {
        table,
        message: format!("counter out of range: {}", value),
    })
}

// Internal row types for SQLx mapping
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    owner_id: String,
    first_instrument: String,
    status: String,
    status_reason: Option<String>,
    is_active: bool,
    is_recoverable: bool,
    attempt_count: i64,
    reset_count: i64,
    questionnaire_settings_id: String,
    interview_settings_id: String,
    capture_settings_id: String,
    created_at: String,
    updated_at: String,
    consent_at: Option<String>,
    camera_check_at: Option<String>,
    questionnaire_completed_at: Option<String>,
    interview_completed_at: Option<String>,
    ended_at: Option<String>,
    duration_secs: Option<i64>,
    last_reset_at: Option<String>,
    last_reset_reason: Option<String>,
    metadata: String,
    version: i64,
}

impl TryFrom<SessionRow> for Session {
    type Error = StorageError;

    fn try_from(row: SessionRow) -> StorageResult<Self> {
        const T: &str = "sessions";
        let metadata: SessionMetadata = serde_json::from_str(&row.metadata)?;

        Ok(Self {
            id: row.id,
            owner_id: row.owner_id,
            first_instrument: parse_enum(T, &row.first_instrument)?,
            status: parse_enum(T, &row.status)?,
            status_reason: row.status_reason,
            is_active: row.is_active,
            is_recoverable: row.is_recoverable,
            attempt_count: to_u32(T, row.attempt_count)?,
            reset_count: to_u32(T, row.reset_count)?,
            settings: SettingsPins {
                questionnaire: row.questionnaire_settings_id,
                interview: row.interview_settings_id,
                capture: row.capture_settings_id,
            },
            created_at: parse_ts(T, &row.created_at)?,
            updated_at: parse_ts(T, &row.updated_at)?,
            consent_at: parse_opt_ts(T, row.consent_at)?,
            camera_check_at: parse_opt_ts(T, row.camera_check_at)?,
            questionnaire_completed_at: parse_opt_ts(T, row.questionnaire_completed_at)?,
            interview_completed_at: parse_opt_ts(T, row.interview_completed_at)?,
            ended_at: parse_opt_ts(T, row.ended_at)?,
            duration_secs: row.duration_secs,
            last_reset_at: parse_opt_ts(T, row.last_reset_at)?,
            last_reset_reason: row.last_reset_reason,
            metadata,
            version: row.version,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RecordRow {
    id: String,
    session_id: String,
    kind: String,
    attempt: i64,
    payload: String,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
    version: i64,
}

impl TryFrom<RecordRow> for InstrumentRecord {
    type Error = StorageError;

    fn try_from(row: RecordRow) -> StorageResult<Self> {
        const T: &str = "instrument_records";
        let kind: InstrumentKind = parse_enum(T, &row.kind)?;
        let response: super::InstrumentResponse = serde_json::from_str(&row.payload)?;
        if response.kind() != kind {
            return Err(StorageError::Corrupt {
                table: T,
                message: format!("payload kind does not match column kind {}", kind),
            });
        }

        Ok(Self {
            id: row.id,
            session_id: row.session_id,
            attempt: to_u32(T, row.attempt)?,
            response,
            created_at: parse_ts(T, &row.created_at)?,
            updated_at: parse_ts(T, &row.updated_at)?,
            completed_at: parse_opt_ts(T, row.completed_at)?,
            version: row.version,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CaptureRow {
    id: String,
    session_id: String,
    instrument_instance_id: Option<String>,
    kind: String,
    files: String,
    created_at: String,
    updated_at: String,
    linked_at: Option<String>,
}

impl TryFrom<CaptureRow> for CaptureEntry {
    type Error = StorageError;

    fn try_from(row: CaptureRow) -> StorageResult<Self> {
        const T: &str = "captures";

        Ok(Self {
            id: row.id,
            session_id: row.session_id,
            instrument_instance_id: row.instrument_instance_id,
            kind: parse_enum(T, &row.kind)?,
            files: serde_json::from_str(&row.files)?,
            created_at: parse_ts(T, &row.created_at)?,
            updated_at: parse_ts(T, &row.updated_at)?,
            linked_at: parse_opt_ts(T, row.linked_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct BundleRow {
    id: String,
    kind: String,
    name: String,
    is_default: bool,
    parameters: String,
    created_at: String,
    updated_at: String,
}

impl TryFrom<BundleRow> for SettingsBundle {
    type Error = StorageError;

    fn try_from(row: BundleRow) -> StorageResult<Self> {
        const T: &str = "settings_bundles";

        Ok(Self {
            id: row.id,
            kind: parse_enum(T, &row.kind)?,
            name: row.name,
            is_default: row.is_default,
            parameters: serde_json::from_str(&row.parameters)?,
            created_at: parse_ts(T, &row.created_at)?,
            updated_at: parse_ts(T, &row.updated_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct QuestionRow {
    id: String,
    category: String,
    text: String,
    is_active: bool,
    created_at: String,
}

impl TryFrom<QuestionRow> for Question {
    type Error = StorageError;

    fn try_from(row: QuestionRow) -> StorageResult<Self> {
        Ok(Self {
            id: row.id,
            category: row.category,
            text: row.text,
            is_active: row.is_active,
            created_at: parse_ts("questions", &row.created_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TokenRow {
    token_hash: String,
    session_id: String,
    issued_at: String,
    revoked_at: Option<String>,
}

impl TryFrom<TokenRow> for AccessToken {
    type Error = StorageError;

    fn try_from(row: TokenRow) -> StorageResult<Self> {
        const T: &str = "session_tokens";

        Ok(Self {
            token_hash: row.token_hash,
            session_id: row.session_id,
            issued_at: parse_ts(T, &row.issued_at)?,
            revoked_at: parse_opt_ts(T, row.revoked_at)?,
        })
    }
}
