use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Conversation engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("File store error: {0}")]
    FileStore(#[from] FileStoreError),

    #[error("Precondition violated: {message}")]
    Precondition { message: String },

    #[error("Quota exceeded for owner {owner_id}: {reason}")]
    QuotaExceeded { owner_id: String, reason: String },

    #[error("Settings incomplete: no default bundle for {missing}")]
    SettingsIncomplete { missing: String },

    #[error("Validation failed: {field} - {reason}")]
    Validation { field: String, reason: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Coarse classification of an [`AppError`] for callers deciding how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Operation invoked in a forbidden state. Never retried internally.
    PreconditionViolation,
    /// Referenced session or instance does not exist.
    NotFound,
    /// The conversational engine or file store failed; nothing was recorded.
    UpstreamFailure,
    /// Configuration, database or other infrastructure failure.
    Infrastructure,
}

impl AppError {
    /// Shorthand for a precondition violation.
    pub fn precondition(message: impl Into<String>) -> Self {
        AppError::Precondition {
            message: message.into(),
        }
    }

    /// Shorthand for a missing session.
    pub fn session_not_found(id: impl Into<String>) -> Self {
        AppError::NotFound {
            entity: "Session",
            id: id.into(),
        }
    }

    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Precondition { .. }
            | AppError::QuotaExceeded { .. }
            | AppError::SettingsIncomplete { .. }
            | AppError::Validation { .. } => ErrorKind::PreconditionViolation,
            AppError::NotFound { .. } => ErrorKind::NotFound,
            AppError::Storage(
                StorageError::SessionNotFound { .. } | StorageError::RecordNotFound { .. },
            ) => ErrorKind::NotFound,
            AppError::Engine(_) | AppError::FileStore(_) => ErrorKind::UpstreamFailure,
            AppError::Config { .. } | AppError::Storage(_) | AppError::Internal { .. } => {
                ErrorKind::Infrastructure
            }
        }
    }

    /// Whether a conditional write lost to a concurrent update of the same row.
    pub fn is_stale_write(&self) -> bool {
        matches!(self, AppError::Storage(StorageError::StaleWrite { .. }))
    }
}

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Instrument record not found: {record_id}")]
    RecordNotFound { record_id: String },

    #[error("Row {id} in {table} changed since it was read")]
    StaleWrite { table: &'static str, id: String },

    #[error("Corrupt row in {table}: {message}")]
    Corrupt { table: &'static str, message: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Conversational engine errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// File store errors
#[derive(Debug, Error)]
pub enum FileStoreError {
    #[error("Invalid file id: {file_id}")]
    InvalidId { file_id: String },

    #[error("I/O error on {file_id}: {source}")]
    Io {
        file_id: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for conversational engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Result type alias for file store operations
pub type FileStoreResult<T> = Result<T, FileStoreError>;
