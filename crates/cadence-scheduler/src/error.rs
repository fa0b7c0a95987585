use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Malformed job or trigger definition. Rejected before anything is persisted.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// The store could not serve the request right now; callers may retry.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Job not found: {key}")]
    JobNotFound { key: String },

    #[error("Trigger not found: {key}")]
    TriggerNotFound { key: String },

    #[error("Job already exists: {key}")]
    JobExists { key: String },

    #[error("Trigger already exists: {key}")]
    TriggerExists { key: String },

    /// The requested transition is not allowed from the entity's current state.
    #[error("Invalid state for {key}: {reason}")]
    InvalidState { key: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A persisted value could not be decoded (bad timestamp, unknown enum tag).
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl SchedulerError {
    /// Short error code string for status queries and logs.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Configuration(_) => "CONFIGURATION_ERROR",
            SchedulerError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::JobNotFound { .. } => "JOB_NOT_FOUND",
            SchedulerError::TriggerNotFound { .. } => "TRIGGER_NOT_FOUND",
            SchedulerError::JobExists { .. } => "JOB_EXISTS",
            SchedulerError::TriggerExists { .. } => "TRIGGER_EXISTS",
            SchedulerError::InvalidState { .. } => "INVALID_STATE",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
            SchedulerError::Corrupt(_) => "CORRUPT_RECORD",
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SchedulerError::StoreUnavailable(_) => true,
            SchedulerError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
                    | rusqlite::ErrorCode::SystemIoFailure
                    | rusqlite::ErrorCode::CannotOpen
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
