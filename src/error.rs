//! Error taxonomy shared by every handler in the database service.
//!
//! Mirrors the failure taxonomy in spec §4.D.8/§6/§7: every variant maps to
//! exactly one wire error code, and the service boundary (`service::dispatch`)
//! is the only place a `DbError` is turned into the `{success:false, error}`
//! envelope.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("missing field: {0}")]
    MissingField(String),

    #[error("invalid subject: {0}")]
    InvalidSubject(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("value too large: {0}")]
    ValueTooLarge(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("lock timeout: {0}")]
    LockTimeout(String),

    #[error("migration failed: {0}")]
    MigrationFailed(String),

    #[error("rollback failed: {0}")]
    RollbackFailed(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("request timed out")]
    Timeout,
}

impl DbError {
    /// The wire error code from spec §6.
    pub fn code(&self) -> &'static str {
        match self {
            DbError::InvalidJson(_) => "INVALID_JSON",
            DbError::MissingField(_) => "MISSING_FIELD",
            DbError::InvalidSubject(_) => "INVALID_SUBJECT",
            DbError::Validation(_) => "VALIDATION_ERROR",
            DbError::ValueTooLarge(_) => "VALUE_TOO_LARGE",
            DbError::Database(_) => "DATABASE_ERROR",
            DbError::LockTimeout(_) => "LOCK_TIMEOUT",
            DbError::MigrationFailed(_) => "MIGRATION_FAILED",
            DbError::RollbackFailed(_) => "ROLLBACK_FAILED",
            DbError::ValidationFailed(_) => "VALIDATION_FAILED",
            DbError::Internal(_) | DbError::Timeout => "INTERNAL_ERROR",
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        DbError::Validation(msg.into())
    }

    /// Build the `{success:false, error:{code, message}}` envelope.
    pub fn to_envelope(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        })
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(e: rusqlite::Error) -> Self {
        DbError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        DbError::InvalidJson(e.to_string())
    }
}

pub type DbResult<T> = Result<T, DbError>;

/// Wrap a successful payload in the `{success:true, ...}` envelope. `payload`
/// must serialize to a JSON object; its fields are merged in alongside
/// `success`.
pub fn ok_envelope(payload: serde_json::Value) -> serde_json::Value {
    let mut obj = match payload {
        serde_json::Value::Object(m) => m,
        other => {
            let mut m = serde_json::Map::new();
            m.insert("value".to_string(), other);
            m
        }
    };
    obj.insert("success".to_string(), serde_json::Value::Bool(true));
    serde_json::Value::Object(obj)
}
