use http::StatusCode;
use sea_orm::error::{DbErr, RuntimeErr};
use uuid::Uuid;

use crate::models::OrderStatus;

/// SQLSTATE raised by Postgres when a serializable transaction cannot commit.
const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";
/// SQLSTATE raised by Postgres when it breaks a deadlock.
const SQLSTATE_DEADLOCK_DETECTED: &str = "40P01";
/// SQLite primary/extended result codes for SQLITE_BUSY, SQLITE_LOCKED and SQLITE_BUSY_SNAPSHOT.
const SQLITE_BUSY_CODES: [&str; 3] = ["5", "6", "517"];

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Insufficient stock: {0}")]
    InsufficientStock(String),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidStatusTransition { from: OrderStatus, to: OrderStatus },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(Uuid),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Transaction failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<ServiceError>,
    },

    #[error("No handler registered for event type {0}")]
    UnhandledEvent(String),

    #[error("Event error: {0}")]
    EventError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Queue error: {0}")]
    QueueError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::SerializationError(err.to_string())
    }
}

pub trait IntoDbErr {
    fn into_db_err(self) -> DbErr;
}

impl IntoDbErr for DbErr {
    fn into_db_err(self) -> DbErr {
        self
    }
}

impl IntoDbErr for String {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self)
    }
}

impl IntoDbErr for &str {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self.to_string())
    }
}

impl ServiceError {
    /// Generic constructor that normalizes any supported database error input.
    pub fn db_error<E: IntoDbErr>(error: E) -> Self {
        ServiceError::DatabaseError(error.into_db_err())
    }

    /// True for transient conflicts that a fresh transaction may resolve.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConcurrentModification(_) | Self::Conflict(_) => true,
            Self::DatabaseError(err) => is_transient_db_error(err),
            _ => false,
        }
    }

    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_)
            | Self::InvalidOperation(_)
            | Self::InvalidStatusTransition { .. }
            | Self::UnhandledEvent(_) => StatusCode::BAD_REQUEST,
            Self::InsufficientStock(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Conflict(_) | Self::ConcurrentModification(_) => StatusCode::CONFLICT,
            Self::RetriesExhausted { source, .. } => source.status_code(),
            Self::DatabaseError(err) if is_transient_db_error(err) => StatusCode::CONFLICT,
            Self::DatabaseError(_)
            | Self::EventError(_)
            | Self::SerializationError(_)
            | Self::CacheError(_)
            | Self::QueueError(_)
            | Self::InternalError(_)
            | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the caller, rather than the system, is at fault.
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Returns the error message suitable for responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::CacheError(_)
            | Self::QueueError(_)
            | Self::SerializationError(_)
            | Self::InternalError(_)
            | Self::Other(_) => "Internal server error".to_string(),
            Self::ConcurrentModification(id) => {
                format!("Concurrent modification for ID {}", id)
            }
            Self::RetriesExhausted { source, .. } => source.response_message(),
            _ => self.to_string(),
        }
    }
}

/// Classifies driver errors that signal a lost race rather than a broken request.
pub fn is_transient_db_error(err: &DbErr) -> bool {
    if let Some(code) = database_error_code(err) {
        if code == SQLSTATE_SERIALIZATION_FAILURE
            || code == SQLSTATE_DEADLOCK_DETECTED
            || SQLITE_BUSY_CODES.contains(&code.as_str())
        {
            return true;
        }
    }

    let message = err.to_string().to_lowercase();
    message.contains("could not serialize access")
        || message.contains("deadlock detected")
        || message.contains("database is locked")
        || message.contains("database table is locked")
}

fn database_error_code(err: &DbErr) -> Option<String> {
    let runtime = match err {
        DbErr::Exec(runtime) | DbErr::Query(runtime) | DbErr::Conn(runtime) => runtime,
        _ => return None,
    };
    match runtime {
        RuntimeErr::SqlxError(sqlx_err) => sqlx_err
            .as_database_error()
            .and_then(|db_err| db_err.code())
            .map(|code| code.into_owned()),
        _ => None,
    }
}
