//! Storage error types

/// Storage error types
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    /// A record broke one of its own invariants
    #[error("Invalid record: {0}")]
    Invalid(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => StorageError::NotFound("row".into()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StorageError::Connection(e.to_string())
            }
            other => StorageError::Query(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl StorageError {
    /// Connection-level faults that may clear up on their own
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::Query(message) => {
                let message = message.to_ascii_lowercase();
                message.contains("database is locked") || message.contains("busy")
            }
            _ => false,
        }
    }
}
