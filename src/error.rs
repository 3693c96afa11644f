//! Error types for replica

use serde::Serialize;
use thiserror::Error;

/// Result type alias for replica operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in replica
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    #[error("Foreign key violation: {0}")]
    ForeignKeyViolation(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Language model error: {message}")]
    LanguageModel { message: String, transient: bool },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Coarse error classes reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing or invalid settings, unreachable store at startup
    Configuration,
    /// Embedding or language-model call failed
    DependencyUnavailable,
    /// Write rejected to keep the store consistent
    DataIntegrity,
    /// Caller input rejected before any write
    Validation,
    /// Local persistence failure
    Storage,
    /// The addressed record does not exist
    NotFound,
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn data_integrity(msg: impl Into<String>) -> Self {
        Self::DataIntegrity(msg.into())
    }

    pub fn foreign_key(msg: impl Into<String>) -> Self {
        Self::ForeignKeyViolation(msg.into())
    }

    pub fn embedding(msg: impl Into<String>) -> Self {
        Self::Embedding(msg.into())
    }

    /// A language-model failure worth one more attempt
    pub fn llm_transient(msg: impl Into<String>) -> Self {
        Self::LanguageModel {
            message: msg.into(),
            transient: true,
        }
    }

    /// A language-model failure that retrying will not fix
    pub fn llm_fatal(msg: impl Into<String>) -> Self {
        Self::LanguageModel {
            message: msg.into(),
            transient: false,
        }
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Map this error onto the caller-facing taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Configuration,
            Error::Validation(_) => ErrorKind::Validation,
            Error::DataIntegrity(_) | Error::ForeignKeyViolation(_) => ErrorKind::DataIntegrity,
            Error::Embedding(_) | Error::LanguageModel { .. } | Error::Timeout(_) => {
                ErrorKind::DependencyUnavailable
            }
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Storage(_) | Error::Sqlite(_) | Error::Json(_) | Error::Io(_) => {
                ErrorKind::Storage
            }
        }
    }

    /// Whether a retry of the same call may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            Error::LanguageModel { transient, .. } => *transient,
            _ => false,
        }
    }
}
