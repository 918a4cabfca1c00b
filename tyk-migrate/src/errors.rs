use std::borrow::Cow;
use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Which side of the migration an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Source,
    Target,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKind::Source => f.write_str("source"),
            StoreKind::Target => f.write_str("target"),
        }
    }
}

/// Errors that end a migration run.
#[derive(Debug, Error)]
pub enum MigrateError {
    /// Configuration could not be resolved (missing credentials, bad file).
    #[error("configuration error: {message}")]
    Config { message: Cow<'static, str> },

    /// A store could not be reached before any category began.
    #[error("failed to connect to {store} store: {source}")]
    Connection {
        store: StoreKind,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The final (or per-category) commit was rejected.
    #[error("commit failed: {0}")]
    Commit(#[source] TargetError),

    /// Rolling back after a fatal error failed as well.
    #[error("rollback failed: {0}")]
    Rollback(#[source] TargetError),

    /// The cancel signal fired before the run finished.
    #[error("migration cancelled")]
    Cancelled,

    /// The configured deadline passed before the run finished.
    #[error("migration deadline exceeded")]
    DeadlineExceeded,

    /// `run` was called on a runner that is not idle.
    #[error("runner cannot start from state {state}")]
    InvalidState { state: String },
}

impl MigrateError {
    pub fn config(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn connection<E>(store: StoreKind, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Connection {
            store,
            source: Box::new(source),
        }
    }
}

/// Failure reading from the source store.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The key was listed but held no value when read.
    #[error("key {key} no longer exists")]
    Missing { key: String },

    #[error("{message}")]
    Other { message: Cow<'static, str> },
}

/// Payload could not be decoded into the expected shape.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected a JSON object, found {found}")]
    NotAnObject { found: &'static str },

    #[error("expected a {expected} payload")]
    WrongShape { expected: &'static str },
}

/// The target store rejected a single upsert.
#[derive(Debug, Clone, Error)]
#[error("write rejected: {message}")]
pub struct PersistError {
    /// SQLSTATE reported by the database, when there is one.
    pub code: Option<String>,
    pub message: String,
}

impl PersistError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        self.code.as_deref() == Some("23505")
    }
}

impl From<sqlx::Error> for PersistError {
    fn from(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::Database(db_error) => Self {
                code: db_error.code().map(|code| code.into_owned()),
                message: db_error.message().to_string(),
            },
            _ => Self::new(error.to_string()),
        }
    }
}

/// Transaction-level failure in the target store (begin, commit, rollback).
#[derive(Debug, Error)]
pub enum TargetError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{message}")]
    Other { message: Cow<'static, str> },
}

/// Failure processing one source key. Never aborts the run.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] SourceError),

    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("persist failed: {0}")]
    Persist(#[from] PersistError),
}

impl RecordError {
    /// Short label used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            RecordError::Fetch(_) => "fetch",
            RecordError::Decode(_) => "decode",
            RecordError::Persist(_) => "persist",
        }
    }
}
