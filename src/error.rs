use std::{fmt, io};

#[cfg(feature = "service")]
use std::{borrow::Cow, error::Error as StdError};

use http::status::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Error as JsonError;
use thiserror::Error;

#[cfg(feature = "service")]
use sqlx::{
    error::{DatabaseError, ErrorKind as DatabaseErrorKind},
    Error as SqlxError,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
pub enum StoryError {
    #[error("Cache/Database error: {0}")]
    Cache(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Community detection failed: {0}")]
    Detection(String),
    #[error("Data invariant violated: {0}")]
    Invariant(String),
    #[error("File System error: {0}")]
    Io(String),
    #[error("Item Not Found: {0}")]
    NotFound(String),
    #[error("You do not have permission to access this resource")]
    PermissionDenied,
    #[error("(De)Serialization error: {0}")]
    Serialization(String),
}

impl StoryError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            StoryError::Cache(_) => StatusCode::INTERNAL_SERVER_ERROR,
            StoryError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            StoryError::Detection(_) => StatusCode::UNPROCESSABLE_ENTITY,
            StoryError::Invariant(_) => StatusCode::INTERNAL_SERVER_ERROR,
            StoryError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            StoryError::NotFound(_) => StatusCode::NOT_FOUND,
            StoryError::PermissionDenied => StatusCode::FORBIDDEN,
            StoryError::Serialization(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn invariant<S: Into<String>>(msg: S) -> Self {
        StoryError::Invariant(msg.into())
    }
}

impl From<toml::de::Error> for StoryError {
    fn from(src: toml::de::Error) -> StoryError {
        StoryError::Serialization(format!("Toml deserialization error: {src}"))
    }
}

impl From<toml::ser::Error> for StoryError {
    fn from(src: toml::ser::Error) -> StoryError {
        StoryError::Serialization(format!("Toml serialization error: {src}"))
    }
}

impl From<JsonError> for StoryError {
    fn from(src: JsonError) -> StoryError {
        StoryError::Serialization(format!("JSON (de)serialization error: {src}"))
    }
}

impl From<uuid::Error> for StoryError {
    fn from(src: uuid::Error) -> StoryError {
        StoryError::Serialization(format!("UUID conversion failed: {src}"))
    }
}

impl From<chrono::ParseError> for StoryError {
    fn from(src: chrono::ParseError) -> StoryError {
        StoryError::Serialization(format!("Timestamp parse failed: {src}"))
    }
}

impl From<io::Error> for StoryError {
    fn from(x: io::Error) -> Self {
        match x.kind() {
            io::ErrorKind::NotFound => StoryError::NotFound(format!("{x}")),
            io::ErrorKind::PermissionDenied => StoryError::PermissionDenied,
            _ => StoryError::Io(format!("IOError: {}", x.kind())),
        }
    }
}

impl From<fmt::Error> for StoryError {
    fn from(x: fmt::Error) -> Self {
        StoryError::Serialization(format!("{x}"))
    }
}

#[cfg(feature = "service")]
impl From<SqlxError> for StoryError {
    fn from(db_error: SqlxError) -> Self {
        match db_error {
            SqlxError::RowNotFound => StoryError::NotFound("database row not found".to_string()),
            // Errors raised by our own row decoders come back wrapped; unwrap them so callers
            // still see the original variant.
            SqlxError::Database(inner) => match inner.try_downcast::<StoryError>() {
                Ok(story_error) => *story_error,
                Err(inner) => StoryError::Cache(format!("database error: {inner:?}")),
            },
            other => StoryError::Cache(format!("database error: {other:?}")),
        }
    }
}

#[cfg(feature = "service")]
impl DatabaseError for StoryError {
    fn message(&self) -> &str {
        "ArsTraverse FromRow parsing failure"
    }

    fn kind(&self) -> sqlx::error::ErrorKind {
        DatabaseErrorKind::Other
    }

    /// The extended result code.
    #[inline]
    fn code(&self) -> Option<Cow<'_, str>> {
        None
    }

    #[doc(hidden)]
    fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self
    }

    #[doc(hidden)]
    fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
        self
    }

    #[doc(hidden)]
    fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
        self
    }
}
