//! Error types for the soup store

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SoupStoreError>;

/// Coarse classification of every failure a store operation can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidSpec,
    UnsupportedIndexType,
    PathNotIndexed,
    AmbiguousExternalId,
    SchemaMismatch,
    StorageFailure,
    EncryptionFailure,
}

#[derive(Debug, Error)]
pub enum SoupStoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Soup {0} already exists with different specs")]
    AlreadyExists(String),

    #[error("Invalid spec: {0}")]
    InvalidSpec(String),

    #[error("Unsupported index type: {0}")]
    UnsupportedIndexType(String),

    #[error("Path {path} is not indexed in soup {soup}")]
    PathNotIndexed { soup: String, path: String },

    #[error("External id {value} at path {path} matches {matches} entries in soup {soup}")]
    AmbiguousExternalId { soup: String, path: String, value: String, matches: usize },

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Interrupted operations must be resumed before the store accepts changes")]
    ResumeRequired,

    #[error("SQLite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Encryption error: {0}")]
    Encryption(String),
}

impl SoupStoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SoupStoreError::NotFound(_) => ErrorKind::NotFound,
            SoupStoreError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            SoupStoreError::InvalidSpec(_) => ErrorKind::InvalidSpec,
            SoupStoreError::UnsupportedIndexType(_) => ErrorKind::UnsupportedIndexType,
            SoupStoreError::PathNotIndexed { .. } => ErrorKind::PathNotIndexed,
            SoupStoreError::AmbiguousExternalId { .. } => ErrorKind::AmbiguousExternalId,
            SoupStoreError::SchemaMismatch(_) | SoupStoreError::ResumeRequired => ErrorKind::SchemaMismatch,
            SoupStoreError::Rusqlite(_)
            | SoupStoreError::Pool(_)
            | SoupStoreError::TaskJoin(_)
            | SoupStoreError::Io(_)
            | SoupStoreError::Json(_) => ErrorKind::StorageFailure,
            SoupStoreError::Encryption(_) => ErrorKind::EncryptionFailure,
        }
    }

    pub(crate) fn soup_not_found(soup: &str) -> Self { SoupStoreError::NotFound(format!("soup {}", soup)) }

    pub(crate) fn not_indexed(soup: &str, path: &str) -> Self {
        SoupStoreError::PathNotIndexed { soup: soup.to_string(), path: path.to_string() }
    }
}

impl From<soupql::ParseError> for SoupStoreError {
    fn from(err: soupql::ParseError) -> Self { SoupStoreError::InvalidSpec(err.to_string()) }
}

impl From<bb8::RunError<SoupStoreError>> for SoupStoreError {
    fn from(err: bb8::RunError<SoupStoreError>) -> Self {
        match err {
            bb8::RunError::User(err) => err,
            bb8::RunError::TimedOut => SoupStoreError::Pool("timed out waiting for the store connection".to_string()),
        }
    }
}
