//! Error type shared by the key-value backends and the document engine.

use std::fmt::{Display, Formatter};

use crate::document_model::DocumentError;

#[derive(Debug)]
pub enum StoreError {
    /// LMDB environment or transaction failure.
    Database(lmdb::Error),
    /// Filesystem failure while preparing the database directory.
    Io(std::io::Error),
    /// A stored value or document could not be encoded or decoded.
    Serialization(serde_json::Error),
    /// A hash operation hit a set key, or the reverse.
    WrongType { key: String, expected: &'static str },
    /// The stored namespace is inconsistent (e.g. an indirection cycle).
    Corrupted(String),
    /// The in-memory backend lock was poisoned by a panicking writer.
    LockPoisoned,
    /// The document cannot be mapped onto the key namespace.
    InvalidDocument(DocumentError),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(err) => write!(f, "LMDB error: {}", err),
            StoreError::Io(err) => write!(f, "IO error: {}", err),
            StoreError::Serialization(err) => write!(f, "serialization error: {}", err),
            StoreError::WrongType { key, expected } => {
                write!(f, "key '{}' does not hold a {}", key, expected)
            }
            StoreError::Corrupted(msg) => write!(f, "corrupted store: {}", msg),
            StoreError::LockPoisoned => write!(f, "in-memory store lock poisoned"),
            StoreError::InvalidDocument(err) => write!(f, "invalid document: {}", err),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Database(err) => Some(err),
            StoreError::Io(err) => Some(err),
            StoreError::Serialization(err) => Some(err),
            StoreError::InvalidDocument(err) => Some(err),
            _ => None,
        }
    }
}

impl From<lmdb::Error> for StoreError {
    fn from(err: lmdb::Error) -> Self {
        StoreError::Database(err)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err)
    }
}

impl From<DocumentError> for StoreError {
    fn from(err: DocumentError) -> Self {
        StoreError::InvalidDocument(err)
    }
}
