use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Error as SerdeError;

use crate::document_model::DocumentError;
use crate::store_error::StoreError;

/// Outcome of a caller-facing operation, serialized to JSON for FFI hosts.
///
/// The host maps each variant onto its transport (e.g. `Created` → 201,
/// `NotModified` → 304, `PreconditionFailed` → 412).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AppResponse {
    DatabaseError(String),
    SerializationError(String),
    NotFound(String),
    ValidationError(String),
    BadRequest(String),
    Conflict(String),
    PreconditionFailed(String),
    NotModified(String),
    Created(String),
    Ok(String),
}

impl Display for AppResponse {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AppResponse::DatabaseError(msg) => write!(f, "Database error: {}", msg),
            AppResponse::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            AppResponse::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppResponse::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppResponse::BadRequest(msg) => write!(f, "Bad Request: {}", msg),
            AppResponse::Conflict(msg) => write!(f, "Conflict: {}", msg),
            AppResponse::PreconditionFailed(msg) => write!(f, "Precondition failed: {}", msg),
            AppResponse::NotModified(msg) => write!(f, "Not modified: {}", msg),
            AppResponse::Created(msg) => write!(f, "Created: {}", msg),
            AppResponse::Ok(msg) => write!(f, "Ok: {}", msg),
        }
    }
}

impl From<StoreError> for AppResponse {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidDocument(doc_err) => AppResponse::from(doc_err),
            StoreError::Serialization(serde_err) => AppResponse::from(serde_err),
            StoreError::Database(lmdb_err) => {
                AppResponse::DatabaseError(format!("LMDB error: {}", lmdb_err))
            }
            StoreError::Io(io_err) => AppResponse::DatabaseError(format!("IO error: {}", io_err)),
            other => AppResponse::DatabaseError(other.to_string()),
        }
    }
}

impl From<DocumentError> for AppResponse {
    fn from(err: DocumentError) -> Self {
        AppResponse::ValidationError(err.to_string())
    }
}

impl From<SerdeError> for AppResponse {
    fn from(err: SerdeError) -> Self {
        AppResponse::SerializationError(format!("JSON serialization error: {}", err))
    }
}

impl AppResponse {
    pub fn success(msg: impl Into<String>) -> Self {
        AppResponse::Ok(msg.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AppResponse::Ok(_) | AppResponse::Created(_))
    }
}
