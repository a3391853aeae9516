//! Document model and key namespace definitions.
//!
//! This module defines how plan documents are addressed inside the key-value
//! store. Every object node of a document carries an `objectType` and an
//! `objectId`; together they form the node's **root key**
//! (`"<objectType>:<objectId>"`), which is the key of the node's flat record.
//! Nested objects and arrays of objects are linked from their parent through
//! **indirection sets** keyed `"<parentKey>:<fieldName>"`.
//!
//! The module also owns the structural pre-check the engine depends on
//! ([`validate_document`]) and the typed scalar codec used for flat record
//! values ([`encode_scalar`] / [`decode_scalar`]).
//!
//! # Key layout
//!
//! ```text
//! plan:p1                      hash  {objectType, objectId, planType, eTag, ...}
//! plan:p1:planCostShares       set   {"membercostshare:c1"}
//! membercostshare:c1           hash  {objectType, objectId, deductible, copay}
//! ```

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Separator between key segments. Forbidden inside identifiers and field names.
pub const KEY_SEPARATOR: char = ':';

pub const OBJECT_TYPE_FIELD: &str = "objectType";
pub const OBJECT_ID_FIELD: &str = "objectId";

/// Flat record field holding the root document's fingerprint.
pub const ETAG_FIELD: &str = "eTag";

/// Flat record field listing the fields that were arrays of objects.
pub const ARRAY_FIELDS_FIELD: &str = "__arrayFields";

/// Fields the engine writes into flat records for its own bookkeeping.
/// Documents may not use these names.
pub const RESERVED_FIELDS: [&str; 2] = [ETAG_FIELD, ARRAY_FIELDS_FIELD];

/// A stored plan as returned to callers: its root key, its current
/// fingerprint and the reconstructed document.
///
/// # Examples
///
/// ```text
/// {
///   "key": "plan:12xvxc345ssdsds-508",
///   "etag": "\"3q2+7w...=\"",
///   "document": { "objectType": "plan", "objectId": "12xvxc345ssdsds-508", ... }
/// }
/// ```
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct PlanRecord {
    /// Root key, `"<objectType>:<objectId>"` of the top-level object.
    pub key: String,

    /// Quoted base64 SHA-256 fingerprint of the document as last written.
    pub etag: String,

    /// The full nested document, without engine bookkeeping fields.
    pub document: JsonValue,
}

/// Reasons a document cannot be mapped onto the key namespace.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentError {
    /// The value at `path` must be an object.
    NotAnObject { path: String },
    /// An object node lacks `objectType`/`objectId`, or it is not a string.
    MissingIdentity { path: String, field: &'static str },
    /// An identifier or field name contains the key separator.
    ForbiddenSeparator { path: String, value: String },
    /// A document field uses a name reserved for bookkeeping.
    ReservedField { path: String, field: String },
    /// An array mixes objects with other values, or nests objects in inner arrays.
    MixedArray { path: String },
    /// The caller-supplied root key does not match the document's identity.
    RootKeyMismatch { expected: String, found: String },
    /// Two nodes of one document share `key`; the second one sits at `path`.
    DuplicateIdentity { path: String, key: String },
}

impl Display for DocumentError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentError::NotAnObject { path } => write!(f, "{} is not an object", path),
            DocumentError::MissingIdentity { path, field } => {
                write!(f, "{} is missing string field '{}'", path, field)
            }
            DocumentError::ForbiddenSeparator { path, value } => write!(
                f,
                "{}: '{}' contains the reserved separator '{}'",
                path, value, KEY_SEPARATOR
            ),
            DocumentError::ReservedField { path, field } => {
                write!(f, "{}: field name '{}' is reserved", path, field)
            }
            DocumentError::MixedArray { path } => {
                write!(f, "{}: arrays must hold either only objects or no objects", path)
            }
            DocumentError::RootKeyMismatch { expected, found } => write!(
                f,
                "root key '{}' does not match document identity '{}'",
                found, expected
            ),
            DocumentError::DuplicateIdentity { path, key } => {
                write!(f, "{}: identity '{}' already used in this document", path, key)
            }
        }
    }
}

impl std::error::Error for DocumentError {}

/// Builds a root key from its two identity parts.
pub fn root_key(object_type: &str, object_id: &str) -> String {
    format!("{object_type}{KEY_SEPARATOR}{object_id}")
}

/// Key of the indirection set linking `parent_key` to the children under `field`.
pub fn indirection_key(parent_key: &str, field: &str) -> String {
    format!("{parent_key}{KEY_SEPARATOR}{field}")
}

/// A root key has exactly one separator; indirection keys have more.
pub fn is_root_key(key: &str) -> bool {
    key.matches(KEY_SEPARATOR).count() == 1
}

/// Derives the root key of an object node from its identity fields.
pub fn identity_key(node: &Map<String, JsonValue>, path: &str) -> Result<String, DocumentError> {
    let object_type = identity_field(node, OBJECT_TYPE_FIELD, path)?;
    let object_id = identity_field(node, OBJECT_ID_FIELD, path)?;
    Ok(root_key(object_type, object_id))
}

fn identity_field<'a>(
    node: &'a Map<String, JsonValue>,
    field: &'static str,
    path: &str,
) -> Result<&'a str, DocumentError> {
    let value = node
        .get(field)
        .and_then(JsonValue::as_str)
        .ok_or_else(|| DocumentError::MissingIdentity {
            path: path.to_string(),
            field,
        })?;

    if value.is_empty() {
        return Err(DocumentError::MissingIdentity {
            path: path.to_string(),
            field,
        });
    }
    if value.contains(KEY_SEPARATOR) {
        return Err(DocumentError::ForbiddenSeparator {
            path: path.to_string(),
            value: value.to_string(),
        });
    }
    Ok(value)
}

/// How an array field is laid out in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayShape {
    /// Every element is an object: stored as an indirection set.
    Objects,
    /// No element contains an object: stored as one typed scalar field.
    Scalars,
}

/// Classifies an array field, rejecting layouts the namespace cannot express.
pub fn classify_array(items: &[JsonValue], path: &str) -> Result<ArrayShape, DocumentError> {
    if items.is_empty() {
        return Ok(ArrayShape::Scalars);
    }

    if items.iter().all(JsonValue::is_object) {
        return Ok(ArrayShape::Objects);
    }

    if items.iter().any(contains_object) {
        return Err(DocumentError::MixedArray {
            path: path.to_string(),
        });
    }
    Ok(ArrayShape::Scalars)
}

fn contains_object(value: &JsonValue) -> bool {
    match value {
        JsonValue::Object(_) => true,
        JsonValue::Array(items) => items.iter().any(contains_object),
        _ => false,
    }
}

/// Structural pre-check run before a document reaches the store.
///
/// Verifies that the top-level value and every nested object carry string
/// identity fields, that no identifier or field name contains the key
/// separator, that no reserved field name is used, and that every array is
/// either all objects or free of objects. Every node must have its own
/// identity: a repeated `<objectType>:<objectId>` would share one flat
/// record.
///
/// Returns the document's root key.
pub fn validate_document(document: &JsonValue) -> Result<String, DocumentError> {
    let node = document.as_object().ok_or_else(|| DocumentError::NotAnObject {
        path: "$".to_string(),
    })?;
    let mut seen = BTreeSet::new();
    validate_node(node, "$", &mut seen)
}

/// Records `key` as used, failing if an earlier node already claimed it.
pub(crate) fn claim_identity(
    seen: &mut BTreeSet<String>,
    key: &str,
    path: &str,
) -> Result<(), DocumentError> {
    if seen.insert(key.to_string()) {
        Ok(())
    } else {
        Err(DocumentError::DuplicateIdentity {
            path: path.to_string(),
            key: key.to_string(),
        })
    }
}

fn validate_node(
    node: &Map<String, JsonValue>,
    path: &str,
    seen: &mut BTreeSet<String>,
) -> Result<String, DocumentError> {
    let key = identity_key(node, path)?;
    claim_identity(seen, &key, path)?;

    for (field, value) in node {
        if RESERVED_FIELDS.contains(&field.as_str()) {
            return Err(DocumentError::ReservedField {
                path: path.to_string(),
                field: field.clone(),
            });
        }
        if field.contains(KEY_SEPARATOR) {
            return Err(DocumentError::ForbiddenSeparator {
                path: path.to_string(),
                value: field.clone(),
            });
        }

        let child_path = format!("{path}.{field}");
        match value {
            JsonValue::Object(child) => {
                validate_node(child, &child_path, seen)?;
            }
            JsonValue::Array(items) => {
                if classify_array(items, &child_path)? == ArrayShape::Objects {
                    for (index, item) in items.iter().enumerate() {
                        if let JsonValue::Object(child) = item {
                            validate_node(child, &format!("{child_path}[{index}]"), seen)?;
                        }
                    }
                }
            }
            _ => {}
        }
    }

    Ok(key)
}

/// Encodes a scalar (or scalar-only array) as its JSON text.
///
/// The JSON text doubles as a type tag: `"2000"` and `2000` stay distinct.
pub fn encode_scalar(value: &JsonValue) -> Result<String, serde_json::Error> {
    serde_json::to_string(value)
}

/// Decodes a flat record value written by [`encode_scalar`].
///
/// Values that are not valid JSON come from an untyped writer; those are
/// restored as integers when they parse as one and as strings otherwise.
pub fn decode_scalar(raw: &str) -> JsonValue {
    match serde_json::from_str::<JsonValue>(raw) {
        Ok(value) => value,
        Err(_) => match raw.parse::<i64>() {
            Ok(number) => JsonValue::from(number),
            Err(_) => JsonValue::String(raw.to_string()),
        },
    }
}
