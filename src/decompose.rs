//! Document decomposition: nested document → flat records + indirection sets.
//!
//! Decomposition is split in two steps. [`decompose`] is a pure recursive
//! walk that returns a [`Decomposition`]; every subtree yields its own
//! result, which the parent merges into its own. [`write_decomposition`] then
//! applies the result to a [`KeyValueBackend`] one key at a time.

use std::collections::{BTreeMap, BTreeSet};

use log::warn;
use serde_json::{Map, Value as JsonValue};

use crate::document_model::{
    claim_identity, classify_array, encode_scalar, identity_key, indirection_key, ArrayShape,
    DocumentError, ARRAY_FIELDS_FIELD,
};
use crate::kv_backend::KeyValueBackend;
use crate::store_error::StoreResult;

/// Everything one document writes into the key namespace.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Decomposition {
    /// Flat records: node root key → (field → encoded scalar).
    pub records: BTreeMap<String, BTreeMap<String, String>>,
    /// Indirection sets: `<parentKey>:<field>` → child root keys.
    pub links: BTreeMap<String, BTreeSet<String>>,
}

impl Decomposition {
    /// Number of distinct keys this decomposition writes.
    pub fn key_count(&self) -> usize {
        self.records.len() + self.links.len()
    }

    fn add_record(&mut self, key: String, fields: BTreeMap<String, String>) {
        let record = self.records.entry(key).or_default();
        for (field, value) in fields {
            if field == ARRAY_FIELDS_FIELD {
                if let Some(existing) = record.get(ARRAY_FIELDS_FIELD) {
                    let merged = union_array_fields(existing, &value);
                    record.insert(field, merged);
                    continue;
                }
            }
            record.insert(field, value);
        }
    }

    fn add_link(&mut self, set_key: String, child_key: String) {
        self.links.entry(set_key).or_default().insert(child_key);
    }

    fn merge(&mut self, other: Decomposition) {
        for (key, fields) in other.records {
            self.add_record(key, fields);
        }
        for (set_key, members) in other.links {
            self.links.entry(set_key).or_default().extend(members);
        }
    }
}

/// Flattens a document. Returns its root key and the records/links to write.
///
/// Fails with [`DocumentError::DuplicateIdentity`] when two nodes share a
/// root key, since they would collapse into one flat record.
pub fn decompose(document: &JsonValue) -> StoreResult<(String, Decomposition)> {
    let node = document.as_object().ok_or_else(|| DocumentError::NotAnObject {
        path: "$".to_string(),
    })?;
    let mut seen = BTreeSet::new();
    decompose_node(node, "$", &mut seen)
}

fn decompose_node(
    node: &Map<String, JsonValue>,
    path: &str,
    seen: &mut BTreeSet<String>,
) -> StoreResult<(String, Decomposition)> {
    let key = identity_key(node, path)?;
    claim_identity(seen, &key, path)?;
    let mut result = Decomposition::default();
    let mut fields = BTreeMap::new();
    let mut array_fields = BTreeSet::new();

    for (field, value) in node {
        let child_path = format!("{path}.{field}");
        match value {
            JsonValue::Object(child) => {
                let (child_key, sub) = decompose_node(child, &child_path, seen)?;
                result.merge(sub);
                result.add_link(indirection_key(&key, field), child_key);
            }
            JsonValue::Array(items) => match classify_array(items, &child_path)? {
                ArrayShape::Objects => {
                    for (index, item) in items.iter().enumerate() {
                        if let JsonValue::Object(child) = item {
                            let item_path = format!("{child_path}[{index}]");
                            let (child_key, sub) = decompose_node(child, &item_path, seen)?;
                            result.merge(sub);
                            result.add_link(indirection_key(&key, field), child_key);
                        }
                    }
                    array_fields.insert(field.clone());
                }
                ArrayShape::Scalars => {
                    fields.insert(field.clone(), encode_scalar(value)?);
                }
            },
            scalar => {
                fields.insert(field.clone(), encode_scalar(scalar)?);
            }
        }
    }

    if !array_fields.is_empty() {
        fields.insert(
            ARRAY_FIELDS_FIELD.to_string(),
            serde_json::to_string(&array_fields)?,
        );
    }
    result.add_record(key.clone(), fields);

    Ok((key, result))
}

/// Parses an `__arrayFields` value. Unreadable values count as empty.
pub(crate) fn parse_array_fields(raw: &str) -> BTreeSet<String> {
    match serde_json::from_str(raw) {
        Ok(names) => names,
        Err(e) => {
            warn!("Ignoring unreadable {} marker '{}': {e}", ARRAY_FIELDS_FIELD, raw);
            BTreeSet::new()
        }
    }
}

fn union_array_fields(left: &str, right: &str) -> String {
    let mut names = parse_array_fields(left);
    names.extend(parse_array_fields(right));
    serde_json::to_string(&names).unwrap_or_else(|_| right.to_string())
}

/// Writes a decomposition into the backend.
///
/// Flat records go first and indirection sets last, so a link is only ever
/// published after the record it points at. Array-field markers are merged
/// with what an earlier write left on the same record.
pub fn write_decomposition<B: KeyValueBackend + ?Sized>(
    backend: &B,
    decomposition: &Decomposition,
) -> StoreResult<()> {
    for (key, fields) in &decomposition.records {
        match fields.get(ARRAY_FIELDS_FIELD) {
            Some(marker) => {
                let mut fields = fields.clone();
                if let Some(existing) = backend.hash_get(key, ARRAY_FIELDS_FIELD)? {
                    fields.insert(
                        ARRAY_FIELDS_FIELD.to_string(),
                        union_array_fields(&existing, marker),
                    );
                }
                backend.hash_set_many(key, &fields)?;
            }
            None => backend.hash_set_many(key, fields)?,
        }
    }

    for (set_key, members) in &decomposition.links {
        for member in members {
            backend.set_add(set_key, member)?;
        }
    }

    Ok(())
}
