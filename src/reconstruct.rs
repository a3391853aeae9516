//! Walks of the flat namespace starting at a root key: reconstruction of the
//! nested document, and recursive purge of everything it owns.
//!
//! Both walks enumerate the root's flat record (`<key>`) and its indirection
//! sets (`<key>:<field>`), then descend into every child key listed in those
//! sets.

use std::collections::BTreeSet;

use log::warn;
use serde_json::{Map, Value as JsonValue};

use crate::decompose::parse_array_fields;
use crate::document_model::{decode_scalar, indirection_key, ARRAY_FIELDS_FIELD, ETAG_FIELD};
use crate::kv_backend::KeyValueBackend;
use crate::store_error::{StoreError, StoreResult};

/// Rebuilds the document stored under `root_key`.
///
/// Returns `Ok(None)` when the root has no flat record. An indirection set is
/// rebuilt as an array when it holds more than one child, when the record
/// marked the field as an array at write time, or when the field is listed in
/// `known_arrays`; otherwise as a single nested object. Array elements come
/// back ordered by child key.
pub fn reconstruct<B: KeyValueBackend + ?Sized>(
    backend: &B,
    root_key: &str,
    known_arrays: &BTreeSet<String>,
) -> StoreResult<Option<JsonValue>> {
    let mut ancestors = Vec::new();
    load_node(backend, root_key, known_arrays, &mut ancestors)
}

fn load_node<B: KeyValueBackend + ?Sized>(
    backend: &B,
    key: &str,
    known_arrays: &BTreeSet<String>,
    ancestors: &mut Vec<String>,
) -> StoreResult<Option<JsonValue>> {
    if ancestors.iter().any(|ancestor| ancestor == key) {
        return Err(StoreError::Corrupted(format!(
            "indirection cycle through '{key}'"
        )));
    }

    let record = backend.hash_get_all(key)?;
    if record.is_empty() {
        return Ok(None);
    }

    let mut document = Map::new();
    let mut marked_arrays = BTreeSet::new();
    for (field, raw) in &record {
        match field.as_str() {
            ETAG_FIELD => {}
            ARRAY_FIELDS_FIELD => marked_arrays = parse_array_fields(raw),
            _ => {
                document.insert(field.clone(), decode_scalar(raw));
            }
        }
    }

    let prefix = indirection_key(key, "");
    ancestors.push(key.to_string());
    for set_key in backend.keys_with_prefix(&prefix)? {
        let field = &set_key[prefix.len()..];
        let members = backend.set_members(&set_key)?;

        let mut children = Vec::with_capacity(members.len());
        for member in &members {
            match load_node(backend, member, known_arrays, ancestors)? {
                Some(child) => children.push(child),
                None => warn!("'{}' links to missing record '{}'", set_key, member),
            }
        }

        let is_array = members.len() > 1
            || marked_arrays.contains(field)
            || known_arrays.contains(field);
        if is_array {
            document.insert(field.to_string(), JsonValue::Array(children));
        } else if let Some(child) = children.pop() {
            document.insert(field.to_string(), child);
        }
    }
    ancestors.pop();

    Ok(Some(JsonValue::Object(document)))
}

/// Deletes `root_key` and every record and indirection set reachable from it.
///
/// Children go before the set that references them, and the root record goes
/// last. Returns the number of keys removed.
pub fn purge<B: KeyValueBackend + ?Sized>(backend: &B, root_key: &str) -> StoreResult<usize> {
    let mut ancestors = Vec::new();
    purge_node(backend, root_key, &mut ancestors)
}

fn purge_node<B: KeyValueBackend + ?Sized>(
    backend: &B,
    key: &str,
    ancestors: &mut Vec<String>,
) -> StoreResult<usize> {
    if ancestors.iter().any(|ancestor| ancestor == key) {
        warn!("Skipping '{}' during purge: already on the descent path", key);
        return Ok(0);
    }

    let mut removed = 0;
    let prefix = indirection_key(key, "");
    ancestors.push(key.to_string());
    for set_key in backend.keys_with_prefix(&prefix)? {
        for member in backend.set_members(&set_key)? {
            removed += purge_node(backend, &member, ancestors)?;
        }
        if backend.delete(&set_key)? {
            removed += 1;
        }
    }
    ancestors.pop();

    if backend.delete(key)? {
        removed += 1;
    }
    Ok(removed)
}
