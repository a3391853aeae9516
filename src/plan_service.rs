//! Caller-facing plan operations: conditional reads and writes on top of
//! [`PlanStore`], with one change event per mutation.
//!
//! ETag preconditions follow the usual conditional-request rules. A write that
//! names an `If-Match` tag fails with `PreconditionFailed` when it differs
//! from the stored fingerprint; an `If-None-Match` tag equal to the stored
//! fingerprint short-circuits with `NotModified`. Patch and delete require at
//! least one of the two. When both are sent, patch checks `If-Match` first and
//! delete checks `If-None-Match` first.

use log::{info, warn};
use serde_json::{Map, Value as JsonValue};

use crate::app_response::AppResponse;
use crate::change_event::{ChangeEvent, ChangeEventSink, ChangeOperation};
use crate::document_model::{identity_key, validate_document, DocumentError, PlanRecord};
use crate::kv_backend::KeyValueBackend;
use crate::plan_store::PlanStore;
use crate::store_error::StoreError;

pub type ServiceResult<T> = Result<T, AppResponse>;

pub struct PlanService<B, S> {
    store: PlanStore<B>,
    events: S,
}

impl<B: KeyValueBackend, S: ChangeEventSink> PlanService<B, S> {
    pub fn new(store: PlanStore<B>, events: S) -> Self {
        Self { store, events }
    }

    pub fn store(&self) -> &PlanStore<B> {
        &self.store
    }

    pub fn events(&self) -> &S {
        &self.events
    }

    /// Stores a new document. Fails with `Conflict` if its root key exists.
    pub fn create(&self, document: &JsonValue) -> ServiceResult<PlanRecord> {
        let key = validate_document(document)?;
        if self.store.exists(&key)? {
            return Err(AppResponse::Conflict(format!("Plan '{key}' already exists")));
        }

        let etag = self.store.store(document, &key)?;
        self.events
            .publish(ChangeEvent::new(ChangeOperation::Save, document));
        info!("Created '{}'", key);

        Ok(PlanRecord {
            key,
            etag,
            document: document.clone(),
        })
    }

    pub fn get(
        &self,
        key: &str,
        if_match: Option<&str>,
        if_none_match: Option<&str>,
    ) -> ServiceResult<PlanRecord> {
        let record = self.load_existing(key)?;
        check_if_match(&record.etag, if_match)?;
        check_if_none_match(&record.etag, if_none_match)?;
        Ok(record)
    }

    /// Every document of the configured collection type.
    pub fn list(&self) -> ServiceResult<Vec<PlanRecord>> {
        let collection = &self.store.config().collection_type;
        Ok(self.store.load_all(collection)?)
    }

    /// Replaces the document under `key` wholesale.
    ///
    /// The old tree is purged first, so children absent from `document` do
    /// not survive the replace.
    pub fn replace(
        &self,
        key: &str,
        document: &JsonValue,
        if_match: Option<&str>,
    ) -> ServiceResult<PlanRecord> {
        let current = self.load_existing(key)?;
        check_if_match(&current.etag, if_match)?;

        self.rewrite(key, document)?;
        let etag = self.store.store(document, key)?;
        self.events
            .publish(ChangeEvent::new(ChangeOperation::Update, document));
        info!("Replaced '{}'", key);

        Ok(PlanRecord {
            key: key.to_string(),
            etag,
            document: document.clone(),
        })
    }

    /// Merges `patch` into the document under `key`.
    ///
    /// Scalars overwrite, nested objects with the same identity merge
    /// recursively, and arrays of objects gain the incoming elements (an
    /// element with the identity of an existing one is merged into it).
    pub fn patch(
        &self,
        key: &str,
        patch: &JsonValue,
        if_match: Option<&str>,
        if_none_match: Option<&str>,
    ) -> ServiceResult<PlanRecord> {
        let current = self.load_existing(key)?;
        require_precondition(if_match, if_none_match)?;
        check_if_match(&current.etag, if_match)?;
        check_if_none_match(&current.etag, if_none_match)?;

        let mut merged = current.document;
        merge_patch(&mut merged, patch)?;

        self.rewrite(key, &merged)?;
        let etag = self.store.store(&merged, key)?;
        self.events
            .publish(ChangeEvent::new(ChangeOperation::Update, &merged));
        info!("Patched '{}'", key);

        Ok(PlanRecord {
            key: key.to_string(),
            etag,
            document: merged,
        })
    }

    /// Removes the document under `key` and returns what was removed.
    ///
    /// A document whose stored tree cannot be rebuilt is still purged; the
    /// returned record then carries a `null` document.
    pub fn delete(
        &self,
        key: &str,
        if_match: Option<&str>,
        if_none_match: Option<&str>,
    ) -> ServiceResult<PlanRecord> {
        let current = match self.store.load_record(key) {
            Ok(Some(record)) => record,
            Ok(None) => return Err(not_found(key)),
            Err(StoreError::Corrupted(reason)) => {
                warn!("Deleting '{}' despite corrupted tree: {}", key, reason);
                PlanRecord {
                    key: key.to_string(),
                    etag: self.store.current_fingerprint(key)?.unwrap_or_default(),
                    document: JsonValue::Null,
                }
            }
            Err(e) => return Err(e.into()),
        };
        require_precondition(if_match, if_none_match)?;
        check_if_none_match(&current.etag, if_none_match)?;
        check_if_match(&current.etag, if_match)?;

        self.store.purge(key)?;
        self.events
            .publish(ChangeEvent::new(ChangeOperation::Delete, &current.document));
        info!("Deleted '{}'", key);

        Ok(current)
    }

    fn load_existing(&self, key: &str) -> ServiceResult<PlanRecord> {
        self.store.load_record(key)?.ok_or_else(|| not_found(key))
    }

    /// Validates a replacement for `key` and clears the old tree.
    fn rewrite(&self, key: &str, document: &JsonValue) -> ServiceResult<()> {
        let document_key = validate_document(document)?;
        if document_key != key {
            return Err(DocumentError::RootKeyMismatch {
                expected: document_key,
                found: key.to_string(),
            }
            .into());
        }
        self.store.purge(key)?;
        Ok(())
    }
}

fn non_empty(tag: Option<&str>) -> Option<&str> {
    tag.filter(|tag| !tag.is_empty())
}

fn not_found(key: &str) -> AppResponse {
    AppResponse::NotFound(format!("No plan found with key: {key}"))
}

/// Writes that change existing data must name at least one ETag.
fn require_precondition(if_match: Option<&str>, if_none_match: Option<&str>) -> ServiceResult<()> {
    if non_empty(if_match).is_none() && non_empty(if_none_match).is_none() {
        return Err(AppResponse::BadRequest(
            "ETag must be provided in either If-Match or If-None-Match".to_string(),
        ));
    }
    Ok(())
}

fn check_if_match(current: &str, if_match: Option<&str>) -> ServiceResult<()> {
    match non_empty(if_match) {
        Some(tag) if tag != current => Err(AppResponse::PreconditionFailed(format!(
            "ETag {tag} does not match current {current}"
        ))),
        _ => Ok(()),
    }
}

fn check_if_none_match(current: &str, if_none_match: Option<&str>) -> ServiceResult<()> {
    match non_empty(if_none_match) {
        Some(tag) if tag == current => Err(AppResponse::NotModified(current.to_string())),
        _ => Ok(()),
    }
}

fn identity_of(value: &JsonValue) -> Option<String> {
    value
        .as_object()
        .and_then(|node| identity_key(node, "$").ok())
}

fn merge_patch(target: &mut JsonValue, patch: &JsonValue) -> ServiceResult<()> {
    let patch = patch
        .as_object()
        .ok_or_else(|| AppResponse::ValidationError("Patch body must be an object".to_string()))?;
    let target = target
        .as_object_mut()
        .ok_or_else(|| AppResponse::ValidationError("Stored document is not an object".to_string()))?;
    merge_fields(target, patch)
}

fn merge_fields(
    target: &mut Map<String, JsonValue>,
    patch: &Map<String, JsonValue>,
) -> ServiceResult<()> {
    for (field, incoming) in patch {
        match target.get_mut(field) {
            Some(existing) => merge_value(existing, incoming)?,
            None => {
                target.insert(field.clone(), incoming.clone());
            }
        }
    }
    Ok(())
}

fn merge_value(existing: &mut JsonValue, incoming: &JsonValue) -> ServiceResult<()> {
    if existing.is_object()
        && incoming.is_object()
        && identity_of(existing) == identity_of(incoming)
    {
        return merge_patch(existing, incoming);
    }

    if let (JsonValue::Array(current), JsonValue::Array(items)) = (&mut *existing, incoming) {
        if items.iter().all(JsonValue::is_object) && current.iter().all(JsonValue::is_object) {
            for item in items {
                let identity = identity_of(item);
                let matching = current
                    .iter_mut()
                    .find(|element| identity.is_some() && identity_of(element) == identity);
                match matching {
                    Some(element) => merge_patch(element, item)?,
                    None => current.push(item.clone()),
                }
            }
            return Ok(());
        }
    }

    *existing = incoming.clone();
    Ok(())
}
