//! Document store facade over a [`KeyValueBackend`].
//!
//! [`PlanStore`] ties decomposition, reconstruction, purge and fingerprinting
//! together behind root-key addressed operations. It holds no state of its
//! own besides the backend and its configuration; every call is a sequence of
//! single-key backend operations.

use std::collections::BTreeSet;

use log::{debug, info};
use serde_json::Value as JsonValue;

use crate::decompose::{decompose, write_decomposition};
use crate::document_model::{is_root_key, root_key, DocumentError, PlanRecord, ETAG_FIELD};
use crate::fingerprint::fingerprint;
use crate::kv_backend::KeyValueBackend;
use crate::reconstruct::{purge, reconstruct};
use crate::store_error::StoreResult;

/// Field known to hold an array of objects in plan documents.
pub const LINKED_PLAN_SERVICES_FIELD: &str = "linkedPlanServices";

/// Object type listed by collection-wide reads.
pub const PLAN_OBJECT_TYPE: &str = "plan";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Fields always rebuilt as arrays, even with a single child. Needed for
    /// data written without array-field markers.
    pub array_fields: BTreeSet<String>,
    /// Object type of the top-level documents served by collection reads.
    pub collection_type: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            array_fields: BTreeSet::from([LINKED_PLAN_SERVICES_FIELD.to_string()]),
            collection_type: PLAN_OBJECT_TYPE.to_string(),
        }
    }
}

pub struct PlanStore<B> {
    backend: B,
    config: StoreConfig,
}

impl<B: KeyValueBackend> PlanStore<B> {
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, StoreConfig::default())
    }

    pub fn with_config(backend: B, config: StoreConfig) -> Self {
        Self { backend, config }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Decomposes `document` into the store and records its fingerprint on
    /// `root_key`. Returns the fingerprint.
    ///
    /// Writing under an existing root key overwrites scalar fields and adds
    /// to indirection sets; children no longer present in `document` are
    /// left in place. The writes are not atomic as a whole.
    pub fn store(&self, document: &JsonValue, root_key: &str) -> StoreResult<String> {
        let (key, decomposition) = decompose(document)?;
        if key != root_key {
            return Err(DocumentError::RootKeyMismatch {
                expected: key,
                found: root_key.to_string(),
            }
            .into());
        }

        write_decomposition(&self.backend, &decomposition)?;

        let etag = fingerprint(document);
        self.backend.hash_set(root_key, ETAG_FIELD, &etag)?;

        debug!(
            "Stored '{}' across {} keys, etag {}",
            root_key,
            decomposition.key_count(),
            etag
        );
        Ok(etag)
    }

    /// Reconstructs the document stored under `root_key`, or `None`.
    pub fn load(&self, root_key: &str) -> StoreResult<Option<JsonValue>> {
        reconstruct(&self.backend, root_key, &self.config.array_fields)
    }

    /// Deletes `root_key` and everything it owns. Returns the keys removed.
    pub fn purge(&self, root_key: &str) -> StoreResult<usize> {
        let removed = purge(&self.backend, root_key)?;
        info!("Purged '{}' ({} keys)", root_key, removed);
        Ok(removed)
    }

    pub fn exists(&self, root_key: &str) -> StoreResult<bool> {
        self.backend.exists(root_key)
    }

    pub fn current_fingerprint(&self, root_key: &str) -> StoreResult<Option<String>> {
        self.backend.hash_get(root_key, ETAG_FIELD)
    }

    /// Root keys of every stored top-level object of `object_type`.
    ///
    /// Indirection sets share the `<objectType>:` prefix but carry a second
    /// separator; they are filtered out.
    pub fn list_root_keys(&self, object_type: &str) -> StoreResult<BTreeSet<String>> {
        let prefix = root_key(object_type, "");
        Ok(self
            .backend
            .keys_with_prefix(&prefix)?
            .into_iter()
            .filter(|key| is_root_key(key))
            .collect())
    }

    /// Every stored document of `object_type`, with its fingerprint.
    pub fn load_all(&self, object_type: &str) -> StoreResult<Vec<PlanRecord>> {
        let mut records = Vec::new();
        for key in self.list_root_keys(object_type)? {
            if let Some(record) = self.load_record(&key)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// The document under `root_key` together with its fingerprint.
    pub fn load_record(&self, root_key: &str) -> StoreResult<Option<PlanRecord>> {
        let document = match self.load(root_key)? {
            Some(document) => document,
            None => return Ok(None),
        };
        let etag = self.current_fingerprint(root_key)?.unwrap_or_default();
        Ok(Some(PlanRecord {
            key: root_key.to_string(),
            etag,
            document,
        }))
    }
}
