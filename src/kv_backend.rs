//! Key-value primitives the document engine is written against.
//!
//! The engine only needs single-key atomic operations on two value kinds,
//! hashes (flat records) and sets (indirection sets), plus key enumeration by
//! prefix. No multi-key transaction is assumed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::store_error::{StoreError, StoreResult};

/// A value held under one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoredValue {
    Hash(BTreeMap<String, String>),
    Set(BTreeSet<String>),
}

impl StoredValue {
    fn kind(&self) -> &'static str {
        match self {
            StoredValue::Hash(_) => "hash",
            StoredValue::Set(_) => "set",
        }
    }
}

/// Single-key key-value store.
///
/// Implementations must make each call atomic with respect to its key and
/// propagate every backend failure. A hash call on a set key (or a set call
/// on a hash key) fails with [`StoreError::WrongType`]; reads of absent keys
/// return empty results, never errors.
pub trait KeyValueBackend: Send + Sync {
    /// Reads one field of a hash.
    fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    /// Writes one field of a hash, creating the hash if needed.
    fn hash_set(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;

    /// Writes several fields of one hash.
    ///
    /// Default implementation calls `hash_set()` per field. Backends may
    /// override to apply them in a single write.
    fn hash_set_many(&self, key: &str, fields: &BTreeMap<String, String>) -> StoreResult<()> {
        for (field, value) in fields {
            self.hash_set(key, field, value)?;
        }
        Ok(())
    }

    /// Reads every field of a hash. Absent key yields an empty map.
    fn hash_get_all(&self, key: &str) -> StoreResult<BTreeMap<String, String>>;

    /// Adds a member to a set. Returns `true` if it was not already present.
    fn set_add(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Members of a set. Absent key yields an empty set.
    fn set_members(&self, key: &str) -> StoreResult<BTreeSet<String>>;

    fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Removes a key of any kind. Returns `true` if it existed.
    fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Every key starting with `prefix`, in ascending order.
    fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;
}

/// Applies a hash write to an existing value, enforcing the value kind.
pub(crate) fn merge_hash_fields(
    key: &str,
    current: Option<StoredValue>,
    fields: &BTreeMap<String, String>,
) -> StoreResult<StoredValue> {
    let mut hash = match current {
        None => BTreeMap::new(),
        Some(StoredValue::Hash(hash)) => hash,
        Some(other) => return Err(wrong_type(key, "hash", &other)),
    };
    for (field, value) in fields {
        hash.insert(field.clone(), value.clone());
    }
    Ok(StoredValue::Hash(hash))
}

/// Applies a set insertion to an existing value, enforcing the value kind.
/// Returns the new value and whether the member was added.
pub(crate) fn add_set_member(
    key: &str,
    current: Option<StoredValue>,
    member: &str,
) -> StoreResult<(StoredValue, bool)> {
    let mut set = match current {
        None => BTreeSet::new(),
        Some(StoredValue::Set(set)) => set,
        Some(other) => return Err(wrong_type(key, "set", &other)),
    };
    let added = set.insert(member.to_string());
    Ok((StoredValue::Set(set), added))
}

pub(crate) fn expect_hash(
    key: &str,
    value: Option<StoredValue>,
) -> StoreResult<BTreeMap<String, String>> {
    match value {
        None => Ok(BTreeMap::new()),
        Some(StoredValue::Hash(hash)) => Ok(hash),
        Some(other) => Err(wrong_type(key, "hash", &other)),
    }
}

pub(crate) fn expect_set(key: &str, value: Option<StoredValue>) -> StoreResult<BTreeSet<String>> {
    match value {
        None => Ok(BTreeSet::new()),
        Some(StoredValue::Set(set)) => Ok(set),
        Some(other) => Err(wrong_type(key, "set", &other)),
    }
}

fn wrong_type(key: &str, expected: &'static str, found: &StoredValue) -> StoreError {
    log::warn!("Key '{}' holds a {}, expected a {}", key, found.kind(), expected);
    StoreError::WrongType {
        key: key.to_string(),
        expected,
    }
}

/// In-memory, BTreeMap-based backend.
///
/// Intended for tests and embedding. Values live behind an `RwLock`; reads
/// clone out of the map.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: RwLock<BTreeMap<String, StoredValue>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> StoreResult<usize> {
        Ok(self.entries.read().map_err(|_| StoreError::LockPoisoned)?.len())
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    fn get(&self, key: &str) -> StoreResult<Option<StoredValue>> {
        let map = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(map.get(key).cloned())
    }
}

impl KeyValueBackend for MemoryBackend {
    fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let hash = expect_hash(key, self.get(key)?)?;
        Ok(hash.get(field).cloned())
    }

    fn hash_set(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let mut fields = BTreeMap::new();
        fields.insert(field.to_string(), value.to_string());
        self.hash_set_many(key, &fields)
    }

    fn hash_set_many(&self, key: &str, fields: &BTreeMap<String, String>) -> StoreResult<()> {
        let mut map = self.entries.write().map_err(|_| StoreError::LockPoisoned)?;
        let current = map.get(key).cloned();
        let value = merge_hash_fields(key, current, fields)?;
        map.insert(key.to_string(), value);
        Ok(())
    }

    fn hash_get_all(&self, key: &str) -> StoreResult<BTreeMap<String, String>> {
        expect_hash(key, self.get(key)?)
    }

    fn set_add(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut map = self.entries.write().map_err(|_| StoreError::LockPoisoned)?;
        let current = map.get(key).cloned();
        let (value, added) = add_set_member(key, current, member)?;
        map.insert(key.to_string(), value);
        Ok(added)
    }

    fn set_members(&self, key: &str) -> StoreResult<BTreeSet<String>> {
        expect_set(key, self.get(key)?)
    }

    fn exists(&self, key: &str) -> StoreResult<bool> {
        let map = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(map.contains_key(key))
    }

    fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut map = self.entries.write().map_err(|_| StoreError::LockPoisoned)?;
        Ok(map.remove(key).is_some())
    }

    fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let map = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(map
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}
