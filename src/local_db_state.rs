//! LMDB-backed key-value backend and the FFI database handle.
//!
//! [`LmdbBackend`] stores every key of the document namespace in one named
//! LMDB database. Values are `serde_json`-encoded [`StoredValue`]s. Each
//! primitive runs in its own LMDB transaction, so every call is atomic on its
//! key and nothing spans several keys.
//!
//! [`AppDbState`] is the handle the C-ABI surface hands out: a
//! [`PlanService`] over an [`LmdbBackend`] with a drainable event queue.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use lmdb::{Cursor, Database, DatabaseFlags, Environment, RwTransaction, Transaction, WriteFlags};
use lmdb_sys::MDB_SET_RANGE;
use log::{debug, info, warn};

use crate::change_event::QueuedEventSink;
use crate::kv_backend::{
    add_set_member, expect_hash, expect_set, merge_hash_fields, KeyValueBackend, StoredValue,
};
use crate::plan_service::PlanService;
use crate::plan_store::{PlanStore, StoreConfig};
use crate::store_error::StoreResult;

/// Upper bound of the memory map; LMDB grows the file lazily up to this size.
const MAP_SIZE: usize = 1024 * 1024 * 1024;
const MAX_DBS: u32 = 4;
const KV_DB_NAME: &str = "kv";

pub struct LmdbBackend {
    env: Environment,
    db: Database,
    path: PathBuf,
}

impl LmdbBackend {
    /// Opens (creating if needed) the environment at `<name>.lmdb/`.
    pub fn open(name: &str) -> StoreResult<Self> {
        let path = PathBuf::from(format!("{name}.lmdb"));
        std::fs::create_dir_all(&path)?;

        let env = Environment::new()
            .set_max_dbs(MAX_DBS)
            .set_map_size(MAP_SIZE)
            .open(&path)?;
        let db = env.create_db(Some(KV_DB_NAME), DatabaseFlags::empty())?;

        info!("LMDB environment opened at {}", path.display());
        Ok(Self { env, db, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_value(&self, key: &str) -> StoreResult<Option<StoredValue>> {
        let txn = self.env.begin_ro_txn()?;
        let value = match txn.get(self.db, &key) {
            Ok(bytes) => Some(serde_json::from_slice::<StoredValue>(bytes)?),
            Err(lmdb::Error::NotFound) => None,
            Err(e) => return Err(e.into()),
        };
        txn.commit()?;
        Ok(value)
    }

    fn read_in(txn: &RwTransaction<'_>, db: Database, key: &str) -> StoreResult<Option<StoredValue>> {
        match txn.get(db, &key) {
            Ok(bytes) => Ok(Some(serde_json::from_slice::<StoredValue>(bytes)?)),
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read-modify-write of one key inside a single write transaction.
    fn update<T>(
        &self,
        key: &str,
        apply: impl FnOnce(Option<StoredValue>) -> StoreResult<(StoredValue, T)>,
    ) -> StoreResult<T> {
        let mut txn = self.env.begin_rw_txn()?;
        let current = Self::read_in(&txn, self.db, key)?;
        let (next, outcome) = apply(current)?;

        let bytes = serde_json::to_vec(&next)?;
        txn.put(self.db, &key, &bytes, WriteFlags::empty())?;
        txn.commit()?;
        Ok(outcome)
    }

    /// Removes every key. Returns how many were removed.
    pub fn clear_all_records(&self) -> StoreResult<usize> {
        let count = self.keys_with_prefix("")?.len();
        let mut txn = self.env.begin_rw_txn()?;
        txn.clear_db(self.db)?;
        txn.commit()?;
        info!("Cleared {} keys from {}", count, self.path.display());
        Ok(count)
    }

    /// Flushes the environment to disk.
    ///
    /// The environment itself is released when the backend is dropped.
    pub fn close_database(&self) -> StoreResult<()> {
        self.env.sync(true)?;
        info!("LMDB environment at {} synced for close", self.path.display());
        Ok(())
    }
}

impl KeyValueBackend for LmdbBackend {
    fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let hash = expect_hash(key, self.read_value(key)?)?;
        Ok(hash.get(field).cloned())
    }

    fn hash_set(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let mut fields = BTreeMap::new();
        fields.insert(field.to_string(), value.to_string());
        self.hash_set_many(key, &fields)
    }

    fn hash_set_many(&self, key: &str, fields: &BTreeMap<String, String>) -> StoreResult<()> {
        debug!("HSET {} ({} fields)", key, fields.len());
        self.update(key, |current| Ok((merge_hash_fields(key, current, fields)?, ())))
    }

    fn hash_get_all(&self, key: &str) -> StoreResult<BTreeMap<String, String>> {
        expect_hash(key, self.read_value(key)?)
    }

    fn set_add(&self, key: &str, member: &str) -> StoreResult<bool> {
        debug!("SADD {} {}", key, member);
        self.update(key, |current| add_set_member(key, current, member))
    }

    fn set_members(&self, key: &str) -> StoreResult<BTreeSet<String>> {
        expect_set(key, self.read_value(key)?)
    }

    fn exists(&self, key: &str) -> StoreResult<bool> {
        let txn = self.env.begin_ro_txn()?;
        let found = match txn.get(self.db, &key) {
            Ok(_) => true,
            Err(lmdb::Error::NotFound) => false,
            Err(e) => return Err(e.into()),
        };
        txn.commit()?;
        Ok(found)
    }

    fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut txn = self.env.begin_rw_txn()?;
        let removed = match txn.del(self.db, &key, None) {
            Ok(()) => true,
            Err(lmdb::Error::NotFound) => false,
            Err(e) => return Err(e.into()),
        };
        txn.commit()?;
        debug!("DEL {} (existed: {})", key, removed);
        Ok(removed)
    }

    fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let txn = self.env.begin_ro_txn()?;
        let wanted = prefix.as_bytes();
        let mut keys = Vec::new();
        {
            let mut cursor = txn.open_ro_cursor(self.db)?;

            // LMDB rejects empty keys for MDB_SET_RANGE; an unpositioned
            // cursor already starts at the first key.
            let positioned = if wanted.is_empty() {
                true
            } else {
                match cursor.get(Some(wanted), None, MDB_SET_RANGE) {
                    Ok((Some(key), _)) if key.starts_with(wanted) => {
                        push_utf8_key(&mut keys, key);
                        true
                    }
                    Ok(_) | Err(lmdb::Error::NotFound) => false,
                    Err(e) => return Err(e.into()),
                }
            };

            if positioned {
                for (key, _) in cursor.iter().take_while(|(key, _)| key.starts_with(wanted)) {
                    push_utf8_key(&mut keys, key);
                }
            }
        }
        txn.commit()?;
        Ok(keys)
    }
}

fn push_utf8_key(keys: &mut Vec<String>, key: &[u8]) {
    match std::str::from_utf8(key) {
        Ok(key) => keys.push(key.to_string()),
        Err(e) => warn!("Skipping non UTF-8 key: {e}"),
    }
}

/// Database handle owned by FFI callers.
pub struct AppDbState {
    name: String,
    service: PlanService<LmdbBackend, QueuedEventSink>,
}

impl AppDbState {
    pub fn init(name: String) -> StoreResult<Self> {
        Self::init_with_config(name, StoreConfig::default())
    }

    pub fn init_with_config(name: String, config: StoreConfig) -> StoreResult<Self> {
        let backend = LmdbBackend::open(&name)?;
        let store = PlanStore::with_config(backend, config);
        let service = PlanService::new(store, QueuedEventSink::new());
        Ok(Self { name, service })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn service(&self) -> &PlanService<LmdbBackend, QueuedEventSink> {
        &self.service
    }

    pub fn clear_all_records(&self) -> StoreResult<usize> {
        self.service.store().backend().clear_all_records()
    }

    /// Empties the current database and switches the handle to `name`.
    ///
    /// When `name` differs from the current one, the old environment is
    /// closed and its directory removed.
    pub fn reset_database(&mut self, name: &str) -> StoreResult<()> {
        self.clear_all_records()?;
        if name == self.name {
            info!("Database '{}' reset in place", name);
            return Ok(());
        }

        let config = self.service.store().config().clone();
        let replacement = AppDbState::init_with_config(name.to_string(), config)?;
        let previous = std::mem::replace(self, replacement);
        let old_path = previous.service.store().backend().path().to_path_buf();
        drop(previous);

        if let Err(e) = std::fs::remove_dir_all(&old_path) {
            warn!("Could not remove {}: {e}", old_path.display());
        }
        info!("Database reset from {} to '{}'", old_path.display(), name);
        Ok(())
    }

    pub fn close_database(&mut self) -> StoreResult<()> {
        self.service.store().backend().close_database()
    }
}
