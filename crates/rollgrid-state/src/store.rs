//! StateStore — redb-backed object persistence for rollgrid.
//!
//! Provides typed CRUD operations over rollouts, revisions, and workloads.
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).
//!
//! Read-modify-write helpers run the read and the write inside one write
//! transaction. redb serializes write transactions, so these double as
//! compare-and-set primitives.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        txn.open_table(REVISIONS).map_err(map_err!(Table))?;
        txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic JSON access ────────────────────────────────────────

    fn put_json<T: Serialize>(&self, table: Table, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list_json<T: DeserializeOwned>(&self, table: Table) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let item: T = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(item);
        }
        Ok(results)
    }

    fn delete_key(&self, table: Table, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Read, mutate, and write back one value in a single write transaction.
    ///
    /// If `f` fails the transaction is dropped uncommitted.
    fn update_json<T, F>(&self, table: Table, key: &str, f: F) -> StateResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> StateResult<()>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let value = {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            let current = t
                .get(key)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec())
                .ok_or_else(|| StateError::NotFound(key.to_string()))?;
            let mut value: T =
                serde_json::from_slice(&current).map_err(map_err!(Deserialize))?;
            f(&mut value)?;
            let bytes = serde_json::to_vec(&value).map_err(map_err!(Serialize))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
            value
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(value)
    }

    // ── Rollouts ───────────────────────────────────────────────────

    /// Insert a rollout or replace its spec. The status is preserved and
    /// the version token bumped.
    pub fn put_rollout(&self, spec: &RolloutSpec) -> StateResult<RolloutRecord> {
        let key = spec.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let record = {
            let mut t = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            let existing = t
                .get(key.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());
            let record = match existing {
                Some(bytes) => {
                    let mut record: RolloutRecord =
                        serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?;
                    let created_at = record.spec.created_at;
                    record.spec = spec.clone();
                    record.spec.created_at = created_at;
                    record.version += 1;
                    record
                }
                None => RolloutRecord {
                    spec: spec.clone(),
                    status: RolloutStatus::default(),
                    version: 1,
                },
            };
            let bytes = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            t.insert(key.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
            record
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, version = record.version, "rollout stored");
        Ok(record)
    }

    /// Get a rollout by namespace/name key.
    pub fn get_rollout(&self, key: &str) -> StateResult<Option<RolloutRecord>> {
        self.get_json(ROLLOUTS, key)
    }

    /// List all rollouts.
    pub fn list_rollouts(&self) -> StateResult<Vec<RolloutRecord>> {
        self.list_json(ROLLOUTS)
    }

    /// Delete a rollout by key. Returns true if it existed.
    pub fn delete_rollout(&self, key: &str) -> StateResult<bool> {
        let existed = self.delete_key(ROLLOUTS, key)?;
        debug!(%key, existed, "rollout deleted");
        Ok(existed)
    }

    /// Delete a rollout if its version still equals `expected_version`.
    ///
    /// Returns `false` if the record is already gone.
    pub fn remove_rollout(&self, key: &str, expected_version: u64) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            let Some(bytes) = t
                .get(key)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec())
            else {
                return Ok(false);
            };
            let record: RolloutRecord =
                serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?;
            if record.version != expected_version {
                return Err(StateError::VersionConflict {
                    key: key.to_string(),
                    expected: expected_version,
                    found: record.version,
                });
            }
            t.remove(key).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, version = expected_version, "rollout removed");
        Ok(true)
    }

    /// Apply a user edit to a rollout's spec (e.g. pause, move the partition).
    pub fn update_rollout_spec<F>(&self, key: &str, f: F) -> StateResult<RolloutRecord>
    where
        F: FnOnce(&mut RolloutSpec),
    {
        self.update_json(ROLLOUTS, key, |record: &mut RolloutRecord| {
            f(&mut record.spec);
            record.version += 1;
            Ok(())
        })
    }

    /// Replace a rollout's status if its version still equals
    /// `expected_version`. Returns the new version.
    pub fn update_rollout_status(
        &self,
        key: &str,
        status: &RolloutStatus,
        expected_version: u64,
    ) -> StateResult<u64> {
        let record = self.update_json(ROLLOUTS, key, |record: &mut RolloutRecord| {
            if record.version != expected_version {
                return Err(StateError::VersionConflict {
                    key: key.to_string(),
                    expected: expected_version,
                    found: record.version,
                });
            }
            record.status = status.clone();
            record.version += 1;
            Ok(())
        })?;
        debug!(%key, version = record.version, "rollout status stored");
        Ok(record.version)
    }

    // ── Revisions ──────────────────────────────────────────────────

    /// Insert or update a revision.
    pub fn put_revision(&self, revision: &Revision) -> StateResult<()> {
        let key = revision.table_key();
        self.put_json(REVISIONS, &key, revision)?;
        debug!(%key, "revision stored");
        Ok(())
    }

    /// Get a revision by namespace/name key.
    pub fn get_revision(&self, key: &str) -> StateResult<Option<Revision>> {
        self.get_json(REVISIONS, key)
    }

    /// List all revisions.
    pub fn list_revisions(&self) -> StateResult<Vec<Revision>> {
        self.list_json(REVISIONS)
    }

    /// Delete a revision by key. Returns true if it existed.
    pub fn delete_revision(&self, key: &str) -> StateResult<bool> {
        self.delete_key(REVISIONS, key)
    }

    /// Read-modify-write a revision.
    pub fn update_revision<F>(&self, key: &str, f: F) -> StateResult<Revision>
    where
        F: FnOnce(&mut Revision) -> StateResult<()>,
    {
        self.update_json(REVISIONS, key, f)
    }

    // ── Workloads ──────────────────────────────────────────────────

    /// Insert or update a workload.
    pub fn put_workload(&self, workload: &Workload) -> StateResult<()> {
        let key = workload.table_key();
        self.put_json(WORKLOADS, &key, workload)?;
        debug!(%key, "workload stored");
        Ok(())
    }

    /// Get a workload by namespace/name key.
    pub fn get_workload(&self, key: &str) -> StateResult<Option<Workload>> {
        self.get_json(WORKLOADS, key)
    }

    /// List all workloads.
    pub fn list_workloads(&self) -> StateResult<Vec<Workload>> {
        self.list_json(WORKLOADS)
    }

    /// Delete a workload by key. Returns true if it existed.
    pub fn delete_workload(&self, key: &str) -> StateResult<bool> {
        self.delete_key(WORKLOADS, key)
    }

    /// Read-modify-write a workload. `f` sees the freshly read value and
    /// may reject the write with an error.
    pub fn update_workload<F>(&self, key: &str, f: F) -> StateResult<Workload>
    where
        F: FnOnce(&mut Workload) -> StateResult<()>,
    {
        self.update_json(WORKLOADS, key, f)
    }
}
