//! StateStore — redb-backed state persistence for the Enclave operator.
//!
//! Provides typed operations over rollouts, nodes, installer workloads, and
//! runtime classes. All values are JSON-serialized into redb's `&[u8]` value
//! columns. The store supports both on-disk and in-memory backends (the
//! latter for testing).
//!
//! Rollout status writes are conditional: the caller passes the revision it
//! read, and a mismatch fails with `StateError::Conflict` instead of
//! clobbering a concurrent writer's update.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use std::collections::BTreeMap;
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
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
        txn.open_table(RUNTIME_CLASSES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Rollouts ───────────────────────────────────────────────────

    /// Create a rollout record with a zeroed status at revision 1.
    ///
    /// Fails with `AlreadyExists` if a rollout of the same name is present.
    pub fn create_rollout(&self, request: &RolloutRequest) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            if table
                .get(request.name.as_str())
                .map_err(map_err!(Read))?
                .is_some()
            {
                return Err(StateError::AlreadyExists(format!(
                    "rollout {}",
                    request.name
                )));
            }
            let stored = StoredRollout {
                request: request.clone(),
                status: RolloutStatus::default(),
                revision: 1,
            };
            let value = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
            table
                .insert(request.name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(name = %request.name, "rollout created");
        Ok(())
    }

    /// Get a rollout record (request + status + revision) by name.
    pub fn get_rollout(&self, name: &str) -> StateResult<Option<StoredRollout>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => {
                let stored: StoredRollout =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(stored))
            }
            None => Ok(None),
        }
    }

    /// List all rollout records.
    pub fn list_rollouts(&self) -> StateResult<Vec<StoredRollout>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let stored: StoredRollout =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(stored);
        }
        Ok(results)
    }

    /// Conditionally replace a rollout's status.
    ///
    /// The write only succeeds if the stored revision equals
    /// `expected_revision`; a mismatch fails with `Conflict` so the caller
    /// re-reads and retries from scratch. Returns the new revision.
    pub fn update_rollout_status(
        &self,
        name: &str,
        status: &RolloutStatus,
        expected_revision: u64,
    ) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let new_revision;
        {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            let mut stored: StoredRollout = match table.get(name).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StateError::NotFound(format!("rollout {name}"))),
            };
            if stored.revision != expected_revision {
                return Err(StateError::Conflict(format!(
                    "rollout {name}: expected revision {expected_revision}, found {}",
                    stored.revision
                )));
            }
            stored.status = status.clone();
            stored.revision = expected_revision + 1;
            new_revision = stored.revision;
            let value = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
            table
                .insert(name, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%name, revision = new_revision, "rollout status updated");
        Ok(new_revision)
    }

    /// Replace a rollout's request side, preserving its status.
    ///
    /// Request writes are user-owned and last-write-wins; only status writes
    /// are conditional. Returns the new revision.
    pub fn update_rollout_request(&self, request: &RolloutRequest) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let new_revision;
        {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            let mut stored: StoredRollout = match table
                .get(request.name.as_str())
                .map_err(map_err!(Read))?
            {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => {
                    return Err(StateError::NotFound(format!("rollout {}", request.name)));
                }
            };
            stored.request = request.clone();
            stored.revision += 1;
            new_revision = stored.revision;
            let value = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
            table
                .insert(request.name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(name = %request.name, revision = new_revision, "rollout request updated");
        Ok(new_revision)
    }

    /// Set the deletion marker on a rollout. Returns the new revision.
    pub fn mark_rollout_deleted(&self, name: &str) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let new_revision;
        {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            let mut stored: StoredRollout = match table.get(name).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StateError::NotFound(format!("rollout {name}"))),
            };
            stored.request.deleted = true;
            stored.revision += 1;
            new_revision = stored.revision;
            let value = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
            table
                .insert(name, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%name, "rollout marked deleted");
        Ok(new_revision)
    }

    /// Delete a rollout and cascade to every side-effect object that carries
    /// its owner ref. Returns true if the rollout existed.
    pub fn delete_rollout(&self, name: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        let mut cascaded = 0usize;
        {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            existed = table.remove(name).map_err(map_err!(Write))?.is_some();
        }
        if existed {
            {
                let mut table = txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
                let mut keys = Vec::new();
                for entry in table.iter().map_err(map_err!(Read))? {
                    let (key, value) = entry.map_err(map_err!(Read))?;
                    let workload: NodeWorkload =
                        serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                    if workload.owner.as_ref().is_some_and(|o| o.is_rollout(name)) {
                        keys.push(key.value().to_string());
                    }
                }
                for key in &keys {
                    table.remove(key.as_str()).map_err(map_err!(Write))?;
                }
                cascaded += keys.len();
            }
            {
                let mut table = txn.open_table(RUNTIME_CLASSES).map_err(map_err!(Table))?;
                let mut keys = Vec::new();
                for entry in table.iter().map_err(map_err!(Read))? {
                    let (key, value) = entry.map_err(map_err!(Read))?;
                    let class: RuntimeClass =
                        serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                    if class.owner.as_ref().is_some_and(|o| o.is_rollout(name)) {
                        keys.push(key.value().to_string());
                    }
                }
                for key in &keys {
                    table.remove(key.as_str()).map_err(map_err!(Write))?;
                }
                cascaded += keys.len();
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if existed {
            debug!(%name, cascaded, "rollout deleted with owned objects");
        }
        Ok(existed)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert or update a node record.
    pub fn put_node(&self, node: &NodeRecord) -> StateResult<()> {
        let value = serde_json::to_vec(node).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            table
                .insert(node.name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(name = %node.name, "node stored");
        Ok(())
    }

    /// Get a node record by name.
    pub fn get_node(&self, name: &str) -> StateResult<Option<NodeRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => {
                let node: NodeRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    /// List all node records.
    pub fn list_nodes(&self) -> StateResult<Vec<NodeRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let node: NodeRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(node);
        }
        Ok(results)
    }

    /// List the nodes matching every pair of the given label selector.
    pub fn list_nodes_matching(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> StateResult<Vec<NodeRecord>> {
        let nodes = self.list_nodes()?;
        Ok(nodes
            .into_iter()
            .filter(|n| n.matches_labels(selector))
            .collect())
    }

    /// Set a label on a node. Returns false if the node is unknown.
    pub fn label_node(&self, name: &str, key: &str, value: &str) -> StateResult<bool> {
        let node = self.get_node(name)?;
        match node {
            Some(mut n) => {
                n.labels.insert(key.to_string(), value.to_string());
                self.put_node(&n)?;
                debug!(%name, %key, %value, "node labeled");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ── Installer workloads ────────────────────────────────────────

    /// Create an installer workload.
    ///
    /// Fails with `AlreadyExists` if one is present under the same key; the
    /// existing object is never mutated.
    pub fn create_workload(&self, workload: &NodeWorkload) -> StateResult<()> {
        let key = workload.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
            if table.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists(format!("workload {key}")));
            }
            let value = serde_json::to_vec(workload).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, operation = %workload.operation, "workload created");
        Ok(())
    }

    /// Get an installer workload by `{namespace}/{name}` key.
    pub fn get_workload(&self, key: &str) -> StateResult<Option<NodeWorkload>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let workload: NodeWorkload =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(workload))
            }
            None => Ok(None),
        }
    }

    /// List all installer workloads.
    pub fn list_workloads(&self) -> StateResult<Vec<NodeWorkload>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let workload: NodeWorkload =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(workload);
        }
        Ok(results)
    }

    // ── Runtime classes ────────────────────────────────────────────

    /// Create a runtime class.
    ///
    /// Fails with `AlreadyExists` if one is present under the same name; the
    /// existing object is never mutated.
    pub fn create_runtime_class(&self, class: &RuntimeClass) -> StateResult<()> {
        let key = class.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(RUNTIME_CLASSES).map_err(map_err!(Table))?;
            if table.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists(format!("runtime class {key}")));
            }
            let value = serde_json::to_vec(class).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(name = %class.name, "runtime class created");
        Ok(())
    }

    /// Get a runtime class by name.
    pub fn get_runtime_class(&self, name: &str) -> StateResult<Option<RuntimeClass>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RUNTIME_CLASSES).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => {
                let class: RuntimeClass =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(class))
            }
            None => Ok(None),
        }
    }

    /// List all runtime classes.
    pub fn list_runtime_classes(&self) -> StateResult<Vec<RuntimeClass>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RUNTIME_CLASSES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let class: RuntimeClass =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(class);
        }
        Ok(results)
    }
}
