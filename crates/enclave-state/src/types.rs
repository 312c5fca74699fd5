//! Domain types for the Enclave state store.
//!
//! These types represent the persisted state of rollout requests, cluster
//! nodes, and the side-effect objects a rollout creates. All types are
//! serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unique identifier for a rollout request.
pub type RolloutName = String;

/// Unique identifier for a node in the cluster.
pub type NodeName = String;

/// Owner kind recorded on side-effect objects created by a rollout.
pub const ROLLOUT_OWNER_KIND: &str = "RolloutRequest";

// ── Rollout ───────────────────────────────────────────────────────

/// Desired state for a runtime rollout across a subset of cluster nodes.
///
/// Written by the operator, never by the reconciler (which owns only the
/// status side of the record).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RolloutRequest {
    pub name: RolloutName,
    /// Nodes matching ALL pairs are in scope. `None` selects the built-in
    /// worker set.
    pub node_selector: Option<BTreeMap<String, String>>,
    /// Image reference for the runtime payload. Empty means unset.
    pub source_image: String,
    /// Deletion marker. The reconciler treats a marked rollout as a no-op;
    /// cleanup is delegated to the owner cascade.
    pub deleted: bool,
    /// Unix timestamp (seconds) when this request was created.
    pub created_at: u64,
}

/// An ordered node-name list with a cached count.
///
/// The wire representation is a list, not a set; `insert` keeps the list
/// sorted and membership-checked so it behaves as a set with deterministic
/// serialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeSetStatus {
    pub count: u32,
    pub nodes: Vec<NodeName>,
}

impl NodeSetStatus {
    /// Whether the given node name is present.
    pub fn contains(&self, name: &str) -> bool {
        self.nodes.binary_search_by(|n| n.as_str().cmp(name)).is_ok()
    }

    /// Insert a node name, preserving sorted order.
    ///
    /// Returns false (and leaves the list untouched) if the name is already
    /// present.
    pub fn insert(&mut self, name: &str) -> bool {
        match self.nodes.binary_search_by(|n| n.as_str().cmp(name)) {
            Ok(_) => false,
            Err(idx) => {
                self.nodes.insert(idx, name.to_string());
                self.count = self.nodes.len() as u32;
                true
            }
        }
    }

    /// Remove every node name, resetting the count to zero.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.count = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Progress record for a rollout, derived and mutated only by the
/// reconciler.
///
/// There is no explicit "done" flag: terminal state is implied by
/// `completed.count == target_node_count` with a non-empty
/// `exposed_runtime_names`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RolloutStatus {
    /// Number of nodes targeted by the rollout, pinned at the first
    /// successful reconcile. 0 means "not yet computed".
    pub target_node_count: u32,
    /// Image reference actually in use, pinned once non-empty.
    pub resolved_image: String,
    /// Nodes observed to have completed installation, not yet finalized.
    pub in_progress: NodeSetStatus,
    /// Nodes whose installation is finalized.
    pub completed: NodeSetStatus,
    /// Comma-joined runtime variant names exposed to the scheduler, set once
    /// at finalization.
    pub exposed_runtime_names: String,
}

/// A rollout record as stored: request, status, and the revision token used
/// for conditional status updates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredRollout {
    pub request: RolloutRequest,
    pub status: RolloutStatus,
    /// Bumped on every write to this record. A status update with a stale
    /// revision fails with `StateError::Conflict`.
    pub revision: u64,
}

// ── Node ──────────────────────────────────────────────────────────

/// A node in the cluster. Read-only to the reconciler; labels are written
/// by the node agent and the external installer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeRecord {
    pub name: NodeName,
    pub labels: BTreeMap<String, String>,
    /// Unix timestamp (seconds) when this node was registered.
    pub registered_at: u64,
}

impl NodeRecord {
    /// Whether this node matches every pair of the given selector.
    pub fn matches_labels(&self, selector: &BTreeMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.labels.get(k) == Some(v))
    }
}

// ── Side-effect objects ───────────────────────────────────────────

/// Link from a side-effect object back to the rollout that created it.
///
/// Deleting the owner cascades to every object carrying its ref.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OwnerRef {
    pub kind: String,
    pub name: String,
}

impl OwnerRef {
    /// Owner ref pointing at a rollout request.
    pub fn rollout(name: &str) -> Self {
        Self {
            kind: ROLLOUT_OWNER_KIND.to_string(),
            name: name.to_string(),
        }
    }

    /// Whether this ref points at the named rollout.
    pub fn is_rollout(&self, name: &str) -> bool {
        self.kind == ROLLOUT_OWNER_KIND && self.name == name
    }
}

/// Operation the installer workload performs on each node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadOperation {
    Install,
    Uninstall,
    Upgrade,
}

impl WorkloadOperation {
    /// The script argument for this operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Uninstall => "uninstall",
            Self::Upgrade => "upgrade",
        }
    }
}

impl std::fmt::Display for WorkloadOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A host path mounted read-write into the installer container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostMount {
    pub name: String,
    pub host_path: String,
    pub mount_path: String,
    /// Create the host directory if it does not exist.
    pub create_if_missing: bool,
}

/// An environment variable injected into the installer container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvVar {
    pub name: String,
    pub value: EnvValue,
}

/// Source of an environment variable's value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum EnvValue {
    /// A literal string.
    Literal { value: String },
    /// The name of the node the container is running on, filled in by the
    /// node agent.
    NodeName,
}

/// Declarative description of the install/uninstall workload: one privileged
/// container per selected node, running the deploy script.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeWorkload {
    pub name: String,
    pub namespace: String,
    pub operation: WorkloadOperation,
    pub image: String,
    /// Nodes the workload is scheduled onto.
    pub node_selector: BTreeMap<String, String>,
    pub service_account: String,
    pub command: Vec<String>,
    /// Invoked on graceful termination of the container.
    pub pre_stop_command: Vec<String>,
    pub privileged: bool,
    pub run_as_user: u32,
    pub env: Vec<EnvVar>,
    pub host_mounts: Vec<HostMount>,
    /// Rolling update: at most this many nodes unavailable at a time.
    pub max_unavailable: u32,
    pub owner: Option<OwnerRef>,
}

impl NodeWorkload {
    /// Build the composite key for the workloads table.
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Scheduler-exposure object for one runtime variant. The handler name
/// equals the variant identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeClass {
    pub name: String,
    pub handler: String,
    /// Restricts scheduling of workloads using this class to matching nodes.
    pub node_selector: Option<BTreeMap<String, String>>,
    pub owner: Option<OwnerRef>,
}

impl RuntimeClass {
    /// Build the key for the runtime classes table.
    pub fn table_key(&self) -> String {
        self.name.clone()
    }
}
