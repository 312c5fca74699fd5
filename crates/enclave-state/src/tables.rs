//! redb table definitions for the Enclave state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Workloads are keyed `{namespace}/{name}`; everything else is
//! keyed by its bare name.

use redb::TableDefinition;

/// Rollout records (request + status + revision) keyed by rollout name.
pub const ROLLOUTS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollouts");

/// Node records keyed by node name.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Installer workloads keyed by `{namespace}/{name}`.
pub const WORKLOADS: TableDefinition<&str, &[u8]> = TableDefinition::new("workloads");

/// Runtime classes keyed by class name.
pub const RUNTIME_CLASSES: TableDefinition<&str, &[u8]> = TableDefinition::new("runtime_classes");
