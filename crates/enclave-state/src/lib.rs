//! enclave-state — embedded state store for the Enclave rollout operator.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state management for rollout requests, cluster nodes, and the side-effect
//! objects a rollout creates (installer workloads and runtime classes).
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Rollout records carry a revision counter bumped on every write; status
//! updates are conditional on the caller's expected revision so concurrent
//! writers are detected (`StateError::Conflict`) rather than silently lost.
//!
//! Side-effect objects are created with create-if-absent semantics
//! (`StateError::AlreadyExists` signals "already satisfied") and carry an
//! owner link back to their rollout; deleting the rollout cascades to every
//! object it owns.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
