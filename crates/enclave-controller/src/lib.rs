//! enclave-controller — reconciliation core for runtime rollouts.
//!
//! Turns a single `RolloutRequest` into a bounded set of node-selecting
//! side-effect objects and an eventually-consistent progress record,
//! re-driven to convergence on every invocation. The reconciler keeps no
//! state between invocations beyond what it persists; phase is derived from
//! the status counters, never stored.
//!
//! # Components
//!
//! - **`selector`** — effective node-selector resolution (configured or
//!   built-in worker default)
//! - **`progress`** — target-count pinning, membership-guarded folding of
//!   labeled nodes, finalization
//! - **`resources`** — pure builders for the installer workload and the
//!   per-variant runtime classes
//! - **`reconciler`** — the state machine: one pass per invocation, requeue
//!   signals instead of blocking
//! - **`runner`** — async drive loop turning requeue signals into delayed
//!   re-invocations

pub mod error;
pub mod progress;
pub mod reconciler;
pub mod resources;
pub mod runner;
pub mod selector;

pub use error::{ReconcileError, ReconcileResult};
pub use reconciler::{
    phase_of, Phase, Reconcile, RolloutController, DEFAULT_ERROR_BACKOFF,
    MONITOR_POLL_INTERVAL, PRECONDITION_RETRY,
};
pub use runner::RunnerHandle;
pub use selector::SelectorDefaults;
