//! Reconciliation engine — drives a rollout to convergence.
//!
//! One invocation performs one pass: fetch the rollout, derive its phase
//! from the status counters, apply whatever side effects that phase
//! requires, persist the updated status, and report whether the caller
//! should re-invoke. The engine holds no state between passes and may be
//! re-entered at any point, any number of times.
//!
//! # Invariants
//!
//! - Side effects are applied with get-or-create semantics, never upsert
//! - Progress is monotonic: a node never leaves `completed`
//! - Status writes are conditional on the revision read at the top of the
//!   pass; a conflict aborts the pass and the retry starts from scratch

use std::time::Duration;

use tracing::{debug, info};

use enclave_state::{
    OwnerRef, RolloutStatus, StateError, StateStore, StoredRollout, WorkloadOperation,
};

use crate::error::{ReconcileError, ReconcileResult};
use crate::progress;
use crate::resources;
use crate::selector::{effective_selector, SelectorDefaults};

/// Fixed recheck delay for unmet business preconditions (no eligible nodes,
/// missing source image).
pub const PRECONDITION_RETRY: Duration = Duration::from_secs(15);

/// Delay between monitoring passes while nodes are still reporting.
pub const MONITOR_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Default backoff applied by the runner to transient failures.
pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Re-invocation signal returned by a reconcile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconcile {
    /// Steady state (or nothing to do); no re-invocation scheduled.
    Done,
    /// Re-invoke as soon as possible.
    Requeue,
    /// Re-invoke after the given delay.
    RequeueAfter(Duration),
}

/// Rollout phase, derived from the status counters. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Target count not yet pinned.
    Uninitialized,
    /// Installation driven and monitored until every node reports.
    Deploying,
    /// Every targeted node finalized and the runtime exposed.
    Steady,
}

/// Derive the phase of a rollout from its status counters alone.
pub fn phase_of(status: &RolloutStatus) -> Phase {
    if status.target_node_count == 0 {
        Phase::Uninitialized
    } else if status.completed.count != status.target_node_count {
        Phase::Deploying
    } else {
        Phase::Steady
    }
}

/// The reconciliation engine for rollout requests.
///
/// Reads desired and observed state from the [`StateStore`], applies side
/// effects, and persists progress. One pass per [`reconcile`] call;
/// re-invocation is expressed through the returned [`Reconcile`] signal.
///
/// [`reconcile`]: RolloutController::reconcile
pub struct RolloutController {
    state: StateStore,
    defaults: SelectorDefaults,
}

impl RolloutController {
    /// Create a controller over the given store.
    pub fn new(state: StateStore) -> Self {
        Self {
            state,
            defaults: SelectorDefaults::default(),
        }
    }

    /// Override the built-in worker selector default.
    pub fn with_selector_defaults(mut self, defaults: SelectorDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Run one reconcile pass for the named rollout.
    pub fn reconcile(&self, name: &str) -> ReconcileResult<Reconcile> {
        let Some(mut stored) = self.state.get_rollout(name)? else {
            // Deleted after the reconcile was requested; owned objects are
            // garbage collected with the request.
            debug!(rollout = %name, "rollout not found, nothing to do");
            return Ok(Reconcile::Done);
        };

        if stored.request.deleted {
            debug!(rollout = %name, "deletion marker set, skipping");
            return Ok(Reconcile::Done);
        }

        if stored.status.target_node_count == 0 {
            self.initialize(&mut stored)?;
        }

        if phase_of(&stored.status) == Phase::Steady {
            debug!(rollout = %name, "rollout steady, nothing to reconcile");
            return Ok(Reconcile::Done);
        }

        self.ensure_install_workload(&stored)?;
        self.monitor(&mut stored)
    }

    /// Pin the target node count and the resolved image.
    ///
    /// Runs exactly once per rollout: the selector is re-read every pass,
    /// but the count is snapshotted here and never re-derived.
    fn initialize(&self, stored: &mut StoredRollout) -> ReconcileResult<()> {
        let selector = effective_selector(stored.request.node_selector.as_ref(), &self.defaults);
        let nodes = self.state.list_nodes_matching(&selector)?;

        if nodes.is_empty() {
            // Leave the target unpinned so a later labeling is picked up.
            return Err(ReconcileError::NoEligibleNodes { selector });
        }
        if stored.request.source_image.is_empty() {
            return Err(ReconcileError::SourceImageUnset);
        }

        stored.status.target_node_count = nodes.len() as u32;
        if stored.status.resolved_image.is_empty() {
            stored.status.resolved_image = stored.request.source_image.clone();
        }
        stored.revision = self.state.update_rollout_status(
            &stored.request.name,
            &stored.status,
            stored.revision,
        )?;

        info!(
            rollout = %stored.request.name,
            target_nodes = stored.status.target_node_count,
            image = %stored.status.resolved_image,
            "rollout initialized"
        );
        Ok(())
    }

    /// Get-or-create the installer workload.
    ///
    /// An existing workload is left untouched, so external edits are never
    /// overwritten mid-rollout.
    fn ensure_install_workload(&self, stored: &StoredRollout) -> ReconcileResult<()> {
        let selector = effective_selector(stored.request.node_selector.as_ref(), &self.defaults);
        let workload = resources::install_workload(
            WorkloadOperation::Install,
            &stored.status.resolved_image,
            &selector,
            OwnerRef::rollout(&stored.request.name),
        );

        if self.state.get_workload(&workload.table_key())?.is_some() {
            return Ok(());
        }
        match self.state.create_workload(&workload) {
            Ok(()) => {
                info!(
                    rollout = %stored.request.name,
                    workload = %workload.table_key(),
                    "created installer workload"
                );
                Ok(())
            }
            // Raced with another pass; the object exists, which is all we need.
            Err(StateError::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Fold newly labeled nodes into progress, or finalize and expose once
    /// every targeted node has reported.
    fn monitor(&self, stored: &mut StoredRollout) -> ReconcileResult<Reconcile> {
        if progress::all_reported(&stored.status) {
            self.expose_runtime_classes(stored)?;
            progress::finalize(&mut stored.status);
            stored.revision = self.state.update_rollout_status(
                &stored.request.name,
                &stored.status,
                stored.revision,
            )?;
            info!(
                rollout = %stored.request.name,
                nodes = stored.status.completed.count,
                runtime_classes = %stored.status.exposed_runtime_names,
                "rollout complete, runtime exposed"
            );
            return Ok(Reconcile::Done);
        }

        let selector = effective_selector(stored.request.node_selector.as_ref(), &self.defaults);
        let nodes = self.state.list_nodes_matching(&selector)?;
        let folded = progress::fold_observed(&mut stored.status, &nodes);

        if folded > 0 {
            stored.revision = self.state.update_rollout_status(
                &stored.request.name,
                &stored.status,
                stored.revision,
            )?;
            info!(
                rollout = %stored.request.name,
                folded,
                in_progress = stored.status.in_progress.count,
                target = stored.status.target_node_count,
                "nodes reported installation success"
            );
        }

        if progress::all_reported(&stored.status) {
            // Finalization happens on the next pass; run it promptly.
            Ok(Reconcile::Requeue)
        } else {
            Ok(Reconcile::RequeueAfter(MONITOR_POLL_INTERVAL))
        }
    }

    /// Get-or-create one exposure object per runtime variant, then record
    /// the exposed names in the status.
    fn expose_runtime_classes(&self, stored: &mut StoredRollout) -> ReconcileResult<()> {
        let selector = effective_selector(stored.request.node_selector.as_ref(), &self.defaults);
        for variant in resources::RUNTIME_VARIANTS {
            if self.state.get_runtime_class(variant)?.is_some() {
                continue;
            }
            let class = resources::runtime_class(
                variant,
                Some(&selector),
                OwnerRef::rollout(&stored.request.name),
            );
            match self.state.create_runtime_class(&class) {
                Ok(()) => info!(rollout = %stored.request.name, %variant, "created runtime class"),
                Err(StateError::AlreadyExists(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        stored.status.exposed_runtime_names = resources::exposed_variant_names();
        Ok(())
    }
}
