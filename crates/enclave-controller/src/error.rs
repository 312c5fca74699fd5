//! Error types for the reconciliation core.

use std::collections::BTreeMap;
use std::time::Duration;

use enclave_state::StateError;
use thiserror::Error;

use crate::reconciler::PRECONDITION_RETRY;

/// Result type alias for reconcile operations.
pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Errors that can abort a single reconcile pass.
///
/// Every error is retryable: store errors via the runner's default backoff,
/// unmet preconditions via their fixed recheck delay. The core has no notion
/// of permanent failure.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Store failure, including revision conflicts from concurrent writers.
    #[error(transparent)]
    Store(#[from] StateError),

    /// The effective selector matched no nodes; the rollout cannot proceed
    /// and must not silently succeed.
    #[error(
        "no eligible nodes match selector {selector:?}; label nodes to bring them into scope"
    )]
    NoEligibleNodes {
        selector: BTreeMap<String, String>,
    },

    /// The request has no source image to distribute.
    #[error("source image must be set before the runtime can be distributed")]
    SourceImageUnset,
}

impl ReconcileError {
    /// Fixed recheck delay for unmet business preconditions.
    ///
    /// `None` means the error is transient and retried with the runner's
    /// default backoff instead.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::NoEligibleNodes { .. } | Self::SourceImageUnset => Some(PRECONDITION_RETRY),
            Self::Store(_) => None,
        }
    }
}
