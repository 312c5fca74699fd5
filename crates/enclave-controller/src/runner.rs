//! Reconcile runner — turns requeue signals into re-invocations.
//!
//! A single consumer task drains a work queue of rollout names and runs one
//! reconcile pass per item, so passes for the same rollout never overlap.
//! `Requeue` feeds the name straight back into the queue; `RequeueAfter` and
//! error retries re-enqueue through a spawned sleep.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::reconciler::{Reconcile, RolloutController, DEFAULT_ERROR_BACKOFF};

/// Handle for enqueueing rollouts into a running reconcile loop.
#[derive(Clone)]
pub struct RunnerHandle {
    tx: mpsc::UnboundedSender<String>,
}

impl RunnerHandle {
    /// Queue a rollout for reconciliation. A no-op once the runner stopped.
    pub fn enqueue(&self, name: &str) {
        let _ = self.tx.send(name.to_string());
    }
}

/// Spawn the reconcile loop.
///
/// Returns the enqueue handle and the join handle of the loop task. The
/// loop exits when the shutdown signal flips or every sender is dropped.
pub fn spawn(
    controller: RolloutController,
    shutdown: watch::Receiver<bool>,
) -> (RunnerHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = RunnerHandle { tx: tx.clone() };
    let task = tokio::spawn(run_loop(Arc::new(controller), tx, rx, shutdown));
    (handle, task)
}

async fn run_loop(
    controller: Arc<RolloutController>,
    tx: mpsc::UnboundedSender<String>,
    mut rx: mpsc::UnboundedReceiver<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("reconcile runner starting");
    loop {
        tokio::select! {
            maybe = rx.recv() => {
                let Some(name) = maybe else { break };
                match controller.reconcile(&name) {
                    Ok(Reconcile::Done) => {
                        debug!(rollout = %name, "reconciled, no requeue");
                    }
                    Ok(Reconcile::Requeue) => {
                        let _ = tx.send(name);
                    }
                    Ok(Reconcile::RequeueAfter(delay)) => {
                        debug!(rollout = %name, ?delay, "requeue scheduled");
                        requeue_after(tx.clone(), name, delay);
                    }
                    Err(e) => {
                        let delay = e.retry_after().unwrap_or(DEFAULT_ERROR_BACKOFF);
                        warn!(rollout = %name, error = %e, ?delay, "reconcile failed, will retry");
                        requeue_after(tx.clone(), name, delay);
                    }
                }
            }
            _ = shutdown.changed() => {
                debug!("reconcile runner shutting down");
                break;
            }
        }
    }
}

/// Re-enqueue a rollout after a delay without blocking the loop.
fn requeue_after(tx: mpsc::UnboundedSender<String>, name: String, delay: std::time::Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = tx.send(name);
    });
}
