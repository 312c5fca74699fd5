//! Rollout progress tracking.
//!
//! Progress is a pair of disjoint node sets persisted as ordered lists:
//! `in_progress` (nodes that have signaled installation success) and
//! `completed` (nodes finalized at exposure time). Folding is
//! membership-guarded so re-observing a labeled node never double-counts,
//! and every transition is strictly forward.

use enclave_state::{NodeRecord, RolloutStatus};
use tracing::debug;

/// Node label key signaling per-node installation success.
pub const SUCCESS_LABEL_KEY: &str = "enclave.io/runtime";

/// Expected value of the success label. Any other value means "not yet done".
pub const SUCCESS_LABEL_VALUE: &str = "true";

/// Whether the node carries the installer's success label.
pub fn node_reports_success(node: &NodeRecord) -> bool {
    node.labels.get(SUCCESS_LABEL_KEY).map(String::as_str) == Some(SUCCESS_LABEL_VALUE)
}

/// Fold newly labeled nodes into `in_progress`.
///
/// A node already present in `in_progress` or `completed` is skipped, so the
/// fold is idempotent and order-independent. Returns the number of nodes
/// newly appended.
pub fn fold_observed(status: &mut RolloutStatus, nodes: &[NodeRecord]) -> u32 {
    let mut folded = 0;
    for node in nodes {
        if status.in_progress.contains(&node.name) || status.completed.contains(&node.name) {
            continue;
        }
        if node_reports_success(node) {
            status.in_progress.insert(&node.name);
            folded += 1;
            debug!(node = %node.name, "node reported installation success");
        }
    }
    folded
}

/// Whether every targeted node has signaled success.
pub fn all_reported(status: &RolloutStatus) -> bool {
    status.target_node_count > 0 && status.in_progress.count == status.target_node_count
}

/// Move the entire `in_progress` set into `completed` and clear it.
///
/// Callers gate this on [`all_reported`]; exposure is only permitted after
/// finalization.
pub fn finalize(status: &mut RolloutStatus) {
    let nodes = std::mem::take(&mut status.in_progress.nodes);
    for node in &nodes {
        status.completed.insert(node);
    }
    status.in_progress.clear();
    debug!(completed = status.completed.count, "rollout progress finalized");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn labeled_node(name: &str) -> NodeRecord {
        let mut labels = BTreeMap::new();
        labels.insert(SUCCESS_LABEL_KEY.to_string(), SUCCESS_LABEL_VALUE.to_string());
        NodeRecord {
            name: name.to_string(),
            labels,
            registered_at: 1000,
        }
    }

    fn unlabeled_node(name: &str) -> NodeRecord {
        NodeRecord {
            name: name.to_string(),
            labels: BTreeMap::new(),
            registered_at: 1000,
        }
    }

    fn status_with_target(target: u32) -> RolloutStatus {
        RolloutStatus {
            target_node_count: target,
            ..Default::default()
        }
    }

    #[test]
    fn fold_appends_only_labeled_nodes() {
        let mut status = status_with_target(3);
        let nodes = vec![
            labeled_node("node-1"),
            unlabeled_node("node-2"),
            labeled_node("node-3"),
        ];

        let folded = fold_observed(&mut status, &nodes);
        assert_eq!(folded, 2);
        assert_eq!(status.in_progress.count, 2);
        assert!(status.in_progress.contains("node-1"));
        assert!(!status.in_progress.contains("node-2"));
        assert!(status.in_progress.contains("node-3"));
    }

    #[test]
    fn fold_never_double_counts() {
        let mut status = status_with_target(2);
        let nodes = vec![labeled_node("node-1")];

        assert_eq!(fold_observed(&mut status, &nodes), 1);
        // The node still carries the label on the next observation.
        assert_eq!(fold_observed(&mut status, &nodes), 0);
        assert_eq!(status.in_progress.count, 1);
    }

    #[test]
    fn fold_skips_completed_nodes() {
        let mut status = status_with_target(2);
        status.completed.insert("node-1");

        let folded = fold_observed(&mut status, &[labeled_node("node-1")]);
        assert_eq!(folded, 0);
        assert!(status.in_progress.is_empty());
    }

    #[test]
    fn fold_respects_wrong_label_value() {
        let mut status = status_with_target(1);
        let mut node = unlabeled_node("node-1");
        node.labels
            .insert(SUCCESS_LABEL_KEY.to_string(), "pending".to_string());

        assert_eq!(fold_observed(&mut status, &[node]), 0);
    }

    #[test]
    fn fold_is_order_independent() {
        let nodes = vec![
            labeled_node("node-c"),
            labeled_node("node-a"),
            labeled_node("node-b"),
        ];
        let mut forward = status_with_target(3);
        fold_observed(&mut forward, &nodes);

        let mut reversed_nodes = nodes.clone();
        reversed_nodes.reverse();
        let mut backward = status_with_target(3);
        fold_observed(&mut backward, &reversed_nodes);

        assert_eq!(forward.in_progress, backward.in_progress);
        assert_eq!(forward.in_progress.nodes, vec!["node-a", "node-b", "node-c"]);
    }

    #[test]
    fn all_reported_requires_pinned_target() {
        let status = RolloutStatus::default();
        assert!(!all_reported(&status));

        let mut status = status_with_target(2);
        status.in_progress.insert("node-1");
        assert!(!all_reported(&status));
        status.in_progress.insert("node-2");
        assert!(all_reported(&status));
    }

    #[test]
    fn finalize_moves_in_progress_to_completed() {
        let mut status = status_with_target(2);
        status.in_progress.insert("node-2");
        status.in_progress.insert("node-1");

        finalize(&mut status);

        assert!(status.in_progress.is_empty());
        assert_eq!(status.in_progress.count, 0);
        assert_eq!(status.completed.count, 2);
        assert_eq!(status.completed.nodes, vec!["node-1", "node-2"]);
    }

    #[test]
    fn progress_counts_never_exceed_target() {
        let mut status = status_with_target(2);
        let nodes = vec![
            labeled_node("node-1"),
            labeled_node("node-2"),
        ];

        // Fold repeatedly; the invariant holds at every step.
        for _ in 0..3 {
            fold_observed(&mut status, &nodes);
            assert!(
                status.in_progress.count + status.completed.count <= status.target_node_count
            );
        }

        finalize(&mut status);
        fold_observed(&mut status, &nodes);
        assert!(status.in_progress.count + status.completed.count <= status.target_node_count);
        assert_eq!(status.completed.count, 2);
    }
}
