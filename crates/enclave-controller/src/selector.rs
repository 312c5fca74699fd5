//! Effective node-selector resolution.
//!
//! A rollout may carry an explicit label selector; when it doesn't, the
//! built-in worker pair applies. The default is passed in explicitly so the
//! resolver stays a pure function.

use std::collections::BTreeMap;

/// Built-in label key marking worker nodes.
pub const DEFAULT_WORKER_LABEL_KEY: &str = "node-role.enclave.io/worker";

/// The selector applied when a rollout configures none.
#[derive(Debug, Clone)]
pub struct SelectorDefaults {
    pub worker_label_key: String,
    pub worker_label_value: String,
}

impl Default for SelectorDefaults {
    fn default() -> Self {
        Self {
            worker_label_key: DEFAULT_WORKER_LABEL_KEY.to_string(),
            worker_label_value: String::new(),
        }
    }
}

/// Resolve the effective selector: the configured map, or the built-in
/// worker pair when none is configured.
pub fn effective_selector(
    configured: Option<&BTreeMap<String, String>>,
    defaults: &SelectorDefaults,
) -> BTreeMap<String, String> {
    match configured {
        Some(selector) => selector.clone(),
        None => {
            let mut selector = BTreeMap::new();
            selector.insert(
                defaults.worker_label_key.clone(),
                defaults.worker_label_value.clone(),
            );
            selector
        }
    }
}
