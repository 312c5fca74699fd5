//! Side-effect resource construction.
//!
//! Pure builders: the installer workload and the runtime classes are
//! functions of the rollout's parameters alone, so re-building them on every
//! pass is free and the engine can apply them with get-or-create semantics.

use std::collections::BTreeMap;

use enclave_state::{
    EnvValue, EnvVar, HostMount, NodeWorkload, OwnerRef, RuntimeClass, WorkloadOperation,
};

/// Namespace the operator's side-effect objects live in.
pub const OPERATOR_NAMESPACE: &str = "enclave-system";

/// Service account the installer workload runs under.
pub const SERVICE_ACCOUNT: &str = "enclave-operator";

/// Installer workload names are `{prefix}-{operation}`.
pub const WORKLOAD_NAME_PREFIX: &str = "enclave-installer";

/// Script executed on each node, with the operation name as its argument.
pub const DEPLOY_SCRIPT: &str = "/opt/enclave/scripts/enclave-deploy.sh";

/// The fixed, versioned set of runtime variants exposed to the scheduler.
/// Each entry is both the exposure object's name and its handler.
pub const RUNTIME_VARIANTS: [&str; 5] = [
    "enclave-qemu-virtiofs",
    "enclave-qemu",
    "enclave-clh",
    "enclave-fc",
    "enclave",
];

/// Comma-joined variant names, recorded in the rollout status at exposure.
pub fn exposed_variant_names() -> String {
    RUNTIME_VARIANTS.join(",")
}

/// Build the installer workload for one operation kind.
///
/// The workload runs a privileged root container per selected node that
/// executes the deploy script; graceful termination invokes the same script
/// with `cleanup`. Rolling update, one node unavailable at a time.
pub fn install_workload(
    operation: WorkloadOperation,
    image: &str,
    node_selector: &BTreeMap<String, String>,
    owner: OwnerRef,
) -> NodeWorkload {
    NodeWorkload {
        name: format!("{WORKLOAD_NAME_PREFIX}-{operation}"),
        namespace: OPERATOR_NAMESPACE.to_string(),
        operation,
        image: image.to_string(),
        node_selector: node_selector.clone(),
        service_account: SERVICE_ACCOUNT.to_string(),
        command: vec![
            "bash".to_string(),
            "-c".to_string(),
            format!("{DEPLOY_SCRIPT} {operation}"),
        ],
        pre_stop_command: vec![
            "bash".to_string(),
            "-c".to_string(),
            format!("{DEPLOY_SCRIPT} cleanup"),
        ],
        privileged: true,
        run_as_user: 0,
        env: vec![EnvVar {
            name: "NODE_NAME".to_string(),
            value: EnvValue::NodeName,
        }],
        host_mounts: host_mounts(),
        max_unavailable: 1,
        owner: Some(owner),
    }
}

/// Build the exposure object for one runtime variant.
///
/// The handler name equals the variant identifier; when a node selector is
/// given, the scheduler only routes matching workloads to selected nodes.
pub fn runtime_class(
    variant: &str,
    node_selector: Option<&BTreeMap<String, String>>,
    owner: OwnerRef,
) -> RuntimeClass {
    RuntimeClass {
        name: variant.to_string(),
        handler: variant.to_string(),
        node_selector: node_selector.cloned(),
        owner: Some(owner),
    }
}

/// The fixed host paths the installer needs read-write on each node:
/// container-runtime config, the artifact directory, init-system control
/// paths, and the binary install target.
fn host_mounts() -> Vec<HostMount> {
    [
        ("crio-conf", "/etc/crio/", "/etc/crio/", false),
        ("containerd-conf", "/etc/containerd/", "/etc/containerd/", false),
        ("enclave-artifacts", "/opt/enclave/", "/opt/enclave/", true),
        ("dbus", "/var/run/dbus", "/var/run/dbus", false),
        ("systemd", "/run/systemd", "/run/systemd", false),
        ("local-bin", "/usr/local/bin/", "/usr/local/bin/", false),
    ]
    .into_iter()
    .map(|(name, host_path, mount_path, create_if_missing)| HostMount {
        name: name.to_string(),
        host_path: host_path.to_string(),
        mount_path: mount_path.to_string(),
        create_if_missing,
    })
    .collect()
}
