//! enclaved — the Enclave rollout daemon.
//!
//! Single binary that assembles the operator:
//! - State store (redb)
//! - Rollout reconciler + runner
//! - Operator tooling: apply manifests, register and label nodes, inspect
//!   status, delete rollouts
//!
//! The `node` subcommands stand in for the external cluster and installer
//! (the label writer), so a rollout can be driven end to end on one machine.
//!
//! # Usage
//!
//! ```text
//! enclaved apply --manifest rollout.toml
//! enclaved node add node-1 --label node-role.enclave.io/worker=
//! enclaved run
//! enclaved node label node-1 enclave.io/runtime true
//! enclaved status default
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::info;

use enclave_controller::{runner, RolloutController};
use enclave_state::{NodeRecord, RolloutRequest, StateStore};

#[derive(Parser)]
#[command(name = "enclaved", about = "Enclave runtime rollout daemon")]
struct Cli {
    /// Data directory for persistent state.
    #[arg(long, default_value = "/var/lib/enclave")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create or update a rollout from a TOML manifest.
    Apply {
        /// Path to the rollout manifest.
        #[arg(long)]
        manifest: PathBuf,
    },

    /// Node registry operations (stand-in for the external cluster).
    Node {
        #[command(subcommand)]
        command: NodeCommand,
    },

    /// Run the reconcile loop until interrupted.
    Run {
        /// Seconds between store scans for rollouts to reconcile.
        #[arg(long, default_value = "30")]
        scan_interval: u64,
    },

    /// Print a rollout's request and status as JSON.
    Status { name: String },

    /// Delete a rollout and every side-effect object it owns.
    Delete { name: String },
}

#[derive(Subcommand)]
enum NodeCommand {
    /// Register a node.
    Add {
        name: String,
        /// Labels as key=value; repeatable.
        #[arg(long = "label", value_parser = parse_label)]
        labels: Vec<(String, String)>,
    },

    /// Set a label on a registered node.
    Label {
        name: String,
        key: String,
        value: String,
    },
}

/// A rollout manifest as written by the operator.
#[derive(Debug, Deserialize)]
struct RolloutManifest {
    name: String,
    #[serde(default)]
    node_selector: Option<BTreeMap<String, String>>,
    #[serde(default)]
    source_image: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,enclaved=debug,enclave=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let store = open_store(&cli.data_dir)?;

    match cli.command {
        Command::Apply { manifest } => apply(&store, &manifest),
        Command::Node { command } => node(&store, command),
        Command::Run { scan_interval } => run(store, Duration::from_secs(scan_interval)).await,
        Command::Status { name } => status(&store, &name),
        Command::Delete { name } => delete(&store, &name),
    }
}

fn open_store(data_dir: &Path) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;
    let path = data_dir.join("state.redb");
    StateStore::open(&path).with_context(|| format!("opening state store {}", path.display()))
}

fn apply(store: &StateStore, manifest_path: &Path) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(manifest_path)
        .with_context(|| format!("reading manifest {}", manifest_path.display()))?;
    let manifest: RolloutManifest = toml::from_str(&raw).context("parsing rollout manifest")?;

    let request = RolloutRequest {
        name: manifest.name.clone(),
        node_selector: manifest.node_selector,
        source_image: manifest.source_image,
        deleted: false,
        created_at: epoch_secs(),
    };

    match store.get_rollout(&request.name)? {
        Some(existing) => {
            // Preserve the original creation time on update.
            let request = RolloutRequest {
                created_at: existing.request.created_at,
                ..request
            };
            store.update_rollout_request(&request)?;
            info!(name = %request.name, "rollout updated");
        }
        None => {
            store.create_rollout(&request)?;
            info!(name = %request.name, "rollout created");
        }
    }
    Ok(())
}

fn node(store: &StateStore, command: NodeCommand) -> anyhow::Result<()> {
    match command {
        NodeCommand::Add { name, labels } => {
            let record = NodeRecord {
                name: name.clone(),
                labels: labels.into_iter().collect(),
                registered_at: epoch_secs(),
            };
            store.put_node(&record)?;
            info!(%name, "node registered");
        }
        NodeCommand::Label { name, key, value } => {
            if !store.label_node(&name, &key, &value)? {
                bail!("node {name} is not registered");
            }
            info!(%name, %key, %value, "node labeled");
        }
    }
    Ok(())
}

async fn run(store: StateStore, scan_interval: Duration) -> anyhow::Result<()> {
    let controller = RolloutController::new(store.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (handle, task) = runner::spawn(controller, shutdown_rx);

    info!(scan_interval_secs = scan_interval.as_secs(), "enclaved running");

    loop {
        // Periodic scan: pick up rollouts created or edited while idle.
        for stored in store.list_rollouts()? {
            if !stored.request.deleted {
                handle.enqueue(&stored.request.name);
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(scan_interval) => {}
            result = tokio::signal::ctrl_c() => {
                result.context("listening for shutdown signal")?;
                break;
            }
        }
    }

    info!("shutting down");
    let _ = shutdown_tx.send(true);
    task.await.context("joining reconcile runner")?;
    Ok(())
}

fn status(store: &StateStore, name: &str) -> anyhow::Result<()> {
    let Some(stored) = store.get_rollout(name)? else {
        bail!("rollout {name} not found");
    };
    println!("{}", serde_json::to_string_pretty(&stored)?);
    Ok(())
}

fn delete(store: &StateStore, name: &str) -> anyhow::Result<()> {
    // Mark first so a concurrent reconcile pass stops touching the rollout,
    // then remove it along with everything it owns.
    store.mark_rollout_deleted(name)?;
    store.delete_rollout(name)?;
    info!(%name, "rollout deleted");
    Ok(())
}

/// Parse a `key=value` label argument. A bare `key=` sets an empty value.
fn parse_label(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("invalid label {raw:?}, expected key=value")),
    }
}

/// Current Unix epoch in seconds.
fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_label_values() {
        assert_eq!(
            parse_label("zone=a").unwrap(),
            ("zone".to_string(), "a".to_string())
        );
        assert_eq!(
            parse_label("node-role.enclave.io/worker=").unwrap(),
            ("node-role.enclave.io/worker".to_string(), String::new())
        );
        assert!(parse_label("no-equals").is_err());
        assert!(parse_label("=value").is_err());
    }

    #[test]
    fn manifest_parsing() {
        let manifest: RolloutManifest = toml::from_str(
            r#"
            name = "default"
            source_image = "registry.local/enclave:1.0"

            [node_selector]
            "zone" = "a"
            "#,
        )
        .unwrap();

        assert_eq!(manifest.name, "default");
        assert_eq!(manifest.source_image, "registry.local/enclave:1.0");
        assert_eq!(
            manifest
                .node_selector
                .unwrap()
                .get("zone")
                .map(String::as_str),
            Some("a")
        );
    }

    #[test]
    fn manifest_defaults_are_optional() {
        let manifest: RolloutManifest = toml::from_str(r#"name = "default""#).unwrap();
        assert!(manifest.node_selector.is_none());
        assert!(manifest.source_image.is_empty());
    }
}
