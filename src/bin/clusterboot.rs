//! clusterboot binary
//!
//! Runs one bootstrap pass for a node against a JSON membership file shared
//! by the cluster and prints the topology, startup gates and template
//! variables as JSON. Gates re-read the file on every poll; announcements and
//! self-registrations are written back to it.

use clusterboot::cluster::{FileDirectory, Role};
use clusterboot::config::BootstrapConfig;
use clusterboot::run::BootstrapRun;
use clusterboot::telemetry::Telemetry;

use clap::Parser;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// Resolve dependencies and render template variables for one node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cluster membership file (JSON), shared by every node
    #[arg(long, env = "CLUSTERBOOT_MEMBERSHIP")]
    membership: PathBuf,

    /// Name of the node being provisioned
    #[arg(long, env = "CLUSTERBOOT_NODE")]
    node: String,

    /// Wait for the prerequisites of every local role before assembling
    #[arg(long)]
    gate: bool,

    /// Announce the local roles' services as running after gating
    #[arg(long)]
    provide: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let telemetry =
        Telemetry::init_for_component("clusterboot", Some(args.node.as_str()), &args.log_level)?;

    let config = BootstrapConfig::from_env()?;
    let directory = Arc::new(FileDirectory::open(&args.membership).await?);

    let run = BootstrapRun::builder(directory)
        .config(config)
        .start(&args.node)
        .await?;

    let gates = if args.gate {
        match run.gate_local_roles().await {
            Ok(gates) => gates,
            Err(e) => {
                error!(node = %args.node, error = %e, "Startup gate failed");
                return Err(e.into());
            }
        }
    } else {
        Vec::new()
    };

    if args.provide {
        let roles: Vec<Role> = run.local_node().roles.iter().copied().collect();
        for role in roles {
            run.provide_service(role).await?;
        }
    }

    // same cached layout the variable bag is assembled from
    let topology = run
        .facet_layout(Role::PrimaryMetadataService)
        .await?
        .classify();
    let variables = run.assemble().await?;

    info!(
        node = %args.node,
        topology = %topology,
        variables = variables.len(),
        gates = gates.len(),
        bypassed = gates.iter().filter(|g| g.was_bypassed()).count(),
        "Bootstrap pass complete"
    );

    let output = json!({
        "node": args.node,
        "run_id": telemetry.settings().run_id,
        "topology": topology,
        "gates": gates,
        "variables": variables,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}
