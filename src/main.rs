/// Patina - Talos Kubernetes cluster lifecycle manager for Hetzner Cloud
///
/// Takes a declarative cluster spec, provisions the infrastructure, boots a
/// Talos control plane, installs the platform addons, and keeps reconciling
/// observed state toward the spec until told to destroy everything.
mod addons;
mod cleanup;
mod config;
mod error;
mod hcloud;
mod k8s;
mod labels;
mod reconciler;
mod secrets;
mod status;
mod talos;
mod utils;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::ClusterSpec;
use crate::k8s::KubernetesClient;
use crate::reconciler::{phase_deadline, Reconciler};
use crate::status::ClusterPhase;
use crate::talos::TalosClient;

#[derive(Parser)]
#[command(name = "patina")]
#[command(about = "Deploy and reconcile Talos Linux clusters on Hetzner Cloud", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Cluster spec file path
    #[arg(short, long, default_value = "cluster.yaml")]
    config: PathBuf,

    /// Output directory for secrets and generated files
    #[arg(short, long, default_value = "./output")]
    output: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile the cluster toward the spec (create it if absent)
    Apply {
        /// Keep reconciling periodically instead of exiting after one pass
        #[arg(long)]
        watch: bool,
    },

    /// Destroy the cluster and verify nothing is left behind
    Destroy,

    /// Show cluster status
    Status,

    /// Generate example spec file
    Init,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("patina={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let result = match cli.command {
        Commands::Apply { watch } => apply_cluster(&cli, watch).await,
        Commands::Destroy => destroy_cluster(&cli).await,
        Commands::Status => show_status(&cli).await,
        Commands::Init => init_spec(&cli).await,
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// Reconcile once, or keep reconciling with --watch.
async fn apply_cluster(cli: &Cli, watch: bool) -> Result<()> {
    TalosClient::check_talosctl_installed()
        .await
        .context("talosctl is required")?;
    KubernetesClient::check_kubectl_installed()
        .await
        .context("kubectl is required")?;

    let spec = ClusterSpec::from_file(&cli.config).context("Failed to load cluster spec")?;
    info!("Cluster name: {}", spec.name);

    tokio::fs::create_dir_all(&cli.output)
        .await
        .context("Failed to create output directory")?;

    let reconciler = Reconciler::new(&spec, cli.output.clone())?;

    let status = if watch {
        reconciler.run_loop(&spec).await
    } else {
        let deadline = Instant::now() + phase_deadline(ClusterPhase::Pending);
        reconciler.reconcile(&spec, deadline).await
    };

    print_status(&status);

    if status.phase == ClusterPhase::Failed {
        anyhow::bail!("cluster {} is Failed; operator intervention required", spec.name);
    }

    Ok(())
}

/// Destroy the cluster with label-scoped cleanup.
async fn destroy_cluster(cli: &Cli) -> Result<()> {
    let spec = ClusterSpec::from_file(&cli.config).context("Failed to load cluster spec")?;
    info!("Cluster name: {}", spec.name);

    let reconciler = Reconciler::new(&spec, cli.output.clone())?;
    let status = reconciler.destroy(&spec).await;

    print_status(&status);

    match status.phase {
        ClusterPhase::Destroyed => {
            info!("✓ Cluster destroyed successfully");
            Ok(())
        }
        _ => anyhow::bail!("destroy of {} did not complete cleanly", spec.name),
    }
}

/// Print the observed state of the cluster without mutating anything.
async fn show_status(cli: &Cli) -> Result<()> {
    let spec = ClusterSpec::from_file(&cli.config).context("Failed to load cluster spec")?;

    let client = hcloud::HetznerCloudClient::new(spec.get_hcloud_token()?)?;
    let base = labels::base_labels(&spec.name, &spec.test_id());
    let observed = reconciler::observe::observe(
        &client,
        &spec,
        &base,
        &cli.output.join("kubeconfig"),
    )
    .await?;

    if observed.is_empty() {
        info!("No resources found for cluster: {}", spec.name);
        return Ok(());
    }

    info!("Cluster: {}", spec.name);
    info!("  Network: {}", observed.network.is_some());
    info!("  Firewall: {}", observed.firewall.is_some());
    info!("  Load balancer: {}", observed.load_balancer.is_some());
    info!("  Kubernetes API reachable: {}", observed.kube_api_reachable);
    info!("");

    info!("Control planes:");
    for server in observed.control_planes() {
        print_server(&observed, server);
    }

    info!("");
    info!("Worker pools:");
    for pool in spec.sorted_workers() {
        let members = observed.workers_in_pool(&pool.name);
        info!(
            "  {} - {}/{} node(s) (server type: {})",
            pool.name,
            members.len(),
            pool.count,
            pool.size
        );
        for server in members {
            print_server(&observed, server);
        }
    }

    Ok(())
}

fn print_server(
    observed: &reconciler::observe::ObservedState,
    server: &hcloud::server::ServerInfo,
) {
    let ip = hcloud::ServerManager::get_server_ip(&server.server)
        .unwrap_or_else(|| "N/A".to_string());
    let private_ip = hcloud::ServerManager::get_server_private_ip(&server.server)
        .unwrap_or_else(|| "N/A".to_string());
    info!(
        "    - {} (ID: {}, Status: {}, Ready: {}, IP: {}, Private IP: {})",
        server.server.name,
        server.server.id,
        server.server.status,
        observed.node_ready(&server.server.name),
        ip,
        private_ip
    );
}

fn print_status(status: &status::ClusterStatus) {
    info!("");
    if status.is_steady() {
        info!("✓ Cluster {} is {} and converged", status.cluster, status.phase);
    } else {
        info!("Cluster {} is {}", status.cluster, status.phase);
    }
    info!(
        "  Control planes: {}/{} ready",
        status.control_planes.ready, status.control_planes.total
    );
    info!(
        "  Workers: {}/{} ready",
        status.workers.ready, status.workers.total
    );
    for (name, addon) in &status.addons {
        info!(
            "  Addon {}: installed={} healthy={} ({:?})",
            name, addon.installed, addon.healthy, addon.phase
        );
    }
    for condition in &status.conditions {
        info!(
            "  Condition {}: {} - {}",
            condition.condition_type, condition.reason, condition.message
        );
    }
}

/// Initialize example spec file
async fn init_spec(cli: &Cli) -> Result<()> {
    if cli.config.exists() {
        anyhow::bail!("Spec file already exists: {}", cli.config.display());
    }

    let example = ClusterSpec::example();
    let yaml = serde_yaml::to_string(&example)?;

    tokio::fs::write(&cli.config, yaml)
        .await
        .context("Failed to write spec file")?;

    info!("Example spec created: {}", cli.config.display());
    info!("");
    info!("Next steps:");
    info!("  1. Edit the spec to match your requirements");
    info!("  2. Set your Hetzner Cloud API token:");
    info!("     export HCLOUD_TOKEN=your-token-here");
    info!("  3. Create the cluster:");
    info!("     patina apply");

    Ok(())
}
