/// Provisioning: dependency-ordered creation of cloud objects and the
/// Talos bootstrap protocol
use anyhow::{Context, Result};
use std::collections::HashMap;
use tracing::info;

use crate::config::CONTROL_PLANE_POOL;
use crate::error::permanent;
use crate::hcloud::models::Network;
use crate::hcloud::server::{NodeRequest, NodeRole, ServerInfo};
use crate::hcloud::{
    CertificateManager, FirewallManager, LoadBalancerManager, NetworkManager,
    PlacementGroupManager, SSHKeyManager, ServerManager,
};
use crate::k8s::{KubernetesClient, NodeManager};
use crate::labels;
use crate::secrets::restrict_permissions;
use crate::talos::machine_config::{render_kubeconfig, render_talosconfig};
use crate::talos::{MachineConfigGenerator, NodeIdentity, TalosClient};
use crate::utils::limiter::{run_bounded, DEFAULT_WORKER_POOL};

use super::ReconcileContext;

/// Singleton infrastructure a cluster stands on. Ensured first on every
/// reconcile; every call after the first is lookups only.
pub struct Infrastructure {
    pub network: Network,
    pub lb_ip: String,
    pub ssh_key_id: u64,
    pub cp_placement_group: u64,
    pub pool_placement_groups: HashMap<String, u64>,
}

/// Ensure the base layer: SSH key, placement groups, network, firewall,
/// state certificate concurrently, then the load balancer on top of the
/// network.
pub async fn ensure_infrastructure(ctx: &ReconcileContext<'_>) -> Result<Infrastructure> {
    let spec = ctx.spec;
    let base = &ctx.base;

    let network_manager = NetworkManager::new(ctx.client.clone());
    let firewall_manager = FirewallManager::new(ctx.client.clone());
    let lb_manager = LoadBalancerManager::new(ctx.client.clone());
    let ssh_manager = SSHKeyManager::new(ctx.client.clone());
    let pg_manager = PlacementGroupManager::new(ctx.client.clone());
    let cert_manager = CertificateManager::new(ctx.client.clone());

    let source_cidrs = if spec.firewall_source_cidrs.is_empty() {
        let current_ip = FirewallManager::get_current_ip().await?;
        info!("Detected current IP address: {}", current_ip);
        vec![current_ip]
    } else {
        spec.firewall_source_cidrs.clone()
    };

    let node_subnet = spec.network.node_subnet()?;

    let ensure_pools = async {
        let mut groups = HashMap::new();
        for pool in spec.sorted_workers() {
            if !pool.placement_spread {
                continue;
            }
            let mut pg_labels = base.clone();
            pg_labels.insert(labels::LABEL_POOL.to_string(), pool.name.clone());
            let group = pg_manager
                .ensure_spread_group(
                    &labels::pool_placement_group_name(&spec.name, &pool.name),
                    &pg_labels,
                )
                .await?;
            groups.insert(pool.name.clone(), group.id);
        }
        Ok::<_, anyhow::Error>(groups)
    };

    let ensure_cp_pg = async {
        let mut pg_labels = base.clone();
        pg_labels.insert(
            labels::LABEL_POOL.to_string(),
            CONTROL_PLANE_POOL.to_string(),
        );
        let group = pg_manager
            .ensure_spread_group(&labels::cp_placement_group_name(&spec.name), &pg_labels)
            .await?;
        Ok::<_, anyhow::Error>(group.id)
    };

    let ensure_ssh = async {
        let (key, private_key) = ssh_manager.ensure_ssh_key(&spec.name, base).await?;
        if let Some(private_key) = private_key {
            let key_path = ctx.output_dir.join("id_ed25519");
            tokio::fs::write(&key_path, private_key)
                .await
                .context("Failed to save SSH private key")?;
            restrict_permissions(&key_path)?;
            info!("SSH private key saved to: {}", key_path.display());
        }
        Ok::<_, anyhow::Error>(key.id)
    };

    // The state certificate marks, on the cloud side, that secret material
    // exists for this cluster.
    let ensure_state_cert = async {
        cert_manager
            .ensure_certificate(
                &labels::state_certificate_name(&spec.name),
                &ctx.secrets.machine_ca.crt,
                &ctx.secrets.machine_ca.key,
                base,
            )
            .await?;
        Ok::<_, anyhow::Error>(())
    };

    let (network, _firewall, pool_placement_groups, cp_placement_group, ssh_key_id, ()) =
        tokio::try_join!(
            network_manager.ensure_network(
                &spec.name,
                &spec.network.cidr,
                &node_subnet,
                spec.region.network_zone(),
                base,
            ),
            firewall_manager.ensure_firewall(&spec.name, &source_cidrs, base),
            ensure_pools,
            ensure_cp_pg,
            ensure_ssh,
            ensure_state_cert,
        )?;

    let load_balancer = lb_manager
        .ensure_load_balancer(&spec.name, spec.region.location(), network.id, base)
        .await?;
    let lb_ip = LoadBalancerManager::public_ip(&load_balancer)
        .ok_or_else(|| permanent("load balancer has no public IPv4"))?;

    Ok(Infrastructure {
        network,
        lb_ip,
        ssh_key_id,
        cp_placement_group,
        pool_placement_groups,
    })
}

/// Creates servers and walks them through config apply and cluster join.
/// Shared by provisioning, scaling and healing so every path produces
/// identical nodes.
pub struct NodeProvisioner<'a> {
    pub ctx: &'a ReconcileContext<'a>,
    pub infra: &'a Infrastructure,
    snapshot_id: String,
}

impl<'a> NodeProvisioner<'a> {
    pub fn new(ctx: &'a ReconcileContext<'a>, infra: &'a Infrastructure) -> Result<Self> {
        let snapshot_id = ctx.spec.talos_snapshot_id.clone().ok_or_else(|| {
            permanent(
                "talos_snapshot_id is not set. Build a Talos snapshot and reference its ID \
                 in the cluster spec",
            )
        })?;
        Ok(Self {
            ctx,
            infra,
            snapshot_id,
        })
    }

    fn talos(&self) -> TalosClient {
        TalosClient::new(self.ctx.talosconfig_path())
    }

    /// Deterministic identity of a node slot.
    pub fn identity(
        &self,
        role: NodeRole,
        pool: &str,
        pool_index: usize,
        ordinal: u32,
    ) -> Result<NodeIdentity> {
        let spec = self.ctx.spec;
        let private_ip = match role {
            NodeRole::ControlPlane => spec.network.control_plane_ip(ordinal)?,
            NodeRole::Worker => spec.network.worker_ip(pool_index, ordinal)?,
        };
        Ok(NodeIdentity {
            name: labels::server_name(&spec.name, pool, ordinal),
            private_ip,
            pool: pool.to_string(),
            ordinal,
            bootstrap: role == NodeRole::ControlPlane && ordinal == 1,
        })
    }

    /// Render the machine config for a node and persist it for reapplies.
    fn write_config(&self, role: NodeRole, identity: &NodeIdentity) -> Result<std::path::PathBuf> {
        let generator =
            MachineConfigGenerator::new(self.ctx.spec, self.ctx.secrets, &self.infra.lb_ip);
        let config = generator.render(role, identity)?;

        let dir = self.ctx.output_dir.join("nodes");
        std::fs::create_dir_all(&dir).context("Failed to create node config directory")?;
        let path = dir.join(format!("{}.yaml", identity.name));
        std::fs::write(&path, config)
            .with_context(|| format!("Failed to write machine config for {}", identity.name))?;
        restrict_permissions(&path)?;
        Ok(path)
    }

    /// Ensure the cloud server for a node slot exists, with the rendered
    /// machine config as user data.
    #[allow(clippy::too_many_arguments)]
    pub async fn ensure_server(
        &self,
        role: NodeRole,
        pool: &str,
        pool_index: usize,
        ordinal: u32,
        server_type: &str,
        placement_group_id: Option<u64>,
        extra_labels: HashMap<String, String>,
    ) -> Result<(ServerInfo, NodeIdentity)> {
        let identity = self.identity(role, pool, pool_index, ordinal)?;
        let config_path = self.write_config(role, &identity)?;
        let user_data = std::fs::read_to_string(&config_path)?;

        let server = ServerManager::new(self.ctx.client.clone())
            .ensure_node(NodeRequest {
                cluster_name: &self.ctx.spec.name,
                test_id: &self.ctx.test_id,
                pool,
                ordinal,
                role,
                server_type,
                location: self.ctx.spec.region.location(),
                snapshot_id: &self.snapshot_id,
                network_id: self.infra.network.id,
                placement_group_id,
                ssh_key_id: Some(self.infra.ssh_key_id),
                private_ip: &identity.private_ip,
                user_data: Some(user_data),
                extra_labels,
            })
            .await?;

        Ok((server, identity))
    }

    /// Full join of a non-bootstrap node: server up, config applied over
    /// mTLS, Kubernetes Node Ready.
    #[allow(clippy::too_many_arguments)]
    pub async fn ensure_node_joined(
        &self,
        role: NodeRole,
        pool: &str,
        pool_index: usize,
        ordinal: u32,
        server_type: &str,
        placement_group_id: Option<u64>,
        extra_labels: HashMap<String, String>,
    ) -> Result<ServerInfo> {
        let (server, identity) = self
            .ensure_server(
                role,
                pool,
                pool_index,
                ordinal,
                server_type,
                placement_group_id,
                extra_labels,
            )
            .await?;

        let public_ip = ServerManager::get_server_ip(&server.server)
            .ok_or_else(|| permanent(format!("server {} has no public IP", identity.name)))?;

        let talos = self.talos();
        let config_path = self.ctx.node_config_path(&identity.name);

        // A fresh node configures itself from user data; the mTLS apply is
        // the drift corrector and a no-op on an already-converged node.
        talos.wait_for_api(&public_ip, self.ctx.deadline).await?;
        talos.apply_config(&public_ip, &config_path).await?;

        NodeManager::wait_for_node_ready(
            &self.ctx.kubeconfig_path(),
            &identity.name,
            self.ctx.deadline,
        )
        .await?;

        info!("Node {} joined and Ready", identity.name);
        Ok(server)
    }

    /// The bootstrap control plane: insecure apply while the node is in
    /// maintenance mode, then the one etcd bootstrap call. A failed attempt
    /// resets the node; after two retries the cluster is marked Failed.
    pub async fn provision_bootstrap_cp(&self) -> Result<ServerInfo> {
        let spec = self.ctx.spec;
        let (server, identity) = self
            .ensure_server(
                NodeRole::ControlPlane,
                CONTROL_PLANE_POOL,
                0,
                1,
                &spec.control_plane.size,
                Some(self.infra.cp_placement_group),
                HashMap::new(),
            )
            .await?;

        let public_ip = ServerManager::get_server_ip(&server.server)
            .ok_or_else(|| permanent(format!("server {} has no public IP", identity.name)))?;

        let talos = self.talos();
        let config_path = self.ctx.node_config_path(&identity.name);

        let mut last_err = None;
        for attempt in 0..3 {
            if attempt > 0 {
                info!("Retrying bootstrap of {} (attempt {})", identity.name, attempt + 1);
            }

            let result = async {
                if talos.is_maintenance_mode(&public_ip).await? {
                    talos.apply_config_insecure(&public_ip, &config_path).await?;
                }
                talos.wait_for_api(&public_ip, self.ctx.deadline).await?;
                talos.bootstrap(&public_ip).await
            }
            .await;

            match result {
                Ok(()) => return Ok(server),
                Err(e) => {
                    last_err = Some(e);
                    if attempt < 2 {
                        let _ = talos.reset_node(&public_ip, false).await;
                        talos
                            .wait_for_maintenance(&public_ip, self.ctx.deadline)
                            .await?;
                    }
                }
            }
        }

        Err(permanent(format!(
            "bootstrap of {} failed after 3 attempts: {:#}",
            identity.name,
            last_err.unwrap_or_else(|| anyhow::anyhow!("unknown"))
        )))
    }

    /// Write the admin talosconfig (pointing at the control plane public
    /// IPs) and the admin kubeconfig (pointing at the load balancer).
    /// Idempotent; called again whenever the control plane set changes.
    pub fn write_client_configs(&self, cp_public_ips: &[String]) -> Result<()> {
        let talosconfig = render_talosconfig(self.ctx.secrets, cp_public_ips)?;
        let talosconfig_path = self.ctx.talosconfig_path();
        std::fs::write(&talosconfig_path, talosconfig)?;
        restrict_permissions(&talosconfig_path)?;

        let kubeconfig = render_kubeconfig(self.ctx.secrets, &self.infra.lb_ip)?;
        let kubeconfig_path = self.ctx.kubeconfig_path();
        std::fs::write(&kubeconfig_path, kubeconfig)?;
        restrict_permissions(&kubeconfig_path)?;

        Ok(())
    }
}

/// The provisioning run: bootstrap control plane, remaining control planes
/// in parallel, then all worker pools in parallel.
pub async fn run_provisioning(ctx: &ReconcileContext<'_>, infra: &Infrastructure) -> Result<()> {
    let provisioner = NodeProvisioner::new(ctx, infra)?;
    let spec = ctx.spec;

    info!("Provisioning control plane for {}", spec.name);
    let cp1 = provisioner.provision_bootstrap_cp().await?;
    let cp1_ip = ServerManager::get_server_ip(&cp1.server)
        .ok_or_else(|| permanent("bootstrap control plane has no public IP"))?;
    provisioner.write_client_configs(&[cp1_ip.clone()])?;

    // The bootstrap call itself is not the source of truth; the API server
    // answering through the load balancer is.
    KubernetesClient::wait_for_api_server(&infra.lb_ip, ctx.deadline).await?;
    NodeManager::wait_for_node_ready(
        &ctx.kubeconfig_path(),
        &labels::server_name(&spec.name, CONTROL_PLANE_POOL, 1),
        ctx.deadline,
    )
    .await?;

    let mut cp_ips = vec![cp1_ip];
    if spec.control_plane.count > 1 {
        let provisioner_ref = &provisioner;
        let joins: Vec<_> = (2..=spec.control_plane.count)
            .map(|ordinal| {
                provisioner_ref.ensure_node_joined(
                    NodeRole::ControlPlane,
                    CONTROL_PLANE_POOL,
                    0,
                    ordinal,
                    &spec.control_plane.size,
                    Some(infra.cp_placement_group),
                    HashMap::new(),
                )
            })
            .collect();
        let peers = run_bounded(DEFAULT_WORKER_POOL, joins).await?;
        cp_ips.extend(
            peers
                .iter()
                .filter_map(|s| ServerManager::get_server_ip(&s.server)),
        );
        provisioner.write_client_configs(&cp_ips)?;
    }

    let sorted_pools = spec.sorted_workers();
    let provisioner_ref = &provisioner;
    let worker_joins: Vec<_> = sorted_pools
        .iter()
        .enumerate()
        .flat_map(|(pool_index, pool)| {
            (1..=pool.count).map(move |ordinal| {
                provisioner_ref.ensure_node_joined(
                    NodeRole::Worker,
                    &pool.name,
                    pool_index,
                    ordinal,
                    &pool.size,
                    infra.pool_placement_groups.get(&pool.name).copied(),
                    pool.labels.clone(),
                )
            })
        })
        .collect();
    run_bounded(DEFAULT_WORKER_POOL, worker_joins).await?;

    info!("All nodes provisioned for {}", spec.name);
    Ok(())
}
