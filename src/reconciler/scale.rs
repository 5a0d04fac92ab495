/// Pool scaling: converge observed node counts onto the spec
use anyhow::Result;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::CONTROL_PLANE_POOL;
use crate::hcloud::server::{NodeRole, ServerInfo, ServerManager};
use crate::k8s::NodeManager;
use crate::talos::TalosClient;
use crate::utils::limiter::{run_bounded, DEFAULT_WORKER_POOL};

use super::observe::ObservedState;
use super::provision::NodeProvisioner;

/// Time allowed for workload eviction before the node is reset anyway.
const DRAIN_DEADLINE: Duration = Duration::from_secs(300);

/// Ordinals are a pool's stable slots: 1..=desired must exist. Returns the
/// slots that need a server.
pub fn missing_ordinals(existing: &[u32], desired: u32) -> Vec<u32> {
    (1..=desired).filter(|o| !existing.contains(o)).collect()
}

/// Downscale victims: everything above the desired count, highest ordinal
/// first.
pub fn select_victims<'a>(existing: &[&'a ServerInfo], desired: u32) -> Vec<&'a ServerInfo> {
    let mut victims: Vec<&ServerInfo> = existing
        .iter()
        .filter(|s| s.ordinal > desired)
        .copied()
        .collect();
    victims.sort_by(|a, b| b.ordinal.cmp(&a.ordinal));
    victims
}

/// Bring every worker pool to its desired count. Returns true when any
/// mutation happened.
pub async fn scale_worker_pools(
    provisioner: &NodeProvisioner<'_>,
    observed: &ObservedState,
) -> Result<bool> {
    let spec = provisioner.ctx.spec;
    let mut changed = false;

    for (pool_index, pool) in spec.sorted_workers().iter().enumerate() {
        let existing = observed.workers_in_pool(&pool.name);
        let existing_ordinals: Vec<u32> = existing.iter().map(|s| s.ordinal).collect();

        let missing = missing_ordinals(&existing_ordinals, pool.count);
        let excess = select_victims(&existing, pool.count);

        if !missing.is_empty() {
            info!(
                "Scaling pool {} up: creating ordinals {:?}",
                pool.name, missing
            );
            let joins: Vec<_> = missing
                .iter()
                .map(|ordinal| {
                    provisioner.ensure_node_joined(
                        NodeRole::Worker,
                        &pool.name,
                        pool_index,
                        *ordinal,
                        &pool.size,
                        provisioner
                            .infra
                            .pool_placement_groups
                            .get(&pool.name)
                            .copied(),
                        pool.labels.clone(),
                    )
                })
                .collect();
            run_bounded(DEFAULT_WORKER_POOL, joins).await?;
            changed = true;
        }

        if !excess.is_empty() {
            info!(
                "Scaling pool {} down: removing {}",
                pool.name,
                excess
                    .iter()
                    .map(|s| s.server.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            for victim in excess {
                remove_node(provisioner, victim).await?;
            }
            changed = true;
        }
    }

    Ok(changed)
}

/// Recreate control planes missing from the cloud, strictly one at a time.
pub async fn ensure_control_plane_count(
    provisioner: &NodeProvisioner<'_>,
    observed: &ObservedState,
) -> Result<bool> {
    let spec = provisioner.ctx.spec;
    let existing: Vec<u32> = observed.control_planes().iter().map(|s| s.ordinal).collect();
    let mut changed = false;

    for ordinal in 1..=spec.control_plane.count {
        if existing.contains(&ordinal) {
            continue;
        }
        info!("Control plane ordinal {} missing, recreating", ordinal);
        provisioner
            .ensure_node_joined(
                NodeRole::ControlPlane,
                CONTROL_PLANE_POOL,
                0,
                ordinal,
                &spec.control_plane.size,
                Some(provisioner.infra.cp_placement_group),
                HashMap::new(),
            )
            .await?;
        changed = true;
    }

    Ok(changed)
}

/// Graceful removal of one node: cordon, drain, reset, delete the cloud
/// server, delete the Kubernetes node object.
pub async fn remove_node(
    provisioner: &NodeProvisioner<'_>,
    victim: &ServerInfo,
) -> Result<()> {
    let ctx = provisioner.ctx;
    let kubeconfig = ctx.kubeconfig_path();
    let name = victim.server.name.clone();

    info!("Removing node {} (ID: {})", name, victim.server.id);

    if kubeconfig.exists() {
        if let Err(e) = NodeManager::cordon(&kubeconfig, &name).await {
            warn!("Could not cordon {}: {:#}", name, e);
        }
        if let Err(e) = NodeManager::drain(&kubeconfig, &name, DRAIN_DEADLINE).await {
            warn!("Drain of {} did not finish cleanly: {:#}", name, e);
        }
    }

    if let Some(ip) = ServerManager::get_server_ip(&victim.server) {
        let talos = TalosClient::new(ctx.talosconfig_path());
        if let Err(e) = talos.reset_node(&ip, true).await {
            warn!("Reset of {} failed, deleting anyway: {:#}", name, e);
        }
    }

    ServerManager::new(ctx.client.clone())
        .delete_server(victim.server.id)
        .await?;

    if kubeconfig.exists() {
        NodeManager::delete_node(&kubeconfig, &name).await?;
    }

    info!("Node {} removed", name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hcloud::models::*;

    fn server(pool: &str, ordinal: u32) -> ServerInfo {
        ServerInfo {
            server: Server {
                id: ordinal as u64,
                name: crate::labels::server_name("c1", pool, ordinal),
                status: "running".to_string(),
                server_type: ServerType {
                    id: 1,
                    name: "cpx31".to_string(),
                    description: String::new(),
                    cores: 2,
                    memory: 4.0,
                    disk: 80,
                },
                datacenter: Datacenter {
                    id: 1,
                    name: "nbg1-dc3".to_string(),
                    description: String::new(),
                    location: Location {
                        id: 1,
                        name: "nbg1".to_string(),
                        description: String::new(),
                        country: "DE".to_string(),
                        city: "Nuremberg".to_string(),
                        latitude: 0.0,
                        longitude: 0.0,
                    },
                },
                public_net: PublicNetwork {
                    ipv4: None,
                    ipv6: None,
                    floating_ips: vec![],
                },
                private_net: vec![],
                created: String::new(),
                labels: std::collections::HashMap::new(),
                image: None,
                placement_group: None,
            },
            role: NodeRole::Worker,
            pool: pool.to_string(),
            ordinal,
        }
    }

    #[test]
    fn test_missing_ordinals() {
        assert_eq!(missing_ordinals(&[], 3), vec![1, 2, 3]);
        assert_eq!(missing_ordinals(&[1, 3], 3), vec![2]);
        assert_eq!(missing_ordinals(&[1, 2, 3], 3), Vec::<u32>::new());
        assert_eq!(missing_ordinals(&[1, 2, 3], 0), Vec::<u32>::new());
    }

    #[test]
    fn test_victims_leave_highest_ordinal_first() {
        let servers = vec![server("w", 1), server("w", 2), server("w", 3)];
        let refs: Vec<&ServerInfo> = servers.iter().collect();

        let victims = select_victims(&refs, 1);
        let names: Vec<_> = victims.iter().map(|s| s.server.name.as_str()).collect();
        assert_eq!(names, vec!["c1-w-3", "c1-w-2"]);
    }

    #[test]
    fn test_no_victims_at_steady_state() {
        let servers = vec![server("w", 1), server("w", 2)];
        let refs: Vec<&ServerInfo> = servers.iter().collect();
        assert!(select_victims(&refs, 2).is_empty());
        assert!(missing_ordinals(&[1, 2], 2).is_empty());
    }

    #[test]
    fn test_count_zero_empties_the_pool() {
        let servers = vec![server("w", 1), server("w", 2)];
        let refs: Vec<&ServerInfo> = servers.iter().collect();
        let victims = select_victims(&refs, 0);
        assert_eq!(victims.len(), 2);
        assert!(missing_ordinals(&[], 0).is_empty());
    }
}
