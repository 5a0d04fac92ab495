/// Observation of cloud and in-cluster state
use anyhow::Result;
use std::collections::HashMap;
use std::path::Path;

use crate::config::{ClusterSpec, CONTROL_PLANE_POOL};
use crate::hcloud::models::{Firewall, LoadBalancer, Network};
use crate::hcloud::server::{NodeRole, ServerInfo};
use crate::hcloud::{
    FirewallManager, HetznerCloudClient, LoadBalancerManager, NetworkManager, ServerManager,
};
use crate::k8s::{NodeInfo, NodeManager};

/// Everything a reconcile decision is based on. Collected once at the top
/// of a reconcile and treated as immutable afterwards.
#[derive(Debug)]
pub struct ObservedState {
    pub servers: Vec<ServerInfo>,
    pub network: Option<Network>,
    pub firewall: Option<Firewall>,
    pub load_balancer: Option<LoadBalancer>,
    /// Nodes as Kubernetes sees them; empty when the API is unreachable.
    pub nodes: Vec<NodeInfo>,
    pub kube_api_reachable: bool,
}

impl ObservedState {
    /// True when no cloud object for the cluster exists at all.
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
            && self.network.is_none()
            && self.firewall.is_none()
            && self.load_balancer.is_none()
    }

    pub fn control_planes(&self) -> Vec<&ServerInfo> {
        self.servers
            .iter()
            .filter(|s| s.role == NodeRole::ControlPlane)
            .collect()
    }

    pub fn workers_in_pool(&self, pool: &str) -> Vec<&ServerInfo> {
        self.servers
            .iter()
            .filter(|s| s.role == NodeRole::Worker && s.pool == pool)
            .collect()
    }

    /// Servers carrying the cluster label but matching no pool in the spec.
    /// These are never deleted automatically.
    pub fn stray_servers(&self, spec: &ClusterSpec) -> Vec<&ServerInfo> {
        self.servers
            .iter()
            .filter(|s| match s.role {
                NodeRole::ControlPlane => {
                    s.pool != CONTROL_PLANE_POOL || s.ordinal > spec.control_plane.count
                }
                NodeRole::Worker => !spec.workers.iter().any(|p| p.name == s.pool),
            })
            .collect()
    }

    pub fn node(&self, name: &str) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn node_ready(&self, name: &str) -> bool {
        self.node(name).map(|n| n.ready).unwrap_or(false)
    }
}

/// Gather the current state of the world for one cluster.
pub async fn observe(
    client: &HetznerCloudClient,
    spec: &ClusterSpec,
    base_labels: &HashMap<String, String>,
    kubeconfig_path: &Path,
) -> Result<ObservedState> {
    let server_manager = ServerManager::new(client.clone());
    let network_manager = NetworkManager::new(client.clone());
    let firewall_manager = FirewallManager::new(client.clone());
    let lb_manager = LoadBalancerManager::new(client.clone());

    let test_id = spec.test_id();

    let (servers, network, firewall, load_balancer) = tokio::try_join!(
        server_manager.list_cluster_servers(&spec.name, &test_id),
        network_manager.find_network(base_labels),
        firewall_manager.find_firewall(base_labels),
        lb_manager.find_load_balancer(base_labels),
    )?;

    let (nodes, kube_api_reachable) = if kubeconfig_path.exists() {
        match NodeManager::list_nodes(kubeconfig_path).await {
            Ok(nodes) => (nodes, true),
            Err(_) => (Vec::new(), false),
        }
    } else {
        (Vec::new(), false)
    };

    Ok(ObservedState {
        servers,
        network,
        firewall,
        load_balancer,
        nodes,
        kube_api_reachable,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hcloud::models::*;

    fn server(pool: &str, ordinal: u32, role: NodeRole) -> ServerInfo {
        ServerInfo {
            server: Server {
                id: ordinal as u64,
                name: crate::labels::server_name("talos-cluster", pool, ordinal),
                status: "running".to_string(),
                server_type: ServerType {
                    id: 1,
                    name: "cpx21".to_string(),
                    description: String::new(),
                    cores: 2,
                    memory: 4.0,
                    disk: 40,
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
            role,
            pool: pool.to_string(),
            ordinal,
        }
    }

    fn observed(servers: Vec<ServerInfo>) -> ObservedState {
        ObservedState {
            servers,
            network: None,
            firewall: None,
            load_balancer: None,
            nodes: vec![],
            kube_api_reachable: false,
        }
    }

    #[test]
    fn test_is_empty() {
        assert!(observed(vec![]).is_empty());
        assert!(!observed(vec![server("w", 1, NodeRole::Worker)]).is_empty());
    }

    #[test]
    fn test_stray_detection() {
        let spec = ClusterSpec::example();
        let state = observed(vec![
            server("cp", 1, NodeRole::ControlPlane),
            server("w", 1, NodeRole::Worker),
            server("ghost", 1, NodeRole::Worker),
            server("cp", 4, NodeRole::ControlPlane),
        ]);

        let strays: Vec<_> = state
            .stray_servers(&spec)
            .into_iter()
            .map(|s| s.server.name.clone())
            .collect();
        assert_eq!(strays, vec!["talos-cluster-ghost-1", "talos-cluster-cp-4"]);
    }

    #[test]
    fn test_pool_filters() {
        let state = observed(vec![
            server("cp", 1, NodeRole::ControlPlane),
            server("w", 1, NodeRole::Worker),
            server("w", 2, NodeRole::Worker),
        ]);
        assert_eq!(state.control_planes().len(), 1);
        assert_eq!(state.workers_in_pool("w").len(), 2);
        assert_eq!(state.workers_in_pool("x").len(), 0);
    }
}
