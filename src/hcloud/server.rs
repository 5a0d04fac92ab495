/// Server management for Hetzner Cloud
use anyhow::{Context, Result};
use std::collections::HashMap;
use tracing::{info, warn};

use super::client::{CreateServerRequest, HetznerCloudClient, ACTION_BUDGET_SERVER};
use super::models::Server;
use crate::labels::{self, selector};

/// Server manager for handling Hetzner Cloud servers
pub struct ServerManager {
    client: HetznerCloudClient,
}

/// A cluster server together with its decoded identity labels.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub server: Server,
    pub role: NodeRole,
    pub pool: String,
    pub ordinal: u32,
}

/// Node role in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    ControlPlane,
    Worker,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::ControlPlane => write!(f, "control-plane"),
            NodeRole::Worker => write!(f, "worker"),
        }
    }
}

/// Everything needed to create one node.
pub struct NodeRequest<'a> {
    pub cluster_name: &'a str,
    pub test_id: &'a str,
    pub pool: &'a str,
    pub ordinal: u32,
    pub role: NodeRole,
    pub server_type: &'a str,
    pub location: &'a str,
    pub snapshot_id: &'a str,
    pub network_id: u64,
    pub placement_group_id: Option<u64>,
    pub ssh_key_id: Option<u64>,
    pub private_ip: &'a str,
    pub user_data: Option<String>,
    pub extra_labels: HashMap<String, String>,
}

impl NodeRequest<'_> {
    pub fn name(&self) -> String {
        labels::server_name(self.cluster_name, self.pool, self.ordinal)
    }

    fn labels(&self) -> HashMap<String, String> {
        let mut all = labels::server_labels(
            self.cluster_name,
            self.test_id,
            match self.role {
                NodeRole::ControlPlane => labels::ROLE_CONTROL_PLANE,
                NodeRole::Worker => labels::ROLE_WORKER,
            },
            self.pool,
            self.ordinal,
        );
        all.extend(self.extra_labels.clone());
        all
    }
}

impl ServerManager {
    /// Create a new server manager
    pub fn new(client: HetznerCloudClient) -> Self {
        Self { client }
    }

    /// Ensure a node exists exactly as requested.
    ///
    /// Lookup is by identity labels. An existing server whose immutable
    /// fields (type, location) match is reused; one that drifted is
    /// destroyed and recreated under the same name.
    pub async fn ensure_node(&self, request: NodeRequest<'_>) -> Result<ServerInfo> {
        let node_labels = request.labels();
        let name = request.name();

        let existing = self.client.list_servers(&selector(&node_labels)).await?;
        if let Some(server) = existing.into_iter().next() {
            if Self::matches_request(&server, &request) {
                info!("Reusing existing server {} (ID: {})", server.name, server.id);
                return Ok(Self::decode(server, &request));
            }

            info!(
                "Server {} (ID: {}) no longer matches its pool, recreating",
                server.name, server.id
            );
            self.client.delete_server(server.id).await?;
        }

        info!(
            "Creating {} server: {} (type: {})",
            request.role, name, request.server_type
        );

        let create = CreateServerRequest {
            name: name.clone(),
            server_type: request.server_type.to_string(),
            location: request.location.to_string(),
            image: request.snapshot_id.to_string(),
            ssh_keys: request.ssh_key_id.map(|id| vec![id]),
            user_data: request.user_data.clone(),
            networks: Some(vec![request.network_id]),
            firewalls: None,
            placement_group: request.placement_group_id,
            labels: Some(node_labels),
            automount: Some(false),
            start_after_create: Some(true),
        };

        let response = self
            .client
            .create_server(create)
            .await
            .with_context(|| format!("Failed to create server {}", name))?;

        info!(
            "Server {} created successfully (ID: {}), waiting for provisioning...",
            name, response.server.id
        );

        self.client
            .wait_for_action(response.action.id, ACTION_BUDGET_SERVER)
            .await
            .context("Server creation action failed")?;

        let server = self
            .client
            .get_server(response.server.id)
            .await
            .context("Failed to get server details")?;

        info!("Server {} is up", name);

        Ok(Self::decode(server, &request))
    }

    /// Immutable fields that force a replacement when drifted.
    fn matches_request(server: &Server, request: &NodeRequest<'_>) -> bool {
        server.name == request.name()
            && server.server_type.name == request.server_type
            && server.datacenter.location.name == request.location
    }

    fn decode(server: Server, request: &NodeRequest<'_>) -> ServerInfo {
        ServerInfo {
            server,
            role: request.role,
            pool: request.pool.to_string(),
            ordinal: request.ordinal,
        }
    }

    /// List all servers for a cluster, decoding identity from labels.
    pub async fn list_cluster_servers(
        &self,
        cluster_name: &str,
        test_id: &str,
    ) -> Result<Vec<ServerInfo>> {
        let servers = self
            .client
            .list_servers(&labels::cluster_selector(cluster_name, test_id))
            .await?;

        let mut infos: Vec<ServerInfo> = servers
            .into_iter()
            .filter_map(|server| {
                let role = match server.labels.get(labels::LABEL_ROLE).map(String::as_str) {
                    Some(labels::ROLE_CONTROL_PLANE) => NodeRole::ControlPlane,
                    Some(labels::ROLE_WORKER) => NodeRole::Worker,
                    _ => return None,
                };
                let pool = server.labels.get(labels::LABEL_POOL)?.clone();
                let ordinal = server
                    .labels
                    .get(labels::LABEL_ORDINAL)
                    .and_then(|o| o.parse().ok())
                    .or_else(|| labels::parse_ordinal(&server.name, cluster_name, &pool))?;
                Some(ServerInfo {
                    server,
                    role,
                    pool,
                    ordinal,
                })
            })
            .collect();

        // Stable ordering: pool name, then ordinal.
        infos.sort_by(|a, b| a.pool.cmp(&b.pool).then(a.ordinal.cmp(&b.ordinal)));

        Ok(infos)
    }

    /// Delete specific servers by ID
    pub async fn delete_servers(&self, server_ids: Vec<u64>) -> Result<()> {
        if server_ids.is_empty() {
            info!("No servers to delete");
            return Ok(());
        }

        info!("Deleting {} servers", server_ids.len());

        for server_id in server_ids {
            info!("Deleting server ID: {}", server_id);
            if let Err(e) = self.client.delete_server(server_id).await {
                warn!("Failed to delete server {}: {}", server_id, e);
            }
        }

        Ok(())
    }

    /// Delete a single server by ID
    pub async fn delete_server(&self, server_id: u64) -> Result<()> {
        self.client.delete_server(server_id).await
    }

    /// Get the primary public IP address of a server
    pub fn get_server_ip(server: &Server) -> Option<String> {
        server.public_net.ipv4.as_ref().map(|ipv4| ipv4.ip.clone())
    }

    /// Get the private IP address of a server
    pub fn get_server_private_ip(server: &Server) -> Option<String> {
        server.private_net.first().map(|net| net.ip.clone())
    }

    /// Filter servers by role and optionally pool name
    pub fn filter_by_role_and_pool(
        servers: &[ServerInfo],
        role: NodeRole,
        pool_name: Option<&str>,
    ) -> Vec<ServerInfo> {
        servers
            .iter()
            .filter(|s| s.role == role && pool_name.map(|p| s.pool == p).unwrap_or(true))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hcloud::models::*;

    #[test]
    fn test_node_role_display() {
        assert_eq!(NodeRole::ControlPlane.to_string(), "control-plane");
        assert_eq!(NodeRole::Worker.to_string(), "worker");
    }

    fn sample_server(name: &str, server_type: &str, location: &str) -> Server {
        Server {
            id: 1,
            name: name.to_string(),
            status: "running".to_string(),
            server_type: ServerType {
                id: 1,
                name: server_type.to_string(),
                description: String::new(),
                cores: 2,
                memory: 4.0,
                disk: 40,
            },
            datacenter: Datacenter {
                id: 1,
                name: format!("{}-dc8", location),
                description: String::new(),
                location: Location {
                    id: 1,
                    name: location.to_string(),
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
            labels: HashMap::new(),
            image: None,
            placement_group: None,
        }
    }

    fn sample_request<'a>() -> NodeRequest<'a> {
        NodeRequest {
            cluster_name: "c1",
            test_id: "t1",
            pool: "w",
            ordinal: 1,
            role: NodeRole::Worker,
            server_type: "cpx31",
            location: "nbg1",
            snapshot_id: "12345",
            network_id: 1,
            placement_group_id: None,
            ssh_key_id: None,
            private_ip: "10.0.0.51",
            user_data: None,
            extra_labels: HashMap::new(),
        }
    }

    #[test]
    fn test_matches_request() {
        let request = sample_request();
        let good = sample_server("c1-w-1", "cpx31", "nbg1");
        assert!(ServerManager::matches_request(&good, &request));

        let wrong_type = sample_server("c1-w-1", "cpx21", "nbg1");
        assert!(!ServerManager::matches_request(&wrong_type, &request));

        let wrong_location = sample_server("c1-w-1", "cpx31", "fsn1");
        assert!(!ServerManager::matches_request(&wrong_location, &request));
    }

    #[test]
    fn test_filter_by_role_and_pool() {
        let mk = |pool: &str, ordinal, role| ServerInfo {
            server: sample_server(
                &labels::server_name("c1", pool, ordinal),
                "cpx31",
                "nbg1",
            ),
            role,
            pool: pool.to_string(),
            ordinal,
        };
        let servers = vec![
            mk("cp", 1, NodeRole::ControlPlane),
            mk("w", 1, NodeRole::Worker),
            mk("w", 2, NodeRole::Worker),
            mk("gpu", 1, NodeRole::Worker),
        ];

        let workers = ServerManager::filter_by_role_and_pool(&servers, NodeRole::Worker, Some("w"));
        assert_eq!(workers.len(), 2);

        let all_workers = ServerManager::filter_by_role_and_pool(&servers, NodeRole::Worker, None);
        assert_eq!(all_workers.len(), 3);
    }
}
