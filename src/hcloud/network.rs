/// Network management for Hetzner Cloud
use anyhow::{Context, Result};
use std::collections::HashMap;
use tracing::info;

use super::client::{CreateNetworkRequest, HetznerCloudClient, SubnetRequest};
use super::models::Network;
use crate::labels::{self, selector};

/// Network manager for handling Hetzner Cloud networks
pub struct NetworkManager {
    client: HetznerCloudClient,
}

impl NetworkManager {
    /// Create a new network manager
    pub fn new(client: HetznerCloudClient) -> Self {
        Self { client }
    }

    /// Create or reuse the cluster network. Lookup is by label, never by
    /// name alone.
    pub async fn ensure_network(
        &self,
        cluster_name: &str,
        cidr: &str,
        node_subnet: &str,
        zone: &str,
        base: &HashMap<String, String>,
    ) -> Result<Network> {
        let mut net_labels = base.clone();
        net_labels.insert(
            labels::LABEL_ROLE.to_string(),
            labels::ROLE_NETWORK.to_string(),
        );

        let existing = self.client.list_networks(&selector(&net_labels)).await?;
        if let Some(network) = existing.into_iter().next() {
            info!(
                "Found existing network: {} (ID: {})",
                network.name, network.id
            );
            return Ok(network);
        }

        let name = labels::network_name(cluster_name);
        info!("Creating new private network: {}", name);

        let request = CreateNetworkRequest {
            name,
            ip_range: cidr.to_string(),
            subnets: Some(vec![SubnetRequest {
                ip_range: node_subnet.to_string(),
                network_zone: zone.to_string(),
                subnet_type: "cloud".to_string(),
            }]),
            labels: Some(net_labels),
        };

        let network = self
            .client
            .create_network(request)
            .await
            .context("Failed to create network")?;

        info!(
            "Network created successfully: {} (ID: {})",
            network.name, network.id
        );

        Ok(network)
    }

    /// Find the cluster network without creating it.
    pub async fn find_network(
        &self,
        base: &HashMap<String, String>,
    ) -> Result<Option<Network>> {
        let mut net_labels = base.clone();
        net_labels.insert(
            labels::LABEL_ROLE.to_string(),
            labels::ROLE_NETWORK.to_string(),
        );
        let existing = self.client.list_networks(&selector(&net_labels)).await?;
        Ok(existing.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires API token
    async fn test_network_manager() {
        let token = std::env::var("HCLOUD_TOKEN").expect("HCLOUD_TOKEN not set");
        let client = HetznerCloudClient::new(token).unwrap();
        let _manager = NetworkManager::new(client);
    }
}
