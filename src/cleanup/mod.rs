/// Label-scoped destruction with post-condition verification
use anyhow::Result;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::ClusterSpec;
use crate::hcloud::HetznerCloudClient;
use crate::labels::{self, LABEL_SHARED};

/// A cloud object that survived the sweep. Residuals cost money, so they
/// are reported individually.
#[derive(Debug, Clone)]
pub struct Residual {
    pub kind: &'static str,
    pub id: u64,
    pub name: String,
}

impl std::fmt::Display for Residual {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} (ID: {})", self.kind, self.name, self.id)
    }
}

/// Deletes every cloud object carrying the cluster's label pair, in reverse
/// dependency order, and verifies nothing is left.
pub struct CleanupSweeper {
    client: HetznerCloudClient,
}

impl CleanupSweeper {
    pub fn new(client: HetznerCloudClient) -> Self {
        Self { client }
    }

    /// Run the sweep: a full pass, a recount after 5 s, and if anything
    /// remains a second pass after 30 s. Whatever the final recount still
    /// finds is returned for the cost-leak report.
    pub async fn destroy(&self, spec: &ClusterSpec) -> Result<Vec<Residual>> {
        let selector = labels::cluster_selector(&spec.name, &spec.test_id());

        info!("Sweeping cloud resources for cluster {}", spec.name);
        self.sweep_once(&selector, spec.keep_snapshots).await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        let residuals = self.count_residuals(&selector, spec.keep_snapshots).await?;
        if residuals.is_empty() {
            info!("Sweep complete, no residuals");
            return Ok(vec![]);
        }

        info!(
            "{} residuals after first pass, sweeping again in 30s",
            residuals.len()
        );
        tokio::time::sleep(Duration::from_secs(30)).await;
        self.sweep_once(&selector, spec.keep_snapshots).await;

        let residuals = self.count_residuals(&selector, spec.keep_snapshots).await?;
        if residuals.is_empty() {
            info!("Sweep complete after second pass");
        } else {
            warn!("{} residuals remain after second pass", residuals.len());
        }
        Ok(residuals)
    }

    /// One deletion pass in reverse dependency order. Individual failures
    /// are logged and the pass continues; the recount is the arbiter.
    async fn sweep_once(&self, selector: &str, keep_snapshots: bool) {
        if let Ok(servers) = self.client.list_servers(selector).await {
            for server in servers {
                info!("Deleting server {} (ID: {})", server.name, server.id);
                if let Err(e) = self.client.delete_server(server.id).await {
                    warn!("Failed to delete server {}: {:#}", server.name, e);
                }
            }
        }

        if let Ok(lbs) = self.client.list_load_balancers(selector).await {
            for lb in lbs {
                info!("Deleting load balancer {} (ID: {})", lb.name, lb.id);
                if let Err(e) = self.client.delete_load_balancer(lb.id).await {
                    warn!("Failed to delete load balancer {}: {:#}", lb.name, e);
                }
            }
        }

        if let Ok(groups) = self.client.list_placement_groups(selector).await {
            for group in groups {
                info!("Deleting placement group {} (ID: {})", group.name, group.id);
                if let Err(e) = self.client.delete_placement_group(group.id).await {
                    warn!("Failed to delete placement group {}: {:#}", group.name, e);
                }
            }
        }

        if let Ok(firewalls) = self.client.list_firewalls(selector).await {
            for firewall in firewalls {
                info!("Deleting firewall {} (ID: {})", firewall.name, firewall.id);
                if let Err(e) = self.client.delete_firewall(firewall.id).await {
                    warn!("Failed to delete firewall {}: {:#}", firewall.name, e);
                }
            }
        }

        if let Ok(networks) = self.client.list_networks(selector).await {
            for network in networks {
                info!("Deleting network {} (ID: {})", network.name, network.id);
                if let Err(e) = self.client.delete_network(network.id).await {
                    warn!("Failed to delete network {}: {:#}", network.name, e);
                }
            }
        }

        if let Ok(keys) = self.client.list_ssh_keys(selector).await {
            for key in keys {
                info!("Deleting SSH key {} (ID: {})", key.name, key.id);
                if let Err(e) = self.client.delete_ssh_key(key.id).await {
                    warn!("Failed to delete SSH key {}: {:#}", key.name, e);
                }
            }
        }

        if let Ok(certs) = self.client.list_certificates(selector).await {
            for cert in certs {
                info!("Deleting certificate {} (ID: {})", cert.name, cert.id);
                if let Err(e) = self.client.delete_certificate(cert.id).await {
                    warn!("Failed to delete certificate {}: {:#}", cert.name, e);
                }
            }
        }

        if !keep_snapshots {
            if let Ok(snapshots) = self.client.list_snapshots(selector).await {
                for snapshot in snapshots {
                    // Shared snapshots belong to other clusters too.
                    if snapshot.labels.get(LABEL_SHARED).map(String::as_str) == Some("true") {
                        continue;
                    }
                    let name = snapshot.name.clone().unwrap_or_default();
                    info!("Deleting snapshot {} (ID: {})", name, snapshot.id);
                    if let Err(e) = self.client.delete_image(snapshot.id).await {
                        warn!("Failed to delete snapshot {}: {:#}", name, e);
                    }
                }
            }
        }
    }

    /// Count everything still carrying the cluster label pair.
    pub async fn count_residuals(
        &self,
        selector: &str,
        keep_snapshots: bool,
    ) -> Result<Vec<Residual>> {
        let mut residuals = Vec::new();

        for server in self.client.list_servers(selector).await? {
            residuals.push(Residual {
                kind: "server",
                id: server.id,
                name: server.name,
            });
        }
        for lb in self.client.list_load_balancers(selector).await? {
            residuals.push(Residual {
                kind: "load-balancer",
                id: lb.id,
                name: lb.name,
            });
        }
        for group in self.client.list_placement_groups(selector).await? {
            residuals.push(Residual {
                kind: "placement-group",
                id: group.id,
                name: group.name,
            });
        }
        for firewall in self.client.list_firewalls(selector).await? {
            residuals.push(Residual {
                kind: "firewall",
                id: firewall.id,
                name: firewall.name,
            });
        }
        for network in self.client.list_networks(selector).await? {
            residuals.push(Residual {
                kind: "network",
                id: network.id,
                name: network.name,
            });
        }
        for key in self.client.list_ssh_keys(selector).await? {
            residuals.push(Residual {
                kind: "ssh-key",
                id: key.id,
                name: key.name,
            });
        }
        for cert in self.client.list_certificates(selector).await? {
            residuals.push(Residual {
                kind: "certificate",
                id: cert.id,
                name: cert.name,
            });
        }
        if !keep_snapshots {
            for snapshot in self.client.list_snapshots(selector).await? {
                if snapshot.labels.get(LABEL_SHARED).map(String::as_str) == Some("true") {
                    continue;
                }
                residuals.push(Residual {
                    kind: "snapshot",
                    id: snapshot.id,
                    name: snapshot.name.unwrap_or_default(),
                });
            }
        }

        Ok(residuals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_residual_display() {
        let residual = Residual {
            kind: "server",
            id: 42,
            name: "c1-w-3".to_string(),
        };
        assert_eq!(residual.to_string(), "server c1-w-3 (ID: 42)");
    }
}
