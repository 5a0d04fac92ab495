/// Firewall management for Hetzner Cloud
use anyhow::{Context, Result};
use std::collections::HashMap;
use tracing::info;

use super::client::{HetznerCloudClient, ACTION_BUDGET_DEFAULT};
use super::models::{Action, Firewall, FirewallRule, LabelSelector};
use crate::labels::{self, selector};

/// Firewall manager
pub struct FirewallManager {
    client: HetznerCloudClient,
}

impl FirewallManager {
    /// Create a new firewall manager
    pub fn new(client: HetznerCloudClient) -> Self {
        Self { client }
    }

    /// Get current public IP address
    pub async fn get_current_ip() -> Result<String> {
        let client = reqwest::Client::new();
        let response = client
            .get("https://ipv4.icanhazip.com")
            .send()
            .await
            .context("Failed to get current IP address")?;

        let ip = response
            .text()
            .await
            .context("Failed to read IP address response")?;

        Ok(ip.trim().to_string())
    }

    /// Ingress rules for the management surfaces: Kubernetes API, Talos
    /// API, SSH. Intra-network traffic never touches the cloud firewall.
    pub fn management_rules(source_cidrs: &[String]) -> Vec<FirewallRule> {
        let sources: Vec<String> = source_cidrs
            .iter()
            .map(|ip| {
                if ip.contains('/') {
                    ip.clone()
                } else {
                    format!("{}/32", ip)
                }
            })
            .collect();

        ["6443", "50000", "22"]
            .into_iter()
            .map(|port| FirewallRule {
                direction: "in".to_string(),
                source_ips: sources.clone(),
                destination_ips: vec![],
                protocol: "tcp".to_string(),
                port: Some(port.to_string()),
            })
            .collect()
    }

    /// Create or reuse the cluster firewall. An existing firewall with a
    /// different rule set is updated in place.
    pub async fn ensure_firewall(
        &self,
        cluster_name: &str,
        source_cidrs: &[String],
        base: &HashMap<String, String>,
    ) -> Result<Firewall> {
        let mut fw_labels = base.clone();
        fw_labels.insert(
            labels::LABEL_ROLE.to_string(),
            labels::ROLE_FIREWALL.to_string(),
        );

        let rules = Self::management_rules(source_cidrs);

        let existing = self.client.list_firewalls(&selector(&fw_labels)).await?;
        if let Some(firewall) = existing.into_iter().next() {
            info!(
                "Found existing firewall: {} (ID: {})",
                firewall.name, firewall.id
            );
            if firewall.rules != rules {
                info!("Firewall rules drifted, resetting");
                self.set_rules(firewall.id, &rules).await?;
            }
            return Ok(firewall);
        }

        let name = labels::firewall_name(cluster_name);
        info!("Creating firewall {}", name);

        #[derive(serde::Serialize)]
        struct CreateFirewallRequest {
            name: String,
            rules: Vec<FirewallRule>,
            labels: HashMap<String, String>,
            apply_to: Vec<ApplyTo>,
        }

        #[derive(serde::Serialize)]
        struct ApplyTo {
            #[serde(rename = "type")]
            resource_type: String,
            label_selector: LabelSelector,
        }

        // Attach by label selector so new servers pick the firewall up
        // without a follow-up call.
        let request = CreateFirewallRequest {
            name,
            rules,
            labels: fw_labels.clone(),
            apply_to: vec![ApplyTo {
                resource_type: "label_selector".to_string(),
                label_selector: LabelSelector {
                    selector: labels::cluster_selector(
                        base.get(labels::LABEL_CLUSTER).map(String::as_str).unwrap_or(cluster_name),
                        base.get(labels::LABEL_TEST_ID).map(String::as_str).unwrap_or(""),
                    ),
                },
            }],
        };

        let firewall = self
            .client
            .create_firewall(&request)
            .await
            .context("Failed to create firewall")?;

        info!(
            "Firewall created successfully: {} (ID: {})",
            firewall.name, firewall.id
        );

        Ok(firewall)
    }

    /// Replace the rule set of an existing firewall.
    async fn set_rules(&self, firewall_id: u64, rules: &[FirewallRule]) -> Result<()> {
        #[derive(serde::Serialize)]
        struct SetRulesRequest<'a> {
            rules: &'a [FirewallRule],
        }

        #[derive(serde::Deserialize)]
        struct ActionsResponse {
            actions: Vec<Action>,
        }

        let response: ActionsResponse = self
            .client
            .post(
                &format!("firewalls/{}/actions/set_rules", firewall_id),
                &SetRulesRequest { rules },
            )
            .await
            .context("Failed to set firewall rules")?;

        for action in response.actions {
            self.client
                .wait_for_action(action.id, ACTION_BUDGET_DEFAULT)
                .await?;
        }

        Ok(())
    }

    /// Find the cluster firewall without creating it.
    pub async fn find_firewall(
        &self,
        base: &HashMap<String, String>,
    ) -> Result<Option<Firewall>> {
        let mut fw_labels = base.clone();
        fw_labels.insert(
            labels::LABEL_ROLE.to_string(),
            labels::ROLE_FIREWALL.to_string(),
        );
        let existing = self.client.list_firewalls(&selector(&fw_labels)).await?;
        Ok(existing.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_management_rules() {
        let rules = FirewallManager::management_rules(&["198.51.100.7".to_string()]);
        assert_eq!(rules.len(), 3);
        assert!(rules.iter().all(|r| r.direction == "in"));
        assert!(rules
            .iter()
            .all(|r| r.source_ips == vec!["198.51.100.7/32".to_string()]));
        let ports: Vec<_> = rules.iter().filter_map(|r| r.port.clone()).collect();
        assert_eq!(ports, vec!["6443", "50000", "22"]);
    }

    #[test]
    fn test_management_rules_keeps_cidrs() {
        let rules = FirewallManager::management_rules(&["10.1.0.0/16".to_string()]);
        assert_eq!(rules[0].source_ips, vec!["10.1.0.0/16".to_string()]);
    }

    #[tokio::test]
    async fn test_get_current_ip() {
        let result = FirewallManager::get_current_ip().await;
        if let Ok(ip) = result {
            assert!(!ip.is_empty());
        }
    }
}
