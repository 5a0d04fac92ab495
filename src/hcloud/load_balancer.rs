/// Load balancer management for Hetzner Cloud
use anyhow::{Context, Result};
use std::collections::HashMap;
use tracing::info;

use super::client::{HetznerCloudClient, ACTION_BUDGET_LOAD_BALANCER};
use super::models::{HealthCheck, LabelSelector, LoadBalancer, LoadBalancerService};
use crate::labels::{self, selector};

/// Manager for the Kubernetes API load balancer
pub struct LoadBalancerManager {
    client: HetznerCloudClient,
}

impl LoadBalancerManager {
    pub fn new(client: HetznerCloudClient) -> Self {
        Self { client }
    }

    /// The single 6443 listener with its TCP health check.
    fn kube_api_service() -> LoadBalancerService {
        LoadBalancerService {
            protocol: "tcp".to_string(),
            listen_port: 6443,
            destination_port: 6443,
            health_check: HealthCheck {
                protocol: "tcp".to_string(),
                port: 6443,
                interval: 10,
                timeout: 3,
                retries: 3,
            },
        }
    }

    /// Create or reuse the cluster load balancer.
    ///
    /// The balancer targets the control-plane label selector rather than
    /// individual servers, so it always fronts exactly the control planes
    /// that currently exist, including replacements. It is created before
    /// any control plane exists; the target set is simply empty until the
    /// first one boots.
    pub async fn ensure_load_balancer(
        &self,
        cluster_name: &str,
        location: &str,
        network_id: u64,
        base: &HashMap<String, String>,
    ) -> Result<LoadBalancer> {
        let mut lb_labels = base.clone();
        lb_labels.insert(
            labels::LABEL_ROLE.to_string(),
            labels::ROLE_LOAD_BALANCER.to_string(),
        );

        let existing = self
            .client
            .list_load_balancers(&selector(&lb_labels))
            .await?;
        if let Some(lb) = existing.into_iter().next() {
            info!("Found existing load balancer: {} (ID: {})", lb.name, lb.id);
            return Ok(lb);
        }

        let name = labels::load_balancer_name(cluster_name);
        info!("Creating load balancer {}", name);

        let cluster = base
            .get(labels::LABEL_CLUSTER)
            .map(String::as_str)
            .unwrap_or(cluster_name);
        let test_id = base
            .get(labels::LABEL_TEST_ID)
            .map(String::as_str)
            .unwrap_or("");
        let mut target_labels = labels::base_labels(cluster, test_id);
        target_labels.insert(
            labels::LABEL_ROLE.to_string(),
            labels::ROLE_CONTROL_PLANE.to_string(),
        );

        #[derive(serde::Serialize)]
        struct CreateLoadBalancerRequest {
            name: String,
            load_balancer_type: String,
            location: String,
            network: u64,
            services: Vec<LoadBalancerService>,
            targets: Vec<TargetRequest>,
            labels: HashMap<String, String>,
        }

        #[derive(serde::Serialize)]
        struct TargetRequest {
            #[serde(rename = "type")]
            target_type: String,
            label_selector: LabelSelector,
            use_private_ip: bool,
        }

        let request = CreateLoadBalancerRequest {
            name,
            load_balancer_type: "lb11".to_string(),
            location: location.to_string(),
            network: network_id,
            services: vec![Self::kube_api_service()],
            targets: vec![TargetRequest {
                target_type: "label_selector".to_string(),
                label_selector: LabelSelector {
                    selector: selector(&target_labels),
                },
                use_private_ip: true,
            }],
            labels: lb_labels,
        };

        let response = self
            .client
            .create_load_balancer(&request)
            .await
            .context("Failed to create load balancer")?;

        self.client
            .wait_for_action(response.action.id, ACTION_BUDGET_LOAD_BALANCER)
            .await
            .context("Load balancer creation action failed")?;

        info!(
            "Load balancer created successfully: {} (ID: {})",
            response.load_balancer.name, response.load_balancer.id
        );

        Ok(response.load_balancer)
    }

    /// Find the cluster load balancer without creating it.
    pub async fn find_load_balancer(
        &self,
        base: &HashMap<String, String>,
    ) -> Result<Option<LoadBalancer>> {
        let mut lb_labels = base.clone();
        lb_labels.insert(
            labels::LABEL_ROLE.to_string(),
            labels::ROLE_LOAD_BALANCER.to_string(),
        );
        let existing = self
            .client
            .list_load_balancers(&selector(&lb_labels))
            .await?;
        Ok(existing.into_iter().next())
    }

    /// Public IPv4 of a load balancer.
    pub fn public_ip(lb: &LoadBalancer) -> Option<String> {
        lb.public_net.ipv4.as_ref().and_then(|v| v.ip.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kube_api_service_shape() {
        let svc = LoadBalancerManager::kube_api_service();
        assert_eq!(svc.listen_port, 6443);
        assert_eq!(svc.destination_port, 6443);
        assert_eq!(svc.health_check.interval, 10);
        assert_eq!(svc.health_check.timeout, 3);
        assert_eq!(svc.health_check.retries, 3);
    }
}
