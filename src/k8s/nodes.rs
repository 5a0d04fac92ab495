/// Kubernetes node operations
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;
use tracing::info;

use crate::utils::command::CommandBuilder;
use crate::utils::polling::PollingConfig;

/// A node as observed through the Kubernetes API.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub name: String,
    pub ready: bool,
    pub unschedulable: bool,
    pub control_plane: bool,
    /// When the Ready condition last left True; None while Ready.
    pub not_ready_since: Option<DateTime<Utc>>,
}

impl NodeInfo {
    /// How long the node has been NotReady, if it is.
    pub fn not_ready_for(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.not_ready_since.map(|since| now - since)
    }
}

/// Kubernetes node management operations
pub struct NodeManager;

impl NodeManager {
    /// List all nodes with decoded readiness.
    pub async fn list_nodes(kubeconfig_path: &Path) -> Result<Vec<NodeInfo>> {
        #[derive(serde::Deserialize)]
        struct NodeList {
            items: Vec<Node>,
        }
        #[derive(serde::Deserialize)]
        struct Node {
            metadata: Metadata,
            #[serde(default)]
            spec: Spec,
            #[serde(default)]
            status: Status,
        }
        #[derive(serde::Deserialize)]
        struct Metadata {
            name: String,
            #[serde(default)]
            labels: HashMap<String, String>,
        }
        #[derive(serde::Deserialize, Default)]
        struct Spec {
            #[serde(default)]
            unschedulable: bool,
        }
        #[derive(serde::Deserialize, Default)]
        struct Status {
            #[serde(default)]
            conditions: Vec<Condition>,
        }
        #[derive(serde::Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Condition {
            #[serde(rename = "type")]
            condition_type: String,
            status: String,
            #[serde(default)]
            last_transition_time: Option<String>,
        }

        let output = CommandBuilder::new("kubectl")
            .args(["get", "nodes", "-o", "json"])
            .kubeconfig(kubeconfig_path)
            .context("Failed to list nodes")
            .run()
            .await?;

        let list: NodeList = serde_json::from_str(&output)?;

        let nodes = list
            .items
            .into_iter()
            .map(|node| {
                let ready_condition = node
                    .status
                    .conditions
                    .iter()
                    .find(|c| c.condition_type == "Ready");
                let ready = ready_condition
                    .map(|c| c.status.eq_ignore_ascii_case("true"))
                    .unwrap_or(false);
                let not_ready_since = if ready {
                    None
                } else {
                    ready_condition
                        .and_then(|c| c.last_transition_time.as_deref())
                        .and_then(|t| t.parse::<DateTime<Utc>>().ok())
                };
                let control_plane = node
                    .metadata
                    .labels
                    .contains_key("node-role.kubernetes.io/control-plane");

                NodeInfo {
                    name: node.metadata.name,
                    ready,
                    unschedulable: node.spec.unschedulable,
                    control_plane,
                    not_ready_since,
                }
            })
            .collect();

        Ok(nodes)
    }

    /// Readiness of a single node.
    pub async fn node_ready(kubeconfig_path: &Path, node_name: &str) -> Result<bool> {
        let output = CommandBuilder::new("kubectl")
            .args([
                "get",
                "node",
                node_name,
                "-o",
                "jsonpath={.status.conditions[?(@.type=='Ready')].status}",
            ])
            .kubeconfig(kubeconfig_path)
            .output()
            .await?;

        Ok(output.success && output.stdout.trim().eq_ignore_ascii_case("true"))
    }

    /// Wait for a Kubernetes node to become Ready
    pub async fn wait_for_node_ready(
        kubeconfig_path: &Path,
        node_name: &str,
        deadline: Instant,
    ) -> Result<()> {
        let kubeconfig_path = kubeconfig_path.to_path_buf();
        let node_name = node_name.to_string();

        let config = PollingConfig::until(
            deadline,
            5,
            format!("Waiting for node {} to become Ready", node_name),
        );

        config
            .poll_until(|| {
                let kubeconfig_path = kubeconfig_path.clone();
                let node_name = node_name.clone();
                async move {
                    Ok(Self::node_ready(&kubeconfig_path, &node_name)
                        .await
                        .unwrap_or(false))
                }
            })
            .await
    }

    /// Mark a node unschedulable.
    pub async fn cordon(kubeconfig_path: &Path, node_name: &str) -> Result<()> {
        info!("Cordoning node {}", node_name);
        CommandBuilder::new("kubectl")
            .args(["cordon", node_name])
            .kubeconfig(kubeconfig_path)
            .context(format!("Failed to cordon node {}", node_name))
            .run_silent()
            .await
    }

    /// Evict all workloads from a node within the given deadline. A drain
    /// that overruns is reported but not fatal; the node is about to be
    /// reset regardless.
    pub async fn drain(
        kubeconfig_path: &Path,
        node_name: &str,
        timeout: std::time::Duration,
    ) -> Result<()> {
        info!("Draining node {}", node_name);
        let timeout_arg = format!("--timeout={}s", timeout.as_secs());

        CommandBuilder::new("kubectl")
            .args([
                "drain",
                node_name,
                "--ignore-daemonsets",
                "--delete-emptydir-data",
                "--force",
                &timeout_arg,
            ])
            .kubeconfig(kubeconfig_path)
            .timeout(timeout + std::time::Duration::from_secs(30))
            .context(format!("Failed to drain node {}", node_name))
            .run_silent()
            .await
    }

    /// Delete a Kubernetes node
    pub async fn delete_node(kubeconfig_path: &Path, node_name: &str) -> Result<()> {
        info!("Deleting Kubernetes node: {}", node_name);

        let output = CommandBuilder::new("kubectl")
            .args(["delete", "node", node_name])
            .kubeconfig(kubeconfig_path)
            .context("Failed to delete Kubernetes node")
            .output()
            .await?;

        if !output.success {
            // Don't fail if node doesn't exist
            if output.stderr.contains("NotFound") || output.stderr.contains("not found") {
                info!(
                    "Node {} not found in Kubernetes (already removed)",
                    node_name
                );
                return Ok(());
            }
            anyhow::bail!("Failed to delete node {}: {}", node_name, output.stderr);
        }

        info!("Kubernetes node {} deleted successfully", node_name);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_ready_duration() {
        let now = Utc::now();
        let node = NodeInfo {
            name: "c1-w-1".to_string(),
            ready: false,
            unschedulable: false,
            control_plane: false,
            not_ready_since: Some(now - chrono::Duration::seconds(300)),
        };
        let elapsed = node.not_ready_for(now).unwrap();
        assert!(elapsed >= chrono::Duration::seconds(300));

        let healthy = NodeInfo {
            name: "c1-w-2".to_string(),
            ready: true,
            unschedulable: false,
            control_plane: false,
            not_ready_since: None,
        };
        assert!(healthy.not_ready_for(now).is_none());
    }
}
