/// Self-healing: replacement of nodes stuck NotReady
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{info, warn};

use crate::config::{ClusterSpec, CONTROL_PLANE_POOL};
use crate::error::invariant;
use crate::hcloud::server::{NodeRole, ServerManager};
use crate::k8s::{KubernetesClient, NodeManager};
use crate::utils::limiter::{run_bounded, DEFAULT_WORKER_POOL};
use crate::utils::polling::PollingConfig;

use super::observe::ObservedState;
use super::provision::NodeProvisioner;

/// Nodes that have tripped the unhealthy threshold, split by role because
/// their replacement strategies differ.
#[derive(Debug, Default)]
pub struct HealthAssessment {
    pub unhealthy_workers: Vec<String>,
    pub unhealthy_control_planes: Vec<String>,
}

impl HealthAssessment {
    pub fn is_healthy(&self) -> bool {
        self.unhealthy_workers.is_empty() && self.unhealthy_control_planes.is_empty()
    }
}

/// A node is unhealthy once its Ready condition has been False or Unknown
/// for the spec's health threshold.
pub fn assess(spec: &ClusterSpec, observed: &ObservedState, now: DateTime<Utc>) -> HealthAssessment {
    let threshold = chrono::Duration::seconds(spec.health_threshold_secs as i64);
    let mut assessment = HealthAssessment::default();

    for node in &observed.nodes {
        // A cordoned node is being removed deliberately; its NotReady is
        // not a failure.
        if node.unschedulable {
            continue;
        }
        let tripped = node
            .not_ready_for(now)
            .map(|d| d >= threshold)
            .unwrap_or(false);
        if !tripped {
            continue;
        }
        if node.control_plane {
            assessment.unhealthy_control_planes.push(node.name.clone());
        } else {
            assessment.unhealthy_workers.push(node.name.clone());
        }
    }

    // Stable replacement order.
    assessment.unhealthy_workers.sort();
    assessment.unhealthy_control_planes.sort();
    assessment
}

/// Replace every unhealthy node: workers in parallel, control planes
/// strictly one at a time with an etcd quorum gate between delete and
/// create.
pub async fn heal(
    provisioner: &NodeProvisioner<'_>,
    observed: &ObservedState,
    assessment: &HealthAssessment,
) -> Result<()> {
    if !assessment.unhealthy_workers.is_empty() {
        let replacements: Vec<_> = assessment
            .unhealthy_workers
            .iter()
            .filter_map(|name| {
                let server = observed.servers.iter().find(|s| s.server.name == *name)?;
                Some(replace_worker(provisioner, server.clone()))
            })
            .collect();
        run_bounded(DEFAULT_WORKER_POOL, replacements).await?;
    }

    for name in &assessment.unhealthy_control_planes {
        let Some(server) = observed
            .servers
            .iter()
            .find(|s| s.server.name == *name)
            .cloned()
        else {
            continue;
        };
        replace_control_plane(provisioner, observed, server).await?;
    }

    Ok(())
}

/// Worker replacement: delete the cloud server, recreate the same slot
/// under the same name, wait for the new node to join.
async fn replace_worker(
    provisioner: &NodeProvisioner<'_>,
    victim: crate::hcloud::server::ServerInfo,
) -> Result<()> {
    let ctx = provisioner.ctx;
    let spec = ctx.spec;
    let name = victim.server.name.clone();

    let sorted = spec.sorted_workers();
    let (pool_index, pool) = sorted
        .iter()
        .enumerate()
        .find(|(_, p)| p.name == victim.pool)
        .ok_or_else(|| invariant(format!("unhealthy node {} matches no pool", name)))?;

    info!("Replacing unhealthy worker {}", name);

    ServerManager::new(ctx.client.clone())
        .delete_server(victim.server.id)
        .await?;
    if let Err(e) = NodeManager::delete_node(&ctx.kubeconfig_path(), &name).await {
        warn!("Could not delete node object {}: {:#}", name, e);
    }

    provisioner
        .ensure_node_joined(
            NodeRole::Worker,
            &pool.name,
            pool_index,
            victim.ordinal,
            &pool.size,
            provisioner
                .infra
                .pool_placement_groups
                .get(&pool.name)
                .copied(),
            pool.labels.clone(),
        )
        .await?;

    info!("Worker {} replaced", name);
    Ok(())
}

/// Control plane replacement. Quorum safety: after deleting the failed
/// member the reconciler waits until every remaining control plane reports
/// healthy etcd before creating the successor, so at most one member is
/// ever in flux.
async fn replace_control_plane(
    provisioner: &NodeProvisioner<'_>,
    observed: &ObservedState,
    victim: crate::hcloud::server::ServerInfo,
) -> Result<()> {
    let ctx = provisioner.ctx;
    let spec = ctx.spec;
    let name = victim.server.name.clone();

    let total = spec.control_plane.count;
    let remaining = observed
        .control_planes()
        .iter()
        .filter(|s| s.server.name != name)
        .count() as u32;
    let quorum = total / 2 + 1;
    if remaining < quorum {
        return Err(invariant(format!(
            "refusing to replace {}: {} remaining control planes cannot hold quorum ({})",
            name, remaining, quorum
        )));
    }

    info!("Replacing unhealthy control plane {}", name);

    ServerManager::new(ctx.client.clone())
        .delete_server(victim.server.id)
        .await?;
    if let Err(e) = NodeManager::delete_node(&ctx.kubeconfig_path(), &name).await {
        warn!("Could not delete node object {}: {:#}", name, e);
    }

    // Survivors must agree before a new member appears.
    let survivors: Vec<String> = observed
        .control_planes()
        .iter()
        .filter(|s| s.server.name != name && observed.node_ready(&s.server.name))
        .map(|s| s.server.name.clone())
        .collect();
    wait_for_etcd_quorum(ctx, &survivors, quorum).await?;

    provisioner
        .ensure_node_joined(
            NodeRole::ControlPlane,
            CONTROL_PLANE_POOL,
            0,
            victim.ordinal,
            &spec.control_plane.size,
            Some(provisioner.infra.cp_placement_group),
            HashMap::new(),
        )
        .await?;

    info!("Control plane {} replaced", name);
    Ok(())
}

/// Poll etcd member health through the API server until at least `quorum`
/// members answer.
async fn wait_for_etcd_quorum(
    ctx: &super::ReconcileContext<'_>,
    cp_nodes: &[String],
    quorum: u32,
) -> Result<()> {
    let kube = KubernetesClient::new(ctx.kubeconfig_path());
    let config = PollingConfig::until(
        ctx.deadline,
        10,
        format!("Waiting for etcd quorum ({} members)", quorum),
    );

    config
        .poll_until(|| async {
            let mut healthy = 0u32;
            for node in cp_nodes {
                let pod = format!("etcd-{}", node);
                if kube
                    .exec_in_pod("kube-system", &pod, &["etcdctl", "endpoint", "health"])
                    .await
                    .is_ok()
                {
                    healthy += 1;
                }
            }
            Ok(healthy >= quorum)
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::NodeInfo;

    fn observed_with_nodes(nodes: Vec<NodeInfo>) -> ObservedState {
        ObservedState {
            servers: vec![],
            network: None,
            firewall: None,
            load_balancer: None,
            nodes,
            kube_api_reachable: true,
        }
    }

    fn node(name: &str, control_plane: bool, not_ready_secs: Option<i64>) -> NodeInfo {
        let now = Utc::now();
        NodeInfo {
            name: name.to_string(),
            ready: not_ready_secs.is_none(),
            unschedulable: false,
            control_plane,
            not_ready_since: not_ready_secs.map(|s| now - chrono::Duration::seconds(s)),
        }
    }

    #[test]
    fn test_assess_respects_threshold() {
        let spec = ClusterSpec::example();
        let now = Utc::now();
        let observed = observed_with_nodes(vec![
            node("talos-cluster-w-1", false, Some(300)),
            node("talos-cluster-w-2", false, Some(30)),
            node("talos-cluster-cp-1", true, None),
        ]);

        let assessment = assess(&spec, &observed, now);
        assert_eq!(assessment.unhealthy_workers, vec!["talos-cluster-w-1"]);
        assert!(assessment.unhealthy_control_planes.is_empty());
    }

    #[test]
    fn test_assess_splits_roles() {
        let spec = ClusterSpec::example();
        let now = Utc::now();
        let observed = observed_with_nodes(vec![
            node("talos-cluster-cp-2", true, Some(600)),
            node("talos-cluster-w-1", false, Some(600)),
        ]);

        let assessment = assess(&spec, &observed, now);
        assert_eq!(
            assessment.unhealthy_control_planes,
            vec!["talos-cluster-cp-2"]
        );
        assert_eq!(assessment.unhealthy_workers, vec!["talos-cluster-w-1"]);
        assert!(!assessment.is_healthy());
    }

    #[test]
    fn test_healthy_cluster_assessment() {
        let spec = ClusterSpec::example();
        let observed = observed_with_nodes(vec![
            node("talos-cluster-cp-1", true, None),
            node("talos-cluster-w-1", false, None),
        ]);
        assert!(assess(&spec, &observed, Utc::now()).is_healthy());
    }
}
