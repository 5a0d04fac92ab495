/// Observed cluster state reported after every reconcile
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle phase of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterPhase {
    Pending,
    Provisioning,
    Running,
    Scaling,
    Degraded,
    Healing,
    Destroying,
    Destroyed,
    Failed,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClusterPhase::Pending => "Pending",
            ClusterPhase::Provisioning => "Provisioning",
            ClusterPhase::Running => "Running",
            ClusterPhase::Scaling => "Scaling",
            ClusterPhase::Degraded => "Degraded",
            ClusterPhase::Healing => "Healing",
            ClusterPhase::Destroying => "Destroying",
            ClusterPhase::Destroyed => "Destroyed",
            ClusterPhase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// One node as seen from the cloud and from Kubernetes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub name: String,
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_ip: Option<String>,
}

/// Readiness summary of one pool (or the whole control plane).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PoolStatus {
    pub ready: u32,
    pub total: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<NodeStatus>,
}

/// Singleton infrastructure presence.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InfrastructureStatus {
    pub network: bool,
    pub firewall: bool,
    pub load_balancer: bool,
}

/// Addon installation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AddonPhase {
    #[default]
    Pending,
    Installing,
    Healthy,
    Degraded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AddonStatus {
    pub installed: bool,
    pub healthy: bool,
    pub phase: AddonPhase,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Reachability of the cluster's API surfaces.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConnectivityStatus {
    pub kube_api: bool,
    pub metrics_api: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<String>,
}

/// A typed condition mirroring the error taxonomy; operators read these
/// instead of exit codes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: bool,
    pub reason: String,
    pub message: String,
    pub last_transition: DateTime<Utc>,
}

/// The single source of truth reported to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub cluster: String,
    pub phase: ClusterPhase,
    pub control_planes: PoolStatus,
    pub workers: PoolStatus,
    pub infrastructure: InfrastructureStatus,
    /// Keyed by addon name; BTreeMap keeps report output stable.
    pub addons: BTreeMap<String, AddonStatus>,
    pub connectivity: ConnectivityStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    pub observed_at: DateTime<Utc>,
}

impl ClusterStatus {
    pub fn new(cluster: &str, phase: ClusterPhase) -> Self {
        Self {
            cluster: cluster.to_string(),
            phase,
            control_planes: PoolStatus::default(),
            workers: PoolStatus::default(),
            infrastructure: InfrastructureStatus::default(),
            addons: BTreeMap::new(),
            connectivity: ConnectivityStatus::default(),
            conditions: Vec::new(),
            observed_at: Utc::now(),
        }
    }

    /// Record a condition, replacing any previous condition of the same type.
    pub fn set_condition(&mut self, condition_type: &str, reason: &str, message: &str) {
        self.conditions.retain(|c| c.condition_type != condition_type);
        self.conditions.push(Condition {
            condition_type: condition_type.to_string(),
            status: true,
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition: Utc::now(),
        });
    }

    /// True when every pool matches its desired count and no condition is
    /// outstanding.
    pub fn is_steady(&self) -> bool {
        self.phase == ClusterPhase::Running
            && self.control_planes.ready == self.control_planes.total
            && self.workers.ready == self.workers.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_condition_replaces() {
        let mut status = ClusterStatus::new("c1", ClusterPhase::Pending);
        status.set_condition("Degraded", "NodeNotReady", "c1-w-2 NotReady");
        status.set_condition("Degraded", "PoolShort", "pool w short by 1");
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].reason, "PoolShort");
    }

    #[test]
    fn test_is_steady() {
        let mut status = ClusterStatus::new("c1", ClusterPhase::Running);
        status.control_planes.ready = 3;
        status.control_planes.total = 3;
        status.workers.ready = 2;
        status.workers.total = 2;
        assert!(status.is_steady());

        status.workers.ready = 1;
        assert!(!status.is_steady());
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(ClusterPhase::Provisioning.to_string(), "Provisioning");
        assert_eq!(ClusterPhase::Destroyed.to_string(), "Destroyed");
    }

    #[test]
    fn test_status_serializes() {
        let status = ClusterStatus::new("c1", ClusterPhase::Pending);
        let yaml = serde_yaml::to_string(&status).unwrap();
        assert!(yaml.contains("phase: Pending"));
    }
}
