/// The reconciler: a finite, idempotent state machine converging the cloud
/// and the cluster onto the spec
pub mod heal;
pub mod observe;
pub mod provision;
pub mod scale;

use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::addons::{AddonContext, AddonInstaller};
use crate::cleanup::CleanupSweeper;
use crate::config::ClusterSpec;
use crate::error::{classify, invariant, ErrorKind};
use crate::hcloud::server::ServerManager;
use crate::hcloud::{HetznerCloudClient, LoadBalancerManager};
use crate::k8s::KubernetesClient;
use crate::labels;
use crate::secrets::{Secrets, SECRETS_FILE};
use crate::status::{ClusterPhase, ClusterStatus, NodeStatus, PoolStatus};

use observe::{observe, ObservedState};
use provision::{ensure_infrastructure, NodeProvisioner};

const LAST_APPLIED_FILE: &str = "clusterspec.yaml";

/// How long a reconcile may run, by the phase it starts in.
pub fn phase_deadline(phase: ClusterPhase) -> Duration {
    match phase {
        ClusterPhase::Pending | ClusterPhase::Provisioning => Duration::from_secs(60 * 60),
        ClusterPhase::Scaling | ClusterPhase::Healing | ClusterPhase::Degraded => {
            Duration::from_secs(30 * 60)
        }
        _ => Duration::from_secs(15 * 60),
    }
}

/// Pause between periodic reconciles: short while converging, relaxed when
/// steady.
pub fn phase_interval(phase: ClusterPhase) -> Duration {
    match phase {
        ClusterPhase::Provisioning
        | ClusterPhase::Scaling
        | ClusterPhase::Healing
        | ClusterPhase::Degraded => Duration::from_secs(10),
        _ => Duration::from_secs(30),
    }
}

/// Everything a single reconcile carries around. Secrets and spec are
/// immutable for the duration of the reconcile.
pub struct ReconcileContext<'a> {
    pub spec: &'a ClusterSpec,
    pub secrets: &'a Secrets,
    pub client: HetznerCloudClient,
    pub output_dir: PathBuf,
    pub deadline: Instant,
    pub test_id: String,
    pub base: HashMap<String, String>,
}

impl ReconcileContext<'_> {
    pub fn kubeconfig_path(&self) -> PathBuf {
        self.output_dir.join("kubeconfig")
    }

    pub fn talosconfig_path(&self) -> PathBuf {
        self.output_dir.join("talosconfig")
    }

    pub fn node_config_path(&self, node_name: &str) -> PathBuf {
        self.output_dir.join("nodes").join(format!("{}.yaml", node_name))
    }
}

fn cluster_lock(name: &str) -> Arc<tokio::sync::Mutex<()>> {
    static LOCKS: OnceLock<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>> = OnceLock::new();
    let locks = LOCKS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut locks = locks.lock().unwrap_or_else(|e| e.into_inner());
    locks
        .entry(name.to_string())
        .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
        .clone()
}

/// Probe Prometheus through a port-forward to its service.
async fn verify_prometheus(kube: &KubernetesClient) -> bool {
    let Ok(_forward) = kube.port_forward("monitoring", "prometheus", 19090, 9090).await else {
        return false;
    };
    let Ok(client) = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
    else {
        return false;
    };
    match client.get("http://127.0.0.1:19090/-/healthy").send().await {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}

/// Refuse spec changes that would have to be repaired by destroy-and-
/// recreate: the deployment mode and with it the control plane count.
pub fn guard_immutable_fields(previous: &ClusterSpec, next: &ClusterSpec) -> Result<()> {
    if previous.mode != next.mode {
        return Err(invariant(format!(
            "mode change {:?} -> {:?} on a live cluster; destroy and recreate instead",
            previous.mode, next.mode
        )));
    }
    if previous.control_plane.count != next.control_plane.count {
        return Err(invariant(format!(
            "control plane count change {} -> {} on a live cluster; destroy and recreate instead",
            previous.control_plane.count, next.control_plane.count
        )));
    }
    if previous.network.cidr != next.network.cidr {
        return Err(invariant(format!(
            "network change {} -> {} on a live cluster; destroy and recreate instead",
            previous.network.cidr, next.network.cidr
        )));
    }
    Ok(())
}

/// The cluster lifecycle driver.
pub struct Reconciler {
    client: HetznerCloudClient,
    output_dir: PathBuf,
    hcloud_token: String,
}

impl Reconciler {
    pub fn new(spec: &ClusterSpec, output_dir: PathBuf) -> Result<Self> {
        let hcloud_token = spec.get_hcloud_token()?;
        let client = HetznerCloudClient::new(hcloud_token.clone())?;
        Ok(Self {
            client,
            output_dir,
            hcloud_token,
        })
    }

    /// One reconcile. Never panics and never fails: every outcome is a
    /// ClusterStatus.
    pub async fn reconcile(&self, spec: &ClusterSpec, deadline: Instant) -> ClusterStatus {
        let lock = cluster_lock(&spec.name);
        let _guard = lock.lock().await;

        match self.reconcile_locked(spec, deadline).await {
            Ok(status) => status,
            Err(e) => self.status_from_error(spec, e),
        }
    }

    async fn reconcile_locked(
        &self,
        spec: &ClusterSpec,
        deadline: Instant,
    ) -> Result<ClusterStatus> {
        spec.validate()?;

        if let Some(previous) = self.load_last_applied()? {
            guard_immutable_fields(&previous, spec)?;
        }

        let test_id = spec.test_id();
        let base = labels::base_labels(&spec.name, &test_id);

        // Secrets must exist iff cloud state exists; peeking at the cloud
        // before generating keeps a fresh checkout from minting a second
        // bundle for a cluster that is already running elsewhere.
        let secrets_path = self.output_dir.join(SECRETS_FILE);
        let pre_observed = observe(&self.client, spec, &base, &self.kubeconfig_path()).await?;
        if !secrets_path.exists() && !pre_observed.is_empty() {
            return Err(crate::error::permanent(format!(
                "cluster {} has cloud resources but no local secrets file; \
                 recover {} before reconciling",
                spec.name,
                secrets_path.display()
            )));
        }
        let secrets = Secrets::load_or_generate(&self.output_dir, &spec.name)?;

        let ctx = ReconcileContext {
            spec,
            secrets: &secrets,
            client: self.client.clone(),
            output_dir: self.output_dir.clone(),
            deadline,
            test_id,
            base,
        };

        let status = self.converge(&ctx, pre_observed).await?;
        self.save_last_applied(spec)?;
        Ok(status)
    }

    /// Drive the observed state toward the spec and report what happened.
    async fn converge(
        &self,
        ctx: &ReconcileContext<'_>,
        observed: ObservedState,
    ) -> Result<ClusterStatus> {
        let spec = ctx.spec;

        // Strays violate the label invariant; refuse to repair them
        // automatically.
        let strays = observed.stray_servers(spec);
        if !strays.is_empty() {
            let names: Vec<_> = strays.iter().map(|s| s.server.name.clone()).collect();
            let mut status = self.build_status(ctx, &observed, ClusterPhase::Degraded).await;
            status.set_condition(
                "Invariant",
                "StrayServers",
                &format!(
                    "servers labelled for this cluster match no pool: {}",
                    names.join(", ")
                ),
            );
            warn!("Cluster {} degraded: stray servers {:?}", spec.name, names);
            return Ok(status);
        }

        let provisioning = observed.is_empty() || !ctx.kubeconfig_path().exists();
        if provisioning {
            info!("Cluster {} entering provisioning", spec.name);
        }

        let infra = ensure_infrastructure(ctx).await?;
        let provisioner = NodeProvisioner::new(ctx, &infra)?;

        let mut phase = ClusterPhase::Running;

        if provisioning {
            phase = ClusterPhase::Provisioning;
            provision::run_provisioning(ctx, &infra).await?;
        } else {
            // Control planes move; keep the admin configs pointed at the
            // ones that exist right now.
            let cp_ips: Vec<String> = observed
                .control_planes()
                .iter()
                .filter_map(|s| ServerManager::get_server_ip(&s.server))
                .collect();
            if !cp_ips.is_empty() {
                provisioner.write_client_configs(&cp_ips)?;
            }

            // Self-healing first: a short pool is repaired before scaling
            // logic looks at it.
            let assessment = heal::assess(spec, &observed, Utc::now());
            if !assessment.is_healthy() {
                info!(
                    "Cluster {} healing: {} workers, {} control planes unhealthy",
                    spec.name,
                    assessment.unhealthy_workers.len(),
                    assessment.unhealthy_control_planes.len()
                );
                phase = ClusterPhase::Healing;
                heal::heal(&provisioner, &observed, &assessment).await?;
            }

            let cp_changed = scale::ensure_control_plane_count(&provisioner, &observed).await?;
            let workers_changed = scale::scale_worker_pools(&provisioner, &observed).await?;
            if phase == ClusterPhase::Running && (cp_changed || workers_changed) {
                phase = ClusterPhase::Scaling;
            }
        }

        // Addons converge within their own budget so a flapping probe
        // cannot pin the whole reconcile; brief CNI oscillation during
        // healing stays below this and never surfaces.
        let addon_budget = if provisioning {
            Duration::from_secs(300)
        } else {
            Duration::from_secs(60)
        };
        let addon_deadline = (Instant::now() + addon_budget).min(ctx.deadline);

        let kube = KubernetesClient::new(ctx.kubeconfig_path());
        let installer = AddonInstaller::new(
            spec,
            &kube,
            AddonContext {
                hcloud_token: self.hcloud_token.clone(),
                location: spec.region.location().to_string(),
            },
        )?;
        let mut addons = installer.ensure_addons(addon_deadline).await?;

        // Prometheus answers its own health endpoint; a ready Deployment
        // with a wedged TSDB still needs to be surfaced.
        if let Some(monitoring) = addons.get_mut("monitoring") {
            if monitoring.healthy && !verify_prometheus(&kube).await {
                monitoring.healthy = false;
                monitoring.phase = crate::status::AddonPhase::Degraded;
                monitoring.message = "prometheus health endpoint not answering".to_string();
            }
        }

        // Fresh observation for the report; the one we started from is
        // stale after mutations.
        let observed = observe(&self.client, spec, &ctx.base, &ctx.kubeconfig_path()).await?;
        let mut status = self.build_status(ctx, &observed, phase).await;
        status.addons = addons;

        // Settled means every pool is full and the hard addon is healthy.
        let counts_match = status.control_planes.ready == spec.control_plane.count
            && status.workers.ready == spec.workers.iter().map(|p| p.count).sum::<u32>();
        let cni_healthy = status
            .addons
            .get("cilium")
            .map(|a| a.healthy)
            .unwrap_or(!spec.addons.cilium.enabled);
        status.phase = match status.phase {
            ClusterPhase::Degraded | ClusterPhase::Failed => status.phase,
            _ if counts_match && cni_healthy => ClusterPhase::Running,
            ClusterPhase::Running => ClusterPhase::Degraded,
            other => other,
        };
        if status.phase == ClusterPhase::Degraded {
            status.set_condition(
                "Degraded",
                "PoolShort",
                "node counts or CNI health do not match the spec",
            );
        }

        Ok(status)
    }

    /// Destroy the cluster: label-scoped sweep, residual verification,
    /// local state removal. Calling it again on a destroyed cluster is a
    /// no-op that reports Destroyed.
    pub async fn destroy(&self, spec: &ClusterSpec) -> ClusterStatus {
        let lock = cluster_lock(&spec.name);
        let _guard = lock.lock().await;

        info!("Destroying cluster {}", spec.name);
        let mut status = ClusterStatus::new(&spec.name, ClusterPhase::Destroying);

        let sweeper = CleanupSweeper::new(self.client.clone());
        match sweeper.destroy(spec).await {
            Ok(residuals) if residuals.is_empty() => {
                if let Err(e) = self.remove_local_state() {
                    warn!("Could not remove local state: {:#}", e);
                }
                status.phase = ClusterPhase::Destroyed;
                info!("Cluster {} destroyed", spec.name);
            }
            Ok(residuals) => {
                let inventory = residuals
                    .iter()
                    .map(|r| r.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                status = self.status_from_error(
                    spec,
                    crate::error::cost_leak(format!(
                        "cleanup left billable resources: {}",
                        inventory
                    )),
                );
            }
            Err(e) => {
                status.phase = ClusterPhase::Failed;
                status.set_condition("Failed", "CleanupError", &format!("{:#}", e));
            }
        }

        status
    }

    /// Map an error chain onto a terminal status per the taxonomy.
    fn status_from_error(&self, spec: &ClusterSpec, err: anyhow::Error) -> ClusterStatus {
        let kind = classify(&err);
        let (phase, reason) = match kind {
            ErrorKind::Permanent => (ClusterPhase::Failed, "Permanent"),
            ErrorKind::Invariant => (ClusterPhase::Degraded, "Invariant"),
            ErrorKind::CostLeak => (ClusterPhase::Failed, "CostLeak"),
            ErrorKind::Transient | ErrorKind::Retryable => (ClusterPhase::Degraded, "Retryable"),
        };

        error!("Reconcile of {} did not converge: {:#}", spec.name, err);

        let mut status = ClusterStatus::new(&spec.name, phase);
        status.set_condition("ReconcileError", reason, &format!("{:#}", err));
        status
    }

    /// Assemble the report from an observation.
    async fn build_status(
        &self,
        ctx: &ReconcileContext<'_>,
        observed: &ObservedState,
        phase: ClusterPhase,
    ) -> ClusterStatus {
        let spec = ctx.spec;
        let mut status = ClusterStatus::new(&spec.name, phase);

        let node_status = |info: &crate::hcloud::server::ServerInfo| NodeStatus {
            name: info.server.name.clone(),
            ready: observed.node_ready(&info.server.name),
            public_ip: ServerManager::get_server_ip(&info.server),
            private_ip: ServerManager::get_server_private_ip(&info.server),
        };

        let cp_nodes: Vec<NodeStatus> = observed
            .control_planes()
            .into_iter()
            .map(|s| node_status(s))
            .collect();
        status.control_planes = PoolStatus {
            ready: cp_nodes.iter().filter(|n| n.ready).count() as u32,
            total: spec.control_plane.count,
            nodes: cp_nodes,
        };

        let worker_nodes: Vec<NodeStatus> = observed
            .servers
            .iter()
            .filter(|s| s.role == crate::hcloud::server::NodeRole::Worker)
            .map(node_status)
            .collect();
        status.workers = PoolStatus {
            ready: worker_nodes.iter().filter(|n| n.ready).count() as u32,
            total: spec.workers.iter().map(|p| p.count).sum(),
            nodes: worker_nodes,
        };

        status.infrastructure.network = observed.network.is_some();
        status.infrastructure.firewall = observed.firewall.is_some();
        status.infrastructure.load_balancer = observed.load_balancer.is_some();

        status.connectivity.kube_api = observed.kube_api_reachable;
        if let Some(lb) = &observed.load_balancer {
            if let Some(ip) = LoadBalancerManager::public_ip(lb) {
                status.connectivity.endpoints = vec![format!("https://{}:6443", ip)];
            }
        }
        if observed.kube_api_reachable {
            let kube = KubernetesClient::new(ctx.kubeconfig_path());
            status.connectivity.metrics_api = kube.metrics_api_healthy().await.unwrap_or(false);
        }

        status
    }

    /// Periodic reconcile loop: fast while converging, relaxed when steady,
    /// stopping on terminal phases.
    pub async fn run_loop(&self, spec: &ClusterSpec) -> ClusterStatus {
        let mut phase = ClusterPhase::Pending;

        loop {
            let deadline = Instant::now() + phase_deadline(phase);
            let status = self.reconcile(spec, deadline).await;
            phase = status.phase;

            match phase {
                ClusterPhase::Failed | ClusterPhase::Destroyed => return status,
                _ => {}
            }

            let interval = phase_interval(phase);
            info!(
                "Cluster {} is {}; next reconcile in {}s",
                spec.name,
                phase,
                interval.as_secs()
            );
            tokio::time::sleep(interval).await;
        }
    }

    fn kubeconfig_path(&self) -> PathBuf {
        self.output_dir.join("kubeconfig")
    }

    fn load_last_applied(&self) -> Result<Option<ClusterSpec>> {
        let path = self.output_dir.join(LAST_APPLIED_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(Some(serde_yaml::from_str(&content)?))
    }

    fn save_last_applied(&self, spec: &ClusterSpec) -> Result<()> {
        std::fs::create_dir_all(&self.output_dir)?;
        let path = self.output_dir.join(LAST_APPLIED_FILE);
        std::fs::write(&path, serde_yaml::to_string(spec)?)?;
        Ok(())
    }

    fn remove_local_state(&self) -> Result<()> {
        for file in [
            SECRETS_FILE,
            "kubeconfig",
            "talosconfig",
            LAST_APPLIED_FILE,
            "id_ed25519",
        ] {
            let path = self.output_dir.join(file);
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        let nodes_dir = self.output_dir.join("nodes");
        if nodes_dir.exists() {
            std::fs::remove_dir_all(&nodes_dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;

    #[test]
    fn test_phase_deadlines() {
        assert_eq!(
            phase_deadline(ClusterPhase::Provisioning),
            Duration::from_secs(3600)
        );
        assert_eq!(
            phase_deadline(ClusterPhase::Scaling),
            Duration::from_secs(1800)
        );
        assert_eq!(
            phase_deadline(ClusterPhase::Running),
            Duration::from_secs(900)
        );
    }

    #[test]
    fn test_phase_intervals() {
        assert_eq!(
            phase_interval(ClusterPhase::Provisioning),
            Duration::from_secs(10)
        );
        assert_eq!(
            phase_interval(ClusterPhase::Running),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_mode_change_is_refused() {
        let previous = ClusterSpec::example();
        let mut next = previous.clone();
        next.mode = Mode::Ha;
        next.control_plane.count = 3;

        let err = guard_immutable_fields(&previous, &next).unwrap_err();
        assert_eq!(classify(&err), ErrorKind::Invariant);
    }

    #[test]
    fn test_unchanged_spec_passes_guard() {
        let spec = ClusterSpec::example();
        assert!(guard_immutable_fields(&spec, &spec.clone()).is_ok());
    }

    #[test]
    fn test_network_change_is_refused() {
        let previous = ClusterSpec::example();
        let mut next = previous.clone();
        next.network.cidr = "192.168.0.0/16".to_string();
        assert!(guard_immutable_fields(&previous, &next).is_err());
    }

    #[test]
    fn test_cluster_lock_is_shared_per_name() {
        let a = cluster_lock("c1");
        let b = cluster_lock("c1");
        let c = cluster_lock("c2");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
