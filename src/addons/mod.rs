/// Tiered, idempotent installation of platform addons
pub mod catalog;
pub mod render;

use anyhow::Result;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{info, warn};

use crate::config::ClusterSpec;
use crate::error::retryable;
use crate::k8s::KubernetesClient;
use crate::status::{AddonPhase, AddonStatus};
use crate::utils::limiter::{run_bounded, DEFAULT_WORKER_POOL};

use catalog::{AddonEntry, CATALOG};
use render::ManifestRenderer;

/// Values threaded into templates that do not come from the spec.
pub struct AddonContext {
    pub hcloud_token: String,
    pub location: String,
}

/// A declarative readiness gate the installer polls after apply.
#[derive(Debug, Clone)]
pub enum ReadinessCheck {
    Deployment { namespace: String, name: String },
    DaemonSet { namespace: String, selector: String },
}

impl ReadinessCheck {
    pub fn deployment(namespace: &str, name: &str) -> Self {
        Self::Deployment {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn daemon_set(namespace: &str, selector: &str) -> Self {
        Self::DaemonSet {
            namespace: namespace.to_string(),
            selector: selector.to_string(),
        }
    }
}

/// Installs the catalogue tier by tier and reports per-addon status.
pub struct AddonInstaller<'a> {
    spec: &'a ClusterSpec,
    kube: &'a KubernetesClient,
    renderer: ManifestRenderer,
    context: AddonContext,
}

impl<'a> AddonInstaller<'a> {
    pub fn new(
        spec: &'a ClusterSpec,
        kube: &'a KubernetesClient,
        context: AddonContext,
    ) -> Result<Self> {
        Ok(Self {
            spec,
            kube,
            renderer: ManifestRenderer::new()?,
            context,
        })
    }

    /// Apply every enabled addon in tier order. Within a tier, addons whose
    /// dependencies are healthy run concurrently. Returns the status map for
    /// the cluster report; only a failing hard addon (the CNI) fails the
    /// call itself.
    pub async fn ensure_addons(
        &self,
        deadline: Instant,
    ) -> Result<BTreeMap<String, AddonStatus>> {
        let mut statuses: BTreeMap<String, AddonStatus> = BTreeMap::new();

        let max_tier = CATALOG.iter().map(|e| e.tier).max().unwrap_or(0);

        for tier in 1..=max_tier {
            let mut pending: Vec<&AddonEntry> = CATALOG
                .iter()
                .filter(|e| e.tier == tier && (e.enabled)(self.spec))
                .collect();

            // Waves: run everything whose dependencies are already healthy,
            // repeat until the tier drains or nothing can move.
            while !pending.is_empty() {
                let (ready, blocked): (Vec<_>, Vec<_>) = pending
                    .into_iter()
                    .partition(|e| self.deps_satisfied(e, &statuses));

                if ready.is_empty() {
                    for entry in blocked {
                        statuses.insert(
                            entry.name.to_string(),
                            AddonStatus {
                                installed: false,
                                healthy: false,
                                phase: AddonPhase::Failed,
                                message: format!(
                                    "dependencies not healthy: {}",
                                    entry.depends_on.join(", ")
                                ),
                            },
                        );
                    }
                    break;
                }

                info!(
                    "Installing addon tier {}: {}",
                    tier,
                    ready
                        .iter()
                        .map(|e| e.name)
                        .collect::<Vec<_>>()
                        .join(", ")
                );

                let installs = ready
                    .iter()
                    .copied()
                    .map(|entry| self.install_one(entry, deadline))
                    .collect();
                let results = run_bounded(DEFAULT_WORKER_POOL, installs).await?;

                for (name, status) in results {
                    statuses.insert(name, status);
                }

                pending = blocked;
            }
        }

        // The CNI is the one hard dependency: nothing downstream can
        // converge without it.
        for entry in CATALOG.iter().filter(|e| e.hard) {
            if let Some(status) = statuses.get(entry.name) {
                if !status.healthy {
                    return Err(retryable(format!(
                        "hard addon {} is {}: {}",
                        entry.name,
                        match status.phase {
                            AddonPhase::Failed => "failed",
                            _ => "not healthy",
                        },
                        status.message
                    )));
                }
            }
        }

        Ok(statuses)
    }

    fn deps_satisfied(
        &self,
        entry: &AddonEntry,
        statuses: &BTreeMap<String, AddonStatus>,
    ) -> bool {
        entry.depends_on.iter().all(|dep| {
            // A disabled dependency never blocks its dependents.
            let dep_enabled = CATALOG
                .iter()
                .find(|e| e.name == *dep)
                .map(|e| (e.enabled)(self.spec))
                .unwrap_or(false);
            !dep_enabled || statuses.get(*dep).map(|s| s.healthy).unwrap_or(false)
        })
    }

    /// Render, apply, probe. Never returns Err: per-addon failures become
    /// status entries so one broken addon cannot hide the rest.
    async fn install_one(
        &self,
        entry: &AddonEntry,
        deadline: Instant,
    ) -> Result<(String, AddonStatus)> {
        let name = entry.name.to_string();
        let mut status = AddonStatus {
            installed: false,
            healthy: false,
            phase: AddonPhase::Installing,
            message: String::new(),
        };

        let data = (entry.data)(self.spec, &self.context);
        let manifests = match self.renderer.render(entry.name, &data) {
            Ok(m) => m,
            Err(e) => {
                warn!("Addon {} failed to render: {:#}", name, e);
                status.phase = AddonPhase::Failed;
                status.message = format!("render: {}", e);
                return Ok((name, status));
            }
        };

        if let Err(e) = self.kube.apply_manifests(&manifests).await {
            warn!("Addon {} failed to apply: {:#}", name, e);
            status.phase = AddonPhase::Failed;
            status.message = format!("apply: {}", e);
            return Ok((name, status));
        }
        status.installed = true;

        for check in (entry.checks)(self.spec) {
            let result = match &check {
                ReadinessCheck::Deployment { namespace, name } => {
                    self.kube
                        .wait_for_deployment(namespace, name, deadline)
                        .await
                }
                ReadinessCheck::DaemonSet {
                    namespace,
                    selector,
                } => {
                    self.kube
                        .wait_for_daemonset(namespace, selector, deadline)
                        .await
                }
            };

            if let Err(e) = result {
                status.phase = AddonPhase::Degraded;
                status.message = format!("{}", e);
                return Ok((name, status));
            }
        }

        status.healthy = true;
        status.phase = AddonPhase::Healthy;
        Ok((name, status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_check_constructors() {
        match ReadinessCheck::deployment("kube-system", "coredns") {
            ReadinessCheck::Deployment { namespace, name } => {
                assert_eq!(namespace, "kube-system");
                assert_eq!(name, "coredns");
            }
            _ => panic!("wrong variant"),
        }
    }
}
