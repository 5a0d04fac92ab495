/// The ordered addon catalogue
use serde_json::{json, Value};

use crate::config::{ClusterSpec, DnsPolicy, WorkloadKind};
use crate::labels::backup_bucket_name;

use super::{AddonContext, ReadinessCheck};

/// One entry in the catalogue. Tiers install strictly in order; entries
/// within a tier run in parallel once their dependencies are healthy.
pub struct AddonEntry {
    pub name: &'static str,
    pub tier: u8,
    /// A hard addon failing fails the whole reconcile. Only the CNI is hard.
    pub hard: bool,
    pub depends_on: &'static [&'static str],
    pub enabled: fn(&ClusterSpec) -> bool,
    pub data: fn(&ClusterSpec, &AddonContext) -> Value,
    pub checks: fn(&ClusterSpec) -> Vec<ReadinessCheck>,
}

/// Install order:
/// 1. CNI blocks everything.
/// 2. CCM so nodes get provider IDs before schedulers care.
/// 3. Storage, metrics, ingress.
/// 4. Cert issuance, then DNS wired to it.
/// 5. GitOps and monitoring.
/// 6. Scheduled backup.
pub const CATALOG: &[AddonEntry] = &[
    AddonEntry {
        name: "cilium",
        tier: 1,
        hard: true,
        depends_on: &[],
        enabled: |spec| spec.addons.cilium.enabled,
        data: cilium_data,
        checks: |_| {
            vec![
                ReadinessCheck::daemon_set("kube-system", "k8s-app=cilium"),
                ReadinessCheck::deployment("kube-system", "cilium-operator"),
            ]
        },
    },
    AddonEntry {
        name: "ccm",
        tier: 2,
        hard: false,
        depends_on: &["cilium"],
        enabled: |spec| spec.addons.ccm.enabled,
        data: ccm_data,
        checks: |_| {
            vec![ReadinessCheck::deployment(
                "kube-system",
                "hcloud-cloud-controller-manager",
            )]
        },
    },
    AddonEntry {
        name: "csi",
        tier: 3,
        hard: false,
        depends_on: &[],
        enabled: |spec| spec.addons.csi.enabled,
        data: |spec, _| {
            json!({
                "default_storage_class": spec.addons.csi.default_storage_class,
            })
        },
        checks: |_| {
            vec![
                ReadinessCheck::deployment("kube-system", "hcloud-csi-controller"),
                ReadinessCheck::daemon_set("kube-system", "app=hcloud-csi-node"),
            ]
        },
    },
    AddonEntry {
        name: "metrics-server",
        tier: 3,
        hard: false,
        depends_on: &[],
        enabled: |spec| spec.addons.metrics_server.enabled,
        data: |_, _| json!({}),
        checks: |_| vec![ReadinessCheck::deployment("kube-system", "metrics-server")],
    },
    AddonEntry {
        name: "ingress-traefik",
        tier: 3,
        hard: false,
        depends_on: &[],
        enabled: |spec| spec.addons.ingress_traefik.enabled,
        data: |spec, ctx| ingress_data(&spec.addons.ingress_traefik, ctx),
        checks: |spec| ingress_checks(&spec.addons.ingress_traefik, "traefik", "traefik"),
    },
    AddonEntry {
        name: "ingress-nginx",
        tier: 3,
        hard: false,
        depends_on: &[],
        enabled: |spec| spec.addons.ingress_nginx.enabled,
        data: |spec, ctx| ingress_data(&spec.addons.ingress_nginx, ctx),
        checks: |spec| {
            ingress_checks(
                &spec.addons.ingress_nginx,
                "ingress-nginx",
                "ingress-nginx-controller",
            )
        },
    },
    AddonEntry {
        name: "cert-manager",
        tier: 4,
        hard: false,
        depends_on: &[],
        enabled: |spec| spec.addons.cert_manager.enabled,
        data: |spec, _| {
            json!({
                "cloudflare_enabled": spec.addons.cert_manager.cloudflare.enabled,
                "cloudflare_email": spec.addons.cert_manager.cloudflare.email,
                "production": spec.addons.cert_manager.cloudflare.production,
            })
        },
        checks: |_| {
            vec![
                ReadinessCheck::deployment("cert-manager", "cert-manager"),
                ReadinessCheck::deployment("cert-manager", "cert-manager-webhook"),
            ]
        },
    },
    AddonEntry {
        name: "external-dns",
        tier: 4,
        hard: false,
        depends_on: &["cert-manager"],
        enabled: |spec| spec.addons.external_dns.enabled,
        data: |spec, _| {
            json!({
                "provider": spec.addons.external_dns.provider,
                "policy": dns_policy(spec.addons.external_dns.policy),
                "sources": spec.addons.external_dns.sources,
                "owner_id": spec.name,
                "domain": spec.domain,
            })
        },
        checks: |_| vec![ReadinessCheck::deployment("kube-system", "external-dns")],
    },
    AddonEntry {
        name: "argocd",
        tier: 5,
        hard: false,
        depends_on: &[],
        enabled: |spec| spec.addons.argocd.enabled,
        data: |spec, _| {
            json!({
                "ingress_enabled": spec.addons.argocd.ingress.enabled,
                "ingress_host": spec.addons.argocd.ingress.host,
                "ingress_class": spec.addons.argocd.ingress.class_name,
                "ingress_tls": spec.addons.argocd.ingress.tls,
            })
        },
        checks: |_| {
            vec![
                ReadinessCheck::deployment("argocd", "argocd-server"),
                ReadinessCheck::deployment("argocd", "argocd-repo-server"),
            ]
        },
    },
    AddonEntry {
        name: "monitoring",
        tier: 5,
        hard: false,
        depends_on: &[],
        enabled: |spec| spec.addons.monitoring.enabled,
        data: |spec, _| {
            let prom = &spec.addons.monitoring.prometheus.persistence;
            json!({
                "prometheus_persistence": prom.enabled,
                "prometheus_size": prom.size,
                "prometheus_storage_class": prom.storage_class,
            })
        },
        checks: |_| {
            vec![
                ReadinessCheck::deployment("monitoring", "prometheus"),
                ReadinessCheck::deployment("monitoring", "grafana"),
                ReadinessCheck::deployment("monitoring", "alertmanager"),
            ]
        },
    },
    AddonEntry {
        name: "talos-backup",
        tier: 6,
        hard: false,
        depends_on: &[],
        enabled: |spec| spec.addons.talos_backup.enabled && spec.backup.is_some(),
        data: |spec, _| match &spec.backup {
            Some(backup) => json!({
                "schedule": spec.addons.talos_backup.schedule,
                "s3_endpoint": backup.s3_endpoint,
                "s3_region": backup.s3_region,
                "s3_access_key": backup.s3_access_key,
                "s3_secret_key": backup.s3_secret_key,
                "bucket": backup_bucket_name(&spec.name),
                "cluster": spec.name,
            }),
            None => json!({}),
        },
        // A CronJob has nothing to wait for; applied means installed.
        checks: |_| vec![],
    },
];

fn cilium_data(spec: &ClusterSpec, _ctx: &AddonContext) -> Value {
    let cilium = &spec.addons.cilium;
    json!({
        "kube_proxy_replacement": cilium.kube_proxy_replacement,
        "routing_mode": match cilium.routing_mode {
            crate::config::RoutingMode::Tunnel => "tunnel",
            crate::config::RoutingMode::Native => "native",
        },
        "encryption": cilium.encryption,
        "hubble_enabled": cilium.hubble.enabled,
        "hubble_ui": cilium.hubble.ui,
        "operator_replicas": if spec.control_plane.count > 1 { 2 } else { 1 },
    })
}

fn ccm_data(spec: &ClusterSpec, ctx: &AddonContext) -> Value {
    let lb = &spec.addons.ccm.load_balancer;
    json!({
        "token": ctx.hcloud_token,
        "network_name": crate::labels::network_name(&spec.name),
        "lb_enabled": lb.enabled,
        "lb_type": lb.lb_type,
        "lb_algorithm": lb.algorithm,
        "lb_use_private_ip": lb.use_private_ip,
        "lb_health_interval": lb.health_check.interval,
        "lb_health_timeout": lb.health_check.timeout,
        "lb_health_retries": lb.health_check.retries,
    })
}

fn ingress_data(addon: &crate::config::IngressAddon, ctx: &AddonContext) -> Value {
    json!({
        "daemonset": addon.kind == WorkloadKind::DaemonSet,
        "replicas": addon.replicas,
        "external_traffic_policy": addon.external_traffic_policy,
        "config": addon.config,
        "location": ctx.location,
    })
}

fn ingress_checks(
    addon: &crate::config::IngressAddon,
    namespace: &str,
    workload: &str,
) -> Vec<ReadinessCheck> {
    match addon.kind {
        WorkloadKind::Deployment => vec![ReadinessCheck::deployment(namespace, workload)],
        WorkloadKind::DaemonSet => vec![ReadinessCheck::daemon_set(
            namespace,
            &format!("app={}", workload),
        )],
    }
}

fn dns_policy(policy: DnsPolicy) -> &'static str {
    match policy {
        DnsPolicy::Sync => "sync",
        DnsPolicy::UpsertOnly => "upsert-only",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_tiers_are_ordered() {
        let mut last = 0;
        for entry in CATALOG {
            assert!(entry.tier >= last, "{} out of tier order", entry.name);
            last = entry.tier;
        }
    }

    #[test]
    fn test_only_cni_is_hard() {
        let hard: Vec<_> = CATALOG.iter().filter(|e| e.hard).map(|e| e.name).collect();
        assert_eq!(hard, vec!["cilium"]);
    }

    #[test]
    fn test_dependencies_resolve_to_earlier_or_same_tier() {
        for entry in CATALOG {
            for dep in entry.depends_on {
                let dep_entry = CATALOG
                    .iter()
                    .find(|e| e.name == *dep)
                    .unwrap_or_else(|| panic!("{} depends on unknown {}", entry.name, dep));
                assert!(dep_entry.tier <= entry.tier);
            }
        }
    }

    #[test]
    fn test_enabled_defaults() {
        let spec = ClusterSpec::example();
        let enabled: Vec<_> = CATALOG
            .iter()
            .filter(|e| (e.enabled)(&spec))
            .map(|e| e.name)
            .collect();
        assert_eq!(enabled, vec!["cilium"]);
    }

    #[test]
    fn test_backup_requires_target() {
        let mut spec = ClusterSpec::example();
        spec.addons.talos_backup.enabled = true;
        let backup = CATALOG.iter().find(|e| e.name == "talos-backup").unwrap();
        assert!(!(backup.enabled)(&spec));

        spec.backup = Some(crate::config::BackupSpec {
            s3_endpoint: "https://s3.example.com".to_string(),
            s3_region: "eu-central-1".to_string(),
            s3_access_key: "key".to_string(),
            s3_secret_key: "secret".to_string(),
        });
        assert!((backup.enabled)(&spec));
    }
}
