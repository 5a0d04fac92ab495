/// Per-addon configuration surface
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Platform addons and their options. The CNI is enabled by default; every
/// other addon is opt-in.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AddonsSpec {
    pub cilium: CiliumAddon,
    pub ccm: CcmAddon,
    pub csi: CsiAddon,
    #[serde(rename = "metrics-server")]
    pub metrics_server: ToggleAddon,
    #[serde(rename = "ingress-traefik")]
    pub ingress_traefik: IngressAddon,
    #[serde(rename = "ingress-nginx")]
    pub ingress_nginx: IngressAddon,
    #[serde(rename = "cert-manager")]
    pub cert_manager: CertManagerAddon,
    #[serde(rename = "external-dns")]
    pub external_dns: ExternalDnsAddon,
    pub argocd: ArgoCdAddon,
    pub monitoring: MonitoringAddon,
    #[serde(rename = "talos-backup")]
    pub talos_backup: TalosBackupAddon,
}

/// An addon with no options beyond on/off.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ToggleAddon {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CiliumAddon {
    pub enabled: bool,
    pub encryption: bool,
    pub routing_mode: RoutingMode,
    pub kube_proxy_replacement: bool,
    pub hubble: HubbleConfig,
}

impl Default for CiliumAddon {
    fn default() -> Self {
        Self {
            enabled: true,
            encryption: false,
            routing_mode: RoutingMode::Tunnel,
            kube_proxy_replacement: true,
            hubble: HubbleConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    #[default]
    Tunnel,
    Native,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HubbleConfig {
    pub enabled: bool,
    pub ui: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CcmAddon {
    pub enabled: bool,
    pub load_balancer: CcmLoadBalancer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CcmLoadBalancer {
    pub enabled: bool,
    pub lb_type: String,
    pub algorithm: String,
    pub health_check: HealthCheckOptions,
    pub use_private_ip: bool,
}

impl Default for CcmLoadBalancer {
    fn default() -> Self {
        Self {
            enabled: true,
            lb_type: "lb11".to_string(),
            algorithm: "round_robin".to_string(),
            health_check: HealthCheckOptions::default(),
            use_private_ip: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckOptions {
    pub interval: u32,
    pub timeout: u32,
    pub retries: u32,
}

impl Default for HealthCheckOptions {
    fn default() -> Self {
        Self {
            interval: 10,
            timeout: 3,
            retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CsiAddon {
    pub enabled: bool,
    pub default_storage_class: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressAddon {
    pub enabled: bool,
    pub kind: WorkloadKind,
    pub replicas: u32,
    pub external_traffic_policy: String,
    pub config: HashMap<String, String>,
}

impl Default for IngressAddon {
    fn default() -> Self {
        Self {
            enabled: false,
            kind: WorkloadKind::Deployment,
            replicas: 2,
            external_traffic_policy: "Local".to_string(),
            config: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum WorkloadKind {
    #[default]
    Deployment,
    DaemonSet,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CertManagerAddon {
    pub enabled: bool,
    pub cloudflare: CloudflareConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CloudflareConfig {
    pub enabled: bool,
    pub email: String,
    pub production: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalDnsAddon {
    pub enabled: bool,
    pub provider: String,
    pub policy: DnsPolicy,
    pub sources: Vec<String>,
}

impl Default for ExternalDnsAddon {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: "cloudflare".to_string(),
            policy: DnsPolicy::UpsertOnly,
            sources: vec!["ingress".to_string(), "service".to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DnsPolicy {
    Sync,
    #[default]
    UpsertOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ArgoCdAddon {
    pub enabled: bool,
    pub ingress: ArgoIngress,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArgoIngress {
    pub enabled: bool,
    pub host: String,
    pub class_name: String,
    pub tls: bool,
}

impl Default for ArgoIngress {
    fn default() -> Self {
        Self {
            enabled: false,
            host: String::new(),
            class_name: "traefik".to_string(),
            tls: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MonitoringAddon {
    pub enabled: bool,
    pub grafana: GrafanaConfig,
    pub prometheus: PrometheusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GrafanaConfig {
    pub ingress: ArgoIngress,
    pub persistence: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PrometheusConfig {
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub size: String,
    pub storage_class: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            size: "20Gi".to_string(),
            storage_class: "hcloud-volumes".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TalosBackupAddon {
    pub enabled: bool,
    pub schedule: String,
}

impl Default for TalosBackupAddon {
    fn default() -> Self {
        Self {
            enabled: false,
            schedule: "0 3 * * *".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let addons = AddonsSpec::default();
        assert!(addons.cilium.enabled);
        assert!(!addons.ccm.enabled);
        assert!(!addons.talos_backup.enabled);
        assert_eq!(addons.external_dns.policy, DnsPolicy::UpsertOnly);
    }

    #[test]
    fn test_kebab_case_names_deserialize() {
        let yaml = r#"
cilium:
  enabled: true
  hubble:
    enabled: true
    ui: true
metrics-server:
  enabled: true
cert-manager:
  enabled: true
  cloudflare:
    enabled: true
    email: ops@example.com
    production: false
"#;
        let addons: AddonsSpec = serde_yaml::from_str(yaml).unwrap();
        assert!(addons.metrics_server.enabled);
        assert!(addons.cert_manager.cloudflare.enabled);
        assert!(addons.cilium.hubble.ui);
    }
}
