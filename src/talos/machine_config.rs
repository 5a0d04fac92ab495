/// Deterministic machine configuration rendering
///
/// Rendering is a pure function of (spec, secrets, role, identity): the same
/// inputs always produce byte-identical YAML. Idempotent re-apply depends on
/// this property, so nothing here may read clocks, environment, or randomness.
use anyhow::Result;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::config::{ClusterSpec, Mode};
use crate::hcloud::server::NodeRole;
use crate::secrets::{PemPair, Secrets};

/// Identity of the node a config is rendered for.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub name: String,
    pub private_ip: String,
    pub pool: String,
    pub ordinal: u32,
    /// The first control plane: the only node that seeds etcd.
    pub bootstrap: bool,
}

/// Machine configuration generator bound to one cluster endpoint.
pub struct MachineConfigGenerator<'a> {
    spec: &'a ClusterSpec,
    secrets: &'a Secrets,
    /// Load balancer IPv4 fronting the Kubernetes API.
    endpoint_ip: String,
}

impl<'a> MachineConfigGenerator<'a> {
    pub fn new(spec: &'a ClusterSpec, secrets: &'a Secrets, endpoint_ip: &str) -> Self {
        Self {
            spec,
            secrets,
            endpoint_ip: endpoint_ip.to_string(),
        }
    }

    /// Render the machine config document for one node.
    pub fn render(&self, role: NodeRole, identity: &NodeIdentity) -> Result<String> {
        let doc = self.build(role, identity)?;
        let yaml = serde_yaml::to_string(&doc)?;
        Ok(yaml)
    }

    fn build(&self, role: NodeRole, identity: &NodeIdentity) -> Result<MachineConfigDoc> {
        let is_cp = role == NodeRole::ControlPlane;

        let mut node_labels = BTreeMap::new();
        node_labels.insert("patina.dev/pool".to_string(), identity.pool.clone());
        node_labels.insert(
            "patina.dev/ordinal".to_string(),
            identity.ordinal.to_string(),
        );

        let mut kubelet_args = BTreeMap::new();
        kubelet_args.insert("rotate-server-certificates".to_string(), "true".to_string());
        if self.spec.addons.ccm.enabled {
            kubelet_args.insert("cloud-provider".to_string(), "external".to_string());
        }

        let mut mirrors = BTreeMap::new();
        mirrors.insert(
            "docker.io".to_string(),
            RegistryMirror {
                endpoints: vec!["https://mirror.gcr.io".to_string()],
            },
        );

        let machine = MachineSection {
            machine_type: match role {
                NodeRole::ControlPlane => "controlplane",
                NodeRole::Worker => "worker",
            }
            .to_string(),
            token: self.secrets.machine_token.clone(),
            ca: CaSection {
                crt: b64(&self.secrets.machine_ca.crt),
                // Only control planes hold the signing half.
                key: is_cp.then(|| b64(&self.secrets.machine_ca.key)),
            },
            cert_sans: vec![self.endpoint_ip.clone(), identity.private_ip.clone()],
            kubelet: KubeletSection {
                image: format!(
                    "ghcr.io/siderolabs/kubelet:v{}",
                    self.spec.kubernetes_version
                ),
                extra_args: kubelet_args,
            },
            network: MachineNetwork {
                hostname: identity.name.clone(),
            },
            install: InstallSection {
                disk: "/dev/sda".to_string(),
                image: format!(
                    "ghcr.io/siderolabs/installer:{}",
                    self.spec.talos_version
                ),
                wipe: false,
            },
            node_labels,
            registries: RegistriesSection { mirrors },
        };

        let cluster = ClusterSection {
            id: self.secrets.cluster_id.clone(),
            secret: self.secrets.cluster_secret.clone(),
            cluster_name: self.spec.name.clone(),
            control_plane: ControlPlaneEndpoint {
                endpoint: format!("https://{}:6443", self.endpoint_ip),
            },
            network: ClusterNetwork {
                dns_domain: "cluster.local".to_string(),
                pod_subnets: vec!["10.244.0.0/16".to_string()],
                service_subnets: vec!["10.96.0.0/12".to_string()],
                cni: CniSection {
                    name: "none".to_string(),
                },
            },
            token: self.secrets.bootstrap_token.clone(),
            secretbox_encryption_secret: self.secrets.secretbox_key.clone(),
            ca: CaSection {
                crt: b64(&self.secrets.cluster_ca.crt),
                key: is_cp.then(|| b64(&self.secrets.cluster_ca.key)),
            },
            aggregator_ca: is_cp.then(|| full_ca(&self.secrets.aggregator_ca)),
            service_account: is_cp.then(|| KeySection {
                key: b64(&self.secrets.service_account.key),
            }),
            api_server: is_cp.then(|| ImageSection {
                image: format!(
                    "registry.k8s.io/kube-apiserver:v{}",
                    self.spec.kubernetes_version
                ),
            }),
            controller_manager: is_cp.then(|| ImageSection {
                image: format!(
                    "registry.k8s.io/kube-controller-manager:v{}",
                    self.spec.kubernetes_version
                ),
            }),
            scheduler: is_cp.then(|| ImageSection {
                image: format!(
                    "registry.k8s.io/kube-scheduler:v{}",
                    self.spec.kubernetes_version
                ),
            }),
            proxy: ProxySection {
                disabled: self.spec.addons.cilium.kube_proxy_replacement,
            },
            etcd: is_cp.then(|| EtcdSection {
                ca: full_ca(&self.secrets.etcd_ca),
                // The bootstrap node seeds the member list; every other
                // control plane joins through the discovery flow.
                initial_cluster: identity.bootstrap.then(|| {
                    format!("{}=https://{}:2380", identity.name, identity.private_ip)
                }),
            }),
            allow_scheduling_on_control_planes: self.spec.mode == Mode::Dev,
        };

        Ok(MachineConfigDoc {
            version: "v1alpha1".to_string(),
            machine,
            cluster,
        })
    }
}

fn b64(pem: &str) -> String {
    STANDARD.encode(pem.as_bytes())
}

fn full_ca(pair: &PemPair) -> CaSection {
    CaSection {
        crt: b64(&pair.crt),
        key: Some(b64(&pair.key)),
    }
}

// Serialized document shape. Field order here is the byte order of the
// output, so reorder only with care.

#[derive(Debug, Serialize)]
struct MachineConfigDoc {
    version: String,
    machine: MachineSection,
    cluster: ClusterSection,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MachineSection {
    #[serde(rename = "type")]
    machine_type: String,
    token: String,
    ca: CaSection,
    #[serde(rename = "certSANs")]
    cert_sans: Vec<String>,
    kubelet: KubeletSection,
    network: MachineNetwork,
    install: InstallSection,
    node_labels: BTreeMap<String, String>,
    registries: RegistriesSection,
}

#[derive(Debug, Serialize)]
struct CaSection {
    crt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct KubeletSection {
    image: String,
    extra_args: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct MachineNetwork {
    hostname: String,
}

#[derive(Debug, Serialize)]
struct InstallSection {
    disk: String,
    image: String,
    wipe: bool,
}

#[derive(Debug, Serialize)]
struct RegistriesSection {
    mirrors: BTreeMap<String, RegistryMirror>,
}

#[derive(Debug, Serialize)]
struct RegistryMirror {
    endpoints: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClusterSection {
    id: String,
    secret: String,
    cluster_name: String,
    control_plane: ControlPlaneEndpoint,
    network: ClusterNetwork,
    token: String,
    secretbox_encryption_secret: String,
    ca: CaSection,
    #[serde(rename = "aggregatorCA", skip_serializing_if = "Option::is_none")]
    aggregator_ca: Option<CaSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    service_account: Option<KeySection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_server: Option<ImageSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    controller_manager: Option<ImageSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scheduler: Option<ImageSection>,
    proxy: ProxySection,
    #[serde(skip_serializing_if = "Option::is_none")]
    etcd: Option<EtcdSection>,
    allow_scheduling_on_control_planes: bool,
}

#[derive(Debug, Serialize)]
struct ControlPlaneEndpoint {
    endpoint: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClusterNetwork {
    dns_domain: String,
    pod_subnets: Vec<String>,
    service_subnets: Vec<String>,
    cni: CniSection,
}

#[derive(Debug, Serialize)]
struct CniSection {
    name: String,
}

#[derive(Debug, Serialize)]
struct KeySection {
    key: String,
}

#[derive(Debug, Serialize)]
struct ImageSection {
    image: String,
}

#[derive(Debug, Serialize)]
struct ProxySection {
    disabled: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EtcdSection {
    ca: CaSection,
    #[serde(skip_serializing_if = "Option::is_none")]
    initial_cluster: Option<String>,
}

/// Render the admin talosconfig pointing at the given endpoints.
pub fn render_talosconfig(secrets: &Secrets, endpoints: &[String]) -> Result<String> {
    #[derive(Serialize)]
    struct TalosConfig {
        context: String,
        contexts: BTreeMap<String, TalosContext>,
    }

    #[derive(Serialize)]
    struct TalosContext {
        endpoints: Vec<String>,
        nodes: Vec<String>,
        ca: String,
        crt: String,
        key: String,
    }

    let mut contexts = BTreeMap::new();
    contexts.insert(
        secrets.cluster_name.clone(),
        TalosContext {
            endpoints: endpoints.to_vec(),
            nodes: endpoints.first().cloned().into_iter().collect(),
            ca: b64(&secrets.machine_ca.crt),
            crt: b64(&secrets.machine_ca.crt),
            key: b64(&secrets.machine_ca.key),
        },
    );

    let config = TalosConfig {
        context: secrets.cluster_name.clone(),
        contexts,
    };
    Ok(serde_yaml::to_string(&config)?)
}

/// Render the admin kubeconfig for the cluster endpoint.
pub fn render_kubeconfig(secrets: &Secrets, endpoint_ip: &str) -> Result<String> {
    #[derive(Serialize)]
    #[serde(rename_all = "kebab-case")]
    struct KubeConfig {
        api_version: String,
        kind: String,
        clusters: Vec<NamedCluster>,
        contexts: Vec<NamedContext>,
        current_context: String,
        users: Vec<NamedUser>,
    }

    #[derive(Serialize)]
    struct NamedCluster {
        name: String,
        cluster: ClusterEntry,
    }

    #[derive(Serialize)]
    #[serde(rename_all = "kebab-case")]
    struct ClusterEntry {
        server: String,
        certificate_authority_data: String,
    }

    #[derive(Serialize)]
    struct NamedContext {
        name: String,
        context: ContextEntry,
    }

    #[derive(Serialize)]
    struct ContextEntry {
        cluster: String,
        user: String,
    }

    #[derive(Serialize)]
    struct NamedUser {
        name: String,
        user: UserEntry,
    }

    #[derive(Serialize)]
    #[serde(rename_all = "kebab-case")]
    struct UserEntry {
        client_certificate_data: String,
        client_key_data: String,
    }

    let name = secrets.cluster_name.clone();
    let user = format!("admin@{}", name);

    let config = KubeConfig {
        api_version: "v1".to_string(),
        kind: "Config".to_string(),
        clusters: vec![NamedCluster {
            name: name.clone(),
            cluster: ClusterEntry {
                server: format!("https://{}:6443", endpoint_ip),
                certificate_authority_data: b64(&secrets.cluster_ca.crt),
            },
        }],
        contexts: vec![NamedContext {
            name: user.clone(),
            context: ContextEntry {
                cluster: name,
                user: user.clone(),
            },
        }],
        current_context: user.clone(),
        users: vec![NamedUser {
            name: user,
            user: UserEntry {
                client_certificate_data: b64(&secrets.cluster_ca.crt),
                client_key_data: b64(&secrets.cluster_ca.key),
            },
        }],
    };
    Ok(serde_yaml::to_string(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterSpec;

    fn fixture() -> (ClusterSpec, Secrets) {
        let spec = ClusterSpec::example();
        let secrets = Secrets::generate(&spec.name).unwrap();
        (spec, secrets)
    }

    fn identity(bootstrap: bool) -> NodeIdentity {
        NodeIdentity {
            name: "talos-cluster-cp-1".to_string(),
            private_ip: "10.0.0.11".to_string(),
            pool: "cp".to_string(),
            ordinal: 1,
            bootstrap,
        }
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let (spec, secrets) = fixture();
        let generator = MachineConfigGenerator::new(&spec, &secrets, "203.0.113.10");
        let a = generator
            .render(NodeRole::ControlPlane, &identity(true))
            .unwrap();
        let b = generator
            .render(NodeRole::ControlPlane, &identity(true))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_bootstrap_node_seeds_etcd() {
        let (spec, secrets) = fixture();
        let generator = MachineConfigGenerator::new(&spec, &secrets, "203.0.113.10");
        let boot = generator
            .render(NodeRole::ControlPlane, &identity(true))
            .unwrap();
        assert!(boot.contains("initialCluster"));
        assert!(boot.contains("talos-cluster-cp-1=https://10.0.0.11:2380"));

        let peer = generator
            .render(NodeRole::ControlPlane, &identity(false))
            .unwrap();
        assert!(!peer.contains("initialCluster"));
    }

    #[test]
    fn test_worker_has_no_signing_material() {
        let (spec, secrets) = fixture();
        let generator = MachineConfigGenerator::new(&spec, &secrets, "203.0.113.10");
        let worker = generator
            .render(
                NodeRole::Worker,
                &NodeIdentity {
                    name: "talos-cluster-w-1".to_string(),
                    private_ip: "10.0.0.51".to_string(),
                    pool: "w".to_string(),
                    ordinal: 1,
                    bootstrap: false,
                },
            )
            .unwrap();
        assert!(worker.contains("type: worker"));
        assert!(!worker.contains("aggregatorCA"));
        assert!(!worker.contains("serviceAccount"));
        assert!(!worker.contains("etcd"));
    }

    #[test]
    fn test_endpoint_and_versions_are_pinned() {
        let (spec, secrets) = fixture();
        let generator = MachineConfigGenerator::new(&spec, &secrets, "203.0.113.10");
        let config = generator
            .render(NodeRole::ControlPlane, &identity(true))
            .unwrap();
        assert!(config.contains("endpoint: https://203.0.113.10:6443"));
        assert!(config.contains(&format!(
            "ghcr.io/siderolabs/installer:{}",
            spec.talos_version
        )));
        assert!(config.contains(&format!(
            "ghcr.io/siderolabs/kubelet:v{}",
            spec.kubernetes_version
        )));
        // The CNI is installed by the addon engine, not by Talos.
        assert!(config.contains("name: none"));
    }

    #[test]
    fn test_client_configs_render() {
        let (_, secrets) = fixture();
        let talosconfig =
            render_talosconfig(&secrets, &["203.0.113.11".to_string()]).unwrap();
        assert!(talosconfig.contains("endpoints:"));
        assert!(talosconfig.contains("203.0.113.11"));

        let kubeconfig = render_kubeconfig(&secrets, "203.0.113.10").unwrap();
        assert!(kubeconfig.contains("server: https://203.0.113.10:6443"));
        assert!(kubeconfig.contains("current-context: admin@talos-cluster"));
    }
}
