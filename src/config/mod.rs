/// Cluster specification: the declarative desired state
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::invariant;

mod addons;
pub use addons::*;

/// Maximum cluster name length; names feed into server names which Hetzner
/// caps at 63 characters.
const MAX_CLUSTER_NAME: usize = 20;

/// Main cluster specification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSpec {
    /// Cluster name (used for resource naming and labels)
    pub name: String,

    /// Hetzner Cloud region
    pub region: Region,

    /// Deployment mode: dev (1 control plane) or ha (3 control planes)
    #[serde(default)]
    pub mode: Mode,

    /// Control plane pool
    pub control_plane: ControlPlaneSpec,

    /// Worker pools
    #[serde(default)]
    pub workers: Vec<WorkerPool>,

    /// Talos version tag (e.g., "v1.8.0")
    pub talos_version: String,

    /// Kubernetes version tag (e.g., "1.31.0")
    pub kubernetes_version: String,

    /// Private network layout
    pub network: NetworkSpec,

    /// Platform addons and their options
    #[serde(default)]
    pub addons: AddonsSpec,

    /// Etcd backup target (enables the talos-backup addon wiring)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupSpec>,

    /// Base domain for DNS/TLS integration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    /// Hostnames to expose through the ingress
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingress_hosts: Vec<String>,

    /// Hetzner Cloud API token (can also be set via HCLOUD_TOKEN env var)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hcloud_token: Option<String>,

    /// Snapshot ID of the Talos image servers boot from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub talos_snapshot_id: Option<String>,

    /// Source CIDRs allowed through the firewall; defaults to the caller's
    /// current IPv4 when empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub firewall_source_cidrs: Vec<String>,

    /// Seconds a node may be NotReady before replacement begins
    #[serde(default = "default_health_threshold")]
    pub health_threshold_secs: u64,

    /// Cleanup scoping id; derived from the name when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_id: Option<String>,

    /// Keep snapshots during destroy
    #[serde(default)]
    pub keep_snapshots: bool,
}

fn default_health_threshold() -> u64 {
    120
}

/// Hetzner Cloud regions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    Fsn1,
    Nbg1,
    Hel1,
    Ash,
    Hil,
    Sin,
}

impl Region {
    /// Location name as the cloud API expects it.
    pub fn location(&self) -> &'static str {
        match self {
            Region::Fsn1 => "fsn1",
            Region::Nbg1 => "nbg1",
            Region::Hel1 => "hel1",
            Region::Ash => "ash",
            Region::Hil => "hil",
            Region::Sin => "sin",
        }
    }

    /// Network zone the region belongs to.
    pub fn network_zone(&self) -> &'static str {
        match self {
            Region::Fsn1 | Region::Nbg1 | Region::Hel1 => "eu-central",
            Region::Ash | Region::Hil => "us-east",
            Region::Sin => "ap-southeast",
        }
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.location())
    }
}

/// Deployment mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Dev,
    Ha,
}

impl Mode {
    /// Control plane count the mode requires.
    pub fn control_plane_count(&self) -> u32 {
        match self {
            Mode::Dev => 1,
            Mode::Ha => 3,
        }
    }
}

/// Control plane pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneSpec {
    /// Number of control plane nodes (1 or 3; ha forces 3)
    pub count: u32,

    /// Hetzner server type (e.g., "cpx21")
    pub size: String,
}

/// Pool name used for control plane servers ({cluster}-cp-{ordinal}).
pub const CONTROL_PLANE_POOL: &str = "cp";

/// Worker pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPool {
    /// Pool name (part of server names)
    pub name: String,

    /// Desired node count; 0 empties the pool but keeps it in the spec
    pub count: u32,

    /// Hetzner server type (e.g., "cpx31")
    pub size: String,

    /// Spread members across physical hosts
    #[serde(default = "default_true")]
    pub placement_spread: bool,

    /// Additional node labels
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

/// Private network layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// RFC1918 IPv4 block for the private network (e.g., "10.0.0.0/16")
    pub cidr: String,
}

impl NetworkSpec {
    /// The node subnet: the first /24 of the network block.
    pub fn node_subnet(&self) -> anyhow::Result<String> {
        let (base, prefix) = parse_cidr(&self.cidr)?;
        if prefix > 24 {
            anyhow::bail!("network block {} too small for a /24 node subnet", self.cidr);
        }
        let mask = !0u32 << (32 - prefix);
        let subnet_base = base & mask;
        Ok(format!("{}/24", format_ip(subnet_base)))
    }

    /// Deterministic private IP of a control plane node. Ordinals are
    /// 1-based; .1 is the cloud gateway so control planes start at .11.
    pub fn control_plane_ip(&self, ordinal: u32) -> anyhow::Result<String> {
        let base = self.subnet_base()?;
        Ok(format_ip(base + 10 + ordinal))
    }

    /// Deterministic private IP of a worker: pool slots of 20 addresses
    /// starting at .51.
    pub fn worker_ip(&self, pool_index: usize, ordinal: u32) -> anyhow::Result<String> {
        let base = self.subnet_base()?;
        Ok(format_ip(base + 50 + (pool_index as u32) * 20 + ordinal))
    }

    fn subnet_base(&self) -> anyhow::Result<u32> {
        let (base, prefix) = parse_cidr(&self.cidr)?;
        let mask = !0u32 << (32 - prefix);
        Ok(base & mask)
    }
}

/// Etcd backup target. The schedule lives with the talos-backup addon
/// options; this is only where the artefacts go.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSpec {
    /// S3-compatible endpoint
    pub s3_endpoint: String,
    pub s3_region: String,
    pub s3_access_key: String,
    pub s3_secret_key: String,
}

impl ClusterSpec {
    /// Load a spec from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let spec: ClusterSpec = serde_yaml::from_str(&content)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Validate the specification
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.is_empty() || self.name.len() > MAX_CLUSTER_NAME {
            return Err(invariant(format!(
                "cluster name must be 1..={} characters, got {:?}",
                MAX_CLUSTER_NAME, self.name
            )));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(invariant(format!(
                "cluster name {:?} must match [a-z0-9-]+",
                self.name
            )));
        }

        match self.mode {
            Mode::Dev => {
                if self.control_plane.count != 1 {
                    return Err(invariant(format!(
                        "dev mode requires exactly 1 control plane, got {}",
                        self.control_plane.count
                    )));
                }
            }
            Mode::Ha => {
                if self.control_plane.count != 3 {
                    return Err(invariant(format!(
                        "ha mode requires exactly 3 control planes, got {}",
                        self.control_plane.count
                    )));
                }
            }
        }

        if self.workers.len() > 7 {
            return Err(invariant("at most 7 worker pools are supported"));
        }
        let mut seen = std::collections::HashSet::new();
        for pool in &self.workers {
            if pool.name.is_empty()
                || !pool
                    .name
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
            {
                return Err(invariant(format!(
                    "worker pool name {:?} must match [a-z0-9]+",
                    pool.name
                )));
            }
            if pool.name == CONTROL_PLANE_POOL {
                return Err(invariant("worker pool name 'cp' is reserved"));
            }
            if pool.count > 19 {
                return Err(invariant(format!(
                    "worker pool {} exceeds the 19-node pool limit",
                    pool.name
                )));
            }
            if !seen.insert(pool.name.clone()) {
                return Err(invariant(format!("duplicate worker pool {:?}", pool.name)));
            }
        }

        if let Some(backup) = &self.backup {
            url::Url::parse(&backup.s3_endpoint).map_err(|e| {
                invariant(format!(
                    "backup endpoint {:?} is not a valid URL: {}",
                    backup.s3_endpoint, e
                ))
            })?;
        }

        let (base, prefix) = parse_cidr(&self.network.cidr)?;
        if !(8..=24).contains(&prefix) {
            return Err(invariant(format!(
                "network prefix /{} outside the supported /8../24 range",
                prefix
            )));
        }
        if !is_rfc1918(base) {
            return Err(invariant(format!(
                "network block {} is not an RFC1918 range",
                self.network.cidr
            )));
        }

        Ok(())
    }

    /// Cleanup scoping id: explicit or derived from the cluster name.
    pub fn test_id(&self) -> String {
        self.test_id
            .clone()
            .unwrap_or_else(|| format!("{}-stable", self.name))
    }

    /// Get Hetzner Cloud API token from spec or environment
    pub fn get_hcloud_token(&self) -> anyhow::Result<String> {
        self.hcloud_token
            .clone()
            .or_else(|| std::env::var("HCLOUD_TOKEN").ok())
            .ok_or_else(|| {
                crate::error::permanent(
                    "Hetzner Cloud API token not found. Set HCLOUD_TOKEN or specify in the spec",
                )
            })
    }

    /// Worker pools sorted by name for stable ordering.
    pub fn sorted_workers(&self) -> Vec<&WorkerPool> {
        let mut pools: Vec<_> = self.workers.iter().collect();
        pools.sort_by(|a, b| a.name.cmp(&b.name));
        pools
    }

    /// Generate an example specification
    pub fn example() -> Self {
        Self {
            name: "talos-cluster".to_string(),
            region: Region::Nbg1,
            mode: Mode::Dev,
            control_plane: ControlPlaneSpec {
                count: 1,
                size: "cpx21".to_string(),
            },
            workers: vec![WorkerPool {
                name: "w".to_string(),
                count: 2,
                size: "cpx31".to_string(),
                placement_spread: true,
                labels: HashMap::new(),
            }],
            talos_version: "v1.8.0".to_string(),
            kubernetes_version: "1.31.0".to_string(),
            network: NetworkSpec {
                cidr: "10.0.0.0/16".to_string(),
            },
            addons: AddonsSpec::default(),
            backup: None,
            domain: None,
            ingress_hosts: vec![],
            hcloud_token: None,
            talos_snapshot_id: None,
            firewall_source_cidrs: vec![],
            health_threshold_secs: default_health_threshold(),
            test_id: None,
            keep_snapshots: false,
        }
    }
}

/// Parse dotted-quad CIDR notation into (address, prefix).
pub fn parse_cidr(cidr: &str) -> anyhow::Result<(u32, u8)> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| anyhow::anyhow!("invalid CIDR notation: {}", cidr))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid prefix in {}", cidr))?;
    if prefix > 32 {
        anyhow::bail!("invalid prefix in {}", cidr);
    }
    let octets: Vec<u8> = addr
        .split('.')
        .map(|o| o.parse::<u8>())
        .collect::<Result<_, _>>()
        .map_err(|_| anyhow::anyhow!("invalid address in {}", cidr))?;
    if octets.len() != 4 {
        anyhow::bail!("invalid address in {}", cidr);
    }
    let base = u32::from_be_bytes([octets[0], octets[1], octets[2], octets[3]]);
    Ok((base, prefix))
}

fn format_ip(addr: u32) -> String {
    let [a, b, c, d] = addr.to_be_bytes();
    format!("{}.{}.{}.{}", a, b, c, d)
}

fn is_rfc1918(addr: u32) -> bool {
    let [a, b, _, _] = addr.to_be_bytes();
    a == 10 || (a == 172 && (16..=31).contains(&b)) || (a == 192 && b == 168)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_validates() {
        assert!(ClusterSpec::example().validate().is_ok());
    }

    #[test]
    fn test_name_rules() {
        let mut spec = ClusterSpec::example();
        spec.name = String::new();
        assert!(spec.validate().is_err());

        spec.name = "UPPER".to_string();
        assert!(spec.validate().is_err());

        spec.name = "a".repeat(21);
        assert!(spec.validate().is_err());

        spec.name = "c1-prod".to_string();
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_mode_forces_control_plane_count() {
        let mut spec = ClusterSpec::example();
        spec.mode = Mode::Ha;
        spec.control_plane.count = 3;
        assert!(spec.validate().is_ok());

        spec.control_plane.count = 2;
        assert!(spec.validate().is_err());

        spec.mode = Mode::Dev;
        spec.control_plane.count = 3;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_network_rules() {
        let mut spec = ClusterSpec::example();
        spec.network.cidr = "8.8.8.0/24".to_string();
        assert!(spec.validate().is_err());

        spec.network.cidr = "192.168.0.0/16".to_string();
        assert!(spec.validate().is_ok());

        spec.network.cidr = "10.0.0.0/30".to_string();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_node_subnet_split() {
        let net = NetworkSpec {
            cidr: "10.0.0.0/16".to_string(),
        };
        assert_eq!(net.node_subnet().unwrap(), "10.0.0.0/24");
        assert_eq!(net.control_plane_ip(1).unwrap(), "10.0.0.11");
        assert_eq!(net.control_plane_ip(3).unwrap(), "10.0.0.13");
        assert_eq!(net.worker_ip(0, 1).unwrap(), "10.0.0.51");
        assert_eq!(net.worker_ip(1, 2).unwrap(), "10.0.0.72");
    }

    #[test]
    fn test_duplicate_pool_rejected() {
        let mut spec = ClusterSpec::example();
        spec.workers.push(spec.workers[0].clone());
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_pool_count_zero_is_valid() {
        let mut spec = ClusterSpec::example();
        spec.workers[0].count = 0;
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_sorted_workers_is_lexicographic() {
        let mut spec = ClusterSpec::example();
        spec.workers = vec![
            WorkerPool {
                name: "zeta".to_string(),
                count: 1,
                size: "cpx11".to_string(),
                placement_spread: true,
                labels: HashMap::new(),
            },
            WorkerPool {
                name: "alpha".to_string(),
                count: 1,
                size: "cpx11".to_string(),
                placement_spread: true,
                labels: HashMap::new(),
            },
        ];
        let sorted = spec.sorted_workers();
        assert_eq!(sorted[0].name, "alpha");
        assert_eq!(sorted[1].name, "zeta");
    }

    #[test]
    fn test_parse_cidr() {
        assert_eq!(parse_cidr("10.0.0.0/16").unwrap().1, 16);
        assert!(parse_cidr("10.0.0.0").is_err());
        assert!(parse_cidr("10.0.0/16").is_err());
        assert!(parse_cidr("10.0.0.0/33").is_err());
    }

    #[test]
    fn test_backup_endpoint_must_be_a_url() {
        let mut spec = ClusterSpec::example();
        spec.backup = Some(BackupSpec {
            s3_endpoint: "not a url".to_string(),
            s3_region: "eu-central-1".to_string(),
            s3_access_key: "key".to_string(),
            s3_secret_key: "secret".to_string(),
        });
        assert!(spec.validate().is_err());

        spec.backup.as_mut().unwrap().s3_endpoint = "https://s3.example.com".to_string();
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_example_round_trips() {
        let spec = ClusterSpec::example();
        let yaml = serde_yaml::to_string(&spec).unwrap();
        let back: ClusterSpec = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.name, spec.name);
        assert_eq!(back.control_plane.count, spec.control_plane.count);
    }
}
