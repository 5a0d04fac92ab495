/// Hetzner Cloud API data models
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Hetzner Cloud server resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub id: u64,
    pub name: String,
    pub status: String,
    pub server_type: ServerType,
    pub datacenter: Datacenter,
    pub public_net: PublicNetwork,
    pub private_net: Vec<PrivateNetwork>,
    pub created: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub image: Option<Image>,
    #[serde(default)]
    pub placement_group: Option<PlacementGroup>,
}

/// Server type information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerType {
    pub id: u64,
    pub name: String,
    pub description: String,
    pub cores: u32,
    pub memory: f64,
    pub disk: u64,
}

/// Datacenter information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Datacenter {
    pub id: u64,
    pub name: String,
    pub description: String,
    pub location: Location,
}

/// Location information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Location {
    pub id: u64,
    pub name: String,
    pub description: String,
    pub country: String,
    pub city: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Public network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicNetwork {
    pub ipv4: Option<IPv4>,
    pub ipv6: Option<IPv6>,
    pub floating_ips: Vec<u64>,
}

/// IPv4 address information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IPv4 {
    pub ip: String,
    pub blocked: bool,
}

/// IPv6 address information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IPv6 {
    pub ip: String,
    pub blocked: bool,
}

/// Private network attachment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivateNetwork {
    pub network: u64,
    pub ip: String,
    pub alias_ips: Vec<String>,
    pub mac_address: String,
}

/// Network resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub id: u64,
    pub name: String,
    pub ip_range: String,
    pub subnets: Vec<Subnet>,
    pub routes: Vec<Route>,
    pub servers: Vec<u64>,
    pub created: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Network subnet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subnet {
    pub ip_range: String,
    pub network_zone: String,
    pub gateway: String,
    #[serde(rename = "type")]
    pub subnet_type: String,
}

/// Network route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub destination: String,
    pub gateway: String,
}

/// SSH key resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SSHKey {
    pub id: u64,
    pub name: String,
    pub fingerprint: String,
    pub public_key: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub created: String,
}

/// Firewall resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Firewall {
    pub id: u64,
    pub name: String,
    pub rules: Vec<FirewallRule>,
    pub applied_to: Vec<FirewallResource>,
    pub created: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Firewall rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FirewallRule {
    pub direction: String,
    #[serde(default)]
    pub source_ips: Vec<String>,
    #[serde(default)]
    pub destination_ips: Vec<String>,
    pub protocol: String,
    pub port: Option<String>,
}

/// Firewall resource attachment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallResource {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub server: Option<FirewallServer>,
    #[serde(default)]
    pub label_selector: Option<LabelSelector>,
}

/// Firewall server reference
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallServer {
    pub id: u64,
}

/// Selector-shaped attachment target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelSelector {
    pub selector: String,
}

/// Load balancer resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub id: u64,
    pub name: String,
    pub public_net: LoadBalancerPublicNet,
    #[serde(default)]
    pub private_net: Vec<LoadBalancerPrivateNet>,
    pub load_balancer_type: LoadBalancerType,
    pub location: Location,
    #[serde(default)]
    pub services: Vec<LoadBalancerService>,
    #[serde(default)]
    pub targets: Vec<LoadBalancerTarget>,
    pub created: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerType {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerPublicNet {
    pub enabled: bool,
    pub ipv4: Option<LoadBalancerIp>,
    pub ipv6: Option<LoadBalancerIp>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerIp {
    pub ip: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerPrivateNet {
    pub network: u64,
    pub ip: String,
}

/// One listener: protocol + listen/destination ports + health check
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoadBalancerService {
    pub protocol: String,
    pub listen_port: u16,
    pub destination_port: u16,
    pub health_check: HealthCheck,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthCheck {
    pub protocol: String,
    pub port: u16,
    pub interval: u32,
    pub timeout: u32,
    pub retries: u32,
}

/// Load balancer target; servers are attached via label selector so node
/// replacement never touches the balancer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerTarget {
    #[serde(rename = "type")]
    pub target_type: String,
    #[serde(default)]
    pub label_selector: Option<LabelSelector>,
    #[serde(default)]
    pub use_private_ip: Option<bool>,
}

/// Placement group resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementGroup {
    pub id: u64,
    pub name: String,
    #[serde(rename = "type")]
    pub group_type: String,
    #[serde(default)]
    pub servers: Vec<u64>,
    pub created: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Uploaded TLS certificate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Certificate {
    pub id: u64,
    pub name: String,
    #[serde(rename = "type")]
    pub certificate_type: String,
    pub certificate: String,
    pub created: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Image (snapshots included)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub image_type: String,
    pub created: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Action represents an asynchronous operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: u64,
    pub command: String,
    pub status: String,
    pub progress: u32,
    pub started: String,
    pub finished: Option<String>,
    pub error: Option<ActionError>,
}

/// Action error details
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionError {
    pub code: String,
    pub message: String,
}

// Response envelopes

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateServerResponse {
    pub server: Server,
    pub action: Action,
    pub root_password: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateNetworkResponse {
    pub network: Network,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSSHKeyResponse {
    pub ssh_key: SSHKey,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateFirewallResponse {
    pub firewall: Firewall,
    #[serde(default)]
    pub actions: Vec<Action>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateLoadBalancerResponse {
    pub load_balancer: LoadBalancer,
    pub action: Action,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreatePlacementGroupResponse {
    pub placement_group: PlacementGroup,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateCertificateResponse {
    pub certificate: Certificate,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServerListResponse {
    pub servers: Vec<Server>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NetworkListResponse {
    pub networks: Vec<Network>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SSHKeyListResponse {
    pub ssh_keys: Vec<SSHKey>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FirewallListResponse {
    pub firewalls: Vec<Firewall>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoadBalancerListResponse {
    pub load_balancers: Vec<LoadBalancer>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PlacementGroupListResponse {
    pub placement_groups: Vec<PlacementGroup>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CertificateListResponse {
    pub certificates: Vec<Certificate>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ImageListResponse {
    pub images: Vec<Image>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ActionResponse {
    pub action: Action,
}

/// Error response from API
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ApiError,
}

/// API error details
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}
