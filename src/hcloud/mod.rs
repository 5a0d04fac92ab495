/// Hetzner Cloud API client implementation
pub mod certificate;
pub mod client;
pub mod firewall;
pub mod load_balancer;
pub mod models;
pub mod network;
pub mod placement;
pub mod server;
pub mod ssh_key;

pub use certificate::CertificateManager;
pub use client::HetznerCloudClient;
pub use firewall::FirewallManager;
pub use load_balancer::LoadBalancerManager;
pub use network::NetworkManager;
pub use placement::PlacementGroupManager;
pub use server::ServerManager;
pub use ssh_key::SSHKeyManager;
