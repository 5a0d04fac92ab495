/// Kubernetes cluster operations
pub mod client;
pub mod nodes;

pub use client::KubernetesClient;
pub use nodes::{NodeInfo, NodeManager};
