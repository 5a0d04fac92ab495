/// Talos Linux machine management
pub mod client;
pub mod machine_config;

pub use client::TalosClient;
pub use machine_config::{MachineConfigGenerator, NodeIdentity};
