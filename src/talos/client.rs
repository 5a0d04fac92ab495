/// Talos machine API operations via talosctl
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::info;

use crate::error::retryable;
use crate::utils::command::CommandBuilder;
use crate::utils::polling::PollingConfig;

/// Per-attempt timeout for machine API calls; retries are the caller's job.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Talos client for machine operations
pub struct TalosClient {
    talosconfig_path: PathBuf,
}

impl TalosClient {
    /// Create a new Talos client
    pub fn new(talosconfig_path: PathBuf) -> Self {
        Self { talosconfig_path }
    }

    fn talosconfig(&self) -> String {
        self.talosconfig_path.to_string_lossy().to_string()
    }

    /// Check if talosctl is installed
    pub async fn check_talosctl_installed() -> Result<()> {
        crate::utils::command::check_tool_installed(
            "talosctl",
            &["version", "--client"],
            "https://www.talos.dev/latest/talos-guides/install/talosctl/",
        )
        .await
    }

    /// Query the Talos version of a node over mTLS.
    pub async fn get_version(&self, node_ip: &str) -> Result<String> {
        let output = CommandBuilder::new("talosctl")
            .args([
                "version",
                "--nodes",
                node_ip,
                "--talosconfig",
                &self.talosconfig(),
            ])
            .timeout(ATTEMPT_TIMEOUT)
            .output()
            .await
            .context("Failed to execute talosctl version")?;

        if !output.success {
            return Err(retryable(format!(
                "Talos API on {} unavailable: {}",
                node_ip,
                output.stderr.trim()
            )));
        }

        Ok(output.stdout)
    }

    /// A node that answers the insecure version probe is still in
    /// maintenance mode and has never received a machine config.
    pub async fn is_maintenance_mode(&self, node_ip: &str) -> Result<bool> {
        let output = CommandBuilder::new("talosctl")
            .args(["version", "--nodes", node_ip, "--insecure"])
            .timeout(ATTEMPT_TIMEOUT)
            .output()
            .await
            .context("Failed to execute talosctl version --insecure")?;

        Ok(output.success)
    }

    /// One-shot insecure apply, valid only against a maintenance-mode node.
    pub async fn apply_config_insecure(&self, node_ip: &str, config_path: &Path) -> Result<()> {
        info!("Applying machine config to {} (insecure bootstrap path)", node_ip);

        let output = CommandBuilder::new("talosctl")
            .args([
                "apply-config",
                "--insecure",
                "--nodes",
                node_ip,
                "--file",
                &config_path.to_string_lossy(),
            ])
            .timeout(ATTEMPT_TIMEOUT)
            .output()
            .await
            .context("Failed to execute talosctl apply-config --insecure")?;

        if !output.success {
            return Err(retryable(format!(
                "Insecure apply-config on {} failed: {}",
                node_ip,
                output.stderr.trim()
            )));
        }

        info!("Machine config applied to {}", node_ip);
        Ok(())
    }

    /// Apply (or re-apply) a machine config over mTLS.
    pub async fn apply_config(&self, node_ip: &str, config_path: &Path) -> Result<()> {
        info!("Applying machine config to {}", node_ip);

        let output = CommandBuilder::new("talosctl")
            .args([
                "apply-config",
                "--nodes",
                node_ip,
                "--talosconfig",
                &self.talosconfig(),
                "--file",
                &config_path.to_string_lossy(),
            ])
            .timeout(ATTEMPT_TIMEOUT)
            .output()
            .await
            .context("Failed to execute talosctl apply-config")?;

        if !output.success {
            return Err(retryable(format!(
                "apply-config on {} failed: {}",
                node_ip,
                output.stderr.trim()
            )));
        }

        info!("Machine config applied to {}", node_ip);
        Ok(())
    }

    /// Issue the etcd bootstrap call. Valid exactly once per cluster; a
    /// repeat returns a benign "already bootstrapped" that we fold into
    /// success. The real signal that bootstrap worked is the API server
    /// becoming reachable, which the caller watches separately.
    pub async fn bootstrap(&self, node_ip: &str) -> Result<()> {
        info!("Bootstrapping etcd on {}", node_ip);

        let output = CommandBuilder::new("talosctl")
            .args([
                "bootstrap",
                "--nodes",
                node_ip,
                "--talosconfig",
                &self.talosconfig(),
            ])
            .timeout(ATTEMPT_TIMEOUT)
            .output()
            .await
            .context("Failed to execute talosctl bootstrap")?;

        if !output.success {
            let stderr = output.stderr.to_lowercase();
            if stderr.contains("already") || stderr.contains("not empty") {
                info!("Cluster already bootstrapped");
                return Ok(());
            }
            return Err(retryable(format!(
                "Bootstrap on {} failed: {}",
                node_ip,
                output.stderr.trim()
            )));
        }

        info!("Etcd bootstrap issued on {}", node_ip);
        Ok(())
    }

    /// Reset a node so it can be reprovisioned. Graceful resets cordon,
    /// drain and leave etcd first; non-graceful resets just wipe.
    pub async fn reset_node(&self, node_ip: &str, graceful: bool) -> Result<()> {
        info!("Resetting node {} (graceful: {})", node_ip, graceful);

        let graceful_flag = format!("--graceful={}", graceful);
        let output = CommandBuilder::new("talosctl")
            .args([
                "-n",
                node_ip,
                "--talosconfig",
                &self.talosconfig(),
                "reset",
                &graceful_flag,
                "--wait=false",
            ])
            .timeout(ATTEMPT_TIMEOUT)
            .output()
            .await
            .context("Failed to execute talosctl reset")?;

        if !output.success {
            let stderr = output.stderr.to_lowercase();
            // The node powers down mid-stream; a dropped connection after a
            // successful dispatch is the expected shape of success.
            if stderr.contains("connection") || stderr.contains("timeout") {
                info!("Node {} powered down during reset", node_ip);
                return Ok(());
            }
            return Err(retryable(format!(
                "Reset of {} failed: {}",
                node_ip,
                output.stderr.trim()
            )));
        }

        info!("Node {} reset", node_ip);
        Ok(())
    }

    /// Wait until the machine API answers over mTLS.
    pub async fn wait_for_api(&self, node_ip: &str, deadline: Instant) -> Result<()> {
        let config = PollingConfig::until(
            deadline,
            5,
            format!("Waiting for Talos API on {}", node_ip),
        );
        config
            .poll_until(|| async { Ok(self.get_version(node_ip).await.is_ok()) })
            .await
    }

    /// Wait until a freshly booted node reports maintenance mode.
    pub async fn wait_for_maintenance(&self, node_ip: &str, deadline: Instant) -> Result<()> {
        let config = PollingConfig::until(
            deadline,
            5,
            format!("Waiting for maintenance mode on {}", node_ip),
        );
        config
            .poll_until(|| async { self.is_maintenance_mode(node_ip).await.or(Ok(false)) })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_check_talosctl() {
        // Informational: passes when talosctl is installed.
        let result = TalosClient::check_talosctl_installed().await;
        if result.is_err() {
            println!("talosctl not installed (expected in test environment)");
        }
    }

    #[test]
    fn test_talosconfig_path_rendering() {
        let client = TalosClient::new(PathBuf::from("/tmp/out/talosconfig"));
        assert_eq!(client.talosconfig(), "/tmp/out/talosconfig");
    }
}
