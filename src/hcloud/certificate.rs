/// Certificate management for Hetzner Cloud
use anyhow::{Context, Result};
use std::collections::HashMap;
use tracing::info;

use super::client::HetznerCloudClient;
use super::models::Certificate;
use crate::labels::selector;

/// Manager for uploaded certificates. The cluster keeps one, the state
/// marker, whose presence signals that cloud-side state exists for the
/// cluster.
pub struct CertificateManager {
    client: HetznerCloudClient,
}

impl CertificateManager {
    pub fn new(client: HetznerCloudClient) -> Self {
        Self { client }
    }

    /// Upload a certificate, reusing an existing one with the same labels.
    pub async fn ensure_certificate(
        &self,
        name: &str,
        cert_pem: &str,
        key_pem: &str,
        cert_labels: &HashMap<String, String>,
    ) -> Result<Certificate> {
        let existing = self
            .client
            .list_certificates(&selector(cert_labels))
            .await?;
        if let Some(cert) = existing.into_iter().find(|c| c.name == name) {
            info!(
                "Found existing certificate: {} (ID: {})",
                cert.name, cert.id
            );
            return Ok(cert);
        }

        info!("Uploading certificate {}", name);

        #[derive(serde::Serialize)]
        struct CreateCertificateRequest<'a> {
            name: &'a str,
            #[serde(rename = "type")]
            certificate_type: &'a str,
            certificate: &'a str,
            private_key: &'a str,
            labels: &'a HashMap<String, String>,
        }

        let cert = self
            .client
            .create_certificate(&CreateCertificateRequest {
                name,
                certificate_type: "uploaded",
                certificate: cert_pem,
                private_key: key_pem,
                labels: cert_labels,
            })
            .await
            .context("Failed to upload certificate")?;

        info!(
            "Certificate uploaded successfully: {} (ID: {})",
            cert.name, cert.id
        );

        Ok(cert)
    }
}
