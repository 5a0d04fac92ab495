/// Per-cluster secret material: Talos tokens and PKI roots
use anyhow::{Context, Result};
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::permanent;

pub const SECRETS_FILE: &str = "secrets.yaml";

/// An ed25519 certificate authority stored as PEM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PemPair {
    pub crt: String,
    pub key: String,
}

/// The secret bundle created once on the first reconcile of a cluster and
/// treated as immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Secrets {
    /// Name of the cluster this bundle belongs to; reconciles against any
    /// other cluster name are refused.
    pub cluster_name: String,

    /// Talos machine join token (id.secret form)
    pub machine_token: String,

    /// Kubernetes bootstrap token (id.secret form)
    pub bootstrap_token: String,

    /// Opaque cluster identity
    pub cluster_id: String,
    pub cluster_secret: String,

    /// Kubernetes secretbox encryption key
    pub secretbox_key: String,

    /// PKI roots
    pub machine_ca: PemPair,
    pub cluster_ca: PemPair,
    pub etcd_ca: PemPair,
    pub aggregator_ca: PemPair,
    pub service_account: PemPair,
}

impl Secrets {
    /// Generate a fresh bundle for a cluster.
    pub fn generate(cluster_name: &str) -> Result<Self> {
        Ok(Self {
            cluster_name: cluster_name.to_string(),
            machine_token: random_token(),
            bootstrap_token: random_token(),
            cluster_id: random_base64(32),
            cluster_secret: random_base64(32),
            secretbox_key: random_base64(32),
            machine_ca: generate_ca()?,
            cluster_ca: generate_ca()?,
            etcd_ca: generate_ca()?,
            aggregator_ca: generate_ca()?,
            service_account: generate_ca()?,
        })
    }

    /// Load the bundle for `cluster_name` from `dir`, or generate and
    /// persist one if none exists. A bundle belonging to a different
    /// cluster is a hard error rather than something we overwrite.
    pub fn load_or_generate(dir: &Path, cluster_name: &str) -> Result<Self> {
        let path = dir.join(SECRETS_FILE);
        if path.exists() {
            let secrets = Self::load(&path)?;
            if secrets.cluster_name != cluster_name {
                return Err(permanent(format!(
                    "secrets file {} belongs to cluster {:?}, refusing to reconcile {:?}",
                    path.display(),
                    secrets.cluster_name,
                    cluster_name
                )));
            }
            return Ok(secrets);
        }

        let secrets = Self::generate(cluster_name)?;
        secrets.save(&path)?;
        Ok(secrets)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read secrets file {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse secrets file {}", path.display()))
    }

    /// Write the bundle with owner-only permissions.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create output directory")?;
        }
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)
            .with_context(|| format!("Failed to write secrets file {}", path.display()))?;
        restrict_permissions(path)?;
        Ok(())
    }
}

/// Set 0600 on a secret-bearing file.
pub fn restrict_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path)
            .with_context(|| format!("Failed to stat {}", path.display()))?
            .permissions();
        perms.set_mode(0o600);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }
    Ok(())
}

/// Token in the id.secret form Talos and kubeadm use.
fn random_token() -> String {
    format!("{}.{}", random_alnum(6), random_alnum(16))
}

fn random_alnum(len: usize) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

fn random_base64(len: usize) -> String {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill(&mut bytes[..]);
    STANDARD.encode(bytes)
}

/// Generate an ed25519 root: PKCS#8 private key and SPKI public key, PEM.
fn generate_ca() -> Result<PemPair> {
    let signing_key = SigningKey::generate(&mut OsRng);
    let key = signing_key
        .to_pkcs8_pem(LineEnding::LF)
        .context("Failed to encode private key")?
        .to_string();
    let crt = signing_key
        .verifying_key()
        .to_public_key_pem(LineEnding::LF)
        .context("Failed to encode public key")?;
    Ok(PemPair { crt, key })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_shape() {
        let secrets = Secrets::generate("c1").unwrap();
        assert_eq!(secrets.cluster_name, "c1");
        assert_eq!(secrets.machine_token.split('.').count(), 2);
        assert!(secrets.machine_ca.key.contains("BEGIN PRIVATE KEY"));
        assert!(secrets.machine_ca.crt.contains("BEGIN PUBLIC KEY"));
        // Two bundles never collide.
        let other = Secrets::generate("c1").unwrap();
        assert_ne!(secrets.machine_token, other.machine_token);
        assert_ne!(secrets.machine_ca.key, other.machine_ca.key);
    }

    #[test]
    fn test_load_or_generate_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let first = Secrets::load_or_generate(dir.path(), "c1").unwrap();
        let second = Secrets::load_or_generate(dir.path(), "c1").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_cluster_name_mismatch_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        Secrets::load_or_generate(dir.path(), "c1").unwrap();
        let err = Secrets::load_or_generate(dir.path(), "c2").unwrap_err();
        assert_eq!(
            crate::error::classify(&err),
            crate::error::ErrorKind::Permanent
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_secrets_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        Secrets::load_or_generate(dir.path(), "c1").unwrap();
        let mode = std::fs::metadata(dir.path().join(SECRETS_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
