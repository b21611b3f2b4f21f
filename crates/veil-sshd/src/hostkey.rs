//! Host key persistence
//!
//! The server's host identity is an Ed25519 keypair stored in PKCS#8 PEM
//! at a configured path. An existing key is reused across restarts so
//! clients see a stable host identity.

use std::path::Path;

use anyhow::{Context, Result};
use russh_keys::key::KeyPair;

/// Load the host key from `path`, generating and persisting a new one
/// if the file does not exist.
pub async fn load_or_generate(path: &Path) -> Result<KeyPair> {
    if path.exists() {
        tracing::info!("Loading host key from {:?}", path);
        let key = russh_keys::load_secret_key(path, None)
            .with_context(|| format!("Failed to load host key from {:?}", path))?;
        return Ok(key);
    }

    tracing::info!("Generating new host key at {:?}", path);

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let key = KeyPair::generate_ed25519()
        .ok_or_else(|| anyhow::anyhow!("Failed to generate Ed25519 key"))?;

    let mut pem = Vec::new();
    russh_keys::encode_pkcs8_pem(&key, &mut pem)
        .with_context(|| "Failed to encode host key")?;

    tokio::fs::write(path, &pem)
        .await
        .with_context(|| format!("Failed to write host key to {:?}", path))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .with_context(|| format!("Failed to set permissions on {:?}", path))?;
    }

    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh_keys::PublicKeyBase64;

    #[tokio::test]
    async fn test_generated_key_is_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host_key");

        let first = load_or_generate(&path).await.unwrap();
        assert!(path.exists());

        let second = load_or_generate(&path).await.unwrap();
        assert_eq!(first.public_key_base64(), second.public_key_base64());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_key_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host_key");
        load_or_generate(&path).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
