//! Authorized keys and password verification

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{Context, Result};
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;

/// The set of public keys permitted to authenticate.
///
/// Keys are matched exactly by their encoded key material; a presented
/// key is authorized iff the same key was loaded or added earlier.
/// Add/remove/lookup are each independently thread-safe.
#[derive(Debug, Default)]
pub struct AuthorizedKeys {
    keys: RwLock<HashMap<String, PublicKey>>,
}

impl AuthorizedKeys {
    /// Create an empty key set
    pub fn new() -> Self {
        Self::default()
    }

    fn read_keys(&self) -> RwLockReadGuard<'_, HashMap<String, PublicKey>> {
        self.keys.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_keys(&self) -> RwLockWriteGuard<'_, HashMap<String, PublicKey>> {
        self.keys.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Load keys from an OpenSSH authorized_keys file, returning the
    /// number of keys loaded. Blank lines and comments are skipped;
    /// unparseable lines are logged and skipped.
    pub fn load_from_file(&self, path: &Path) -> Result<usize> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open {:?}", path))?;
        let reader = BufReader::new(file);

        let mut count = 0;
        for (line_num, line) in reader.lines().enumerate() {
            let line = line
                .with_context(|| format!("Failed to read line {} of {:?}", line_num + 1, path))?;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match parse_openssh_line(line) {
                Some(key) => {
                    tracing::debug!("Loaded authorized key: {}", key.fingerprint());
                    self.add(key);
                    count += 1;
                }
                None => {
                    tracing::warn!(
                        "Skipping unparseable key on line {} of {:?}",
                        line_num + 1,
                        path
                    );
                }
            }
        }

        tracing::info!("Loaded {} authorized keys from {:?}", count, path);
        Ok(count)
    }

    /// Whether the presented key exactly matches an authorized key
    pub fn is_authorized(&self, key: &PublicKey) -> bool {
        self.read_keys().contains_key(&key.public_key_base64())
    }

    /// Authorize a key
    pub fn add(&self, key: PublicKey) {
        self.write_keys().insert(key.public_key_base64(), key);
    }

    /// Revoke a key; returns whether it was present
    pub fn remove(&self, key: &PublicKey) -> bool {
        self.write_keys().remove(&key.public_key_base64()).is_some()
    }

    /// Number of authorized keys
    pub fn len(&self) -> usize {
        self.read_keys().len()
    }

    /// Whether no keys are authorized
    pub fn is_empty(&self) -> bool {
        self.read_keys().is_empty()
    }
}

/// Parse an OpenSSH public key line (`type base64 [comment]`, or a bare
/// base64 blob)
fn parse_openssh_line(line: &str) -> Option<PublicKey> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.as_slice() {
        [single] => russh_keys::parse_public_key_base64(single).ok(),
        [_type, base64, ..] => russh_keys::parse_public_key_base64(base64).ok(),
        _ => None,
    }
}

/// Check a submitted password against the configured user map.
///
/// An empty map always rejects: password auth is an optional secondary
/// path, never a default-open fallback.
pub fn verify_password(users: &HashMap<String, String>, username: &str, password: &str) -> bool {
    if users.is_empty() {
        return false;
    }
    users.get(username).map(String::as_str) == Some(password)
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh_keys::key::KeyPair;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn generated_public_key() -> PublicKey {
        KeyPair::generate_ed25519()
            .unwrap()
            .clone_public_key()
            .unwrap()
    }

    #[test]
    fn test_add_remove_lookup() {
        let store = AuthorizedKeys::new();
        let key = generated_public_key();
        let other = generated_public_key();

        assert!(store.is_empty());
        assert!(!store.is_authorized(&key));

        store.add(key.clone());
        assert_eq!(store.len(), 1);
        assert!(store.is_authorized(&key));
        assert!(!store.is_authorized(&other));

        assert!(store.remove(&key));
        assert!(!store.remove(&key));
        assert!(!store.is_authorized(&key));
    }

    #[test]
    fn test_load_skips_comments_and_blanks() {
        let key = generated_public_key();
        let encoded = key.public_key_base64();

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# deployment key").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "ssh-ed25519 {} ops@example.com", encoded).unwrap();
        writeln!(file, "not a key at all").unwrap();

        let store = AuthorizedKeys::new();
        let count = store.load_from_file(file.path()).unwrap();
        assert_eq!(count, 1);
        assert!(store.is_authorized(&key));
    }

    #[test]
    fn test_load_missing_file_is_error() {
        let store = AuthorizedKeys::new();
        assert!(store
            .load_from_file(Path::new("/nonexistent/authorized_keys"))
            .is_err());
    }

    #[test]
    fn test_password_rejected_without_user_map() {
        let users = HashMap::new();
        assert!(!verify_password(&users, "admin", "secret"));
        assert!(!verify_password(&users, "admin", ""));
    }

    #[test]
    fn test_password_checked_against_map() {
        let mut users = HashMap::new();
        users.insert("admin".to_string(), "secret".to_string());

        assert!(verify_password(&users, "admin", "secret"));
        assert!(!verify_password(&users, "admin", "wrong"));
        assert!(!verify_password(&users, "other", "secret"));
    }
}
