//! Configuration management for the Veil daemon

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Serde shim representing a `Duration` as a plain number of seconds,
/// so intervals read naturally in a TOML file. Use via
/// `#[serde(with = "duration_secs")]`.
pub mod duration_secs {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("veil")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to a file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}

/// Top-level configuration for the Veil daemon
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Mesh connectivity settings
    pub mesh: MeshConfig,

    /// SSH server settings
    pub ssh: SshConfig,

    /// Bridge listener settings
    pub bridge: BridgeConfig,
}

impl DaemonConfig {
    /// Validate cross-field constraints before the daemon starts
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ssh.validate()?;
        self.bridge.validate()?;
        Ok(())
    }
}

/// Configuration for mesh overlay connectivity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Coordination endpoint for registration and heartbeats
    pub coordinator_url: String,

    /// Name this device registers under
    pub device_name: String,

    /// Interval between heartbeats
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,

    /// Maximum consecutive reconnection attempts before giving up
    pub max_reconnect_attempts: u32,

    /// Delay before each reconnection attempt
    #[serde(with = "duration_secs")]
    pub reconnect_delay: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            coordinator_url: String::new(),
            device_name: gethostname::gethostname().to_string_lossy().into_owned(),
            heartbeat_interval: Duration::from_secs(30),
            max_reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

/// Configuration for the access-controlled SSH server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// Address to bind; defaults to loopback when unset, matching where
    /// the bridge dials. Set this to a mesh or wildcard address to serve
    /// overlay peers directly.
    pub bind_host: Option<String>,

    /// Port to listen on
    pub port: u16,

    /// Path to the persisted host key
    pub host_key_path: PathBuf,

    /// Path to the authorized keys file (OpenSSH format)
    pub authorized_keys_path: PathBuf,

    /// CIDR ranges permitted to connect
    pub allowed_networks: Vec<String>,

    /// Optional username -> password map; password auth is disabled when empty
    pub users: HashMap<String, String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        let config_dir = default_config_dir();

        Self {
            bind_host: None,
            port: 2222,
            host_key_path: config_dir.join("host_key"),
            authorized_keys_path: config_dir.join("authorized_keys"),
            allowed_networks: vec![crate::net::MESH_CIDR.to_string()],
            users: HashMap::new(),
        }
    }
}

impl SshConfig {
    /// Validate the listen port and allow-list ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port));
        }
        crate::net::AllowList::new(&self.allowed_networks)?;
        Ok(())
    }
}

/// Configuration for the bridge listener
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Address the bridge listens on for transport connections
    pub listen_addr: String,

    /// Host of the local SSH server each session connects to
    pub ssh_host: String,

    /// Port of the local SSH server
    pub ssh_port: u16,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8022".to_string(),
            ssh_host: "127.0.0.1".to_string(),
            ssh_port: 2222,
        }
    }
}

impl BridgeConfig {
    /// Validate the bridge target port
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ssh_port == 0 {
            return Err(ConfigError::InvalidPort(self.ssh_port));
        }
        Ok(())
    }

    /// Target address of the local SSH server
    pub fn ssh_address(&self) -> String {
        format!("{}:{}", self.ssh_host, self.ssh_port)
    }
}
