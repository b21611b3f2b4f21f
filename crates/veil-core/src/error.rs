//! Core error types for Veil

use std::path::PathBuf;

use thiserror::Error;

/// Mesh-connectivity errors
#[derive(Error, Debug)]
pub enum MeshError {
    /// Registration against the coordination endpoint failed
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    /// Identity material could not be generated
    #[error("Identity generation failed: {0}")]
    IdentityGeneration(String),

    /// Operation requires a connected mesh
    #[error("Not connected to mesh")]
    NotConnected,
}

/// Session-related errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// PTY allocation failed
    #[error("PTY allocation failed: {0}")]
    PtyAllocation(String),

    /// Process spawn failed
    #[error("Failed to spawn process: {0}")]
    Spawn(String),

    /// Session closed unexpectedly
    #[error("Session closed unexpectedly")]
    UnexpectedClose,
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// Invalid listen port
    #[error("Invalid port: {0}")]
    InvalidPort(u16),

    /// Invalid CIDR range in the allow-list
    #[error("Invalid CIDR range: {0}")]
    InvalidCidr(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
