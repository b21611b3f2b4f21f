//! Registration against the mesh coordination endpoint

use std::net::IpAddr;

use async_trait::async_trait;

use veil_core::error::MeshError;
use veil_core::net::preferred_local_addr;

/// Result of a successful registration
#[derive(Debug, Clone)]
pub struct Registration {
    /// Address this device is reachable at on the overlay
    pub address: String,
}

/// Registers a device with the mesh coordination endpoint.
///
/// The manager only cares about the outcome; how registration happens
/// (local development stub, HTTP coordinator, embedded control plane)
/// is behind this trait.
#[async_trait]
pub trait Registrar: Send + Sync {
    /// Register a device by name and public identity, returning its
    /// overlay address.
    async fn register(
        &self,
        device_name: &str,
        public_key: &str,
    ) -> Result<Registration, MeshError>;
}

/// Registrar for development and single-host setups.
///
/// Skips the coordination round-trip and reports the host's preferred
/// local address as the mesh address.
#[derive(Debug, Default)]
pub struct DevRegistrar;

#[async_trait]
impl Registrar for DevRegistrar {
    async fn register(
        &self,
        device_name: &str,
        _public_key: &str,
    ) -> Result<Registration, MeshError> {
        let addr: IpAddr = preferred_local_addr();
        tracing::debug!("Registered {} at local address {}", device_name, addr);
        Ok(Registration {
            address: addr.to_string(),
        })
    }
}
