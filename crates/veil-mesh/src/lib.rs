//! veil-mesh: Overlay mesh connectivity
//!
//! Maintains this device's presence on the mesh overlay: identity
//! generation, registration against a coordination endpoint, periodic
//! heartbeats, staleness detection and bounded reconnection.

pub mod manager;
pub mod registrar;

pub use manager::{HealthError, MeshManager, MeshSnapshot, MeshStatus};
pub use registrar::{DevRegistrar, Registrar, Registration};
