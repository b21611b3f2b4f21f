//! veil-core: Shared abstractions and configuration for Veil
//!
//! This crate provides the error taxonomy, daemon configuration and
//! network access policy used by the mesh manager, SSH server and bridge.

pub mod config;
pub mod error;
pub mod net;

pub use net::AllowList;
