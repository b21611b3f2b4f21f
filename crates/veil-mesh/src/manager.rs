//! Mesh connectivity manager
//!
//! Owns the device's overlay identity and assigned address, and keeps the
//! connection alive: a heartbeat task stamps liveness at a configurable
//! interval, and a monitor task checks for staleness and drives bounded
//! reconnection.

use std::net::IpAddr;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use veil_core::config::MeshConfig;
use veil_core::error::MeshError;

use crate::registrar::Registrar;
use russh_keys::key::KeyPair;
use russh_keys::PublicKeyBase64;

/// Interval at which the monitor task checks connection staleness
const MONITOR_INTERVAL: Duration = Duration::from_secs(10);

/// Connectivity state of the mesh manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshStatus {
    /// Not connected to the mesh
    Disconnected,
    /// Registered and heartbeating
    Connected,
    /// A reconnection attempt is in progress
    Reconnecting,
}

/// Health-check failure conditions
#[derive(Debug, Error)]
pub enum HealthError {
    /// The manager is not in the Connected state
    #[error("not connected to mesh")]
    NotConnected,

    /// No address was assigned during registration
    #[error("no mesh address assigned")]
    NoAddress,

    /// The assigned address does not parse as an IP address
    #[error("invalid mesh address: {0}")]
    InvalidAddress(String),

    /// The last heartbeat is too old
    #[error("heartbeat stale: last seen {0:?} ago")]
    HeartbeatStale(Duration),
}

/// Point-in-time view of the manager's state
#[derive(Debug, Clone)]
pub struct MeshSnapshot {
    /// Current connectivity status
    pub status: MeshStatus,
    /// Assigned overlay address, if registered
    pub address: Option<String>,
    /// Public identity in base64, empty before start
    pub public_key: String,
    /// Consecutive reconnection attempts since the last success
    pub reconnect_attempts: u32,
    /// Age of the last heartbeat
    pub heartbeat_age: Duration,
}

struct MeshState {
    status: MeshStatus,
    address: Option<String>,
    identity: Option<Arc<KeyPair>>,
    public_key: String,
    last_heartbeat: Instant,
    reconnect_attempts: u32,
    gave_up: bool,
}

impl MeshState {
    fn new() -> Self {
        Self {
            status: MeshStatus::Disconnected,
            address: None,
            identity: None,
            public_key: String::new(),
            last_heartbeat: Instant::now(),
            reconnect_attempts: 0,
            gave_up: false,
        }
    }
}

struct MeshCore {
    config: MeshConfig,
    registrar: Arc<dyn Registrar>,
    state: RwLock<MeshState>,
}

impl MeshCore {
    fn read_state(&self) -> RwLockReadGuard<'_, MeshState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, MeshState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether the monitor should attempt a reconnect on this tick.
    ///
    /// A stale heartbeat while Connected is evidence of a dead connection;
    /// a Disconnected state with attempts outstanding means a previous
    /// reconnect failed and should be retried.
    fn needs_reconnect(&self) -> bool {
        let state = self.read_state();
        if state.gave_up {
            return false;
        }
        match state.status {
            MeshStatus::Connected => {
                state.last_heartbeat.elapsed() > self.config.heartbeat_interval * 2
            }
            MeshStatus::Disconnected => state.reconnect_attempts > 0,
            MeshStatus::Reconnecting => false,
        }
    }

    fn record_heartbeat(&self) {
        let mut state = self.write_state();
        // Liveness is only meaningful while connected
        if state.status == MeshStatus::Connected {
            state.last_heartbeat = Instant::now();
            tracing::trace!("Mesh heartbeat");
        }
    }

    async fn attempt_reconnect(&self, cancel: &CancellationToken) {
        let (attempts, delay) = {
            let mut state = self.write_state();
            if state.reconnect_attempts >= self.config.max_reconnect_attempts {
                tracing::error!(
                    "Mesh reconnection failed after {} attempts, giving up",
                    state.reconnect_attempts
                );
                state.status = MeshStatus::Disconnected;
                state.gave_up = true;
                return;
            }
            state.reconnect_attempts += 1;
            state.status = MeshStatus::Reconnecting;
            (state.reconnect_attempts, self.config.reconnect_delay)
        };

        tracing::info!(
            "Reconnecting to mesh (attempt {}/{})",
            attempts,
            self.config.max_reconnect_attempts
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return,
        }

        {
            let mut state = self.write_state();
            state.status = MeshStatus::Disconnected;
            state.address = None;
        }

        let public_key = self.read_state().public_key.clone();
        match self
            .registrar
            .register(&self.config.device_name, &public_key)
            .await
        {
            Ok(registration) => {
                let mut state = self.write_state();
                state.status = MeshStatus::Connected;
                state.address = Some(registration.address.clone());
                state.reconnect_attempts = 0;
                state.last_heartbeat = Instant::now();
                tracing::info!("Mesh reconnected at {}", registration.address);
            }
            Err(e) => {
                tracing::warn!("Mesh reconnection attempt failed: {}", e);
            }
        }
    }
}

/// Maintains this device's presence on the mesh overlay
pub struct MeshManager {
    core: Arc<MeshCore>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl MeshManager {
    /// Create a new manager with the given registration strategy
    pub fn new(config: MeshConfig, registrar: Arc<dyn Registrar>) -> Self {
        Self {
            core: Arc::new(MeshCore {
                config,
                registrar,
                state: RwLock::new(MeshState::new()),
            }),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Generate identity material, register with the coordination endpoint
    /// and launch the heartbeat and monitor tasks.
    ///
    /// Fails only if identity generation or registration fails; background
    /// task behavior never fails this call.
    pub async fn start(&self) -> Result<(), MeshError> {
        let key = KeyPair::generate_ed25519().ok_or_else(|| {
            MeshError::IdentityGeneration("ed25519 keypair generation failed".to_string())
        })?;
        let public_key = key.public_key_base64();

        let registration = self
            .core
            .registrar
            .register(&self.core.config.device_name, &public_key)
            .await?;

        {
            let mut state = self.core.write_state();
            state.identity = Some(Arc::new(key));
            state.public_key = public_key;
            state.address = Some(registration.address.clone());
            state.status = MeshStatus::Connected;
            state.last_heartbeat = Instant::now();
            state.reconnect_attempts = 0;
            state.gave_up = false;
        }

        tracing::info!(
            "Joined mesh as {} at {}",
            self.core.config.device_name,
            registration.address
        );

        self.spawn_heartbeat();
        self.spawn_monitor();
        Ok(())
    }

    fn spawn_heartbeat(&self) {
        let core = Arc::clone(&self.core);
        let cancel = self.cancel.clone();
        let interval = core.config.heartbeat_interval;

        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    _ = ticker.tick() => core.record_heartbeat(),
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    fn spawn_monitor(&self) {
        let core = Arc::clone(&self.core);
        let cancel = self.cancel.clone();

        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if core.needs_reconnect() {
                            tracing::warn!("Mesh connection appears stale");
                            core.attempt_reconnect(&cancel).await;
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    /// Stop background tasks and mark the manager disconnected.
    ///
    /// Safe to call more than once.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        let mut state = self.core.write_state();
        state.status = MeshStatus::Disconnected;
        state.address = None;
        tracing::info!("Left mesh");
    }

    /// The overlay address assigned at registration, if connected
    pub fn mesh_address(&self) -> Option<String> {
        self.core.read_state().address.clone()
    }

    /// The device's public identity in base64
    pub fn public_identity(&self) -> String {
        self.core.read_state().public_key.clone()
    }

    /// Whether the manager is currently connected
    pub fn is_connected(&self) -> bool {
        self.core.read_state().status == MeshStatus::Connected
    }

    /// Point-in-time snapshot of connectivity state
    pub fn status(&self) -> MeshSnapshot {
        let state = self.core.read_state();
        MeshSnapshot {
            status: state.status,
            address: state.address.clone(),
            public_key: state.public_key.clone(),
            reconnect_attempts: state.reconnect_attempts,
            heartbeat_age: state.last_heartbeat.elapsed(),
        }
    }

    /// Check overall mesh health.
    ///
    /// Healthy means: Connected, a syntactically valid assigned address,
    /// and a heartbeat younger than 3x the heartbeat interval.
    pub fn health_check(&self) -> Result<(), HealthError> {
        let state = self.core.read_state();

        if state.status != MeshStatus::Connected {
            return Err(HealthError::NotConnected);
        }

        let address = state.address.as_ref().ok_or(HealthError::NoAddress)?;
        if address.parse::<IpAddr>().is_err() {
            return Err(HealthError::InvalidAddress(address.clone()));
        }

        let age = state.last_heartbeat.elapsed();
        if age > self.core.config.heartbeat_interval * 3 {
            return Err(HealthError::HeartbeatStale(age));
        }

        Ok(())
    }

    #[cfg(test)]
    fn backdate_heartbeat(&self, age: Duration) {
        let mut state = self.core.write_state();
        state.last_heartbeat = Instant::now() - age;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registrar::{DevRegistrar, Registration};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_config() -> MeshConfig {
        MeshConfig {
            device_name: "test-device".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            max_reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(0),
            ..Default::default()
        }
    }

    fn manager_with(registrar: Arc<dyn Registrar>) -> MeshManager {
        MeshManager::new(test_config(), registrar)
    }

    struct FailingRegistrar;

    #[async_trait]
    impl Registrar for FailingRegistrar {
        async fn register(&self, _: &str, _: &str) -> Result<Registration, MeshError> {
            Err(MeshError::RegistrationFailed("endpoint unreachable".to_string()))
        }
    }

    /// Fails the first `failures` registrations, then succeeds.
    struct FlakyRegistrar {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Registrar for FlakyRegistrar {
        async fn register(&self, _: &str, _: &str) -> Result<Registration, MeshError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(MeshError::RegistrationFailed("flaky".to_string()))
            } else {
                Ok(Registration {
                    address: "100.64.0.7".to_string(),
                })
            }
        }
    }

    #[tokio::test]
    async fn test_start_connects_and_assigns_address() {
        let manager = manager_with(Arc::new(DevRegistrar));
        manager.start().await.unwrap();

        assert!(manager.is_connected());
        let address = manager.mesh_address().unwrap();
        assert!(address.parse::<IpAddr>().is_ok());
        assert!(!manager.public_identity().is_empty());
        manager.health_check().unwrap();

        manager.stop().await;
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn test_start_fails_when_registration_fails() {
        let manager = manager_with(Arc::new(FailingRegistrar));
        let err = manager.start().await.unwrap_err();
        assert!(matches!(err, MeshError::RegistrationFailed(_)));
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let manager = manager_with(Arc::new(DevRegistrar));
        manager.start().await.unwrap();
        manager.stop().await;
        manager.stop().await;
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn test_health_before_start_is_not_connected() {
        let manager = manager_with(Arc::new(DevRegistrar));
        assert!(matches!(
            manager.health_check(),
            Err(HealthError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_staleness_detection_thresholds() {
        let manager = manager_with(Arc::new(DevRegistrar));
        manager.start().await.unwrap();

        // Below 2x the interval: no reconnect needed
        manager.backdate_heartbeat(Duration::from_secs(45));
        assert!(!manager.core.needs_reconnect());

        // Above 2x the interval: stale
        manager.backdate_heartbeat(Duration::from_secs(61));
        assert!(manager.core.needs_reconnect());

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_health_check_reports_stale_heartbeat() {
        let manager = manager_with(Arc::new(DevRegistrar));
        manager.start().await.unwrap();

        manager.backdate_heartbeat(Duration::from_secs(91));
        assert!(matches!(
            manager.health_check(),
            Err(HealthError::HeartbeatStale(_))
        ));

        manager.backdate_heartbeat(Duration::from_secs(89));
        manager.health_check().unwrap();

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_reconnect_resets_counter_on_success() {
        let registrar = Arc::new(FlakyRegistrar {
            failures: 0,
            calls: AtomicU32::new(0),
        });
        let manager = manager_with(registrar);
        manager.start().await.unwrap();

        // Pretend an earlier reconnect already failed once
        manager.core.write_state().reconnect_attempts = 1;

        // Force a stale heartbeat and drive reconnection directly
        manager.backdate_heartbeat(Duration::from_secs(120));
        assert!(manager.core.needs_reconnect());
        manager.core.attempt_reconnect(&manager.cancel).await;

        assert!(manager.is_connected());
        assert_eq!(manager.status().reconnect_attempts, 0);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_reconnect_gives_up_after_max_attempts() {
        let manager = manager_with(Arc::new(FailingRegistrar));
        // Seed a connected state by hand since start() would fail
        {
            let mut state = manager.core.write_state();
            state.status = MeshStatus::Connected;
            state.address = Some("100.64.0.7".to_string());
        }
        manager.backdate_heartbeat(Duration::from_secs(120));

        // Attempts 1..=3 fail, the 4th tick gives up
        for _ in 0..3 {
            assert!(manager.core.needs_reconnect());
            manager.core.attempt_reconnect(&manager.cancel).await;
            assert_eq!(manager.status().status, MeshStatus::Disconnected);
        }
        assert_eq!(manager.status().reconnect_attempts, 3);

        manager.core.attempt_reconnect(&manager.cancel).await;
        assert!(!manager.core.needs_reconnect());
        assert!(matches!(
            manager.health_check(),
            Err(HealthError::NotConnected)
        ));
    }
}
