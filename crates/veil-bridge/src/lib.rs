//! veil-bridge: message-protocol bridge to the local SSH server
//!
//! Terminates a line-delimited JSON control protocol over a byte-stream
//! transport and relays it to a local SSH session, so clients that cannot
//! speak raw SSH (browser terminals and the like) still reach the shell.

pub mod session;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use veil_core::config::BridgeConfig;

use crate::session::run_bridge_session;

/// Accepts transport connections and runs one bridge session per
/// connection.
pub struct BridgeServer {
    config: BridgeConfig,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl BridgeServer {
    /// Create a bridge server from configuration
    pub fn new(config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    /// Bind the listener and start accepting connections. Returns the
    /// bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", self.config.listen_addr))?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Bridge listening on {}", local_addr);

        let cancel = self.cancel.clone();
        let tasks = self.tasks.clone();
        let config = self.config.clone();

        self.tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("Bridge shutting down");
                        break;
                    }
                    result = listener.accept() => {
                        match result {
                            Ok((socket, peer_addr)) => {
                                tracing::info!("Bridge connection from {}", peer_addr);
                                let config = config.clone();
                                let cancel = cancel.clone();
                                tasks.spawn(async move {
                                    tokio::select! {
                                        _ = cancel.cancelled() => {}
                                        result = run_bridge_session(socket, config) => {
                                            if let Err(e) = result {
                                                tracing::warn!(
                                                    "Bridge session from {} ended with error: {:#}",
                                                    peer_addr,
                                                    e
                                                );
                                            } else {
                                                tracing::info!(
                                                    "Bridge session from {} closed",
                                                    peer_addr
                                                );
                                            }
                                        }
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!("Failed to accept bridge connection: {}", e);
                            }
                        }
                    }
                }
            }
        });

        Ok(local_addr)
    }

    /// Stop accepting connections and wait for in-flight sessions.
    ///
    /// Safe to call more than once.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        tracing::info!("Bridge stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_twice_after_start() {
        let config = BridgeConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            ..Default::default()
        };
        let server = BridgeServer::new(config).unwrap();
        let addr = server.start().await.unwrap();
        assert_ne!(addr.port(), 0);

        server.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_new_rejects_zero_target_port() {
        let config = BridgeConfig {
            ssh_port: 0,
            ..Default::default()
        };
        assert!(BridgeServer::new(config).is_err());
    }
}
