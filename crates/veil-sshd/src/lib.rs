//! veil-sshd: Access-controlled SSH server
//!
//! Serves interactive PTY shells and one-shot commands to native SSH
//! clients, authenticating by public key or optional password, and
//! authorizing connections by source network against a CIDR allow-list.

pub mod auth;
pub mod handler;
pub mod hostkey;
pub mod session;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh_keys::key::PublicKey;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use veil_core::config::SshConfig;
use veil_core::AllowList;

use crate::auth::AuthorizedKeys;
use crate::handler::SessionHandler;

/// State shared by all connection handlers
pub struct ServerContext {
    /// CIDR ranges permitted to connect
    pub allow_list: AllowList,
    /// Authorized public keys
    pub auth: AuthorizedKeys,
    /// Optional username/password map; empty disables password auth
    pub users: HashMap<String, String>,
}

/// The SSH server: owns the listener, the shared context and the
/// lifetime of all connection tasks.
pub struct SshServer {
    config: SshConfig,
    ctx: Arc<ServerContext>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl SshServer {
    /// Create a server from configuration.
    ///
    /// Fails on an invalid port or an unparseable allow-list range.
    pub fn new(config: SshConfig) -> Result<Self> {
        config.validate()?;
        let allow_list = AllowList::new(&config.allowed_networks)?;

        let ctx = Arc::new(ServerContext {
            allow_list,
            auth: AuthorizedKeys::new(),
            users: config.users.clone(),
        });

        Ok(Self {
            config,
            ctx,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    /// Load the host key and authorized keys, bind the listener and
    /// start accepting connections. Returns the bound address.
    ///
    /// A missing or unreadable authorized-keys file is not fatal; the
    /// server continues without key auth.
    pub async fn start(&self, bind_host: &str) -> Result<SocketAddr> {
        let host_key = hostkey::load_or_generate(&self.config.host_key_path).await?;

        if let Err(e) = self.ctx.auth.load_from_file(&self.config.authorized_keys_path) {
            tracing::warn!(
                "Continuing without key auth, could not load authorized keys: {:#}",
                e
            );
        }

        let mut ssh_config = russh::server::Config::default();
        ssh_config.keys.push(host_key);
        ssh_config.auth_rejection_time = Duration::from_secs(1);
        ssh_config.auth_rejection_time_initial = Some(Duration::from_secs(0));
        let ssh_config = Arc::new(ssh_config);

        let listener = TcpListener::bind((bind_host, self.config.port))
            .await
            .with_context(|| format!("Failed to bind to {}:{}", bind_host, self.config.port))?;
        let local_addr = listener.local_addr()?;
        tracing::info!("SSH server listening on {}", local_addr);

        let ctx = Arc::clone(&self.ctx);
        let cancel = self.cancel.clone();
        let tasks = self.tasks.clone();

        self.tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("SSH server shutting down");
                        break;
                    }
                    result = listener.accept() => {
                        match result {
                            Ok((socket, peer_addr)) => {
                                tracing::info!("New connection from {}", peer_addr);
                                let handler = SessionHandler::new(Arc::clone(&ctx), peer_addr);
                                let config = Arc::clone(&ssh_config);
                                let cancel = cancel.clone();
                                tasks.spawn(async move {
                                    serve_connection(config, socket, handler, peer_addr, cancel)
                                        .await;
                                });
                            }
                            Err(e) => {
                                tracing::error!("Failed to accept connection: {}", e);
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
        tracing::info!("SSH server stopped");
    }

    /// Authorize a key at runtime
    pub fn authorize_key(&self, key: PublicKey) {
        self.ctx.auth.add(key);
    }

    /// Revoke a key at runtime; returns whether it was present
    pub fn revoke_key(&self, key: &PublicKey) -> bool {
        self.ctx.auth.remove(key)
    }

    /// Number of currently authorized keys
    pub fn authorized_key_count(&self) -> usize {
        self.ctx.auth.len()
    }

    /// The port this server is configured for
    pub fn port(&self) -> u16 {
        self.config.port
    }
}

async fn serve_connection(
    config: Arc<russh::server::Config>,
    socket: tokio::net::TcpStream,
    handler: SessionHandler,
    peer_addr: SocketAddr,
    cancel: CancellationToken,
) {
    match russh::server::run_stream(config, socket, handler).await {
        Ok(session) => {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Connection handler cancelled for {}", peer_addr);
                }
                result = session => {
                    match result {
                        Ok(_) => tracing::info!("Connection from {} closed", peer_addr),
                        Err(e) => {
                            tracing::warn!("Connection from {} closed with error: {}", peer_addr, e)
                        }
                    }
                }
            }
        }
        Err(e) => {
            tracing::warn!("Connection setup failed for {}: {}", peer_addr, e);
        }
    }
}
