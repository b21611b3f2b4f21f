//! Per-connection SSH session handler
//!
//! Enforces source authorization and credential authentication, then
//! dispatches the session to an interactive PTY shell or a one-shot
//! command.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, Pty};
use russh_keys::key::PublicKey;
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;

use crate::session::{self, PtyShell};
use crate::ServerContext;

/// Terminal parameters captured from a pty-request, used when the shell
/// is started
struct PtyParams {
    term: String,
    rows: u16,
    cols: u16,
}

impl Default for PtyParams {
    fn default() -> Self {
        Self {
            term: "xterm-256color".to_string(),
            rows: 24,
            cols: 80,
        }
    }
}

/// Handler for a single SSH client connection
pub struct SessionHandler {
    ctx: Arc<ServerContext>,
    peer_addr: SocketAddr,
    username: Option<String>,
    pty: Option<PtyParams>,
    shell: Option<PtyShell>,
    exec_stdin: Option<ChildStdin>,
}

impl SessionHandler {
    /// Create a handler for a connection from `peer_addr`
    pub fn new(ctx: Arc<ServerContext>, peer_addr: SocketAddr) -> Self {
        Self {
            ctx,
            peer_addr,
            username: None,
            pty: None,
            shell: None,
            exec_stdin: None,
        }
    }

    /// Source authorization, independent of credentials.
    ///
    /// Loopback connections are always permitted since they can only
    /// originate from the same machine; everything else must fall inside
    /// the configured allow-list.
    fn source_permitted(&self) -> bool {
        let peer_ip = self.peer_addr.ip();
        peer_ip.is_loopback() || self.ctx.allow_list.permits(peer_ip)
    }

    fn reject_source(&self) -> Auth {
        tracing::warn!(
            "Connection from {} refused: source address outside allowed networks",
            self.peer_addr
        );
        Auth::Reject {
            proceed_with_methods: None,
        }
    }

    fn username(&self) -> &str {
        self.username.as_deref().unwrap_or("unknown")
    }
}

#[async_trait]
impl Handler for SessionHandler {
    type Error = anyhow::Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if !self.source_permitted() {
            return Ok(self.reject_source());
        }

        let fingerprint = public_key.fingerprint();
        if self.ctx.auth.is_authorized(public_key) {
            tracing::info!(
                "Public key auth accepted for {} from {} ({})",
                user,
                self.peer_addr,
                fingerprint
            );
            self.username = Some(user.to_string());
            Ok(Auth::Accept)
        } else {
            tracing::warn!(
                "Public key auth rejected for {} from {} ({})",
                user,
                self.peer_addr,
                fingerprint
            );
            Ok(Auth::Reject {
                proceed_with_methods: None,
            })
        }
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if !self.source_permitted() {
            return Ok(self.reject_source());
        }

        if crate::auth::verify_password(&self.ctx.users, user, password) {
            tracing::info!("Password auth accepted for {} from {}", user, self.peer_addr);
            self.username = Some(user.to_string());
            Ok(Auth::Accept)
        } else {
            tracing::warn!("Password auth rejected for {} from {}", user, self.peer_addr);
            Ok(Auth::Reject {
                proceed_with_methods: None,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!("Channel opened: {:?}", channel.id());
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.pty = Some(PtyParams {
            term: term.to_string(),
            rows: row_height as u16,
            cols: col_width as u16,
        });
        session.channel_success(channel);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let params = self.pty.take().unwrap_or_default();
        let handle = session.handle();
        let username = self.username().to_string();

        match PtyShell::spawn(
            params.rows,
            params.cols,
            &params.term,
            handle,
            channel,
            username,
            self.peer_addr,
        ) {
            Ok(shell) => {
                self.shell = Some(shell);
                session.channel_success(channel);
            }
            Err(e) => {
                tracing::error!("Failed to start shell for {}: {}", self.peer_addr, e);
                session.channel_failure(channel);
            }
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).into_owned();
        let handle = session.handle();
        let username = self.username().to_string();

        match session::spawn_command(&command, handle, channel, username, self.peer_addr) {
            Ok(stdin) => {
                self.exec_stdin = stdin;
                session.channel_success(channel);
            }
            Err(e) => {
                tracing::error!("Failed to execute command for {}: {}", self.peer_addr, e);
                session.channel_failure(channel);
            }
        }
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        _channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(shell) = &self.shell {
            if let Err(e) = shell.resize(row_height as u16, col_width as u16) {
                tracing::warn!("Failed to resize PTY: {}", e);
            }
        }
        Ok(())
    }

    async fn data(
        &mut self,
        _channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(shell) = &mut self.shell {
            if let Err(e) = shell.write(data) {
                tracing::warn!("Failed to write to PTY: {}", e);
            }
        } else if let Some(stdin) = &mut self.exec_stdin {
            if stdin.write_all(data).await.is_err() {
                self.exec_stdin = None;
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("Channel EOF: {:?}", channel);
        // Closing stdin lets a one-shot command observe end of input
        self.exec_stdin = None;
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("Channel closed: {:?}", channel);
        self.shell = None;
        self.exec_stdin = None;
        Ok(())
    }
}
