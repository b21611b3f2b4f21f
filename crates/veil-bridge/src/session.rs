//! Per-connection bridge session
//!
//! Each transport connection is a small state machine: idle until a
//! `connect` message arrives, then active with exactly one SSH session
//! against the locally configured server, relaying terminal bytes both
//! ways until `disconnect` or transport teardown.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use russh::client::{self, Msg};
use russh::{Channel, ChannelId, Disconnect};
use russh_keys::key::PublicKey;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use veil_core::config::BridgeConfig;
use veil_protocol::{BridgeCodec, BridgeMessage, TerminalSize};

/// Capacity of the queue feeding the single transport writer task
const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

/// An established SSH session backing an active bridge connection
struct ActiveSsh {
    handle: client::Handle<BridgeClientHandler>,
    channel: Channel<Msg>,
}

/// Run one bridge session over `io` until the peer disconnects or the
/// transport fails.
///
/// All outbound messages funnel through one writer task, so SSH output
/// and protocol replies never interleave mid-frame.
pub async fn run_bridge_session<T>(io: T, config: BridgeConfig) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = Framed::new(io, BridgeCodec::new()).split();
    let (out_tx, mut out_rx) = mpsc::channel::<BridgeMessage>(OUTBOUND_CHANNEL_CAPACITY);

    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut active: Option<ActiveSsh> = None;

    while let Some(item) = stream.next().await {
        let message = match item {
            Ok(Ok(message)) => message,
            // A malformed line gets an error reply and the session goes on
            Ok(Err(e)) => {
                tracing::warn!("Malformed bridge message: {}", e);
                let _ = out_tx.send(BridgeMessage::error(e.to_string())).await;
                continue;
            }
            Err(e) => {
                tracing::warn!("Bridge transport error: {}", e);
                break;
            }
        };

        match message {
            BridgeMessage::Connect {
                username,
                password,
                private_key,
                ..
            } => {
                if active.is_some() {
                    let _ = out_tx.send(BridgeMessage::error("Already connected")).await;
                    continue;
                }

                match open_ssh_session(&config, &username, password, private_key, &out_tx).await
                {
                    Ok(ssh) => {
                        active = Some(ssh);
                        let _ = out_tx
                            .send(BridgeMessage::Connected {
                                message: format!("Connected as {}", username),
                            })
                            .await;
                    }
                    Err(reason) => {
                        tracing::warn!("Bridge connect failed: {}", reason);
                        let _ = out_tx.send(BridgeMessage::error(reason)).await;
                    }
                }
            }

            BridgeMessage::Data { data } => match &active {
                Some(ssh) => {
                    if let Err(e) = ssh.channel.data(data.as_bytes()).await {
                        tracing::warn!("Failed to write to SSH session: {}", e);
                        let _ = out_tx
                            .send(BridgeMessage::error("Failed to write to SSH session"))
                            .await;
                    }
                }
                None => {
                    let _ = out_tx.send(BridgeMessage::error("Not connected")).await;
                }
            },

            BridgeMessage::Resize { rows, cols } => {
                if let Some(ssh) = &active {
                    if let Err(e) = ssh
                        .channel
                        .window_change(cols as u32, rows as u32, 0, 0)
                        .await
                    {
                        tracing::warn!("Failed to resize SSH session: {}", e);
                    }
                }
            }

            BridgeMessage::Disconnect => break,

            // Server-originated kinds arriving from the peer are ignored
            BridgeMessage::Connected { .. } | BridgeMessage::Error { .. } => {
                tracing::debug!("Ignoring server-originated message from peer");
            }
        }
    }

    close_ssh(active.take()).await;
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

/// Release SSH resources in order: input stream, session channel, client
async fn close_ssh(active: Option<ActiveSsh>) {
    if let Some(ssh) = active {
        let _ = ssh.channel.eof().await;
        drop(ssh.channel);
        let _ = ssh
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
    }
}

/// Dial the configured local SSH server and bring up a shell session.
///
/// The target address always comes from configuration, never from the
/// peer: the bridge must not be usable as an open relay.
async fn open_ssh_session(
    config: &BridgeConfig,
    username: &str,
    password: Option<String>,
    private_key: Option<String>,
    out_tx: &mpsc::Sender<BridgeMessage>,
) -> Result<ActiveSsh, String> {
    if password.is_none() && private_key.is_none() {
        return Err("No authentication method provided: supply a password or private key".into());
    }

    // Parse the key before dialing so a bad key fails fast
    let key = match private_key {
        Some(pem) => Some(
            russh_keys::decode_secret_key(&pem, None)
                .map_err(|e| format!("Invalid private key: {}", e))?,
        ),
        None => None,
    };

    let ssh_config = Arc::new(client::Config::default());
    let handler = BridgeClientHandler::new(out_tx.clone());

    let address = config.ssh_address();
    tracing::debug!("Bridge dialing local SSH server at {}", address);
    let mut handle = client::connect(ssh_config, address.as_str(), handler)
        .await
        .map_err(|e| format!("Failed to reach SSH server: {}", e))?;

    let mut authenticated = false;
    if let Some(key) = key {
        authenticated = handle
            .authenticate_publickey(username, Arc::new(key))
            .await
            .map_err(|e| format!("Authentication error: {}", e))?;
    }
    if !authenticated {
        if let Some(password) = &password {
            authenticated = handle
                .authenticate_password(username, password)
                .await
                .map_err(|e| format!("Authentication error: {}", e))?;
        }
    }
    if !authenticated {
        return Err("Authentication failed".into());
    }

    let channel = handle
        .channel_open_session()
        .await
        .map_err(|e| format!("Failed to open session: {}", e))?;

    let size = TerminalSize::default();
    channel
        .request_pty(
            false,
            "xterm-256color",
            size.cols as u32,
            size.rows as u32,
            0,
            0,
            &[],
        )
        .await
        .map_err(|e| format!("Failed to request PTY: {}", e))?;
    channel
        .request_shell(false)
        .await
        .map_err(|e| format!("Failed to start shell: {}", e))?;

    Ok(ActiveSsh { handle, channel })
}

/// SSH client handler that forwards session output to the transport
struct BridgeClientHandler {
    out_tx: mpsc::Sender<BridgeMessage>,
}

impl BridgeClientHandler {
    fn new(out_tx: mpsc::Sender<BridgeMessage>) -> Self {
        Self { out_tx }
    }
}

#[async_trait]
impl client::Handler for BridgeClientHandler {
    type Error = anyhow::Error;

    /// The bridge only ever dials its own local server, so the host key
    /// is accepted as-is.
    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn data(
        &mut self,
        _channel: ChannelId,
        data: &[u8],
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let _ = self.out_tx.send(BridgeMessage::data(data)).await;
        Ok(())
    }

    async fn extended_data(
        &mut self,
        _channel: ChannelId,
        _ext: u32,
        data: &[u8],
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let _ = self.out_tx.send(BridgeMessage::data(data)).await;
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        _channel: ChannelId,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("SSH session EOF");
        Ok(())
    }

    async fn channel_close(
        &mut self,
        _channel: ChannelId,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("SSH session closed");
        Ok(())
    }
}
