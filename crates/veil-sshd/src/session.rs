//! Interactive PTY shells and one-shot command execution
//!
//! Both session kinds stream their output back through the russh session
//! handle and report the process exit status on the channel when done.

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::process::Stdio;

use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use tokio::io::AsyncReadExt;
use tokio::process::{ChildStdin, Command};
use tokio::sync::mpsc;

use veil_core::error::SessionError;

/// Events flowing from the blocking PTY reader to the async forwarder
enum PtyEvent {
    Data(Vec<u8>),
    Exited(u32),
}

const PTY_EVENT_CHANNEL_CAPACITY: usize = 64;
const READ_BUFFER_SIZE: usize = 8192;

/// Resolve the shell to run: the user's `$SHELL`, falling back to `/bin/sh`
pub fn resolve_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

/// A running interactive shell behind a PTY.
///
/// Holds the master side of the PTY for writes and resizes; output
/// forwarding runs in background tasks spawned at creation.
pub struct PtyShell {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
}

impl PtyShell {
    /// Spawn the user's shell behind a new PTY and start forwarding its
    /// output to the session channel.
    pub fn spawn(
        rows: u16,
        cols: u16,
        term: &str,
        handle: Handle,
        channel: ChannelId,
        username: String,
        peer_addr: SocketAddr,
    ) -> Result<Self, SessionError> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::PtyAllocation(e.to_string()))?;

        let shell = resolve_shell();
        let mut cmd = CommandBuilder::new(&shell);
        cmd.env("TERM", term);
        if let Some(home) = dirs::home_dir() {
            cmd.cwd(home);
        }

        tracing::info!(
            "Starting shell {} for {} from {} ({}x{})",
            shell,
            username,
            peer_addr,
            cols,
            rows
        );

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::Spawn(e.to_string()))?;

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::PtyAllocation(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::PtyAllocation(e.to_string()))?;

        let (tx, rx) = mpsc::channel(PTY_EVENT_CHANNEL_CAPACITY);

        // PTY reads are blocking; run them off the async runtime and hand
        // chunks to the forwarder through the channel.
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.blocking_send(PtyEvent::Data(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                }
            }

            let code = match child.wait() {
                Ok(status) => status.exit_code(),
                Err(_) => 1,
            };
            let _ = tx.blocking_send(PtyEvent::Exited(code));
        });

        tokio::spawn(forward_events(rx, handle, channel, username, peer_addr));

        Ok(Self {
            master: pair.master,
            writer,
        })
    }

    /// Write client input to the shell
    pub fn write(&mut self, data: &[u8]) -> Result<(), SessionError> {
        self.writer
            .write_all(data)
            .and_then(|_| self.writer.flush())
            .map_err(|_| SessionError::UnexpectedClose)
    }

    /// Propagate a terminal resize to the PTY
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), SessionError> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::PtyAllocation(e.to_string()))
    }
}

async fn forward_events(
    mut rx: mpsc::Receiver<PtyEvent>,
    handle: Handle,
    channel: ChannelId,
    username: String,
    peer_addr: SocketAddr,
) {
    while let Some(event) = rx.recv().await {
        match event {
            PtyEvent::Data(data) => {
                if handle
                    .data(channel, CryptoVec::from_slice(&data))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            PtyEvent::Exited(code) => {
                let _ = handle.exit_status_request(channel, code).await;
                let _ = handle.eof(channel).await;
                let _ = handle.close(channel).await;
                tracing::info!(
                    "Shell session for {} from {} ended with code {}",
                    username,
                    peer_addr,
                    code
                );
                break;
            }
        }
    }
}

/// Execute a one-shot command with piped stdio, forwarding stdout to the
/// channel and stderr as extended data, and returning the child's stdin
/// for client input. The process exit status becomes the session exit
/// code; spawn failure is reported by the caller.
pub fn spawn_command(
    command: &str,
    handle: Handle,
    channel: ChannelId,
    username: String,
    peer_addr: SocketAddr,
) -> Result<Option<ChildStdin>, SessionError> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(home) = dirs::home_dir() {
        cmd.current_dir(home);
    }

    tracing::info!("Executing command for {} from {}", username, peer_addr);

    let mut child = cmd.spawn().map_err(|e| SessionError::Spawn(e.to_string()))?;
    let stdin = child.stdin.take();
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();

    tokio::spawn(async move {
        let out_handle = handle.clone();
        let out_task = async {
            if let Some(stdout) = stdout.as_mut() {
                let mut buf = [0u8; READ_BUFFER_SIZE];
                while let Ok(n) = stdout.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    if out_handle
                        .data(channel, CryptoVec::from_slice(&buf[..n]))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        };

        let err_handle = handle.clone();
        let err_task = async {
            if let Some(stderr) = stderr.as_mut() {
                let mut buf = [0u8; READ_BUFFER_SIZE];
                while let Ok(n) = stderr.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    if err_handle
                        .extended_data(channel, 1, CryptoVec::from_slice(&buf[..n]))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        };

        tokio::join!(out_task, err_task);

        let code = match child.wait().await {
            Ok(status) => status.code().unwrap_or(1) as u32,
            Err(_) => 1,
        };
        let _ = handle.exit_status_request(channel, code).await;
        let _ = handle.eof(channel).await;
        let _ = handle.close(channel).await;
        tracing::info!(
            "Command for {} from {} exited with code {}",
            username,
            peer_addr,
            code
        );
    });

    Ok(stdin)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_shell_is_nonempty() {
        assert!(!resolve_shell().is_empty());
    }
}
