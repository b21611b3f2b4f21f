//! Veil daemon
//!
//! Joins the mesh overlay, serves SSH to peers on the allowed networks
//! and runs the JSON bridge for clients that cannot speak raw SSH.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use veil_core::config::{self, DaemonConfig};
use veil_mesh::{DevRegistrar, MeshManager};
use veil_sshd::SshServer;
use veil_bridge::BridgeServer;

#[derive(Parser)]
#[command(name = "veild")]
#[command(about = "Veil daemon: mesh-reachable remote shell")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// SSH bind host (overrides config; defaults to loopback)
    #[arg(short, long)]
    bind: Option<String>,

    /// SSH port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Veil daemon starting...");

    let mut config = load_daemon_config(&args)?;
    if let Some(port) = args.port {
        config.ssh.port = port;
        config.bridge.ssh_port = port;
    }
    config.validate().context("Invalid configuration")?;

    // Join the mesh before serving anything
    let mesh = MeshManager::new(config.mesh.clone(), Arc::new(DevRegistrar));
    mesh.start().await.context("Failed to join mesh")?;

    let bind_host = resolve_bind_host(args.bind, config.ssh.bind_host.clone());

    let sshd = SshServer::new(config.ssh.clone())?;
    let ssh_addr = sshd
        .start(&bind_host)
        .await
        .context("Failed to start SSH server")?;

    // The bridge always targets the local SSH server
    let bridge = BridgeServer::new(config.bridge.clone())?;
    let bridge_addr = bridge.start().await.context("Failed to start bridge")?;

    tracing::info!(
        "Veil up: mesh={}, ssh={}, bridge={}",
        mesh.mesh_address().as_deref().unwrap_or("?"),
        ssh_addr,
        bridge_addr
    );

    wait_for_shutdown().await;

    tracing::info!("Shutting down...");
    bridge.stop().await;
    sshd.stop().await;
    mesh.stop().await;

    tracing::info!("Veil daemon shutdown complete");
    Ok(())
}

/// CLI flag wins over config; with neither set the server binds to
/// loopback, which is where the bridge dials by default. Binding to a
/// mesh or wildcard address is an explicit choice.
fn resolve_bind_host(cli_bind: Option<String>, config_bind: Option<String>) -> String {
    cli_bind
        .or(config_bind)
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

fn load_daemon_config(args: &Args) -> Result<DaemonConfig> {
    if let Some(config_path) = &args.config {
        return config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path));
    }

    let default_path = config::default_config_path();
    if default_path.exists() {
        Ok(config::load_config(&default_path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
            DaemonConfig::default()
        }))
    } else {
        tracing::info!("Using default configuration");
        Ok(DaemonConfig::default())
    }
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
