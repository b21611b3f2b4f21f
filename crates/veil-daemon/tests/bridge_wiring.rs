//! End-to-end wiring check: with default addressing, the bridge's target
//! must be reachable where the SSH server actually binds.

use std::collections::HashMap;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use veil_bridge::session::run_bridge_session;
use veil_core::config::{BridgeConfig, SshConfig};
use veil_sshd::SshServer;

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[tokio::test]
async fn bridge_default_target_reaches_default_bind() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();

    let mut users = HashMap::new();
    users.insert("ops".to_string(), "hunter2".to_string());
    let ssh_config = SshConfig {
        bind_host: None,
        port,
        host_key_path: dir.path().join("host_key"),
        authorized_keys_path: dir.path().join("authorized_keys"),
        allowed_networks: vec!["100.64.0.0/10".to_string()],
        users,
    };

    // Bind the way the daemon does when nothing is configured
    let server = SshServer::new(ssh_config).unwrap();
    server.start("127.0.0.1").await.unwrap();

    // The bridge keeps its default ssh_host and must still get through
    let bridge_config = BridgeConfig {
        ssh_port: port,
        ..Default::default()
    };

    let (client_io, server_io) = tokio::io::duplex(8192);
    let session = tokio::spawn(run_bridge_session(server_io, bridge_config));

    let (read_half, mut write_half) = tokio::io::split(client_io);
    let mut reader = BufReader::new(read_half);

    write_half
        .write_all(b"{\"type\":\"connect\",\"username\":\"ops\",\"password\":\"hunter2\"}\n")
        .await
        .unwrap();

    // Shell output may arrive interleaved; scan until the connect reply
    let mut connected = false;
    for _ in 0..32 {
        let mut line = String::new();
        let n = tokio::time::timeout(Duration::from_secs(10), reader.read_line(&mut line))
            .await
            .expect("timed out waiting for connect reply")
            .unwrap();
        if n == 0 {
            break;
        }
        assert!(
            !line.contains("\"type\":\"error\""),
            "bridge could not reach the SSH server: {}",
            line
        );
        if line.contains("\"type\":\"connected\"") {
            connected = true;
            break;
        }
    }
    assert!(connected, "never saw a connected reply");

    write_half
        .write_all(b"{\"type\":\"disconnect\"}\n")
        .await
        .unwrap();
    session.await.unwrap().unwrap();
    server.stop().await;
}
