//! End-to-end tests over loopback sockets.
//!
//! Each test runs one or two connection managers on ephemeral ports and
//! drives them through real TCP connections.

use crate::generators::framed;
use crate::harness::*;
use bytes::Bytes;
use fxc_network::ban::DEFAULT_BAN_TIME;
use fxc_network::{ConnectionDirection, ConnectionManagerConfig};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_added_node_connects_and_exchanges_messages() {
    let server_proc = RecordingProcessor::new();
    let (server, addr) = start_listener(server_proc.clone()).await;

    let client_proc = RecordingProcessor::greeting(b"fxc");
    let client = test_manager(
        ConnectionManagerConfig {
            added_nodes: vec![addr.to_string()],
            ..quiet_config()
        },
        client_proc.clone(),
    );
    client.start().await.unwrap();

    assert!(wait_for_connections(&server, ConnectionDirection::Inbound, 1).await);
    assert!(wait_for_connections(&client, ConnectionDirection::Outbound, 1).await);
    assert!(wait_until(WAIT, || !client_proc.received_of("hello").is_empty()).await);
    assert_eq!(server_proc.received_of("hello"), vec![Bytes::from_static(b"fxc")]);

    let info = client.added_node_info();
    assert_eq!(info.len(), 1);
    assert!(info[0].connected);
    assert!(!info[0].inbound);

    // Round trip through the processor on the other side.
    let id = client.node_stats()[0].id;
    assert!(client.for_node(id, |node| {
        client.push_message(node, "echo", Bytes::from_static(b"round trip"));
        true
    }));
    assert!(wait_until(WAIT, || !client_proc.received_of("reply").is_empty()).await);
    assert_eq!(client_proc.received_of("reply")[0], Bytes::from_static(b"round trip"));

    let stats = &server.node_stats()[0];
    assert!(stats.successfully_connected);
    // Types outside the known set are accounted together.
    assert!(stats.bytes_recv_per_msg["*other*"] > 0);
    assert!(!stats.bytes_recv_per_msg.contains_key("hello"));
    assert!(server.total_bytes_recv() > 0);
    assert!(server.total_bytes_sent() > 0);

    client.stop().await;
    server.stop().await;
    assert_eq!(client_proc.finalized.load(Ordering::SeqCst), 1);
    assert_eq!(server_proc.finalized.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_disconnect_is_seen_by_both_sides() {
    let server_proc = RecordingProcessor::new();
    let (server, addr) = start_listener(server_proc.clone()).await;

    let client_proc = RecordingProcessor::greeting(b"fxc");
    let client = test_manager(
        ConnectionManagerConfig {
            added_nodes: vec![addr.to_string()],
            ..quiet_config()
        },
        client_proc.clone(),
    );
    client.start().await.unwrap();
    assert!(wait_for_connections(&server, ConnectionDirection::Inbound, 1).await);

    let id = server.node_stats()[0].id;
    assert!(server.disconnect_node_by_id(id));
    assert!(wait_until(WAIT, || server_proc.finalized.load(Ordering::SeqCst) == 1).await);
    assert!(wait_until(WAIT, || client_proc.finalized.load(Ordering::SeqCst) == 1).await);
    assert_eq!(client.node_count(ConnectionDirection::All), 0);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_framing_error_drops_connection() {
    let server_proc = RecordingProcessor::new();
    let (server, addr) = start_listener(server_proc.clone()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    assert!(wait_for_connections(&server, ConnectionDirection::Inbound, 1).await);

    // Right length, wrong magic.
    let mut garbage = framed("ping", &[0u8; 8]);
    garbage[0] ^= 0xff;
    stream.write_all(&garbage).await.unwrap();

    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(WAIT, stream.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
    assert!(wait_until(WAIT, || server_proc.finalized.load(Ordering::SeqCst) == 1).await);
    assert!(server_proc.received.lock().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_raw_client_messages_are_dispatched_in_order() {
    let server_proc = RecordingProcessor::new();
    let (server, addr) = start_listener(server_proc.clone()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut bytes = Vec::new();
    for i in 0..5u8 {
        bytes.extend_from_slice(&framed("seq", &[i; 3]));
    }
    // Dribble the stream out in small writes.
    for chunk in bytes.chunks(7) {
        stream.write_all(chunk).await.unwrap();
        stream.flush().await.unwrap();
    }

    assert!(wait_until(WAIT, || server_proc.received_of("seq").len() == 5).await);
    let payloads = server_proc.received_of("seq");
    for (i, payload) in payloads.iter().enumerate() {
        assert_eq!(&payload[..], &[i as u8; 3]);
    }

    server.stop().await;
}

#[tokio::test]
async fn test_banned_peer_is_refused() {
    let server_proc = RecordingProcessor::new();
    let server = test_manager(listening_config(), server_proc.clone());
    server.ban_list().ban("127.0.0.0/8".parse().unwrap(), DEFAULT_BAN_TIME);
    server.start().await.unwrap();
    let addr = server.listen_addrs()[0];

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(WAIT, stream.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
    assert_eq!(server_proc.initialized.load(Ordering::SeqCst), 0);
    assert_eq!(server.node_count(ConnectionDirection::All), 0);

    server.stop().await;
}

#[tokio::test]
async fn test_full_inbound_without_victim_drops_newcomer() {
    // One inbound slot.
    let config = ConnectionManagerConfig {
        max_connections: 3,
        max_outbound: 1,
        max_feeler: 1,
        ..listening_config()
    };
    let server_proc = RecordingProcessor::new();
    let (server, addr) = start_listener_with(config, server_proc.clone()).await;

    let _first = TcpStream::connect(addr).await.unwrap();
    assert!(wait_for_connections(&server, ConnectionDirection::Inbound, 1).await);

    // The only candidate is protected, so the newcomer goes.
    let mut second = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(WAIT, second.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
    assert_eq!(server.node_count(ConnectionDirection::Inbound), 1);
    assert_eq!(server_proc.initialized.load(Ordering::SeqCst), 1);

    server.stop().await;
}

#[tokio::test]
async fn test_network_toggle() {
    let server_proc = RecordingProcessor::new();
    let (server, addr) = start_listener(server_proc.clone()).await;

    let _first = TcpStream::connect(addr).await.unwrap();
    assert!(wait_for_connections(&server, ConnectionDirection::Inbound, 1).await);

    server.set_network_active(false);
    assert!(wait_for_connections(&server, ConnectionDirection::All, 0).await);

    let mut refused = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(WAIT, refused.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
    assert_eq!(server_proc.initialized.load(Ordering::SeqCst), 1);

    server.set_network_active(true);
    let _again = TcpStream::connect(addr).await.unwrap();
    assert!(wait_for_connections(&server, ConnectionDirection::Inbound, 1).await);

    server.stop().await;
}

#[tokio::test]
async fn test_stop_finalizes_every_connection() {
    let server_proc = RecordingProcessor::new();
    let (server, addr) = start_listener(server_proc.clone()).await;

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(TcpStream::connect(addr).await.unwrap());
    }
    assert!(wait_for_connections(&server, ConnectionDirection::Inbound, 3).await);

    server.stop().await;
    assert_eq!(server_proc.finalized.load(Ordering::SeqCst), 3);
    assert_eq!(server.node_count(ConnectionDirection::All), 0);
    assert!(server.listen_addrs().is_empty());
}

#[tokio::test]
async fn test_specified_connect_mode() {
    let server_proc = RecordingProcessor::new();
    let (server, addr) = start_listener(server_proc.clone()).await;

    let client_proc = RecordingProcessor::greeting(b"only you");
    let client = test_manager(
        ConnectionManagerConfig {
            connect: vec![addr.to_string()],
            ..quiet_config()
        },
        client_proc.clone(),
    );
    client.start().await.unwrap();

    assert!(wait_until(WAIT, || !server_proc.received_of("hello").is_empty()).await);
    let stats = client.node_stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].addr_name, addr.to_string());

    client.stop().await;
    server.stop().await;
}
