//! Test harness for integration tests.
//!
//! Provides scripted transports, a recording message processor and helpers
//! for running connection managers over loopback sockets.

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use fxc_network::peer::{ConnectionKind, PeerLimits, PeerOptions};
use fxc_network::socket::Transport;
use fxc_network::{
    BanList, ConnectionDirection, ConnectionManager, ConnectionManagerConfig, LocalAddresses, MemoryAddressStore,
    MessageProcessor, PeerConnection, PermissionFlags, ServiceFlags,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{Interest, Ready};

/// Magic used by every test connection.
pub const TEST_MAGIC: [u8; 4] = fxc_network::REGTEST_MAGIC;

/// A transport whose writes accept at most `chunk` bytes at a time, and
/// which can be made to refuse writes entirely.
pub struct ScriptedTransport {
    chunk: usize,
    written: Mutex<Vec<u8>>,
    blocked: AtomicBool,
}

impl ScriptedTransport {
    pub fn new(chunk: usize) -> Arc<Self> {
        Arc::new(Self {
            chunk: chunk.max(1),
            written: Mutex::new(Vec::new()),
            blocked: AtomicBool::new(false),
        })
    }

    /// Make further writes fail with `WouldBlock`, or accept them again.
    pub fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::Release);
    }

    /// Everything written so far.
    pub fn written(&self) -> Vec<u8> {
        self.written.lock().clone()
    }
}

impl Transport for ScriptedTransport {
    fn try_send(&self, buf: &[u8]) -> io::Result<usize> {
        if self.blocked.load(Ordering::Acquire) {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(self.chunk);
        self.written.lock().extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn try_recv(&self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::ErrorKind::WouldBlock.into())
    }

    fn ready(self: Arc<Self>, _interest: Interest) -> BoxFuture<'static, io::Result<Ready>> {
        futures::future::pending().boxed()
    }

    fn shutdown(&self) {}
}

/// Limits used by [`test_peer`].
pub fn test_limits() -> PeerLimits {
    PeerLimits {
        magic: TEST_MAGIC,
        max_message_size: 1 << 20,
        receive_flood_size: 1 << 20,
        send_buffer_max_size: 1 << 16,
    }
}

/// A standalone connection over `transport`.
pub fn test_peer(transport: Arc<dyn Transport>, addr: SocketAddr, kind: ConnectionKind) -> PeerConnection {
    PeerConnection::new(
        1,
        transport,
        PeerOptions {
            addr,
            addr_bind: None,
            addr_name: String::new(),
            kind,
            permissions: PermissionFlags::empty(),
            legacy_whitelisted: false,
            prefer_evict: false,
            keyed_net_group: 0,
            local_nonce: 1,
            local_services: ServiceFlags::NETWORK,
            limits: test_limits(),
        },
    )
}

/// Message processor that records what it sees.
///
/// A `hello` completes the handshake: outbound connections send one when
/// the processor has a greeting, inbound connections answer one with their
/// own. Every received `echo` is answered with the same payload as `reply`.
#[derive(Default)]
pub struct RecordingProcessor {
    pub received: Mutex<Vec<(u64, String, Bytes)>>,
    pub initialized: AtomicUsize,
    pub finalized: AtomicUsize,
    pub greeting: Mutex<Option<Bytes>>,
}

impl RecordingProcessor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Processor whose outbound connections open with `hello`.
    pub fn greeting(payload: &'static [u8]) -> Arc<Self> {
        let processor = Self::default();
        *processor.greeting.lock() = Some(Bytes::from_static(payload));
        Arc::new(processor)
    }

    /// Messages of type `kind` received so far.
    pub fn received_of(&self, kind: &str) -> Vec<Bytes> {
        self.received
            .lock()
            .iter()
            .filter(|(_, t, _)| t == kind)
            .map(|(_, _, p)| p.clone())
            .collect()
    }

    /// Count per message type.
    pub fn counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for (_, kind, _) in self.received.lock().iter() {
            *counts.entry(kind.clone()).or_insert(0) += 1;
        }
        counts
    }
}

impl MessageProcessor for RecordingProcessor {
    fn initialize_node(&self, manager: &ConnectionManager, node: &PeerConnection) {
        self.initialized.fetch_add(1, Ordering::SeqCst);
        if !node.is_inbound() {
            if let Some(payload) = self.greeting.lock().clone() {
                manager.push_message(node, "hello", payload);
            }
        }
    }

    fn process_messages(&self, manager: &ConnectionManager, node: &PeerConnection) -> bool {
        let Some((msg, more)) = node.poll_message() else {
            return false;
        };
        if msg.msg_type == "hello" && !node.successfully_connected() {
            node.set_successfully_connected();
            if node.is_inbound() {
                manager.push_message(node, "hello", Bytes::from_static(b"welcome"));
            }
        }
        if msg.msg_type == "echo" {
            manager.push_message(node, "reply", msg.payload.clone());
        }
        self.received.lock().push((node.id(), msg.msg_type, msg.payload));
        more
    }

    fn send_messages(&self, _manager: &ConnectionManager, _node: &PeerConnection) {}

    fn finalize_node(&self, _manager: &ConnectionManager, _node: &PeerConnection) -> bool {
        self.finalized.fetch_add(1, Ordering::SeqCst);
        false
    }
}

/// Configuration for a manager that only does what a test asks of it.
pub fn quiet_config() -> ConnectionManagerConfig {
    ConnectionManagerConfig {
        magic: TEST_MAGIC,
        listen: false,
        discover: false,
        dns_seed: false,
        use_addrman_outgoing: false,
        ..Default::default()
    }
}

/// Configuration for a manager listening on an ephemeral loopback port.
pub fn listening_config() -> ConnectionManagerConfig {
    ConnectionManagerConfig {
        listen: true,
        binds: vec!["127.0.0.1:0".parse().expect("valid bind address")],
        ..quiet_config()
    }
}

/// A manager with fresh collaborators.
pub fn test_manager(config: ConnectionManagerConfig, processor: Arc<dyn MessageProcessor>) -> Arc<ConnectionManager> {
    let local = Arc::new(LocalAddresses::new(config.discover, config.listen, config.default_port));
    ConnectionManager::new(
        config,
        processor,
        Arc::new(MemoryAddressStore::new()),
        Arc::new(BanList::new()),
        local,
    )
    .expect("valid test configuration")
}

/// Start a listening manager and return it with its bound address.
pub async fn start_listener(processor: Arc<dyn MessageProcessor>) -> (Arc<ConnectionManager>, SocketAddr) {
    start_listener_with(listening_config(), processor).await
}

pub async fn start_listener_with(
    config: ConnectionManagerConfig,
    processor: Arc<dyn MessageProcessor>,
) -> (Arc<ConnectionManager>, SocketAddr) {
    let manager = test_manager(config, processor);
    manager.start().await.expect("listener starts");
    let addr = manager.listen_addrs()[0];
    (manager, addr)
}

/// Poll `cond` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

/// Wait for `count` connections in `direction`.
pub async fn wait_for_connections(manager: &ConnectionManager, direction: ConnectionDirection, count: usize) -> bool {
    wait_until(Duration::from_secs(10), || manager.node_count(direction) == count).await
}
