//! Node implementation.
//!
//! Wires the address store, ban list and local addresses into a
//! [`ConnectionManager`] and drives it with a minimal message processor
//! that only speaks the handshake, keep-alive and address messages.

use crate::config::NodeConfig;
use crate::wire::{self, VersionMessage, MAX_ADDR_TO_SEND};
use anyhow::{Context, Result};
use bytes::Bytes;
use fxc_network::addrman::{GETADDR_MAX, GETADDR_MAX_PCT};
use fxc_network::protocol::BIP0031_VERSION;
use fxc_network::{
    msg_type, unix_time, unix_time_micros, AddressStore, BanList, ConnectionManager, LocalAddresses,
    MemoryAddressStore, MessageProcessor, PeerConnection, PROTOCOL_VERSION,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Oldest protocol version we talk to.
pub const MIN_PEER_PROTO_VERSION: i32 = 31800;
/// Time between pings.
const PING_INTERVAL: Duration = Duration::from_secs(2 * 60);
/// How often the address store is written out.
const DUMP_ADDRESSES_INTERVAL: Duration = Duration::from_secs(15 * 60);
/// Timestamps of relayed addresses are aged by this much.
const ADDR_TIME_PENALTY: i64 = 2 * 60 * 60;

/// Handshake, ping and address handling.
pub struct NodeProcessor {
    user_agent: String,
    /// Peers that already asked for addresses.
    getaddr_answered: Mutex<HashSet<u64>>,
}

impl NodeProcessor {
    pub fn new() -> Self {
        Self {
            user_agent: format!("/fxc-rust-node:{}/", env!("CARGO_PKG_VERSION")),
            getaddr_answered: Mutex::new(HashSet::new()),
        }
    }

    fn push_version(&self, manager: &ConnectionManager, node: &PeerConnection) {
        let (addr_from, _) = manager
            .local_addresses()
            .local_address(Some(&node.addr()), manager.local_services());
        let msg = VersionMessage {
            version: PROTOCOL_VERSION,
            services: node.local_services(),
            timestamp: unix_time(),
            addr_recv: node.addr(),
            addr_from,
            nonce: node.local_nonce(),
            user_agent: self.user_agent.clone(),
            start_height: 0,
            relay: true,
        };
        manager.push_message(node, msg_type::VERSION, msg.encode());
        debug!(peer = node.id(), "Sent version");
    }

    fn handle_message(&self, manager: &ConnectionManager, node: &PeerConnection, kind: &str, payload: &Bytes) -> Result<()> {
        if kind != msg_type::VERSION && node.version() == 0 {
            debug!(peer = node.id(), msg_type = kind, "Ignoring message before version");
            return Ok(());
        }

        match kind {
            msg_type::VERSION => self.on_version(manager, node, payload)?,
            msg_type::VERACK => {
                node.set_successfully_connected();
                if !node.is_inbound() {
                    info!(
                        peer = node.id(),
                        version = node.version(),
                        kind = %node.kind(),
                        "New outbound peer connected"
                    );
                }
            }
            msg_type::PING => {
                if node.version() > BIP0031_VERSION {
                    let nonce = wire::decode_nonce(payload)?;
                    manager.push_message(node, msg_type::PONG, wire::encode_nonce(nonce));
                }
            }
            msg_type::PONG => {
                let nonce = wire::decode_nonce(payload)?;
                if !node.pong_received(nonce) {
                    debug!(peer = node.id(), nonce, "Unsolicited pong");
                }
            }
            msg_type::GETADDR => {
                // Inbound peers only, once each.
                if !node.is_inbound() || !self.getaddr_answered.lock().insert(node.id()) {
                    return Ok(());
                }
                let addrs = manager.address_store().get_addr(GETADDR_MAX, GETADDR_MAX_PCT);
                for chunk in addrs.chunks(MAX_ADDR_TO_SEND) {
                    manager.push_message(node, msg_type::ADDR, wire::encode_addr(chunk));
                }
            }
            msg_type::ADDR => self.on_addr(manager, node, payload)?,
            other => debug!(peer = node.id(), msg_type = other, "Unhandled message"),
        }
        Ok(())
    }

    fn on_version(&self, manager: &ConnectionManager, node: &PeerConnection, payload: &Bytes) -> Result<()> {
        if node.version() != 0 {
            debug!(peer = node.id(), "Duplicate version message");
            return Ok(());
        }
        let msg = VersionMessage::decode(payload)?;

        if msg.version < MIN_PEER_PROTO_VERSION {
            debug!(peer = node.id(), version = msg.version, "Peer using obsolete version, disconnecting");
            node.mark_for_disconnect();
            return Ok(());
        }
        if node.is_inbound() && !manager.check_incoming_nonce(msg.nonce) {
            info!(addr = %manager.config().display_addr(&node.addr()), "Connected to self, disconnecting");
            node.mark_for_disconnect();
            return Ok(());
        }

        if node.is_inbound() {
            self.push_version(manager, node);
        }
        node.set_services(msg.services);
        node.set_relay_txes(msg.relay);
        node.set_sub_ver(&msg.user_agent);
        node.set_version(msg.version);
        let send_version = msg.version.min(PROTOCOL_VERSION);
        if let Err(e) = node.set_send_version(send_version) {
            error!(peer = node.id(), error = %e, "Send version already set");
        }
        if let Err(e) = node.set_addr_local(msg.addr_recv) {
            error!(peer = node.id(), error = %e, "Local address already set");
        }
        manager.push_message(node, msg_type::VERACK, Bytes::new());

        if !node.is_inbound() {
            let store = manager.address_store();
            store.set_services(&node.addr(), msg.services);
            manager.push_message(node, msg_type::GETADDR, Bytes::new());
            store.good(&node.addr(), unix_time());
        }
        debug!(
            peer = node.id(),
            version = msg.version,
            user_agent = %msg.user_agent,
            services = msg.services.bits(),
            "Received version"
        );

        if node.is_feeler() {
            debug!(peer = node.id(), "Feeler connection completed");
            node.mark_for_disconnect();
        }
        Ok(())
    }

    fn on_addr(&self, manager: &ConnectionManager, node: &PeerConnection, payload: &Bytes) -> Result<()> {
        let mut addrs = wire::decode_addr(payload)?;
        let now = unix_time();
        addrs.retain(|a| a.addr.port() != 0 && !manager.ban_list().is_banned(&a.addr.ip()));
        for addr in &mut addrs {
            // Timestamps from the future or the distant past get a
            // plausible age instead.
            if addr.time <= 100_000_000 || addr.time > now + 10 * 60 {
                addr.time = now - 5 * 24 * 60 * 60;
            }
        }
        let added = manager
            .address_store()
            .add(&addrs, node.addr().ip(), ADDR_TIME_PENALTY);
        debug!(peer = node.id(), received = addrs.len(), added, "Received addresses");

        if node.is_one_shot() {
            node.mark_for_disconnect();
        }
        Ok(())
    }
}

impl Default for NodeProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageProcessor for NodeProcessor {
    fn initialize_node(&self, manager: &ConnectionManager, node: &PeerConnection) {
        if !node.is_inbound() {
            self.push_version(manager, node);
        }
    }

    fn process_messages(&self, manager: &ConnectionManager, node: &PeerConnection) -> bool {
        let Some((msg, more)) = node.poll_message() else {
            return false;
        };
        if !msg.checksum_ok {
            debug!(peer = node.id(), msg_type = %msg.msg_type, "Checksum mismatch, ignoring message");
            return more;
        }
        if let Err(e) = self.handle_message(manager, node, &msg.msg_type, &msg.payload) {
            warn!(peer = node.id(), msg_type = %msg.msg_type, error = %e, "Malformed message");
            manager.ban_list().discourage(node.addr().ip());
            node.mark_for_disconnect();
        }
        more
    }

    fn send_messages(&self, manager: &ConnectionManager, node: &PeerConnection) {
        if node.version() == 0 || node.marked_for_disconnect() {
            return;
        }
        let now = unix_time_micros();
        let due = node.ping_start_micros() + PING_INTERVAL.as_micros() as i64 <= now;
        if node.ping_nonce_sent() == 0 && (due || node.ping_queued()) {
            if node.version() > BIP0031_VERSION {
                let nonce = loop {
                    let n: u64 = rand::random();
                    if n != 0 {
                        break n;
                    }
                };
                node.start_ping(nonce);
                manager.push_message(node, msg_type::PING, wire::encode_nonce(nonce));
            } else {
                // Old peers never answer; no nonce, no ping timeout.
                node.start_ping(0);
                manager.push_message(node, msg_type::PING, Bytes::new());
            }
            node.schedule_send(Instant::now() + PING_INTERVAL);
        }
    }

    fn finalize_node(&self, _manager: &ConnectionManager, node: &PeerConnection) -> bool {
        self.getaddr_answered.lock().remove(&node.id());
        node.successfully_connected() && !node.is_inbound() && !node.is_feeler()
    }
}

/// The running node.
pub struct Node {
    config: NodeConfig,
    manager: Arc<ConnectionManager>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Create a new node.
    pub fn new(config: NodeConfig) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", config.data_dir))?;

        let manager_config = config.manager_config()?;
        let store: Arc<dyn AddressStore> =
            Arc::new(MemoryAddressStore::load(config.peers_path()).context("Failed to load peers file")?);
        let local = Arc::new(LocalAddresses::new(
            manager_config.discover,
            manager_config.listen,
            manager_config.default_port,
        ));
        let manager = ConnectionManager::new(
            manager_config,
            Arc::new(NodeProcessor::new()),
            store,
            Arc::new(BanList::new()),
            local,
        )?;

        Ok(Arc::new(Self {
            config,
            manager,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Start networking and the periodic address dump.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        info!(network = ?self.config.network, data_dir = ?self.config.data_dir, "Starting node services");
        self.manager.start().await.context("Failed to start networking")?;

        let manager = Arc::clone(&self.manager);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(DUMP_ADDRESSES_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => manager.dump_addresses(),
                    _ = manager.interrupted() => break,
                }
            }
        });
        self.tasks.lock().push(handle);
        Ok(())
    }

    /// Interrupt, then stop the network and flush state.
    pub async fn shutdown(&self) {
        info!("Shutting down node...");
        self.manager.interrupt();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
        }
        self.manager.stop().await;
        info!("Node shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fxc_network::peer::{ConnectionKind, PeerLimits, PeerOptions};
    use fxc_network::protocol::HEADER_SIZE;
    use fxc_network::socket::Transport;
    use fxc_network::{ConnectionManagerConfig, PermissionFlags, ServiceFlags};
    use futures::future::{BoxFuture, FutureExt};
    use std::io;
    use tokio::io::{Interest, Ready};

    struct SinkTransport(Mutex<Vec<u8>>);

    impl Transport for SinkTransport {
        fn try_send(&self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn try_recv(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        }

        fn ready(self: Arc<Self>, _interest: Interest) -> BoxFuture<'static, io::Result<Ready>> {
            futures::future::pending().boxed()
        }

        fn shutdown(&self) {}
    }

    fn manager() -> Arc<ConnectionManager> {
        let config = ConnectionManagerConfig {
            listen: false,
            dns_seed: false,
            ..Default::default()
        };
        ConnectionManager::new(
            config,
            Arc::new(NodeProcessor::new()),
            Arc::new(MemoryAddressStore::new()),
            Arc::new(BanList::new()),
            Arc::new(LocalAddresses::new(false, false, 7890)),
        )
        .unwrap()
    }

    fn peer(kind: ConnectionKind, nonce: u64) -> PeerConnection {
        PeerConnection::new(
            1,
            Arc::new(SinkTransport(Mutex::new(Vec::new()))),
            PeerOptions {
                addr: "8.8.8.8:7890".parse().unwrap(),
                addr_bind: None,
                addr_name: String::new(),
                kind,
                permissions: PermissionFlags::empty(),
                legacy_whitelisted: false,
                prefer_evict: false,
                keyed_net_group: 0,
                local_nonce: nonce,
                local_services: ServiceFlags::NETWORK,
                limits: PeerLimits {
                    magic: fxc_network::MAINNET_MAGIC,
                    max_message_size: 1 << 20,
                    receive_flood_size: 1 << 20,
                    send_buffer_max_size: 1 << 20,
                },
            },
        )
    }

    fn version_payload(version: i32, nonce: u64) -> Bytes {
        VersionMessage {
            version,
            services: ServiceFlags::NETWORK,
            timestamp: unix_time(),
            addr_recv: "1.2.3.4:7890".parse().unwrap(),
            addr_from: "8.8.8.8:7890".parse().unwrap(),
            nonce,
            user_agent: "/test:1.0/".to_string(),
            start_height: 0,
            relay: false,
        }
        .encode()
    }

    #[test]
    fn test_inbound_handshake() {
        let manager = manager();
        let processor = NodeProcessor::new();
        let node = peer(ConnectionKind::Inbound, 7);

        processor
            .handle_message(&manager, &node, msg_type::VERSION, &version_payload(PROTOCOL_VERSION, 99))
            .unwrap();
        assert_eq!(node.version(), PROTOCOL_VERSION);
        assert_eq!(node.send_version(), PROTOCOL_VERSION);
        assert!(!node.relay_txes());
        assert_eq!(node.sub_ver(), "/test:1.0/");
        assert_eq!(node.addr_local(), Some("1.2.3.4:7890".parse().unwrap()));
        assert!(!node.successfully_connected());
        // version + verack went out.
        assert!(node.stats().bytes_sent_per_msg[msg_type::VERSION] > 0);
        assert!(node.stats().bytes_sent_per_msg[msg_type::VERACK] > 0);

        processor
            .handle_message(&manager, &node, msg_type::VERACK, &Bytes::new())
            .unwrap();
        assert!(node.successfully_connected());
        assert!(!processor.finalize_node(&manager, &node));
    }

    #[test]
    fn test_obsolete_version_disconnects() {
        let manager = manager();
        let processor = NodeProcessor::new();
        let node = peer(ConnectionKind::Outbound, 7);
        processor
            .handle_message(&manager, &node, msg_type::VERSION, &version_payload(209, 1))
            .unwrap();
        assert!(node.marked_for_disconnect());
        assert_eq!(node.version(), 0);
    }

    #[test]
    fn test_feeler_disconnects_after_version() {
        let manager = manager();
        let processor = NodeProcessor::new();
        let node = peer(ConnectionKind::Feeler, 7);
        processor
            .handle_message(&manager, &node, msg_type::VERSION, &version_payload(PROTOCOL_VERSION, 1))
            .unwrap();
        assert!(node.marked_for_disconnect());
    }

    #[test]
    fn test_ping_pong() {
        let manager = manager();
        let processor = NodeProcessor::new();
        let node = peer(ConnectionKind::Outbound, 7);
        processor
            .handle_message(&manager, &node, msg_type::VERSION, &version_payload(PROTOCOL_VERSION, 1))
            .unwrap();

        processor.send_messages(&manager, &node);
        let nonce = node.ping_nonce_sent();
        assert_ne!(nonce, 0);
        assert!(node.next_send().is_some());

        processor
            .handle_message(&manager, &node, msg_type::PONG, &wire::encode_nonce(nonce))
            .unwrap();
        assert_eq!(node.ping_nonce_sent(), 0);
        assert!(node.min_ping_micros() < i64::MAX);
    }

    #[test]
    fn test_old_peer_gets_ping_without_nonce() {
        let manager = manager();
        let processor = NodeProcessor::new();
        let node = peer(ConnectionKind::Outbound, 7);
        processor
            .handle_message(&manager, &node, msg_type::VERSION, &version_payload(BIP0031_VERSION, 1))
            .unwrap();
        assert_eq!(node.version(), BIP0031_VERSION);

        processor.send_messages(&manager, &node);
        // Header only, and nothing outstanding to time out.
        assert_eq!(node.stats().bytes_sent_per_msg[msg_type::PING], HEADER_SIZE as u64);
        assert_eq!(node.ping_nonce_sent(), 0);
        assert!(node.ping_start_micros() > 0);
        assert!(node.next_send().is_some());

        // Not due again until the interval passes.
        processor.send_messages(&manager, &node);
        assert_eq!(node.stats().bytes_sent_per_msg[msg_type::PING], HEADER_SIZE as u64);
    }

    #[test]
    fn test_addr_learning_and_one_shot() {
        let manager = manager();
        let processor = NodeProcessor::new();
        let node = peer(ConnectionKind::OneShot, 7);
        processor
            .handle_message(&manager, &node, msg_type::VERSION, &version_payload(PROTOCOL_VERSION, 1))
            .unwrap();

        let addrs = vec![
            fxc_network::AddrInfo::new("9.9.9.9:7890".parse().unwrap(), ServiceFlags::NETWORK, unix_time()),
            fxc_network::AddrInfo::new("9.9.9.10:0".parse().unwrap(), ServiceFlags::NETWORK, unix_time()),
        ];
        processor
            .handle_message(&manager, &node, msg_type::ADDR, &wire::encode_addr(&addrs))
            .unwrap();
        assert_eq!(manager.address_store().size(), 1);
        assert!(node.marked_for_disconnect());
    }

    #[test]
    fn test_messages_before_version_ignored() {
        let manager = manager();
        let processor = NodeProcessor::new();
        let node = peer(ConnectionKind::Inbound, 7);
        processor
            .handle_message(&manager, &node, msg_type::VERACK, &Bytes::new())
            .unwrap();
        assert!(!node.successfully_connected());
        assert!(processor
            .handle_message(&manager, &node, msg_type::VERSION, &Bytes::from_static(&[1, 2, 3]))
            .is_err());
    }
}
