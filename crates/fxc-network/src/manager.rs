//! Connection manager.
//!
//! Owns every peer connection and runs the long-lived tasks over them:
//! - the socket loop (accept, read, write, inactivity checks, cleanup)
//! - the outbound loop (one-shots, address-store picks, feelers)
//! - the add-node loop
//! - DNS seeding
//! - message dispatch to the [`MessageProcessor`]
//!
//! All tasks share one cancellation token; [`ConnectionManager::interrupt`]
//! wakes every sleep and closes the admission gates.

use crate::addrman::{AddrInfo, AddressStore};
use crate::ban::BanList;
use crate::bandwidth::Bandwidth;
use crate::config::ConnectionManagerConfig;
use crate::discovery::{fixed_seed_addrs, fixed_seed_source, PeerDiscovery, SeedOutcome};
use crate::eviction::{select_victim, EvictionCandidate};
use crate::local::{LocalAddresses, LocalScore};
use crate::netaddr::{canonical_addr, group, is_routable, is_valid, network_of, parse_numeric, split_host_port, subnet_contains, Network};
use crate::outbound::{choose_next_candidate, feeler_delay, poisson_next_send, SelectionContext};
use crate::peer::{ConnectionKind, NodeId, PeerConnection, PeerLimits, PeerOptions, PeerRef, PeerStats};
use crate::permissions::{whitelisted_permissions, PermissionFlags};
use crate::processor::MessageProcessor;
use crate::protocol::{has_all_desirable_service_flags, ServiceFlags, BIP0031_VERSION};
use crate::socket::{bind_listener, connect_direct, connect_through_proxy, lookup, TcpTransport};
use crate::{unix_time, unix_time_micros, NetworkError, NetworkResult};
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use ipnet::IpNet;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::Serialize;
use siphasher::sip::SipHasher24;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hasher;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{Interest, Ready};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const RANDOMIZER_ID_NETGROUP: u64 = 0x6c0e_dd80_36ef_4036;
const RANDOMIZER_ID_LOCALHOSTNONCE: u64 = 0xd93e_69e2_bbfa_5735;

/// Fixed seeds go in if the store is still empty this long after the
/// outbound loop starts.
const FIXED_SEED_DELAY: Duration = Duration::from_secs(60);
/// Wait before deciding whether DNS seeding is needed at all.
const DNS_SEED_GRACE: Duration = Duration::from_secs(11);
const OUTBOUND_LOOP_SLEEP: Duration = Duration::from_millis(500);
const ADDNODE_SPACING: Duration = Duration::from_millis(500);
const ADDNODE_RETRY: Duration = Duration::from_secs(60);
const ADDNODE_IDLE: Duration = Duration::from_secs(2);
/// Interval for periodic cleanup tasks (expired bans).
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
/// Most addresses taken from resolving one name.
const MAX_RESOLVED: usize = 256;

/// Which connections to count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDirection {
    Inbound,
    Outbound,
    All,
}

/// State of one operator-added node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddedNodeInfo {
    /// The string the operator added.
    pub added_node: String,
    pub resolved: Option<SocketAddr>,
    pub connected: bool,
    pub inbound: bool,
}

#[derive(Clone)]
struct Listener {
    socket: Arc<TcpListener>,
    addr: SocketAddr,
    permissions: PermissionFlags,
}

/// Where an outbound connection goes.
enum Target {
    Address(AddrInfo),
    Name(String),
}

enum SocketEvent {
    Accept(usize, io::Result<(TcpStream, SocketAddr)>),
    Peer(NodeId, io::Result<Ready>),
}

/// Owns the peer set and every task that works on it.
pub struct ConnectionManager {
    config: ConnectionManagerConfig,
    processor: Arc<dyn MessageProcessor>,
    store: Arc<dyn AddressStore>,
    bans: Arc<BanList>,
    local: Arc<LocalAddresses>,
    bandwidth: Bandwidth,

    /// Active connections. Structural changes take the write lock.
    nodes: RwLock<Vec<Arc<PeerConnection>>>,
    /// Removed from the active set, waiting for their references to drain.
    disconnected: Mutex<Vec<Arc<PeerConnection>>>,
    /// Outbound admission permits, held for the life of the connection.
    grants: Mutex<HashMap<NodeId, OwnedSemaphorePermit>>,
    listeners: Mutex<Vec<Listener>>,
    one_shots: Mutex<VecDeque<String>>,
    added_nodes: Mutex<Vec<String>>,

    outbound_gate: Arc<Semaphore>,
    addnode_gate: Arc<Semaphore>,

    network_active: AtomicBool,
    try_new_outbound: AtomicBool,
    addresses_initialized: AtomicBool,
    last_node_id: AtomicU64,
    prev_node_count: AtomicUsize,
    seed: (u64, u64),

    cancel: CancellationToken,
    wake: Notify,
    wake_pending: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Create a manager. Nothing runs until [`ConnectionManager::start`].
    pub fn new(
        config: ConnectionManagerConfig,
        processor: Arc<dyn MessageProcessor>,
        store: Arc<dyn AddressStore>,
        bans: Arc<BanList>,
        local: Arc<LocalAddresses>,
    ) -> NetworkResult<Arc<Self>> {
        config.validate()?;

        if !config.only_nets.is_empty() {
            for net in Network::REACHABLE {
                local.set_reachable(net, config.only_nets.contains(&net));
            }
        }

        let outbound_slots = (config.max_outbound + config.max_feeler).min(config.max_connections);
        let mut rng = rand::thread_rng();
        Ok(Arc::new(Self {
            bandwidth: Bandwidth::new(config.max_outbound_target, config.max_outbound_timeframe),
            nodes: RwLock::new(Vec::new()),
            disconnected: Mutex::new(Vec::new()),
            grants: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            one_shots: Mutex::new(VecDeque::new()),
            added_nodes: Mutex::new(config.added_nodes.clone()),
            outbound_gate: Arc::new(Semaphore::new(outbound_slots)),
            addnode_gate: Arc::new(Semaphore::new(config.max_addnode)),
            network_active: AtomicBool::new(true),
            try_new_outbound: AtomicBool::new(false),
            addresses_initialized: AtomicBool::new(false),
            last_node_id: AtomicU64::new(0),
            prev_node_count: AtomicUsize::new(0),
            seed: (rng.gen(), rng.gen()),
            cancel: CancellationToken::new(),
            wake: Notify::new(),
            wake_pending: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            config,
            processor,
            store,
            bans,
            local,
        }))
    }

    // Lifecycle.

    /// Bind listeners and spawn the network tasks.
    ///
    /// Fails if listening is enabled and no port could be bound.
    pub async fn start(self: &Arc<Self>) -> NetworkResult<()> {
        if self.config.listen {
            self.init_binds()?;
        }
        for seed in &self.config.seed_nodes {
            self.add_one_shot(seed);
        }
        self.addresses_initialized.store(true, Ordering::Release);
        info!(addresses = self.store.size(), "Starting network tasks");

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(Arc::clone(self).socket_loop()));
        if self.config.dns_seed {
            tasks.push(tokio::spawn(Arc::clone(self).dns_seed_loop()));
        } else {
            info!("DNS seeding disabled");
        }
        tasks.push(tokio::spawn(Arc::clone(self).addnode_loop()));
        if self.config.use_addrman_outgoing || !self.config.connect.is_empty() {
            tasks.push(tokio::spawn(Arc::clone(self).outbound_loop()));
        }
        tasks.push(tokio::spawn(Arc::clone(self).dispatch_loop()));
        tasks.push(tokio::spawn(Arc::clone(self).cleanup_loop()));
        self.tasks.lock().extend(tasks);
        Ok(())
    }

    /// Signal every task to stop and wake anything sleeping.
    pub fn interrupt(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        info!("Interrupting network tasks");
        self.cancel.cancel();
        self.wake.notify_waiters();
        // Closing the gates wakes loops blocked on a permit.
        self.outbound_gate.close();
        self.addnode_gate.close();
    }

    /// Join the tasks, flush addresses, close every socket, then finalize
    /// and free every connection.
    pub async fn stop(&self) {
        self.interrupt();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Network task ended abnormally");
            }
        }

        if self.addresses_initialized.swap(false, Ordering::AcqRel) {
            self.dump_addresses();
        }

        let nodes = std::mem::take(&mut *self.nodes.write());
        for node in &nodes {
            node.close();
        }
        self.listeners.lock().clear();
        self.grants.lock().clear();

        let disconnected = std::mem::take(&mut *self.disconnected.lock());
        for node in nodes.iter().chain(disconnected.iter()) {
            self.delete_node(node);
        }
        info!("Network stopped");
    }

    /// Whether [`ConnectionManager::interrupt`] has been called.
    pub fn is_interrupted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Completes once [`ConnectionManager::interrupt`] has been called.
    pub async fn interrupted(&self) {
        self.cancel.cancelled().await
    }

    /// Sleep unless interrupted first. Returns false on interrupt.
    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    fn init_binds(&self) -> NetworkResult<()> {
        let mut bound = false;
        for addr in &self.config.binds {
            bound |= self.bind(*addr, PermissionFlags::empty(), true);
        }
        for entry in &self.config.white_binds {
            bound |= self.bind(entry.addr, entry.flags, true);
        }
        if self.config.binds.is_empty() && self.config.white_binds.is_empty() {
            let port = self.config.default_port;
            bound |= self.bind(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port), PermissionFlags::empty(), false);
            bound |= self.bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port), PermissionFlags::empty(), false);
        }
        if !bound {
            return Err(NetworkError::Config(
                "Failed to listen on any port. Disable listening if you want this.".into(),
            ));
        }
        Ok(())
    }

    fn bind(&self, addr: SocketAddr, permissions: PermissionFlags, explicit: bool) -> bool {
        if !explicit && !self.local.is_reachable(&addr.ip()) {
            return false;
        }
        let listener = match bind_listener(addr) {
            Ok(listener) => listener,
            Err(e) => {
                if explicit {
                    error!(addr = %addr, error = %e, "Failed to bind");
                } else {
                    debug!(addr = %addr, error = %e, "Failed to bind");
                }
                return false;
            }
        };
        let bound = listener.local_addr().map(canonical_addr).unwrap_or(addr);
        info!(addr = %bound, "Listening for P2P connections");

        if is_routable(&addr.ip()) && !permissions.contains(PermissionFlags::NOBAN) {
            self.local.add_local(bound, LocalScore::Bind);
        }
        self.listeners.lock().push(Listener {
            socket: Arc::new(listener),
            addr: bound,
            permissions,
        });
        true
    }

    /// Addresses we are listening on.
    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.lock().iter().map(|l| l.addr).collect()
    }

    // Socket loop.

    async fn socket_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; self.config.recv_chunk_size];
        while !self.cancel.is_cancelled() {
            self.disconnect_nodes();
            self.notify_connection_count();
            self.socket_handler(&mut buf).await;
        }
        debug!("Socket loop stopped");
    }

    async fn socket_handler(&self, buf: &mut [u8]) {
        let listeners: Vec<Listener> = self.listeners.lock().clone();
        let snapshot = self.snapshot_refs();

        let mut pending: FuturesUnordered<BoxFuture<'static, SocketEvent>> = FuturesUnordered::new();
        for (index, listener) in listeners.iter().enumerate() {
            let socket = Arc::clone(&listener.socket);
            pending.push(async move { SocketEvent::Accept(index, socket.accept().await) }.boxed());
        }
        for node in &snapshot {
            let Some(transport) = node.transport() else {
                continue;
            };
            let id = node.id();
            let ready = transport.ready(socket_interest(node));
            pending.push(async move { SocketEvent::Peer(id, ready.await) }.boxed());
        }

        let events = self.wait_for_events(&mut pending).await;
        drop(pending);
        if self.cancel.is_cancelled() {
            return;
        }
        self.service_sockets(events, &listeners, &snapshot, buf);
    }

    /// Wait up to the select timeout for the first event, then collect
    /// whatever else is already ready.
    async fn wait_for_events(
        &self,
        pending: &mut FuturesUnordered<BoxFuture<'static, SocketEvent>>,
    ) -> Vec<SocketEvent> {
        let mut events = Vec::new();
        if pending.is_empty() {
            self.sleep(self.config.select_timeout).await;
            return events;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return events,
            first = tokio::time::timeout(self.config.select_timeout, pending.next()) => {
                if let Ok(Some(event)) = first {
                    events.push(event);
                }
            }
        }
        while let Some(Some(event)) = pending.next().now_or_never() {
            events.push(event);
        }
        events
    }

    fn service_sockets(&self, events: Vec<SocketEvent>, listeners: &[Listener], snapshot: &[PeerRef], buf: &mut [u8]) {
        let mut peer_events = HashMap::new();
        for event in events {
            match event {
                SocketEvent::Accept(index, Ok((stream, addr))) => {
                    let permissions = listeners
                        .get(index)
                        .map(|l| l.permissions)
                        .unwrap_or_else(PermissionFlags::empty);
                    self.accept_connection(stream, addr, permissions);
                }
                SocketEvent::Accept(_, Err(e)) => {
                    if e.kind() != io::ErrorKind::WouldBlock {
                        warn!(error = %e, "Socket error, accept failed");
                    }
                }
                SocketEvent::Peer(id, ready) => {
                    peer_events.insert(id, ready);
                }
            }
        }

        for node in snapshot {
            if self.cancel.is_cancelled() {
                return;
            }
            match peer_events.remove(&node.id()) {
                Some(Ok(ready)) if ready.is_error() => {
                    if !node.marked_for_disconnect() {
                        warn!(peer = node.id(), "Socket error reported, disconnecting");
                    }
                    node.close();
                }
                Some(Ok(ready)) => {
                    if ready.is_readable() || ready.is_read_closed() {
                        self.receive_from(node, buf);
                    }
                    if ready.is_writable() {
                        let sent = node.drain_send_queue();
                        if sent > 0 {
                            self.bandwidth.record_sent(sent as u64);
                        }
                    }
                }
                Some(Err(e)) => {
                    if !node.marked_for_disconnect() {
                        warn!(peer = node.id(), error = %e, "Socket error");
                    }
                    node.close();
                }
                None => {}
            }
            self.inactivity_check(node);
        }
    }

    /// One bounded read from a peer socket.
    fn receive_from(&self, node: &PeerConnection, buf: &mut [u8]) {
        let Some(transport) = node.transport() else {
            return;
        };
        match transport.try_recv(buf) {
            Ok(0) => {
                if !node.marked_for_disconnect() {
                    debug!(peer = node.id(), "Socket closed");
                }
                node.close();
            }
            Ok(n) => {
                match node.receive_bytes(&buf[..n]) {
                    Ok(true) => {
                        node.queue_completed();
                        self.wake_message_handler();
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(peer = node.id(), error = %e, "Framing error, disconnecting");
                        node.close();
                    }
                }
                self.bandwidth.record_recv(n as u64);
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {}
            Err(e) => {
                if !node.marked_for_disconnect() {
                    warn!(peer = node.id(), error = %e, "Socket recv error");
                }
                node.close();
            }
        }
    }

    fn inactivity_check(&self, node: &PeerConnection) {
        if node.marked_for_disconnect() {
            return;
        }
        if let Some(reason) = inactivity_reason(node, &self.config, unix_time(), unix_time_micros()) {
            info!(peer = node.id(), reason, "Disconnecting inactive peer");
            node.mark_for_disconnect();
        }
    }

    /// Move marked connections out of the active set, and free those whose
    /// references have drained.
    fn disconnect_nodes(&self) {
        {
            let mut nodes = self.nodes.write();
            if !self.network_active() {
                for node in nodes.iter().filter(|n| !n.marked_for_disconnect()) {
                    debug!(peer = node.id(), "Network not active, dropping peer");
                    node.mark_for_disconnect();
                }
            }

            let (gone, keep): (Vec<_>, Vec<_>) = nodes.drain(..).partition(|n| n.marked_for_disconnect());
            *nodes = keep;
            if !gone.is_empty() {
                let mut grants = self.grants.lock();
                let mut disconnected = self.disconnected.lock();
                for node in gone {
                    grants.remove(&node.id());
                    node.close();
                    node.release();
                    disconnected.push(node);
                }
            }
        }

        let ready: Vec<Arc<PeerConnection>> = {
            let mut disconnected = self.disconnected.lock();
            let (ready, waiting): (Vec<_>, Vec<_>) = disconnected.drain(..).partition(|n| n.can_delete());
            *disconnected = waiting;
            ready
        };
        for node in ready {
            self.delete_node(&node);
        }
    }

    fn delete_node(&self, node: &PeerConnection) {
        if self.processor.finalize_node(self, node) {
            self.store.connected(&node.addr(), unix_time());
        }
        debug!(peer = node.id(), "Deleted peer");
    }

    fn notify_connection_count(&self) {
        let count = self.nodes.read().len();
        if self.prev_node_count.swap(count, Ordering::Relaxed) != count {
            debug!(connections = count, "Connection count changed");
        }
    }

    /// Working references to every active connection.
    fn snapshot_refs(&self) -> Vec<PeerRef> {
        self.nodes.read().iter().cloned().map(PeerRef::new).collect()
    }

    // Accept path.

    fn accept_connection(&self, stream: TcpStream, addr: SocketAddr, listen_permissions: PermissionFlags) {
        let addr = canonical_addr(addr);
        let shown = self.config.display_addr(&addr);
        let mut permissions = listen_permissions | whitelisted_permissions(&self.config.whitelist, &addr.ip());
        let legacy_whitelisted =
            permissions.expand_implicit(self.config.whitelist_relay, self.config.whitelist_force_relay);

        let inbound = self.nodes.read().iter().filter(|n| n.is_inbound()).count();
        let max_inbound = self.config.max_inbound();

        if !self.network_active() {
            debug!(addr = %shown, "Connection dropped, not accepting new connections");
            return;
        }

        let noban = permissions.contains(PermissionFlags::NOBAN);
        let banned = self.bans.is_banned(&addr.ip());
        if banned && !noban {
            debug!(addr = %shown, "Connection dropped (banned)");
            return;
        }
        let discouraged = self.bans.is_discouraged(&addr.ip());
        if discouraged && !noban && inbound + 1 >= max_inbound {
            debug!(addr = %shown, "Connection dropped (discouraged)");
            return;
        }

        if inbound >= max_inbound && !self.attempt_to_evict_connection() {
            debug!(addr = %shown, "No eviction candidate, connection dropped (full)");
            return;
        }

        let id = self.new_node_id();
        let mut services = self.config.local_services;
        if permissions.contains(PermissionFlags::BLOOMFILTER) {
            services |= ServiceFlags::BLOOM;
        }
        let transport = Arc::new(TcpTransport::new(stream));
        let addr_bind = transport.local_addr();
        let node = PeerConnection::new(
            id,
            transport,
            PeerOptions {
                addr,
                addr_bind,
                addr_name: String::new(),
                kind: ConnectionKind::Inbound,
                permissions,
                legacy_whitelisted,
                prefer_evict: banned || discouraged,
                keyed_net_group: self.keyed_net_group(&addr),
                local_nonce: self.local_nonce(id),
                local_services: services,
                limits: self.peer_limits(),
            },
        );
        self.register(Arc::new(node), None);
        debug!(peer = id, addr = %shown, "Connection accepted");
    }

    /// Evict one inbound peer to make room. Returns whether one was marked.
    fn attempt_to_evict_connection(&self) -> bool {
        let candidates: Vec<EvictionCandidate> = self
            .nodes
            .read()
            .iter()
            .filter(|n| {
                !n.has_permission(PermissionFlags::NOBAN) && n.is_inbound() && !n.marked_for_disconnect()
            })
            .map(|n| self.eviction_candidate(n))
            .collect();

        let Some(victim) = select_victim(candidates, &self.config.eviction) else {
            return false;
        };
        let nodes = self.nodes.read();
        match nodes.iter().find(|n| n.id() == victim) {
            Some(node) => {
                info!(peer = victim, "Evicting inbound peer");
                node.mark_for_disconnect();
                true
            }
            None => false,
        }
    }

    fn eviction_candidate(&self, node: &PeerConnection) -> EvictionCandidate {
        EvictionCandidate {
            id: node.id(),
            connected: node.connected_at(),
            min_ping_time: node.min_ping_micros(),
            last_block_time: node.last_block_time(),
            last_tx_time: node.last_tx_time(),
            relevant_services: has_all_desirable_service_flags(node.services(), self.config.desirable_services),
            relay_txes: node.relay_txes(),
            bloom_filter: node.has_filter(),
            addr: node.addr(),
            keyed_net_group: node.keyed_net_group(),
            prefer_evict: node.prefer_evict(),
        }
    }

    /// Add a connection to the active set and hand it to the processor.
    fn register(&self, node: Arc<PeerConnection>, grant: Option<OwnedSemaphorePermit>) {
        node.add_ref();
        if let Some(grant) = grant {
            self.grants.lock().insert(node.id(), grant);
        }
        self.processor.initialize_node(self, &node);
        self.nodes.write().push(node);
    }

    fn new_node_id(&self) -> NodeId {
        self.last_node_id.fetch_add(1, Ordering::Relaxed)
    }

    fn peer_limits(&self) -> PeerLimits {
        PeerLimits {
            magic: self.config.magic,
            max_message_size: self.config.max_message_size,
            receive_flood_size: self.config.receive_flood_size,
            send_buffer_max_size: self.config.send_buffer_max_size,
        }
    }

    fn randomizer(&self, id: u64) -> SipHasher24 {
        let mut hasher = SipHasher24::new_with_keys(self.seed.0, self.seed.1);
        hasher.write_u64(id);
        hasher
    }

    /// Salted network group of `addr`, unpredictable to outsiders.
    pub fn keyed_net_group(&self, addr: &SocketAddr) -> u64 {
        let mut hasher = self.randomizer(RANDOMIZER_ID_NETGROUP);
        hasher.write(&group(&addr.ip()));
        hasher.finish()
    }

    fn local_nonce(&self, id: NodeId) -> u64 {
        let mut hasher = self.randomizer(RANDOMIZER_ID_LOCALHOSTNONCE);
        hasher.write_u64(id);
        hasher.finish()
    }

    /// False if `nonce` belongs to one of our own outbound connections that
    /// is still handshaking, i.e. we connected to ourselves.
    pub fn check_incoming_nonce(&self, nonce: u64) -> bool {
        !self
            .nodes
            .read()
            .iter()
            .any(|n| !n.successfully_connected() && !n.is_inbound() && n.local_nonce() == nonce)
    }

    // Outbound connections.

    async fn outbound_loop(self: Arc<Self>) {
        if !self.config.connect.is_empty() {
            self.specified_outbound_loop().await;
            return;
        }

        let start = Instant::now();
        let mut next_feeler = poisson_next_send(start, self.config.feeler_interval);
        let mut fixed_seeds_added = false;
        loop {
            self.process_one_shot().await;
            if !self.sleep(OUTBOUND_LOOP_SLEEP).await {
                return;
            }
            let grant = match Arc::clone(&self.outbound_gate).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            if self.cancel.is_cancelled() {
                return;
            }

            if !fixed_seeds_added && self.store.size() == 0 && start.elapsed() > FIXED_SEED_DELAY {
                info!("Adding fixed seed nodes as DNS doesn't seem to be available");
                let seeds: Vec<&str> = self.config.fixed_seeds.iter().map(String::as_str).collect();
                let addrs = fixed_seed_addrs(&seeds, self.config.desirable_services);
                self.store.add(&addrs, fixed_seed_source(), 0);
                fixed_seeds_added = true;
            }

            let (connected_groups, outbound) = self.outbound_groups();
            let mut feeler = false;
            if outbound >= self.config.effective_max_outbound() && !self.try_new_outbound_peer() {
                let now = Instant::now();
                if now > next_feeler {
                    next_feeler = poisson_next_send(now, self.config.feeler_interval);
                    feeler = true;
                } else {
                    continue;
                }
            }

            self.store.resolve_collisions();
            let candidate = {
                let ctx = SelectionContext {
                    local: &self.local,
                    default_port: self.config.default_port,
                    desirable_services: self.config.desirable_services,
                    now: unix_time(),
                };
                choose_next_candidate(self.store.as_ref(), &connected_groups, feeler, &ctx)
            };
            let Some(candidate) = candidate else {
                continue;
            };

            let kind = if feeler {
                if !self.sleep(feeler_delay(self.config.feeler_sleep_window)).await {
                    return;
                }
                debug!(addr = %self.config.display_addr(&candidate.addr), "Making feeler connection");
                ConnectionKind::Feeler
            } else {
                ConnectionKind::Outbound
            };
            let count_failure = connected_groups.len() >= self.config.max_connections.saturating_sub(1).min(2);
            let mut grant = Some(grant);
            self.open_network_connection(Target::Address(candidate), count_failure, &mut grant, kind)
                .await;
        }
    }

    /// Only dial the configured addresses, backing off a little more each
    /// round.
    async fn specified_outbound_loop(&self) {
        let mut round: usize = 0;
        loop {
            self.process_one_shot().await;
            for dest in &self.config.connect {
                let mut grant = None;
                self.open_network_connection(Target::Name(dest.clone()), false, &mut grant, ConnectionKind::Manual)
                    .await;
                for _ in 0..round.min(10) {
                    if !self.sleep(OUTBOUND_LOOP_SLEEP).await {
                        return;
                    }
                }
            }
            if !self.sleep(OUTBOUND_LOOP_SLEEP).await {
                return;
            }
            round += 1;
        }
    }

    async fn process_one_shot(&self) {
        let next = self.one_shots.lock().pop_front();
        let Some(dest) = next else {
            return;
        };
        if let Ok(permit) = Arc::clone(&self.outbound_gate).try_acquire_owned() {
            let mut grant = Some(permit);
            self.open_network_connection(Target::Name(dest), false, &mut grant, ConnectionKind::OneShot)
                .await;
        }
    }

    /// Queue an address for exactly one connection attempt.
    pub fn add_one_shot(&self, dest: &str) {
        self.one_shots.lock().push_back(dest.to_string());
    }

    /// Network groups of non-manual outbound peers, and how many there are.
    fn outbound_groups(&self) -> (HashSet<Vec<u8>>, usize) {
        let nodes = self.nodes.read();
        let mut groups = HashSet::new();
        let mut count = 0;
        for node in nodes.iter().filter(|n| !n.is_inbound() && !n.is_manual()) {
            groups.insert(group(&node.addr().ip()));
            count += 1;
        }
        (groups, count)
    }

    /// Connect and register. On success the grant moves to the connection.
    async fn open_network_connection(
        &self,
        target: Target,
        count_failure: bool,
        grant: &mut Option<OwnedSemaphorePermit>,
        kind: ConnectionKind,
    ) -> bool {
        if self.cancel.is_cancelled() || !self.network_active() {
            return false;
        }
        match &target {
            Target::Address(info) => {
                let ip = info.addr.ip();
                if self.bans.is_discouraged(&ip)
                    || self.bans.is_banned(&ip)
                    || self.local.is_local(&info.addr)
                    || self.find_node(|n| n.addr().ip() == ip).is_some()
                    || self.find_node(|n| n.addr_name() == info.addr.to_string()).is_some()
                {
                    return false;
                }
            }
            Target::Name(name) => {
                if self.find_node(|n| &n.addr_name() == name).is_some() {
                    return false;
                }
            }
        }

        let Some(node) = self.connect_node(target, count_failure, kind).await else {
            return false;
        };
        self.register(node, grant.take());
        true
    }

    async fn connect_node(&self, target: Target, count_failure: bool, kind: ConnectionKind) -> Option<Arc<PeerConnection>> {
        let (mut addr, dest) = match target {
            Target::Address(info) => (Some(info.addr), None),
            Target::Name(name) => (None, Some(name)),
        };
        let default_port = self.config.default_port;

        if let Some(a) = addr {
            if self.local.is_local(&a) {
                return None;
            }
            if self.find_node(|n| n.addr() == a).is_some() {
                info!("Failed to open new connection, already connected");
                return None;
            }
        }

        if let Some(name) = &dest {
            debug!(dest = %name, kind = %kind, "Trying connection");
            let allow_dns = self.config.allow_dns && self.config.name_proxy.is_none();
            if let Ok(resolved) = lookup(name, default_port, allow_dns, MAX_RESOLVED, self.config.dns_timeout).await {
                if !resolved.is_empty() {
                    let pick = resolved[rand::thread_rng().gen_range(0..resolved.len())];
                    if !is_valid(&pick.ip()) {
                        debug!(dest = %name, addr = %pick, "Resolver returned invalid address");
                        return None;
                    }
                    if self.find_node(|n| n.addr() == pick).is_some() {
                        info!("Failed to open new connection, already connected");
                        return None;
                    }
                    addr = Some(pick);
                }
            }
        } else if let Some(a) = addr {
            debug!(addr = %self.config.display_addr(&a), kind = %kind, "Trying connection");
        }

        let connected = if let Some(a) = addr {
            let result = match self.config.proxies.get(&network_of(&a.ip())) {
                Some(proxy) => {
                    connect_through_proxy(proxy, &a.ip().to_string(), a.port(), self.config.connect_timeout, &self.cancel)
                        .await
                }
                None => connect_direct(a, self.config.connect_timeout, &self.cancel).await,
            };
            match &result {
                // Not the target's fault.
                Err(e) if e.is_proxy_failure() => {}
                Err(NetworkError::Interrupted) => {}
                _ => self.store.attempt(&a, count_failure, unix_time()),
            }
            result
        } else if let (Some(name), Some(proxy)) = (&dest, &self.config.name_proxy) {
            let (host, port) = split_host_port(name);
            connect_through_proxy(proxy, &host, port.unwrap_or(default_port), self.config.connect_timeout, &self.cancel)
                .await
        } else {
            return None;
        };

        let stream = match connected {
            Ok(stream) => stream,
            Err(e) => {
                debug!(kind = %kind, error = %e, "Outbound connection failed");
                return None;
            }
        };

        let id = self.new_node_id();
        let transport = Arc::new(TcpTransport::new(stream));
        let addr_bind = transport.local_addr();
        // Through a name proxy the remote address stays unknown.
        let remote = addr.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
        let node = PeerConnection::new(
            id,
            transport,
            PeerOptions {
                addr: remote,
                addr_bind,
                addr_name: dest.unwrap_or_default(),
                kind,
                permissions: PermissionFlags::empty(),
                legacy_whitelisted: false,
                prefer_evict: false,
                keyed_net_group: self.keyed_net_group(&remote),
                local_nonce: self.local_nonce(id),
                local_services: self.config.local_services,
                limits: self.peer_limits(),
            },
        );
        debug!(peer = id, kind = %kind, "Connected");
        Some(Arc::new(node))
    }

    // Add-node loop.

    async fn addnode_loop(self: Arc<Self>) {
        loop {
            let mut grant = match Arc::clone(&self.addnode_gate).acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => return,
            };
            let mut tried = false;
            for info in self.added_node_info().into_iter().filter(|i| !i.connected) {
                if grant.is_none() {
                    // Do not wait here; the added-node state may change meanwhile.
                    match Arc::clone(&self.addnode_gate).try_acquire_owned() {
                        Ok(permit) => grant = Some(permit),
                        Err(_) => break,
                    }
                }
                tried = true;
                self.open_network_connection(Target::Name(info.added_node), false, &mut grant, ConnectionKind::Manual)
                    .await;
                if !self.sleep(ADDNODE_SPACING).await {
                    return;
                }
            }
            drop(grant);
            if !self.sleep(if tried { ADDNODE_RETRY } else { ADDNODE_IDLE }).await {
                return;
            }
        }
    }

    /// Connection state of every added node.
    pub fn added_node_info(&self) -> Vec<AddedNodeInfo> {
        let added = self.added_nodes.lock().clone();

        let mut by_addr: HashMap<SocketAddr, bool> = HashMap::new();
        let mut by_name: HashMap<String, (bool, SocketAddr)> = HashMap::new();
        for node in self.nodes.read().iter() {
            if is_valid(&node.addr().ip()) {
                by_addr.insert(node.addr(), node.is_inbound());
            }
            let name = node.addr_name();
            if !name.is_empty() {
                by_name.insert(name, (node.is_inbound(), node.addr()));
            }
        }

        added
            .into_iter()
            .map(|name| {
                let mut info = AddedNodeInfo {
                    added_node: name,
                    resolved: None,
                    connected: false,
                    inbound: false,
                };
                if let Some(service) = parse_numeric(&info.added_node, self.config.default_port) {
                    if let Some(inbound) = by_addr.get(&service) {
                        info.resolved = Some(service);
                        info.connected = true;
                        info.inbound = *inbound;
                    }
                } else if let Some((inbound, addr)) = by_name.get(&info.added_node) {
                    info.resolved = Some(*addr);
                    info.connected = true;
                    info.inbound = *inbound;
                }
                info
            })
            .collect()
    }

    /// Add a node to connect to persistently. False if already present.
    pub fn add_node(&self, node: &str) -> bool {
        let mut added = self.added_nodes.lock();
        if added.iter().any(|n| n == node) {
            return false;
        }
        added.push(node.to_string());
        true
    }

    /// Remove an added node. False if it was not there.
    pub fn remove_added_node(&self, node: &str) -> bool {
        let mut added = self.added_nodes.lock();
        match added.iter().position(|n| n == node) {
            Some(index) => {
                added.remove(index);
                true
            }
            None => false,
        }
    }

    // DNS seeding.

    async fn dns_seed_loop(self: Arc<Self>) {
        if self.store.size() > 0 && !self.config.force_dns_seed {
            if !self.sleep(DNS_SEED_GRACE).await {
                return;
            }
            let relevant = self
                .nodes
                .read()
                .iter()
                .filter(|n| n.successfully_connected() && n.kind() == ConnectionKind::Outbound)
                .count();
            if relevant >= 2 {
                info!("P2P peers available, skipped DNS seeding");
                return;
            }
        }

        info!("Loading addresses from DNS seeds");
        let discovery = PeerDiscovery::new(self.config.default_port, self.config.desirable_services)
            .with_timeout(self.config.dns_timeout);
        let name_proxy = self.config.name_proxy.is_some();
        let mut found = 0;
        for seed in &self.config.dns_seeds {
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                outcome = discovery.resolve_seed(seed, name_proxy) => outcome,
            };
            match outcome {
                SeedOutcome::Resolved { source, addrs } => {
                    found += addrs.len();
                    self.store.add(&addrs, source, 0);
                }
                SeedOutcome::OneShot(seed) => self.add_one_shot(&seed),
            }
        }
        info!(found, "Addresses found from DNS seeds");
    }

    // Dispatch.

    async fn dispatch_loop(self: Arc<Self>) {
        let max_sleep = self.config.message_handler_max_sleep;
        while !self.cancel.is_cancelled() {
            let Some((more_work, sleep_until)) = self.dispatch_round() else {
                return;
            };
            if !more_work && !self.wake_pending.load(Ordering::Acquire) {
                let sleep_for = sleep_until.saturating_duration_since(Instant::now()).min(max_sleep);
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return,
                    _ = self.wake.notified() => {}
                    _ = tokio::time::sleep(sleep_for) => {}
                }
            }
            self.wake_pending.store(false, Ordering::Release);
        }
        debug!("Dispatch loop stopped");
    }

    /// Run the processor over every live connection once.
    ///
    /// Returns whether any peer has more work and when the earliest
    /// scheduled send is due, or `None` if interrupted.
    fn dispatch_round(&self) -> Option<(bool, Instant)> {
        let snapshot = self.snapshot_refs();
        let mut more_work = false;
        let mut sleep_until = Instant::now() + self.config.message_handler_max_sleep;

        for node in &snapshot {
            if node.marked_for_disconnect() {
                continue;
            }
            let more = self.processor.process_messages(self, node);
            more_work |= more && !node.send_paused();
            if self.cancel.is_cancelled() {
                return None;
            }
            {
                let _sending = node.lock_send_processing();
                self.processor.send_messages(self, node);
            }
            // A deadline the processor left in the past has been served.
            if let Some(next) = node.next_send().filter(|next| *next > Instant::now()) {
                sleep_until = sleep_until.min(next);
            }
            if self.cancel.is_cancelled() {
                return None;
            }
        }
        Some((more_work, sleep_until))
    }

    fn wake_message_handler(&self) {
        self.wake_pending.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    /// Queue a message on a connection, writing at once if the queue was
    /// empty.
    pub fn push_message(&self, node: &PeerConnection, msg_type: &str, payload: Bytes) {
        match node.enqueue_message(msg_type, payload) {
            Ok(sent) if sent > 0 => self.bandwidth.record_sent(sent as u64),
            Ok(_) => {}
            Err(e) => error!(peer = node.id(), msg_type, error = %e, "Failed to queue message"),
        }
    }

    // Periodic work.

    async fn cleanup_loop(self: Arc<Self>) {
        while self.sleep(CLEANUP_INTERVAL).await {
            let swept = self.bans.sweep();
            if swept > 0 {
                debug!(swept, "Removed expired bans");
            }
        }
    }

    /// Write the address store to disk.
    pub fn dump_addresses(&self) {
        let start = Instant::now();
        match self.store.flush() {
            Ok(()) => debug!(
                addresses = self.store.size(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Flushed addresses"
            ),
            Err(e) => warn!(error = %e, "Failed to flush addresses"),
        }
    }

    // Administrative surface.

    fn find_node<F>(&self, pred: F) -> Option<Arc<PeerConnection>>
    where
        F: Fn(&PeerConnection) -> bool,
    {
        self.nodes.read().iter().find(|n| pred(n)).cloned()
    }

    pub fn node_count(&self, direction: ConnectionDirection) -> usize {
        let nodes = self.nodes.read();
        match direction {
            ConnectionDirection::All => nodes.len(),
            ConnectionDirection::Inbound => nodes.iter().filter(|n| n.is_inbound()).count(),
            ConnectionDirection::Outbound => nodes.iter().filter(|n| !n.is_inbound()).count(),
        }
    }

    pub fn node_stats(&self) -> Vec<PeerStats> {
        self.nodes.read().iter().map(|n| n.stats()).collect()
    }

    pub fn disconnect_node_by_id(&self, id: NodeId) -> bool {
        match self.find_node(|n| n.id() == id) {
            Some(node) => {
                node.mark_for_disconnect();
                true
            }
            None => false,
        }
    }

    pub fn disconnect_node_by_name(&self, name: &str) -> bool {
        match self.find_node(|n| n.addr_name() == name) {
            Some(node) => {
                node.mark_for_disconnect();
                true
            }
            None => false,
        }
    }

    /// Disconnect every peer inside `subnet`.
    pub fn disconnect_node_by_subnet(&self, subnet: &IpNet) -> bool {
        let mut disconnected = false;
        for node in self.nodes.read().iter() {
            if subnet_contains(subnet, &node.addr().ip()) {
                node.mark_for_disconnect();
                disconnected = true;
            }
        }
        disconnected
    }

    pub fn disconnect_node_by_addr(&self, ip: &IpAddr) -> bool {
        self.disconnect_node_by_subnet(&IpNet::from(*ip))
    }

    /// Enable or disable all network activity. Disabling drops every peer
    /// on the next socket loop pass.
    pub fn set_network_active(&self, active: bool) {
        if self.network_active.swap(active, Ordering::AcqRel) != active {
            info!(active, "Network activity changed");
        }
    }

    pub fn network_active(&self) -> bool {
        self.network_active.load(Ordering::Acquire)
    }

    /// Run `f` on a fully connected peer. False if there is none with `id`.
    pub fn for_node<F>(&self, id: NodeId, f: F) -> bool
    where
        F: FnOnce(&PeerConnection) -> bool,
    {
        match self.find_node(|n| n.id() == id) {
            Some(node) if node.successfully_connected() && !node.marked_for_disconnect() => f(&node),
            _ => false,
        }
    }

    /// Outbound peers beyond the target, not counting peers that are
    /// leaving soon or still handshaking.
    pub fn extra_outbound_count(&self) -> usize {
        let outbound = self
            .nodes
            .read()
            .iter()
            .filter(|n| n.kind() == ConnectionKind::Outbound && !n.marked_for_disconnect() && n.successfully_connected())
            .count();
        outbound.saturating_sub(self.config.effective_max_outbound())
    }

    /// Ask the outbound loop for one more peer even when at the target.
    pub fn set_try_new_outbound_peer(&self, flag: bool) {
        self.try_new_outbound.store(flag, Ordering::Release);
        debug!(flag, "Setting try another outbound peer");
    }

    pub fn try_new_outbound_peer(&self) -> bool {
        self.try_new_outbound.load(Ordering::Acquire)
    }

    pub fn set_max_outbound_target(&self, limit: u64) {
        self.bandwidth.set_target(limit);
    }

    pub fn max_outbound_target(&self) -> u64 {
        self.bandwidth.target()
    }

    pub fn set_max_outbound_timeframe(&self, timeframe: Duration) {
        self.bandwidth.set_timeframe(timeframe);
    }

    pub fn max_outbound_timeframe(&self) -> Duration {
        self.bandwidth.timeframe()
    }

    pub fn outbound_target_reached(&self, historical_block_serving: bool) -> bool {
        self.bandwidth.outbound_target_reached(historical_block_serving)
    }

    pub fn total_bytes_recv(&self) -> u64 {
        self.bandwidth.total_recv()
    }

    pub fn total_bytes_sent(&self) -> u64 {
        self.bandwidth.total_sent()
    }

    pub fn bandwidth(&self) -> &Bandwidth {
        &self.bandwidth
    }

    pub fn config(&self) -> &ConnectionManagerConfig {
        &self.config
    }

    pub fn local_services(&self) -> ServiceFlags {
        self.config.local_services
    }

    pub fn address_store(&self) -> &Arc<dyn AddressStore> {
        &self.store
    }

    pub fn ban_list(&self) -> &Arc<BanList> {
        &self.bans
    }

    pub fn local_addresses(&self) -> &Arc<LocalAddresses> {
        &self.local
    }
}

/// Readiness to wait for on a peer socket.
///
/// A pending send is waited on instead of further reads, and a paused
/// receive side is not read at all. Errors are always watched.
fn socket_interest(node: &PeerConnection) -> Interest {
    if node.has_pending_send() {
        Interest::WRITABLE | Interest::ERROR
    } else if !node.recv_paused() {
        Interest::READABLE | Interest::ERROR
    } else {
        Interest::ERROR
    }
}

/// Why a connection counts as inactive, if it does.
fn inactivity_reason(
    node: &PeerConnection,
    config: &ConnectionManagerConfig,
    now: i64,
    now_micros: i64,
) -> Option<&'static str> {
    if now - node.connected_at() <= config.peer_connect_timeout.as_secs() as i64 {
        return None;
    }
    let last_recv = node.last_recv();
    let last_send = node.last_send();
    let timeout = config.timeout_interval.as_secs() as i64;
    let recv_timeout = if node.version() > BIP0031_VERSION {
        timeout
    } else {
        config.old_version_recv_timeout.as_secs() as i64
    };

    if last_recv == 0 || last_send == 0 {
        Some("no message within connect timeout")
    } else if now - last_send > timeout {
        Some("send timeout")
    } else if now - last_recv > recv_timeout {
        Some("receive timeout")
    } else if node.ping_nonce_sent() != 0 && node.ping_start_micros() + timeout * 1_000_000 < now_micros {
        Some("ping timeout")
    } else if !node.successfully_connected() {
        Some("version handshake timeout")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrman::MemoryAddressStore;
    use crate::eviction::EvictionConfig;
    use crate::protocol::{serialize_message, PROTOCOL_VERSION};
    use crate::socket::Transport;

    /// Accepts every write and never has anything to read.
    struct SinkTransport;

    impl Transport for SinkTransport {
        fn try_send(&self, buf: &[u8]) -> io::Result<usize> {
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

    #[derive(Default)]
    struct CountingProcessor {
        initialized: AtomicUsize,
        finalized: AtomicUsize,
        sends: AtomicUsize,
    }

    impl MessageProcessor for CountingProcessor {
        fn initialize_node(&self, _manager: &ConnectionManager, _node: &PeerConnection) {
            self.initialized.fetch_add(1, Ordering::SeqCst);
        }

        fn process_messages(&self, _manager: &ConnectionManager, node: &PeerConnection) -> bool {
            while node.poll_message().is_some() {}
            false
        }

        fn send_messages(&self, _manager: &ConnectionManager, _node: &PeerConnection) {
            self.sends.fetch_add(1, Ordering::SeqCst);
        }

        fn finalize_node(&self, _manager: &ConnectionManager, _node: &PeerConnection) -> bool {
            self.finalized.fetch_add(1, Ordering::SeqCst);
            false
        }
    }

    fn test_config() -> ConnectionManagerConfig {
        ConnectionManagerConfig {
            listen: false,
            dns_seed: false,
            use_addrman_outgoing: false,
            ..Default::default()
        }
    }

    fn manager_with(config: ConnectionManagerConfig) -> (Arc<ConnectionManager>, Arc<CountingProcessor>) {
        let processor = Arc::new(CountingProcessor::default());
        let local = Arc::new(LocalAddresses::new(false, config.listen, config.default_port));
        let manager = ConnectionManager::new(
            config,
            processor.clone(),
            Arc::new(MemoryAddressStore::new()),
            Arc::new(BanList::new()),
            local,
        )
        .unwrap();
        (manager, processor)
    }

    fn fake_node(manager: &ConnectionManager, addr: &str, kind: ConnectionKind) -> Arc<PeerConnection> {
        let addr: SocketAddr = addr.parse().unwrap();
        let id = manager.new_node_id();
        let node = Arc::new(PeerConnection::new(
            id,
            Arc::new(SinkTransport),
            PeerOptions {
                addr,
                addr_bind: None,
                addr_name: String::new(),
                kind,
                permissions: PermissionFlags::empty(),
                legacy_whitelisted: false,
                prefer_evict: false,
                keyed_net_group: manager.keyed_net_group(&addr),
                local_nonce: manager.local_nonce(id),
                local_services: ServiceFlags::NETWORK,
                limits: manager.peer_limits(),
            },
        ));
        manager.register(node.clone(), None);
        node
    }

    #[test]
    fn test_keyed_net_group_follows_group() {
        let (manager, _) = manager_with(test_config());
        let a = manager.keyed_net_group(&"8.8.1.1:7890".parse().unwrap());
        let b = manager.keyed_net_group(&"8.8.200.9:1234".parse().unwrap());
        let c = manager.keyed_net_group(&"9.9.1.1:7890".parse().unwrap());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_register_and_count() {
        let (manager, processor) = manager_with(test_config());
        fake_node(&manager, "1.2.3.4:7890", ConnectionKind::Inbound);
        fake_node(&manager, "5.6.7.8:7890", ConnectionKind::Outbound);
        fake_node(&manager, "9.9.9.9:7890", ConnectionKind::Manual);

        assert_eq!(processor.initialized.load(Ordering::SeqCst), 3);
        assert_eq!(manager.node_count(ConnectionDirection::All), 3);
        assert_eq!(manager.node_count(ConnectionDirection::Inbound), 1);
        assert_eq!(manager.node_count(ConnectionDirection::Outbound), 2);
        assert_eq!(manager.node_stats().len(), 3);

        let (groups, outbound) = manager.outbound_groups();
        assert_eq!(outbound, 1);
        assert!(groups.contains(&group(&"5.6.7.8".parse().unwrap())));
    }

    #[test]
    fn test_disconnect_waits_for_references() {
        let (manager, processor) = manager_with(test_config());
        let node = fake_node(&manager, "1.2.3.4:7890", ConnectionKind::Inbound);
        let working = PeerRef::new(node.clone());

        assert!(manager.disconnect_node_by_id(node.id()));
        manager.disconnect_nodes();
        assert_eq!(manager.node_count(ConnectionDirection::All), 0);
        assert!(!node.socket_open());
        assert_eq!(processor.finalized.load(Ordering::SeqCst), 0);

        drop(working);
        manager.disconnect_nodes();
        assert_eq!(processor.finalized.load(Ordering::SeqCst), 1);
        assert!(manager.disconnected.lock().is_empty());
    }

    #[test]
    fn test_disconnect_by_subnet_and_name() {
        let (manager, _) = manager_with(test_config());
        let a = fake_node(&manager, "10.0.1.1:7890", ConnectionKind::Inbound);
        let b = fake_node(&manager, "10.0.2.2:7890", ConnectionKind::Inbound);
        let c = fake_node(&manager, "11.0.0.1:7890", ConnectionKind::Inbound);

        assert!(manager.disconnect_node_by_subnet(&"10.0.0.0/16".parse().unwrap()));
        assert!(a.marked_for_disconnect() && b.marked_for_disconnect());
        assert!(!c.marked_for_disconnect());

        assert!(manager.disconnect_node_by_name("11.0.0.1:7890"));
        assert!(c.marked_for_disconnect());
        assert!(!manager.disconnect_node_by_id(999));
        assert!(!manager.disconnect_node_by_addr(&"12.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_network_inactive_drops_everyone() {
        let (manager, processor) = manager_with(test_config());
        fake_node(&manager, "1.2.3.4:7890", ConnectionKind::Inbound);
        fake_node(&manager, "5.6.7.8:7890", ConnectionKind::Outbound);

        manager.set_network_active(false);
        assert!(!manager.network_active());
        manager.disconnect_nodes();
        assert_eq!(manager.node_count(ConnectionDirection::All), 0);
        assert_eq!(processor.finalized.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_incoming_nonce_detects_self_connection() {
        let (manager, _) = manager_with(test_config());
        let outbound = fake_node(&manager, "5.6.7.8:7890", ConnectionKind::Outbound);
        let inbound = fake_node(&manager, "1.2.3.4:7890", ConnectionKind::Inbound);

        assert!(!manager.check_incoming_nonce(outbound.local_nonce()));
        assert!(manager.check_incoming_nonce(inbound.local_nonce()));
        assert_ne!(outbound.local_nonce(), inbound.local_nonce());

        outbound.set_successfully_connected();
        assert!(manager.check_incoming_nonce(outbound.local_nonce()));
    }

    #[test]
    fn test_added_nodes() {
        let (manager, _) = manager_with(test_config());
        assert!(manager.add_node("5.6.7.8"));
        assert!(!manager.add_node("5.6.7.8"));
        assert!(manager.add_node("seed.example.org"));

        let info = manager.added_node_info();
        assert_eq!(info.len(), 2);
        assert!(info.iter().all(|i| !i.connected));

        fake_node(&manager, "5.6.7.8:7890", ConnectionKind::Manual);
        let info = manager.added_node_info();
        assert!(info[0].connected);
        assert!(!info[0].inbound);
        assert_eq!(info[0].resolved, Some("5.6.7.8:7890".parse().unwrap()));

        assert!(manager.remove_added_node("seed.example.org"));
        assert!(!manager.remove_added_node("seed.example.org"));
        assert_eq!(manager.added_node_info().len(), 1);
    }

    #[test]
    fn test_for_node_requires_handshake() {
        let (manager, _) = manager_with(test_config());
        let node = fake_node(&manager, "1.2.3.4:7890", ConnectionKind::Inbound);
        assert!(!manager.for_node(node.id(), |_| true));
        node.set_successfully_connected();
        assert!(manager.for_node(node.id(), |n| n.id() == node.id()));
        node.mark_for_disconnect();
        assert!(!manager.for_node(node.id(), |_| true));
    }

    #[test]
    fn test_extra_outbound_count() {
        let config = ConnectionManagerConfig {
            max_outbound: 1,
            ..test_config()
        };
        let (manager, _) = manager_with(config);
        for addr in ["1.1.1.1:7890", "2.2.2.2:7890", "3.3.3.3:7890"] {
            fake_node(&manager, addr, ConnectionKind::Outbound).set_successfully_connected();
        }
        fake_node(&manager, "4.4.4.4:7890", ConnectionKind::Feeler).set_successfully_connected();
        assert_eq!(manager.extra_outbound_count(), 2);

        manager.set_try_new_outbound_peer(true);
        assert!(manager.try_new_outbound_peer());
    }

    #[test]
    fn test_eviction_respects_protection() {
        let (manager, _) = manager_with(test_config());
        let node = fake_node(&manager, "1.2.3.4:7890", ConnectionKind::Inbound);
        // A single candidate is protected by its network group.
        assert!(!manager.attempt_to_evict_connection());
        assert!(!node.marked_for_disconnect());

        let config = ConnectionManagerConfig {
            eviction: EvictionConfig {
                protect_netgroup: 0,
                protect_ping: 0,
                protect_tx: 0,
                protect_block: 0,
            },
            ..test_config()
        };
        let (manager, _) = manager_with(config);
        let node = fake_node(&manager, "1.2.3.4:7890", ConnectionKind::Inbound);
        fake_node(&manager, "5.6.7.8:7890", ConnectionKind::Outbound);
        assert!(manager.attempt_to_evict_connection());
        assert!(node.marked_for_disconnect());
    }

    #[test]
    fn test_push_message_counts_bytes() {
        let (manager, _) = manager_with(test_config());
        let node = fake_node(&manager, "1.2.3.4:7890", ConnectionKind::Outbound);
        manager.push_message(&node, "ping", Bytes::from_static(&[0u8; 8]));
        assert_eq!(manager.total_bytes_sent(), 32);
        assert_eq!(node.bytes_sent(), 32);
    }

    #[test]
    fn test_inactivity_reasons() {
        let config = test_config();
        let (manager, _) = manager_with(config.clone());
        let node = fake_node(&manager, "1.2.3.4:7890", ConnectionKind::Outbound);
        let connected = node.connected_at();
        let micros = |secs: i64| secs * 1_000_000;

        // Young connections are left alone.
        assert_eq!(inactivity_reason(&node, &config, connected + 10, micros(connected + 10)), None);

        let later = connected + 61;
        assert_eq!(
            inactivity_reason(&node, &config, later, micros(later)),
            Some("no message within connect timeout")
        );

        manager.push_message(&node, "ping", Bytes::from_static(&[0u8; 8]));
        node.receive_bytes(&[0u8; 1]).ok();
        assert_eq!(
            inactivity_reason(&node, &config, later, micros(later)),
            Some("version handshake timeout")
        );

        node.set_successfully_connected();
        node.set_version(PROTOCOL_VERSION);
        assert_eq!(inactivity_reason(&node, &config, later, micros(later)), None);

        let stalled = node.last_send() + 20 * 60 + 1;
        assert_eq!(inactivity_reason(&node, &config, stalled, micros(stalled)), Some("send timeout"));
    }

    #[tokio::test]
    async fn test_interrupt_stops_tasks() {
        let config = ConnectionManagerConfig {
            listen: true,
            binds: vec!["127.0.0.1:0".parse().unwrap()],
            ..test_config()
        };
        let (manager, _) = manager_with(config);
        manager.start().await.unwrap();
        assert_eq!(manager.listen_addrs().len(), 1);

        manager.interrupt();
        tokio::time::timeout(Duration::from_secs(5), manager.stop())
            .await
            .expect("stop should not hang");
        assert!(manager.is_interrupted());
        assert!(manager.listen_addrs().is_empty());
    }

    #[test]
    fn test_past_send_deadline_does_not_shorten_sleep() {
        let (manager, processor) = manager_with(test_config());
        let node = fake_node(&manager, "8.8.8.8:7890", ConnectionKind::Outbound);
        node.schedule_send(Instant::now() - Duration::from_secs(1));

        let before = Instant::now();
        let (more_work, sleep_until) = manager.dispatch_round().unwrap();
        assert!(!more_work);
        assert!(sleep_until > before);
        assert_eq!(processor.sends.load(Ordering::SeqCst), 1);

        // A future deadline still wins over the maximum sleep.
        let soon = Instant::now() + Duration::from_millis(10);
        node.schedule_send(soon);
        let (_, sleep_until) = manager.dispatch_round().unwrap();
        assert_eq!(sleep_until, soon);
    }

    #[tokio::test]
    async fn test_dispatch_sleeps_after_deadline_passes() {
        let (manager, processor) = manager_with(test_config());
        let node = fake_node(&manager, "8.8.8.8:7890", ConnectionKind::Outbound);
        node.schedule_send(Instant::now());
        manager.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        let rounds = processor.sends.load(Ordering::SeqCst);
        // About five rounds at the default 100 ms maximum sleep.
        assert!(rounds >= 1);
        assert!(rounds <= 20, "dispatch ran {} rounds in 500ms", rounds);

        manager.stop().await;
    }

    #[test]
    fn test_paused_peer_still_watched_for_errors() {
        let config = ConnectionManagerConfig {
            receive_flood_size: 10,
            ..test_config()
        };
        let (manager, _) = manager_with(config);
        let node = fake_node(&manager, "8.8.8.8:7890", ConnectionKind::Inbound);

        let interest = socket_interest(&node);
        assert!(interest.is_readable() && interest.is_error());

        let wire = serialize_message(manager.config().magic, "ping", &[0u8; 8]).unwrap();
        assert!(node.receive_bytes(&wire).unwrap());
        node.queue_completed();
        assert!(node.recv_paused());
        let interest = socket_interest(&node);
        assert!(interest.is_error());
        assert!(!interest.is_readable() && !interest.is_writable());

        // An error on the paused socket closes it right away.
        let snapshot = manager.snapshot_refs();
        let mut buf = vec![0u8; 64];
        manager.service_sockets(vec![SocketEvent::Peer(node.id(), Ok(Ready::ERROR))], &[], &snapshot, &mut buf);
        assert!(!node.socket_open());
    }

    #[tokio::test]
    async fn test_accepts_and_drops_inbound() {
        let config = ConnectionManagerConfig {
            listen: true,
            binds: vec!["127.0.0.1:0".parse().unwrap()],
            ..test_config()
        };
        let (manager, processor) = manager_with(config);
        manager.start().await.unwrap();
        let addr = manager.listen_addrs()[0];

        let _client = TcpStream::connect(addr).await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while manager.node_count(ConnectionDirection::Inbound) == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(manager.node_count(ConnectionDirection::Inbound), 1);
        assert_eq!(processor.initialized.load(Ordering::SeqCst), 1);

        let id = manager.node_stats()[0].id;
        assert!(manager.disconnect_node_by_id(id));
        let deadline = Instant::now() + Duration::from_secs(5);
        while processor.finalized.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(processor.finalized.load(Ordering::SeqCst), 1);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_banned_inbound_is_refused() {
        let config = ConnectionManagerConfig {
            listen: true,
            binds: vec!["127.0.0.1:0".parse().unwrap()],
            ..test_config()
        };
        let (manager, processor) = manager_with(config);
        manager
            .ban_list()
            .ban("127.0.0.0/8".parse().unwrap(), crate::ban::DEFAULT_BAN_TIME);
        manager.start().await.unwrap();
        let addr = manager.listen_addrs()[0];

        let _client = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(manager.node_count(ConnectionDirection::All), 0);
        assert_eq!(processor.initialized.load(Ordering::SeqCst), 0);

        manager.stop().await;
    }
}
