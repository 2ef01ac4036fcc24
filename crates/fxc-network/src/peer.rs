//! Per-connection state.
//!
//! A [`PeerConnection`] owns one socket and everything known about the peer
//! behind it. Each concern sits behind its own lock so that, for example,
//! reading the subversion string never waits on a busy send queue.

use crate::codec::{MessageFramer, ReceivedMessage};
use crate::permissions::PermissionFlags;
use crate::protocol::{msg_type, MessageHeader, ServiceFlags, HEADER_SIZE, INIT_PROTO_VERSION, NET_MESSAGE_TYPE_OTHER};
use crate::socket::{SocketHandle, Transport};
use crate::{unix_time, unix_time_micros, NetworkError, NetworkResult};
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// Locally assigned connection id, never reused within a process.
pub type NodeId = u64;

/// How a connection came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    /// Accepted from a listener.
    Inbound,
    /// Regular outbound picked from the address store.
    Outbound,
    /// Requested by the operator (added nodes, specified connect).
    Manual,
    /// Short-lived probe that only validates an address.
    Feeler,
    /// Dialled once from the one-shot queue.
    OneShot,
}

impl ConnectionKind {
    pub fn is_inbound(self) -> bool {
        self == ConnectionKind::Inbound
    }
}

impl std::fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionKind::Inbound => "inbound",
            ConnectionKind::Outbound => "outbound",
            ConnectionKind::Manual => "manual",
            ConnectionKind::Feeler => "feeler",
            ConnectionKind::OneShot => "oneshot",
        };
        f.write_str(name)
    }
}

/// Wire and buffer limits shared by every connection.
#[derive(Debug, Clone, Copy)]
pub struct PeerLimits {
    pub magic: [u8; 4],
    pub max_message_size: usize,
    pub receive_flood_size: usize,
    pub send_buffer_max_size: usize,
}

/// Everything needed to construct a connection.
#[derive(Debug, Clone)]
pub struct PeerOptions {
    pub addr: SocketAddr,
    pub addr_bind: Option<SocketAddr>,
    pub addr_name: String,
    pub kind: ConnectionKind,
    pub permissions: PermissionFlags,
    pub legacy_whitelisted: bool,
    pub prefer_evict: bool,
    pub keyed_net_group: u64,
    pub local_nonce: u64,
    pub local_services: ServiceFlags,
    pub limits: PeerLimits,
}

fn byte_map() -> HashMap<String, u64> {
    msg_type::ALL
        .iter()
        .chain(std::iter::once(&NET_MESSAGE_TYPE_OTHER))
        .map(|t| (t.to_string(), 0))
        .collect()
}

struct SendState {
    queue: VecDeque<Bytes>,
    /// Bytes of the front buffer already written.
    offset: usize,
    /// Bytes queued and not yet written, counting the whole front buffer.
    size: usize,
    bytes_per_type: HashMap<String, u64>,
}

struct RecvState {
    current: Option<MessageFramer>,
    completed: Vec<ReceivedMessage>,
    bytes_per_type: HashMap<String, u64>,
}

#[derive(Default)]
struct ProcessQueue {
    messages: VecDeque<ReceivedMessage>,
    size: usize,
}

struct FilterState {
    relay_txes: bool,
    has_filter: bool,
}

/// Ping round-trip bookkeeping, all in microseconds.
struct PingState {
    nonce_sent: AtomicU64,
    start: AtomicI64,
    last: AtomicI64,
    min: AtomicI64,
    queued: AtomicBool,
}

/// One live or recently closed connection.
pub struct PeerConnection {
    id: NodeId,
    addr: SocketAddr,
    addr_bind: Option<SocketAddr>,
    kind: ConnectionKind,
    permissions: PermissionFlags,
    legacy_whitelisted: bool,
    prefer_evict: bool,
    keyed_net_group: u64,
    local_nonce: u64,
    local_services: ServiceFlags,
    limits: PeerLimits,
    connected_at: i64,
    connected_instant: Instant,

    socket: SocketHandle,
    disconnect: AtomicBool,
    ref_count: AtomicI32,

    send: Mutex<SendState>,
    send_processing: Mutex<()>,
    pause_send: AtomicBool,

    recv: Mutex<RecvState>,
    process: Mutex<ProcessQueue>,
    pause_recv: AtomicBool,

    bytes_sent: AtomicU64,
    bytes_recv: AtomicU64,
    last_send: AtomicI64,
    last_recv: AtomicI64,

    version: AtomicI32,
    send_version: AtomicI32,
    successfully_connected: AtomicBool,
    services: AtomicU64,
    filter: Mutex<FilterState>,
    addr_name: Mutex<String>,
    addr_local: Mutex<Option<SocketAddr>>,
    sub_ver: Mutex<String>,

    ping: PingState,
    last_block_time: AtomicI64,
    last_tx_time: AtomicI64,
    next_send: Mutex<Option<Instant>>,
}

impl PeerConnection {
    pub fn new(id: NodeId, transport: Arc<dyn Transport>, opts: PeerOptions) -> Self {
        let addr_name = if opts.addr_name.is_empty() {
            opts.addr.to_string()
        } else {
            opts.addr_name
        };
        Self {
            id,
            addr: opts.addr,
            addr_bind: opts.addr_bind,
            kind: opts.kind,
            permissions: opts.permissions,
            legacy_whitelisted: opts.legacy_whitelisted,
            prefer_evict: opts.prefer_evict,
            keyed_net_group: opts.keyed_net_group,
            local_nonce: opts.local_nonce,
            local_services: opts.local_services,
            limits: opts.limits,
            connected_at: unix_time(),
            connected_instant: Instant::now(),

            socket: SocketHandle::new(transport),
            disconnect: AtomicBool::new(false),
            ref_count: AtomicI32::new(0),

            send: Mutex::new(SendState {
                queue: VecDeque::new(),
                offset: 0,
                size: 0,
                bytes_per_type: byte_map(),
            }),
            send_processing: Mutex::new(()),
            pause_send: AtomicBool::new(false),

            recv: Mutex::new(RecvState {
                current: None,
                completed: Vec::new(),
                bytes_per_type: byte_map(),
            }),
            process: Mutex::new(ProcessQueue::default()),
            pause_recv: AtomicBool::new(false),

            bytes_sent: AtomicU64::new(0),
            bytes_recv: AtomicU64::new(0),
            last_send: AtomicI64::new(0),
            last_recv: AtomicI64::new(0),

            version: AtomicI32::new(0),
            send_version: AtomicI32::new(0),
            successfully_connected: AtomicBool::new(false),
            services: AtomicU64::new(0),
            filter: Mutex::new(FilterState {
                relay_txes: false,
                has_filter: false,
            }),
            addr_name: Mutex::new(addr_name),
            addr_local: Mutex::new(None),
            sub_ver: Mutex::new(String::new()),

            ping: PingState {
                nonce_sent: AtomicU64::new(0),
                start: AtomicI64::new(0),
                last: AtomicI64::new(0),
                min: AtomicI64::new(i64::MAX),
                queued: AtomicBool::new(false),
            },
            last_block_time: AtomicI64::new(0),
            last_tx_time: AtomicI64::new(0),
            next_send: Mutex::new(None),
        }
    }

    // Identity.

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn addr_bind(&self) -> Option<SocketAddr> {
        self.addr_bind
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn is_inbound(&self) -> bool {
        self.kind.is_inbound()
    }

    pub fn is_manual(&self) -> bool {
        self.kind == ConnectionKind::Manual
    }

    pub fn is_feeler(&self) -> bool {
        self.kind == ConnectionKind::Feeler
    }

    pub fn is_one_shot(&self) -> bool {
        self.kind == ConnectionKind::OneShot
    }

    pub fn permissions(&self) -> PermissionFlags {
        self.permissions
    }

    pub fn has_permission(&self, flag: PermissionFlags) -> bool {
        self.permissions.contains(flag)
    }

    pub fn legacy_whitelisted(&self) -> bool {
        self.legacy_whitelisted
    }

    pub fn prefer_evict(&self) -> bool {
        self.prefer_evict
    }

    pub fn keyed_net_group(&self) -> u64 {
        self.keyed_net_group
    }

    pub fn local_nonce(&self) -> u64 {
        self.local_nonce
    }

    pub fn local_services(&self) -> ServiceFlags {
        self.local_services
    }

    /// Unix time the connection was registered.
    pub fn connected_at(&self) -> i64 {
        self.connected_at
    }

    /// Monotonic time the connection was registered.
    pub fn connected_instant(&self) -> Instant {
        self.connected_instant
    }

    /// Name the connection was opened with; defaults to the address.
    pub fn addr_name(&self) -> String {
        self.addr_name.lock().clone()
    }

    /// Set the name unless one is already present.
    pub fn set_addr_name(&self, name: &str) {
        let mut current = self.addr_name.lock();
        if current.is_empty() {
            *current = name.to_string();
        }
    }

    // Lifecycle.

    /// Transport, unless the socket is closed.
    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.socket.get()
    }

    pub fn socket_open(&self) -> bool {
        self.socket.is_open()
    }

    /// Whether disconnection has been requested.
    pub fn marked_for_disconnect(&self) -> bool {
        self.disconnect.load(Ordering::Acquire)
    }

    /// Request disconnection; the manager closes and removes the connection.
    pub fn mark_for_disconnect(&self) {
        self.disconnect.store(true, Ordering::Release);
    }

    /// Request disconnection and close the socket. Idempotent.
    pub fn close(&self) {
        self.mark_for_disconnect();
        if self.socket.close() {
            debug!(peer = self.id, "Disconnecting peer");
        }
    }

    /// Take a working reference.
    pub fn add_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop a working reference.
    pub fn release(&self) {
        self.ref_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn ref_count(&self) -> i32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Whether nobody holds a reference or is mid-send.
    ///
    /// Never blocks: a held send lock simply means "not yet".
    pub fn can_delete(&self) -> bool {
        if self.ref_count() > 0 {
            return false;
        }
        let send = self.send.try_lock();
        let processing = self.send_processing.try_lock();
        send.is_some() && processing.is_some()
    }

    /// Held by the dispatch loop while generating outgoing messages.
    pub fn lock_send_processing(&self) -> MutexGuard<'_, ()> {
        self.send_processing.lock()
    }

    // Receive path.

    /// Feed raw bytes through the framer.
    ///
    /// Returns whether at least one message completed. A framing error means
    /// the connection must be dropped.
    pub fn receive_bytes(&self, mut buf: &[u8]) -> NetworkResult<bool> {
        let now = Instant::now();
        let total = buf.len();
        let mut complete = false;
        {
            let mut recv = self.recv.lock();
            while !buf.is_empty() {
                let limits = self.limits;
                let framer = recv
                    .current
                    .get_or_insert_with(|| MessageFramer::new(limits.magic, limits.max_message_size));
                let consumed = framer.feed(buf)?;
                buf = &buf[consumed..];
                if !framer.is_complete() {
                    continue;
                }

                let Some(framer) = recv.current.take() else {
                    continue;
                };
                let Some(msg) = framer.into_message(now) else {
                    continue;
                };
                let key = if recv.bytes_per_type.contains_key(&msg.msg_type) {
                    msg.msg_type.clone()
                } else {
                    NET_MESSAGE_TYPE_OTHER.to_string()
                };
                *recv.bytes_per_type.entry(key).or_insert(0) += msg.raw_size as u64;
                recv.completed.push(msg);
                complete = true;
            }
        }
        self.last_recv.store(unix_time(), Ordering::Relaxed);
        self.bytes_recv.fetch_add(total as u64, Ordering::Relaxed);
        Ok(complete)
    }

    /// Move completed messages to the processing queue.
    ///
    /// Pauses receiving once the queue exceeds the flood limit. Returns the
    /// number of messages moved.
    pub fn queue_completed(&self) -> usize {
        let completed = std::mem::take(&mut self.recv.lock().completed);
        if completed.is_empty() {
            return 0;
        }
        let count = completed.len();
        let mut process = self.process.lock();
        for msg in completed {
            process.size += msg.raw_size;
            process.messages.push_back(msg);
        }
        self.pause_recv
            .store(process.size > self.limits.receive_flood_size, Ordering::Release);
        count
    }

    /// Next message for the processor, and whether more are waiting.
    pub fn poll_message(&self) -> Option<(ReceivedMessage, bool)> {
        let mut process = self.process.lock();
        let msg = process.messages.pop_front()?;
        process.size = process.size.saturating_sub(msg.raw_size);
        self.pause_recv
            .store(process.size > self.limits.receive_flood_size, Ordering::Release);
        Some((msg, !process.messages.is_empty()))
    }

    pub fn recv_paused(&self) -> bool {
        self.pause_recv.load(Ordering::Acquire)
    }

    /// Messages waiting for the processor.
    pub fn process_queue_len(&self) -> usize {
        self.process.lock().messages.len()
    }

    // Send path.

    /// Queue a message. If nothing else was queued, try to write it at once.
    ///
    /// Returns the bytes written immediately.
    pub fn enqueue_message(&self, msg_type: &str, payload: Bytes) -> NetworkResult<usize> {
        let header = MessageHeader::new(self.limits.magic, msg_type, &payload)?;
        let mut head = BytesMut::with_capacity(HEADER_SIZE);
        header.encode(&mut head);
        let total = HEADER_SIZE + payload.len();
        debug!(peer = self.id, msg_type, bytes = payload.len(), "Sending message");

        let mut send = self.send.lock();
        let optimistic = send.queue.is_empty();
        *send.bytes_per_type.entry(msg_type.to_string()).or_insert(0) += total as u64;
        send.size += total;
        if send.size > self.limits.send_buffer_max_size {
            self.pause_send.store(true, Ordering::Release);
        }
        send.queue.push_back(head.freeze());
        if !payload.is_empty() {
            send.queue.push_back(payload);
        }

        if optimistic {
            Ok(self.drain_locked(&mut send))
        } else {
            Ok(0)
        }
    }

    /// Write as much of the send queue as the socket takes.
    ///
    /// Returns the bytes written.
    pub fn drain_send_queue(&self) -> usize {
        let mut send = self.send.lock();
        self.drain_locked(&mut send)
    }

    fn drain_locked(&self, send: &mut SendState) -> usize {
        let Some(transport) = self.socket.get() else {
            return 0;
        };
        let mut sent = 0;
        while let Some(front) = send.queue.front() {
            let len = front.len();
            match transport.try_send(&front[send.offset..]) {
                Ok(0) => break,
                Ok(n) => {
                    self.last_send.store(unix_time(), Ordering::Relaxed);
                    self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                    send.offset += n;
                    sent += n;
                    if send.offset < len {
                        // Partial write, the socket is full.
                        break;
                    }
                    send.offset = 0;
                    send.size -= len;
                    send.queue.pop_front();
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => break,
                Err(e) => {
                    warn!(peer = self.id, error = %e, "Socket send error");
                    self.close();
                    break;
                }
            }
        }

        if send.size < self.limits.send_buffer_max_size {
            self.pause_send.store(false, Ordering::Release);
        }
        if send.queue.is_empty() {
            debug_assert_eq!(send.size, 0);
        }
        sent
    }

    pub fn send_paused(&self) -> bool {
        self.pause_send.load(Ordering::Acquire)
    }

    /// Whether anything is waiting to be written.
    pub fn has_pending_send(&self) -> bool {
        !self.send.lock().queue.is_empty()
    }

    /// Bytes queued and not yet written.
    pub fn send_queue_size(&self) -> usize {
        self.send.lock().size
    }

    // Handshake.

    /// Version the peer announced; 0 until known.
    pub fn version(&self) -> i32 {
        self.version.load(Ordering::Acquire)
    }

    pub fn set_version(&self, version: i32) {
        self.version.store(version, Ordering::Release);
    }

    /// Set the negotiated send version. Only the first call takes effect.
    pub fn set_send_version(&self, version: i32) -> NetworkResult<()> {
        self.send_version
            .compare_exchange(0, version, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| NetworkError::AlreadySet {
                field: "send_version",
                peer: self.id,
            })
    }

    /// Negotiated send version, or the initial version if not yet set.
    pub fn send_version(&self) -> i32 {
        match self.send_version.load(Ordering::Acquire) {
            0 => {
                error!(peer = self.id, "Requesting unset send version, using {}", INIT_PROTO_VERSION);
                INIT_PROTO_VERSION
            }
            v => v,
        }
    }

    /// Whether the send version has been negotiated.
    pub fn has_send_version(&self) -> bool {
        self.send_version.load(Ordering::Acquire) != 0
    }

    /// Address the peer saw us at. Only the first call takes effect.
    pub fn set_addr_local(&self, addr: SocketAddr) -> NetworkResult<()> {
        let mut current = self.addr_local.lock();
        if current.is_some() {
            return Err(NetworkError::AlreadySet {
                field: "addr_local",
                peer: self.id,
            });
        }
        *current = Some(addr);
        Ok(())
    }

    pub fn addr_local(&self) -> Option<SocketAddr> {
        *self.addr_local.lock()
    }

    /// Whether the version handshake has completed.
    pub fn successfully_connected(&self) -> bool {
        self.successfully_connected.load(Ordering::Acquire)
    }

    pub fn set_successfully_connected(&self) {
        self.successfully_connected.store(true, Ordering::Release);
    }

    pub fn services(&self) -> ServiceFlags {
        ServiceFlags::from_bits_retain(self.services.load(Ordering::Acquire))
    }

    pub fn set_services(&self, services: ServiceFlags) {
        self.services.store(services.bits(), Ordering::Release);
    }

    pub fn relay_txes(&self) -> bool {
        self.filter.lock().relay_txes
    }

    pub fn set_relay_txes(&self, relay: bool) {
        self.filter.lock().relay_txes = relay;
    }

    pub fn has_filter(&self) -> bool {
        self.filter.lock().has_filter
    }

    pub fn set_has_filter(&self, has_filter: bool) {
        self.filter.lock().has_filter = has_filter;
    }

    pub fn sub_ver(&self) -> String {
        self.sub_ver.lock().clone()
    }

    pub fn set_sub_ver(&self, sub_ver: &str) {
        *self.sub_ver.lock() = sub_ver.to_string();
    }

    // Liveness.

    /// Unix time of the last write, 0 if none.
    pub fn last_send(&self) -> i64 {
        self.last_send.load(Ordering::Relaxed)
    }

    /// Unix time of the last read, 0 if none.
    pub fn last_recv(&self) -> i64 {
        self.last_recv.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_recv(&self) -> u64 {
        self.bytes_recv.load(Ordering::Relaxed)
    }

    /// Record an outgoing ping.
    pub fn start_ping(&self, nonce: u64) {
        self.ping.nonce_sent.store(nonce, Ordering::Release);
        self.ping.start.store(unix_time_micros(), Ordering::Release);
        self.ping.queued.store(false, Ordering::Release);
    }

    /// Handle a pong; returns whether it matched the outstanding ping.
    pub fn pong_received(&self, nonce: u64) -> bool {
        let sent = self.ping.nonce_sent.load(Ordering::Acquire);
        if sent == 0 || sent != nonce {
            return false;
        }
        let rtt = unix_time_micros() - self.ping.start.load(Ordering::Acquire);
        if rtt >= 0 {
            self.ping.last.store(rtt, Ordering::Release);
            self.ping.min.fetch_min(rtt, Ordering::AcqRel);
        }
        self.ping.nonce_sent.store(0, Ordering::Release);
        true
    }

    /// Nonce of the outstanding ping, 0 if none.
    pub fn ping_nonce_sent(&self) -> u64 {
        self.ping.nonce_sent.load(Ordering::Acquire)
    }

    /// Unix time in microseconds the outstanding ping was sent.
    pub fn ping_start_micros(&self) -> i64 {
        self.ping.start.load(Ordering::Acquire)
    }

    /// Lowest round trip seen, `i64::MAX` if none.
    pub fn min_ping_micros(&self) -> i64 {
        self.ping.min.load(Ordering::Acquire)
    }

    pub fn last_ping_micros(&self) -> i64 {
        self.ping.last.load(Ordering::Acquire)
    }

    pub fn queue_ping(&self) {
        self.ping.queued.store(true, Ordering::Release);
    }

    pub fn ping_queued(&self) -> bool {
        self.ping.queued.load(Ordering::Acquire)
    }

    pub fn last_block_time(&self) -> i64 {
        self.last_block_time.load(Ordering::Relaxed)
    }

    pub fn set_last_block_time(&self, t: i64) {
        self.last_block_time.store(t, Ordering::Relaxed);
    }

    pub fn last_tx_time(&self) -> i64 {
        self.last_tx_time.load(Ordering::Relaxed)
    }

    pub fn set_last_tx_time(&self, t: i64) {
        self.last_tx_time.store(t, Ordering::Relaxed);
    }

    /// When the processor next wants to send, if it asked.
    pub fn next_send(&self) -> Option<Instant> {
        *self.next_send.lock()
    }

    pub fn schedule_send(&self, at: Instant) {
        *self.next_send.lock() = Some(at);
    }

    /// Snapshot for operator display.
    pub fn stats(&self) -> PeerStats {
        let send_map = self.send.lock().bytes_per_type.clone();
        let recv_map = self.recv.lock().bytes_per_type.clone();
        let min_ping = self.min_ping_micros();
        let ping_wait = match self.ping_nonce_sent() {
            0 => None,
            _ => Some((unix_time_micros() - self.ping_start_micros()) as f64 / 1e6),
        };
        PeerStats {
            id: self.id,
            addr: self.addr,
            addr_bind: self.addr_bind,
            addr_local: self.addr_local(),
            addr_name: self.addr_name(),
            kind: self.kind,
            services: self.services(),
            relay_txes: self.relay_txes(),
            last_send: self.last_send(),
            last_recv: self.last_recv(),
            connected_at: self.connected_at,
            bytes_sent: self.bytes_sent(),
            bytes_recv: self.bytes_recv(),
            version: self.version(),
            sub_ver: self.sub_ver(),
            successfully_connected: self.successfully_connected(),
            ping_time: match self.last_ping_micros() {
                0 => None,
                us => Some(us as f64 / 1e6),
            },
            min_ping: (min_ping != i64::MAX).then(|| min_ping as f64 / 1e6),
            ping_wait,
            permissions: self
                .permissions
                .to_strings()
                .into_iter()
                .map(str::to_string)
                .collect(),
            legacy_whitelisted: self.legacy_whitelisted,
            bytes_sent_per_msg: send_map.into_iter().filter(|(_, v)| *v > 0).collect(),
            bytes_recv_per_msg: recv_map.into_iter().filter(|(_, v)| *v > 0).collect(),
        }
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("kind", &self.kind)
            .field("disconnect", &self.marked_for_disconnect())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

/// Working reference that releases itself when dropped.
pub struct PeerRef(Arc<PeerConnection>);

impl PeerRef {
    pub fn new(peer: Arc<PeerConnection>) -> Self {
        peer.add_ref();
        Self(peer)
    }
}

impl std::ops::Deref for PeerRef {
    type Target = PeerConnection;

    fn deref(&self) -> &PeerConnection {
        &self.0
    }
}

impl Drop for PeerRef {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Per-peer statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PeerStats {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub addr_bind: Option<SocketAddr>,
    pub addr_local: Option<SocketAddr>,
    pub addr_name: String,
    pub kind: ConnectionKind,
    pub services: ServiceFlags,
    pub relay_txes: bool,
    pub last_send: i64,
    pub last_recv: i64,
    pub connected_at: i64,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub version: i32,
    pub sub_ver: String,
    pub successfully_connected: bool,
    /// Seconds.
    pub ping_time: Option<f64>,
    pub min_ping: Option<f64>,
    pub ping_wait: Option<f64>,
    pub permissions: Vec<String>,
    pub legacy_whitelisted: bool,
    pub bytes_sent_per_msg: BTreeMap<String, u64>,
    pub bytes_recv_per_msg: BTreeMap<String, u64>,
}
