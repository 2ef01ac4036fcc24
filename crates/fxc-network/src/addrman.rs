//! Peer address store.
//!
//! The connection manager only talks to the [`AddressStore`] trait. The
//! in-memory implementation keeps a "new" table of addresses we have heard
//! about and a "tried" table of addresses we have connected to, both made of
//! fixed-size buckets whose positions are derived from a secret SipHash key,
//! so a peer cannot choose where its addresses land.

use crate::netaddr::{canonical_addr, group, is_routable, is_valid};
use crate::protocol::ServiceFlags;
use crate::{unix_time, NetworkError, NetworkResult};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher24;
use std::collections::{BTreeSet, HashMap};
use std::hash::Hasher;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const TRIED_BUCKET_COUNT: usize = 256;
pub const NEW_BUCKET_COUNT: usize = 1024;
pub const BUCKET_SIZE: usize = 64;
const TRIED_BUCKETS_PER_GROUP: u64 = 8;
const NEW_BUCKETS_PER_SOURCE_GROUP: u64 = 64;

/// Days after which an unseen address is forgotten.
const HORIZON_DAYS: i64 = 30;
/// Attempts after which an address that never worked is forgotten.
const RETRIES: i32 = 3;
/// Successive failures after which an address is forgotten...
const MAX_FAILURES: i32 = 10;
/// ...if it has not worked for this many days.
const MIN_FAIL_DAYS: i64 = 7;
/// A tried entry that worked this recently is not replaced.
const REPLACEMENT_SECONDS: i64 = 4 * 60 * 60;
const SET_TRIED_COLLISION_SIZE: usize = 10;
/// How long a collision may wait for its test connection.
const TEST_WINDOW: i64 = 40 * 60;

/// Percentage of the store returned for a `getaddr` request.
pub const GETADDR_MAX_PCT: usize = 23;
/// Upper bound on addresses returned for a `getaddr` request.
pub const GETADDR_MAX: usize = 2500;

const PEERS_FILE_VERSION: u32 = 1;

/// Everything we know about one address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrInfo {
    pub addr: SocketAddr,
    pub services: ServiceFlags,
    /// Last time the address was seen announced, unix seconds.
    pub time: i64,
    #[serde(default)]
    pub last_try: i64,
    #[serde(default)]
    pub last_success: i64,
    #[serde(default)]
    pub attempts: i32,
    #[serde(default)]
    pub last_count_attempt: i64,
    /// Who told us about it.
    pub source: IpAddr,
    #[serde(default)]
    pub in_tried: bool,
}

impl AddrInfo {
    /// A freshly announced address, sourced from itself.
    pub fn new(addr: SocketAddr, services: ServiceFlags, time: i64) -> Self {
        let addr = canonical_addr(addr);
        Self {
            addr,
            services,
            time,
            last_try: 0,
            last_success: 0,
            attempts: 0,
            last_count_attempt: 0,
            source: addr.ip(),
            in_tried: false,
        }
    }

    /// Whether the address is not worth keeping or sharing.
    pub fn is_terrible(&self, now: i64) -> bool {
        // Never drop what we tried in the last minute.
        if self.last_try != 0 && self.last_try >= now - 60 {
            return false;
        }
        // Timestamp from the future.
        if self.time > now + 10 * 60 {
            return true;
        }
        if self.time == 0 || now - self.time > HORIZON_DAYS * 24 * 60 * 60 {
            return true;
        }
        if self.last_success == 0 && self.attempts >= RETRIES {
            return true;
        }
        now - self.last_success > MIN_FAIL_DAYS * 24 * 60 * 60 && self.attempts >= MAX_FAILURES
    }

    /// Relative chance of being picked by [`AddressStore::select`].
    pub fn chance(&self, now: i64) -> f64 {
        let mut chance = 1.0;
        let since_last_try = (now - self.last_try).max(0);
        if since_last_try < 10 * 60 {
            chance *= 0.01;
        }
        // 66% less likely after each failure, bottoming out after eight.
        chance * 0.66f64.powi(self.attempts.min(8))
    }
}

/// The address database the connection manager draws from.
pub trait AddressStore: Send + Sync {
    /// Pick an address to dial. `new_only` restricts the pick to addresses
    /// never connected to, which is what feelers want.
    fn select(&self, new_only: bool) -> Option<AddrInfo>;

    /// Learn addresses announced by `source`. Returns how many were new.
    fn add(&self, addrs: &[AddrInfo], source: IpAddr, time_penalty: i64) -> usize;

    /// A connection to `addr` completed its handshake.
    fn good(&self, addr: &SocketAddr, time: i64);

    /// We tried to connect to `addr`.
    fn attempt(&self, addr: &SocketAddr, count_failure: bool, time: i64);

    /// We are still connected to `addr`; refresh its timestamp.
    fn connected(&self, addr: &SocketAddr, time: i64);

    fn set_services(&self, addr: &SocketAddr, services: ServiceFlags);

    /// Settle pending tried-table collisions.
    fn resolve_collisions(&self);

    /// A tried entry that a pending collision wants to evict, to be tested
    /// with a feeler.
    fn select_tried_collision(&self) -> Option<AddrInfo>;

    fn size(&self) -> usize;

    /// Random sample of non-terrible addresses for sharing with peers.
    fn get_addr(&self, max_addresses: usize, max_pct: usize) -> Vec<AddrInfo>;

    /// Persist the store, if it is backed by a file.
    fn flush(&self) -> NetworkResult<()>;
}

#[derive(Debug)]
struct Entry {
    info: AddrInfo,
    random_pos: usize,
}

#[derive(Debug, Clone, Copy)]
struct Dimensions {
    tried_buckets: usize,
    new_buckets: usize,
    bucket_size: usize,
}

impl Default for Dimensions {
    fn default() -> Self {
        Self {
            tried_buckets: TRIED_BUCKET_COUNT,
            new_buckets: NEW_BUCKET_COUNT,
            bucket_size: BUCKET_SIZE,
        }
    }
}

#[derive(Debug)]
struct Inner {
    key: [u64; 2],
    dims: Dimensions,
    next_id: u64,
    entries: HashMap<u64, Entry>,
    by_addr: HashMap<SocketAddr, u64>,
    random: Vec<u64>,
    /// Slot index -> entry id.
    new_table: HashMap<usize, u64>,
    tried_table: HashMap<usize, u64>,
    new_count: usize,
    tried_count: usize,
    collisions: BTreeSet<u64>,
    last_good: i64,
}

#[derive(Serialize, Deserialize)]
struct PeersFile {
    version: u32,
    key: [u64; 2],
    addrs: Vec<AddrInfo>,
}

impl Inner {
    fn new(key: [u64; 2], dims: Dimensions) -> Self {
        Self {
            key,
            dims,
            next_id: 0,
            entries: HashMap::new(),
            by_addr: HashMap::new(),
            random: Vec::new(),
            new_table: HashMap::new(),
            tried_table: HashMap::new(),
            new_count: 0,
            tried_count: 0,
            collisions: BTreeSet::new(),
            last_good: 1,
        }
    }

    fn hasher(&self) -> SipHasher24 {
        SipHasher24::new_with_keys(self.key[0], self.key[1])
    }

    fn addr_key(hasher: &mut SipHasher24, addr: &SocketAddr) {
        match addr.ip() {
            IpAddr::V4(v4) => hasher.write(&v4.to_ipv6_mapped().octets()),
            IpAddr::V6(v6) => hasher.write(&v6.octets()),
        }
        hasher.write_u16(addr.port());
    }

    fn bucket_position(&self, new: bool, bucket: usize, addr: &SocketAddr) -> usize {
        let mut h = self.hasher();
        h.write_u8(if new { b'N' } else { b'K' });
        h.write_u64(bucket as u64);
        Self::addr_key(&mut h, addr);
        (h.finish() % self.dims.bucket_size as u64) as usize
    }

    fn tried_slot(&self, addr: &SocketAddr) -> usize {
        let mut h1 = self.hasher();
        Self::addr_key(&mut h1, addr);
        let hash1 = h1.finish();

        let mut h2 = self.hasher();
        h2.write(&group(&addr.ip()));
        h2.write_u64(hash1 % TRIED_BUCKETS_PER_GROUP);
        let bucket = (h2.finish() % self.dims.tried_buckets as u64) as usize;
        bucket * self.dims.bucket_size + self.bucket_position(false, bucket, addr)
    }

    fn new_slot(&self, addr: &SocketAddr, source: &IpAddr) -> usize {
        let source_group = group(source);
        let mut h1 = self.hasher();
        h1.write(&group(&addr.ip()));
        h1.write(&source_group);
        let hash1 = h1.finish();

        let mut h2 = self.hasher();
        h2.write(&source_group);
        h2.write_u64(hash1 % NEW_BUCKETS_PER_SOURCE_GROUP);
        let bucket = (h2.finish() % self.dims.new_buckets as u64) as usize;
        bucket * self.dims.bucket_size + self.bucket_position(true, bucket, addr)
    }

    fn find(&self, addr: &SocketAddr) -> Option<u64> {
        self.by_addr.get(&canonical_addr(*addr)).copied()
    }

    fn create(&mut self, info: AddrInfo) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.by_addr.insert(info.addr, id);
        self.entries.insert(
            id,
            Entry {
                info,
                random_pos: self.random.len(),
            },
        );
        self.random.push(id);
        id
    }

    fn swap_random(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        let (id_a, id_b) = (self.random[a], self.random[b]);
        if let Some(e) = self.entries.get_mut(&id_a) {
            e.random_pos = b;
        }
        if let Some(e) = self.entries.get_mut(&id_b) {
            e.random_pos = a;
        }
        self.random.swap(a, b);
    }

    /// Remove an entry that is in neither table.
    fn delete(&mut self, id: u64) {
        let Some(pos) = self.entries.get(&id).map(|e| e.random_pos) else {
            return;
        };
        let last = self.random.len() - 1;
        self.swap_random(pos, last);
        self.random.pop();
        if let Some(entry) = self.entries.remove(&id) {
            self.by_addr.remove(&entry.info.addr);
        }
    }

    /// Empty a new-table slot, deleting its occupant.
    fn clear_new(&mut self, slot: usize) {
        if let Some(id) = self.new_table.remove(&slot) {
            self.new_count -= 1;
            self.delete(id);
        }
    }

    fn remove_from_new(&mut self, id: u64) {
        let Some(entry) = self.entries.get(&id) else {
            return;
        };
        let slot = self.new_slot(&entry.info.addr, &entry.info.source);
        if self.new_table.get(&slot) == Some(&id) {
            self.new_table.remove(&slot);
            self.new_count -= 1;
        }
    }

    fn make_tried(&mut self, id: u64) {
        self.remove_from_new(id);
        let Some(addr) = self.entries.get(&id).map(|e| e.info.addr) else {
            return;
        };
        let slot = self.tried_slot(&addr);

        // Push the current occupant back into the new table.
        if let Some(evicted) = self.tried_table.remove(&slot) {
            self.tried_count -= 1;
            if let Some(old) = self.entries.get_mut(&evicted) {
                old.info.in_tried = false;
                let (old_addr, old_source) = (old.info.addr, old.info.source);
                let new_slot = self.new_slot(&old_addr, &old_source);
                self.clear_new(new_slot);
                self.new_table.insert(new_slot, evicted);
                self.new_count += 1;
                debug!(addr = %old_addr, "Moved tried address back to new");
            }
        }

        self.tried_table.insert(slot, id);
        self.tried_count += 1;
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.info.in_tried = true;
        }
    }

    fn good(&mut self, addr: &SocketAddr, test_before_evict: bool, time: i64) {
        self.last_good = time;
        let Some(id) = self.find(addr) else {
            return;
        };
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        let info = &mut entry.info;
        info.last_success = time;
        info.last_try = time;
        info.attempts = 0;
        // `time` is left alone so it does not leak who we are connected to.
        if info.in_tried {
            return;
        }
        let info_addr = info.addr;

        let slot = self.tried_slot(&info_addr);
        let occupant = self.tried_table.get(&slot).copied();
        match occupant {
            Some(occupant) if test_before_evict && occupant != id => {
                debug!(addr = %info_addr, "Collision inserting into tried table");
                if self.collisions.len() < SET_TRIED_COLLISION_SIZE {
                    self.collisions.insert(id);
                }
            }
            _ => {
                debug!(addr = %info_addr, "Moving address to tried");
                self.make_tried(id);
            }
        }
    }

    fn add_one(&mut self, mut addr: AddrInfo, source: IpAddr, mut time_penalty: i64, now: i64) -> bool {
        addr.addr = canonical_addr(addr.addr);
        if !is_routable(&addr.addr.ip()) {
            return false;
        }
        // No penalty for a source announcing itself.
        if addr.addr.ip() == source {
            time_penalty = 0;
        }

        let (id, is_new) = match self.find(&addr.addr) {
            Some(id) => {
                let Some(entry) = self.entries.get_mut(&id) else {
                    return false;
                };
                let info = &mut entry.info;
                let currently_online = now - addr.time < 24 * 60 * 60;
                let update_interval = if currently_online { 60 * 60 } else { 24 * 60 * 60 };
                if addr.time != 0
                    && (info.time == 0 || info.time < addr.time - update_interval - time_penalty)
                {
                    info.time = (addr.time - time_penalty).max(0);
                }
                info.services |= addr.services;

                if addr.time == 0 || (info.time != 0 && addr.time <= info.time) {
                    return false;
                }
                if info.in_tried {
                    return false;
                }
                let (known_addr, known_source) = (info.addr, info.source);
                // Already has its one new-table slot.
                let slot = self.new_slot(&known_addr, &known_source);
                if self.new_table.get(&slot) == Some(&id) {
                    return false;
                }
                (id, false)
            }
            None => {
                addr.time = (addr.time - time_penalty).max(0);
                addr.source = source;
                addr.in_tried = false;
                addr.last_try = 0;
                addr.last_success = 0;
                addr.attempts = 0;
                addr.last_count_attempt = 0;
                (self.create(addr), true)
            }
        };

        let Some((entry_addr, entry_source)) = self.entries.get(&id).map(|e| (e.info.addr, e.info.source)) else {
            return false;
        };
        let slot = self.new_slot(&entry_addr, &entry_source);
        let insert = match self.new_table.get(&slot) {
            None => true,
            Some(&existing) => self
                .entries
                .get(&existing)
                .map(|e| e.info.is_terrible(now))
                .unwrap_or(true),
        };
        if insert {
            self.clear_new(slot);
            self.new_table.insert(slot, id);
            self.new_count += 1;
        } else if is_new {
            self.delete(id);
            return false;
        }
        is_new
    }

    fn attempt(&mut self, addr: &SocketAddr, count_failure: bool, time: i64) {
        let last_good = self.last_good;
        let Some(entry) = self.find(addr).and_then(|id| self.entries.get_mut(&id)) else {
            return;
        };
        entry.info.last_try = time;
        if count_failure && entry.info.last_count_attempt < last_good {
            entry.info.last_count_attempt = time;
            entry.info.attempts += 1;
        }
    }

    fn select(&self, new_only: bool) -> Option<AddrInfo> {
        if self.random.is_empty() || (new_only && self.new_count == 0) {
            return None;
        }
        let mut rng = rand::thread_rng();
        let use_tried = !new_only && self.tried_count > 0 && (self.new_count == 0 || rng.gen_bool(0.5));
        if !use_tried && self.new_count == 0 {
            return None;
        }

        let now = unix_time();
        let mut chance_factor = 1.0;
        loop {
            let id = self.random[rng.gen_range(0..self.random.len())];
            let Some(entry) = self.entries.get(&id) else {
                continue;
            };
            if entry.info.in_tried != use_tried {
                continue;
            }
            if rng.gen::<f64>() < chance_factor * entry.info.chance(now) {
                return Some(entry.info.clone());
            }
            chance_factor *= 1.2;
        }
    }

    fn resolve_collisions(&mut self) {
        let now = unix_time();
        let pending: Vec<u64> = self.collisions.iter().copied().collect();
        for id_new in pending {
            let erase = match self.entries.get(&id_new).map(|e| e.info.clone()) {
                None => true,
                Some(info_new) if !is_valid(&info_new.addr.ip()) => true,
                Some(info_new) => {
                    let slot = self.tried_slot(&info_new.addr);
                    let old = self
                        .tried_table
                        .get(&slot)
                        .and_then(|id| self.entries.get(id))
                        .map(|e| e.info.clone());
                    match old {
                        Some(old) => {
                            if now - old.last_success < REPLACEMENT_SECONDS {
                                true
                            } else if now - old.last_try < REPLACEMENT_SECONDS {
                                // Give the test connection a minute.
                                if now - old.last_try > 60 {
                                    info!(old = %old.addr, new = %info_new.addr, "Replacing address in tried table");
                                    self.good(&info_new.addr, false, now);
                                    true
                                } else {
                                    false
                                }
                            } else if now - info_new.last_success > TEST_WINDOW {
                                info!(old = %old.addr, new = %info_new.addr, "Unable to test; replacing address in tried table anyway");
                                self.good(&info_new.addr, false, now);
                                true
                            } else {
                                false
                            }
                        }
                        None => {
                            self.good(&info_new.addr, false, now);
                            true
                        }
                    }
                }
            };
            if erase {
                self.collisions.remove(&id_new);
            }
        }
    }

    fn select_tried_collision(&mut self) -> Option<AddrInfo> {
        if self.collisions.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..self.collisions.len());
        let id_new = self.collisions.iter().nth(index).copied()?;
        let Some(new_addr) = self.entries.get(&id_new).map(|e| e.info.addr) else {
            self.collisions.remove(&id_new);
            return None;
        };
        let slot = self.tried_slot(&new_addr);
        self.tried_table
            .get(&slot)
            .and_then(|id| self.entries.get(id))
            .map(|e| e.info.clone())
    }

    fn get_addr(&mut self, max_addresses: usize, max_pct: usize) -> Vec<AddrInfo> {
        let mut wanted = self.random.len();
        if max_pct != 0 {
            wanted = max_pct * wanted / 100;
        }
        if max_addresses != 0 {
            wanted = wanted.min(max_addresses);
        }

        let now = unix_time();
        let mut rng = rand::thread_rng();
        let mut out = Vec::with_capacity(wanted);
        for n in 0..self.random.len() {
            if out.len() >= wanted {
                break;
            }
            let pick = rng.gen_range(n..self.random.len());
            self.swap_random(n, pick);
            if let Some(entry) = self.entries.get(&self.random[n]) {
                if !entry.info.is_terrible(now) {
                    out.push(entry.info.clone());
                }
            }
        }
        out
    }

    fn to_file(&self) -> PeersFile {
        PeersFile {
            version: PEERS_FILE_VERSION,
            key: self.key,
            addrs: self.random.iter().filter_map(|id| self.entries.get(id)).map(|e| e.info.clone()).collect(),
        }
    }

    fn from_file(file: PeersFile, dims: Dimensions) -> Self {
        let mut inner = Inner::new(file.key, dims);
        let (tried, new): (Vec<_>, Vec<_>) = file.addrs.into_iter().partition(|a| a.in_tried);
        for info in tried {
            if inner.by_addr.contains_key(&info.addr) {
                continue;
            }
            let slot = inner.tried_slot(&info.addr);
            if inner.tried_table.contains_key(&slot) {
                // Slot taken since the file was written; demote.
                let mut info = info;
                info.in_tried = false;
                inner.insert_new_loaded(info);
                continue;
            }
            let id = inner.create(info);
            inner.tried_table.insert(slot, id);
            inner.tried_count += 1;
        }
        for info in new {
            if !inner.by_addr.contains_key(&info.addr) {
                inner.insert_new_loaded(info);
            }
        }
        inner
    }

    fn insert_new_loaded(&mut self, info: AddrInfo) {
        let slot = self.new_slot(&info.addr, &info.source);
        if self.new_table.contains_key(&slot) {
            return;
        }
        let id = self.create(info);
        self.new_table.insert(slot, id);
        self.new_count += 1;
    }
}

/// In-memory [`AddressStore`] with optional JSON persistence.
#[derive(Debug)]
pub struct MemoryAddressStore {
    inner: Mutex<Inner>,
    path: Option<PathBuf>,
}

impl MemoryAddressStore {
    /// Empty store with a fresh random key and no backing file.
    pub fn new() -> Self {
        Self::with_dimensions(rand::random(), Dimensions::default(), None)
    }

    fn with_dimensions(key: [u64; 2], dims: Dimensions, path: Option<PathBuf>) -> Self {
        Self {
            inner: Mutex::new(Inner::new(key, dims)),
            path,
        }
    }

    /// Load from `path`, starting empty if it does not exist.
    ///
    /// A corrupt file is reported and replaced by an empty store.
    pub fn load(path: impl AsRef<Path>) -> NetworkResult<Self> {
        let path = path.as_ref().to_path_buf();
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No peers file, starting with an empty address store");
                return Ok(Self::with_dimensions(rand::random(), Dimensions::default(), Some(path)));
            }
            Err(e) => return Err(NetworkError::Io(e)),
        };

        match serde_json::from_slice::<PeersFile>(&data) {
            Ok(file) if file.version == PEERS_FILE_VERSION => {
                let inner = Inner::from_file(file, Dimensions::default());
                info!(
                    path = %path.display(),
                    new = inner.new_count,
                    tried = inner.tried_count,
                    "Loaded addresses"
                );
                Ok(Self {
                    inner: Mutex::new(inner),
                    path: Some(path),
                })
            }
            Ok(file) => {
                warn!(version = file.version, "Unsupported peers file version, starting empty");
                Ok(Self::with_dimensions(rand::random(), Dimensions::default(), Some(path)))
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Invalid or corrupt peers file, starting empty");
                Ok(Self::with_dimensions(rand::random(), Dimensions::default(), Some(path)))
            }
        }
    }

    /// Number of entries in the new and tried tables.
    pub fn table_sizes(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.new_count, inner.tried_count)
    }

    /// Look up a single entry.
    pub fn find(&self, addr: &SocketAddr) -> Option<AddrInfo> {
        let inner = self.inner.lock();
        inner.find(addr).and_then(|id| inner.entries.get(&id)).map(|e| e.info.clone())
    }

    /// Mark as good, optionally bypassing collision testing.
    pub fn good_with(&self, addr: &SocketAddr, test_before_evict: bool, time: i64) {
        self.inner.lock().good(addr, test_before_evict, time);
    }
}

impl Default for MemoryAddressStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressStore for MemoryAddressStore {
    fn select(&self, new_only: bool) -> Option<AddrInfo> {
        self.inner.lock().select(new_only)
    }

    fn add(&self, addrs: &[AddrInfo], source: IpAddr, time_penalty: i64) -> usize {
        let now = unix_time();
        let mut inner = self.inner.lock();
        let added = addrs
            .iter()
            .filter(|a| inner.add_one((*a).clone(), source, time_penalty, now))
            .count();
        if added > 0 {
            debug!(
                added,
                source = %source,
                new = inner.new_count,
                tried = inner.tried_count,
                "Added addresses"
            );
        }
        added
    }

    fn good(&self, addr: &SocketAddr, time: i64) {
        self.inner.lock().good(addr, true, time);
    }

    fn attempt(&self, addr: &SocketAddr, count_failure: bool, time: i64) {
        self.inner.lock().attempt(addr, count_failure, time);
    }

    fn connected(&self, addr: &SocketAddr, time: i64) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.find(addr).and_then(|id| inner.entries.get_mut(&id)) else {
            return;
        };
        if time - entry.info.time > 20 * 60 {
            entry.info.time = time;
        }
    }

    fn set_services(&self, addr: &SocketAddr, services: ServiceFlags) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.find(addr).and_then(|id| inner.entries.get_mut(&id)) {
            entry.info.services = services;
        }
    }

    fn resolve_collisions(&self) {
        self.inner.lock().resolve_collisions();
    }

    fn select_tried_collision(&self) -> Option<AddrInfo> {
        self.inner.lock().select_tried_collision()
    }

    fn size(&self) -> usize {
        self.inner.lock().random.len()
    }

    fn get_addr(&self, max_addresses: usize, max_pct: usize) -> Vec<AddrInfo> {
        self.inner.lock().get_addr(max_addresses, max_pct)
    }

    fn flush(&self) -> NetworkResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = self.inner.lock().to_file();
        let count = file.addrs.len();
        let data = serde_json::to_vec(&file)?;

        // Write then rename so a crash never leaves a half-written file.
        let tmp = path.with_extension("json.new");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, path)?;
        debug!(path = %path.display(), count, "Flushed addresses");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sa(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn announced(s: &str) -> AddrInfo {
        AddrInfo::new(sa(s), ServiceFlags::NETWORK, unix_time() - 60)
    }

    fn source() -> IpAddr {
        "8.8.8.8".parse().unwrap()
    }

    #[test]
    fn test_add_and_dedup() {
        let store = MemoryAddressStore::new();
        assert_eq!(store.add(&[announced("1.2.3.4:7890")], source(), 0), 1);
        assert_eq!(store.add(&[announced("1.2.3.4:7890")], source(), 0), 0);
        assert_eq!(store.size(), 1);
        assert_eq!(store.table_sizes(), (1, 0));
    }

    #[test]
    fn test_newer_announcement_keeps_single_slot() {
        let store = MemoryAddressStore::new();
        let first = announced("1.2.3.4:7890");
        assert_eq!(store.add(&[first.clone()], source(), 0), 1);

        // Fresher timestamp and extra services reach the slot check.
        let fresher = AddrInfo::new(first.addr, ServiceFlags::NETWORK_LIMITED, unix_time());
        assert_eq!(store.add(&[fresher], source(), 0), 0);
        assert_eq!(store.table_sizes(), (1, 0));
        let info = store.find(&first.addr).unwrap();
        assert!(info.services.contains(ServiceFlags::NETWORK | ServiceFlags::NETWORK_LIMITED));
    }

    #[test]
    fn test_add_rejects_unroutable() {
        let store = MemoryAddressStore::new();
        let addrs = [announced("10.0.0.1:7890"), announced("127.0.0.1:7890")];
        assert_eq!(store.add(&addrs, source(), 0), 0);
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn test_time_penalty_skipped_for_self_announcement() {
        let store = MemoryAddressStore::new();
        let addr = announced("1.2.3.4:7890");
        let time = addr.time;
        store.add(&[addr.clone()], "1.2.3.4".parse().unwrap(), 2 * 60 * 60);
        assert_eq!(store.find(&addr.addr).unwrap().time, time);

        let other = announced("1.2.4.4:7890");
        store.add(&[other.clone()], source(), 2 * 60 * 60);
        assert_eq!(store.find(&other.addr).unwrap().time, other.time - 2 * 60 * 60);
    }

    #[test]
    fn test_good_moves_to_tried() {
        let store = MemoryAddressStore::new();
        let addr = announced("1.2.3.4:7890");
        store.add(&[addr.clone()], source(), 0);
        store.good(&addr.addr, unix_time());
        assert_eq!(store.table_sizes(), (0, 1));
        assert!(store.find(&addr.addr).unwrap().in_tried);

        assert!(store.select(true).is_none());
        assert_eq!(store.select(false).unwrap().addr, addr.addr);
    }

    #[test]
    fn test_select_empty() {
        let store = MemoryAddressStore::new();
        assert!(store.select(false).is_none());
        assert!(store.select(true).is_none());
    }

    #[test]
    fn test_attempt_counts_once_per_good() {
        let store = MemoryAddressStore::new();
        let addr = announced("1.2.3.4:7890");
        store.add(&[addr.clone()], source(), 0);
        let now = unix_time();
        store.attempt(&addr.addr, true, now);
        store.attempt(&addr.addr, true, now + 1);
        assert_eq!(store.find(&addr.addr).unwrap().attempts, 1);
        assert_eq!(store.find(&addr.addr).unwrap().last_try, now + 1);

        // A success elsewhere re-arms failure counting.
        let other = announced("5.6.7.8:7890");
        store.add(&[other.clone()], source(), 0);
        store.good(&other.addr, now + 2);
        store.attempt(&addr.addr, true, now + 3);
        assert_eq!(store.find(&addr.addr).unwrap().attempts, 2);
    }

    #[test]
    fn test_connected_refreshes_stale_time() {
        let store = MemoryAddressStore::new();
        let addr = announced("1.2.3.4:7890");
        store.add(&[addr.clone()], source(), 0);
        let before = store.find(&addr.addr).unwrap().time;
        store.connected(&addr.addr, before + 60);
        assert_eq!(store.find(&addr.addr).unwrap().time, before);
        store.connected(&addr.addr, before + 21 * 60);
        assert_eq!(store.find(&addr.addr).unwrap().time, before + 21 * 60);
    }

    #[test]
    fn test_is_terrible() {
        let now = 1_700_000_000;
        let mut info = AddrInfo::new(sa("1.2.3.4:7890"), ServiceFlags::NETWORK, now - 100);
        assert!(!info.is_terrible(now));

        info.time = now + 11 * 60;
        assert!(info.is_terrible(now));

        info.time = now - 31 * 24 * 60 * 60;
        assert!(info.is_terrible(now));
        // Tried a moment ago wins over everything.
        info.last_try = now - 30;
        assert!(!info.is_terrible(now));

        info.time = now - 100;
        info.last_try = now - 3600;
        info.attempts = 3;
        assert!(info.is_terrible(now));

        info.last_success = now - 8 * 24 * 60 * 60;
        assert!(!info.is_terrible(now));
        info.attempts = 10;
        assert!(info.is_terrible(now));
    }

    #[test]
    fn test_chance() {
        let now = 1_700_000_000;
        let mut info = AddrInfo::new(sa("1.2.3.4:7890"), ServiceFlags::NETWORK, now);
        assert!((info.chance(now) - 1.0).abs() < 1e-9);
        info.last_try = now - 60;
        assert!((info.chance(now) - 0.01).abs() < 1e-9);
        info.last_try = 0;
        info.attempts = 20;
        assert!((info.chance(now) - 0.66f64.powi(8)).abs() < 1e-9);
    }

    #[test]
    fn test_get_addr_percentage() {
        let store = MemoryAddressStore::new();
        let addrs: Vec<_> = (0..100)
            .map(|i| announced(&format!("{}.{}.1.1:7890", 20 + i, i)))
            .collect();
        store.add(&addrs, source(), 0);
        let size = store.size();
        let shared = store.get_addr(GETADDR_MAX, GETADDR_MAX_PCT);
        assert_eq!(shared.len(), GETADDR_MAX_PCT * size / 100);
        assert_eq!(store.get_addr(5, 0).len(), 5.min(size));
    }

    #[test]
    fn test_tried_collision_kept_while_old_entry_works() {
        let dims = Dimensions {
            tried_buckets: 1,
            new_buckets: 4096,
            bucket_size: 1,
        };
        let store = MemoryAddressStore::with_dimensions([1, 2], dims, None);
        let old = announced("1.2.3.4:7890");
        let new = announced("5.6.7.8:7890");
        store.add(&[old.clone()], source(), 0);
        store.add(&[new.clone()], "9.9.9.9".parse().unwrap(), 0);

        let now = unix_time();
        store.good(&old.addr, now);
        store.good(&new.addr, now);
        assert_eq!(store.table_sizes().1, 1);
        assert_eq!(store.select_tried_collision().unwrap().addr, old.addr);

        // The old entry succeeded recently, so the collision is dropped.
        store.resolve_collisions();
        assert!(store.select_tried_collision().is_none());
        assert!(store.find(&old.addr).unwrap().in_tried);
        assert!(!store.find(&new.addr).unwrap().in_tried);
    }

    #[test]
    fn test_tried_collision_replaces_stale_entry() {
        let dims = Dimensions {
            tried_buckets: 1,
            new_buckets: 4096,
            bucket_size: 1,
        };
        let store = MemoryAddressStore::with_dimensions([3, 4], dims, None);
        let old = announced("1.2.3.4:7890");
        let new = announced("5.6.7.8:7890");
        store.add(&[old.clone()], source(), 0);
        store.add(&[new.clone()], "9.9.9.9".parse().unwrap(), 0);

        let now = unix_time();
        store.good(&old.addr, now - 10 * 60 * 60);
        store.good(&new.addr, now - 60 * 60);
        store.resolve_collisions();

        assert!(store.find(&new.addr).unwrap().in_tried);
        assert!(!store.find(&old.addr).map(|i| i.in_tried).unwrap_or(false));
        assert!(store.select_tried_collision().is_none());
    }

    #[test]
    fn test_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");

        let store = MemoryAddressStore::load(&path).unwrap();
        let a = announced("1.2.3.4:7890");
        let b = announced("5.6.7.8:7890");
        store.add(&[a.clone(), b.clone()], source(), 0);
        store.good(&a.addr, unix_time());
        store.flush().unwrap();

        let reloaded = MemoryAddressStore::load(&path).unwrap();
        assert_eq!(reloaded.size(), 2);
        assert!(reloaded.find(&a.addr).unwrap().in_tried);
        assert!(!reloaded.find(&b.addr).unwrap().in_tried);
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");
        std::fs::write(&path, b"not json").unwrap();
        let store = MemoryAddressStore::load(&path).unwrap();
        assert_eq!(store.size(), 0);
    }
}
