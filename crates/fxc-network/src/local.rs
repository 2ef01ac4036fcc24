//! Local address table and per-network reachability.
//!
//! Owned by the connection manager and shared by handle with whoever needs
//! it, instead of living in process-wide globals.

use crate::netaddr::{canonical_ip, is_routable, network_of, Network};
use crate::protocol::ServiceFlags;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tracing::{debug, info};

/// How much we trust a local address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LocalScore {
    /// Address of a local interface.
    Interface = 1,
    /// Address we bound to.
    Bind = 2,
    /// Address configured by the operator.
    Manual = 4,
}

#[derive(Debug, Clone, Copy)]
struct LocalEntry {
    score: i32,
    port: u16,
}

/// Local addresses we may advertise, plus network reachability switches.
#[derive(Debug)]
pub struct LocalAddresses {
    entries: RwLock<HashMap<IpAddr, LocalEntry>>,
    unreachable: RwLock<HashSet<Network>>,
    discover: bool,
    listen: bool,
    default_port: u16,
}

impl LocalAddresses {
    /// Create an empty table.
    pub fn new(discover: bool, listen: bool, default_port: u16) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            unreachable: RwLock::new(HashSet::new()),
            discover,
            listen,
            default_port,
        }
    }

    /// Whether we accept inbound connections.
    pub fn listening(&self) -> bool {
        self.listen
    }

    /// Whether automatically discovered addresses are recorded.
    pub fn discovering(&self) -> bool {
        self.discover
    }

    /// Mark a network as reachable or not.
    pub fn set_reachable(&self, net: Network, reachable: bool) {
        if matches!(net, Network::Unroutable | Network::Internal) {
            return;
        }
        let mut unreachable = self.unreachable.write();
        if reachable {
            unreachable.remove(&net);
        } else {
            unreachable.insert(net);
        }
    }

    /// Whether a network may be used.
    pub fn is_reachable_net(&self, net: Network) -> bool {
        !self.unreachable.read().contains(&net)
    }

    /// Whether the network of `ip` may be used.
    pub fn is_reachable(&self, ip: &IpAddr) -> bool {
        self.is_reachable_net(network_of(ip))
    }

    /// Record a local address.
    ///
    /// Unroutable and unreachable addresses are ignored, as are
    /// non-manual ones when discovery is off.
    pub fn add_local(&self, addr: SocketAddr, score: LocalScore) -> bool {
        let ip = canonical_ip(addr.ip());
        if !is_routable(&ip) {
            return false;
        }
        if !self.discover && score < LocalScore::Manual {
            return false;
        }
        if !self.is_reachable(&ip) {
            return false;
        }

        info!(addr = %addr, score = score as i32, "Added local address");
        let mut entries = self.entries.write();
        let entry = entries.entry(ip).or_insert(LocalEntry {
            score: score as i32,
            port: addr.port(),
        });
        if score as i32 >= entry.score {
            entry.score = score as i32 + 1;
            entry.port = addr.port();
        }
        true
    }

    /// Forget a local address.
    pub fn remove_local(&self, addr: &SocketAddr) {
        info!(addr = %addr, "Removed local address");
        self.entries.write().remove(&canonical_ip(addr.ip()));
    }

    /// A peer reported seeing us at `addr`; bump its score.
    pub fn seen_local(&self, addr: &SocketAddr) -> bool {
        match self.entries.write().get_mut(&canonical_ip(addr.ip())) {
            Some(entry) => {
                entry.score += 1;
                true
            }
            None => false,
        }
    }

    /// Whether `addr` is one of our own addresses.
    pub fn is_local(&self, addr: &SocketAddr) -> bool {
        self.entries.read().contains_key(&canonical_ip(addr.ip()))
    }

    /// Best local address to advertise to `peer`.
    ///
    /// Prefers addresses on the peer's network, then the highest score.
    pub fn best_local(&self, peer: Option<&SocketAddr>) -> Option<SocketAddr> {
        if !self.listen {
            return None;
        }
        let peer_net = peer.map(|p| network_of(&p.ip()));
        self.entries
            .read()
            .iter()
            .max_by_key(|(ip, entry)| (Some(network_of(ip)) == peer_net, entry.score))
            .map(|(ip, entry)| SocketAddr::new(*ip, entry.port))
    }

    /// Address and services to advertise, falling back to an unspecified
    /// address on the default port.
    pub fn local_address(&self, peer: Option<&SocketAddr>, services: ServiceFlags) -> (SocketAddr, ServiceFlags) {
        let addr = self
            .best_local(peer)
            .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.default_port));
        (addr, services)
    }

    /// Whether the address a peer saw us at is worth advertising back.
    pub fn is_peer_addr_local_good(&self, addr_local: &SocketAddr, peer: &SocketAddr) -> bool {
        self.discover
            && is_routable(&addr_local.ip())
            && self.is_reachable(&addr_local.ip())
            && self.is_reachable(&peer.ip())
    }

    /// Add routable addresses we bound to.
    pub fn discover_from_binds(&self, binds: &[SocketAddr]) {
        if !self.discover {
            return;
        }
        for addr in binds {
            if !addr.ip().is_unspecified() && self.add_local(*addr, LocalScore::Bind) {
                debug!(addr = %addr, "Discovered local address from bind");
            }
        }
    }

    /// Snapshot of the table.
    pub fn snapshot(&self) -> Vec<(SocketAddr, i32)> {
        self.entries
            .read()
            .iter()
            .map(|(ip, entry)| (SocketAddr::new(*ip, entry.port), entry.score))
            .collect()
    }
}
