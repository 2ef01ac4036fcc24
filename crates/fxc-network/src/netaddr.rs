//! Network address classification.
//!
//! Classifies IP addresses into networks, decides routability and derives
//! the network group used for outbound diversity and eviction.

use crate::{NetworkError, NetworkResult};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// OnionCat prefix, fd87:d87e:eb43::/48.
const ONION_PREFIX: [u8; 6] = [0xfd, 0x87, 0xd8, 0x7e, 0xeb, 0x43];
/// Prefix for addresses derived from names, fd6b:88c0:8724::/48.
const INTERNAL_PREFIX: [u8; 6] = [0xfd, 0x6b, 0x88, 0xc0, 0x87, 0x24];

/// Network an address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Network {
    /// Not publicly routable.
    Unroutable,
    /// IPv4.
    Ipv4,
    /// IPv6.
    Ipv6,
    /// Tor, encoded as OnionCat.
    Onion,
    /// Placeholder addresses standing for names (DNS seeds).
    Internal,
}

impl Network {
    /// Networks that can be reached and toggled individually.
    pub const REACHABLE: [Network; 3] = [Network::Ipv4, Network::Ipv6, Network::Onion];

    /// Parse a network name as used in configuration.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "ipv4" => Some(Network::Ipv4),
            "ipv6" => Some(Network::Ipv6),
            "onion" | "tor" => Some(Network::Onion),
            _ => None,
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Network::Unroutable => "unroutable",
            Network::Ipv4 => "ipv4",
            Network::Ipv6 => "ipv6",
            Network::Onion => "onion",
            Network::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Strip an IPv4-mapped IPv6 wrapper.
pub fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// Socket address with a canonical IP.
pub fn canonical_addr(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(canonical_ip(addr.ip()), addr.port())
}

fn v4_in(ip: &Ipv4Addr, net: [u8; 4], prefix: u8) -> bool {
    let mask = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    };
    (u32::from(*ip) & mask) == (u32::from_be_bytes(net) & mask)
}

fn v6_starts(ip: &Ipv6Addr, prefix: &[u8]) -> bool {
    ip.octets().starts_with(prefix)
}

/// 10/8, 172.16/12, 192.168/16.
pub fn is_rfc1918(ip: &IpAddr) -> bool {
    match canonical_ip(*ip) {
        IpAddr::V4(v4) => {
            v4_in(&v4, [10, 0, 0, 0], 8)
                || v4_in(&v4, [172, 16, 0, 0], 12)
                || v4_in(&v4, [192, 168, 0, 0], 16)
        }
        IpAddr::V6(_) => false,
    }
}

/// 198.18/15, benchmarking.
pub fn is_rfc2544(ip: &IpAddr) -> bool {
    matches!(canonical_ip(*ip), IpAddr::V4(v4) if v4_in(&v4, [198, 18, 0, 0], 15))
}

/// 169.254/16, link local.
pub fn is_rfc3927(ip: &IpAddr) -> bool {
    matches!(canonical_ip(*ip), IpAddr::V4(v4) if v4_in(&v4, [169, 254, 0, 0], 16))
}

/// 100.64/10, carrier-grade NAT.
pub fn is_rfc6598(ip: &IpAddr) -> bool {
    matches!(canonical_ip(*ip), IpAddr::V4(v4) if v4_in(&v4, [100, 64, 0, 0], 10))
}

/// Documentation ranges 192.0.2/24, 198.51.100/24, 203.0.113/24.
pub fn is_rfc5737(ip: &IpAddr) -> bool {
    matches!(canonical_ip(*ip), IpAddr::V4(v4)
        if v4_in(&v4, [192, 0, 2, 0], 24)
            || v4_in(&v4, [198, 51, 100, 0], 24)
            || v4_in(&v4, [203, 0, 113, 0], 24))
}

/// 2001:db8::/32, IPv6 documentation.
pub fn is_rfc3849(ip: &IpAddr) -> bool {
    matches!(ip, IpAddr::V6(v6) if v6_starts(v6, &[0x20, 0x01, 0x0d, 0xb8]))
}

/// 2002::/16, 6to4.
pub fn is_rfc3964(ip: &IpAddr) -> bool {
    matches!(ip, IpAddr::V6(v6) if v6_starts(v6, &[0x20, 0x02]))
}

/// 64:ff9b::/96, well-known NAT64 prefix.
pub fn is_rfc6052(ip: &IpAddr) -> bool {
    matches!(ip, IpAddr::V6(v6)
        if v6_starts(v6, &[0x00, 0x64, 0xff, 0x9b, 0, 0, 0, 0, 0, 0, 0, 0]))
}

/// 2001::/32, Teredo.
pub fn is_rfc4380(ip: &IpAddr) -> bool {
    matches!(ip, IpAddr::V6(v6) if v6_starts(v6, &[0x20, 0x01, 0x00, 0x00]))
}

/// fe80::/64, IPv6 autoconfig.
pub fn is_rfc4862(ip: &IpAddr) -> bool {
    matches!(ip, IpAddr::V6(v6) if v6_starts(v6, &[0xfe, 0x80, 0, 0, 0, 0, 0, 0]))
}

/// fc00::/7, unique local.
pub fn is_rfc4193(ip: &IpAddr) -> bool {
    matches!(ip, IpAddr::V6(v6) if (v6.octets()[0] & 0xfe) == 0xfc)
}

/// ::ffff:0:0:0/96, IPv4-translated.
pub fn is_rfc6145(ip: &IpAddr) -> bool {
    matches!(ip, IpAddr::V6(v6)
        if v6_starts(v6, &[0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 0, 0]))
}

/// 2001:10::/28, ORCHID.
pub fn is_rfc4843(ip: &IpAddr) -> bool {
    matches!(ip, IpAddr::V6(v6) if {
        let o = v6.octets();
        o[0] == 0x20 && o[1] == 0x01 && o[2] == 0x00 && (o[3] & 0xf0) == 0x10
    })
}

/// 2001:20::/28, ORCHIDv2.
pub fn is_rfc7343(ip: &IpAddr) -> bool {
    matches!(ip, IpAddr::V6(v6) if {
        let o = v6.octets();
        o[0] == 0x20 && o[1] == 0x01 && o[2] == 0x00 && (o[3] & 0xf0) == 0x20
    })
}

/// Tor address encoded in the OnionCat range.
pub fn is_onion(ip: &IpAddr) -> bool {
    matches!(ip, IpAddr::V6(v6) if v6_starts(v6, &ONION_PREFIX))
}

/// Placeholder address derived from a name.
pub fn is_internal(ip: &IpAddr) -> bool {
    matches!(ip, IpAddr::V6(v6) if v6_starts(v6, &INTERNAL_PREFIX))
}

/// Loopback and 0.0.0.0/8.
pub fn is_local(ip: &IpAddr) -> bool {
    match canonical_ip(*ip) {
        IpAddr::V4(v4) => v4.octets()[0] == 127 || v4.octets()[0] == 0,
        IpAddr::V6(v6) => v6 == Ipv6Addr::LOCALHOST,
    }
}

/// Whether the address can be used at all.
pub fn is_valid(ip: &IpAddr) -> bool {
    if is_rfc3849(ip) || is_internal(ip) {
        return false;
    }
    match canonical_ip(*ip) {
        IpAddr::V4(v4) => !(v4.is_unspecified() || v4.is_broadcast()),
        IpAddr::V6(v6) => !v6.is_unspecified(),
    }
}

/// Whether the address is valid and publicly routable.
pub fn is_routable(ip: &IpAddr) -> bool {
    is_valid(ip)
        && !(is_rfc1918(ip)
            || is_rfc2544(ip)
            || is_rfc3927(ip)
            || is_rfc4862(ip)
            || is_rfc6598(ip)
            || is_rfc5737(ip)
            || (is_rfc4193(ip) && !is_onion(ip))
            || is_rfc4843(ip)
            || is_rfc7343(ip)
            || is_local(ip)
            || is_internal(ip))
}

/// Network of an address.
pub fn network_of(ip: &IpAddr) -> Network {
    if is_internal(ip) {
        return Network::Internal;
    }
    if !is_routable(ip) {
        return Network::Unroutable;
    }
    if is_onion(ip) {
        return Network::Onion;
    }
    match canonical_ip(*ip) {
        IpAddr::V4(_) => Network::Ipv4,
        IpAddr::V6(_) => Network::Ipv6,
    }
}

/// Network group: addresses in the same group are assumed to be under
/// common control.
///
/// IPv4 groups by /16, IPv6 by /32 (/36 for he.net, /4 for onion). Tunnelled
/// IPv4 addresses (6to4, Teredo, NAT64, IPv4-mapped) group by their embedded
/// IPv4 /16. Local addresses share one group, as do unroutable ones.
pub fn group(ip: &IpAddr) -> Vec<u8> {
    let ip = canonical_ip(*ip);
    if is_local(&ip) {
        return vec![255];
    }

    let (class, bytes, mut bits): (Network, Vec<u8>, usize) = match ip {
        IpAddr::V6(v6) if is_internal(&ip) => (Network::Internal, v6.octets()[6..].to_vec(), 80),
        _ if !is_routable(&ip) => return vec![Network::Unroutable as u8],
        IpAddr::V4(v4) => (Network::Ipv4, v4.octets().to_vec(), 16),
        IpAddr::V6(v6) => {
            let o = v6.octets();
            if is_rfc6145(&ip) || is_rfc6052(&ip) {
                (Network::Ipv4, o[12..16].to_vec(), 16)
            } else if is_rfc3964(&ip) {
                (Network::Ipv4, o[2..6].to_vec(), 16)
            } else if is_rfc4380(&ip) {
                (Network::Ipv4, o[12..16].iter().map(|b| b ^ 0xff).collect(), 16)
            } else if is_onion(&ip) {
                (Network::Onion, o[6..].to_vec(), 4)
            } else if o[..4] == [0x20, 0x01, 0x04, 0x70] {
                (Network::Ipv6, o.to_vec(), 36)
            } else {
                (Network::Ipv6, o.to_vec(), 32)
            }
        }
    };

    let mut out = vec![class as u8];
    let mut iter = bytes.into_iter();
    while bits >= 8 {
        match iter.next() {
            Some(b) => out.push(b),
            None => break,
        }
        bits -= 8;
    }
    if bits > 0 {
        if let Some(b) = iter.next() {
            out.push(b | ((1u8 << (8 - bits)) - 1));
        }
    }
    out
}

/// Placeholder address standing for a name, used as the source of
/// addresses learned from DNS seeds.
pub fn internal_addr_for_name(name: &str) -> IpAddr {
    let hash = Sha256::digest(name.as_bytes());
    let mut octets = [0u8; 16];
    octets[..6].copy_from_slice(&INTERNAL_PREFIX);
    octets[6..].copy_from_slice(&hash[..10]);
    IpAddr::V6(Ipv6Addr::from(octets))
}

/// Parse a subnet: `addr`, `addr/prefix` or `addr/netmask`.
pub fn parse_subnet(s: &str) -> NetworkResult<IpNet> {
    let s = s.trim();
    if let Ok(net) = s.parse::<IpNet>() {
        return Ok(net.trunc());
    }
    if let Some((addr, mask)) = s.split_once('/') {
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| NetworkError::InvalidAddress(format!("Invalid subnet: {}", s)))?;
        let mask: IpAddr = mask
            .parse()
            .map_err(|_| NetworkError::InvalidAddress(format!("Invalid netmask: {}", s)))?;
        let prefix = ipnet::ip_mask_to_prefix(mask)
            .map_err(|_| NetworkError::InvalidAddress(format!("Non-contiguous netmask: {}", s)))?;
        return IpNet::new(addr, prefix)
            .map(|n| n.trunc())
            .map_err(|_| NetworkError::InvalidAddress(format!("Invalid subnet: {}", s)));
    }
    let addr: IpAddr = s
        .parse()
        .map_err(|_| NetworkError::InvalidAddress(format!("Invalid subnet: {}", s)))?;
    let addr = canonical_ip(addr);
    let prefix = if addr.is_ipv4() { 32 } else { 128 };
    IpNet::new(addr, prefix).map_err(|_| NetworkError::InvalidAddress(format!("Invalid subnet: {}", s)))
}

/// Whether `subnet` contains `ip`, looking through IPv4 mapping.
pub fn subnet_contains(subnet: &IpNet, ip: &IpAddr) -> bool {
    subnet.contains(&canonical_ip(*ip))
}

/// Parse `host:port`, `[v6]:port` or a bare host with the default port.
///
/// Only numeric hosts; names go through [`crate::socket::lookup`].
pub fn parse_numeric(s: &str, default_port: u16) -> Option<SocketAddr> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Some(canonical_addr(addr));
    }
    s.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .ok()
        .map(|ip| SocketAddr::new(canonical_ip(ip), default_port))
}

/// Split `host[:port]` into host and optional port.
pub fn split_host_port(s: &str) -> (String, Option<u16>) {
    if let Some(rest) = s.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
            return (host.to_string(), port);
        }
    }
    match s.rsplit_once(':') {
        // A second colon means a bare IPv6 address.
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host.to_string(), Some(port)),
            Err(_) => (s.to_string(), None),
        },
        _ => (s.to_string(), None),
    }
}
