//! Test data generators.
//!
//! Builders for wire messages, eviction candidates and addresses shared by
//! the property and integration tests.

use crate::harness::TEST_MAGIC;
use fxc_network::protocol::serialize_message;
use fxc_network::{AddrInfo, EvictionCandidate, NodeId, ServiceFlags};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Header plus payload as it appears on the wire.
pub fn framed(msg_type: &str, payload: &[u8]) -> Vec<u8> {
    serialize_message(TEST_MAGIC, msg_type, payload)
        .expect("valid message type")
        .to_vec()
}

/// Split `data` at the given cut points (taken modulo its length, sorted).
///
/// Repeated points, and a cut at zero, yield empty chunks.
pub fn split_at_points(data: &[u8], cuts: &[usize]) -> Vec<Vec<u8>> {
    if data.is_empty() {
        return Vec::new();
    }
    let mut points: Vec<usize> = cuts.iter().map(|c| c % data.len()).collect();
    points.push(0);
    points.push(data.len());
    points.sort_unstable();
    points.windows(2).map(|w| data[w[0]..w[1]].to_vec()).collect()
}

/// An inbound eviction candidate with neutral attributes.
///
/// Each id gets its own network group, ping and connect time, all
/// increasing with the id.
pub fn candidate(id: NodeId) -> EvictionCandidate {
    EvictionCandidate {
        id,
        connected: 1_000 + id as i64,
        min_ping_time: 1_000 + id as i64,
        last_block_time: 0,
        last_tx_time: 0,
        relevant_services: false,
        relay_txes: false,
        bloom_filter: false,
        addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, (id % 256) as u8, 1, 1)), 7890),
        keyed_net_group: id,
        prefer_evict: false,
    }
}

/// A routable IPv4 store entry on the default port.
pub fn addr_info(a: u8, b: u8, c: u8, d: u8, time: i64) -> AddrInfo {
    AddrInfo::new(
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(a, b, c, d)), 7890),
        ServiceFlags::NETWORK,
        time,
    )
}
