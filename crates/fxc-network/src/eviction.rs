//! Inbound eviction.
//!
//! When every inbound slot is taken, one existing inbound peer may be
//! dropped to make room. Candidates are protected in successive passes on
//! independent criteria that are hard for an attacker to fake all at once;
//! the victim comes from whatever is left.

use crate::peer::NodeId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::net::SocketAddr;

/// How many candidates each protection pass shields.
///
/// The order of the passes is fixed; only the counts are tunable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// Lowest keyed network groups.
    pub protect_netgroup: usize,
    /// Lowest minimum ping.
    pub protect_ping: usize,
    /// Most recent transaction relay.
    pub protect_tx: usize,
    /// Most recent block relay.
    pub protect_block: usize,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            protect_netgroup: 4,
            protect_ping: 8,
            protect_tx: 4,
            protect_block: 4,
        }
    }
}

/// Read-only snapshot of one inbound connection.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub id: NodeId,
    /// Unix time connected.
    pub connected: i64,
    /// Microseconds; `i64::MAX` if never measured.
    pub min_ping_time: i64,
    pub last_block_time: i64,
    pub last_tx_time: i64,
    pub relevant_services: bool,
    pub relay_txes: bool,
    pub bloom_filter: bool,
    pub addr: SocketAddr,
    pub keyed_net_group: u64,
    pub prefer_evict: bool,
}

/// Sort with `cmp` (ascending = more evictable first) and drop the last
/// `k` entries, protecting them.
fn protect_last<F>(candidates: &mut Vec<EvictionCandidate>, k: usize, cmp: F)
where
    F: FnMut(&EvictionCandidate, &EvictionCandidate) -> Ordering,
{
    candidates.sort_by(cmp);
    let keep = candidates.len().saturating_sub(k);
    candidates.truncate(keep);
}

fn by_keyed_net_group(a: &EvictionCandidate, b: &EvictionCandidate) -> Ordering {
    // Highest group first so the lowest groups end up protected.
    b.keyed_net_group.cmp(&a.keyed_net_group)
}

fn by_min_ping_desc(a: &EvictionCandidate, b: &EvictionCandidate) -> Ordering {
    b.min_ping_time.cmp(&a.min_ping_time)
}

fn by_tx_time(a: &EvictionCandidate, b: &EvictionCandidate) -> Ordering {
    a.last_tx_time
        .cmp(&b.last_tx_time)
        // Peers that do not relay sort as more evictable.
        .then_with(|| a.relay_txes.cmp(&b.relay_txes))
        // So do peers with a bloom filter.
        .then_with(|| b.bloom_filter.cmp(&a.bloom_filter))
        .then_with(|| b.connected.cmp(&a.connected))
}

fn by_block_time(a: &EvictionCandidate, b: &EvictionCandidate) -> Ordering {
    a.last_block_time
        .cmp(&b.last_block_time)
        .then_with(|| a.relevant_services.cmp(&b.relevant_services))
        .then_with(|| b.connected.cmp(&a.connected))
}

fn by_connected_desc(a: &EvictionCandidate, b: &EvictionCandidate) -> Ordering {
    b.connected.cmp(&a.connected)
}

/// Pick the inbound connection to evict, if any.
///
/// Callers exclude no-ban, outbound and already disconnecting peers before
/// building the candidate list.
pub fn select_victim(mut candidates: Vec<EvictionCandidate>, config: &EvictionConfig) -> Option<NodeId> {
    protect_last(&mut candidates, config.protect_netgroup, by_keyed_net_group);
    protect_last(&mut candidates, config.protect_ping, by_min_ping_desc);
    protect_last(&mut candidates, config.protect_tx, by_tx_time);
    protect_last(&mut candidates, config.protect_block, by_block_time);
    let half = candidates.len() / 2;
    protect_last(&mut candidates, half, by_connected_desc);

    if candidates.is_empty() {
        return None;
    }

    if candidates.iter().any(|c| c.prefer_evict) {
        candidates.retain(|c| c.prefer_evict);
    }

    first_of_largest_group(&candidates)
}

/// First member, in candidate order, of the biggest keyed network group.
///
/// Walks candidates in order, growing each group. A group takes the lead
/// when it gets larger than the leader, or as large and younger. On an
/// exact tie the group that got there first keeps the lead.
fn first_of_largest_group(candidates: &[EvictionCandidate]) -> Option<NodeId> {
    let mut groups: HashMap<u64, (usize, &EvictionCandidate)> = HashMap::new();
    let mut best: Option<(usize, i64, &EvictionCandidate)> = None;
    for candidate in candidates {
        let group = groups.entry(candidate.keyed_net_group).or_insert((0, candidate));
        group.0 += 1;
        let (size, first) = *group;
        let better = match best {
            None => true,
            Some((best_size, best_time, _)) => {
                size > best_size || (size == best_size && first.connected > best_time)
            }
        };
        if better {
            best = Some((size, first.connected, first));
        }
    }
    best.map(|(_, _, victim)| victim.id)
}
