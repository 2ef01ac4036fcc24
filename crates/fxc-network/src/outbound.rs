//! Outbound peer selection.
//!
//! Decides which address the outbound loop dials next, and when the next
//! feeler is due.

use crate::addrman::{AddrInfo, AddressStore};
use crate::local::LocalAddresses;
use crate::netaddr::{group, is_valid};
use crate::protocol::{has_all_desirable_service_flags, may_have_useful_address_db, ServiceFlags};
use rand::Rng;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::trace;

/// Draws from the store before giving up until the next loop iteration.
pub const MAX_SELECTION_TRIES: usize = 100;
/// Draws after which recently tried addresses become acceptable.
const RECENT_TRY_RELAX_AFTER: usize = 30;
/// Draws after which non-default ports become acceptable.
const PORT_RELAX_AFTER: usize = 50;
/// An address tried this recently is skipped, in seconds.
const RECENT_TRY_WINDOW: i64 = 600;

/// Fixed inputs to one selection round.
pub struct SelectionContext<'a> {
    pub local: &'a LocalAddresses,
    pub default_port: u16,
    pub desirable_services: ServiceFlags,
    /// Unix seconds.
    pub now: i64,
}

/// Pick the next address to dial, or `None` to wait for the next loop.
///
/// `connected_groups` holds the network groups of current non-manual
/// outbound peers; regular connections never share a group with one of
/// them, feelers may. Feelers first try to test a pending tried-table
/// collision and otherwise draw only from never-tried addresses.
pub fn choose_next_candidate(
    store: &dyn AddressStore,
    connected_groups: &HashSet<Vec<u8>>,
    feeler: bool,
    ctx: &SelectionContext<'_>,
) -> Option<AddrInfo> {
    let mut tries = 0;
    loop {
        let collision = if feeler { store.select_tried_collision() } else { None };
        let addr = match collision {
            Some(addr) => addr,
            None => store.select(feeler)?,
        };
        let ip = addr.addr.ip();

        if !feeler && connected_groups.contains(&group(&ip)) {
            trace!(addr = %addr.addr, "Candidate shares a group with an outbound peer");
            return None;
        }
        if !is_valid(&ip) || ctx.local.is_local(&addr.addr) {
            return None;
        }

        tries += 1;
        if tries > MAX_SELECTION_TRIES {
            return None;
        }

        if !ctx.local.is_reachable(&ip) {
            continue;
        }
        if ctx.now - addr.last_try < RECENT_TRY_WINDOW && tries < RECENT_TRY_RELAX_AFTER {
            continue;
        }
        // Feelers only need a peer that keeps an address database.
        if !feeler && !has_all_desirable_service_flags(addr.services, ctx.desirable_services) {
            continue;
        }
        if feeler && !may_have_useful_address_db(addr.services) {
            continue;
        }
        if addr.addr.port() != ctx.default_port && tries < PORT_RELAX_AFTER {
            continue;
        }
        return Some(addr);
    }
}

/// Next event time of a Poisson process with mean interval `average`.
pub fn poisson_next_send(now: Instant, average: Duration) -> Instant {
    let u: f64 = rand::thread_rng().gen();
    let delay = (-u).ln_1p() * -average.as_secs_f64();
    now + Duration::from_secs_f64(delay.max(0.0) + 0.5e-6)
}

/// Random delay before a feeler connects, so probes are not synchronised.
pub fn feeler_delay(window: Duration) -> Duration {
    let millis = window.as_millis() as u64;
    if millis == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NetworkResult;
    use parking_lot::Mutex;
    use std::net::{IpAddr, SocketAddr};

    /// Hands out a fixed list of addresses round-robin.
    struct ScriptedStore {
        addrs: Vec<AddrInfo>,
        next: Mutex<usize>,
        collision: Option<AddrInfo>,
    }

    impl ScriptedStore {
        fn new(addrs: Vec<AddrInfo>) -> Self {
            Self {
                addrs,
                next: Mutex::new(0),
                collision: None,
            }
        }
    }

    impl AddressStore for ScriptedStore {
        fn select(&self, _new_only: bool) -> Option<AddrInfo> {
            if self.addrs.is_empty() {
                return None;
            }
            let mut next = self.next.lock();
            let addr = self.addrs[*next % self.addrs.len()].clone();
            *next += 1;
            Some(addr)
        }
        fn add(&self, _: &[AddrInfo], _: IpAddr, _: i64) -> usize {
            0
        }
        fn good(&self, _: &SocketAddr, _: i64) {}
        fn attempt(&self, _: &SocketAddr, _: bool, _: i64) {}
        fn connected(&self, _: &SocketAddr, _: i64) {}
        fn set_services(&self, _: &SocketAddr, _: ServiceFlags) {}
        fn resolve_collisions(&self) {}
        fn select_tried_collision(&self) -> Option<AddrInfo> {
            self.collision.clone()
        }
        fn size(&self) -> usize {
            self.addrs.len()
        }
        fn get_addr(&self, _: usize, _: usize) -> Vec<AddrInfo> {
            Vec::new()
        }
        fn flush(&self) -> NetworkResult<()> {
            Ok(())
        }
    }

    const NOW: i64 = 1_700_000_000;

    fn info(s: &str, services: ServiceFlags) -> AddrInfo {
        AddrInfo::new(s.parse().unwrap(), services, NOW - 3600)
    }

    fn ctx(local: &LocalAddresses) -> SelectionContext<'_> {
        SelectionContext {
            local,
            default_port: 7890,
            desirable_services: ServiceFlags::NETWORK,
            now: NOW,
        }
    }

    #[test]
    fn test_picks_good_candidate() {
        let local = LocalAddresses::new(true, true, 7890);
        let store = ScriptedStore::new(vec![info("1.2.3.4:7890", ServiceFlags::NETWORK)]);
        let picked = choose_next_candidate(&store, &HashSet::new(), false, &ctx(&local)).unwrap();
        assert_eq!(picked.addr, "1.2.3.4:7890".parse().unwrap());
    }

    #[test]
    fn test_group_conflict_stops_round() {
        let local = LocalAddresses::new(true, true, 7890);
        let store = ScriptedStore::new(vec![info("1.2.3.4:7890", ServiceFlags::NETWORK)]);
        let groups: HashSet<_> = [group(&"1.2.99.99".parse().unwrap())].into_iter().collect();
        assert!(choose_next_candidate(&store, &groups, false, &ctx(&local)).is_none());
        // Feelers ignore groups.
        assert!(choose_next_candidate(&store, &groups, true, &ctx(&local)).is_some());
    }

    #[test]
    fn test_missing_services_skipped_for_regular_only() {
        let local = LocalAddresses::new(true, true, 7890);
        let store = ScriptedStore::new(vec![info("1.2.3.4:7890", ServiceFlags::NETWORK_LIMITED)]);
        assert!(choose_next_candidate(&store, &HashSet::new(), false, &ctx(&local)).is_none());
        assert!(choose_next_candidate(&store, &HashSet::new(), true, &ctx(&local)).is_some());
    }

    #[test]
    fn test_non_default_port_relaxed_after_many_tries() {
        let local = LocalAddresses::new(true, true, 7890);
        let store = ScriptedStore::new(vec![info("1.2.3.4:9999", ServiceFlags::NETWORK)]);
        let picked = choose_next_candidate(&store, &HashSet::new(), false, &ctx(&local)).unwrap();
        assert_eq!(picked.addr.port(), 9999);
        assert_eq!(*store.next.lock(), PORT_RELAX_AFTER);
    }

    #[test]
    fn test_recent_try_relaxed_after_thirty_tries() {
        let local = LocalAddresses::new(true, true, 7890);
        let mut recent = info("1.2.3.4:7890", ServiceFlags::NETWORK);
        recent.last_try = NOW - 60;
        let store = ScriptedStore::new(vec![recent]);
        assert!(choose_next_candidate(&store, &HashSet::new(), false, &ctx(&local)).is_some());
        assert_eq!(*store.next.lock(), RECENT_TRY_RELAX_AFTER);
    }

    #[test]
    fn test_unreachable_gives_up_after_max_tries() {
        let local = LocalAddresses::new(true, true, 7890);
        local.set_reachable(crate::netaddr::Network::Ipv4, false);
        let store = ScriptedStore::new(vec![info("1.2.3.4:7890", ServiceFlags::NETWORK)]);
        assert!(choose_next_candidate(&store, &HashSet::new(), false, &ctx(&local)).is_none());
        assert_eq!(*store.next.lock(), MAX_SELECTION_TRIES + 1);
    }

    #[test]
    fn test_local_address_stops_round() {
        let local = LocalAddresses::new(true, true, 7890);
        local.add_local("1.2.3.4:7890".parse().unwrap(), crate::local::LocalScore::Manual);
        let store = ScriptedStore::new(vec![info("1.2.3.4:7890", ServiceFlags::NETWORK)]);
        assert!(choose_next_candidate(&store, &HashSet::new(), false, &ctx(&local)).is_none());
    }

    #[test]
    fn test_feeler_prefers_collision() {
        let local = LocalAddresses::new(true, true, 7890);
        let mut store = ScriptedStore::new(vec![info("1.2.3.4:7890", ServiceFlags::NETWORK)]);
        store.collision = Some(info("5.6.7.8:7890", ServiceFlags::NETWORK));
        let picked = choose_next_candidate(&store, &HashSet::new(), true, &ctx(&local)).unwrap();
        assert_eq!(picked.addr, "5.6.7.8:7890".parse().unwrap());
    }

    #[test]
    fn test_poisson_is_in_future() {
        let now = Instant::now();
        for _ in 0..100 {
            assert!(poisson_next_send(now, Duration::from_secs(120)) > now);
        }
        assert!(feeler_delay(Duration::from_secs(1)) < Duration::from_secs(1));
        assert_eq!(feeler_delay(Duration::ZERO), Duration::ZERO);
    }
}
