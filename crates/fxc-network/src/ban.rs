//! Banned subnets and discouraged addresses.

use crate::netaddr::{canonical_ip, subnet_contains};
use crate::unix_time;
use dashmap::DashMap;
use ipnet::IpNet;
use serde::Serialize;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info};

/// Default ban length.
pub const DEFAULT_BAN_TIME: Duration = Duration::from_secs(24 * 60 * 60);
/// How long a discouragement lasts.
pub const DISCOURAGE_TIME: Duration = Duration::from_secs(24 * 60 * 60);

/// One ban.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BanEntry {
    /// Unix seconds.
    pub created: i64,
    /// Unix seconds.
    pub ban_until: i64,
}

/// Operator bans by subnet, plus addresses discouraged for misbehaviour.
///
/// A banned address is refused outright; a discouraged one is only refused
/// when inbound slots are nearly full and is the first to go on eviction.
#[derive(Debug, Default)]
pub struct BanList {
    banned: DashMap<IpNet, BanEntry>,
    discouraged: DashMap<IpAddr, i64>,
}

impl BanList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ban `subnet` for `duration` from now.
    pub fn ban(&self, subnet: IpNet, duration: Duration) {
        let now = unix_time();
        let entry = BanEntry {
            created: now,
            ban_until: now + duration.as_secs() as i64,
        };
        self.banned.insert(subnet.trunc(), entry);
        info!(subnet = %subnet, until = entry.ban_until, "Banned subnet");
    }

    /// Lift a ban. Returns false if the subnet was not banned.
    pub fn unban(&self, subnet: &IpNet) -> bool {
        let removed = self.banned.remove(&subnet.trunc()).is_some();
        if removed {
            info!(subnet = %subnet, "Unbanned subnet");
        }
        removed
    }

    /// Whether an unexpired ban covers `ip`.
    pub fn is_banned(&self, ip: &IpAddr) -> bool {
        let ip = canonical_ip(*ip);
        let now = unix_time();
        self.banned
            .iter()
            .any(|entry| entry.value().ban_until > now && subnet_contains(entry.key(), &ip))
    }

    /// Whether an unexpired ban exists for exactly `subnet`.
    pub fn is_subnet_banned(&self, subnet: &IpNet) -> bool {
        let now = unix_time();
        self.banned
            .get(&subnet.trunc())
            .map(|entry| entry.ban_until > now)
            .unwrap_or(false)
    }

    pub fn discourage(&self, ip: IpAddr) {
        let ip = canonical_ip(ip);
        debug!(ip = %ip, "Discouraged address");
        self.discouraged.insert(ip, unix_time() + DISCOURAGE_TIME.as_secs() as i64);
    }

    pub fn is_discouraged(&self, ip: &IpAddr) -> bool {
        let now = unix_time();
        self.discouraged
            .get(&canonical_ip(*ip))
            .map(|until| *until > now)
            .unwrap_or(false)
    }

    /// Drop expired bans and discouragements. Returns how many went.
    pub fn sweep(&self) -> usize {
        let now = unix_time();
        let before = self.banned.len() + self.discouraged.len();
        self.banned.retain(|subnet, entry| {
            let keep = entry.ban_until > now;
            if !keep {
                debug!(subnet = %subnet, "Ban expired");
            }
            keep
        });
        self.discouraged.retain(|_, until| *until > now);
        before.saturating_sub(self.banned.len() + self.discouraged.len())
    }

    /// Current bans.
    pub fn list(&self) -> Vec<(IpNet, BanEntry)> {
        self.banned.iter().map(|e| (*e.key(), *e.value())).collect()
    }

    pub fn clear(&self) {
        self.banned.clear();
        self.discouraged.clear();
        info!("Cleared ban list");
    }
}
