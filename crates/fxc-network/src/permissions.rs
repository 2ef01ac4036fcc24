//! Per-peer permission flags and whitelist parsing.

use crate::netaddr::{parse_subnet, subnet_contains};
use crate::{NetworkError, NetworkResult};
use bitflags::bitflags;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

bitflags! {
    /// Privileges granted to a peer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct PermissionFlags: u32 {
        /// May use bloom filters even when they are disabled.
        const BLOOMFILTER = 1 << 1;
        /// Transactions are relayed even in blocks-only mode.
        const RELAY = 1 << 3;
        /// Transactions are always relayed. Implies `RELAY`.
        const FORCERELAY = (1 << 2) | Self::RELAY.bits();
        /// Never banned, discouraged or evicted.
        const NOBAN = 1 << 4;
        /// May query the mempool.
        const MEMPOOL = 1 << 5;
        /// May request addresses without hitting the cache.
        const ADDR = 1 << 7;
        /// The operator did not name explicit permissions.
        const IMPLICIT = 1 << 31;

        const ALL = Self::BLOOMFILTER.bits()
            | Self::FORCERELAY.bits()
            | Self::RELAY.bits()
            | Self::NOBAN.bits()
            | Self::MEMPOOL.bits()
            | Self::ADDR.bits();
    }
}

impl PermissionFlags {
    /// Names of the set permissions, for peer stats.
    pub fn to_strings(self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.contains(Self::BLOOMFILTER) {
            out.push("bloomfilter");
        }
        if self.contains(Self::NOBAN) {
            out.push("noban");
        }
        if self.contains(Self::FORCERELAY) {
            out.push("forcerelay");
        }
        if self.contains(Self::RELAY) {
            out.push("relay");
        }
        if self.contains(Self::MEMPOOL) {
            out.push("mempool");
        }
        if self.contains(Self::ADDR) {
            out.push("addr");
        }
        out
    }

    /// Expand implicit whitelisting into concrete permissions.
    ///
    /// Returns true when the peer should be treated as legacy-whitelisted.
    pub fn expand_implicit(&mut self, whitelist_relay: bool, whitelist_force_relay: bool) -> bool {
        if !self.contains(Self::IMPLICIT) {
            return false;
        }
        self.remove(Self::IMPLICIT);
        if whitelist_force_relay {
            self.insert(Self::FORCERELAY);
        }
        if whitelist_relay {
            self.insert(Self::RELAY);
        }
        self.insert(Self::MEMPOOL | Self::NOBAN);
        true
    }
}

/// Split `flags@rest` into parsed flags and `rest`.
///
/// Without an `@`, the whole string is `rest` and the flags are implicit.
fn parse_flags(s: &str) -> NetworkResult<(PermissionFlags, &str)> {
    let Some((names, rest)) = s.split_once('@') else {
        return Ok((PermissionFlags::IMPLICIT, s));
    };
    let mut flags = PermissionFlags::empty();
    for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        flags |= match name {
            "bloomfilter" => PermissionFlags::BLOOMFILTER,
            "noban" => PermissionFlags::NOBAN,
            "forcerelay" => PermissionFlags::FORCERELAY,
            "relay" => PermissionFlags::RELAY,
            "mempool" => PermissionFlags::MEMPOOL,
            "addr" => PermissionFlags::ADDR,
            "all" => PermissionFlags::ALL,
            other => {
                return Err(NetworkError::Config(format!(
                    "Invalid P2P permission: '{}'",
                    other
                )))
            }
        };
    }
    Ok((flags, rest))
}

/// A `flags@subnet` whitelist entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhitelistEntry {
    pub flags: PermissionFlags,
    pub subnet: IpNet,
}

impl WhitelistEntry {
    /// Parse `[flags@]subnet`.
    pub fn parse(s: &str) -> NetworkResult<Self> {
        let (flags, rest) = parse_flags(s)?;
        let subnet = parse_subnet(rest).map_err(|_| {
            NetworkError::Config(format!("Invalid netmask specified in whitelist: '{}'", rest))
        })?;
        Ok(Self { flags, subnet })
    }

    /// Whether the entry covers `ip`.
    pub fn matches(&self, ip: &IpAddr) -> bool {
        subnet_contains(&self.subnet, ip)
    }
}

/// A `flags@addr:port` listening socket with permissions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhitebindEntry {
    pub flags: PermissionFlags,
    pub addr: SocketAddr,
}

impl WhitebindEntry {
    /// Parse `[flags@]addr:port`. The port is mandatory.
    pub fn parse(s: &str) -> NetworkResult<Self> {
        let (flags, rest) = parse_flags(s)?;
        let addr = rest.parse::<SocketAddr>().map_err(|_| {
            NetworkError::Config(format!(
                "Cannot resolve whitebind address '{}' (a port is required)",
                rest
            ))
        })?;
        if addr.port() == 0 {
            return Err(NetworkError::Config(
                "Need to specify a port with whitebind".to_string(),
            ));
        }
        Ok(Self { flags, addr })
    }
}

/// Permissions granted to `ip` by every matching whitelist entry.
pub fn whitelisted_permissions(whitelist: &[WhitelistEntry], ip: &IpAddr) -> PermissionFlags {
    whitelist
        .iter()
        .filter(|entry| entry.matches(ip))
        .fold(PermissionFlags::empty(), |acc, entry| acc | entry.flags)
}
