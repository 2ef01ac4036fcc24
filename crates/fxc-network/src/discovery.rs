//! Peer discovery mechanisms.
//!
//! Per-network parameters, DNS seed resolution and the hard-coded fixed
//! seeds used when DNS seeding yields nothing.

use crate::addrman::AddrInfo;
use crate::netaddr::internal_addr_for_name;
use crate::protocol::ServiceFlags;
use crate::socket::lookup;
use crate::unix_time;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Mainnet DNS seeds.
pub const MAINNET_DNS_SEEDS: &[&str] = &["144.91.120.225"];

/// Testnet DNS seeds.
pub const TESTNET_DNS_SEEDS: &[&str] = &[];

/// Mainnet fixed seeds (fallback if DNS fails).
pub const MAINNET_FIXED_SEEDS: &[&str] = &["164.68.126.156:7890", "144.91.120.225:7890"];

/// Testnet fixed seeds.
pub const TESTNET_FIXED_SEEDS: &[&str] = &["154.251.81.112:17890", "154.240.0.0:17890"];

/// Most addresses taken from a single DNS seed.
pub const MAX_DNS_SEED_RESULTS: usize = 256;

const ONE_DAY: i64 = 24 * 60 * 60;
const ONE_WEEK: i64 = 7 * ONE_DAY;

/// Network type for discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    #[default]
    Mainnet,
    Testnet,
    Regtest,
}

impl NetworkType {
    /// Message start bytes.
    pub fn magic(&self) -> [u8; 4] {
        match self {
            NetworkType::Mainnet => crate::MAINNET_MAGIC,
            NetworkType::Testnet => crate::TESTNET_MAGIC,
            NetworkType::Regtest => crate::REGTEST_MAGIC,
        }
    }

    /// Get DNS seeds for this network.
    pub fn dns_seeds(&self) -> &'static [&'static str] {
        match self {
            NetworkType::Mainnet => MAINNET_DNS_SEEDS,
            NetworkType::Testnet => TESTNET_DNS_SEEDS,
            NetworkType::Regtest => &[],
        }
    }

    /// Get fixed seeds for this network.
    pub fn fixed_seeds(&self) -> &'static [&'static str] {
        match self {
            NetworkType::Mainnet => MAINNET_FIXED_SEEDS,
            NetworkType::Testnet => TESTNET_FIXED_SEEDS,
            NetworkType::Regtest => &[],
        }
    }

    /// Get default port for this network.
    pub fn default_port(&self) -> u16 {
        match self {
            NetworkType::Mainnet => 7890,
            NetworkType::Testnet => 17890,
            NetworkType::Regtest => 18444,
        }
    }

    /// Whether DNS seeding is on unless the operator says otherwise.
    pub fn default_dns_seed(&self) -> bool {
        !matches!(self, NetworkType::Regtest)
    }
}

impl std::str::FromStr for NetworkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" | "main" => Ok(NetworkType::Mainnet),
            "testnet" | "test" => Ok(NetworkType::Testnet),
            "regtest" => Ok(NetworkType::Regtest),
            other => Err(format!("unknown network '{}'", other)),
        }
    }
}

/// What to do with one DNS seed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedOutcome {
    /// Addresses to add to the store, attributed to `source`.
    Resolved { source: IpAddr, addrs: Vec<AddrInfo> },
    /// Seed could not be filtered by service bits (or a name proxy is in
    /// use); connect to it once and ask for addresses instead.
    OneShot(String),
}

/// Peer discovery service.
pub struct PeerDiscovery {
    default_port: u16,
    required_services: ServiceFlags,
    /// DNS resolution timeout.
    dns_timeout: Duration,
}

impl PeerDiscovery {
    /// Create a new peer discovery service.
    pub fn new(default_port: u16, required_services: ServiceFlags) -> Self {
        Self {
            default_port,
            required_services,
            dns_timeout: Duration::from_secs(10),
        }
    }

    /// Set DNS resolution timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.dns_timeout = timeout;
        self
    }

    /// Resolve one DNS seed, asking it for nodes with our service bits.
    pub async fn resolve_seed(&self, seed: &str, name_proxy: bool) -> SeedOutcome {
        if name_proxy {
            return SeedOutcome::OneShot(seed.to_string());
        }
        let host = format!("x{:x}.{}", self.required_services.bits(), seed);
        match lookup(&host, self.default_port, true, MAX_DNS_SEED_RESULTS, self.dns_timeout).await {
            Ok(found) if !found.is_empty() => {
                info!(seed = %seed, count = found.len(), "Resolved DNS seed");
                let now = unix_time();
                let mut rng = rand::thread_rng();
                let addrs = found
                    .into_iter()
                    .map(|addr| {
                        // A random age between three and seven days.
                        let age = 3 * ONE_DAY + rng.gen_range(0..4 * ONE_DAY);
                        AddrInfo::new(
                            SocketAddr::new(addr.ip(), self.default_port),
                            self.required_services,
                            now - age,
                        )
                    })
                    .collect();
                SeedOutcome::Resolved {
                    source: internal_addr_for_name(&host),
                    addrs,
                }
            }
            Ok(_) => SeedOutcome::OneShot(seed.to_string()),
            Err(e) => {
                debug!(seed = %seed, error = %e, "Seed does not filter by service bits");
                SeedOutcome::OneShot(seed.to_string())
            }
        }
    }
}

/// Fixed seeds as store entries, one to two weeks old.
pub fn fixed_seed_addrs(seeds: &[&str], services: ServiceFlags) -> Vec<AddrInfo> {
    let now = unix_time();
    let mut rng = rand::thread_rng();
    seeds
        .iter()
        .filter_map(|s| match s.parse::<SocketAddr>() {
            Ok(addr) => Some(addr),
            Err(_) => {
                warn!(seed = %s, "Invalid fixed seed");
                None
            }
        })
        .map(|addr| AddrInfo::new(addr, services, now - ONE_WEEK - rng.gen_range(0..ONE_WEEK)))
        .collect()
}

/// Source attributed to fixed seeds.
pub fn fixed_seed_source() -> IpAddr {
    internal_addr_for_name("fixedseeds")
}
