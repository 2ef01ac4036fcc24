//! Connection manager configuration.

use crate::eviction::EvictionConfig;
use crate::netaddr::Network;
use crate::permissions::{WhitebindEntry, WhitelistEntry};
use crate::protocol::{desirable_service_flags, ServiceFlags};
use crate::socket::ProxyConfig;
use crate::{NetworkError, NetworkResult, DEFAULT_PORT, MAINNET_MAGIC};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Every policy knob of the connection manager.
#[derive(Debug, Clone)]
pub struct ConnectionManagerConfig {
    /// Network magic.
    pub magic: [u8; 4],
    pub default_port: u16,
    /// Services we advertise.
    pub local_services: ServiceFlags,
    /// Services regular outbound peers must have.
    pub desirable_services: ServiceFlags,

    /// Total connection ceiling.
    pub max_connections: usize,
    /// Automatic outbound connections.
    pub max_outbound: usize,
    /// Concurrent feelers.
    pub max_feeler: usize,
    /// Concurrent add-node connections.
    pub max_addnode: usize,

    /// Receive backlog at which reading pauses.
    pub receive_flood_size: usize,
    /// Send backlog at which the peer counts as send-paused.
    pub send_buffer_max_size: usize,
    /// Largest payload accepted.
    pub max_message_size: usize,
    /// Most bytes read from one socket per poll.
    pub recv_chunk_size: usize,

    /// No traffic or handshake within this window disconnects.
    pub peer_connect_timeout: Duration,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Send/receive/ping inactivity limit.
    pub timeout_interval: Duration,
    /// Receive inactivity limit for peers older than BIP31.
    pub old_version_recv_timeout: Duration,
    /// Mean time between feelers.
    pub feeler_interval: Duration,
    /// Upper bound on the random delay before a feeler.
    pub feeler_sleep_window: Duration,
    /// Poll wait.
    pub select_timeout: Duration,
    /// Longest dispatch sleep.
    pub message_handler_max_sleep: Duration,
    pub dns_timeout: Duration,

    /// Bytes per cycle, 0 = unlimited.
    pub max_outbound_target: u64,
    pub max_outbound_timeframe: Duration,

    pub listen: bool,
    /// Discover and advertise our own addresses.
    pub discover: bool,
    /// Include remote addresses in per-peer log lines.
    pub log_ips: bool,
    pub binds: Vec<SocketAddr>,
    pub white_binds: Vec<WhitebindEntry>,
    pub whitelist: Vec<WhitelistEntry>,
    /// Implicit whitelisting grants relay.
    pub whitelist_relay: bool,
    /// Implicit whitelisting grants forced relay.
    pub whitelist_force_relay: bool,

    pub dns_seed: bool,
    pub force_dns_seed: bool,
    pub dns_seeds: Vec<String>,
    pub fixed_seeds: Vec<String>,
    /// One-shot addresses.
    pub seed_nodes: Vec<String>,
    /// Only connect to these.
    pub connect: Vec<String>,
    pub added_nodes: Vec<String>,
    /// Run the address-store driven outbound loop.
    pub use_addrman_outgoing: bool,
    /// Only make outbound connections to these networks; empty means all.
    pub only_nets: Vec<Network>,

    pub proxies: HashMap<Network, ProxyConfig>,
    /// Proxy used for name-based connections.
    pub name_proxy: Option<ProxyConfig>,
    /// Resolve names through DNS.
    pub allow_dns: bool,

    pub eviction: EvictionConfig,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self {
            magic: MAINNET_MAGIC,
            default_port: DEFAULT_PORT,
            local_services: ServiceFlags::NETWORK,
            desirable_services: desirable_service_flags(),
            max_connections: 125,
            max_outbound: 8,
            max_feeler: 1,
            max_addnode: 8,
            receive_flood_size: 5_000_000,
            send_buffer_max_size: 1_000_000,
            max_message_size: 64 * 1024 * 1024,
            recv_chunk_size: 64 * 1024,
            peer_connect_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
            timeout_interval: Duration::from_secs(20 * 60),
            old_version_recv_timeout: Duration::from_secs(90 * 60),
            feeler_interval: Duration::from_secs(120),
            feeler_sleep_window: Duration::from_secs(1),
            select_timeout: Duration::from_millis(50),
            message_handler_max_sleep: Duration::from_millis(100),
            dns_timeout: Duration::from_secs(10),
            max_outbound_target: 0,
            max_outbound_timeframe: Duration::from_secs(24 * 60 * 60),
            listen: true,
            discover: true,
            log_ips: false,
            binds: Vec::new(),
            white_binds: Vec::new(),
            whitelist: Vec::new(),
            whitelist_relay: true,
            whitelist_force_relay: false,
            dns_seed: true,
            force_dns_seed: false,
            dns_seeds: Vec::new(),
            fixed_seeds: Vec::new(),
            seed_nodes: Vec::new(),
            connect: Vec::new(),
            added_nodes: Vec::new(),
            use_addrman_outgoing: true,
            only_nets: Vec::new(),
            proxies: HashMap::new(),
            name_proxy: None,
            allow_dns: true,
            eviction: EvictionConfig::default(),
        }
    }
}

impl ConnectionManagerConfig {
    /// Reject contradictory settings.
    pub fn validate(&self) -> NetworkResult<()> {
        if !self.connect.is_empty() && self.use_addrman_outgoing {
            return Err(NetworkError::Config(
                "Cannot use address-store outgoing connections together with specified connect addresses".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(NetworkError::Config("max_connections must be positive".into()));
        }
        if self.recv_chunk_size == 0 {
            return Err(NetworkError::Config("recv_chunk_size must be positive".into()));
        }
        if self.max_message_size > u32::MAX as usize {
            return Err(NetworkError::Config(format!(
                "max_message_size {} does not fit the header length field",
                self.max_message_size
            )));
        }
        Ok(())
    }

    /// Automatic outbound slots, capped by the connection ceiling.
    pub fn effective_max_outbound(&self) -> usize {
        self.max_outbound.min(self.max_connections)
    }

    /// Inbound slots left after outbound and feeler connections.
    pub fn max_inbound(&self) -> usize {
        self.max_connections
            .saturating_sub(self.effective_max_outbound() + self.max_feeler)
    }

    /// Log remote addresses only when asked to.
    pub fn display_addr(&self, addr: &SocketAddr) -> String {
        if self.log_ips {
            addr.to_string()
        } else {
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConnectionManagerConfig::default();
        assert_eq!(config.max_connections, 125);
        assert_eq!(config.max_outbound, 8);
        assert_eq!(config.max_inbound(), 116);
        assert_eq!(config.eviction, EvictionConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn test_connect_conflicts_with_addrman() {
        let config = ConnectionManagerConfig {
            connect: vec!["1.2.3.4".into()],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(NetworkError::Config(_))));

        let config = ConnectionManagerConfig {
            use_addrman_outgoing: false,
            ..config
        };
        config.validate().unwrap();
    }

    #[test]
    fn test_small_connection_ceiling() {
        let config = ConnectionManagerConfig {
            max_connections: 4,
            ..Default::default()
        };
        assert_eq!(config.effective_max_outbound(), 4);
        assert_eq!(config.max_inbound(), 0);
    }
}
