//! Node configuration.

use crate::Args;
use anyhow::{bail, Context, Result};
use fxc_network::socket::ProxyConfig;
use fxc_network::{ConnectionManagerConfig, EvictionConfig, Network, NetworkType, WhitebindEntry, WhitelistEntry};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Network (mainnet, testnet, regtest).
    pub network: NetworkType,
    /// Data directory.
    pub data_dir: PathBuf,
    /// P2P configuration.
    #[serde(default)]
    pub p2p: P2pConfig,
}

/// P2P configuration as written in the TOML file.
///
/// Unset seed lists fall back to the network defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    /// Accept inbound connections.
    pub listen: bool,
    /// Discover own addresses.
    pub discover: bool,
    /// Include peer addresses in log lines.
    pub log_ips: bool,
    /// Listen addresses.
    pub bind: Vec<SocketAddr>,
    /// `[flags@]addr:port` listeners with permissions.
    pub whitebind: Vec<String>,
    /// `[flags@]subnet` permissions for inbound peers.
    pub whitelist: Vec<String>,
    pub whitelist_relay: bool,
    pub whitelist_force_relay: bool,
    pub port: Option<u16>,
    pub max_connections: usize,
    pub max_outbound: usize,
    /// Outbound upload target in MiB per 24 h; 0 means unlimited.
    pub max_upload_target: u64,
    /// Connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Inactivity timeout in seconds.
    pub peer_timeout_secs: u64,
    pub dns_seed: Option<bool>,
    pub force_dns_seed: bool,
    pub dns_seeds: Option<Vec<String>>,
    pub fixed_seeds: Option<Vec<String>>,
    /// Addresses connected once to fetch addresses.
    pub seed_nodes: Vec<String>,
    /// Connect only to these.
    pub connect: Vec<String>,
    /// Addresses kept connected.
    pub add_nodes: Vec<String>,
    /// Only connect out to these networks (ipv4, ipv6, onion).
    pub only_net: Vec<String>,
    /// SOCKS5 proxy for all outbound connections.
    pub proxy: Option<SocketAddr>,
    /// Separate SOCKS5 proxy for onion peers.
    pub onion_proxy: Option<SocketAddr>,
    /// Fresh proxy credentials per connection.
    pub proxy_randomize: bool,
    /// Resolve names through DNS.
    pub dns: bool,
    pub eviction: EvictionConfig,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            listen: true,
            discover: true,
            log_ips: false,
            bind: Vec::new(),
            whitebind: Vec::new(),
            whitelist: Vec::new(),
            whitelist_relay: true,
            whitelist_force_relay: false,
            port: None,
            max_connections: 125,
            max_outbound: 8,
            max_upload_target: 0,
            connect_timeout_ms: 5000,
            peer_timeout_secs: 20 * 60,
            dns_seed: None,
            force_dns_seed: false,
            dns_seeds: None,
            fixed_seeds: None,
            seed_nodes: Vec::new(),
            connect: Vec::new(),
            add_nodes: Vec::new(),
            only_net: Vec::new(),
            proxy: None,
            onion_proxy: None,
            proxy_randomize: true,
            dns: true,
            eviction: EvictionConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from file and CLI args.
    pub fn load(config_path: &Path, args: &Args) -> Result<Self> {
        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(config_path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")?
        } else {
            Self::default_for_network(args.network)
        };

        // Override with CLI args
        if let Some(ref data_dir) = args.data_dir {
            config.data_dir = data_dir.clone();
        }
        config.network = args.network;
        if let Some(port) = args.port {
            config.p2p.port = Some(port);
        }
        if args.no_listen {
            config.p2p.listen = false;
        }
        config.p2p.connect.extend(args.connect.iter().cloned());
        config.p2p.add_nodes.extend(args.add_node.iter().cloned());

        Ok(config)
    }

    /// Create default config for a network.
    pub fn default_for_network(network: NetworkType) -> Self {
        let data_dir = match network {
            NetworkType::Mainnet => PathBuf::from(".fittexxcoin"),
            NetworkType::Testnet => PathBuf::from(".fittexxcoin/testnet"),
            NetworkType::Regtest => PathBuf::from(".fittexxcoin/regtest"),
        };
        Self {
            network,
            data_dir,
            p2p: P2pConfig::default(),
        }
    }

    /// Save configuration to file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Path of the address store file.
    pub fn peers_path(&self) -> PathBuf {
        self.data_dir.join("peers.json")
    }

    /// Build the connection manager configuration.
    pub fn manager_config(&self) -> Result<ConnectionManagerConfig> {
        let p2p = &self.p2p;
        let network = self.network;

        let white_binds = p2p
            .whitebind
            .iter()
            .map(|s| WhitebindEntry::parse(s))
            .collect::<Result<Vec<_>, _>>()
            .context("Invalid whitebind")?;
        let whitelist = p2p
            .whitelist
            .iter()
            .map(|s| WhitelistEntry::parse(s))
            .collect::<Result<Vec<_>, _>>()
            .context("Invalid whitelist")?;

        let mut only_nets = Vec::new();
        for name in &p2p.only_net {
            match Network::parse(name) {
                Some(net) => only_nets.push(net),
                None => bail!("Unknown network specified in only_net: '{}'", name),
            }
        }

        let mut proxies = HashMap::new();
        let mut name_proxy = None;
        if let Some(addr) = p2p.proxy {
            let proxy = ProxyConfig {
                addr,
                randomize_credentials: p2p.proxy_randomize,
            };
            for net in [Network::Ipv4, Network::Ipv6, Network::Onion] {
                proxies.insert(net, proxy.clone());
            }
            name_proxy = Some(proxy);
        }
        if let Some(addr) = p2p.onion_proxy {
            proxies.insert(
                Network::Onion,
                ProxyConfig {
                    addr,
                    randomize_credentials: p2p.proxy_randomize,
                },
            );
        }

        // Outgoing connections come from the address store unless told
        // exactly where to connect.
        let use_addrman_outgoing = p2p.connect.is_empty();
        let dns_seed = p2p.dns_seed.unwrap_or(network.default_dns_seed() && use_addrman_outgoing);

        let config = ConnectionManagerConfig {
            magic: network.magic(),
            default_port: p2p.port.unwrap_or_else(|| network.default_port()),
            max_connections: p2p.max_connections,
            max_outbound: p2p.max_outbound,
            max_outbound_target: p2p.max_upload_target * 1024 * 1024,
            connect_timeout: Duration::from_millis(p2p.connect_timeout_ms),
            timeout_interval: Duration::from_secs(p2p.peer_timeout_secs),
            listen: p2p.listen,
            discover: p2p.discover,
            log_ips: p2p.log_ips,
            binds: p2p.bind.clone(),
            white_binds,
            whitelist,
            whitelist_relay: p2p.whitelist_relay,
            whitelist_force_relay: p2p.whitelist_force_relay,
            dns_seed,
            force_dns_seed: p2p.force_dns_seed,
            dns_seeds: p2p
                .dns_seeds
                .clone()
                .unwrap_or_else(|| network.dns_seeds().iter().map(|s| s.to_string()).collect()),
            fixed_seeds: p2p
                .fixed_seeds
                .clone()
                .unwrap_or_else(|| network.fixed_seeds().iter().map(|s| s.to_string()).collect()),
            seed_nodes: p2p.seed_nodes.clone(),
            connect: p2p.connect.clone(),
            added_nodes: p2p.add_nodes.clone(),
            use_addrman_outgoing,
            only_nets,
            proxies,
            name_proxy,
            allow_dns: p2p.dns,
            eviction: p2p.eviction,
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }
}
