//! # fxc-network
//!
//! P2P connection management for the Fittexxcoin full node.
//!
//! This crate provides:
//! - Wire message framing and the per-connection state behind it
//! - The connection manager: socket loop, outbound selection, dispatch
//! - Inbound eviction and outbound peer selection policies
//! - Address store, ban list, local addresses and bandwidth accounting
//!
//! Message content is out of scope; it is handled by a
//! [`MessageProcessor`] the manager calls into.

pub mod addrman;
pub mod ban;
pub mod bandwidth;
pub mod codec;
mod config;
pub mod discovery;
mod error;
pub mod eviction;
pub mod local;
mod manager;
pub mod netaddr;
pub mod outbound;
pub mod peer;
pub mod permissions;
mod processor;
pub mod protocol;
pub mod socket;

pub use addrman::{AddrInfo, AddressStore, MemoryAddressStore};
pub use ban::BanList;
pub use bandwidth::{Bandwidth, BandwidthStats};
pub use codec::{MessageFramer, ReceivedMessage};
pub use config::ConnectionManagerConfig;
pub use discovery::{NetworkType, PeerDiscovery, SeedOutcome};
pub use error::{NetworkError, NetworkResult};
pub use eviction::{select_victim, EvictionCandidate, EvictionConfig};
pub use local::{LocalAddresses, LocalScore};
pub use manager::{AddedNodeInfo, ConnectionDirection, ConnectionManager};
pub use netaddr::Network;
pub use peer::{ConnectionKind, NodeId, PeerConnection, PeerRef, PeerStats};
pub use permissions::{PermissionFlags, WhitebindEntry, WhitelistEntry};
pub use processor::MessageProcessor;
pub use protocol::{msg_type, MessageHeader, ServiceFlags, PROTOCOL_VERSION};

/// Default P2P port.
pub const DEFAULT_PORT: u16 = 7890;

/// Message start bytes for mainnet.
pub const MAINNET_MAGIC: [u8; 4] = [0x8e, 0x97, 0x95, 0xdc];

/// Message start bytes for testnet.
pub const TESTNET_MAGIC: [u8; 4] = [0xf4, 0xe5, 0xf3, 0xf4];

/// Message start bytes for regtest.
pub const REGTEST_MAGIC: [u8; 4] = [0xda, 0xb5, 0xbf, 0xfa];

/// Current unix time in seconds.
pub fn unix_time() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Current unix time in microseconds.
pub fn unix_time_micros() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}
