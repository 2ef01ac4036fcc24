//! Wire protocol primitives: message header, checksums, service bits.
//!
//! Every message on the wire is a fixed-size header followed by the payload:
//!
//! ```text
//! +----------+--------------+----------+----------+
//! |  Magic   |   Command    |  Length  | Checksum |
//! | 4 bytes  |   12 bytes   | 4 bytes  | 4 bytes  |
//! +----------+--------------+----------+----------+
//! |                  Payload                      |
//! |               (Length bytes)                  |
//! +-----------------------------------------------+
//! ```
//!
//! - Magic: network identifier
//! - Command: ASCII message type, NUL padded
//! - Length: payload length in bytes (little-endian)
//! - Checksum: first 4 bytes of SHA256(SHA256(payload))

use crate::{NetworkError, NetworkResult};
use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Magic (4) + command (12) + length (4) + checksum (4).
pub const HEADER_SIZE: usize = 24;
/// Width of the NUL padded command field.
pub const COMMAND_SIZE: usize = 12;
/// Width of the checksum field.
pub const CHECKSUM_SIZE: usize = 4;

/// Version used before the handshake negotiated one.
pub const INIT_PROTO_VERSION: i32 = 209;
/// Version we speak.
pub const PROTOCOL_VERSION: i32 = 70016;
/// Peers at or below this version do not answer pings.
pub const BIP0031_VERSION: i32 = 60000;

/// Bucket for received message types we do not know.
pub const NET_MESSAGE_TYPE_OTHER: &str = "*other*";

/// Message type names.
pub mod msg_type {
    pub const VERSION: &str = "version";
    pub const VERACK: &str = "verack";
    pub const ADDR: &str = "addr";
    pub const INV: &str = "inv";
    pub const GETDATA: &str = "getdata";
    pub const GETBLOCKS: &str = "getblocks";
    pub const GETHEADERS: &str = "getheaders";
    pub const TX: &str = "tx";
    pub const HEADERS: &str = "headers";
    pub const BLOCK: &str = "block";
    pub const GETADDR: &str = "getaddr";
    pub const MEMPOOL: &str = "mempool";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const NOTFOUND: &str = "notfound";
    pub const FILTERLOAD: &str = "filterload";
    pub const FILTERADD: &str = "filteradd";
    pub const FILTERCLEAR: &str = "filterclear";
    pub const SENDHEADERS: &str = "sendheaders";
    pub const FEEFILTER: &str = "feefilter";
    pub const SENDCMPCT: &str = "sendcmpct";
    pub const CMPCTBLOCK: &str = "cmpctblock";
    pub const GETBLOCKTXN: &str = "getblocktxn";
    pub const BLOCKTXN: &str = "blocktxn";
    pub const REJECT: &str = "reject";

    /// Every message type tracked individually in byte accounting.
    pub const ALL: &[&str] = &[
        VERSION, VERACK, ADDR, INV, GETDATA, GETBLOCKS, GETHEADERS, TX, HEADERS, BLOCK, GETADDR,
        MEMPOOL, PING, PONG, NOTFOUND, FILTERLOAD, FILTERADD, FILTERCLEAR, SENDHEADERS, FEEFILTER,
        SENDCMPCT, CMPCTBLOCK, GETBLOCKTXN, BLOCKTXN, REJECT,
    ];
}

bitflags! {
    /// Services a node advertises.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ServiceFlags: u64 {
        /// Serves the full block chain.
        const NETWORK = 1 << 0;
        /// Answers getutxo queries.
        const GETUTXO = 1 << 1;
        /// Handles bloom-filtered connections.
        const BLOOM = 1 << 2;
        /// Supports xthin blocks.
        const XTHIN = 1 << 4;
        /// Serves compact block filters.
        const COMPACT_FILTERS = 1 << 6;
        /// Serves only the most recent blocks.
        const NETWORK_LIMITED = 1 << 10;
    }
}

/// Services we require of outbound peers.
pub fn desirable_service_flags() -> ServiceFlags {
    ServiceFlags::NETWORK
}

/// Whether `services` covers everything in `desirable`.
pub fn has_all_desirable_service_flags(services: ServiceFlags, desirable: ServiceFlags) -> bool {
    services.contains(desirable)
}

/// Whether a node with these services is likely to keep an address database.
pub fn may_have_useful_address_db(services: ServiceFlags) -> bool {
    services.intersects(ServiceFlags::NETWORK | ServiceFlags::NETWORK_LIMITED)
}

/// SHA256(SHA256(data)).
pub fn hash256(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

/// First 4 bytes of the double SHA256 of the payload.
pub fn checksum(payload: &[u8]) -> [u8; CHECKSUM_SIZE] {
    let hash = hash256(payload);
    let mut out = [0u8; CHECKSUM_SIZE];
    out.copy_from_slice(&hash[..CHECKSUM_SIZE]);
    out
}

/// Fixed-size message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Network magic.
    pub magic: [u8; 4],
    /// NUL padded command.
    pub command: [u8; COMMAND_SIZE],
    /// Declared payload length.
    pub payload_len: u32,
    /// Payload checksum.
    pub checksum: [u8; CHECKSUM_SIZE],
}

impl MessageHeader {
    /// Build the header for `payload`.
    pub fn new(magic: [u8; 4], msg_type: &str, payload: &[u8]) -> NetworkResult<Self> {
        if msg_type.is_empty() || msg_type.len() > COMMAND_SIZE || !msg_type.is_ascii() {
            return Err(NetworkError::InvalidMessage(format!(
                "Invalid message type: {:?}",
                msg_type
            )));
        }
        let payload_len = u32::try_from(payload.len()).map_err(|_| NetworkError::MessageTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        })?;
        let mut command = [0u8; COMMAND_SIZE];
        command[..msg_type.len()].copy_from_slice(msg_type.as_bytes());
        Ok(Self {
            magic,
            command,
            payload_len,
            checksum: checksum(payload),
        })
    }

    /// Message type with NUL padding stripped.
    ///
    /// Returns `None` unless the command is printable ASCII followed only by NULs.
    pub fn msg_type(&self) -> Option<&str> {
        let end = self
            .command
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(COMMAND_SIZE);
        if end == 0 {
            return None;
        }
        if self.command[end..].iter().any(|&b| b != 0) {
            return None;
        }
        if !self.command[..end].iter().all(|&b| (b' '..=b'~').contains(&b)) {
            return None;
        }
        std::str::from_utf8(&self.command[..end]).ok()
    }

    /// Write the header to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_slice(&self.magic);
        dst.put_slice(&self.command);
        dst.put_u32_le(self.payload_len);
        dst.put_slice(&self.checksum);
    }

    /// Parse a complete header.
    ///
    /// Rejects a magic other than `expected_magic` and malformed commands.
    pub fn decode(mut src: &[u8], expected_magic: [u8; 4]) -> NetworkResult<Self> {
        if src.len() < HEADER_SIZE {
            return Err(NetworkError::InvalidMessage("Header truncated".to_string()));
        }
        let mut magic = [0u8; 4];
        src.copy_to_slice(&mut magic);
        if magic != expected_magic {
            return Err(NetworkError::InvalidMessage(format!(
                "Invalid magic: expected {}, got {}",
                hex::encode(expected_magic),
                hex::encode(magic)
            )));
        }
        let mut command = [0u8; COMMAND_SIZE];
        src.copy_to_slice(&mut command);
        let payload_len = src.get_u32_le();
        let mut checksum = [0u8; CHECKSUM_SIZE];
        src.copy_to_slice(&mut checksum);

        let header = Self {
            magic,
            command,
            payload_len,
            checksum,
        };
        if header.msg_type().is_none() {
            return Err(NetworkError::InvalidMessage(format!(
                "Malformed command: {}",
                hex::encode(command)
            )));
        }
        Ok(header)
    }
}

/// Header plus payload, ready to be queued for sending.
pub fn serialize_message(magic: [u8; 4], msg_type: &str, payload: &[u8]) -> NetworkResult<BytesMut> {
    let header = MessageHeader::new(magic, msg_type, payload)?;
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    header.encode(&mut buf);
    buf.put_slice(payload);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: [u8; 4] = [0xf9, 0xbe, 0xb4, 0xd9];

    #[test]
    fn test_checksum_of_empty_payload() {
        // Well-known double SHA256 of the empty string.
        assert_eq!(checksum(&[]), [0x5d, 0xf6, 0xe0, 0xe2]);
    }

    #[test]
    fn test_header_layout() {
        let header = MessageHeader::new(MAGIC, msg_type::PING, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        assert_eq!(buf.len(), HEADER_SIZE);
        assert_eq!(&buf[0..4], &MAGIC);
        assert_eq!(&buf[4..8], b"ping");
        assert!(buf[8..16].iter().all(|&b| b == 0));
        assert_eq!(&buf[16..20], &8u32.to_le_bytes());

        let decoded = MessageHeader::decode(&buf, MAGIC).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.msg_type(), Some("ping"));
    }

    #[test]
    fn test_wrong_magic_rejected() {
        let header = MessageHeader::new(MAGIC, msg_type::VERACK, &[]).unwrap();
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert!(MessageHeader::decode(&buf, [0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_malformed_command_rejected() {
        let mut header = MessageHeader::new(MAGIC, msg_type::VERACK, &[]).unwrap();
        // Non-NUL byte after the terminator.
        header.command[10] = b'x';
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert!(MessageHeader::decode(&buf, MAGIC).is_err());
    }

    #[test]
    fn test_command_too_long() {
        assert!(MessageHeader::new(MAGIC, "thirteenchars", &[]).is_err());
        assert!(MessageHeader::new(MAGIC, "", &[]).is_err());
    }

    #[test]
    fn test_service_flag_helpers() {
        let full = ServiceFlags::NETWORK | ServiceFlags::BLOOM;
        assert!(has_all_desirable_service_flags(full, desirable_service_flags()));
        assert!(!has_all_desirable_service_flags(
            ServiceFlags::NETWORK_LIMITED,
            desirable_service_flags()
        ));
        assert!(may_have_useful_address_db(ServiceFlags::NETWORK_LIMITED));
        assert!(!may_have_useful_address_db(ServiceFlags::BLOOM));
    }
}
