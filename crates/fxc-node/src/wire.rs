//! Payloads of the handful of messages the node speaks.
//!
//! Integers are little-endian except ports, which are big-endian. Addresses
//! travel as 16-byte IPv6, with IPv4 mapped.

use anyhow::{bail, ensure, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use fxc_network::{AddrInfo, ServiceFlags};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

/// Most addresses in one `addr` message.
pub const MAX_ADDR_TO_SEND: usize = 1000;
/// Longest user agent accepted.
pub const MAX_SUBVERSION_LENGTH: usize = 256;

/// The `version` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: ServiceFlags,
    pub timestamp: i64,
    pub addr_recv: SocketAddr,
    pub addr_from: SocketAddr,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

impl VersionMessage {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_i32_le(self.version);
        buf.put_u64_le(self.services.bits());
        buf.put_i64_le(self.timestamp);
        put_net_addr(&mut buf, ServiceFlags::empty(), &self.addr_recv);
        put_net_addr(&mut buf, self.services, &self.addr_from);
        buf.put_u64_le(self.nonce);
        put_var_int(&mut buf, self.user_agent.len() as u64);
        buf.put_slice(self.user_agent.as_bytes());
        buf.put_i32_le(self.start_height);
        buf.put_u8(self.relay as u8);
        buf.freeze()
    }

    /// Decode, tolerating the optional trailing fields of old peers.
    pub fn decode(mut src: &[u8]) -> Result<Self> {
        ensure!(src.remaining() >= 20 + 26, "version message too short");
        let version = src.get_i32_le();
        let services = ServiceFlags::from_bits_retain(src.get_u64_le());
        let timestamp = src.get_i64_le();
        let (_, addr_recv) = get_net_addr(&mut src)?;

        let mut msg = Self {
            version,
            services,
            timestamp,
            addr_recv,
            addr_from: SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
            nonce: 0,
            user_agent: String::new(),
            start_height: 0,
            relay: true,
        };
        if src.remaining() >= 26 + 8 {
            msg.addr_from = get_net_addr(&mut src)?.1;
            msg.nonce = src.get_u64_le();
        }
        if src.has_remaining() {
            let len = get_var_int(&mut src)? as usize;
            ensure!(len <= MAX_SUBVERSION_LENGTH, "user agent too long: {}", len);
            ensure!(src.remaining() >= len, "truncated user agent");
            msg.user_agent = String::from_utf8_lossy(&src[..len]).into_owned();
            src.advance(len);
        }
        if src.remaining() >= 4 {
            msg.start_height = src.get_i32_le();
        }
        if src.has_remaining() {
            msg.relay = src.get_u8() != 0;
        }
        Ok(msg)
    }
}

/// Payload of `ping` and `pong`.
pub fn encode_nonce(nonce: u64) -> Bytes {
    Bytes::copy_from_slice(&nonce.to_le_bytes())
}

pub fn decode_nonce(mut src: &[u8]) -> Result<u64> {
    ensure!(src.remaining() >= 8, "nonce too short");
    Ok(src.get_u64_le())
}

/// Payload of `addr`.
pub fn encode_addr(addrs: &[AddrInfo]) -> Bytes {
    let mut buf = BytesMut::with_capacity(9 + addrs.len() * 30);
    put_var_int(&mut buf, addrs.len() as u64);
    for info in addrs {
        buf.put_u32_le(info.time.clamp(0, u32::MAX as i64) as u32);
        put_net_addr(&mut buf, info.services, &info.addr);
    }
    buf.freeze()
}

pub fn decode_addr(mut src: &[u8]) -> Result<Vec<AddrInfo>> {
    let count = get_var_int(&mut src)? as usize;
    if count > MAX_ADDR_TO_SEND {
        bail!("addr message size = {}", count);
    }
    let mut addrs = Vec::with_capacity(count);
    for _ in 0..count {
        ensure!(src.remaining() >= 30, "truncated addr entry");
        let time = src.get_u32_le() as i64;
        let (services, addr) = get_net_addr(&mut src)?;
        addrs.push(AddrInfo::new(addr, services, time));
    }
    Ok(addrs)
}

fn put_net_addr(buf: &mut BytesMut, services: ServiceFlags, addr: &SocketAddr) {
    buf.put_u64_le(services.bits());
    let ip = match addr.ip() {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    };
    buf.put_slice(&ip.octets());
    buf.put_u16(addr.port());
}

fn get_net_addr(src: &mut &[u8]) -> Result<(ServiceFlags, SocketAddr)> {
    ensure!(src.remaining() >= 26, "truncated network address");
    let services = ServiceFlags::from_bits_retain(src.get_u64_le());
    let mut octets = [0u8; 16];
    src.copy_to_slice(&mut octets);
    let port = src.get_u16();
    let ip = Ipv6Addr::from(octets);
    let ip = match ip.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(ip),
    };
    Ok((services, SocketAddr::new(ip, port)))
}

fn put_var_int(buf: &mut BytesMut, n: u64) {
    match n {
        0..=0xfc => buf.put_u8(n as u8),
        0xfd..=0xffff => {
            buf.put_u8(0xfd);
            buf.put_u16_le(n as u16);
        }
        0x1_0000..=0xffff_ffff => {
            buf.put_u8(0xfe);
            buf.put_u32_le(n as u32);
        }
        _ => {
            buf.put_u8(0xff);
            buf.put_u64_le(n);
        }
    }
}

fn get_var_int(src: &mut &[u8]) -> Result<u64> {
    ensure!(src.has_remaining(), "missing compact size");
    let n = match src.get_u8() {
        0xfd => {
            ensure!(src.remaining() >= 2, "truncated compact size");
            src.get_u16_le() as u64
        }
        0xfe => {
            ensure!(src.remaining() >= 4, "truncated compact size");
            src.get_u32_le() as u64
        }
        0xff => {
            ensure!(src.remaining() >= 8, "truncated compact size");
            src.get_u64_le()
        }
        n => n as u64,
    };
    Ok(n)
}
