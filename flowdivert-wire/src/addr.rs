//! Socket address images.
//!
//! Address records carry a BSD `sockaddr` image so the provider can pass
//! them straight to its own socket calls:
//!
//! - IPv4: `len=16, family=2, port (BE), addr[4], zero[8]`
//! - IPv6: `len=28, family=30, port (BE), flowinfo (BE), addr[16], scope_id (BE)`

use crate::error::{Error, Result};
use crate::tlv;
use bytes::BufMut;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

pub const AF_INET: u8 = 2;
pub const AF_INET6: u8 = 30;
pub const SOCKADDR_IN_LEN: usize = 16;
pub const SOCKADDR_IN6_LEN: usize = 28;

/// Encode `addr` as a sockaddr image.
pub fn encode(addr: &SocketAddr) -> Vec<u8> {
    match addr {
        SocketAddr::V4(v4) => {
            let mut out = Vec::with_capacity(SOCKADDR_IN_LEN);
            out.put_u8(SOCKADDR_IN_LEN as u8);
            out.put_u8(AF_INET);
            out.put_u16(v4.port());
            out.put_slice(&v4.ip().octets());
            out.put_bytes(0, 8);
            out
        }
        SocketAddr::V6(v6) => {
            let mut out = Vec::with_capacity(SOCKADDR_IN6_LEN);
            out.put_u8(SOCKADDR_IN6_LEN as u8);
            out.put_u8(AF_INET6);
            out.put_u16(v6.port());
            out.put_u32(v6.flowinfo());
            out.put_slice(&v6.ip().octets());
            out.put_u32(v6.scope_id());
            out
        }
    }
}

/// Decode a sockaddr image.
pub fn decode(raw: &[u8]) -> Result<SocketAddr> {
    match (raw.len(), raw.get(1).copied()) {
        (SOCKADDR_IN_LEN, Some(AF_INET)) => {
            let port = u16::from_be_bytes([raw[2], raw[3]]);
            let ip = Ipv4Addr::new(raw[4], raw[5], raw[6], raw[7]);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        (SOCKADDR_IN6_LEN, Some(AF_INET6)) => {
            let port = u16::from_be_bytes([raw[2], raw[3]]);
            let flowinfo = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&raw[8..24]);
            let scope_id = u32::from_be_bytes([raw[24], raw[25], raw[26], raw[27]]);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(octets),
                port,
                flowinfo,
                scope_id,
            )))
        }
        _ => Err(Error::InvalidAddress),
    }
}

/// Append an address record of type `ty`.
pub fn append<B: BufMut>(buf: &mut B, ty: u8, addr: &SocketAddr) -> Result<()> {
    tlv::append(buf, ty, &encode(addr))
}
