#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod make;

use anyhow::{Context as _, Result};
use etherparse::{IpNumber, IpSlice, TcpSlice, UdpSlice};
use std::net::IpAddr;

/// The maximum size of an IP packet we can handle.
///
/// Matches the default MTU of the virtual interface.
pub const MAX_IP_SIZE: usize = 1500;

/// A buffer for reading a new [`IpPacket`] from the virtual interface.
pub struct IpPacketBuf {
    inner: Vec<u8>,
}

impl Default for IpPacketBuf {
    fn default() -> Self {
        Self {
            inner: vec![0u8; MAX_IP_SIZE],
        }
    }
}

impl IpPacketBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buf(&mut self) -> &mut [u8] {
        &mut self.inner
    }
}

/// A validated IPv4 or IPv6 packet.
#[derive(Clone, PartialEq, Eq)]
pub struct IpPacket {
    buf: Vec<u8>,
    len: usize,
    version: IpVersion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

/// Fragmented IP packets are not supported by the userspace stack.
#[derive(thiserror::Error, Debug)]
#[error("IP packet is fragmented")]
pub struct Fragmented;

impl IpPacket {
    pub fn new(buf: IpPacketBuf, len: usize) -> Result<Self> {
        anyhow::ensure!(len <= MAX_IP_SIZE, "Packet too large (len: {len})");
        anyhow::ensure!(len <= buf.inner.len(), "Length exceeds buffer size");

        let ip = IpSlice::from_slice(&buf.inner[..len]).context("Failed to parse IP packet")?;

        anyhow::ensure!(!ip.is_fragmenting_payload(), Fragmented);

        let version = match ip {
            IpSlice::Ipv4(_) => IpVersion::V4,
            IpSlice::Ipv6(_) => IpVersion::V6,
        };

        Ok(Self {
            buf: buf.inner,
            len,
            version,
        })
    }

    /// The serialised bytes of this packet, including the IP header.
    pub fn packet(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn version(&self) -> IpVersion {
        self.version
    }

    pub fn source(&self) -> IpAddr {
        self.slice().source_addr()
    }

    pub fn destination(&self) -> IpAddr {
        self.slice().destination_addr()
    }

    pub fn as_tcp(&self) -> Option<TcpSlice<'_>> {
        let payload = self.slice().payload().clone();

        if payload.ip_number != IpNumber::TCP {
            return None;
        }

        TcpSlice::from_slice(payload.payload).ok()
    }

    pub fn as_udp(&self) -> Option<UdpSlice<'_>> {
        let payload = self.slice().payload().clone();

        if payload.ip_number != IpNumber::UDP {
            return None;
        }

        UdpSlice::from_slice(payload.payload).ok()
    }

    fn slice(&self) -> IpSlice<'_> {
        #[expect(clippy::unwrap_used, reason = "Validated in the constructor.")]
        let slice = IpSlice::from_slice(self.packet()).unwrap();

        slice
    }
}

impl std::fmt::Debug for IpPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut dbg = f.debug_struct("IpPacket");

        dbg.field("src", &self.source()).field("dst", &self.destination());

        if let Some(tcp) = self.as_tcp() {
            dbg.field("proto", &"tcp")
                .field("src_port", &tcp.source_port())
                .field("dst_port", &tcp.destination_port())
                .field("len", &tcp.payload().len());

            if tcp.syn() {
                dbg.field("syn", &true);
            }

            if tcp.rst() {
                dbg.field("rst", &true);
            }

            if tcp.fin() {
                dbg.field("fin", &true);
            }
        }

        if let Some(udp) = self.as_udp() {
            dbg.field("proto", &"udp")
                .field("src_port", &udp.source_port())
                .field("dst_port", &udp.destination_port())
                .field("len", &udp.payload().len());
        }

        dbg.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

    #[test]
    fn rejects_garbage() {
        let mut buf = IpPacketBuf::new();
        buf.buf()[0] = 0xab;

        assert!(IpPacket::new(buf, 20).is_err());
    }

    #[test]
    fn parses_udp_packet() {
        let src = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 5353));
        let dst = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 53));

        let packet = make::udp_packet(src, dst, b"hello").unwrap();

        assert_eq!(packet.version(), IpVersion::V4);
        assert_eq!(packet.source(), src.ip());
        assert_eq!(packet.destination(), dst.ip());

        let udp = packet.as_udp().unwrap();
        assert_eq!(udp.source_port(), 5353);
        assert_eq!(udp.destination_port(), 53);
        assert_eq!(udp.payload(), b"hello");
    }
}
