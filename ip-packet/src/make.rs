//! Factory module for synthesising packets to inject into the virtual interface.

use crate::{IpPacket, IpPacketBuf};
use anyhow::{Context as _, Result, bail};
use etherparse::PacketBuilder;
use std::net::SocketAddr;

/// Builds a UDP packet from `src` to `dst`.
///
/// Used to write replies for UDP conversations straight to the TUN device,
/// which carries no connection state that would warrant a full socket.
pub fn udp_packet(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Result<IpPacket> {
    let builder = match (src, dst) {
        (SocketAddr::V4(src), SocketAddr::V4(dst)) => {
            PacketBuilder::ipv4(src.ip().octets(), dst.ip().octets(), 64)
                .udp(src.port(), dst.port())
        }
        (SocketAddr::V6(src), SocketAddr::V6(dst)) => {
            PacketBuilder::ipv6(src.ip().octets(), dst.ip().octets(), 64)
                .udp(src.port(), dst.port())
        }
        (SocketAddr::V4(_), SocketAddr::V6(_)) | (SocketAddr::V6(_), SocketAddr::V4(_)) => {
            bail!("IP version mismatch: src={src} dst={dst}")
        }
    };

    let size = builder.size(payload.len());

    let mut ip = IpPacketBuf::new();
    builder
        .write(&mut std::io::Cursor::new(ip.buf()), payload)
        .with_context(|| format!("Payload is too big; size={size}"))?;

    IpPacket::new(ip, size).context("Failed to create IP packet")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv6Addr, SocketAddrV6};

    #[test]
    fn builds_ipv6_udp() {
        let src = SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::LOCALHOST, 1000, 0, 0));
        let dst = SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::LOCALHOST, 2000, 0, 0));

        let packet = udp_packet(src, dst, &[1, 2, 3]).unwrap();

        assert_eq!(packet.as_udp().unwrap().payload(), &[1, 2, 3]);
    }

    #[test]
    fn rejects_mixed_families() {
        let src = "10.0.0.1:1000".parse().unwrap();
        let dst = SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::LOCALHOST, 2000, 0, 0));

        assert!(udp_packet(src, dst, &[]).is_err());
    }
}
