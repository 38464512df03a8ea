use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut as _, Bytes, BytesMut};

use crate::Error;

/// The transport protocol of a flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Proto {
    Tcp,
    Udp,
}

impl Proto {
    fn as_byte(self) -> u8 {
        // IP protocol numbers.
        match self {
            Proto::Tcp => 6,
            Proto::Udp => 17,
        }
    }

    fn from_byte(b: u8) -> Result<Self, Error> {
        match b {
            6 => Ok(Proto::Tcp),
            17 => Ok(Proto::Udp),
            _ => Err(Error::MalformedConnId),
        }
    }
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proto::Tcp => write!(f, "tcp"),
            Proto::Udp => write!(f, "udp"),
        }
    }
}

/// The five-tuple identifying a single flow, as one compact byte sequence.
///
/// Layout: protocol (1 byte), source address, source port (2 bytes BE),
/// destination address, destination port (2 bytes BE). Both addresses are
/// stored in the same family; a v4 address paired with a v6 one is widened,
/// making the total length either 13 (v4+v4) or 37 bytes.
///
/// Cheap to clone and usable as a map key; created at packet-dispatch time.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(Bytes);

impl ConnId {
    pub fn new(proto: Proto, src: SocketAddr, dst: SocketAddr) -> Self {
        Self::from_parts(proto, src.ip(), src.port(), dst.ip(), dst.port())
    }

    pub fn from_parts(proto: Proto, src: IpAddr, sport: u16, dst: IpAddr, dport: u16) -> Self {
        // Never store a v4 address in its v4-in-v6 form.
        let src = src.to_canonical();
        let dst = dst.to_canonical();

        let (src, dst) = match (src, dst) {
            (IpAddr::V4(s), IpAddr::V6(d)) => (IpAddr::V6(s.to_ipv6_mapped()), IpAddr::V6(d)),
            (IpAddr::V6(s), IpAddr::V4(d)) => (IpAddr::V6(s), IpAddr::V6(d.to_ipv6_mapped())),
            (src, dst) => (src, dst),
        };

        let mut buf = BytesMut::with_capacity(37);
        buf.put_u8(proto.as_byte());
        put_addr(&mut buf, src);
        buf.put_u16(sport);
        put_addr(&mut buf, dst);
        buf.put_u16(dport);

        Self(buf.freeze())
    }

    /// Decodes a connection id received on the wire.
    pub fn from_bytes(bytes: Bytes) -> Result<Self, Error> {
        if bytes.len() != 13 && bytes.len() != 37 {
            return Err(Error::MalformedConnId);
        }

        Proto::from_byte(bytes[0])?;

        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }

    pub fn proto(&self) -> Proto {
        #[expect(clippy::unwrap_used, reason = "Validated on construction.")]
        let proto = Proto::from_byte(self.0[0]).unwrap();

        proto
    }

    pub fn source(&self) -> IpAddr {
        self.addr(1)
    }

    pub fn source_port(&self) -> u16 {
        self.port(1 + self.addr_len())
    }

    pub fn destination(&self) -> IpAddr {
        self.addr(1 + self.addr_len() + 2)
    }

    pub fn destination_port(&self) -> u16 {
        self.port(1 + 2 * self.addr_len() + 2)
    }

    pub fn source_addr(&self) -> SocketAddr {
        SocketAddr::new(self.source(), self.source_port())
    }

    pub fn destination_addr(&self) -> SocketAddr {
        SocketAddr::new(self.destination(), self.destination_port())
    }

    /// The id of the reply flow: endpoints and ports swapped.
    pub fn reply(&self) -> ConnId {
        Self::from_parts(
            self.proto(),
            self.destination(),
            self.destination_port(),
            self.source(),
            self.source_port(),
        )
    }

    fn addr_len(&self) -> usize {
        if self.0.len() == 13 { 4 } else { 16 }
    }

    fn addr(&self, offset: usize) -> IpAddr {
        let addr = match self.addr_len() {
            4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&self.0[offset..offset + 4]);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            _ => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&self.0[offset..offset + 16]);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
        };

        // Accessors return the native form, also for widened v4 addresses.
        addr.to_canonical()
    }

    fn port(&self, offset: usize) -> u16 {
        u16::from_be_bytes([self.0[offset], self.0[offset + 1]])
    }
}

fn put_addr(buf: &mut BytesMut, addr: IpAddr) {
    match addr {
        IpAddr::V4(v4) => buf.put_slice(&v4.octets()),
        IpAddr::V6(v6) => buf.put_slice(&v6.octets()),
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{} -> {}:{}",
            self.proto(),
            self.source(),
            self.source_port(),
            self.destination(),
            self.destination_port()
        )
    }
}

impl fmt::Debug for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(proto: Proto, src: &str, dst: &str) -> ConnId {
        ConnId::new(proto, src.parse().unwrap(), dst.parse().unwrap())
    }

    #[test]
    fn round_trips_v4() {
        let id = id(Proto::Tcp, "127.0.0.1:1001", "192.168.0.1:8080");

        assert_eq!(id.as_bytes().len(), 13);
        assert_eq!(id.proto(), Proto::Tcp);
        assert_eq!(id.source_addr(), "127.0.0.1:1001".parse().unwrap());
        assert_eq!(id.destination_addr(), "192.168.0.1:8080".parse().unwrap());

        let decoded = ConnId::from_bytes(id.to_bytes()).unwrap();
        assert_eq!(decoded, id);
    }

    #[test]
    fn round_trips_v6() {
        let id = id(Proto::Udp, "[fd00::1]:53", "[fd00::2]:5353");

        assert_eq!(id.as_bytes().len(), 37);
        assert_eq!(id.source(), "fd00::1".parse::<IpAddr>().unwrap());
        assert_eq!(id.destination_port(), 5353);
    }

    #[test]
    fn widens_mixed_families() {
        let id = id(Proto::Tcp, "10.0.0.1:1", "[fd00::2]:2");

        assert_eq!(id.as_bytes().len(), 37);
        // The widened address still reads back as native v4.
        assert_eq!(id.source(), "10.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn reply_swaps_endpoints() {
        let id = id(Proto::Tcp, "127.0.0.1:1001", "192.168.0.1:8080");
        let reply = id.reply();

        assert_eq!(reply.source_addr(), id.destination_addr());
        assert_eq!(reply.destination_addr(), id.source_addr());
        assert_eq!(reply.reply(), id);
    }

    #[test]
    fn formats_for_logs() {
        let id = id(Proto::Tcp, "127.0.0.1:1001", "192.168.0.1:8080");

        assert_eq!(id.to_string(), "tcp 127.0.0.1:1001 -> 192.168.0.1:8080");
    }

    #[test]
    fn rejects_bad_lengths_and_protocols() {
        assert!(ConnId::from_bytes(Bytes::from_static(&[6; 12])).is_err());
        assert!(ConnId::from_bytes(Bytes::from_static(&[99; 13])).is_err());
        assert!(ConnId::from_bytes(Bytes::new()).is_err());
    }
}
