// DNS exchange identity: the five-tuple extended with the DNS id.
//
// Both the canonical byte form and its reverse are precomputed on
// construction, so a responder-side packet can look up the requester-side
// entry without rebuilding keys.

use std::fmt;
use std::net::IpAddr;

use serde::Serialize;

/// src(16) + src_port(2) + dst(16) + dst_port(2) + id(2) + transport(1)
pub const TUPLE_RAW_SIZE: usize = 16 + 2 + 16 + 2 + 2 + 1;

/// Canonical byte form of a [`DnsTuple`]; the map key for in-flight lookups.
pub type TupleKey = [u8; TUPLE_RAW_SIZE];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Udp,
    Tcp,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
        }
    }

    fn wire_byte(self) -> u8 {
        match self {
            Self::Udp => 0,
            Self::Tcp => 1,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one DNS exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsTuple {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub transport: Transport,
    pub id: u16,

    raw: TupleKey,
    rev_raw: TupleKey,
}

/// 16-byte address form; IPv4 is left-padded to the IPv4-mapped IPv6 form.
fn addr_bytes(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

impl DnsTuple {
    pub fn new(
        src_ip: IpAddr,
        src_port: u16,
        dst_ip: IpAddr,
        dst_port: u16,
        transport: Transport,
        id: u16,
    ) -> Self {
        let raw = Self::compute_raw(src_ip, src_port, dst_ip, dst_port, transport, id);
        let rev_raw = Self::compute_raw(dst_ip, dst_port, src_ip, src_port, transport, id);
        Self {
            src_ip,
            src_port,
            dst_ip,
            dst_port,
            transport,
            id,
            raw,
            rev_raw,
        }
    }

    fn compute_raw(
        src_ip: IpAddr,
        src_port: u16,
        dst_ip: IpAddr,
        dst_port: u16,
        transport: Transport,
        id: u16,
    ) -> TupleKey {
        let mut raw = [0u8; TUPLE_RAW_SIZE];
        raw[0..16].copy_from_slice(&addr_bytes(src_ip));
        raw[16..18].copy_from_slice(&src_port.to_be_bytes());
        raw[18..34].copy_from_slice(&addr_bytes(dst_ip));
        raw[34..36].copy_from_slice(&dst_port.to_be_bytes());
        raw[36..38].copy_from_slice(&id.to_be_bytes());
        raw[38] = transport.wire_byte();
        raw
    }

    /// The tuple with source and destination swapped. The precomputed raw
    /// forms swap along with it.
    pub fn reverse(&self) -> DnsTuple {
        DnsTuple {
            src_ip: self.dst_ip,
            src_port: self.dst_port,
            dst_ip: self.src_ip,
            dst_port: self.src_port,
            transport: self.transport,
            id: self.id,
            raw: self.rev_raw,
            rev_raw: self.raw,
        }
    }

    /// Canonical key: source side first.
    pub fn key(&self) -> TupleKey {
        self.raw
    }

    /// Key with source and destination swapped — what a responder-side
    /// packet uses to find the outstanding request.
    pub fn reverse_key(&self) -> TupleKey {
        self.rev_raw
    }
}

impl fmt::Display for DnsTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "src[{}:{}] dst[{}:{}] transport[{}] id[{}]",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port, self.transport, self.id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn sample() -> DnsTuple {
        DnsTuple::new(
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)),
            54321,
            IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            53,
            Transport::Udp,
            0x1234,
        )
    }

    #[test]
    fn test_canonical_layout() {
        let t = sample();
        let raw = t.key();
        // IPv4-mapped prefix ::ffff:
        assert_eq!(&raw[0..12], &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xFF, 0xFF]);
        assert_eq!(&raw[12..16], &[192, 168, 1, 10]);
        assert_eq!(&raw[16..18], &54321u16.to_be_bytes());
        assert_eq!(&raw[28..30], &[0xFF, 0xFF]);
        assert_eq!(&raw[30..34], &[8, 8, 8, 8]);
        assert_eq!(&raw[34..36], &53u16.to_be_bytes());
        assert_eq!(&raw[36..38], &0x1234u16.to_be_bytes());
        assert_eq!(raw[38], 0);
    }

    #[test]
    fn test_reverse_swaps_keys() {
        let t = sample();
        let r = t.reverse();
        assert_eq!(t.key(), r.reverse_key());
        assert_eq!(t.reverse_key(), r.key());
        assert_eq!(r.src_ip, t.dst_ip);
        assert_eq!(r.src_port, t.dst_port);
        assert_eq!(r.id, t.id);
        // Double reverse is the identity.
        assert_eq!(r.reverse(), t);
    }

    #[test]
    fn test_transport_distinguishes_keys() {
        let udp = sample();
        let tcp = DnsTuple::new(
            udp.src_ip,
            udp.src_port,
            udp.dst_ip,
            udp.dst_port,
            Transport::Tcp,
            udp.id,
        );
        assert_ne!(udp.key(), tcp.key());
    }

    #[test]
    fn test_ipv6_addresses_used_verbatim() {
        let src = Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1);
        let dst = Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 2);
        let t = DnsTuple::new(IpAddr::V6(src), 1024, IpAddr::V6(dst), 53, Transport::Tcp, 7);
        assert_eq!(&t.key()[0..16], &src.octets());
        assert_eq!(&t.key()[18..34], &dst.octets());
        assert_eq!(t.key()[38], 1);
    }

    #[test]
    fn test_display() {
        let t = sample();
        let s = t.to_string();
        assert!(s.contains("src[192.168.1.10:54321]"));
        assert!(s.contains("transport[udp]"));
        assert!(s.contains("id[4660]"));
    }
}
