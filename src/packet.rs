// Raw frame parsers shared by the capture path and the tests.
//
// Parses Ethernet + IPv4/IPv6 + TCP/UDP headers from capture buffers. The
// IPv6 parser keeps the fixed header as a structured value because the
// defragmenter rebuilds delivered datagrams from the first-seen header
// template.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::tuple::Transport;

// ---------------------------------------------------------------------------
// Link type
// ---------------------------------------------------------------------------

/// Data link framing of a capture device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// Ethernet (DLT_EN10MB = 1): 14-byte header, EtherType at offset 12.
    Ethernet,
    /// Raw IP (DLT_RAW = 12): no link-layer header, IP starts at offset 0.
    Raw,
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

// Ethernet
const ETH_HLEN: usize = 14;
const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;

// IPv4
const IPV4_MIN_HLEN: usize = 20;
const IPV4_PROTO_OFFSET: usize = 9;
const IPV4_FLAGS_FRAG_OFFSET: usize = 6;
const IPV4_SRC_OFFSET: usize = 12;
const IPV4_DST_OFFSET: usize = 16;

// IPv6
pub const IPV6_HLEN: usize = 40;

// L4 protocol numbers
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

// IPv6 extension header protocol numbers
const EXT_HOP_BY_HOP: u8 = 0;
const EXT_ROUTING: u8 = 43;
pub const EXT_FRAGMENT: u8 = 44;
const EXT_DEST_OPTIONS: u8 = 60;

// UDP header length
const UDP_HLEN: usize = 8;
// TCP minimum header length
const TCP_MIN_HLEN: usize = 20;

/// Length of the IPv6 fragment extension header.
pub const FRAGMENT_HLEN: usize = 8;

// ---------------------------------------------------------------------------
// IPv6 fixed header
// ---------------------------------------------------------------------------

/// Parsed IPv6 fixed header (40 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv6Header {
    pub traffic_class: u8,
    pub flow_label: u32,
    pub payload_length: u16,
    pub next_header: u8,
    pub hop_limit: u8,
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
}

impl Ipv6Header {
    /// Parse the fixed header from the start of an IPv6 packet. Returns the
    /// header and the payload slice (`payload_length` bytes after the fixed
    /// header, shorter if the capture was truncated).
    pub fn parse(data: &[u8]) -> Option<(Ipv6Header, &[u8])> {
        if data.len() < IPV6_HLEN || data[0] >> 4 != 6 {
            return None;
        }
        let traffic_class = (data[0] << 4) | (data[1] >> 4);
        let flow_label =
            ((data[1] as u32 & 0x0F) << 16) | ((data[2] as u32) << 8) | data[3] as u32;
        let payload_length = u16::from_be_bytes([data[4], data[5]]);
        let next_header = data[6];
        let hop_limit = data[7];
        let src: [u8; 16] = data[8..24].try_into().ok()?;
        let dst: [u8; 16] = data[24..40].try_into().ok()?;

        let end = IPV6_HLEN + (payload_length as usize).min(data.len() - IPV6_HLEN);
        Some((
            Ipv6Header {
                traffic_class,
                flow_label,
                payload_length,
                next_header,
                hop_limit,
                src: Ipv6Addr::from(src),
                dst: Ipv6Addr::from(dst),
            },
            &data[IPV6_HLEN..end],
        ))
    }

    /// Serialize back to the 40-byte wire form.
    pub fn to_bytes(&self) -> [u8; IPV6_HLEN] {
        let mut out = [0u8; IPV6_HLEN];
        out[0] = 0x60 | (self.traffic_class >> 4);
        out[1] = (self.traffic_class << 4) | ((self.flow_label >> 16) as u8 & 0x0F);
        out[2] = (self.flow_label >> 8) as u8;
        out[3] = self.flow_label as u8;
        out[4..6].copy_from_slice(&self.payload_length.to_be_bytes());
        out[6] = self.next_header;
        out[7] = self.hop_limit;
        out[8..24].copy_from_slice(&self.src.octets());
        out[24..40].copy_from_slice(&self.dst.octets());
        out
    }
}

// ---------------------------------------------------------------------------
// IPv6 fragment extension header
// ---------------------------------------------------------------------------

/// Parsed IPv6 Fragment extension header (RFC 8200 §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Protocol carried by the reassembled datagram.
    pub next_header: u8,
    /// Fragment offset in bytes (13-bit field scaled by 8).
    pub offset: usize,
    /// M bit: more fragments follow.
    pub more: bool,
    pub identification: u32,
}

impl FragmentHeader {
    pub fn parse(data: &[u8]) -> Option<(FragmentHeader, &[u8])> {
        if data.len() < FRAGMENT_HLEN {
            return None;
        }
        let off_flags = u16::from_be_bytes([data[2], data[3]]);
        Some((
            FragmentHeader {
                next_header: data[0],
                offset: (off_flags & 0xFFF8) as usize,
                more: off_flags & 0x0001 != 0,
                identification: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            },
            &data[FRAGMENT_HLEN..],
        ))
    }
}

// ---------------------------------------------------------------------------
// Network layer dispatch
// ---------------------------------------------------------------------------

/// Network layer of one captured frame.
#[derive(Debug)]
pub enum NetworkSlice<'a> {
    V4 {
        src: Ipv4Addr,
        dst: Ipv4Addr,
        protocol: u8,
        payload: &'a [u8],
    },
    V6 {
        header: Ipv6Header,
        payload: &'a [u8],
    },
}

/// Parse the link + network layers of a captured frame.
///
/// Returns `None` for truncated frames, non-IP EtherTypes, and non-first
/// IPv4 fragments (IPv4 reassembly is not performed).
pub fn parse_frame(data: &[u8], link_type: LinkType) -> Option<NetworkSlice<'_>> {
    let l3 = match link_type {
        LinkType::Ethernet => {
            if data.len() < ETH_HLEN {
                return None;
            }
            let ethertype = u16::from_be_bytes([data[12], data[13]]);
            match ethertype {
                ETHERTYPE_IPV4 | ETHERTYPE_IPV6 => &data[ETH_HLEN..],
                _ => return None,
            }
        }
        LinkType::Raw => data,
    };
    match l3.first()? >> 4 {
        4 => parse_ipv4(l3),
        6 => {
            let (header, payload) = Ipv6Header::parse(l3)?;
            Some(NetworkSlice::V6 { header, payload })
        }
        _ => None,
    }
}

fn parse_ipv4(data: &[u8]) -> Option<NetworkSlice<'_>> {
    if data.len() < IPV4_MIN_HLEN {
        return None;
    }
    let ihl = ((data[0] & 0x0F) as usize) * 4;
    if ihl < IPV4_MIN_HLEN || data.len() < ihl {
        return None;
    }

    // Non-first fragments carry no transport header; skip them.
    let flags_frag = u16::from_be_bytes([
        data[IPV4_FLAGS_FRAG_OFFSET],
        data[IPV4_FLAGS_FRAG_OFFSET + 1],
    ]);
    if flags_frag & 0x1FFF != 0 {
        return None;
    }

    let src = Ipv4Addr::new(
        data[IPV4_SRC_OFFSET],
        data[IPV4_SRC_OFFSET + 1],
        data[IPV4_SRC_OFFSET + 2],
        data[IPV4_SRC_OFFSET + 3],
    );
    let dst = Ipv4Addr::new(
        data[IPV4_DST_OFFSET],
        data[IPV4_DST_OFFSET + 1],
        data[IPV4_DST_OFFSET + 2],
        data[IPV4_DST_OFFSET + 3],
    );

    Some(NetworkSlice::V4 {
        src,
        dst,
        protocol: data[IPV4_PROTO_OFFSET],
        payload: &data[ihl..],
    })
}

/// Skip IPv6 extension headers, returning `(final_next_hdr, offset_into_data)`.
///
/// `next_hdr` is the Next Header value from the fixed IPv6 header (or the
/// fragment header of a reassembled datagram). Recognized extension headers:
/// Hop-by-Hop (0), Routing (43), Destination Options (60). The fragment
/// header is handled by the defragmenter before this runs.
pub fn skip_ipv6_extension_headers(mut next_hdr: u8, data: &[u8]) -> (u8, usize) {
    let mut offset = 0;
    loop {
        match next_hdr {
            EXT_HOP_BY_HOP | EXT_ROUTING | EXT_DEST_OPTIONS => {
                if offset + 2 > data.len() {
                    return (next_hdr, offset);
                }
                let total_len = (data[offset + 1] as usize + 1) * 8;
                if offset + total_len > data.len() {
                    return (next_hdr, offset);
                }
                next_hdr = data[offset];
                offset += total_len;
            }
            _ => return (next_hdr, offset),
        }
    }
}

// ---------------------------------------------------------------------------
// Transport layer
// ---------------------------------------------------------------------------

/// Transport header and payload of one datagram.
#[derive(Debug)]
pub struct TransportSlice<'a> {
    pub transport: Transport,
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

/// Parse a UDP or TCP header. Returns `None` for other protocols and for
/// truncated headers.
pub fn parse_transport(protocol: u8, data: &[u8]) -> Option<TransportSlice<'_>> {
    match protocol {
        PROTO_UDP => {
            if data.len() < UDP_HLEN {
                return None;
            }
            // The UDP length field bounds the payload; short frames are
            // padded at the link layer and the padding is not datagram data.
            let udp_len = u16::from_be_bytes([data[4], data[5]]) as usize;
            let end = udp_len.clamp(UDP_HLEN, data.len());
            Some(TransportSlice {
                transport: Transport::Udp,
                src_port: u16::from_be_bytes([data[0], data[1]]),
                dst_port: u16::from_be_bytes([data[2], data[3]]),
                payload: &data[UDP_HLEN..end],
            })
        }
        PROTO_TCP => {
            if data.len() < TCP_MIN_HLEN {
                return None;
            }
            let data_offset = ((data[12] >> 4) as usize) * 4;
            if data_offset < TCP_MIN_HLEN || data.len() < data_offset {
                return None;
            }
            Some(TransportSlice {
                transport: Transport::Tcp,
                src_port: u16::from_be_bytes([data[0], data[1]]),
                dst_port: u16::from_be_bytes([data[2], data[3]]),
                payload: &data[data_offset..],
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Raw packet builders
    // -----------------------------------------------------------------------

    pub fn ethernet(ethertype: u16, l3: &[u8]) -> Vec<u8> {
        let mut pkt = vec![0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55];
        pkt.extend_from_slice(&ethertype.to_be_bytes());
        pkt.extend_from_slice(l3);
        pkt
    }

    pub fn udp_header(src_port: u16, dst_port: u16, payload_len: usize) -> Vec<u8> {
        let mut l4 = Vec::new();
        l4.extend_from_slice(&src_port.to_be_bytes());
        l4.extend_from_slice(&dst_port.to_be_bytes());
        l4.extend_from_slice(&((UDP_HLEN + payload_len) as u16).to_be_bytes());
        l4.extend_from_slice(&0u16.to_be_bytes()); // checksum
        l4
    }

    pub fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, l4: &[u8]) -> Vec<u8> {
        let mut pkt = Vec::new();
        pkt.push(0x45);
        pkt.push(0x00);
        pkt.extend_from_slice(&((IPV4_MIN_HLEN + l4.len()) as u16).to_be_bytes());
        pkt.extend_from_slice(&0u16.to_be_bytes()); // identification
        pkt.extend_from_slice(&0u16.to_be_bytes()); // flags + frag offset
        pkt.push(64); // TTL
        pkt.push(protocol);
        pkt.extend_from_slice(&0u16.to_be_bytes()); // checksum
        pkt.extend_from_slice(&src.octets());
        pkt.extend_from_slice(&dst.octets());
        pkt.extend_from_slice(l4);
        pkt
    }

    pub fn ipv6_packet(src: Ipv6Addr, dst: Ipv6Addr, next_header: u8, l4: &[u8]) -> Vec<u8> {
        let mut pkt = vec![0x60, 0x00, 0x00, 0x00];
        pkt.extend_from_slice(&(l4.len() as u16).to_be_bytes());
        pkt.push(next_header);
        pkt.push(64);
        pkt.extend_from_slice(&src.octets());
        pkt.extend_from_slice(&dst.octets());
        pkt.extend_from_slice(l4);
        pkt
    }

    fn sample_v6() -> (Ipv6Addr, Ipv6Addr) {
        (
            Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1),
            Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 2),
        )
    }

    // -----------------------------------------------------------------------
    // IPv6 header round-trip
    // -----------------------------------------------------------------------
    #[test]
    fn test_ipv6_header_round_trip() {
        let (src, dst) = sample_v6();
        let pkt = ipv6_packet(src, dst, PROTO_UDP, &[0u8; 12]);
        let (hdr, payload) = Ipv6Header::parse(&pkt).unwrap();
        assert_eq!(hdr.next_header, PROTO_UDP);
        assert_eq!(hdr.payload_length, 12);
        assert_eq!(hdr.src, src);
        assert_eq!(hdr.dst, dst);
        assert_eq!(payload.len(), 12);
        assert_eq!(hdr.to_bytes()[..], pkt[..IPV6_HLEN]);
    }

    #[test]
    fn test_ipv6_header_traffic_class_and_flow_label() {
        let mut pkt = ipv6_packet(sample_v6().0, sample_v6().1, PROTO_UDP, &[]);
        pkt[0] = 0x6A; // traffic class high nibble = 0xA
        pkt[1] = 0xB1; // traffic class low nibble 0xB, flow label high bits 0x1
        pkt[2] = 0x23;
        pkt[3] = 0x45;
        let (hdr, _) = Ipv6Header::parse(&pkt).unwrap();
        assert_eq!(hdr.traffic_class, 0xAB);
        assert_eq!(hdr.flow_label, 0x12345);
        assert_eq!(hdr.to_bytes()[..4], pkt[..4]);
    }

    #[test]
    fn test_ipv6_header_truncated() {
        assert!(Ipv6Header::parse(&[0x60u8; 20]).is_none());
    }

    // -----------------------------------------------------------------------
    // Fragment header
    // -----------------------------------------------------------------------
    #[test]
    fn test_fragment_header_first() {
        // next=UDP, offset 0, M=1, id 0x76143504
        let raw = [0x11, 0x00, 0x00, 0x01, 0x76, 0x14, 0x35, 0x04, 0xAA];
        let (frag, rest) = FragmentHeader::parse(&raw).unwrap();
        assert_eq!(frag.next_header, PROTO_UDP);
        assert_eq!(frag.offset, 0);
        assert!(frag.more);
        assert_eq!(frag.identification, 0x76143504);
        assert_eq!(rest, &[0xAA]);
    }

    #[test]
    fn test_fragment_header_tail() {
        // offset/flags 0x05a8: offset 1448 bytes, M=0
        let raw = [0x11, 0x00, 0x05, 0xa8, 0x76, 0x14, 0x35, 0x04];
        let (frag, _) = FragmentHeader::parse(&raw).unwrap();
        assert_eq!(frag.offset, 1448);
        assert!(!frag.more);
    }

    // -----------------------------------------------------------------------
    // Frame dispatch
    // -----------------------------------------------------------------------
    #[test]
    fn test_parse_frame_ipv4_udp() {
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(8, 8, 8, 8);
        let mut l4 = udp_header(12345, 53, 4);
        l4.extend_from_slice(&[1, 2, 3, 4]);
        let frame = ethernet(ETHERTYPE_IPV4, &ipv4_packet(src, dst, PROTO_UDP, &l4));

        match parse_frame(&frame, LinkType::Ethernet).unwrap() {
            NetworkSlice::V4 {
                src: s,
                dst: d,
                protocol,
                payload,
            } => {
                assert_eq!(s, src);
                assert_eq!(d, dst);
                assert_eq!(protocol, PROTO_UDP);
                let t = parse_transport(protocol, payload).unwrap();
                assert_eq!(t.transport, Transport::Udp);
                assert_eq!(t.src_port, 12345);
                assert_eq!(t.dst_port, 53);
                assert_eq!(t.payload, &[1, 2, 3, 4]);
            }
            other => panic!("expected V4, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_frame_ipv6_udp() {
        let (src, dst) = sample_v6();
        let mut l4 = udp_header(5353, 53, 2);
        l4.extend_from_slice(&[9, 9]);
        let frame = ethernet(ETHERTYPE_IPV6, &ipv6_packet(src, dst, PROTO_UDP, &l4));

        match parse_frame(&frame, LinkType::Ethernet).unwrap() {
            NetworkSlice::V6 { header, payload } => {
                assert_eq!(header.src, src);
                assert_eq!(header.next_header, PROTO_UDP);
                let t = parse_transport(header.next_header, payload).unwrap();
                assert_eq!(t.payload, &[9, 9]);
            }
            other => panic!("expected V6, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_frame_rejects_arp() {
        let frame = ethernet(0x0806, &[0u8; 28]);
        assert!(parse_frame(&frame, LinkType::Ethernet).is_none());
    }

    #[test]
    fn test_parse_frame_skips_non_first_ipv4_fragment() {
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        let mut l3 = ipv4_packet(src, dst, PROTO_UDP, &udp_header(1, 2, 0));
        l3[IPV4_FLAGS_FRAG_OFFSET + 1] = 0xB9; // fragment offset 185
        let frame = ethernet(ETHERTYPE_IPV4, &l3);
        assert!(parse_frame(&frame, LinkType::Ethernet).is_none());
    }

    #[test]
    fn test_parse_frame_raw_link() {
        let src = Ipv4Addr::new(172, 16, 0, 1);
        let dst = Ipv4Addr::new(172, 16, 0, 2);
        let l3 = ipv4_packet(src, dst, PROTO_UDP, &udp_header(1000, 53, 0));
        assert!(parse_frame(&l3, LinkType::Raw).is_some());
    }

    #[test]
    fn test_tcp_transport_honors_data_offset() {
        let mut tcp = Vec::new();
        tcp.extend_from_slice(&4000u16.to_be_bytes());
        tcp.extend_from_slice(&53u16.to_be_bytes());
        tcp.extend_from_slice(&0u32.to_be_bytes()); // seq
        tcp.extend_from_slice(&0u32.to_be_bytes()); // ack
        tcp.push(0x60); // data offset 6 words = 24 bytes
        tcp.push(0x18); // PSH|ACK
        tcp.extend_from_slice(&65535u16.to_be_bytes());
        tcp.extend_from_slice(&0u16.to_be_bytes());
        tcp.extend_from_slice(&0u16.to_be_bytes());
        tcp.extend_from_slice(&[0, 0, 0, 0]); // options
        tcp.extend_from_slice(&[0xDE, 0xAD]); // payload

        let t = parse_transport(PROTO_TCP, &tcp).unwrap();
        assert_eq!(t.transport, Transport::Tcp);
        assert_eq!(t.src_port, 4000);
        assert_eq!(t.payload, &[0xDE, 0xAD]);
    }

    #[test]
    fn test_skip_extension_headers() {
        // Hop-by-Hop (8 bytes) then UDP.
        let mut data = vec![0u8; 8];
        data[0] = PROTO_UDP;
        data[1] = 0;
        data.extend_from_slice(&[0xFF; 4]);
        let (proto, offset) = skip_ipv6_extension_headers(EXT_HOP_BY_HOP, &data);
        assert_eq!(proto, PROTO_UDP);
        assert_eq!(offset, 8);
    }
}
