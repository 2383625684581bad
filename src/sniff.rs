// Per-frame ingest: link/network parsing, fragment hand-off, DNS decode,
// and routing into the correlator.
//
// Reassembly and parse failures end processing for that frame and move a
// counter; nothing propagates past this layer.

use std::collections::HashSet;
use std::net::IpAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::SystemTime;

use hickory_proto::op::{Message, MessageType};

use crate::correlator::{Correlator, ObservedMessage};
use crate::defrag::{Defragmenter, Reassembly};
use crate::error::WatchError;
use crate::packet::{self, LinkType, NetworkSlice, TransportSlice};
use crate::stats::StatsAggregator;
use crate::tuple::{DnsTuple, Transport};

/// Fixed DNS header length; anything not longer than this is not a message.
pub const DNS_HEADER_SIZE: usize = 12;

/// Bytes to skip over the length prefix when decoding DNS over TCP.
pub const TCP_DECODE_OFFSET: usize = 2;

/// Frame-to-correlator pipeline shared by the worker threads.
pub struct PacketIngest {
    defrag: Defragmenter,
    correlator: Arc<Correlator>,
    stats: Arc<StatsAggregator>,
    ports: HashSet<u16>,
}

impl PacketIngest {
    pub fn new(
        ports: impl IntoIterator<Item = u16>,
        correlator: Arc<Correlator>,
        stats: Arc<StatsAggregator>,
    ) -> Self {
        Self {
            defrag: Defragmenter::new(),
            correlator,
            stats,
            ports: ports.into_iter().collect(),
        }
    }

    /// Process one captured frame.
    pub fn handle_frame(&self, frame: &[u8], link_type: LinkType, ts: SystemTime) {
        match packet::parse_frame(frame, link_type) {
            Some(NetworkSlice::V4 {
                src,
                dst,
                protocol,
                payload,
            }) => {
                self.handle_transport(IpAddr::V4(src), IpAddr::V4(dst), protocol, payload, ts);
            }
            Some(NetworkSlice::V6 { header, payload }) => {
                // Fragments detour through the reassembler; processing
                // continues only when a datagram comes back whole.
                let (next_header, payload) = if header.next_header == packet::EXT_FRAGMENT {
                    match self.defrag.defragment(&header, payload, ts) {
                        Ok(Reassembly::Delivered(rebuilt, bytes)) => {
                            let src = IpAddr::V6(rebuilt.src);
                            let dst = IpAddr::V6(rebuilt.dst);
                            let (proto, offset) =
                                packet::skip_ipv6_extension_headers(rebuilt.next_header, &bytes);
                            self.handle_transport(src, dst, proto, &bytes[offset..], ts);
                            return;
                        }
                        Ok(Reassembly::Buffered) | Ok(Reassembly::Passthrough) => return,
                        Err(e) => {
                            log::debug!("fragment dropped: {e}");
                            return;
                        }
                    }
                } else {
                    let (proto, offset) =
                        packet::skip_ipv6_extension_headers(header.next_header, payload);
                    (proto, &payload[offset..])
                };
                self.handle_transport(
                    IpAddr::V6(header.src),
                    IpAddr::V6(header.dst),
                    next_header,
                    payload,
                    ts,
                );
            }
            None => {}
        }
    }

    fn handle_transport(
        &self,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        protocol: u8,
        data: &[u8],
        ts: SystemTime,
    ) {
        let Some(TransportSlice {
            transport,
            src_port,
            dst_port,
            payload,
        }) = packet::parse_transport(protocol, data)
        else {
            return;
        };
        if !self.ports.contains(&src_port) && !self.ports.contains(&dst_port) {
            return;
        }
        if payload.is_empty() {
            return;
        }

        match decode_dns(transport, payload) {
            Ok(msg) => {
                let tuple = DnsTuple::new(src_ip, src_port, dst_ip, dst_port, transport, msg.id());
                let length = match transport {
                    Transport::Tcp => payload.len().saturating_sub(TCP_DECODE_OFFSET),
                    Transport::Udp => payload.len(),
                };
                let observed = ObservedMessage {
                    ts,
                    tuple,
                    data: msg,
                    length,
                };
                match observed.data.message_type() {
                    MessageType::Query => self.correlator.observe_query(observed, ts),
                    MessageType::Response => self.correlator.observe_response(observed, ts),
                }
            }
            Err(_) => self.account_undecodable(src_ip, dst_ip, transport, payload),
        }
    }

    /// Header-only fallback for payloads the full parser rejected: enough of
    /// the header usually survives to classify the failure.
    fn account_undecodable(
        &self,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        transport: Transport,
        payload: &[u8],
    ) {
        match decode_dns_header(transport, payload) {
            Some(header) if header.response => {
                if header.truncated {
                    // Truncation accounting is attributed to the client the
                    // response was heading to.
                    self.stats.record_truncated_response(dst_ip, src_ip);
                } else {
                    self.stats.record_response_decode_error(dst_ip, src_ip);
                }
            }
            _ => self.stats.record_request_decode_error(src_ip, dst_ip),
        }
    }
}

/// Fields readable from the fixed 12-byte header alone.
struct HeaderBits {
    response: bool,
    truncated: bool,
}

fn decode_dns_header(transport: Transport, payload: &[u8]) -> Option<HeaderBits> {
    let offset = match transport {
        Transport::Tcp => TCP_DECODE_OFFSET,
        Transport::Udp => 0,
    };
    if payload.len() < offset + 4 {
        return None;
    }
    let flags = u16::from_be_bytes([payload[offset + 2], payload[offset + 3]]);
    Some(HeaderBits {
        response: flags >> 15 & 1 == 1,
        truncated: flags >> 9 & 1 == 1,
    })
}

/// Decode a payload into a DNS message. Over TCP the two-byte length prefix
/// is skipped. Header-only messages are rejected, and a parser abort is
/// converted into the same `NonDns` failure after logging.
pub fn decode_dns(transport: Transport, payload: &[u8]) -> Result<Message, WatchError> {
    let offset = match transport {
        Transport::Tcp => TCP_DECODE_OFFSET,
        Transport::Udp => 0,
    };
    if payload.len() <= offset + DNS_HEADER_SIZE {
        return Err(WatchError::NonDns);
    }

    let data = &payload[offset..];
    match catch_unwind(AssertUnwindSafe(|| Message::from_vec(data))) {
        Ok(Ok(msg)) => Ok(msg),
        Ok(Err(e)) => {
            log::debug!("DNS unpack failed: {e}");
            Err(WatchError::NonDns)
        }
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            log::warn!("DNS parser panicked, treating payload as non-DNS: {detail}");
            Err(WatchError::NonDns)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ObserverConfig;
    use crate::record::Record;
    use crossbeam_channel::{unbounded, Receiver};
    use hickory_proto::op::{OpCode, Query};
    use hickory_proto::rr::{DNSClass, Name, RecordType};
    use hickory_proto::serialize::binary::BinEncodable;
    use std::net::Ipv4Addr;
    use std::str::FromStr;
    use std::time::Duration;

    fn harness() -> (PacketIngest, Receiver<Record>, Arc<StatsAggregator>) {
        let (tx, rx) = unbounded();
        let stats = Arc::new(StatsAggregator::new());
        let correlator = Arc::new(Correlator::new(
            ObserverConfig::default(),
            Arc::clone(&stats),
            tx,
        ));
        (
            PacketIngest::new([53], correlator, Arc::clone(&stats)),
            rx,
            stats,
        )
    }

    fn dns_query_bytes(id: u16, name: &str) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(id);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        let mut q = Query::new();
        q.set_name(Name::from_str(name).unwrap());
        q.set_query_type(RecordType::A);
        q.set_query_class(DNSClass::IN);
        msg.add_query(q);
        msg.to_bytes().unwrap()
    }

    fn udp_frame(
        src: Ipv4Addr,
        sport: u16,
        dst: Ipv4Addr,
        dport: u16,
        dns: &[u8],
    ) -> Vec<u8> {
        let mut l4 = Vec::new();
        l4.extend_from_slice(&sport.to_be_bytes());
        l4.extend_from_slice(&dport.to_be_bytes());
        l4.extend_from_slice(&((8 + dns.len()) as u16).to_be_bytes());
        l4.extend_from_slice(&0u16.to_be_bytes());
        l4.extend_from_slice(dns);

        let mut ip = Vec::new();
        ip.push(0x45);
        ip.push(0x00);
        ip.extend_from_slice(&((20 + l4.len()) as u16).to_be_bytes());
        ip.extend_from_slice(&[0, 0, 0, 0]);
        ip.push(64);
        ip.push(packet::PROTO_UDP);
        ip.extend_from_slice(&0u16.to_be_bytes());
        ip.extend_from_slice(&src.octets());
        ip.extend_from_slice(&dst.octets());
        ip.extend_from_slice(&l4);

        let mut frame = vec![0u8; 12];
        frame.extend_from_slice(&0x0800u16.to_be_bytes());
        frame.extend_from_slice(&ip);
        frame
    }

    fn t0() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    #[test]
    fn test_query_routes_to_correlator() {
        let (ingest, _rx, stats) = harness();
        let dns = dns_query_bytes(0x1000, "example.com.");
        let frame = udp_frame(
            Ipv4Addr::new(10, 0, 0, 1),
            40000,
            Ipv4Addr::new(10, 0, 0, 2),
            53,
            &dns,
        );
        ingest.handle_frame(&frame, LinkType::Ethernet, t0());
        assert_eq!(stats.global_snapshot().requests, 1);
    }

    #[test]
    fn test_non_dns_port_ignored() {
        let (ingest, _rx, stats) = harness();
        let dns = dns_query_bytes(0x1001, "example.com.");
        let frame = udp_frame(
            Ipv4Addr::new(10, 0, 0, 1),
            40000,
            Ipv4Addr::new(10, 0, 0, 2),
            8080,
            &dns,
        );
        ingest.handle_frame(&frame, LinkType::Ethernet, t0());
        assert_eq!(stats.global_snapshot().requests, 0);
    }

    // Garbage on a DNS port lands in the decode-error counters, query side.
    #[test]
    fn test_undecodable_request_counted() {
        let (ingest, _rx, stats) = harness();
        // 20 bytes, QR=0, with a question count promising data that is not
        // there.
        let mut junk = vec![0u8; 20];
        junk[2] = 0x00;
        junk[4] = 0x00;
        junk[5] = 0x08; // QDCOUNT=8
        let frame = udp_frame(
            Ipv4Addr::new(10, 0, 0, 1),
            40000,
            Ipv4Addr::new(10, 0, 0, 2),
            53,
            &junk,
        );
        ingest.handle_frame(&frame, LinkType::Ethernet, t0());
        assert_eq!(stats.global_snapshot().request_decode_errors, 1);
    }

    // An undecodable truncated response moves the truncation counter, keyed
    // client-first.
    #[test]
    fn test_undecodable_truncated_response_counted() {
        let (ingest, _rx, stats) = harness();
        let mut junk = vec![0u8; 20];
        junk[2] = 0x86; // QR=1, TC=1
        junk[5] = 0x04; // QDCOUNT=4, nothing follows
        let server = Ipv4Addr::new(10, 0, 0, 2);
        let client = Ipv4Addr::new(10, 0, 0, 1);
        let frame = udp_frame(server, 53, client, 40000, &junk);
        ingest.handle_frame(&frame, LinkType::Ethernet, t0());

        assert_eq!(stats.global_snapshot().truncated_responses, 1);
        let pairs: std::collections::HashMap<_, _> =
            stats.pair_snapshots().into_iter().collect();
        assert_eq!(
            pairs[&(IpAddr::V4(client), IpAddr::V4(server))].truncated_responses,
            1
        );
    }

    // Header-only payloads (<= 12 bytes after the offset) are not DNS.
    #[test]
    fn test_header_only_message_rejected() {
        assert!(matches!(
            decode_dns(Transport::Udp, &[0u8; 12]),
            Err(WatchError::NonDns)
        ));
        // Same bytes after a TCP length prefix.
        let mut tcp = vec![0x00, 0x0C];
        tcp.extend_from_slice(&[0u8; 12]);
        assert!(matches!(
            decode_dns(Transport::Tcp, &tcp),
            Err(WatchError::NonDns)
        ));
    }

    #[test]
    fn test_tcp_decode_skips_length_prefix() {
        let dns = dns_query_bytes(0x3333, "tcp.example.com.");
        let mut payload = (dns.len() as u16).to_be_bytes().to_vec();
        payload.extend_from_slice(&dns);
        let msg = decode_dns(Transport::Tcp, &payload).unwrap();
        assert_eq!(msg.id(), 0x3333);
    }

    #[test]
    fn test_end_to_end_query_response_record() {
        let (ingest, rx, _stats) = harness();
        let client = Ipv4Addr::new(192, 168, 0, 9);
        let server = Ipv4Addr::new(1, 1, 1, 1);

        let query = dns_query_bytes(0x7007, "pair.example.com.");
        ingest.handle_frame(
            &udp_frame(client, 50505, server, 53, &query),
            LinkType::Ethernet,
            t0(),
        );

        let mut resp = Message::from_vec(&query).unwrap();
        resp.set_message_type(MessageType::Response);
        let resp_bytes = resp.to_bytes().unwrap();
        ingest.handle_frame(
            &udp_frame(server, 53, client, 50505, &resp_bytes),
            LinkType::Ethernet,
            t0() + Duration::from_millis(3),
        );

        let record = rx.try_recv().unwrap();
        assert_eq!(record.status, "OK");
        assert_eq!(record.src.ip, client.to_string());
        assert_eq!(record.dst.ip, server.to_string());
        assert_eq!(record.resource, "pair.example.com.");
    }
}
