// DNS transaction correlation.
//
// In-flight exchanges are keyed by the request-side canonical tuple bytes.
// Queries create entries, responses resolve them via the reversed key, and a
// janitor expires whatever stays unanswered. Publishing is a channel
// hand-off performed after the table lock is released.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crossbeam_channel::Sender;
use hickory_proto::op::Message;

use crate::config::ObserverConfig;
use crate::record::{build_record, Record};
use crate::stats::{question_keys, StatsAggregator};
use crate::tuple::{DnsTuple, Transport, TupleKey};

/// Largest DNS message a UDP datagram carries without EDNS0 (RFC 1035 §4.2.1).
pub const MAX_UDP_DNS_SIZE: usize = 512;

// ---------------------------------------------------------------------------
// Notes
// ---------------------------------------------------------------------------

/// Conditions attached to a transaction. Not fatal; they travel on the
/// emitted record as space-joined codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Note {
    DuplicateQuery,
    OrphanedResponse,
    NoResponse,
    UdpOversize,
    UdpOversizeResponse,
    RespEdnsNoSupport,
    RespEdnsUnexpected,
}

impl Note {
    pub fn code(self) -> &'static str {
        match self {
            Self::DuplicateQuery => "duplicate_query",
            Self::OrphanedResponse => "orphaned_response",
            Self::NoResponse => "no_response",
            Self::UdpOversize => "udp_oversize",
            Self::UdpOversizeResponse => "udp_oversize_response",
            Self::RespEdnsNoSupport => "resp_edns_no_support",
            Self::RespEdnsUnexpected => "resp_edns_unexpected",
        }
    }
}

impl fmt::Display for Note {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

// ---------------------------------------------------------------------------
// Messages and transactions
// ---------------------------------------------------------------------------

/// One parsed DNS message as seen on the wire.
#[derive(Debug, Clone)]
pub struct ObservedMessage {
    /// Capture timestamp.
    pub ts: SystemTime,
    /// Endpoints of the packet that carried the message.
    pub tuple: DnsTuple,
    /// Parsed wire data.
    pub data: Message,
    /// DNS message length in bytes (without the TCP length prefix).
    pub length: usize,
}

impl ObservedMessage {
    fn has_edns(&self) -> bool {
        self.data.extensions().is_some()
    }
}

/// One request paired with at most one response.
#[derive(Debug, Clone)]
pub struct Transaction {
    /// Time the request was received (or the response, for orphans).
    pub ts: SystemTime,
    /// Request-side tuple; its canonical key tracks the entry in the table.
    pub tuple: DnsTuple,
    pub transport: Transport,
    pub notes: Vec<Note>,
    pub request: Option<ObservedMessage>,
    pub response: Option<ObservedMessage>,
}

impl Transaction {
    fn new(ts: SystemTime, tuple: DnsTuple) -> Self {
        Self {
            ts,
            transport: tuple.transport,
            tuple,
            notes: Vec::new(),
            request: None,
            response: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Correlator
// ---------------------------------------------------------------------------

/// Predicate deciding whether an exchange between two endpoints is internal
/// management traffic that should not be observed.
pub type InternalPredicate = Box<dyn Fn(IpAddr, IpAddr) -> bool + Send + Sync>;

fn both_loopback(src: IpAddr, dst: IpAddr) -> bool {
    src.is_loopback() && dst.is_loopback()
}

/// Cache of in-flight transactions.
pub struct Correlator {
    inflight: Mutex<HashMap<TupleKey, Transaction>>,
    config: ObserverConfig,
    stats: Arc<StatsAggregator>,
    sink: Sender<Record>,
    internal: InternalPredicate,
}

impl Correlator {
    pub fn new(config: ObserverConfig, stats: Arc<StatsAggregator>, sink: Sender<Record>) -> Self {
        Self::with_internal_predicate(config, stats, sink, Box::new(both_loopback))
    }

    pub fn with_internal_predicate(
        config: ObserverConfig,
        stats: Arc<StatsAggregator>,
        sink: Sender<Record>,
        internal: InternalPredicate,
    ) -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
            config,
            stats,
            sink,
            internal,
        }
    }

    /// Number of exchanges currently awaiting a response.
    pub fn inflight(&self) -> usize {
        self.inflight.lock().unwrap().len()
    }

    /// Handle an observed query (QR=0).
    pub fn observe_query(&self, msg: ObservedMessage, now: SystemTime) {
        let tuple = msg.tuple.clone();
        if (self.internal)(tuple.src_ip, tuple.dst_ip) {
            return;
        }
        log::debug!("processing query {tuple}");

        let mut duplicated = false;
        let mut displaced = None;
        {
            let mut inflight = self.inflight.lock().unwrap();
            if let Some(mut prior) = inflight.remove(&tuple.key()) {
                // The capture layer sometimes hands the same packet over
                // twice; an identical timestamp identifies that case and the
                // entry goes back untouched.
                let prior_ts = prior.request.as_ref().map(|r| r.ts);
                if prior_ts == Some(msg.ts) {
                    inflight.insert(tuple.key(), prior);
                    return;
                }

                // Same client re-asked with the same id before the first
                // exchange resolved. The old exchange is published
                // unresolved and the new one takes its place.
                prior.notes.push(Note::DuplicateQuery);
                if let Some(prior_req) = &prior.request {
                    duplicated = question_keys(&prior_req.data) == question_keys(&msg.data);
                }
                displaced = Some(prior);
            }

            let mut trans = Transaction::new(msg.ts, tuple.clone());
            if tuple.transport == Transport::Udp
                && !msg.has_edns()
                && msg.length > MAX_UDP_DNS_SIZE
            {
                trans.notes.push(Note::UdpOversize);
            }
            self.stats
                .note_outstanding_question(tuple.dst_ip, question_keys(&msg.data), now);
            trans.request = Some(msg);
            inflight.insert(tuple.key(), trans);
        }

        self.stats
            .record_query(tuple.src_ip, tuple.dst_ip, duplicated);
        if let Some(prior) = displaced {
            log::debug!("duplicate_query {tuple}");
            self.publish(prior);
        }
    }

    /// Handle an observed response (QR=1).
    pub fn observe_response(&self, msg: ObservedMessage, now: SystemTime) {
        let tuple = msg.tuple.clone();
        if (self.internal)(tuple.src_ip, tuple.dst_ip) {
            return;
        }
        log::debug!("processing response {tuple}");

        // The guard drops before any publish happens.
        let existing = self.inflight.lock().unwrap().remove(&tuple.reverse_key());
        let mut trans = match existing {
            Some(trans) => trans,
            None => {
                // No outstanding request: either wire reorder or a capture
                // gap. Synthesized as a response-only record, never stored.
                let mut orphan = Transaction::new(now, tuple.reverse());
                orphan.notes.push(Note::OrphanedResponse);
                log::debug!("orphaned_response {tuple}");
                self.stats
                    .record_orphaned_response(tuple.src_ip, tuple.dst_ip);
                orphan.response = Some(msg);
                self.publish(orphan);
                return;
            }
        };

        self.stats.record_response(tuple.src_ip, tuple.dst_ip);

        if tuple.transport == Transport::Udp {
            let resp_edns = msg.has_edns();
            if !resp_edns && msg.length > MAX_UDP_DNS_SIZE {
                trans.notes.push(Note::UdpOversizeResponse);
            }
            if let Some(request) = &trans.request {
                match (request.has_edns(), resp_edns) {
                    (true, false) => trans.notes.push(Note::RespEdnsNoSupport),
                    (false, true) => trans.notes.push(Note::RespEdnsUnexpected),
                    _ => {}
                }
            }
        }

        trans.response = Some(msg);

        if let Some(request) = &trans.request {
            self.stats.infer_recursion(
                trans.tuple.src_ip,
                trans.tuple.dst_ip,
                &question_keys(&request.data),
            );
        }

        self.publish(trans);
    }

    /// Expire entries older than the transaction timeout. Run by the janitor
    /// at the timeout period, and once more on shutdown via [`Self::flush`].
    pub fn sweep(&self, now: SystemTime) {
        let timeout = self.config.transaction_timeout();
        let expired: Vec<Transaction> = {
            let mut inflight = self.inflight.lock().unwrap();
            let keys: Vec<TupleKey> = inflight
                .iter()
                .filter(|(_, trans)| {
                    now.duration_since(trans.ts)
                        .map(|age| age > timeout)
                        .unwrap_or(false)
                })
                .map(|(key, _)| *key)
                .collect();
            keys.iter().filter_map(|k| inflight.remove(k)).collect()
        };

        for trans in expired {
            self.expire(trans);
        }
        self.stats.prune_outstanding(now, timeout);
    }

    /// Drain every in-flight entry as unanswered. Shutdown path.
    pub fn flush(&self) {
        let drained: Vec<Transaction> = {
            let mut inflight = self.inflight.lock().unwrap();
            inflight.drain().map(|(_, trans)| trans).collect()
        };
        for trans in drained {
            self.expire(trans);
        }
    }

    fn expire(&self, mut trans: Transaction) {
        trans.notes.push(Note::NoResponse);
        self.stats
            .record_unmatched_request(trans.tuple.src_ip, trans.tuple.dst_ip);
        self.publish(trans);
    }

    /// Build and emit the record for a finished transaction. Request-only
    /// transactions update counters but are not emitted unless configured
    /// otherwise.
    fn publish(&self, trans: Transaction) {
        if self.config.drop_decoded_packet {
            return;
        }
        let request_only = trans.response.is_none();
        let record = build_record(&trans, &self.config);
        log::debug!("record decoded: {:?}", record.query);

        if request_only && !self.config.emit_unanswered {
            return;
        }
        if self.sink.try_send(record).is_err() {
            log::warn!("publish queue full, dropping record");
        }
    }
}
