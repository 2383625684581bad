// Running traffic counters, globally and per (src_ip, dst_ip) pair.
//
// Hot-path increments are plain atomics; the pair map and the outstanding
// question store (recursion inference) sit behind their own short-lived
// locks.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use hickory_proto::op::Message;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Question canonical form
// ---------------------------------------------------------------------------

/// RFC-1035 canonical form of one question: case-insensitive name plus raw
/// type and class codes. Used for duplicate detection and recursion
/// inference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuestionKey {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// Canonical keys for every question in a message, in section order.
pub fn question_keys(msg: &Message) -> Vec<QuestionKey> {
    msg.queries()
        .iter()
        .map(|q| QuestionKey {
            name: q.name().to_utf8().to_ascii_lowercase(),
            qtype: u16::from(q.query_type()),
            qclass: u16::from(q.query_class()),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Counters {
    pub requests: AtomicU64,
    pub responses: AtomicU64,
    pub duplicate_queries: AtomicU64,
    pub orphaned_responses: AtomicU64,
    pub recursive_queries: AtomicU64,
    pub truncated_responses: AtomicU64,
    pub request_decode_errors: AtomicU64,
    pub response_decode_errors: AtomicU64,
    pub unmatched_requests: AtomicU64,
}

/// Point-in-time copy of one counter set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub requests: u64,
    pub responses: u64,
    pub duplicate_queries: u64,
    pub orphaned_responses: u64,
    pub recursive_queries: u64,
    pub truncated_responses: u64,
    pub request_decode_errors: u64,
    pub response_decode_errors: u64,
    pub unmatched_requests: u64,
}

impl Counters {
    fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            duplicate_queries: self.duplicate_queries.load(Ordering::Relaxed),
            orphaned_responses: self.orphaned_responses.load(Ordering::Relaxed),
            recursive_queries: self.recursive_queries.load(Ordering::Relaxed),
            truncated_responses: self.truncated_responses.load(Ordering::Relaxed),
            request_decode_errors: self.request_decode_errors.load(Ordering::Relaxed),
            response_decode_errors: self.response_decode_errors.load(Ordering::Relaxed),
            unmatched_requests: self.unmatched_requests.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Outstanding questions (recursion inference)
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct OutstandingQuestion {
    questions: Vec<QuestionKey>,
    seen: SystemTime,
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

pub struct StatsAggregator {
    global: Counters,
    pairs: Mutex<HashMap<(IpAddr, IpAddr), Arc<Counters>>>,
    /// Questions of outstanding requests, indexed by the server they were
    /// sent to. A later exchange whose source matches that server and whose
    /// question is identical is the server's own upstream re-issue.
    outstanding: Mutex<HashMap<IpAddr, Vec<OutstandingQuestion>>>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self {
            global: Counters::default(),
            pairs: Mutex::new(HashMap::new()),
            outstanding: Mutex::new(HashMap::new()),
        }
    }

    fn pair(&self, src: IpAddr, dst: IpAddr) -> Arc<Counters> {
        let mut pairs = self.pairs.lock().unwrap();
        Arc::clone(pairs.entry((src, dst)).or_default())
    }

    fn bump(&self, src: IpAddr, dst: IpAddr, field: impl Fn(&Counters) -> &AtomicU64) {
        field(&self.global).fetch_add(1, Ordering::Relaxed);
        field(&self.pair(src, dst)).fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_query(&self, src: IpAddr, dst: IpAddr, duplicated: bool) {
        self.bump(src, dst, |c| &c.requests);
        if duplicated {
            self.bump(src, dst, |c| &c.duplicate_queries);
        }
    }

    pub fn record_response(&self, src: IpAddr, dst: IpAddr) {
        self.bump(src, dst, |c| &c.responses);
    }

    pub fn record_orphaned_response(&self, src: IpAddr, dst: IpAddr) {
        self.bump(src, dst, |c| &c.orphaned_responses);
    }

    pub fn record_unmatched_request(&self, src: IpAddr, dst: IpAddr) {
        self.bump(src, dst, |c| &c.unmatched_requests);
    }

    /// Truncated responses are attributed to the (client, server) pair.
    pub fn record_truncated_response(&self, client: IpAddr, server: IpAddr) {
        self.bump(client, server, |c| &c.truncated_responses);
    }

    pub fn record_request_decode_error(&self, src: IpAddr, dst: IpAddr) {
        self.bump(src, dst, |c| &c.request_decode_errors);
    }

    pub fn record_response_decode_error(&self, client: IpAddr, server: IpAddr) {
        self.bump(client, server, |c| &c.response_decode_errors);
    }

    /// Remember the question set of an observed request for later recursion
    /// inference. `dst` is the server the request was sent to.
    pub fn note_outstanding_question(
        &self,
        dst: IpAddr,
        questions: Vec<QuestionKey>,
        now: SystemTime,
    ) {
        if questions.is_empty() {
            return;
        }
        self.outstanding
            .lock()
            .unwrap()
            .entry(dst)
            .or_default()
            .push(OutstandingQuestion {
                questions,
                seen: now,
            });
    }

    /// Recursion inference for one completed exchange: the exchange's source
    /// was previously seen as the *destination* of a request with the same
    /// question set, so the server re-issued the query upstream.
    pub fn infer_recursion(
        &self,
        src: IpAddr,
        dst: IpAddr,
        questions: &[QuestionKey],
    ) -> bool {
        if questions.is_empty() {
            return false;
        }
        let mut outstanding = self.outstanding.lock().unwrap();
        let Some(entries) = outstanding.get_mut(&src) else {
            return false;
        };
        let Some(pos) = entries.iter().position(|e| e.questions == questions) else {
            return false;
        };
        entries.remove(pos);
        if entries.is_empty() {
            outstanding.remove(&src);
        }
        drop(outstanding);

        self.bump(src, dst, |c| &c.recursive_queries);
        true
    }

    /// Drop outstanding-question entries older than `ttl`.
    pub fn prune_outstanding(&self, now: SystemTime, ttl: Duration) {
        let mut outstanding = self.outstanding.lock().unwrap();
        outstanding.retain(|_, entries| {
            entries.retain(|e| {
                now.duration_since(e.seen)
                    .map(|age| age <= ttl)
                    .unwrap_or(true)
            });
            !entries.is_empty()
        });
    }

    pub fn global_snapshot(&self) -> CounterSnapshot {
        self.global.snapshot()
    }

    pub fn pair_snapshots(&self) -> Vec<((IpAddr, IpAddr), CounterSnapshot)> {
        self.pairs
            .lock()
            .unwrap()
            .iter()
            .map(|(pair, counters)| (*pair, counters.snapshot()))
            .collect()
    }
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}
