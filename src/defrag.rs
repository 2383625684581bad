// IPv6 fragment reassembly.
//
// Fragments sharing (src, dst, identification, protocol) accumulate in an
// ordered list until they cover [0, total_length), then the datagram is
// rebuilt from the first-seen header template. Out-of-order and duplicate
// arrival are tolerated; overlapping ranges invalidate the whole chain.

use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use crate::error::WatchError;
use crate::packet::{FragmentHeader, Ipv6Header, EXT_FRAGMENT};

/// A fragment list idle longer than this is dropped.
pub const FRAGMENT_IDLE_TTL: Duration = Duration::from_secs(30);

/// Upper bound on fragments per datagram.
pub const MAX_FRAGMENTS_PER_DATAGRAM: usize = 64;

/// Upper bound on the reassembled payload: the IPv6 payload-length field cap
/// minus the fixed header.
pub const MAX_REASSEMBLED_PAYLOAD: usize = 65_535 - 40;

/// Upper bound on concurrently reassembling datagrams. Inserting past this
/// evicts the stalest list.
pub const MAX_ACTIVE_DATAGRAMS: usize = 500;

// ---------------------------------------------------------------------------
// Fragment key
// ---------------------------------------------------------------------------

/// Identity of one in-progress datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FragmentKey {
    src: [u8; 16],
    dst: [u8; 16],
    identification: u32,
    protocol: u8,
}

impl FragmentKey {
    fn new(src: Ipv6Addr, dst: Ipv6Addr, frag: &FragmentHeader) -> Self {
        Self {
            src: src.octets(),
            dst: dst.octets(),
            identification: frag.identification,
            protocol: frag.next_header,
        }
    }
}

// ---------------------------------------------------------------------------
// Fragment list
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct FragmentEntry {
    offset: usize,
    payload: Vec<u8>,
    more: bool,
}

/// Holes-and-holds container for one datagram.
#[derive(Debug)]
struct FragmentList {
    /// Header template from the first-seen fragment, used to rebuild the
    /// delivered packet.
    header: Ipv6Header,
    /// Protocol captured from the fragment header, restored as the rebuilt
    /// next-header value.
    protocol: u8,
    /// Kept ordered by offset.
    fragments: Vec<FragmentEntry>,
    highest_end: usize,
    /// Known once the fragment with more=false arrives.
    total_length: Option<usize>,
    last_seen: SystemTime,
}

impl FragmentList {
    fn new(header: &Ipv6Header, protocol: u8, now: SystemTime) -> Self {
        Self {
            header: header.clone(),
            protocol,
            fragments: Vec::new(),
            highest_end: 0,
            total_length: None,
            last_seen: now,
        }
    }

    /// Insert one fragment, keeping offset order. Exact duplicates are
    /// discarded; any partial overlap fails the list.
    fn insert(&mut self, frag: &FragmentHeader, data: &[u8]) -> Result<(), WatchError> {
        // Offsets come from a 13-bit field scaled by 8; only the tail
        // fragment may have a length that is not a multiple of 8.
        if frag.offset % 8 != 0 {
            return Err(WatchError::MalformedFragment);
        }
        if frag.more && data.len() % 8 != 0 {
            return Err(WatchError::MalformedFragment);
        }

        let start = frag.offset;
        let end = start + data.len();

        let mut pos = self.fragments.len();
        for (i, existing) in self.fragments.iter().enumerate() {
            let e_start = existing.offset;
            let e_end = existing.offset + existing.payload.len();
            if start == e_start && data.len() == existing.payload.len() {
                // Idempotent re-delivery of the same fragment.
                return Ok(());
            }
            if start < e_end && e_start < end {
                return Err(WatchError::MalformedFragment);
            }
            if start < e_start {
                pos = i;
                break;
            }
        }

        if self.fragments.len() >= MAX_FRAGMENTS_PER_DATAGRAM {
            return Err(WatchError::TooManyFragments);
        }
        let stored: usize = self.fragments.iter().map(|f| f.payload.len()).sum();
        if stored + data.len() > MAX_REASSEMBLED_PAYLOAD {
            return Err(WatchError::OversizedDatagram);
        }

        if !frag.more {
            if self.total_length.is_some_and(|t| t != end) {
                return Err(WatchError::MalformedFragment);
            }
            self.total_length = Some(end);
        }
        if self.total_length.is_some_and(|t| end > t) {
            return Err(WatchError::MalformedFragment);
        }

        self.fragments.insert(
            pos,
            FragmentEntry {
                offset: start,
                payload: data.to_vec(),
                more: frag.more,
            },
        );
        self.highest_end = self.highest_end.max(end);
        Ok(())
    }

    /// True when a total length is known and the stored ranges cover
    /// [0, total) without gaps.
    fn is_complete(&self) -> bool {
        let Some(total) = self.total_length else {
            return false;
        };
        let mut expected = 0;
        for frag in &self.fragments {
            if frag.offset != expected {
                return false;
            }
            expected += frag.payload.len();
        }
        expected == total
    }

    /// Concatenate payloads and rebuild the header: the fragment extension
    /// disappears, next-header becomes the inner protocol, and the payload
    /// length is the reassembled length.
    fn assemble(&self) -> (Ipv6Header, Vec<u8>) {
        let total = self.total_length.unwrap_or(self.highest_end);
        let mut payload = Vec::with_capacity(total);
        for frag in &self.fragments {
            payload.extend_from_slice(&frag.payload);
        }
        let mut header = self.header.clone();
        header.next_header = self.protocol;
        header.payload_length = payload.len() as u16;
        (header, payload)
    }
}

// ---------------------------------------------------------------------------
// Defragmenter
// ---------------------------------------------------------------------------

/// Outcome of feeding one packet to the defragmenter.
#[derive(Debug, PartialEq, Eq)]
pub enum Reassembly {
    /// No fragment header present; the packet is already whole.
    Passthrough,
    /// Fragment stored; the datagram is not yet complete.
    Buffered,
    /// Reassembly finished. The caller continues as if the datagram had
    /// never been fragmented.
    Delivered(Ipv6Header, Vec<u8>),
}

/// Map of in-progress datagrams, guarded by a single lock.
pub struct Defragmenter {
    lists: Mutex<HashMap<FragmentKey, FragmentList>>,
}

impl Defragmenter {
    pub fn new() -> Self {
        Self {
            lists: Mutex::new(HashMap::new()),
        }
    }

    /// Feed one IPv6 packet. `payload` is the bytes following the fixed
    /// header; when `header.next_header` is the Fragment extension it must
    /// start with the 8-byte fragment header.
    pub fn defragment(
        &self,
        header: &Ipv6Header,
        payload: &[u8],
        now: SystemTime,
    ) -> Result<Reassembly, WatchError> {
        if header.next_header != EXT_FRAGMENT {
            return Ok(Reassembly::Passthrough);
        }
        let (frag, data) = FragmentHeader::parse(payload).ok_or(WatchError::MalformedFragment)?;
        let key = FragmentKey::new(header.src, header.dst, &frag);

        let mut lists = self.lists.lock().unwrap();
        Self::sweep(&mut lists, now);

        if !lists.contains_key(&key) && lists.len() >= MAX_ACTIVE_DATAGRAMS {
            Self::evict_stalest(&mut lists);
        }
        let list = lists
            .entry(key)
            .or_insert_with(|| FragmentList::new(header, frag.next_header, now));
        list.last_seen = now;

        if let Err(e) = list.insert(&frag, data) {
            lists.remove(&key);
            return Err(e);
        }

        if list.is_complete() {
            let (header, payload) = list.assemble();
            lists.remove(&key);
            return Ok(Reassembly::Delivered(header, payload));
        }
        Ok(Reassembly::Buffered)
    }

    /// Number of datagrams currently reassembling.
    pub fn active(&self) -> usize {
        self.lists.lock().unwrap().len()
    }

    fn sweep(lists: &mut HashMap<FragmentKey, FragmentList>, now: SystemTime) {
        lists.retain(|_, list| {
            now.duration_since(list.last_seen)
                .map(|idle| idle <= FRAGMENT_IDLE_TTL)
                .unwrap_or(true)
        });
    }

    fn evict_stalest(lists: &mut HashMap<FragmentKey, FragmentList>) {
        if let Some(key) = lists
            .iter()
            .min_by_key(|(_, list)| list.last_seen)
            .map(|(key, _)| *key)
        {
            lists.remove(&key);
        }
    }
}

impl Default for Defragmenter {
    fn default() -> Self {
        Self::new()
    }
}
