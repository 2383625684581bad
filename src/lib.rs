// Passive DNS observation: sniff frames from an interface, reassemble
// fragmented IPv6 datagrams, correlate queries with responses, and emit
// per-transaction records with running counters on the side.

pub mod capture;
pub mod cli;
pub mod config;
pub mod correlator;
pub mod defrag;
pub mod error;
pub mod output;
pub mod packet;
pub mod privilege;
pub mod record;
pub mod sniff;
pub mod stats;
pub mod tuple;
