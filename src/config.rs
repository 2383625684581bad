// Observer configuration. Loaded from a JSON file via --config and then
// overridden by individual CLI flags; every field has a default so an empty
// file (or none at all) is valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::WatchError;

/// Default transaction timeout in seconds. Requests that stay unanswered for
/// this long are expired by the janitor.
pub const DEFAULT_TRANSACTION_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserverConfig {
    /// DNS ports to observe. A packet qualifies when either endpoint port is
    /// in this list.
    #[serde(default = "default_ports")]
    pub ports: Vec<u16>,

    /// Include the request body in emitted records.
    #[serde(default = "default_true")]
    pub send_request: bool,

    /// Include the response body in emitted records.
    #[serde(default = "default_true")]
    pub send_response: bool,

    /// Include the authority section in emitted records.
    #[serde(default)]
    pub include_authorities: bool,

    /// Include the additional section (minus the OPT pseudo-RR) in emitted
    /// records.
    #[serde(default)]
    pub include_additionals: bool,

    /// Seconds an unanswered request stays in the in-flight table.
    #[serde(default = "default_transaction_timeout")]
    pub transaction_timeout_secs: u64,

    /// Consume decoded records without emitting them. Benchmarking only.
    #[serde(default)]
    pub drop_decoded_packet: bool,

    /// Emit request-only records for expired transactions. Off by default:
    /// counters are still updated, the record itself is not written.
    #[serde(default)]
    pub emit_unanswered: bool,
}

fn default_ports() -> Vec<u16> {
    vec![53]
}

fn default_true() -> bool {
    true
}

fn default_transaction_timeout() -> u64 {
    DEFAULT_TRANSACTION_TIMEOUT_SECS
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            ports: default_ports(),
            send_request: true,
            send_response: true,
            include_authorities: false,
            include_additionals: false,
            transaction_timeout_secs: DEFAULT_TRANSACTION_TIMEOUT_SECS,
            drop_decoded_packet: false,
            emit_unanswered: false,
        }
    }
}

impl ObserverConfig {
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.transaction_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), WatchError> {
        if self.ports.is_empty() {
            return Err(WatchError::Config {
                field: "ports".to_string(),
                detail: "at least one port is required".to_string(),
            });
        }
        if self.transaction_timeout_secs == 0 {
            return Err(WatchError::Config {
                field: "transaction_timeout_secs".to_string(),
                detail: "must be >= 1".to_string(),
            });
        }
        Ok(())
    }
}
