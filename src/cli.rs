use std::path::PathBuf;

use clap::Parser;

use crate::config::ObserverConfig;
use crate::error::WatchError;

#[derive(Parser, Debug)]
#[command(
    name = "dnswatch",
    version,
    about = "Passive DNS transaction observer with IPv6 reassembly"
)]
pub struct Cli {
    /// Network interface to observe.
    #[arg(long)]
    pub interface: String,

    /// JSON configuration file; flags below override its values.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// DNS port to observe (repeatable).
    #[arg(long = "port")]
    pub ports: Vec<u16>,

    /// Seconds an unanswered request stays in flight.
    #[arg(long, value_parser = validate_timeout)]
    pub timeout: Option<u64>,

    /// Include the authority section in emitted records.
    #[arg(long)]
    pub include_authorities: bool,

    /// Include the additional section in emitted records.
    #[arg(long)]
    pub include_additionals: bool,

    /// Emit request-only records for expired transactions.
    #[arg(long)]
    pub emit_unanswered: bool,

    /// Decode and correlate but emit nothing. Benchmarking only.
    #[arg(long)]
    pub drop_decoded: bool,

    /// Log a counter snapshot every N seconds.
    #[arg(long, value_parser = validate_stats_interval)]
    pub stats_interval: Option<u64>,
}

impl Cli {
    /// Load the configuration file (if any) and fold the flag overrides in.
    pub fn resolve_config(&self) -> Result<ObserverConfig, WatchError> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| WatchError::Config {
                    field: path.display().to_string(),
                    detail: e.to_string(),
                })?;
                serde_json::from_str(&text).map_err(|e| WatchError::Config {
                    field: path.display().to_string(),
                    detail: e.to_string(),
                })?
            }
            None => ObserverConfig::default(),
        };

        if !self.ports.is_empty() {
            config.ports = self.ports.clone();
        }
        if let Some(timeout) = self.timeout {
            config.transaction_timeout_secs = timeout;
        }
        if self.include_authorities {
            config.include_authorities = true;
        }
        if self.include_additionals {
            config.include_additionals = true;
        }
        if self.emit_unanswered {
            config.emit_unanswered = true;
        }
        if self.drop_decoded {
            config.drop_decoded_packet = true;
        }

        config.validate()?;
        Ok(config)
    }
}

fn validate_timeout(s: &str) -> Result<u64, String> {
    let val: u64 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid integer"))?;
    if val == 0 {
        Err("timeout must be at least 1 second".to_string())
    } else if val > 300 {
        Err("timeout must be at most 300 seconds".to_string())
    } else {
        Ok(val)
    }
}

fn validate_stats_interval(s: &str) -> Result<u64, String> {
    let val: u64 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid integer"))?;
    if val == 0 {
        Err("stats-interval must be at least 1 second".to_string())
    } else {
        Ok(val)
    }
}
