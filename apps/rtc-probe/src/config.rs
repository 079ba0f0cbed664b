use std::time::Duration;

use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::cli::{ConnectArgs, WorkloadArgs};
use crate::probe::ProbeOptions;
use crate::signaling::{SignalingError, parse_signaling_url};

pub const DEFAULT_SIGNAL_URL: &str = "ws://127.0.0.1:8000/ws";
const MIB: u64 = 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid signal url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("probe interval must be greater than zero")]
    InvalidInterval,
    #[error("invalid size: {0}")]
    InvalidSize(String),
}

/// Everything a party needs, validated once at startup.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub signal_url: Url,
    pub label: String,
    pub retry_offer: bool,
    pub ice_servers: Vec<String>,
    pub max_message_size: usize,
    pub connect_timeout: Duration,
    pub interval: Duration,
    pub max_attempts: Option<u64>,
    pub transfer_bytes: usize,
    pub log_filter: String,
}

impl ProbeConfig {
    /// Defaults for everything but the relay address.
    pub fn new(signal_url: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            signal_url: parse_signal_url(signal_url)?,
            label: short_label(),
            retry_offer: true,
            ice_servers: Vec::new(),
            max_message_size: 65536,
            connect_timeout: Duration::from_secs(30),
            interval: Duration::from_millis(1000),
            max_attempts: None,
            transfer_bytes: (32 * MIB) as usize,
            log_filter: default_log_filter(),
        })
    }

    pub fn from_args(connect: &ConnectArgs, workload: &WorkloadArgs) -> Result<Self, ConfigError> {
        if workload.interval_ms == 0 {
            return Err(ConfigError::InvalidInterval);
        }
        if workload.mib == 0 {
            return Err(ConfigError::InvalidSize("--mib must be greater than zero".into()));
        }
        let transfer_bytes = workload
            .mib
            .checked_mul(MIB)
            .and_then(|bytes| usize::try_from(bytes).ok())
            .ok_or_else(|| ConfigError::InvalidSize(format!("{} MiB is too large", workload.mib)))?;
        if connect.max_message_size == 0 {
            return Err(ConfigError::InvalidSize(
                "--max-message-size must be greater than zero".into(),
            ));
        }

        let ice_servers = connect
            .ice_servers
            .iter()
            .map(|server| server.trim().to_string())
            .filter(|server| !server.is_empty())
            .collect();

        Ok(Self {
            signal_url: parse_signal_url(&connect.signal_url)?,
            label: connect
                .label
                .clone()
                .filter(|label| !label.trim().is_empty())
                .unwrap_or_else(short_label),
            retry_offer: connect.retry_offer,
            ice_servers,
            max_message_size: connect.max_message_size,
            connect_timeout: Duration::from_secs(connect.connect_timeout_secs.max(1)),
            interval: Duration::from_millis(workload.interval_ms),
            max_attempts: workload.count,
            transfer_bytes,
            log_filter: default_log_filter(),
        })
    }

    pub fn probe_options(&self) -> ProbeOptions {
        ProbeOptions {
            interval: self.interval,
            max_attempts: self.max_attempts,
        }
    }
}

fn parse_signal_url(raw: &str) -> Result<Url, ConfigError> {
    parse_signaling_url(raw).map_err(|err| match err {
        SignalingError::InvalidUrl { url, reason } => ConfigError::InvalidUrl { url, reason },
        other => ConfigError::InvalidUrl {
            url: raw.to_string(),
            reason: other.to_string(),
        },
    })
}

fn short_label() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

fn default_log_filter() -> String {
    std::env::var("RUST_LOG").unwrap_or_else(|_| crate::telemetry::DEFAULT_FILTER.into())
}
