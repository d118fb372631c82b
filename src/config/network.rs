use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::p2p::framing::MAX_MESSAGE_SIZE;
use crate::p2p::handler::DEFAULT_CHANNEL_CAPACITY;
use crate::p2p::peer::{KEEPALIVE_INTERVAL_SECS, RECONNECT_INTERVAL_SECS, RECONNECT_MAX_ATTEMPTS};
use crate::p2p::{PeerConfig, TransportConfig, DIAL_TIMEOUT_SECS, READ_TIMEOUT_SECS, WRITE_TIMEOUT_SECS};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Network configuration for the relay transport
///
/// Every key is optional in the TOML file; environment variables override
/// the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the router listens on
    pub listen_addr: String,

    /// Candidate routers for a peer, tried in order
    pub router_addrs: Vec<String>,

    /// Stable peer id; the binary generates one when empty
    pub peer_id: String,

    /// Keepalive interval (seconds). A link is dead after twice this long
    /// without traffic
    pub keepalive_interval_secs: u64,

    /// Pause between dial attempts to the same router (seconds)
    pub reconnect_interval_secs: u64,

    /// Dial attempts per router before rotating to the next
    pub reconnect_max_attempts: u32,

    pub channel_capacity: usize,
    pub max_message_size: usize,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub connect_timeout_secs: u64,

    /// Write logs to this file instead of stderr
    pub log_path: Option<PathBuf>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9100".to_string(),
            router_addrs: Vec::new(),
            peer_id: String::new(),
            keepalive_interval_secs: KEEPALIVE_INTERVAL_SECS,
            reconnect_interval_secs: RECONNECT_INTERVAL_SECS,
            reconnect_max_attempts: RECONNECT_MAX_ATTEMPTS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_message_size: MAX_MESSAGE_SIZE,
            read_timeout_secs: READ_TIMEOUT_SECS,
            write_timeout_secs: WRITE_TIMEOUT_SECS,
            connect_timeout_secs: DIAL_TIMEOUT_SECS,
            log_path: None,
        }
    }
}

impl NetworkConfig {
    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load `path` (defaults when `None`), apply environment overrides and
    /// validate the result.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&content).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `CHAIN_RELAY_*` environment variables.
    /// Unparseable numbers are ignored.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = var("CHAIN_RELAY_LISTEN_ADDR") {
            self.listen_addr = val.trim().to_string();
        }

        if let Some(val) = var("CHAIN_RELAY_ROUTERS") {
            self.router_addrs = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(val) = var("CHAIN_RELAY_PEER_ID") {
            self.peer_id = val.trim().to_string();
        }

        if let Some(num) = var("CHAIN_RELAY_KEEPALIVE_SECS").and_then(|v| v.trim().parse().ok()) {
            self.keepalive_interval_secs = num;
        }

        if let Some(num) = var("CHAIN_RELAY_RECONNECT_SECS").and_then(|v| v.trim().parse().ok()) {
            self.reconnect_interval_secs = num;
        }

        if let Some(num) = var("CHAIN_RELAY_RECONNECT_ATTEMPTS").and_then(|v| v.trim().parse().ok()) {
            self.reconnect_max_attempts = num;
        }

        if let Some(val) = var("CHAIN_RELAY_LOG_PATH") {
            let val = val.trim();
            self.log_path = (!val.is_empty()).then(|| PathBuf::from(val));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keepalive_interval_secs == 0 {
            return Err(ConfigError::Invalid("keepalive_interval_secs must be > 0".into()));
        }
        for (name, secs) in [
            ("read_timeout_secs", self.read_timeout_secs),
            ("write_timeout_secs", self.write_timeout_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::Invalid(format!("{} must be > 0", name)));
            }
        }
        // the socket deadline must not fire before a silent link is noticed
        if self.read_timeout_secs <= self.keepalive_interval_secs.saturating_mul(2) {
            return Err(ConfigError::Invalid(format!(
                "read_timeout_secs ({}) must exceed twice keepalive_interval_secs ({})",
                self.read_timeout_secs, self.keepalive_interval_secs
            )));
        }
        if self.reconnect_max_attempts == 0 {
            return Err(ConfigError::Invalid("reconnect_max_attempts must be > 0".into()));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid("channel_capacity must be > 0".into()));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::Invalid("max_message_size must be > 0".into()));
        }
        for addr in &self.router_addrs {
            let has_port = addr
                .rsplit_once(':')
                .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
            if !has_port {
                return Err(ConfigError::Invalid(format!(
                    "router address '{}' must be host:port",
                    addr
                )));
            }
        }
        Ok(())
    }

    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            channel_capacity: self.channel_capacity,
            max_message_size: self.max_message_size,
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }

    pub fn peer(&self) -> PeerConfig {
        PeerConfig::default()
            .with_keepalive_interval(Duration::from_secs(self.keepalive_interval_secs))
            .with_reconnect_interval(Duration::from_secs(self.reconnect_interval_secs))
            .with_reconnect_max_attempts(self.reconnect_max_attempts)
            .with_transport(self.transport())
    }
}
