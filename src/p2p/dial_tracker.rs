//! Dial failure history for a Peer
//!
//! Keeps the most recent failed dials with reason, timestamp and the phase
//! that made them, so an operator can see why a peer keeps rotating routers.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Maximum number of dial failures to keep in memory
pub const MAX_DIAL_FAILURES: usize = 100;

/// Which phase of the peer lifecycle made the dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DialSource {
    Start,
    Reconnect,
}

impl std::fmt::Display for DialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialSource::Start => f.write_str("start"),
            DialSource::Reconnect => f.write_str("reconnect"),
        }
    }
}

/// A single dial failure event
#[derive(Debug, Clone, Serialize)]
pub struct DialFailure {
    pub addr: String,
    pub reason: String,
    pub timestamp_unix: u64,
    pub source: DialSource,
}

#[derive(Debug, Default)]
pub struct DialTracker {
    failures: VecDeque<DialFailure>,
}

impl DialTracker {
    pub fn new() -> Self {
        Self {
            failures: VecDeque::with_capacity(MAX_DIAL_FAILURES),
        }
    }

    /// Record a dial failure, evicting the oldest one when full.
    pub fn record(&mut self, addr: &str, reason: impl ToString, source: DialSource) {
        let timestamp_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        self.failures.push_back(DialFailure {
            addr: addr.to_string(),
            reason: reason.to_string(),
            timestamp_unix,
            source,
        });

        if self.failures.len() > MAX_DIAL_FAILURES {
            self.failures.pop_front();
        }
    }

    /// All recorded failures, most recent first
    pub fn failures(&self) -> Vec<DialFailure> {
        self.failures.iter().rev().cloned().collect()
    }

    pub fn failures_for_addr(&self, addr: &str) -> Vec<DialFailure> {
        self.failures
            .iter()
            .filter(|f| f.addr == addr)
            .rev()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}
