//! Per-transport counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Point-in-time view of a transport's counters, as returned by
/// [`Transport::metrics`](crate::Transport::metrics).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportMetrics {
    /// Commands written to the wire.
    pub commands_sent: u64,
    /// Commands read from the wire.
    pub commands_received: u64,
    /// Payload bytes written.
    pub bytes_sent: u64,
    /// Payload bytes read.
    pub bytes_received: u64,
    /// Calls to `start()` that tried to open a connection.
    pub connections: u64,
    /// Of those, the ones that failed.
    pub failed_connections: u64,
    /// Smoothed request round trip, in milliseconds.
    pub average_latency_ms: f64,
    /// Transport-specific extras (the failover transport reports its
    /// reconnect counters here).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Lock-free counters updated from the send, receive and connect paths.
#[derive(Debug, Default)]
pub struct AtomicMetrics {
    commands_sent: AtomicU64,
    commands_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    connections: AtomicU64,
    failed_connections: AtomicU64,
    /// EMA of the round trip, microseconds.
    latency_us: AtomicU64,
}

impl AtomicMetrics {
    /// All counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// One outbound command carrying `size` payload bytes.
    pub fn record_sent(&self, size: usize) {
        self.commands_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(size as u64, Ordering::Relaxed);
    }

    /// One inbound command carrying `size` payload bytes.
    pub fn record_received(&self, size: usize) {
        self.commands_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(size as u64, Ordering::Relaxed);
    }

    /// A connection attempt is about to be made.
    pub fn record_connect_attempt(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    /// The attempt counted by the last [`record_connect_attempt`](Self::record_connect_attempt) failed.
    pub fn record_connect_failure(&self) {
        self.failed_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Folds one request round trip into the moving average (alpha 0.1).
    pub fn update_latency_us(&self, latency_us: u64) {
        let previous = self.latency_us.load(Ordering::Relaxed);
        let next = match previous {
            0 => latency_us,
            prev => prev.saturating_mul(9).saturating_add(latency_us) / 10,
        };
        self.latency_us.store(next, Ordering::Relaxed);
    }

    /// Copies the counters out.
    pub fn snapshot(&self) -> TransportMetrics {
        TransportMetrics {
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            commands_received: self.commands_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
            failed_connections: self.failed_connections.load(Ordering::Relaxed),
            average_latency_ms: self.latency_us.load(Ordering::Relaxed) as f64 / 1000.0,
            metadata: HashMap::new(),
        }
    }
}
