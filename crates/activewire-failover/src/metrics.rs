//! Failover transport metrics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use activewire_transport_traits::TransportMetrics;

/// Lock-free counters describing the life of a failover transport.
#[derive(Debug, Default)]
pub struct FailoverMetrics {
    /// Transport start attempts, backups included
    pub connect_attempts: AtomicU64,
    /// Start attempts that failed or timed out
    pub connect_failures: AtomicU64,
    /// Successful connections installed as the active transport
    pub connections: AtomicU64,
    /// Active connections lost or torn down
    pub disconnects: AtomicU64,
    /// Commands resent during replay
    pub replayed_commands: AtomicU64,
    /// Backup transports started
    pub backups_started: AtomicU64,
    /// Backup transports promoted to active
    pub backups_promoted: AtomicU64,
    /// Commands sent by the application
    pub commands_sent: AtomicU64,
    /// Inbound commands dispatched
    pub commands_received: AtomicU64,
    /// Payload bytes sent by the application
    pub bytes_sent: AtomicU64,
}

/// Point-in-time copy of [`FailoverMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverMetricsSnapshot {
    /// Transport start attempts
    pub connect_attempts: u64,
    /// Failed start attempts
    pub connect_failures: u64,
    /// Installed connections
    pub connections: u64,
    /// Lost connections
    pub disconnects: u64,
    /// Replayed commands
    pub replayed_commands: u64,
    /// Backups started
    pub backups_started: u64,
    /// Backups promoted
    pub backups_promoted: u64,
    /// Application commands sent
    pub commands_sent: u64,
    /// Inbound commands dispatched
    pub commands_received: u64,
    /// Application payload bytes sent
    pub bytes_sent: u64,
}

impl FailoverMetrics {
    /// Creates zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one application command of `size` payload bytes.
    pub fn record_sent(&self, size: usize) {
        self.commands_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(size as u64, Ordering::Relaxed);
    }

    /// Takes a snapshot of every counter.
    pub fn snapshot(&self) -> FailoverMetricsSnapshot {
        FailoverMetricsSnapshot {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            replayed_commands: self.replayed_commands.load(Ordering::Relaxed),
            backups_started: self.backups_started.load(Ordering::Relaxed),
            backups_promoted: self.backups_promoted.load(Ordering::Relaxed),
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            commands_received: self.commands_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

impl From<FailoverMetricsSnapshot> for TransportMetrics {
    fn from(snapshot: FailoverMetricsSnapshot) -> Self {
        let mut metrics = Self {
            bytes_sent: snapshot.bytes_sent,
            commands_sent: snapshot.commands_sent,
            commands_received: snapshot.commands_received,
            connections: snapshot.connect_attempts,
            failed_connections: snapshot.connect_failures,
            ..Self::default()
        };
        metrics
            .metadata
            .insert("reconnects".into(), snapshot.connections.saturating_sub(1).into());
        metrics
            .metadata
            .insert("replayed_commands".into(), snapshot.replayed_commands.into());
        metrics
            .metadata
            .insert("backups_promoted".into(), snapshot.backups_promoted.into());
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = FailoverMetrics::new();
        FailoverMetrics::incr(&metrics.connect_attempts);
        FailoverMetrics::incr(&metrics.connect_attempts);
        FailoverMetrics::incr(&metrics.connect_failures);
        metrics.record_sent(12);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connect_attempts, 2);
        assert_eq!(snapshot.connect_failures, 1);
        assert_eq!(snapshot.bytes_sent, 12);
    }

    #[test]
    fn test_snapshot_serializes() {
        let snapshot = FailoverMetrics::new().snapshot();
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["replayed_commands"], 0);
    }

    #[test]
    fn test_into_transport_metrics() {
        let snapshot = FailoverMetricsSnapshot {
            connect_attempts: 5,
            connect_failures: 3,
            connections: 2,
            ..Default::default()
        };
        let metrics: TransportMetrics = snapshot.into();
        assert_eq!(metrics.connections, 5);
        assert_eq!(metrics.failed_connections, 3);
        assert_eq!(metrics.metadata["reconnects"], 1);
    }
}
