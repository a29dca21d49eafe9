//! Session statistics shared between the supervisor's background tasks

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

/// Statistics for the current session
///
/// Latency fields are written by the health monitor, throughput fields by
/// the traffic poller; the UI only ever reads snapshots.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    /// When the session entered `Connected`
    pub connected_at: Option<DateTime<Utc>>,

    /// TUN adapter receive rate, bytes/second
    pub tun_rx_bps: u64,
    /// TUN adapter transmit rate, bytes/second
    pub tun_tx_bps: u64,
    /// Physical adapter receive rate, bytes/second
    pub phys_rx_bps: u64,
    /// Physical adapter transmit rate, bytes/second
    pub phys_tx_bps: u64,

    /// Session byte totals for the same four counters
    pub tun_rx_total: u64,
    pub tun_tx_total: u64,
    pub phys_rx_total: u64,
    pub phys_tx_total: u64,

    /// Most recent tunnel latency sample, milliseconds
    pub latency_ms: Option<u64>,
    /// Consecutive samples above half the configured threshold
    pub high_latency_count: u32,
    /// Whether latency currently sits above half the threshold
    pub degraded: bool,
}

impl ConnectionStats {
    /// Fresh stats for a new session
    pub fn for_new_session() -> Self {
        Self {
            connected_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Clear the latency counters (after a fast restart)
    pub fn reset_latency(&mut self) {
        self.latency_ms = None;
        self.high_latency_count = 0;
        self.degraded = false;
    }
}

/// Shared handle to the session statistics
pub type SharedStats = Arc<RwLock<ConnectionStats>>;

/// Allocate a fresh shared stats handle
pub fn shared_stats() -> SharedStats {
    Arc::new(RwLock::new(ConnectionStats::default()))
}
