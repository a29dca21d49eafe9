//! Connection states and supervisor events

use crate::stats::ConnectionStats;

/// Connection state of the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session is active
    Disconnected,
    /// The connect sequence is running
    Connecting,
    /// The tunnel carries traffic
    Connected,
    /// The disconnect sequence is running
    Disconnecting,
    /// The last session ended with an error
    Error,
}

impl ConnectionState {
    /// Check if the tunnel is fully up
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Check if a transition is currently in flight
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Disconnecting
        )
    }

    /// Whether `connect()` is legal from this state
    pub fn can_connect(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Error)
    }

    /// Whether `disconnect()` is legal from this state
    pub fn can_disconnect(&self) -> bool {
        !matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Disconnecting
        )
    }

    /// Get a human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting...",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnecting => "Disconnecting...",
            ConnectionState::Error => "Error",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Events emitted by the supervisor
#[derive(Debug, Clone)]
pub enum VpnEvent {
    /// State changed
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
        /// Short description of why
        message: String,
        /// Error text when the transition was caused by a failure
        error: Option<String>,
    },

    /// Throughput/latency statistics were refreshed
    StatsUpdated(ConnectionStats),

    /// A helper process emitted a line on stdout or stderr
    ProcessOutput {
        /// Display name of the helper (`pingtunnel-client` or `tun2socks`)
        name: &'static str,
        line: String,
    },

    /// A fast restart of the helper processes began or ended
    FastRestart {
        /// True when the restart begins, false when it finishes
        in_progress: bool,
        /// Restart count for this session
        count: u32,
    },
}

/// Event handler trait for receiving supervisor events
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle a supervisor event
    async fn on_event(&self, event: VpnEvent);
}

/// Event handler that routes everything into the log
pub struct LoggingEventHandler;

#[async_trait::async_trait]
impl EventHandler for LoggingEventHandler {
    async fn on_event(&self, event: VpnEvent) {
        match event {
            VpnEvent::StateChanged {
                from,
                to,
                message,
                error,
            } => {
                if let Some(error) = error {
                    log::error!("State {} -> {}: {} ({})", from, to, message, error);
                } else {
                    log::info!("State {} -> {}: {}", from, to, message);
                }
            }
            VpnEvent::StatsUpdated(stats) => {
                log::debug!(
                    "Stats: tun rx {} B/s tx {} B/s, latency {:?} ms",
                    stats.tun_rx_bps,
                    stats.tun_tx_bps,
                    stats.latency_ms
                );
            }
            VpnEvent::ProcessOutput { name, line } => {
                log::debug!("[{}] {}", name, line);
            }
            VpnEvent::FastRestart { in_progress, count } => {
                if in_progress {
                    log::warn!("Fast restart #{} starting", count);
                } else {
                    log::info!("Fast restart #{} finished", count);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_legality() {
        assert!(ConnectionState::Disconnected.can_connect());
        assert!(ConnectionState::Error.can_connect());
        assert!(!ConnectionState::Connected.can_connect());
        assert!(!ConnectionState::Connecting.can_connect());
        assert!(!ConnectionState::Disconnecting.can_connect());
    }

    #[test]
    fn test_disconnect_legality() {
        assert!(ConnectionState::Connected.can_disconnect());
        assert!(ConnectionState::Connecting.can_disconnect());
        assert!(ConnectionState::Error.can_disconnect());
        assert!(!ConnectionState::Disconnected.can_disconnect());
        assert!(!ConnectionState::Disconnecting.can_disconnect());
    }
}
