//! Traffic polling
//!
//! Samples the cumulative byte counters of the TUN and physical interfaces
//! once per second, derives per-second rates and session totals, and
//! publishes the refreshed statistics. Counter resets show up as negative
//! deltas and clamp to zero.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use ptun_os::{InterfaceCounters, InterfaceOps};

use crate::event::{EventHandler, VpnEvent};
use crate::stats::SharedStats;

/// Default cadence of the traffic poller
pub const TRAFFIC_INTERVAL: Duration = Duration::from_secs(1);

/// Periodic interface-counter sampling task
pub struct TrafficPoller {
    pub interfaces: Arc<dyn InterfaceOps>,
    pub tun_if: u32,
    pub phys_if: u32,
    pub stats: SharedStats,
    pub handler: Arc<dyn EventHandler>,
    pub shutdown_rx: broadcast::Receiver<()>,
    pub interval: Duration,
}

struct Sample {
    at: Instant,
    tun: InterfaceCounters,
    phys: InterfaceCounters,
}

impl TrafficPoller {
    /// Run until shutdown
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut baseline: Option<Sample> = None;
        let mut previous: Option<Sample> = None;

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    log::debug!("Traffic poller shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    let tun = match self.interfaces.read_counters(self.tun_if).await {
                        Ok(counters) => counters,
                        Err(e) => {
                            log::debug!("TUN counter read failed: {}", e);
                            continue;
                        }
                    };
                    let phys = match self.interfaces.read_counters(self.phys_if).await {
                        Ok(counters) => counters,
                        Err(e) => {
                            log::debug!("Physical counter read failed: {}", e);
                            continue;
                        }
                    };

                    let sample = Sample { at: Instant::now(), tun, phys };
                    let Some(prev) = previous.as_ref() else {
                        baseline = Some(Sample { at: sample.at, tun, phys });
                        previous = Some(sample);
                        continue;
                    };
                    let base = baseline.as_ref().unwrap();

                    let elapsed = sample.at.duration_since(prev.at).as_secs_f64().max(0.001);
                    let snapshot = {
                        let mut stats = self.stats.write().await;
                        stats.tun_rx_bps = rate(prev.tun.rx_bytes, sample.tun.rx_bytes, elapsed);
                        stats.tun_tx_bps = rate(prev.tun.tx_bytes, sample.tun.tx_bytes, elapsed);
                        stats.phys_rx_bps = rate(prev.phys.rx_bytes, sample.phys.rx_bytes, elapsed);
                        stats.phys_tx_bps = rate(prev.phys.tx_bytes, sample.phys.tx_bytes, elapsed);
                        stats.tun_rx_total = sample.tun.rx_bytes.saturating_sub(base.tun.rx_bytes);
                        stats.tun_tx_total = sample.tun.tx_bytes.saturating_sub(base.tun.tx_bytes);
                        stats.phys_rx_total = sample.phys.rx_bytes.saturating_sub(base.phys.rx_bytes);
                        stats.phys_tx_total = sample.phys.tx_bytes.saturating_sub(base.phys.tx_bytes);
                        stats.clone()
                    };
                    self.handler.on_event(VpnEvent::StatsUpdated(snapshot)).await;

                    previous = Some(sample);
                }
            }
        }
    }
}

/// Bytes per second between two counter readings; clamps counter rollbacks
fn rate(before: u64, after: u64, elapsed_secs: f64) -> u64 {
    let delta = after.saturating_sub(before);
    (delta as f64 / elapsed_secs).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::LoggingEventHandler;
    use crate::stats::shared_stats;
    use ptun_os::mock::MockOs;

    #[test]
    fn test_rate_clamps_counter_reset() {
        assert_eq!(rate(1000, 500, 1.0), 0);
        assert_eq!(rate(500, 1500, 1.0), 1000);
        assert_eq!(rate(0, 3000, 2.0), 1500);
    }

    #[tokio::test]
    async fn test_poller_derives_rates_and_totals() {
        let mock = Arc::new(MockOs::new());
        mock.add_adapter("wintun", 23, Vec::new());
        mock.add_adapter("Ethernet", 7, Vec::new());
        mock.set_counters(23, 1000, 2000);
        mock.set_counters(7, 50_000, 60_000);

        let stats = shared_stats();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let poller = TrafficPoller {
            interfaces: mock.clone(),
            tun_if: 23,
            phys_if: 7,
            stats: stats.clone(),
            handler: Arc::new(LoggingEventHandler),
            shutdown_rx,
            interval: Duration::from_millis(50),
        };
        let handle = tokio::spawn(poller.run());

        // Baseline tick happens first; then advance the counters
        tokio::time::sleep(Duration::from_millis(120)).await;
        mock.set_counters(23, 6000, 4500);
        mock.set_counters(7, 55_000, 61_000);
        tokio::time::sleep(Duration::from_millis(150)).await;

        let snapshot = stats.read().await.clone();
        assert_eq!(snapshot.tun_rx_total, 5000);
        assert_eq!(snapshot.tun_tx_total, 2500);
        assert_eq!(snapshot.phys_rx_total, 5000);
        assert!(snapshot.tun_rx_bps > 0);

        shutdown_tx.send(()).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
    }
}
