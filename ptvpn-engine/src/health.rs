//! Health monitoring and the fast-restart budget
//!
//! A periodic task probes helper liveness, local SOCKS reachability, and
//! the consecutive-high-latency counter while the session is up. Failures
//! turn into commands for the state machine: a fast restart while budget
//! remains, a disconnect once it is exhausted.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};

use crate::process::{HelperKind, ProcessControl};
use crate::settings::GlobalSettings;
use crate::stats::SharedStats;

/// Default cadence of the health check
pub const HEALTH_INTERVAL: Duration = Duration::from_secs(5);

/// Timeout of the SOCKS port probe
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Commands the health monitor sends to the state machine
#[derive(Debug, Clone)]
pub enum SupervisorCommand {
    /// Restart the helper processes, leaving routes/DNS/firewall in place
    FastRestart { reason: String },
    /// Tear the session down; `error` carries the message for the Error state
    Disconnect { error: Option<String> },
}

/// Per-session restart bookkeeping shared between monitor and state machine
#[derive(Default)]
pub struct RestartBudget {
    restarting: AtomicBool,
    count: AtomicU32,
    last_restart: std::sync::Mutex<Option<Instant>>,
}

impl RestartBudget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an automatic restart is currently allowed
    pub fn permits(&self, settings: &GlobalSettings) -> bool {
        let count_ok = settings.max_auto_restarts == 0
            || self.count.load(Ordering::Relaxed) < settings.max_auto_restarts;
        let cooldown_ok = self
            .last_restart
            .lock()
            .unwrap()
            .map_or(true, |at| {
                at.elapsed() >= Duration::from_secs(settings.restart_cooldown_seconds)
            });
        count_ok && cooldown_ok
    }

    /// Count a restart against the budget
    pub fn record(&self) -> u32 {
        *self.last_restart.lock().unwrap() = Some(Instant::now());
        self.count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Restarts performed this session
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    /// Reset for a fresh session
    pub fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        *self.last_restart.lock().unwrap() = None;
        self.restarting.store(false, Ordering::Relaxed);
    }

    pub fn set_restarting(&self, value: bool) {
        self.restarting.store(value, Ordering::Relaxed);
    }

    /// Claim the restart-in-progress flag; only the caller that flips it
    /// may request the restart, so concurrent detectors cannot double-fire.
    pub fn try_begin_restart(&self) -> bool {
        self.restarting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_restarting(&self) -> bool {
        self.restarting.load(Ordering::Relaxed)
    }
}

/// Parse a tunnel-client latency line
///
/// Matches `... pong from <ipv4> <value><ms|s> ...` and normalizes the value
/// to milliseconds.
pub fn parse_pong_latency(line: &str) -> Option<u64> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let pos = tokens
        .windows(2)
        .position(|w| w[0] == "pong" && w[1] == "from")?;
    let ip = tokens.get(pos + 2)?;
    ip.parse::<Ipv4Addr>().ok()?;

    let value = tokens.get(pos + 3)?;
    if let Some(ms) = value.strip_suffix("ms") {
        let ms: f64 = ms.parse().ok()?;
        Some(ms.round() as u64)
    } else if let Some(secs) = value.strip_suffix('s') {
        let secs: f64 = secs.parse().ok()?;
        Some((secs * 1000.0).round() as u64)
    } else {
        None
    }
}

/// Fold a latency sample into the session statistics
pub async fn ingest_latency(stats: &SharedStats, settings: &GlobalSettings, latency_ms: u64) {
    let threshold = settings.latency_threshold_ms;
    let mut stats = stats.write().await;
    stats.latency_ms = Some(latency_ms);

    if latency_ms > threshold {
        log::warn!(
            "Tunnel latency {} ms exceeds threshold {} ms",
            latency_ms,
            threshold
        );
    }
    if latency_ms * 2 > threshold {
        stats.high_latency_count += 1;
        stats.degraded = true;
    } else {
        stats.high_latency_count = 0;
        stats.degraded = false;
    }
}

/// Periodic health check task
pub struct HealthMonitor {
    pub procs: Arc<dyn ProcessControl>,
    pub socks_port: u16,
    pub settings: GlobalSettings,
    pub stats: SharedStats,
    pub budget: Arc<RestartBudget>,
    pub cmd_tx: mpsc::UnboundedSender<SupervisorCommand>,
    pub shutdown_rx: broadcast::Receiver<()>,
    pub interval: Duration,
    pub probe_timeout: Duration,
}

impl HealthMonitor {
    /// Run until shutdown
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    log::debug!("Health monitor shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    self.check().await;
                }
            }
        }
    }

    async fn check(&self) {
        if self.budget.is_restarting() {
            return;
        }

        for kind in [HelperKind::TunnelClient, HelperKind::TunRouter] {
            if !self.procs.is_alive(kind).await {
                self.escalate(format!("{} is no longer running", kind), None);
                return;
            }
        }

        let probe: std::net::SocketAddr = (Ipv4Addr::LOCALHOST, self.socks_port).into();
        let reachable = matches!(
            tokio::time::timeout(self.probe_timeout, TcpStream::connect(probe)).await,
            Ok(Ok(_))
        );
        if !reachable {
            self.escalate(format!("SOCKS proxy {} is unreachable", probe), None);
            return;
        }

        let high_count = self.stats.read().await.high_latency_count;
        if high_count >= self.settings.high_latency_count_threshold {
            self.escalate(
                format!("{} consecutive high-latency samples", high_count),
                Some(format!(
                    "tunnel latency stayed above {} ms",
                    self.settings.latency_threshold_ms / 2
                )),
            );
        }
    }

    /// Request a fast restart, or a disconnect when the budget is spent
    fn escalate(&self, reason: String, error_on_exhaust: Option<String>) {
        if self.budget.permits(&self.settings) {
            if !self.budget.try_begin_restart() {
                // Another detector already claimed this restart
                return;
            }
            log::warn!("Health check failed ({}), requesting fast restart", reason);
            let _ = self.cmd_tx.send(SupervisorCommand::FastRestart { reason });
        } else {
            log::error!(
                "Health check failed ({}) with restart budget exhausted, disconnecting",
                reason
            );
            let _ = self.cmd_tx.send(SupervisorCommand::Disconnect {
                error: error_on_exhaust,
            });
        }
    }
}
