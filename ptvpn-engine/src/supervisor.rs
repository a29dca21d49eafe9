//! Connection state machine
//!
//! Sequences every step of connect, disconnect, fast restart, and config
//! switch. System mutations are recorded in the recovery journal *before*
//! they are applied, so an abort at any point can be undone — by the cleanup
//! path of this run, or by `recover` on the next startup.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ipnet::Ipv4Net;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use uuid::Uuid;

use ptun_dns::{DnsForwarder, ForwarderConfig};
use ptun_os::firewall::OWNED_RULE_PREFIX;
use ptun_os::{OsHandle, RouteEntry};

use crate::error::{Error, Result};
use crate::event::{ConnectionState, EventHandler, VpnEvent};
use crate::health::{
    ingest_latency, parse_pong_latency, HealthMonitor, RestartBudget, SupervisorCommand,
    HEALTH_INTERVAL, PROBE_TIMEOUT,
};
use crate::journal::{JournalStore, RecoveryState};
use crate::process::{HelperKind, ProcessControl, ProcessEvent};
use crate::settings::{DnsMode, GlobalSettings, VpnConfiguration};
use crate::stats::{shared_stats, ConnectionStats, SharedStats};
use crate::store::ConfigStore;
use crate::traffic::{TrafficPoller, TRAFFIC_INTERVAL};

/// Static address of the TUN adapter; the 198.18.0.0/24 block is reserved
/// for the product's private TUN link
pub const TUN_ADDRESS: Ipv4Addr = Ipv4Addr::new(198, 18, 0, 2);
/// Gateway side of the TUN link
pub const TUN_GATEWAY: Ipv4Addr = Ipv4Addr::new(198, 18, 0, 1);
/// Prefix of the TUN link
pub const TUN_PREFIX: u8 = 24;
/// Broadcast address of the TUN link, pinned to the physical path
pub const TUN_BROADCAST: Ipv4Addr = Ipv4Addr::new(198, 18, 0, 255);
/// Name the wintun driver gives the adapter
pub const TUN_DEVICE: &str = "wintun";

/// Destinations that must never enter the tunnel
const PINNED_PHYSICAL: [(Ipv4Addr, u8); 4] = [
    (Ipv4Addr::new(255, 255, 255, 255), 32),
    (Ipv4Addr::new(224, 0, 0, 0), 4),
    (Ipv4Addr::new(169, 254, 0, 0), 16),
    (TUN_BROADCAST, 32),
];

/// Fixed waits and poll cadences of the connect/restart sequences
///
/// Production defaults follow the driver/helper initialization latencies;
/// tests shrink everything to milliseconds.
#[derive(Debug, Clone)]
pub struct Timing {
    /// Total wait for the SOCKS port after starting the tunnel client
    pub socks_wait: Duration,
    /// Poll interval while waiting for the SOCKS port
    pub socks_poll: Duration,
    /// Settle sleep after the SOCKS port accepts
    pub client_settle: Duration,
    /// Grace sleep after starting the router
    pub router_grace: Duration,
    /// Poll interval while waiting for the TUN interface
    pub tun_poll: Duration,
    /// Number of TUN polls before giving up
    pub tun_polls: u32,
    /// Pause between stop and start during a fast restart
    pub restart_pause: Duration,
    /// SOCKS wait during a fast restart
    pub restart_socks_wait: Duration,
    /// Settle sleep after the client restarts
    pub restart_client_settle: Duration,
    /// Settle sleep after the router restarts
    pub restart_router_settle: Duration,
    /// Pause between disconnect and connect during a config switch
    pub switch_pause: Duration,
    /// Health monitor cadence
    pub health_interval: Duration,
    /// SOCKS probe timeout of the health monitor
    pub probe_timeout: Duration,
    /// Traffic poller cadence
    pub traffic_interval: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            socks_wait: Duration::from_secs(15),
            socks_poll: Duration::from_millis(200),
            client_settle: Duration::from_secs(1),
            router_grace: Duration::from_secs(2),
            tun_poll: Duration::from_secs(1),
            tun_polls: 5,
            restart_pause: Duration::from_secs(1),
            restart_socks_wait: Duration::from_secs(10),
            restart_client_settle: Duration::from_millis(500),
            restart_router_settle: Duration::from_secs(1),
            switch_pause: Duration::from_millis(500),
            health_interval: HEALTH_INTERVAL,
            probe_timeout: PROBE_TIMEOUT,
            traffic_interval: TRAFFIC_INTERVAL,
        }
    }
}

impl Timing {
    /// Millisecond-scale timing for tests
    pub fn accelerated() -> Self {
        Self {
            socks_wait: Duration::from_millis(400),
            socks_poll: Duration::from_millis(20),
            client_settle: Duration::from_millis(10),
            router_grace: Duration::from_millis(10),
            tun_poll: Duration::from_millis(20),
            tun_polls: 3,
            restart_pause: Duration::from_millis(10),
            restart_socks_wait: Duration::from_millis(400),
            restart_client_settle: Duration::from_millis(10),
            restart_router_settle: Duration::from_millis(10),
            switch_pause: Duration::from_millis(10),
            health_interval: Duration::from_millis(50),
            probe_timeout: Duration::from_millis(200),
            traffic_interval: Duration::from_millis(50),
        }
    }
}

/// Supervisor construction options
pub struct SupervisorOptions {
    /// Refuse to connect without administrative privileges
    pub require_elevation: bool,
    /// Preferred DNS forwarder listen port
    pub dns_listen_port: u16,
    /// UDP fallback port of the DNS forwarder
    pub dns_fallback_port: u16,
    /// Sequence timing
    pub timing: Timing,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            require_elevation: true,
            dns_listen_port: 53,
            dns_fallback_port: 5353,
            timing: Timing::default(),
        }
    }
}

/// Resources owned by one established session
struct Session {
    /// Stops the health monitor, traffic poller, and DNS forwarder
    shutdown_tx: broadcast::Sender<()>,
    config: VpnConfiguration,
    settings: GlobalSettings,
}

/// The connection supervisor
pub struct VpnSupervisor {
    os: OsHandle,
    store: Arc<ConfigStore>,
    journal: Arc<JournalStore>,
    procs: Arc<dyn ProcessControl>,
    handler: Arc<dyn EventHandler>,
    options: SupervisorOptions,
    state: RwLock<ConnectionState>,
    stats: SharedStats,
    budget: Arc<RestartBudget>,
    /// Serializes transitions; at most one is ever in flight
    transition: Mutex<()>,
    session: Mutex<Option<Session>>,
    cmd_tx: mpsc::UnboundedSender<SupervisorCommand>,
}

impl VpnSupervisor {
    /// Build the supervisor and arm its control loop and process-event pump
    pub fn new(
        os: OsHandle,
        store: Arc<ConfigStore>,
        journal: Arc<JournalStore>,
        procs: Arc<dyn ProcessControl>,
        process_events: mpsc::UnboundedReceiver<ProcessEvent>,
        handler: Arc<dyn EventHandler>,
        options: SupervisorOptions,
    ) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(Self {
            os,
            store,
            journal,
            procs,
            handler,
            options,
            state: RwLock::new(ConnectionState::Disconnected),
            stats: shared_stats(),
            budget: Arc::new(RestartBudget::new()),
            transition: Mutex::new(()),
            session: Mutex::new(None),
            cmd_tx,
        });
        supervisor.clone().spawn_control_loop(cmd_rx);
        supervisor.clone().spawn_event_pump(process_events);
        supervisor
    }

    /// Current state
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Snapshot of the session statistics
    pub async fn stats(&self) -> ConnectionStats {
        self.stats.read().await.clone()
    }

    /// Automatic restarts performed this session
    pub fn restart_count(&self) -> u32 {
        self.budget.count()
    }

    /// Handle used by the crash handler and tests to inject commands
    pub fn command_sender(&self) -> mpsc::UnboundedSender<SupervisorCommand> {
        self.cmd_tx.clone()
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Run the connect sequence; legal from `Disconnected` and `Error`
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.transition.lock().await;
        let from = self.state().await;
        if !from.can_connect() {
            return Err(Error::AlreadyInState {
                state: from,
                action: "connect",
            });
        }

        self.budget.reset();
        self.set_state(from, ConnectionState::Connecting, "starting connection", None)
            .await;

        match self.run_connect_sequence().await {
            Ok(session) => {
                *self.session.lock().await = Some(session);
                self.set_state(
                    ConnectionState::Connecting,
                    ConnectionState::Connected,
                    "tunnel established",
                    None,
                )
                .await;
                Ok(())
            }
            Err(e) => {
                log::error!("Connect failed: {}", e);
                self.run_cleanup().await;
                self.set_state(
                    ConnectionState::Connecting,
                    ConnectionState::Error,
                    "connect failed",
                    Some(e.to_string()),
                )
                .await;
                Err(e)
            }
        }
    }

    /// Run the disconnect sequence; legal from any state except
    /// `Disconnected` and `Disconnecting`
    pub async fn disconnect(&self) -> Result<()> {
        self.disconnect_with(None).await
    }

    async fn disconnect_with(&self, error: Option<String>) -> Result<()> {
        let _guard = self.transition.lock().await;
        let from = self.state().await;
        if !from.can_disconnect() {
            return Err(Error::AlreadyInState {
                state: from,
                action: "disconnect",
            });
        }

        self.set_state(from, ConnectionState::Disconnecting, "tearing down", None)
            .await;
        self.run_cleanup().await;

        match error {
            Some(message) => {
                self.set_state(
                    ConnectionState::Disconnecting,
                    ConnectionState::Error,
                    "session ended",
                    Some(message),
                )
                .await;
            }
            None => {
                self.set_state(
                    ConnectionState::Disconnecting,
                    ConnectionState::Disconnected,
                    "disconnected",
                    None,
                )
                .await;
            }
        }
        Ok(())
    }

    /// Switch to another stored configuration
    ///
    /// While connected: disconnect, pause, select, reconnect. When the
    /// reconnect fails the previous selection is restored.
    pub async fn switch_config(&self, id: Uuid) -> Result<()> {
        let previous = self.store.selected().map(|r| r.id);

        if self.state().await != ConnectionState::Connected {
            return self.store.select(id);
        }

        self.disconnect().await?;
        tokio::time::sleep(self.options.timing.switch_pause).await;
        self.store.select(id)?;

        if let Err(e) = self.connect().await {
            if let Some(previous) = previous {
                if let Err(restore) = self.store.select(previous) {
                    log::warn!("Failed to restore previous selection: {}", restore);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Bounded emergency cleanup for the crash path
    ///
    /// Runs the full teardown with a hard cap so a wedged OS call cannot
    /// keep a crashing process alive.
    pub async fn emergency_shutdown(&self, cap: Duration) {
        let result = tokio::time::timeout(cap, async {
            self.run_cleanup().await;
            *self.state.write().await = ConnectionState::Disconnected;
        })
        .await;
        if result.is_err() {
            log::error!("Emergency cleanup exceeded {:?}, forcing exit", cap);
        }
    }

    // ========================================================================
    // Connect sequence
    // ========================================================================

    async fn run_connect_sequence(&self) -> Result<Session> {
        let timing = &self.options.timing;

        // Config and settings snapshots; the session never re-reads them
        let record = self
            .store
            .selected()
            .ok_or_else(|| Error::ConfigInvalid(vec!["no configuration selected".into()]))?;
        let config = record.configuration;
        config.validate()?;
        let settings = self.store.global_settings();
        settings.validate()?;

        if self.options.require_elevation && !ptun_os::elevation::is_elevated() {
            return Err(Error::NotElevated);
        }
        self.procs.verify_binaries()?;

        // Resolve before any mutation; only the first IPv4 is used
        let server_ip = resolve_first_ipv4(&config.server_address).await?;
        log::info!("Server {} resolved to {}", config.server_address, server_ip);

        let (orig_gateway, orig_if) = self
            .os
            .routing
            .find_default_route()
            .await
            .map_err(|_| Error::DefaultGatewayUnknown)?;
        log::info!("Physical default: via {} dev {}", orig_gateway, orig_if);

        let dns_snapshot = self.os.dns.snapshot_all().await?;

        // Journal before the first mutation so an abort is recoverable
        self.journal.save(&RecoveryState::for_session(
            orig_gateway,
            orig_if,
            dns_snapshot,
        ))?;

        // Tunnel client first: everything else depends on its SOCKS port
        self.procs
            .start_tunnel_client(
                &config.server_address,
                config.local_socks_port,
                &config.server_key,
                &settings,
            )
            .await?;
        self.wait_for_socks(config.local_socks_port, timing.socks_wait)
            .await?;
        tokio::time::sleep(timing.client_settle).await;

        self.procs
            .start_router(config.local_socks_port, settings.mtu)
            .await?;
        tokio::time::sleep(timing.router_grace).await;
        let tun_if = self.wait_for_tun().await?;
        log::info!("TUN interface up: index {}", tun_if);

        // Address the TUN statically, no gateway on the adapter itself
        self.os
            .routing
            .set_interface_address(tun_if, TUN_ADDRESS, TUN_PREFIX)
            .await?;

        // Pin tunnel-carrier traffic to the physical path first
        self.add_journaled_route(RouteEntry::host(server_ip, orig_gateway, orig_if, 1))
            .await?;

        for subnet in &settings.bypass_subnets {
            self.add_journaled_route(RouteEntry::new(
                subnet.network(),
                subnet.prefix_len(),
                orig_gateway,
                orig_if,
                1,
            ))
            .await?;
        }
        self.add_journaled_route(RouteEntry::host(
            Ipv4Addr::LOCALHOST,
            orig_gateway,
            orig_if,
            1,
        ))
        .await?;

        self.os.routing.set_interface_metric(tun_if, 1).await?;

        for (dest, prefix) in PINNED_PHYSICAL {
            self.add_journaled_route(RouteEntry::new(dest, prefix, orig_gateway, orig_if, 1))
                .await?;
        }

        // Finally make the TUN the default path
        self.add_journaled_route(RouteEntry::new(
            Ipv4Addr::UNSPECIFIED,
            0,
            TUN_GATEWAY,
            tun_if,
            1,
        ))
        .await?;

        // UDP cannot traverse the tunnel; blackhole it, keep loopback DNS open
        let tun_subnet = Ipv4Net::new(Ipv4Addr::new(198, 18, 0, 0), TUN_PREFIX).unwrap();
        self.os.firewall.add_block_outbound_udp(tun_subnet).await?;
        self.os
            .firewall
            .add_allow_outbound_udp(Ipv4Addr::LOCALHOST)
            .await?;

        let (shutdown_tx, _) = broadcast::channel(8);

        if settings.dns_mode == DnsMode::Tunnel {
            self.start_dns_forwarder(&config, &settings, &shutdown_tx)
                .await?;
        }

        *self.stats.write().await = ConnectionStats::for_new_session();

        let monitor = HealthMonitor {
            procs: self.procs.clone(),
            socks_port: config.local_socks_port,
            settings: settings.clone(),
            stats: self.stats.clone(),
            budget: self.budget.clone(),
            cmd_tx: self.cmd_tx.clone(),
            shutdown_rx: shutdown_tx.subscribe(),
            interval: timing.health_interval,
            probe_timeout: timing.probe_timeout,
        };
        tokio::spawn(monitor.run());

        let poller = TrafficPoller {
            interfaces: self.os.interfaces.clone(),
            tun_if,
            phys_if: orig_if,
            stats: self.stats.clone(),
            handler: self.handler.clone(),
            shutdown_rx: shutdown_tx.subscribe(),
            interval: timing.traffic_interval,
        };
        tokio::spawn(poller.run());

        Ok(Session {
            shutdown_tx,
            config,
            settings,
        })
    }

    /// Start the forwarder and point every active adapter at loopback
    async fn start_dns_forwarder(
        &self,
        config: &VpnConfiguration,
        settings: &GlobalSettings,
        shutdown_tx: &broadcast::Sender<()>,
    ) -> Result<()> {
        let forwarder = DnsForwarder::bind(
            ForwarderConfig {
                socks_port: config.local_socks_port,
                upstreams: settings.dns_servers.clone(),
                listen_port: self.options.dns_listen_port,
                fallback_port: self.options.dns_fallback_port,
            },
            shutdown_tx.subscribe(),
        )
        .await?;
        tokio::spawn(forwarder.run());

        // One uncooperative adapter must not block the rest
        let adapters = match self.os.interfaces.list_active_adapters().await {
            Ok(adapters) => adapters,
            Err(e) => {
                log::warn!("Adapter enumeration failed: {}", e);
                Vec::new()
            }
        };
        for adapter in adapters {
            if let Err(e) = self
                .os
                .dns
                .set_servers(&adapter, &[Ipv4Addr::LOCALHOST])
                .await
            {
                log::warn!("Failed to point '{}' at loopback DNS: {}", adapter, e);
            }
        }
        if let Err(e) = self.os.dns.flush_cache().await {
            log::debug!("Resolver flush failed: {}", e);
        }
        Ok(())
    }

    /// Record the route in the journal, then add it to the table
    async fn add_journaled_route(&self, route: RouteEntry) -> Result<()> {
        self.journal.append_route(&route)?;
        self.os.routing.add_route(&route).await?;
        Ok(())
    }

    /// Poll until the local SOCKS port accepts a TCP connection
    async fn wait_for_socks(&self, port: u16, wait: Duration) -> Result<()> {
        let deadline = Instant::now() + wait;
        let addr: std::net::SocketAddr = (Ipv4Addr::LOCALHOST, port).into();
        loop {
            let poll = self.options.timing.socks_poll;
            if let Ok(Ok(_)) = tokio::time::timeout(poll.max(Duration::from_millis(50)), TcpStream::connect(addr)).await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::SocksPortTimeout);
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Poll until the wintun interface registers
    async fn wait_for_tun(&self) -> Result<u32> {
        for attempt in 0..self.options.timing.tun_polls {
            match self.os.interfaces.find_interface_index(TUN_DEVICE).await {
                Ok(index) => return Ok(index),
                Err(e) => {
                    log::debug!("TUN not registered yet (attempt {}): {}", attempt + 1, e);
                    tokio::time::sleep(self.options.timing.tun_poll).await;
                }
            }
        }
        Err(Error::TunInterfaceMissing)
    }

    // ========================================================================
    // Cleanup (never throws; every step is independent)
    // ========================================================================

    async fn run_cleanup(&self) {
        // Stop the health monitor, traffic poller, and DNS forwarder
        let session = self.session.lock().await.take();
        if let Some(ref session) = session {
            let _ = session.shutdown_tx.send(());
        }

        // Restore DNS and delete routes from the journal
        match self.journal.load() {
            Ok(Some(state)) => {
                for (adapter, servers) in &state.original_dns_settings {
                    let result = if servers.is_empty() {
                        self.os.dns.reset_to_dhcp(adapter).await
                    } else {
                        self.os.dns.set_servers(adapter, servers).await
                    };
                    if let Err(e) = result {
                        log::warn!("Failed to restore DNS on '{}': {}", adapter, e);
                    }
                }
                if let Err(e) = self.os.dns.flush_cache().await {
                    log::debug!("Resolver flush failed: {}", e);
                }

                for route in state.added_routes.iter().rev() {
                    if let Err(e) = self.os.routing.delete_route(route).await {
                        log::warn!("Failed to delete {}: {}", route, e);
                    }
                }
            }
            Ok(None) => {}
            Err(e) => log::warn!("Journal read failed during cleanup: {}", e),
        }

        // Remove every owned firewall rule, including orphans
        match self.os.firewall.list_rules_with_prefix(OWNED_RULE_PREFIX).await {
            Ok(rules) => {
                for rule in rules {
                    if let Err(e) = self.os.firewall.remove_rule(&rule).await {
                        log::warn!("Failed to remove firewall rule {}: {}", rule, e);
                    }
                }
            }
            Err(e) => log::warn!("Firewall rule scan failed: {}", e),
        }

        self.procs.stop_all().await;

        if let Err(e) = self.journal.clear() {
            log::warn!("Failed to clear journal: {}", e);
        }

        self.budget.set_restarting(false);
    }

    // ========================================================================
    // Fast restart
    // ========================================================================

    /// Restart only the helper processes
    ///
    /// Routes, TUN addressing, firewall rules, and DNS configuration stay in
    /// place; removing and recreating the TUN would drop all traffic.
    async fn fast_restart(&self, reason: &str) -> Result<()> {
        let (config, settings) = {
            let session = self.session.lock().await;
            let session = session.as_ref().ok_or(Error::AlreadyInState {
                state: ConnectionState::Disconnected,
                action: "fast-restart",
            })?;
            (session.config.clone(), session.settings.clone())
        };

        self.budget.set_restarting(true);
        let count = self.budget.record();
        log::warn!("Fast restart #{}: {}", count, reason);
        self.handler
            .on_event(VpnEvent::FastRestart {
                in_progress: true,
                count,
            })
            .await;

        let timing = &self.options.timing;
        let result = async {
            self.procs.stop_all().await;
            tokio::time::sleep(timing.restart_pause).await;

            self.procs
                .start_tunnel_client(
                    &config.server_address,
                    config.local_socks_port,
                    &config.server_key,
                    &settings,
                )
                .await?;
            self.wait_for_socks(config.local_socks_port, timing.restart_socks_wait)
                .await?;
            tokio::time::sleep(timing.restart_client_settle).await;

            self.procs
                .start_router(config.local_socks_port, settings.mtu)
                .await?;
            tokio::time::sleep(timing.restart_router_settle).await;
            Ok(())
        }
        .await;

        self.stats.write().await.reset_latency();
        self.budget.set_restarting(false);
        self.handler
            .on_event(VpnEvent::FastRestart {
                in_progress: false,
                count,
            })
            .await;
        result
    }

    // ========================================================================
    // Background plumbing
    // ========================================================================

    /// Drain commands from the health monitor and event pump
    fn spawn_control_loop(self: Arc<Self>, mut cmd_rx: mpsc::UnboundedReceiver<SupervisorCommand>) {
        tokio::spawn(async move {
            while let Some(command) = cmd_rx.recv().await {
                match command {
                    SupervisorCommand::FastRestart { reason } => {
                        if self.state().await != ConnectionState::Connected {
                            self.budget.set_restarting(false);
                            continue;
                        }
                        if let Err(e) = self.fast_restart(&reason).await {
                            log::error!("Fast restart failed ({}), disconnecting", e);
                            if let Err(e) = self.disconnect_with(Some(e.to_string())).await {
                                log::debug!("Disconnect after failed restart: {}", e);
                            }
                        }
                    }
                    SupervisorCommand::Disconnect { error } => {
                        if let Err(e) = self.disconnect_with(error).await {
                            log::debug!("Commanded disconnect skipped: {}", e);
                        }
                    }
                }
            }
        });
    }

    /// Route helper output and exit notifications
    fn spawn_event_pump(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<ProcessEvent>) {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ProcessEvent::Line { kind, line } => {
                        if kind == HelperKind::TunnelClient {
                            if let Some(latency_ms) = parse_pong_latency(&line) {
                                let settings = self
                                    .session
                                    .lock()
                                    .await
                                    .as_ref()
                                    .map(|s| s.settings.clone());
                                if let Some(settings) = settings {
                                    ingest_latency(&self.stats, &settings, latency_ms).await;
                                }
                            }
                        }
                        self.handler
                            .on_event(VpnEvent::ProcessOutput {
                                name: kind.display(),
                                line,
                            })
                            .await;
                    }
                    ProcessEvent::Exited { kind, code } => {
                        log::warn!("{} exited with code {:?}", kind, code);
                        if self.state().await != ConnectionState::Connected
                            || self.budget.is_restarting()
                        {
                            continue;
                        }
                        let settings = self
                            .session
                            .lock()
                            .await
                            .as_ref()
                            .map(|s| s.settings.clone());
                        let Some(settings) = settings else { continue };
                        if self.budget.permits(&settings) {
                            if !self.budget.try_begin_restart() {
                                continue;
                            }
                            let _ = self.cmd_tx.send(SupervisorCommand::FastRestart {
                                reason: format!("{} exited with code {:?}", kind, code),
                            });
                        } else {
                            let _ = self
                                .cmd_tx
                                .send(SupervisorCommand::Disconnect { error: None });
                        }
                    }
                }
            }
        });
    }

    async fn set_state(
        &self,
        from: ConnectionState,
        to: ConnectionState,
        message: &str,
        error: Option<String>,
    ) {
        *self.state.write().await = to;
        self.handler
            .on_event(VpnEvent::StateChanged {
                from,
                to,
                message: message.to_string(),
                error,
            })
            .await;
    }
}

/// Resolve a host to its first IPv4 address; literals short-circuit
async fn resolve_first_ipv4(host: &str) -> Result<Ipv4Addr> {
    if let Ok(literal) = host.parse::<Ipv4Addr>() {
        return Ok(literal);
    }
    let addrs = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|_| Error::DnsResolutionFailed(host.to_string()))?;
    addrs
        .filter_map(|addr| match addr.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| Error::DnsResolutionFailed(host.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_literal_short_circuits() {
        assert_eq!(
            resolve_first_ipv4("203.0.113.9").await.unwrap(),
            Ipv4Addr::new(203, 0, 113, 9)
        );
    }

    #[tokio::test]
    async fn test_resolve_failure_maps_to_dns_error() {
        let err = resolve_first_ipv4("definitely-not-a-real-host.invalid")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DnsResolutionFailed(_)));
    }

    #[test]
    fn test_default_timing_matches_contract() {
        let timing = Timing::default();
        assert_eq!(timing.socks_wait, Duration::from_secs(15));
        assert_eq!(timing.router_grace, Duration::from_secs(2));
        assert_eq!(timing.tun_polls, 5);
        assert_eq!(timing.restart_socks_wait, Duration::from_secs(10));
        assert_eq!(timing.switch_pause, Duration::from_millis(500));
    }
}
