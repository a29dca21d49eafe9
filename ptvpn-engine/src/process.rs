//! Helper process supervision
//!
//! Owns at most one instance each of the two external executables: the ICMP
//! tunnel client (`pingtunnel`) exposing a local SOCKS5 proxy, and the
//! userspace router (`tun2socks`) binding the wintun adapter to that proxy.
//! Captured output lines and exit notifications are delivered on one event
//! channel; the state machine and health monitor consume them.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};

use ptun_os::{spawn_captured, terminate_tree};

use crate::error::{Error, Result};
use crate::settings::{EncryptionMode, GlobalSettings};

/// Bounded wait applied when stopping a helper
const STOP_WAIT: Duration = Duration::from_secs(5);

/// Poll interval of the exit monitor
const EXIT_POLL: Duration = Duration::from_millis(500);

/// The two supervised executables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HelperKind {
    /// ICMP tunnel client exposing a local SOCKS5 proxy
    TunnelClient,
    /// SOCKS5-to-TUN userspace router
    TunRouter,
}

impl HelperKind {
    /// Display identity used in events and logs
    pub fn display(&self) -> &'static str {
        match self {
            HelperKind::TunnelClient => "pingtunnel-client",
            HelperKind::TunRouter => "tun2socks",
        }
    }

    /// Image file name of the executable
    pub fn image_name(&self) -> &'static str {
        #[cfg(windows)]
        match self {
            HelperKind::TunnelClient => "pingtunnel.exe",
            HelperKind::TunRouter => "tun2socks.exe",
        }
        #[cfg(not(windows))]
        match self {
            HelperKind::TunnelClient => "pingtunnel",
            HelperKind::TunRouter => "tun2socks",
        }
    }
}

impl std::fmt::Display for HelperKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display())
    }
}

/// Events emitted for supervised processes
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    /// A line arrived on stdout or stderr
    Line { kind: HelperKind, line: String },
    /// The process exited on its own
    Exited {
        kind: HelperKind,
        code: Option<i32>,
    },
}

/// Abstraction over helper process management
///
/// The production implementation spawns the real executables; tests
/// substitute [`FakeProcessControl`].
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Verify both helper binaries are present
    fn verify_binaries(&self) -> Result<()>;

    /// Start the ICMP tunnel client
    async fn start_tunnel_client(
        &self,
        server: &str,
        socks_port: u16,
        key: &str,
        settings: &GlobalSettings,
    ) -> Result<()>;

    /// Start the TUN router
    async fn start_router(&self, socks_port: u16, mtu: u32) -> Result<()>;

    /// Stop one helper, tree-kill plus bounded wait
    async fn stop(&self, kind: HelperKind);

    /// Stop both helpers, router first
    async fn stop_all(&self);

    /// Whether a helper is currently running
    async fn is_alive(&self, kind: HelperKind) -> bool;
}

/// Build the tunnel client argv
///
/// Exact contract: `-type client -l :<port> -s <server> -sock5 1`, then the
/// optional key and encryption arguments, then the log level. The server may
/// be a DNS name or a literal address.
pub fn build_client_args(
    server: &str,
    socks_port: u16,
    key: &str,
    settings: &GlobalSettings,
) -> Vec<String> {
    let mut args = vec![
        "-type".to_string(),
        "client".to_string(),
        "-l".to_string(),
        format!(":{}", socks_port),
        "-s".to_string(),
        server.to_string(),
        "-sock5".to_string(),
        "1".to_string(),
    ];
    if !key.is_empty() {
        args.push("-key".to_string());
        args.push(key.to_string());
    }
    if settings.encryption_mode != EncryptionMode::None {
        args.push("-encrypt".to_string());
        args.push(settings.encryption_mode.arg_value().to_string());
        args.push("-encrypt-key".to_string());
        args.push(settings.encryption_key.clone());
    }
    args.push("-loglevel".to_string());
    args.push("info".to_string());
    args
}

/// Build the TUN router argv
///
/// UDP forwarding is deliberately not enabled: the ICMP transport carries no
/// UDP ASSOCIATE, so UDP is blackholed on the tunnel interface instead.
pub fn build_router_args(socks_port: u16, mtu: u32) -> Vec<String> {
    vec![
        "-device".to_string(),
        "wintun".to_string(),
        "-proxy".to_string(),
        format!("socks5://127.0.0.1:{}", socks_port),
        "-mtu".to_string(),
        mtu.to_string(),
        "-loglevel".to_string(),
        "info".to_string(),
    ]
}

/// Render argv for logging with secret values masked
pub fn redact_args(args: &[String]) -> String {
    let mut rendered = Vec::with_capacity(args.len());
    let mut mask_next = false;
    for arg in args {
        if mask_next {
            rendered.push("****".to_string());
            mask_next = false;
            continue;
        }
        if arg == "-key" || arg == "-encrypt-key" {
            mask_next = true;
        }
        rendered.push(arg.clone());
    }
    rendered.join(" ")
}

/// Production helper supervision
pub struct ProcessSupervisor {
    resource_dir: PathBuf,
    event_tx: mpsc::UnboundedSender<ProcessEvent>,
    children: Arc<Mutex<HashMap<HelperKind, (u64, Child)>>>,
    generation: std::sync::atomic::AtomicU64,
}

impl ProcessSupervisor {
    /// Create a supervisor for binaries under `resource_dir`
    pub fn new(resource_dir: impl Into<PathBuf>) -> (Arc<Self>, mpsc::UnboundedReceiver<ProcessEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                resource_dir: resource_dir.into(),
                event_tx,
                children: Arc::new(Mutex::new(HashMap::new())),
                generation: std::sync::atomic::AtomicU64::new(0),
            }),
            event_rx,
        )
    }

    /// Path of a helper binary
    pub fn helper_path(&self, kind: HelperKind) -> PathBuf {
        self.resource_dir.join(kind.image_name())
    }

    async fn spawn(&self, kind: HelperKind, args: Vec<String>) -> Result<()> {
        let path = self.helper_path(kind);
        if !path.exists() {
            return Err(Error::MissingBinary(path));
        }

        // Never two instances of the same helper
        self.stop(kind).await;

        log::info!("Starting {}: {}", kind, redact_args(&args));
        let mut child = spawn_captured(&path, &args)?;

        if let Some(stdout) = child.stdout.take() {
            self.pump_lines(kind, stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.pump_lines(kind, stderr);
        }

        let generation = self
            .generation
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            + 1;
        self.children.lock().await.insert(kind, (generation, child));
        self.monitor_exit(kind, generation);
        Ok(())
    }

    fn pump_lines(&self, kind: HelperKind, pipe: impl tokio::io::AsyncRead + Unpin + Send + 'static) {
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(pipe).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = event_tx.send(ProcessEvent::Line { kind, line });
            }
        });
    }

    /// Watch for a spontaneous exit of the child with this generation
    fn monitor_exit(&self, kind: HelperKind, generation: u64) {
        let children = self.children.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(EXIT_POLL).await;
                let mut map = children.lock().await;
                match map.get_mut(&kind) {
                    Some((gen, child)) if *gen == generation => match child.try_wait() {
                        Ok(Some(status)) => {
                            map.remove(&kind);
                            let _ = event_tx.send(ProcessEvent::Exited {
                                kind,
                                code: status.code(),
                            });
                            return;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            log::debug!("try_wait for {} failed: {}", kind, e);
                            return;
                        }
                    },
                    // Replaced or deliberately stopped
                    _ => return,
                }
            }
        });
    }
}

#[async_trait]
impl ProcessControl for ProcessSupervisor {
    fn verify_binaries(&self) -> Result<()> {
        for kind in [HelperKind::TunnelClient, HelperKind::TunRouter] {
            let path = self.helper_path(kind);
            if !path.exists() {
                return Err(Error::MissingBinary(path));
            }
        }
        Ok(())
    }

    async fn start_tunnel_client(
        &self,
        server: &str,
        socks_port: u16,
        key: &str,
        settings: &GlobalSettings,
    ) -> Result<()> {
        self.spawn(
            HelperKind::TunnelClient,
            build_client_args(server, socks_port, key, settings),
        )
        .await
    }

    async fn start_router(&self, socks_port: u16, mtu: u32) -> Result<()> {
        self.spawn(HelperKind::TunRouter, build_router_args(socks_port, mtu))
            .await
    }

    async fn stop(&self, kind: HelperKind) {
        let entry = self.children.lock().await.remove(&kind);
        if let Some((_, mut child)) = entry {
            log::info!("Stopping {}", kind);
            if let Err(e) = terminate_tree(&mut child, STOP_WAIT).await {
                log::warn!("Failed to stop {}: {}", kind, e);
            }
        }
    }

    async fn stop_all(&self) {
        // Router first so the TUN adapter quiesces before its proxy is gone
        self.stop(HelperKind::TunRouter).await;
        self.stop(HelperKind::TunnelClient).await;
    }

    async fn is_alive(&self, kind: HelperKind) -> bool {
        let mut map = self.children.lock().await;
        match map.get_mut(&kind) {
            Some((_, child)) => match child.try_wait() {
                Ok(None) => true,
                _ => false,
            },
            None => false,
        }
    }
}

/// In-process stand-in for the helper executables, used by tests
///
/// Starting the tunnel client binds a real TCP listener on the requested
/// SOCKS port so the supervisor's port-reachability wait succeeds.
pub struct FakeProcessControl {
    event_tx: mpsc::UnboundedSender<ProcessEvent>,
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    client_listener: Option<tokio::net::TcpListener>,
    client_alive: bool,
    router_alive: bool,
    client_starts: u32,
    router_starts: u32,
    refuse_client_start: bool,
    refuse_socks_bind: bool,
}

impl FakeProcessControl {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ProcessEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                event_tx,
                state: Mutex::new(FakeState::default()),
            }),
            event_rx,
        )
    }

    /// Inject an output line, as if a helper had printed it
    pub fn inject_line(&self, kind: HelperKind, line: &str) {
        let _ = self.event_tx.send(ProcessEvent::Line {
            kind,
            line: line.to_string(),
        });
    }

    /// Simulate a spontaneous helper death
    pub async fn kill(&self, kind: HelperKind) {
        {
            let mut state = self.state.lock().await;
            match kind {
                HelperKind::TunnelClient => {
                    state.client_alive = false;
                    state.client_listener = None;
                }
                HelperKind::TunRouter => state.router_alive = false,
            }
        }
        let _ = self.event_tx.send(ProcessEvent::Exited { kind, code: Some(1) });
    }

    /// Make the next client start fail outright
    pub async fn set_refuse_client_start(&self, refuse: bool) {
        self.state.lock().await.refuse_client_start = refuse;
    }

    /// Start the client "successfully" but never open the SOCKS port
    pub async fn set_refuse_socks_bind(&self, refuse: bool) {
        self.state.lock().await.refuse_socks_bind = refuse;
    }

    /// How many times the tunnel client was started
    pub async fn client_starts(&self) -> u32 {
        self.state.lock().await.client_starts
    }

    /// How many times the router was started
    pub async fn router_starts(&self) -> u32 {
        self.state.lock().await.router_starts
    }
}

#[async_trait]
impl ProcessControl for FakeProcessControl {
    fn verify_binaries(&self) -> Result<()> {
        Ok(())
    }

    async fn start_tunnel_client(
        &self,
        _server: &str,
        socks_port: u16,
        _key: &str,
        _settings: &GlobalSettings,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.refuse_client_start {
            return Err(Error::HelperProcessExited {
                name: HelperKind::TunnelClient.display(),
                code: Some(1),
            });
        }
        state.client_starts += 1;
        state.client_alive = true;
        if !state.refuse_socks_bind {
            let listener =
                tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, socks_port))
                    .await
                    .map_err(|e| Error::SocksHandshakeFailed(e.to_string()))?;
            state.client_listener = Some(listener);
        }
        Ok(())
    }

    async fn start_router(&self, _socks_port: u16, _mtu: u32) -> Result<()> {
        let mut state = self.state.lock().await;
        state.router_starts += 1;
        state.router_alive = true;
        Ok(())
    }

    async fn stop(&self, kind: HelperKind) {
        let mut state = self.state.lock().await;
        match kind {
            HelperKind::TunnelClient => {
                state.client_alive = false;
                state.client_listener = None;
            }
            HelperKind::TunRouter => state.router_alive = false,
        }
    }

    async fn stop_all(&self) {
        self.stop(HelperKind::TunRouter).await;
        self.stop(HelperKind::TunnelClient).await;
    }

    async fn is_alive(&self, kind: HelperKind) -> bool {
        let state = self.state.lock().await;
        match kind {
            HelperKind::TunnelClient => state.client_alive,
            HelperKind::TunRouter => state.router_alive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_args_minimal() {
        let settings = GlobalSettings::default();
        let args = build_client_args("tunnel.example.net", 1080, "", &settings);
        assert_eq!(
            args,
            vec![
                "-type",
                "client",
                "-l",
                ":1080",
                "-s",
                "tunnel.example.net",
                "-sock5",
                "1",
                "-loglevel",
                "info",
            ]
        );
    }

    #[test]
    fn test_client_args_with_key_and_encryption() {
        let settings = GlobalSettings {
            encryption_mode: EncryptionMode::Chacha20,
            encryption_key: "enc-secret".into(),
            ..Default::default()
        };
        let args = build_client_args("203.0.113.9", 1081, "s3cret", &settings);

        let key_pos = args.iter().position(|a| a == "-key").unwrap();
        assert_eq!(args[key_pos + 1], "s3cret");
        let enc_pos = args.iter().position(|a| a == "-encrypt").unwrap();
        assert_eq!(args[enc_pos + 1], "chacha20");
        let enc_key_pos = args.iter().position(|a| a == "-encrypt-key").unwrap();
        assert_eq!(args[enc_key_pos + 1], "enc-secret");
        assert_eq!(args.last().unwrap(), "info");
    }

    #[test]
    fn test_router_args() {
        let args = build_router_args(1080, 1420);
        assert_eq!(
            args,
            vec![
                "-device",
                "wintun",
                "-proxy",
                "socks5://127.0.0.1:1080",
                "-mtu",
                "1420",
                "-loglevel",
                "info",
            ]
        );
        // UDP stays off
        assert!(!args.iter().any(|a| a.contains("udp")));
    }

    #[test]
    fn test_redaction_masks_secrets() {
        let settings = GlobalSettings {
            encryption_mode: EncryptionMode::Aes256,
            encryption_key: "enc-secret".into(),
            ..Default::default()
        };
        let args = build_client_args("srv", 1080, "s3cret", &settings);
        let rendered = redact_args(&args);
        assert!(!rendered.contains("s3cret"));
        assert!(!rendered.contains("enc-secret"));
        assert!(rendered.contains("-key ****"));
        assert!(rendered.contains("-encrypt-key ****"));
    }

    #[tokio::test]
    async fn test_fake_lifecycle() {
        let (fake, mut events) = FakeProcessControl::new();
        fake.start_tunnel_client("srv", 0, "", &GlobalSettings::default())
            .await
            .unwrap();
        fake.start_router(0, 1420).await.unwrap();
        assert!(fake.is_alive(HelperKind::TunnelClient).await);
        assert!(fake.is_alive(HelperKind::TunRouter).await);

        fake.kill(HelperKind::TunRouter).await;
        assert!(!fake.is_alive(HelperKind::TunRouter).await);
        match events.recv().await.unwrap() {
            ProcessEvent::Exited { kind, .. } => assert_eq!(kind, HelperKind::TunRouter),
            other => panic!("unexpected event: {:?}", other),
        }

        fake.stop_all().await;
        assert!(!fake.is_alive(HelperKind::TunnelClient).await);
    }

    #[test]
    fn test_missing_binary_error() {
        let (procs, _events) = ProcessSupervisor::new("/nonexistent/resource/dir");
        let err = procs.verify_binaries().unwrap_err();
        assert!(matches!(err, Error::MissingBinary(_)));
    }
}
