//! End-to-end supervisor tests against the in-memory OS bindings
//!
//! Every test drives the real state machine with a fake process layer (which
//! binds a live TCP listener for the SOCKS port) and asserts the system-state
//! invariants: routes, DNS, and firewall rules restored; the journal gone.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use ptun_os::mock::MockOs;
use ptun_os::OsHandle;
use ptvpn_engine::supervisor::{SupervisorOptions, Timing};
use ptvpn_engine::{
    ConfigStore, ConnectionState, Error, FakeProcessControl, HelperKind, JournalStore,
    LoggingEventHandler, ProcessControl, SupervisorCommand, VpnConfiguration, VpnSupervisor,
};

const SERVER_IP: &str = "198.51.100.7";
const ORIG_GATEWAY: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
const ORIG_IF: u32 = 7;
const TUN_IF: u32 = 23;

struct Harness {
    mock: Arc<MockOs>,
    procs: Arc<FakeProcessControl>,
    store: Arc<ConfigStore>,
    journal: Arc<JournalStore>,
    supervisor: Arc<VpnSupervisor>,
    _dir: tempfile::TempDir,
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    listener.local_addr().unwrap().port()
}

async fn harness(
    with_tun: bool,
    mutate_settings: impl FnOnce(&mut ptvpn_engine::GlobalSettings),
) -> Harness {
    let dir = tempfile::tempdir().unwrap();

    let mock = Arc::new(MockOs::new());
    mock.set_default_route(ORIG_GATEWAY, ORIG_IF);
    mock.add_adapter("Ethernet", ORIG_IF, vec![Ipv4Addr::new(9, 9, 9, 9)]);
    mock.add_adapter("Wi-Fi", 8, Vec::new());
    if with_tun {
        mock.add_adapter("wintun", TUN_IF, Vec::new());
    }

    let store = Arc::new(ConfigStore::open(dir.path().join("config")).unwrap());
    store
        .add(
            "primary",
            VpnConfiguration {
                server_address: SERVER_IP.into(),
                server_key: "s3cret".into(),
                local_socks_port: free_port(),
            },
        )
        .unwrap();
    store
        .update_global_settings(|settings| {
            settings.restart_cooldown_seconds = 0;
            mutate_settings(settings);
        })
        .unwrap();

    let journal = Arc::new(JournalStore::at(dir.path().join("state.json")));
    let (procs, events) = FakeProcessControl::new();

    let supervisor = VpnSupervisor::new(
        OsHandle::from_mock(mock.clone()),
        store.clone(),
        journal.clone(),
        procs.clone(),
        events,
        Arc::new(LoggingEventHandler),
        SupervisorOptions {
            require_elevation: false,
            dns_listen_port: 0,
            dns_fallback_port: 0,
            timing: Timing::accelerated(),
        },
    );

    Harness {
        mock,
        procs,
        store,
        journal,
        supervisor,
        _dir: dir,
    }
}

/// Poll until the condition passes or the deadline hits
macro_rules! eventually {
    ($what:expr, $cond:expr) => {{
        let mut satisfied = false;
        for _ in 0..100 {
            if $cond {
                satisfied = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if !satisfied {
            panic!("condition never became true: {}", $what);
        }
    }};
}

#[tokio::test]
async fn happy_path_restores_all_system_state() {
    let h = harness(true, |_| {}).await;

    let routes_before = h.mock.routes();
    let dns_before = h.mock.dns_state();

    h.supervisor.connect().await.unwrap();
    assert_eq!(h.supervisor.state().await, ConnectionState::Connected);

    // The exact route additions, in order
    let added: Vec<String> = h
        .mock
        .op_log()
        .into_iter()
        .filter(|op| op.starts_with("add_route "))
        .collect();
    let expected = [
        "198.51.100.7/32 via 192.168.1.1 dev 7 metric 1",
        "192.168.0.0/16 via 192.168.1.1 dev 7 metric 1",
        "10.0.0.0/8 via 192.168.1.1 dev 7 metric 1",
        "172.16.0.0/12 via 192.168.1.1 dev 7 metric 1",
        "127.0.0.1/32 via 192.168.1.1 dev 7 metric 1",
        "255.255.255.255/32 via 192.168.1.1 dev 7 metric 1",
        "224.0.0.0/4 via 192.168.1.1 dev 7 metric 1",
        "169.254.0.0/16 via 192.168.1.1 dev 7 metric 1",
        "198.18.0.255/32 via 192.168.1.1 dev 7 metric 1",
        "0.0.0.0/0 via 198.18.0.1 dev 23 metric 1",
    ];
    let expected: Vec<String> = expected.iter().map(|r| format!("add_route {}", r)).collect();
    assert_eq!(added, expected);

    // TUN addressing and metric
    assert_eq!(
        h.mock.address_of(TUN_IF),
        Some((Ipv4Addr::new(198, 18, 0, 2), 24))
    );
    assert_eq!(h.mock.metric_of(TUN_IF), Some(1));

    // Exactly the two owned firewall rules
    let rules = h.mock.firewall_rules();
    assert_eq!(rules.len(), 2);
    assert!(rules.iter().all(|r| r.starts_with("PingTunnelVPN_BlockUDP_")));

    // Tunnel DNS mode: every adapter points at loopback
    for servers in h.mock.dns_state().values() {
        assert_eq!(servers, &vec![Ipv4Addr::new(127, 0, 0, 1)]);
    }

    // Journal marks the live session
    assert!(h.journal.needs_recovery());

    h.supervisor.disconnect().await.unwrap();
    assert_eq!(h.supervisor.state().await, ConnectionState::Disconnected);

    // Invariants: system state equals the pre-session snapshot
    assert_eq!(h.mock.routes(), routes_before);
    assert_eq!(h.mock.dns_state(), dns_before);
    assert!(h.mock.firewall_rules().is_empty());
    assert!(!h.journal.path().exists());
    assert!(!h.procs.is_alive(HelperKind::TunnelClient).await);
    assert!(!h.procs.is_alive(HelperKind::TunRouter).await);
}

#[tokio::test]
async fn socks_timeout_leaves_no_trace() {
    let h = harness(true, |_| {}).await;
    h.procs.set_refuse_socks_bind(true).await;

    let err = h.supervisor.connect().await.unwrap_err();
    assert!(matches!(err, Error::SocksPortTimeout));
    assert_eq!(h.supervisor.state().await, ConnectionState::Error);

    assert!(h.mock.routes().is_empty());
    assert_eq!(
        h.mock.dns_state()["Ethernet"],
        vec![Ipv4Addr::new(9, 9, 9, 9)]
    );
    assert!(h.mock.firewall_rules().is_empty());
    assert!(!h.journal.path().exists());
}

#[tokio::test]
async fn missing_tun_aborts_and_kills_helpers() {
    let h = harness(false, |_| {}).await;

    let err = h.supervisor.connect().await.unwrap_err();
    assert!(matches!(err, Error::TunInterfaceMissing));
    assert_eq!(h.supervisor.state().await, ConnectionState::Error);

    assert!(h.mock.routes().is_empty());
    assert!(h.mock.firewall_rules().is_empty());
    assert!(!h.journal.path().exists());
    assert!(!h.procs.is_alive(HelperKind::TunnelClient).await);
    assert!(!h.procs.is_alive(HelperKind::TunRouter).await);
}

#[tokio::test]
async fn connect_is_illegal_while_connected() {
    let h = harness(true, |_| {}).await;
    h.supervisor.connect().await.unwrap();

    let err = h.supervisor.connect().await.unwrap_err();
    assert!(matches!(
        err,
        Error::AlreadyInState {
            state: ConnectionState::Connected,
            ..
        }
    ));

    h.supervisor.disconnect().await.unwrap();
}

#[tokio::test]
async fn disconnect_is_illegal_while_disconnected() {
    let h = harness(true, |_| {}).await;
    let err = h.supervisor.disconnect().await.unwrap_err();
    assert!(matches!(err, Error::AlreadyInState { .. }));
}

#[tokio::test]
async fn fast_restart_preserves_routes_dns_firewall() {
    let h = harness(true, |_| {}).await;
    h.supervisor.connect().await.unwrap();

    let routes = h.mock.routes();
    let dns = h.mock.dns_state();
    let rules = h.mock.firewall_rules();

    h.supervisor
        .command_sender()
        .send(SupervisorCommand::FastRestart {
            reason: "test".into(),
        })
        .unwrap();

    eventually!(
        "helpers restarted",
        h.procs.client_starts().await == 2 && h.procs.router_starts().await == 2
    );
    eventually!(
        "restart finished",
        h.supervisor.restart_count() == 1
            && h.supervisor.state().await == ConnectionState::Connected
    );

    assert_eq!(h.mock.routes(), routes);
    assert_eq!(h.mock.dns_state(), dns);
    assert_eq!(h.mock.firewall_rules(), rules);

    h.supervisor.disconnect().await.unwrap();
}

#[tokio::test]
async fn helper_death_triggers_fast_restart() {
    let h = harness(true, |_| {}).await;
    h.supervisor.connect().await.unwrap();
    assert_eq!(h.procs.client_starts().await, 1);

    h.procs.kill(HelperKind::TunRouter).await;

    eventually!("router respawned", h.procs.router_starts().await >= 2);
    eventually!(
        "back to connected",
        h.supervisor.state().await == ConnectionState::Connected
            && h.procs.is_alive(HelperKind::TunRouter).await
    );
    assert_eq!(h.supervisor.restart_count(), 1);

    h.supervisor.disconnect().await.unwrap();
}

#[tokio::test]
async fn exhausted_budget_disconnects_instead_of_restarting() {
    let h = harness(true, |settings| {
        settings.max_auto_restarts = 1;
    })
    .await;
    h.supervisor.connect().await.unwrap();

    // First death: restart permitted
    h.procs.kill(HelperKind::TunRouter).await;
    eventually!("first restart", h.procs.router_starts().await >= 2);
    eventually!(
        "reconnected",
        h.supervisor.state().await == ConnectionState::Connected
    );
    assert_eq!(h.supervisor.restart_count(), 1);

    // Second death: budget exhausted, session torn down
    h.procs.kill(HelperKind::TunRouter).await;
    eventually!(
        "torn down",
        h.supervisor.state().await == ConnectionState::Disconnected
    );

    assert!(h.mock.routes().is_empty());
    assert!(h.mock.firewall_rules().is_empty());
    assert!(!h.journal.path().exists());
}

#[tokio::test]
async fn latency_episode_triggers_restart() {
    let h = harness(true, |settings| {
        settings.latency_threshold_ms = 1000;
        settings.high_latency_count_threshold = 3;
    })
    .await;
    h.supervisor.connect().await.unwrap();

    for _ in 0..3 {
        h.procs
            .inject_line(HelperKind::TunnelClient, "pong from 198.51.100.7 1500ms");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    eventually!("latency restart", h.procs.client_starts().await >= 2);
    eventually!(
        "reconnected",
        h.supervisor.state().await == ConnectionState::Connected
    );

    // Counters were reset by the restart
    let stats = h.supervisor.stats().await;
    assert_eq!(stats.high_latency_count, 0);
    assert_eq!(stats.latency_ms, None);

    h.supervisor.disconnect().await.unwrap();
}

#[tokio::test]
async fn switch_failure_restores_previous_selection() {
    let h = harness(true, |_| {}).await;
    let original = h.store.selected().unwrap();

    let bad = h
        .store
        .add(
            "broken",
            VpnConfiguration {
                server_address: "definitely-not-a-real-host.invalid".into(),
                server_key: String::new(),
                local_socks_port: free_port(),
            },
        )
        .unwrap();

    h.supervisor.connect().await.unwrap();

    let err = h.supervisor.switch_config(bad.id).await.unwrap_err();
    assert!(matches!(err, Error::DnsResolutionFailed(_)));
    assert_eq!(h.supervisor.state().await, ConnectionState::Error);
    assert_eq!(h.store.selected().unwrap().id, original.id);

    // The failed second connect left nothing behind
    assert!(h.mock.routes().is_empty());
    assert!(!h.journal.path().exists());
}

#[tokio::test]
async fn connect_from_error_state_is_legal() {
    let h = harness(false, |_| {}).await;

    // First attempt fails: no TUN
    assert!(h.supervisor.connect().await.is_err());
    assert_eq!(h.supervisor.state().await, ConnectionState::Error);

    // The adapter shows up; retry succeeds
    h.mock.add_adapter("wintun", TUN_IF, Vec::new());
    h.supervisor.connect().await.unwrap();
    assert_eq!(h.supervisor.state().await, ConnectionState::Connected);

    h.supervisor.disconnect().await.unwrap();
}
