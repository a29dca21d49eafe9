//! ptvpn-engine - the PingTunnel VPN connection supervisor
//!
//! Coordinates everything between "the user clicked connect" and a machine
//! whose traffic rides an ICMP-carried tunnel: helper process supervision,
//! ordered routing/DNS/firewall mutations with a recovery journal, an
//! in-process DNS forwarder, health monitoring with a bounded fast-restart
//! policy, and crash recovery.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Application Layer                       │
//! │   ┌───────────────┐                ┌──────────────────────┐  │
//! │   │   ptvpn-cli   │                │   Desktop shell      │  │
//! │   └───────┬───────┘                └──────────┬───────────┘  │
//! │           └───────────────┬───────────────────┘              │
//! │                           ▼                                  │
//! │   ┌──────────────────────────────────────────────────────┐   │
//! │   │                   ptvpn-engine                       │   │
//! │   │  VpnSupervisor (state machine) · ProcessSupervisor   │   │
//! │   │  JournalStore · ConfigStore · HealthMonitor          │   │
//! │   │  TrafficPoller · SingleInstance/panic trap           │   │
//! │   └──────────────────────────────────────────────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Library Layer                           │
//! │   ┌──────────────────┐        ┌──────────────────┐           │
//! │   │     ptun-os      │        │     ptun-dns     │           │
//! │   │  routes · DNS    │        │  SOCKS5 relay    │           │
//! │   │  firewall · proc │        │  TTL cache       │           │
//! │   └──────────────────┘        └──────────────────┘           │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod crash;
pub mod error;
pub mod event;
pub mod health;
pub mod journal;
pub mod paths;
pub mod process;
pub mod settings;
pub mod stats;
pub mod store;
pub mod supervisor;
pub mod traffic;

pub use crash::{install_panic_trap, SingleInstance, EMERGENCY_CLEANUP_CAP, EXIT_FAILURE};
pub use error::{Error, Result};
pub use event::{ConnectionState, EventHandler, LoggingEventHandler, VpnEvent};
pub use health::{HealthMonitor, RestartBudget, SupervisorCommand};
pub use journal::{JournalStore, RecoveryState};
pub use process::{
    FakeProcessControl, HelperKind, ProcessControl, ProcessEvent, ProcessSupervisor,
};
pub use settings::{DnsMode, EncryptionMode, GlobalSettings, VpnConfiguration};
pub use stats::ConnectionStats;
pub use store::{ConfigStore, ServerRecord};
pub use supervisor::{
    SupervisorOptions, Timing, VpnSupervisor, TUN_ADDRESS, TUN_DEVICE, TUN_GATEWAY,
};
