//! ptun-os - OS bindings for the PingTunnel VPN supervisor
//!
//! Thin wrappers over the host networking surface the supervisor mutates:
//! the routing table, per-adapter DNS, the firewall ruleset, interface
//! inventory and counters, process control, and elevation.
//!
//! Each capability is a small trait so the engine's test suite can
//! substitute the in-memory [`mock::MockOs`]; the production implementations
//! delegate to `net-route` plus `netsh`-family commands.
//!
//! # Example
//!
//! ```no_run
//! use ptun_os::OsHandle;
//!
//! # async fn example() -> ptun_os::Result<()> {
//! let os = OsHandle::native()?;
//! let (gateway, if_index) = os.routing.find_default_route().await?;
//! println!("default via {} dev {}", gateway, if_index);
//! # Ok(())
//! # }
//! ```

pub mod dns;
pub mod elevation;
pub mod error;
pub mod firewall;
pub mod iface;
pub mod mock;
pub mod process;
pub mod route;
mod shell;

pub use dns::{DnsOps, NativeDns};
pub use error::{Error, Result};
pub use firewall::{FirewallOps, NativeFirewall, OWNED_RULE_PREFIX};
pub use iface::{InterfaceCounters, InterfaceOps, NativeInterfaces};
pub use process::{
    kill_orphans_under, spawn_captured, terminate_tree, NativeProcesses, ProcessInfo, ProcessOps,
};
pub use route::{RouteEntry, RoutingOps};

use std::sync::Arc;

/// Bundle of every OS capability, passed around as one handle
///
/// The engine holds exactly one of these; tests build it from a single
/// [`mock::MockOs`] shared across all capabilities.
#[derive(Clone)]
pub struct OsHandle {
    pub routing: Arc<dyn RoutingOps>,
    pub dns: Arc<dyn DnsOps>,
    pub firewall: Arc<dyn FirewallOps>,
    pub interfaces: Arc<dyn InterfaceOps>,
    pub processes: Arc<dyn ProcessOps>,
}

impl OsHandle {
    /// Production bindings
    pub fn native() -> Result<Self> {
        Ok(Self {
            routing: Arc::new(route::NativeRouting::new()?),
            dns: Arc::new(NativeDns),
            firewall: Arc::new(NativeFirewall),
            interfaces: Arc::new(NativeInterfaces::new()),
            processes: Arc::new(NativeProcesses),
        })
    }

    /// Every capability backed by one shared mock
    pub fn from_mock(mock: Arc<mock::MockOs>) -> Self {
        Self {
            routing: mock.clone(),
            dns: mock.clone(),
            firewall: mock.clone(),
            interfaces: mock.clone(),
            processes: mock,
        }
    }
}
