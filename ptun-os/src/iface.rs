//! Interface inventory and counters
//!
//! A freshly created wintun adapter takes a moment to register with the IPv4
//! stack, so index resolution retries for a few seconds before giving up.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::shell::run_checked;

/// How many times to re-scan for a missing interface
const FIND_RETRIES: u32 = 10;
/// Delay between interface scans
const FIND_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Cumulative byte counters for one interface
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceCounters {
    /// Bytes received
    pub rx_bytes: u64,
    /// Bytes transmitted
    pub tx_bytes: u64,
}

/// Interface inventory capability
#[async_trait]
pub trait InterfaceOps: Send + Sync {
    /// Names of connected, non-loopback adapters
    async fn list_active_adapters(&self) -> Result<Vec<String>>;

    /// Resolve an adapter name pattern (case-insensitive substring) to its
    /// IPv4 interface index, retrying briefly for adapters still registering.
    async fn find_interface_index(&self, pattern: &str) -> Result<u32>;

    /// Read the cumulative rx/tx byte counters of an interface
    async fn read_counters(&self, if_index: u32) -> Result<InterfaceCounters>;
}

/// Production interface inventory backed by netsh
pub struct NativeInterfaces {
    /// Interface index -> name, filled lazily from `show interfaces`
    names: RwLock<HashMap<u32, String>>,
}

impl NativeInterfaces {
    pub fn new() -> Self {
        Self {
            names: RwLock::new(HashMap::new()),
        }
    }

    async fn scan_interfaces(&self) -> Result<Vec<(u32, String)>> {
        let output = run_checked(
            "show interfaces",
            "netsh",
            &["interface", "ipv4", "show", "interfaces"],
        )
        .await?;
        let entries = parse_interfaces_output(&output);

        let mut names = self.names.write().await;
        for (idx, name) in &entries {
            names.insert(*idx, name.clone());
        }
        Ok(entries)
    }

    async fn name_for(&self, if_index: u32) -> Result<String> {
        if let Some(name) = self.names.read().await.get(&if_index) {
            return Ok(name.clone());
        }
        self.scan_interfaces().await?;
        self.names
            .read()
            .await
            .get(&if_index)
            .cloned()
            .ok_or_else(|| Error::Interface(format!("no interface with index {}", if_index)))
    }
}

impl Default for NativeInterfaces {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InterfaceOps for NativeInterfaces {
    async fn list_active_adapters(&self) -> Result<Vec<String>> {
        let output = run_checked(
            "show adapters",
            "netsh",
            &["interface", "show", "interface"],
        )
        .await?;
        Ok(parse_adapter_list(&output))
    }

    async fn find_interface_index(&self, pattern: &str) -> Result<u32> {
        let needle = pattern.to_lowercase();
        for attempt in 0..FIND_RETRIES {
            let entries = self.scan_interfaces().await?;
            if let Some((idx, _)) = entries
                .iter()
                .find(|(_, name)| name.to_lowercase().contains(&needle))
            {
                return Ok(*idx);
            }
            log::debug!(
                "Interface matching '{}' not registered yet (attempt {})",
                pattern,
                attempt + 1
            );
            tokio::time::sleep(FIND_RETRY_DELAY).await;
        }
        Err(Error::Interface(format!(
            "no interface matching '{}' after {} attempts",
            pattern, FIND_RETRIES
        )))
    }

    async fn read_counters(&self, if_index: u32) -> Result<InterfaceCounters> {
        let name = self.name_for(if_index).await?;
        let output = run_checked(
            "show subinterfaces",
            "netsh",
            &["interface", "ipv4", "show", "subinterfaces"],
        )
        .await?;
        parse_subinterface_counters(&output, &name)
            .ok_or_else(|| Error::Interface(format!("no counters for interface '{}'", name)))
    }
}

/// Parse `netsh interface ipv4 show interfaces` into (index, name) pairs.
///
/// Expected row shape: `Idx  Met  MTU  State  Name`.
pub fn parse_interfaces_output(output: &str) -> Vec<(u32, String)> {
    let mut entries = Vec::new();
    for line in output.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 5 {
            continue;
        }
        let Ok(idx) = parts[0].parse::<u32>() else {
            continue;
        };
        entries.push((idx, parts[4..].join(" ")));
    }
    entries
}

/// Parse `netsh interface show interface` into names of connected,
/// non-loopback adapters.
///
/// Expected row shape: `Admin State  State  Type  Interface Name`.
pub fn parse_adapter_list(output: &str) -> Vec<String> {
    let mut adapters = Vec::new();
    for line in output.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        // Header and separator rows fail the state check
        if parts.len() < 4 {
            continue;
        }
        if parts[1] != "Connected" || parts[2].eq_ignore_ascii_case("Loopback") {
            continue;
        }
        adapters.push(parts[3..].join(" "));
    }
    adapters
}

/// Extract rx/tx counters for a named interface from
/// `netsh interface ipv4 show subinterfaces` output.
///
/// Expected row shape: `MTU  MediaSenseState  Bytes In  Bytes Out  Interface`.
pub fn parse_subinterface_counters(output: &str, name: &str) -> Option<InterfaceCounters> {
    for line in output.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 5 {
            continue;
        }
        if parts[0].parse::<u32>().is_err() {
            continue;
        }
        let row_name = parts[4..].join(" ");
        if row_name != name {
            continue;
        }
        let rx = parts[2].parse::<u64>().ok()?;
        let tx = parts[3].parse::<u64>().ok()?;
        return Some(InterfaceCounters {
            rx_bytes: rx,
            tx_bytes: tx,
        });
    }
    None
}
