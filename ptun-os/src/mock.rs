//! In-memory OS bindings for tests
//!
//! `MockOs` implements every capability trait against plain maps so the
//! supervisor's system-state invariants (routes restored, DNS restored, no
//! leaked firewall rules) can be asserted without touching a real machine.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use ipnet::Ipv4Net;

use crate::dns::DnsOps;
use crate::error::{Error, Result};
use crate::firewall::{rule_name, FirewallOps};
use crate::iface::{InterfaceCounters, InterfaceOps};
use crate::process::{ProcessInfo, ProcessOps};
use crate::route::{RouteEntry, RoutingOps};

#[derive(Default)]
struct MockState {
    routes: Vec<RouteEntry>,
    default_route: Option<(Ipv4Addr, u32)>,
    /// adapter name -> static servers (empty = DHCP)
    dns: BTreeMap<String, Vec<Ipv4Addr>>,
    flush_count: u32,
    firewall_rules: Vec<String>,
    /// adapter name -> interface index
    interfaces: HashMap<String, u32>,
    counters: HashMap<u32, InterfaceCounters>,
    processes: HashMap<String, Vec<ProcessInfo>>,
    killed_pids: Vec<u32>,
    metrics: HashMap<u32, u32>,
    addresses: HashMap<u32, (Ipv4Addr, u8)>,
    /// operation names forced to fail
    failing: HashSet<String>,
    /// chronological record of every mutation
    log: Vec<String>,
}

/// In-memory implementation of all OS capability traits
#[derive(Default)]
pub struct MockOs {
    state: Mutex<MockState>,
}

impl MockOs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the default route returned by `find_default_route`
    pub fn set_default_route(&self, gateway: Ipv4Addr, if_index: u32) {
        self.state.lock().unwrap().default_route = Some((gateway, if_index));
    }

    /// Seed an adapter with its current DNS servers (empty = DHCP)
    pub fn add_adapter(&self, name: &str, if_index: u32, dns: Vec<Ipv4Addr>) {
        let mut state = self.state.lock().unwrap();
        state.interfaces.insert(name.to_string(), if_index);
        state.dns.insert(name.to_string(), dns);
        state.counters.entry(if_index).or_default();
    }

    /// Overwrite an interface's cumulative counters
    pub fn set_counters(&self, if_index: u32, rx_bytes: u64, tx_bytes: u64) {
        self.state
            .lock()
            .unwrap()
            .counters
            .insert(if_index, InterfaceCounters { rx_bytes, tx_bytes });
    }

    /// Seed processes discoverable by image name
    pub fn add_process(&self, image: &str, pid: u32, path: Option<PathBuf>) {
        self.state
            .lock()
            .unwrap()
            .processes
            .entry(image.to_string())
            .or_default()
            .push(ProcessInfo { pid, path });
    }

    /// Force the named operation to fail until cleared
    pub fn fail_op(&self, op: &str) {
        self.state.lock().unwrap().failing.insert(op.to_string());
    }

    /// Stop failing the named operation
    pub fn clear_fail(&self, op: &str) {
        self.state.lock().unwrap().failing.remove(op);
    }

    /// Snapshot of the current route table
    pub fn routes(&self) -> Vec<RouteEntry> {
        self.state.lock().unwrap().routes.clone()
    }

    /// Snapshot of per-adapter DNS state
    pub fn dns_state(&self) -> BTreeMap<String, Vec<Ipv4Addr>> {
        self.state.lock().unwrap().dns.clone()
    }

    /// Names of currently present firewall rules
    pub fn firewall_rules(&self) -> Vec<String> {
        self.state.lock().unwrap().firewall_rules.clone()
    }

    /// Number of resolver-cache flushes performed
    pub fn flush_count(&self) -> u32 {
        self.state.lock().unwrap().flush_count
    }

    /// Pids passed to `kill_tree`
    pub fn killed_pids(&self) -> Vec<u32> {
        self.state.lock().unwrap().killed_pids.clone()
    }

    /// Metric assigned to an interface, if any
    pub fn metric_of(&self, if_index: u32) -> Option<u32> {
        self.state.lock().unwrap().metrics.get(&if_index).copied()
    }

    /// Address assigned to an interface, if any
    pub fn address_of(&self, if_index: u32) -> Option<(Ipv4Addr, u8)> {
        self.state.lock().unwrap().addresses.get(&if_index).copied()
    }

    /// Chronological mutation log
    pub fn op_log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    fn check(&self, op: &str) -> Result<()> {
        if self.state.lock().unwrap().failing.contains(op) {
            return Err(Error::Command {
                op: op.to_string(),
                code: 1,
                detail: "forced failure".into(),
            });
        }
        Ok(())
    }

    fn record(&self, entry: String) {
        self.state.lock().unwrap().log.push(entry);
    }
}

#[async_trait]
impl RoutingOps for MockOs {
    async fn find_default_route(&self) -> Result<(Ipv4Addr, u32)> {
        self.check("find_default_route")?;
        self.state
            .lock()
            .unwrap()
            .default_route
            .ok_or_else(|| Error::Route("no IPv4 default route present".into()))
    }

    async fn add_route(&self, route: &RouteEntry) -> Result<()> {
        self.check("add_route")?;
        self.record(format!("add_route {}", route));
        let mut state = self.state.lock().unwrap();
        if !state.routes.contains(route) {
            state.routes.push(route.clone());
        }
        Ok(())
    }

    async fn delete_route(&self, route: &RouteEntry) -> Result<()> {
        self.check("delete_route")?;
        self.record(format!("delete_route {}", route));
        let mut state = self.state.lock().unwrap();
        state
            .routes
            .retain(|r| !(r.destination == route.destination && r.prefix_length == route.prefix_length));
        Ok(())
    }

    async fn set_interface_metric(&self, if_index: u32, metric: u32) -> Result<()> {
        self.check("set_interface_metric")?;
        self.record(format!("set_interface_metric {} {}", if_index, metric));
        self.state.lock().unwrap().metrics.insert(if_index, metric);
        Ok(())
    }

    async fn set_interface_address(&self, if_index: u32, addr: Ipv4Addr, prefix: u8) -> Result<()> {
        self.check("set_interface_address")?;
        self.record(format!("set_interface_address {} {}/{}", if_index, addr, prefix));
        self.state
            .lock()
            .unwrap()
            .addresses
            .insert(if_index, (addr, prefix));
        Ok(())
    }
}

#[async_trait]
impl DnsOps for MockOs {
    async fn snapshot_all(&self) -> Result<BTreeMap<String, Vec<Ipv4Addr>>> {
        self.check("snapshot_all")?;
        Ok(self.state.lock().unwrap().dns.clone())
    }

    async fn set_servers(&self, adapter: &str, servers: &[Ipv4Addr]) -> Result<()> {
        self.check("set_servers")?;
        self.record(format!("set_servers {} {:?}", adapter, servers));
        let mut state = self.state.lock().unwrap();
        match state.dns.get_mut(adapter) {
            Some(current) => {
                *current = servers.to_vec();
                Ok(())
            }
            None => Err(Error::Dns(format!("unknown adapter '{}'", adapter))),
        }
    }

    async fn reset_to_dhcp(&self, adapter: &str) -> Result<()> {
        self.check("reset_to_dhcp")?;
        self.record(format!("reset_to_dhcp {}", adapter));
        let mut state = self.state.lock().unwrap();
        match state.dns.get_mut(adapter) {
            Some(current) => {
                current.clear();
                Ok(())
            }
            None => Err(Error::Dns(format!("unknown adapter '{}'", adapter))),
        }
    }

    async fn flush_cache(&self) -> Result<()> {
        self.check("flush_cache")?;
        self.state.lock().unwrap().flush_count += 1;
        Ok(())
    }
}

#[async_trait]
impl FirewallOps for MockOs {
    async fn add_block_outbound_udp(&self, subnet: Ipv4Net) -> Result<String> {
        self.check("add_block_outbound_udp")?;
        let name = rule_name("tun");
        self.record(format!("add_block_outbound_udp {} {}", name, subnet));
        let mut state = self.state.lock().unwrap();
        if !state.firewall_rules.contains(&name) {
            state.firewall_rules.push(name.clone());
        }
        Ok(name)
    }

    async fn add_allow_outbound_udp(&self, remote: Ipv4Addr) -> Result<String> {
        self.check("add_allow_outbound_udp")?;
        let name = rule_name("loopback");
        self.record(format!("add_allow_outbound_udp {} {}", name, remote));
        let mut state = self.state.lock().unwrap();
        if !state.firewall_rules.contains(&name) {
            state.firewall_rules.push(name.clone());
        }
        Ok(name)
    }

    async fn remove_rule(&self, name: &str) -> Result<()> {
        self.check("remove_rule")?;
        self.record(format!("remove_rule {}", name));
        self.state
            .lock()
            .unwrap()
            .firewall_rules
            .retain(|n| n != name);
        Ok(())
    }

    async fn list_rules_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.check("list_rules_with_prefix")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .firewall_rules
            .iter()
            .filter(|n| n.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl InterfaceOps for MockOs {
    async fn list_active_adapters(&self) -> Result<Vec<String>> {
        self.check("list_active_adapters")?;
        Ok(self.state.lock().unwrap().interfaces.keys().cloned().collect())
    }

    async fn find_interface_index(&self, pattern: &str) -> Result<u32> {
        self.check("find_interface_index")?;
        let needle = pattern.to_lowercase();
        self.state
            .lock()
            .unwrap()
            .interfaces
            .iter()
            .find(|(name, _)| name.to_lowercase().contains(&needle))
            .map(|(_, idx)| *idx)
            .ok_or_else(|| Error::Interface(format!("no interface matching '{}'", pattern)))
    }

    async fn read_counters(&self, if_index: u32) -> Result<InterfaceCounters> {
        self.check("read_counters")?;
        self.state
            .lock()
            .unwrap()
            .counters
            .get(&if_index)
            .copied()
            .ok_or_else(|| Error::Interface(format!("no counters for index {}", if_index)))
    }
}

#[async_trait]
impl ProcessOps for MockOs {
    async fn list_by_image(&self, image: &str) -> Result<Vec<ProcessInfo>> {
        self.check("list_by_image")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .processes
            .get(image)
            .cloned()
            .unwrap_or_default())
    }

    async fn kill_tree(&self, pid: u32) -> Result<()> {
        self.check("kill_tree")?;
        let mut state = self.state.lock().unwrap();
        state.killed_pids.push(pid);
        for list in state.processes.values_mut() {
            list.retain(|p| p.pid != pid);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_route_add_delete_idempotent() {
        let os = MockOs::new();
        let route = RouteEntry::host(
            Ipv4Addr::new(1, 2, 3, 4),
            Ipv4Addr::new(192, 168, 1, 1),
            7,
            1,
        );
        os.add_route(&route).await.unwrap();
        os.add_route(&route).await.unwrap();
        assert_eq!(os.routes().len(), 1);

        os.delete_route(&route).await.unwrap();
        os.delete_route(&route).await.unwrap();
        assert!(os.routes().is_empty());
    }

    #[tokio::test]
    async fn test_forced_failure() {
        let os = MockOs::new();
        os.fail_op("flush_cache");
        assert!(os.flush_cache().await.is_err());
        os.clear_fail("flush_cache");
        assert!(os.flush_cache().await.is_ok());
    }

    #[tokio::test]
    async fn test_dns_roundtrip() {
        let os = MockOs::new();
        os.add_adapter("Ethernet", 7, vec![Ipv4Addr::new(9, 9, 9, 9)]);
        let before = os.snapshot_all().await.unwrap();

        os.set_servers("Ethernet", &[Ipv4Addr::new(127, 0, 0, 1)])
            .await
            .unwrap();
        assert_eq!(
            os.dns_state()["Ethernet"],
            vec![Ipv4Addr::new(127, 0, 0, 1)]
        );

        for (adapter, servers) in &before {
            if servers.is_empty() {
                os.reset_to_dhcp(adapter).await.unwrap();
            } else {
                os.set_servers(adapter, servers).await.unwrap();
            }
        }
        assert_eq!(os.snapshot_all().await.unwrap(), before);
    }
}
