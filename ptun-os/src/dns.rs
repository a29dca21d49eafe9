//! Per-adapter DNS configuration
//!
//! Snapshots and mutations go through `netsh interface ipv4`; adapters whose
//! servers come from DHCP are recorded with an empty server list so a later
//! restore knows to hand them back to DHCP.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use async_trait::async_trait;

use crate::error::Result;
use crate::shell::run_checked;

/// Per-adapter DNS capability
#[async_trait]
pub trait DnsOps: Send + Sync {
    /// Snapshot every adapter's DNS servers, keyed by adapter name.
    ///
    /// DHCP-sourced adapters map to an empty list.
    async fn snapshot_all(&self) -> Result<BTreeMap<String, Vec<Ipv4Addr>>>;

    /// Point an adapter at a static server list
    async fn set_servers(&self, adapter: &str, servers: &[Ipv4Addr]) -> Result<()>;

    /// Hand an adapter's DNS configuration back to DHCP
    async fn reset_to_dhcp(&self, adapter: &str) -> Result<()>;

    /// Flush the system resolver cache
    async fn flush_cache(&self) -> Result<()>;
}

/// Production DNS implementation backed by netsh
pub struct NativeDns;

#[async_trait]
impl DnsOps for NativeDns {
    async fn snapshot_all(&self) -> Result<BTreeMap<String, Vec<Ipv4Addr>>> {
        let output = run_checked(
            "show dnsservers",
            "netsh",
            &["interface", "ipv4", "show", "dnsservers"],
        )
        .await?;
        Ok(parse_dnsservers_output(&output))
    }

    async fn set_servers(&self, adapter: &str, servers: &[Ipv4Addr]) -> Result<()> {
        if servers.is_empty() {
            return self.reset_to_dhcp(adapter).await;
        }

        let name = format!("name={}", adapter);
        let primary = format!("address={}", servers[0]);
        run_checked(
            "set dnsservers",
            "netsh",
            &[
                "interface",
                "ipv4",
                "set",
                "dnsservers",
                &name,
                "source=static",
                &primary,
                "register=primary",
                "validate=no",
            ],
        )
        .await?;

        for (i, server) in servers.iter().enumerate().skip(1) {
            let address = format!("address={}", server);
            let index = format!("index={}", i + 1);
            run_checked(
                "add dnsservers",
                "netsh",
                &[
                    "interface",
                    "ipv4",
                    "add",
                    "dnsservers",
                    &name,
                    &address,
                    &index,
                    "validate=no",
                ],
            )
            .await?;
        }

        log::info!("DNS for '{}' set to {:?}", adapter, servers);
        Ok(())
    }

    async fn reset_to_dhcp(&self, adapter: &str) -> Result<()> {
        let name = format!("name={}", adapter);
        run_checked(
            "reset dnsservers",
            "netsh",
            &["interface", "ipv4", "set", "dnsservers", &name, "source=dhcp"],
        )
        .await?;
        log::info!("DNS for '{}' reset to DHCP", adapter);
        Ok(())
    }

    async fn flush_cache(&self) -> Result<()> {
        run_checked("flush resolver cache", "ipconfig", &["/flushdns"]).await?;
        Ok(())
    }
}

/// Parse `netsh interface ipv4 show dnsservers` output into an
/// adapter -> server-list map.
pub fn parse_dnsservers_output(output: &str) -> BTreeMap<String, Vec<Ipv4Addr>> {
    let mut result = BTreeMap::new();
    let mut current: Option<String> = None;
    let mut collecting_static = false;

    for line in output.lines() {
        let trimmed = line.trim();

        if let Some(rest) = trimmed.strip_prefix("Configuration for interface") {
            let name = rest.trim().trim_matches('"').to_string();
            if !name.is_empty() {
                result.insert(name.clone(), Vec::new());
                current = Some(name);
            }
            collecting_static = false;
            continue;
        }

        let Some(ref adapter) = current else {
            continue;
        };

        if trimmed.contains("configured through DHCP") {
            // DHCP-sourced servers are deliberately not recorded
            collecting_static = false;
            continue;
        }

        if let Some(rest) = trimmed.strip_prefix("Statically Configured DNS Servers:") {
            collecting_static = true;
            if let Ok(ip) = rest.trim().parse::<Ipv4Addr>() {
                if let Some(servers) = result.get_mut(adapter) {
                    servers.push(ip);
                }
            }
            continue;
        }

        if collecting_static {
            if let Ok(ip) = trimmed.parse::<Ipv4Addr>() {
                if let Some(servers) = result.get_mut(adapter) {
                    servers.push(ip);
                }
            } else if !trimmed.is_empty() {
                collecting_static = false;
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
Configuration for interface "Ethernet"
    DNS servers configured through DHCP:  192.168.1.1
    Register with which suffix:           Primary only

Configuration for interface "Wi-Fi"
    Statically Configured DNS Servers:    1.1.1.1
                                          8.8.8.8
    Register with which suffix:           Primary only

Configuration for interface "Loopback Pseudo-Interface 1"
    Statically Configured DNS Servers:    None
    Register with which suffix:           Primary only
"#;

    #[test]
    fn test_parse_dhcp_adapter_is_empty() {
        let map = parse_dnsservers_output(SAMPLE);
        assert_eq!(map["Ethernet"], Vec::<Ipv4Addr>::new());
    }

    #[test]
    fn test_parse_static_adapter_collects_all_servers() {
        let map = parse_dnsservers_output(SAMPLE);
        assert_eq!(
            map["Wi-Fi"],
            vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)]
        );
    }

    #[test]
    fn test_parse_none_entry_is_empty() {
        let map = parse_dnsservers_output(SAMPLE);
        assert_eq!(map["Loopback Pseudo-Interface 1"], Vec::<Ipv4Addr>::new());
    }

    #[test]
    fn test_parse_empty_output() {
        assert!(parse_dnsservers_output("").is_empty());
    }
}
