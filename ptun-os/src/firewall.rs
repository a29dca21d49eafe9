//! Firewall rule management
//!
//! All rules created by the product carry the `PingTunnelVPN_BlockUDP_`
//! prefix so that a later startup can discover and remove orphans left by an
//! unclean exit.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use ipnet::Ipv4Net;

use crate::error::Result;
use crate::shell::{run_checked, run_raw};

/// Name prefix identifying every firewall rule owned by the product
pub const OWNED_RULE_PREFIX: &str = "PingTunnelVPN_BlockUDP_";

/// Build a rule name from a slug
pub fn rule_name(slug: &str) -> String {
    format!("{}{}", OWNED_RULE_PREFIX, slug)
}

/// Firewall capability
#[async_trait]
pub trait FirewallOps: Send + Sync {
    /// Block outbound UDP whose local address lies inside `subnet`.
    /// Returns the created rule name.
    async fn add_block_outbound_udp(&self, subnet: Ipv4Net) -> Result<String>;

    /// Allow outbound UDP to a single remote address (loopback DNS).
    /// Returns the created rule name.
    async fn add_allow_outbound_udp(&self, remote: Ipv4Addr) -> Result<String>;

    /// Remove a rule by name; an absent rule is a no-op success.
    async fn remove_rule(&self, name: &str) -> Result<()>;

    /// List names of all rules starting with `prefix`
    async fn list_rules_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Production firewall implementation backed by `netsh advfirewall`
pub struct NativeFirewall;

#[async_trait]
impl FirewallOps for NativeFirewall {
    async fn add_block_outbound_udp(&self, subnet: Ipv4Net) -> Result<String> {
        let name = rule_name("tun");
        let name_arg = format!("name={}", name);
        let localip = format!("localip={}", subnet);
        run_checked(
            "add block-udp rule",
            "netsh",
            &[
                "advfirewall",
                "firewall",
                "add",
                "rule",
                &name_arg,
                "dir=out",
                "action=block",
                "protocol=UDP",
                &localip,
                "enable=yes",
            ],
        )
        .await?;
        log::info!("Added firewall rule {} (block UDP from {})", name, subnet);
        Ok(name)
    }

    async fn add_allow_outbound_udp(&self, remote: Ipv4Addr) -> Result<String> {
        let name = rule_name("loopback");
        let name_arg = format!("name={}", name);
        let remoteip = format!("remoteip={}", remote);
        run_checked(
            "add allow-udp rule",
            "netsh",
            &[
                "advfirewall",
                "firewall",
                "add",
                "rule",
                &name_arg,
                "dir=out",
                "action=allow",
                "protocol=UDP",
                &remoteip,
                "enable=yes",
            ],
        )
        .await?;
        log::info!("Added firewall rule {} (allow UDP to {})", name, remote);
        Ok(name)
    }

    async fn remove_rule(&self, name: &str) -> Result<()> {
        let name_arg = format!("name={}", name);
        let output = run_raw(
            "delete firewall rule",
            "netsh",
            &["advfirewall", "firewall", "delete", "rule", &name_arg],
        )
        .await?;

        // "No rules match the specified criteria" is a clean no-op
        if !output.status.success() {
            let text = String::from_utf8_lossy(&output.stdout);
            if !text.contains("No rules match") {
                return Err(crate::error::Error::from_output("delete firewall rule", &output));
            }
            log::debug!("Firewall rule {} already absent", name);
            return Ok(());
        }

        log::info!("Removed firewall rule {}", name);
        Ok(())
    }

    async fn list_rules_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let output = run_raw(
            "list firewall rules",
            "netsh",
            &["advfirewall", "firewall", "show", "rule", "name=all"],
        )
        .await?;

        // A firewall with zero rules reports failure; treat it as empty
        if !output.status.success() {
            return Ok(Vec::new());
        }

        let text = String::from_utf8_lossy(&output.stdout);
        Ok(parse_rule_names(&text, prefix))
    }
}

/// Extract rule names matching `prefix` from `netsh advfirewall firewall
/// show rule name=all` output.
pub fn parse_rule_names(output: &str, prefix: &str) -> Vec<String> {
    let mut names = Vec::new();
    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("Rule Name:") {
            let name = rest.trim();
            if name.starts_with(prefix) && !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
Rule Name:                            PingTunnelVPN_BlockUDP_tun
----------------------------------------------------------------------
Enabled:                              Yes
Direction:                            Out
Profiles:                             Domain,Private,Public
Action:                               Block

Rule Name:                            Core Networking - DNS (UDP-Out)
----------------------------------------------------------------------
Enabled:                              Yes

Rule Name:                            PingTunnelVPN_BlockUDP_loopback
----------------------------------------------------------------------
Enabled:                              Yes
"#;

    #[test]
    fn test_parse_rule_names_filters_prefix() {
        let names = parse_rule_names(SAMPLE, OWNED_RULE_PREFIX);
        assert_eq!(
            names,
            vec![
                "PingTunnelVPN_BlockUDP_tun".to_string(),
                "PingTunnelVPN_BlockUDP_loopback".to_string(),
            ]
        );
    }

    #[test]
    fn test_parse_rule_names_deduplicates() {
        let doubled = format!("{}{}", SAMPLE, SAMPLE);
        let names = parse_rule_names(&doubled, OWNED_RULE_PREFIX);
        assert_eq!(names.len(), 2);
    }

    #[test]
    fn test_rule_name_carries_prefix() {
        assert_eq!(rule_name("tun"), "PingTunnelVPN_BlockUDP_tun");
        assert!(rule_name("loopback").starts_with(OWNED_RULE_PREFIX));
    }
}
