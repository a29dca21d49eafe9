//! Per-server configuration and global tunables

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default local SOCKS5 port exposed by the tunnel client
pub const DEFAULT_SOCKS_PORT: u16 = 1080;

/// MTU bounds accepted for the TUN adapter
pub const MTU_RANGE: std::ops::RangeInclusive<u32> = 576..=9000;

/// Per-server connection parameters
///
/// Read-snapshotted at connect time; the supervisor never mutates a
/// configuration during a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpnConfiguration {
    /// Server host: DNS name or literal IPv4 address
    pub server_address: String,
    /// Shared authentication token passed to the tunnel client
    pub server_key: String,
    /// Local SOCKS5 listen port
    #[serde(default = "default_socks_port")]
    pub local_socks_port: u16,
}

fn default_socks_port() -> u16 {
    DEFAULT_SOCKS_PORT
}

impl VpnConfiguration {
    /// Validate the configuration, collecting every violation
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.server_address.trim().is_empty() {
            problems.push("server address must not be empty".to_string());
        }
        if self.local_socks_port == 0 {
            problems.push("local SOCKS port must be between 1 and 65535".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::ConfigInvalid(problems))
        }
    }
}

impl Default for VpnConfiguration {
    fn default() -> Self {
        Self {
            server_address: String::new(),
            server_key: String::new(),
            local_socks_port: DEFAULT_SOCKS_PORT,
        }
    }
}

/// DNS handling mode while connected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsMode {
    /// Run the in-process forwarder and point all adapters at 127.0.0.1
    #[default]
    Tunnel,
    /// Leave system DNS untouched
    System,
}

/// Payload encryption mode passed to the tunnel client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionMode {
    #[default]
    None,
    Aes128,
    Aes256,
    Chacha20,
}

impl EncryptionMode {
    /// Value emitted on the tunnel client command line
    pub fn arg_value(&self) -> &'static str {
        match self {
            EncryptionMode::None => "none",
            EncryptionMode::Aes128 => "aes128",
            EncryptionMode::Aes256 => "aes256",
            EncryptionMode::Chacha20 => "chacha20",
        }
    }
}

/// Global tunable parameters, one instance per installation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalSettings {
    /// MTU set on the TUN adapter and passed to the router
    pub mtu: u32,
    /// DNS handling mode
    pub dns_mode: DnsMode,
    /// Upstream resolvers for the forwarder, in failover order
    pub dns_servers: Vec<Ipv4Addr>,
    /// Destinations routed via the physical gateway instead of the tunnel
    pub bypass_subnets: Vec<Ipv4Net>,
    /// Payload encryption mode
    pub encryption_mode: EncryptionMode,
    /// Key for the payload encryption mode
    pub encryption_key: String,
    /// Latency above which a sample counts toward a restart
    pub latency_threshold_ms: u64,
    /// Consecutive high-latency samples required to trigger a restart
    pub high_latency_count_threshold: u32,
    /// Minimum gap between automatic restarts
    pub restart_cooldown_seconds: u64,
    /// Bound on automatic restarts per session (0 = unlimited)
    pub max_auto_restarts: u32,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            mtu: 1420,
            dns_mode: DnsMode::Tunnel,
            dns_servers: vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)],
            bypass_subnets: vec![
                "192.168.0.0/16".parse().unwrap(),
                "10.0.0.0/8".parse().unwrap(),
                "172.16.0.0/12".parse().unwrap(),
            ],
            encryption_mode: EncryptionMode::None,
            encryption_key: String::new(),
            latency_threshold_ms: 1000,
            high_latency_count_threshold: 5,
            restart_cooldown_seconds: 30,
            max_auto_restarts: 3,
        }
    }
}

impl GlobalSettings {
    /// Validate the settings, collecting every violation
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if !MTU_RANGE.contains(&self.mtu) {
            problems.push(format!(
                "mtu {} outside {}..={}",
                self.mtu,
                MTU_RANGE.start(),
                MTU_RANGE.end()
            ));
        }
        if self.dns_mode == DnsMode::Tunnel && self.dns_servers.is_empty() {
            problems.push("tunnel DNS mode requires at least one DNS server".to_string());
        }
        if self.encryption_mode != EncryptionMode::None && self.encryption_key.is_empty() {
            problems.push("encryption requires a key".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::ConfigInvalid(problems))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_validation() {
        let mut config = VpnConfiguration {
            server_address: "tunnel.example.net".into(),
            server_key: "s3cret".into(),
            local_socks_port: 1080,
        };
        assert!(config.validate().is_ok());

        config.server_address = "  ".into();
        config.local_socks_port = 0;
        let err = config.validate().unwrap_err();
        match err {
            Error::ConfigInvalid(problems) => assert_eq!(problems.len(), 2),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_settings_defaults() {
        let settings = GlobalSettings::default();
        assert_eq!(settings.mtu, 1420);
        assert_eq!(settings.dns_mode, DnsMode::Tunnel);
        assert_eq!(settings.max_auto_restarts, 3);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_settings_mtu_bounds() {
        let mut settings = GlobalSettings {
            mtu: 575,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
        settings.mtu = 9001;
        assert!(settings.validate().is_err());
        settings.mtu = 576;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_settings_json_layout() {
        let settings = GlobalSettings::default();
        let json = serde_json::to_value(&settings).unwrap();
        assert_eq!(json["mtu"], 1420);
        assert_eq!(json["dnsMode"], "tunnel");
        assert_eq!(json["dnsServers"][0], "1.1.1.1");
        assert_eq!(json["encryptionMode"], "none");
        assert_eq!(json["latencyThresholdMs"], 1000);
        assert_eq!(json["maxAutoRestarts"], 3);
    }

    #[test]
    fn test_configuration_json_layout() {
        let config = VpnConfiguration {
            server_address: "tunnel.example.net".into(),
            server_key: "s3cret".into(),
            local_socks_port: 1080,
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["serverAddress"], "tunnel.example.net");
        assert_eq!(json["serverKey"], "s3cret");
        assert_eq!(json["localSocksPort"], 1080);
    }

    #[test]
    fn test_encryption_requires_key() {
        let settings = GlobalSettings {
            encryption_mode: EncryptionMode::Chacha20,
            encryption_key: String::new(),
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}
