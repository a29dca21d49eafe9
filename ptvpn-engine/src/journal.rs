//! Recovery journal
//!
//! Append-only record of every system mutation a session performs, written
//! to disk *before* the mutation is applied and cleared only after every
//! mutation has been reversed. A journal whose `isConnected` flag is still
//! true at startup marks an unclean exit; `recover` replays it as undo.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use ptun_os::firewall::OWNED_RULE_PREFIX;
use ptun_os::{kill_orphans_under, OsHandle, RouteEntry};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::process::HelperKind;

/// Everything needed to undo a session's system mutations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecoveryState {
    /// True while system state is mutated
    pub is_connected: bool,
    /// When this journal was last written
    pub timestamp: Option<DateTime<Utc>>,
    /// Default gateway before the session started
    pub original_default_gateway: Option<Ipv4Addr>,
    /// Interface index carrying the default route before the session
    pub original_default_interface_index: Option<u32>,
    /// Per-adapter DNS servers before the session (empty list = DHCP)
    pub original_dns_settings: BTreeMap<String, Vec<Ipv4Addr>>,
    /// Routes added by the session, in addition order
    pub added_routes: Vec<RouteEntry>,
}

impl RecoveryState {
    /// Journal for a session that is about to start mutating state
    pub fn for_session(
        gateway: Ipv4Addr,
        if_index: u32,
        dns: BTreeMap<String, Vec<Ipv4Addr>>,
    ) -> Self {
        Self {
            is_connected: true,
            timestamp: Some(Utc::now()),
            original_default_gateway: Some(gateway),
            original_default_interface_index: Some(if_index),
            original_dns_settings: dns,
            added_routes: Vec::new(),
        }
    }
}

/// On-disk journal store with atomic replacement
pub struct JournalStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JournalStore {
    /// Journal at an explicit path
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Journal at the well-known per-user location
    pub fn default_location() -> Self {
        Self::at(crate::paths::journal_path())
    }

    /// Path of the journal file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether an unclean previous run left mutations behind
    pub fn needs_recovery(&self) -> bool {
        self.load()
            .ok()
            .flatten()
            .is_some_and(|state| state.is_connected)
    }

    /// Read the journal, `None` when no file exists
    pub fn load(&self) -> Result<Option<RecoveryState>> {
        let _guard = self.lock.lock().unwrap();
        self.load_locked()
    }

    fn load_locked(&self) -> Result<Option<RecoveryState>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Serialize and atomically replace the journal
    pub fn save(&self, state: &RecoveryState) -> Result<()> {
        let _guard = self.lock.lock().unwrap();
        self.save_locked(state)
    }

    fn save_locked(&self, state: &RecoveryState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Record one more route, before it is added to the OS table
    pub fn append_route(&self, route: &RouteEntry) -> Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut state = self.load_locked()?.unwrap_or_default();
        state.timestamp = Some(Utc::now());
        state.added_routes.push(route.clone());
        self.save_locked(&state)
    }

    /// Delete the journal file
    pub fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().unwrap();
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Undo everything a previous unclean run recorded
    ///
    /// Every sub-operation is best-effort so one failure cannot block the
    /// rest of the sweep. The journal is cleared last.
    pub async fn recover(&self, os: &OsHandle, resource_dir: &Path) -> Result<()> {
        let Some(state) = self.load()? else {
            return Ok(());
        };

        log::warn!(
            "Recovering from unclean shutdown ({} routes, {} adapters)",
            state.added_routes.len(),
            state.original_dns_settings.len()
        );

        for route in state.added_routes.iter().rev() {
            if let Err(e) = os.routing.delete_route(route).await {
                log::warn!("Recovery: failed to delete {}: {}", route, e);
            }
        }

        for (adapter, servers) in &state.original_dns_settings {
            let result = if servers.is_empty() {
                os.dns.reset_to_dhcp(adapter).await
            } else {
                os.dns.set_servers(adapter, servers).await
            };
            if let Err(e) = result {
                log::warn!("Recovery: failed to restore DNS on '{}': {}", adapter, e);
            }
        }

        if let Err(e) = os.dns.flush_cache().await {
            log::debug!("Recovery: resolver flush failed: {}", e);
        }

        match os.firewall.list_rules_with_prefix(OWNED_RULE_PREFIX).await {
            Ok(rules) => {
                for rule in rules {
                    if let Err(e) = os.firewall.remove_rule(&rule).await {
                        log::warn!("Recovery: failed to remove rule {}: {}", rule, e);
                    }
                }
            }
            Err(e) => log::warn!("Recovery: firewall scan failed: {}", e),
        }

        kill_orphans_under(
            os.processes.as_ref(),
            resource_dir,
            &[
                HelperKind::TunnelClient.image_name(),
                HelperKind::TunRouter.image_name(),
            ],
        )
        .await;

        self.clear()?;
        log::info!("Recovery complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ptun_os::mock::MockOs;
    use std::sync::Arc;

    fn sample_route(last_octet: u8) -> RouteEntry {
        RouteEntry::host(
            Ipv4Addr::new(203, 0, 113, last_octet),
            Ipv4Addr::new(192, 168, 1, 1),
            7,
            1,
        )
    }

    #[test]
    fn test_needs_recovery_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let journal = JournalStore::at(dir.path().join("state.json"));
        assert!(!journal.needs_recovery());

        let state = RecoveryState::for_session(
            Ipv4Addr::new(192, 168, 1, 1),
            7,
            BTreeMap::new(),
        );
        journal.save(&state).unwrap();
        assert!(journal.needs_recovery());

        journal.clear().unwrap();
        assert!(!journal.needs_recovery());
        assert!(!journal.path().exists());
    }

    #[test]
    fn test_append_route_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let journal = JournalStore::at(dir.path().join("state.json"));
        journal
            .save(&RecoveryState::for_session(
                Ipv4Addr::new(192, 168, 1, 1),
                7,
                BTreeMap::new(),
            ))
            .unwrap();

        journal.append_route(&sample_route(1)).unwrap();
        journal.append_route(&sample_route(2)).unwrap();

        let state = journal.load().unwrap().unwrap();
        assert_eq!(state.added_routes.len(), 2);
        assert!(state.is_connected);
    }

    #[test]
    fn test_state_json_layout() {
        let mut dns = BTreeMap::new();
        dns.insert("Ethernet".to_string(), vec![Ipv4Addr::new(1, 1, 1, 1)]);
        let mut state =
            RecoveryState::for_session(Ipv4Addr::new(192, 168, 1, 254), 12, dns);
        state.added_routes.push(sample_route(9));

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["isConnected"], true);
        assert_eq!(json["originalDefaultGateway"], "192.168.1.254");
        assert_eq!(json["originalDefaultInterfaceIndex"], 12);
        assert_eq!(json["originalDnsSettings"]["Ethernet"][0], "1.1.1.1");
        assert_eq!(json["addedRoutes"][0]["destination"], "203.0.113.9");
        assert_eq!(json["addedRoutes"][0]["prefixLength"], 32);
        assert_eq!(json["addedRoutes"][0]["interfaceIndex"], 7);
    }

    #[tokio::test]
    async fn test_recover_undoes_everything_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let journal = JournalStore::at(dir.path().join("state.json"));

        let mock = Arc::new(MockOs::new());
        mock.add_adapter("Ethernet", 7, vec![Ipv4Addr::new(127, 0, 0, 1)]);
        let os = OsHandle::from_mock(mock.clone());

        // Seed the routes a previous run left behind
        let r1 = sample_route(1);
        let r2 = sample_route(2);
        os.routing.add_route(&r1).await.unwrap();
        os.routing.add_route(&r2).await.unwrap();
        os.firewall
            .add_block_outbound_udp("198.18.0.0/24".parse().unwrap())
            .await
            .unwrap();

        let mut dns = BTreeMap::new();
        dns.insert("Ethernet".to_string(), vec![Ipv4Addr::new(9, 9, 9, 9)]);
        let mut state =
            RecoveryState::for_session(Ipv4Addr::new(192, 168, 1, 1), 7, dns);
        state.added_routes = vec![r1, r2];
        journal.save(&state).unwrap();

        journal.recover(&os, dir.path()).await.unwrap();

        assert!(mock.routes().is_empty());
        assert_eq!(mock.dns_state()["Ethernet"], vec![Ipv4Addr::new(9, 9, 9, 9)]);
        assert!(mock.firewall_rules().is_empty());
        assert!(!journal.path().exists());
    }

    #[tokio::test]
    async fn test_recover_continues_past_failures() {
        let dir = tempfile::tempdir().unwrap();
        let journal = JournalStore::at(dir.path().join("state.json"));

        let mock = Arc::new(MockOs::new());
        mock.add_adapter("Ethernet", 7, vec![Ipv4Addr::new(127, 0, 0, 1)]);
        mock.fail_op("delete_route");
        let os = OsHandle::from_mock(mock.clone());

        let mut dns = BTreeMap::new();
        dns.insert("Ethernet".to_string(), Vec::new());
        let mut state =
            RecoveryState::for_session(Ipv4Addr::new(192, 168, 1, 1), 7, dns);
        state.added_routes = vec![sample_route(1)];
        journal.save(&state).unwrap();

        journal.recover(&os, dir.path()).await.unwrap();

        // Route deletion failed, but DNS restore and the clear still ran
        assert_eq!(mock.dns_state()["Ethernet"], Vec::<Ipv4Addr>::new());
        assert!(!journal.path().exists());
    }
}
