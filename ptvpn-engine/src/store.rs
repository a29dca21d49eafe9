//! Configuration store
//!
//! Two JSON documents under the per-user data directory: `configs.json`
//! (server records plus the selected id) and `global-settings.json` (the
//! tunables from [`GlobalSettings`]). Consumers receive change
//! notifications as read-only snapshots over broadcast channels.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::settings::{GlobalSettings, VpnConfiguration};

const CONFIGS_FILE: &str = "configs.json";
const SETTINGS_FILE: &str = "global-settings.json";

/// Capacity of the notification channels
const NOTIFY_CAPACITY: usize = 16;

/// One stored server entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    /// Stable identity of the record
    pub id: Uuid,
    /// Display name, unique within the store
    pub name: String,
    /// Creation timestamp
    pub created_at: chrono::DateTime<Utc>,
    /// Last mutation timestamp
    pub last_modified: chrono::DateTime<Utc>,
    /// The connection parameters themselves
    pub configuration: VpnConfiguration,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ConfigsDocument {
    configs: Vec<ServerRecord>,
    selected_config_id: Option<Uuid>,
}

/// Persistent store for server records and global settings
pub struct ConfigStore {
    dir: PathBuf,
    state: Mutex<StoreState>,
    configuration_tx: broadcast::Sender<VpnConfiguration>,
    selected_tx: broadcast::Sender<Option<ServerRecord>>,
}

struct StoreState {
    document: ConfigsDocument,
    settings: GlobalSettings,
}

impl ConfigStore {
    /// Open (or initialize) the store rooted at `dir`
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let document = match read_json::<ConfigsDocument>(&dir.join(CONFIGS_FILE))? {
            Some(doc) => doc,
            None => ConfigsDocument::default(),
        };
        let settings = match read_json::<GlobalSettings>(&dir.join(SETTINGS_FILE))? {
            Some(settings) => settings,
            None => GlobalSettings::default(),
        };

        let (configuration_tx, _) = broadcast::channel(NOTIFY_CAPACITY);
        let (selected_tx, _) = broadcast::channel(NOTIFY_CAPACITY);

        Ok(Self {
            dir,
            state: Mutex::new(StoreState { document, settings }),
            configuration_tx,
            selected_tx,
        })
    }

    /// Subscribe to configuration mutations
    pub fn subscribe_configuration(&self) -> broadcast::Receiver<VpnConfiguration> {
        self.configuration_tx.subscribe()
    }

    /// Subscribe to selection changes
    pub fn subscribe_selected(&self) -> broadcast::Receiver<Option<ServerRecord>> {
        self.selected_tx.subscribe()
    }

    /// All records, in stored order
    pub fn list(&self) -> Vec<ServerRecord> {
        self.state.lock().unwrap().document.configs.clone()
    }

    /// Look up a record by id
    pub fn get(&self, id: Uuid) -> Option<ServerRecord> {
        self.state
            .lock()
            .unwrap()
            .document
            .configs
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    /// Currently selected record, if any
    pub fn selected(&self) -> Option<ServerRecord> {
        let state = self.state.lock().unwrap();
        let id = state.document.selected_config_id?;
        state.document.configs.iter().find(|r| r.id == id).cloned()
    }

    /// Add a record; assigns an id when the caller left it nil, stamps
    /// timestamps, deduplicates the name, and selects it when it is the
    /// first entry.
    pub fn add(&self, name: &str, configuration: VpnConfiguration) -> Result<ServerRecord> {
        configuration.validate()?;
        let record = {
            let mut state = self.state.lock().unwrap();
            let name = dedup_name(&state.document.configs, name, None);
            let now = Utc::now();
            let record = ServerRecord {
                id: Uuid::new_v4(),
                name,
                created_at: now,
                last_modified: now,
                configuration,
            };
            state.document.configs.push(record.clone());
            if state.document.selected_config_id.is_none() {
                state.document.selected_config_id = Some(record.id);
            }
            self.persist(&state)?;
            record
        };
        self.notify();
        Ok(record)
    }

    /// Apply `mutate` to the record with `id`
    pub fn update(
        &self,
        id: Uuid,
        mutate: impl FnOnce(&mut VpnConfiguration),
    ) -> Result<ServerRecord> {
        let record = {
            let mut state = self.state.lock().unwrap();
            let record = state
                .document
                .configs
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| Error::ConfigInvalid(vec![format!("no record with id {}", id)]))?;
            mutate(&mut record.configuration);
            record.configuration.validate()?;
            record.last_modified = Utc::now();
            let record = record.clone();
            self.persist(&state)?;
            record
        };
        self.notify();
        Ok(record)
    }

    /// Remove a record; when it was selected, the first remaining record
    /// becomes selected.
    pub fn delete(&self, id: Uuid) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            state.document.configs.retain(|r| r.id != id);
            if state.document.selected_config_id == Some(id) {
                state.document.selected_config_id =
                    state.document.configs.first().map(|r| r.id);
            }
            self.persist(&state)?;
        }
        self.notify();
        Ok(())
    }

    /// Select a record by id
    pub fn select(&self, id: Uuid) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if !state.document.configs.iter().any(|r| r.id == id) {
                return Err(Error::ConfigInvalid(vec![format!(
                    "no record with id {}",
                    id
                )]));
            }
            state.document.selected_config_id = Some(id);
            self.persist(&state)?;
        }
        self.notify();
        Ok(())
    }

    /// Import a configuration file as a new record named after the file stem
    pub fn import(&self, path: &Path) -> Result<ServerRecord> {
        let content = std::fs::read_to_string(path)?;
        let configuration: VpnConfiguration = serde_json::from_str(&content)?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "imported".to_string());
        self.add(&name, configuration)
    }

    /// Export only the selected record's configuration
    pub fn export(&self, path: &Path) -> Result<()> {
        let selected = self
            .selected()
            .ok_or_else(|| Error::ConfigInvalid(vec!["no configuration selected".into()]))?;
        let json = serde_json::to_string_pretty(&selected.configuration)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Current global settings snapshot
    pub fn global_settings(&self) -> GlobalSettings {
        self.state.lock().unwrap().settings.clone()
    }

    /// Mutate and persist the global settings
    pub fn update_global_settings(
        &self,
        mutate: impl FnOnce(&mut GlobalSettings),
    ) -> Result<GlobalSettings> {
        let settings = {
            let mut state = self.state.lock().unwrap();
            mutate(&mut state.settings);
            state.settings.validate()?;
            self.persist(&state)?;
            state.settings.clone()
        };
        self.notify();
        Ok(settings)
    }

    /// Restore the global settings to their defaults
    pub fn reset_global_settings(&self) -> Result<GlobalSettings> {
        self.update_global_settings(|settings| *settings = GlobalSettings::default())
    }

    fn persist(&self, state: &StoreState) -> Result<()> {
        write_json(&self.dir.join(CONFIGS_FILE), &state.document)?;
        write_json(&self.dir.join(SETTINGS_FILE), &state.settings)?;
        Ok(())
    }

    /// Fire both notification channels with current snapshots
    fn notify(&self) {
        let selected = self.selected();
        if let Some(ref record) = selected {
            let _ = self.configuration_tx.send(record.configuration.clone());
        }
        let _ = self.selected_tx.send(selected);
    }
}

/// Pick a free name by appending ` (N)` to a taken base name.
/// `skip` exempts one record (the one being renamed) from the check.
fn dedup_name(records: &[ServerRecord], base: &str, skip: Option<Uuid>) -> String {
    let taken = |candidate: &str| {
        records
            .iter()
            .any(|r| Some(r.id) != skip && r.name == candidate)
    };
    if !taken(base) {
        return base.to_string();
    }
    for n in 1.. {
        let candidate = format!("{} ({})", base, n);
        if !taken(&candidate) {
            return candidate;
        }
    }
    unreachable!()
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
