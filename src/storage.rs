//! Key-value persistence
//!
//! Hosts usually own their preference storage and plug it in through
//! [`KeyValueStore`]. Two implementations ship with the crate: an in-memory
//! store and a TOML file store for hosts without one.

use crate::error::{Result, TunError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

pub const KEY_LAST_CONFIG: &str = "last_config";
pub const KEY_SHOULD_BE_RUNNING: &str = "should_be_running";
pub const KEY_AUTO_START: &str = "auto_start_on_boot";
pub const KEY_AUTO_RECONNECT: &str = "auto_reconnect_on_network";
pub const KEY_KILL_SWITCH: &str = "kill_switch_enabled";
pub const KEY_EXCLUDED_APPS: &str = "excluded_apps";
pub const KEY_DISPLAY_NAME: &str = "custom_display_name";
pub const KEY_DISPLAY_ICON: &str = "custom_display_icon";

/// Persistent get/set interface
pub trait KeyValueStore: Send + Sync {
    fn get_string(&self, key: &str) -> Result<Option<String>>;
    /// `None` removes the key
    fn set_string(&self, key: &str, value: Option<&str>) -> Result<()>;
    fn get_bool(&self, key: &str) -> Result<Option<bool>>;
    fn set_bool(&self, key: &str, value: bool) -> Result<()>;
    fn get_int(&self, key: &str) -> Result<Option<i64>>;
    fn set_int(&self, key: &str, value: i64) -> Result<()>;
    fn get_string_set(&self, key: &str) -> Result<BTreeSet<String>>;
    fn set_string_set(&self, key: &str, value: &BTreeSet<String>) -> Result<()>;
}

/// Typed tables shared by both store implementations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Tables {
    #[serde(default)]
    strings: BTreeMap<String, String>,
    #[serde(default)]
    bools: BTreeMap<String, bool>,
    #[serde(default)]
    ints: BTreeMap<String, i64>,
    #[serde(default)]
    sets: BTreeMap<String, BTreeSet<String>>,
}

fn lock(tables: &Mutex<Tables>) -> Result<MutexGuard<'_, Tables>> {
    tables
        .lock()
        .map_err(|_| TunError::Storage("store lock poisoned".to_string()))
}

/// Volatile store, mainly for tests and short-lived hosts
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(lock(&self.tables)?.strings.get(key).cloned())
    }

    fn set_string(&self, key: &str, value: Option<&str>) -> Result<()> {
        let mut tables = lock(&self.tables)?;
        match value {
            Some(v) => tables.strings.insert(key.to_string(), v.to_string()),
            None => tables.strings.remove(key),
        };
        Ok(())
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        Ok(lock(&self.tables)?.bools.get(key).copied())
    }

    fn set_bool(&self, key: &str, value: bool) -> Result<()> {
        lock(&self.tables)?.bools.insert(key.to_string(), value);
        Ok(())
    }

    fn get_int(&self, key: &str) -> Result<Option<i64>> {
        Ok(lock(&self.tables)?.ints.get(key).copied())
    }

    fn set_int(&self, key: &str, value: i64) -> Result<()> {
        lock(&self.tables)?.ints.insert(key.to_string(), value);
        Ok(())
    }

    fn get_string_set(&self, key: &str) -> Result<BTreeSet<String>> {
        Ok(lock(&self.tables)?.sets.get(key).cloned().unwrap_or_default())
    }

    fn set_string_set(&self, key: &str, value: &BTreeSet<String>) -> Result<()> {
        lock(&self.tables)?.sets.insert(key.to_string(), value.clone());
        Ok(())
    }
}

/// Store backed by a TOML file, rewritten on every change
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    tables: Mutex<Tables>,
}

impl FileStore {
    /// Open (or lazily create) the store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let tables = if path.exists() {
            let contents = fs::read_to_string(&path)
                .map_err(|e| TunError::Storage(format!("Failed to read store: {e}")))?;
            toml::from_str(&contents)
                .map_err(|e| TunError::Storage(format!("Failed to parse store: {e}")))?
        } else {
            Tables::default()
        };

        Ok(Self {
            path,
            tables: Mutex::new(tables),
        })
    }

    fn update<F>(&self, apply: F) -> Result<()>
    where
        F: FnOnce(&mut Tables),
    {
        let mut tables = lock(&self.tables)?;
        apply(&mut tables);

        let contents = toml::to_string_pretty(&*tables)
            .map_err(|e| TunError::Storage(format!("Failed to serialize store: {e}")))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        // write-then-rename keeps the previous file intact on failure
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(lock(&self.tables)?.strings.get(key).cloned())
    }

    fn set_string(&self, key: &str, value: Option<&str>) -> Result<()> {
        self.update(|t| {
            match value {
                Some(v) => t.strings.insert(key.to_string(), v.to_string()),
                None => t.strings.remove(key),
            };
        })
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        Ok(lock(&self.tables)?.bools.get(key).copied())
    }

    fn set_bool(&self, key: &str, value: bool) -> Result<()> {
        self.update(|t| {
            t.bools.insert(key.to_string(), value);
        })
    }

    fn get_int(&self, key: &str) -> Result<Option<i64>> {
        Ok(lock(&self.tables)?.ints.get(key).copied())
    }

    fn set_int(&self, key: &str, value: i64) -> Result<()> {
        self.update(|t| {
            t.ints.insert(key.to_string(), value);
        })
    }

    fn get_string_set(&self, key: &str) -> Result<BTreeSet<String>> {
        Ok(lock(&self.tables)?.sets.get(key).cloned().unwrap_or_default())
    }

    fn set_string_set(&self, key: &str, value: &BTreeSet<String>) -> Result<()> {
        self.update(|t| {
            t.sets.insert(key.to_string(), value.clone());
        })
    }
}

/// Snapshot of everything persisted about the session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistedSession {
    pub last_config: Option<String>,
    pub should_be_running: bool,
    pub auto_start_on_boot: bool,
    pub auto_reconnect: bool,
    pub kill_switch: bool,
}

/// Typed view over a [`KeyValueStore`]
#[derive(Clone)]
pub struct SessionPersistence {
    store: Arc<dyn KeyValueStore>,
}

impl SessionPersistence {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    fn flag(&self, key: &str) -> bool {
        match self.store.get_bool(key) {
            Ok(v) => v.unwrap_or(false),
            Err(e) => {
                log::warn!("Failed to read '{key}': {e}");
                false
            }
        }
    }

    pub fn last_config(&self) -> Option<String> {
        self.store
            .get_string(KEY_LAST_CONFIG)
            .unwrap_or_else(|e| {
                log::warn!("Failed to read last config: {e}");
                None
            })
    }

    pub fn save_config(&self, config: &str) -> Result<()> {
        self.store.set_string(KEY_LAST_CONFIG, Some(config))
    }

    pub fn should_be_running(&self) -> bool {
        self.flag(KEY_SHOULD_BE_RUNNING)
    }

    pub fn set_should_be_running(&self, running: bool) -> Result<()> {
        self.store.set_bool(KEY_SHOULD_BE_RUNNING, running)
    }

    pub fn auto_start_on_boot(&self) -> bool {
        self.flag(KEY_AUTO_START)
    }

    pub fn set_auto_start_on_boot(&self, enabled: bool) -> Result<()> {
        self.store.set_bool(KEY_AUTO_START, enabled)
    }

    pub fn auto_reconnect(&self) -> bool {
        self.flag(KEY_AUTO_RECONNECT)
    }

    pub fn set_auto_reconnect(&self, enabled: bool) -> Result<()> {
        self.store.set_bool(KEY_AUTO_RECONNECT, enabled)
    }

    pub fn kill_switch(&self) -> bool {
        self.flag(KEY_KILL_SWITCH)
    }

    pub fn set_kill_switch(&self, enabled: bool) -> Result<()> {
        self.store.set_bool(KEY_KILL_SWITCH, enabled)
    }

    pub fn display_name(&self) -> Option<String> {
        self.store
            .get_string(KEY_DISPLAY_NAME)
            .ok()
            .flatten()
            .filter(|n| !n.is_empty())
    }

    pub fn set_display_name(&self, name: Option<&str>) -> Result<()> {
        self.store.set_string(KEY_DISPLAY_NAME, name)
    }

    /// Custom icon resource id; 0 means unset
    pub fn display_icon(&self) -> i64 {
        self.store
            .get_int(KEY_DISPLAY_ICON)
            .ok()
            .flatten()
            .unwrap_or(0)
    }

    pub fn set_display_icon(&self, icon: i64) -> Result<()> {
        self.store.set_int(KEY_DISPLAY_ICON, icon)
    }

    pub fn excluded_apps(&self) -> Result<BTreeSet<String>> {
        self.store.get_string_set(KEY_EXCLUDED_APPS)
    }

    pub fn set_excluded_apps(&self, apps: &BTreeSet<String>) -> Result<()> {
        self.store.set_string_set(KEY_EXCLUDED_APPS, apps)
    }

    pub fn snapshot(&self) -> PersistedSession {
        PersistedSession {
            last_config: self.last_config(),
            should_be_running: self.should_be_running(),
            auto_start_on_boot: self.auto_start_on_boot(),
            auto_reconnect: self.auto_reconnect(),
            kill_switch: self.kill_switch(),
        }
    }
}
