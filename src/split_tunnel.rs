//! Split-tunnel registry
//!
//! Persisted set of application identifiers whose traffic bypasses the
//! tunnel. Read when the interface is built, written by user toggles.

use crate::error::Result;
use crate::storage::SessionPersistence;
use std::collections::BTreeSet;
use std::sync::Mutex;

pub struct ExclusionRegistry {
    persistence: SessionPersistence,
    members: Mutex<BTreeSet<String>>,
}

impl ExclusionRegistry {
    /// Create the registry and load the persisted set
    pub fn new(persistence: SessionPersistence) -> Self {
        let registry = Self {
            persistence,
            members: Mutex::new(BTreeSet::new()),
        };
        registry.reload();
        registry
    }

    fn reload(&self) {
        match self.persistence.excluded_apps() {
            Ok(saved) => {
                if let Ok(mut members) = self.members.lock() {
                    *members = saved;
                }
            }
            Err(e) => log::warn!("Failed to load excluded applications: {e}"),
        }
    }

    /// Flip membership of `app_id` and persist the full set.
    /// Returns whether the application is now excluded.
    pub fn toggle(&self, app_id: &str) -> Result<bool> {
        let mut members = self.members.lock().map_err(|_| {
            crate::error::TunError::Storage("exclusion registry lock poisoned".to_string())
        })?;

        let excluded = if members.remove(app_id) {
            false
        } else {
            members.insert(app_id.to_string());
            true
        };
        self.persistence.set_excluded_apps(&members)?;

        log::info!(
            "Split tunnel: {app_id} {}",
            if excluded { "excluded" } else { "included" }
        );
        Ok(excluded)
    }

    /// Current set. An empty in-memory set is refreshed from persistence
    /// first, covering the first query after a restart.
    pub fn members(&self) -> BTreeSet<String> {
        let empty = self.members.lock().map(|m| m.is_empty()).unwrap_or(true);
        if empty {
            self.reload();
        }
        self.members
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, app_id: &str) -> bool {
        self.members().contains(app_id)
    }

    /// Applications to disallow on the interface: every member except the
    /// host application itself
    pub fn disallowed_for(&self, host_app_id: &str) -> BTreeSet<String> {
        let mut apps = self.members();
        apps.remove(host_app_id);
        apps
    }
}
