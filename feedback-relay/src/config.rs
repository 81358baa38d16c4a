//! Run configuration.
//!
//! An [`AppConfig`] is supplied once per pipeline run and never mutated during it. It travels
//! inside the `WRITE_HANDSHAKE` payload, so its wire names follow the extension's settings
//! object (camelCase, intervals in milliseconds).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::constants::SETTINGS_STORAGE;
use crate::errors::RelayError;
use crate::storage::{self, StorageScope, Store, StoredData};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub run_on_click: bool,
    pub run_on_task_change: bool,
    pub tasks_always_pick_first: bool,
    pub tasks_remember_last: bool,
    pub feedback_remember_ratings: bool,
    pub feedback_screenshot: bool,
    /// Retry budget of every executor stage (attempts = tries + 1).
    pub ep_max_tries: u32,
    #[serde(rename = "epInterval")]
    pub ep_interval_ms: u64,
    #[serde(rename = "epTimeout")]
    pub ep_timeout_ms: u64,
    pub storage_ratings: StorageScope,
    pub storage_last_task_url: StorageScope,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            run_on_click: false,
            run_on_task_change: false,
            tasks_always_pick_first: false,
            tasks_remember_last: false,
            feedback_remember_ratings: false,
            feedback_screenshot: false,
            ep_max_tries: 120,
            ep_interval_ms: 1_000,
            ep_timeout_ms: 1_000,
            storage_ratings: StorageScope::Sync,
            storage_last_task_url: StorageScope::Session,
        }
    }
}

impl AppConfig {
    pub fn ep_interval(&self) -> Duration {
        Duration::from_millis(self.ep_interval_ms)
    }

    pub fn ep_timeout(&self) -> Duration {
        Duration::from_millis(self.ep_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if self.ep_interval_ms == 0 {
            return Err(RelayError::InvalidPayload(
                "epInterval must be greater than zero".into(),
            ));
        }
        if self.ep_timeout_ms == 0 {
            return Err(RelayError::InvalidPayload(
                "epTimeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Reads a settings object from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RelayError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        info!(path = %path.display(), "Loaded settings file");
        Ok(config)
    }

    /// Loads the stored settings, falling back to defaults when nothing usable is stored.
    pub async fn load_or_default(store: &dyn Store) -> Self {
        match storage::load_as::<AppConfig>(store, StoredData::Settings.key(), SETTINGS_STORAGE)
            .await
        {
            Ok(Some(config)) => match config.validate() {
                Ok(()) => config,
                Err(e) => {
                    warn!("Stored settings rejected, using defaults: {}", e);
                    AppConfig::default()
                }
            },
            Ok(None) => AppConfig::default(),
            Err(e) => {
                warn!("Could not load settings, using defaults: {}", e);
                AppConfig::default()
            }
        }
    }
}
