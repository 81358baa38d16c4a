//! Persisted state behind a scoped key/value store.
//!
//! Each key is bound to one durability scope chosen per key by configuration. The store checks
//! its storage permission before every access and reports a missing grant as
//! [`RelayError::PermissionDenied`] without retrying.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::errors::RelayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StorageScope {
    /// Never persisted; every access is skipped.
    None,
    /// Process-durable, local to this machine.
    Local,
    /// Account-synced.
    Sync,
    /// Volatile, cleared when the browser session ends.
    Session,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredData {
    /// `[Ratings, savedTime]`
    Ratings,
    /// `[imageUrl, downloadId, savedTime]`
    QaCapture,
    Settings,
    LastTaskUrl,
}

impl StoredData {
    pub fn key(&self) -> &'static str {
        match self {
            StoredData::Ratings => "RATINGS",
            StoredData::QaCapture => "QA_CAPTURE",
            StoredData::Settings => "SETTINGS",
            StoredData::LastTaskUrl => "LAST_TASK_URL",
        }
    }
}

/// Key under which the last URL seen in a context is remembered.
pub fn context_url_key(context_id: i64) -> String {
    format!("HAI-{context_id}")
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn has_permission(&self) -> bool;

    async fn read(&self, key: &str, scope: StorageScope) -> Result<Option<Value>, RelayError>;

    async fn write(&self, key: &str, value: Value, scope: StorageScope)
        -> Result<(), RelayError>;

    async fn delete(&self, key: &str, scope: StorageScope) -> Result<(), RelayError>;
}

async fn check_access(store: &dyn Store, scope: StorageScope, op: &str) -> Result<(), RelayError> {
    if scope == StorageScope::None {
        warn!("Tried to {} data with storage scope NONE. Skipping.", op);
        return Err(RelayError::Unsupported(format!(
            "cannot {op} data with storage scope NONE"
        )));
    }
    if !store.has_permission().await {
        error!("Missing required permission: storage to {} data.", op);
        return Err(RelayError::PermissionDenied(format!(
            "storage permission required to {op} data"
        )));
    }
    Ok(())
}

pub async fn save(
    store: &dyn Store,
    key: &str,
    value: Value,
    scope: StorageScope,
) -> Result<(), RelayError> {
    check_access(store, scope, "save").await?;
    match store.write(key, value, scope).await {
        Ok(()) => {
            info!(key, ?scope, "Saved data");
            Ok(())
        }
        Err(e) => {
            error!(key, ?scope, "Failed to save data: {}", e);
            Err(e)
        }
    }
}

pub async fn save_as<T: Serialize>(
    store: &dyn Store,
    key: &str,
    value: &T,
    scope: StorageScope,
) -> Result<(), RelayError> {
    save(store, key, serde_json::to_value(value)?, scope).await
}

pub async fn load(
    store: &dyn Store,
    key: &str,
    scope: StorageScope,
) -> Result<Option<Value>, RelayError> {
    check_access(store, scope, "load").await?;
    let loaded = store.read(key, scope).await?;
    match &loaded {
        Some(_) => info!(key, ?scope, "Loaded data"),
        None => debug!(key, ?scope, "No data stored"),
    }
    Ok(loaded)
}

/// Loads and decodes a stored value. A value of the wrong shape is an
/// [`RelayError::InvalidPayload`], not an absent one.
pub async fn load_as<T: DeserializeOwned>(
    store: &dyn Store,
    key: &str,
    scope: StorageScope,
) -> Result<Option<T>, RelayError> {
    match load(store, key, scope).await? {
        Some(value) => serde_json::from_value(value).map(Some).map_err(|e| {
            error!(key, "Failed to decode stored data: {}", e);
            RelayError::InvalidPayload(format!("stored {key}: {e}"))
        }),
        None => Ok(None),
    }
}

pub async fn remove(store: &dyn Store, key: &str, scope: StorageScope) -> Result<(), RelayError> {
    check_access(store, scope, "remove").await?;
    store.delete(key, scope).await?;
    info!(key, ?scope, "Removed data");
    Ok(())
}

type ScopeMap = HashMap<StorageScope, HashMap<String, Value>>;

/// Keeps every scope in memory.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<ScopeMap>,
    denied: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose storage permission was never granted.
    pub fn without_permission() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
            denied: true,
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn has_permission(&self) -> bool {
        !self.denied
    }

    async fn read(&self, key: &str, scope: StorageScope) -> Result<Option<Value>, RelayError> {
        let data = self.data.lock().await;
        Ok(data.get(&scope).and_then(|m| m.get(key)).cloned())
    }

    async fn write(
        &self,
        key: &str,
        value: Value,
        scope: StorageScope,
    ) -> Result<(), RelayError> {
        let mut data = self.data.lock().await;
        data.entry(scope).or_default().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str, scope: StorageScope) -> Result<(), RelayError> {
        let mut data = self.data.lock().await;
        if let Some(m) = data.get_mut(&scope) {
            m.remove(key);
        }
        Ok(())
    }
}

/// Keeps the session scope in memory and persists the local and sync scopes as one JSON
/// object per scope under a state directory.
pub struct JsonFileStore {
    dir: PathBuf,
    session: Mutex<HashMap<String, Value>>,
    // Serializes read-modify-write cycles on the scope files.
    file_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            session: Mutex::new(HashMap::new()),
            file_lock: Mutex::new(()),
        }
    }

    fn scope_file(&self, scope: StorageScope) -> PathBuf {
        let name = match scope {
            StorageScope::Local => "local.json",
            StorageScope::Sync => "sync.json",
            StorageScope::Session | StorageScope::None => "session.json",
        };
        self.dir.join(name)
    }

    async fn read_scope(&self, scope: StorageScope) -> Result<HashMap<String, Value>, RelayError> {
        match tokio::fs::read_to_string(self.scope_file(scope)).await {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_scope(
        &self,
        scope: StorageScope,
        entries: &HashMap<String, Value>,
    ) -> Result<(), RelayError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let raw = serde_json::to_string_pretty(entries)?;
        tokio::fs::write(self.scope_file(scope), raw).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for JsonFileStore {
    async fn has_permission(&self) -> bool {
        true
    }

    async fn read(&self, key: &str, scope: StorageScope) -> Result<Option<Value>, RelayError> {
        if scope == StorageScope::Session {
            return Ok(self.session.lock().await.get(key).cloned());
        }
        let _guard = self.file_lock.lock().await;
        Ok(self.read_scope(scope).await?.remove(key))
    }

    async fn write(
        &self,
        key: &str,
        value: Value,
        scope: StorageScope,
    ) -> Result<(), RelayError> {
        if scope == StorageScope::Session {
            self.session.lock().await.insert(key.to_string(), value);
            return Ok(());
        }
        let _guard = self.file_lock.lock().await;
        let mut entries = self.read_scope(scope).await?;
        entries.insert(key.to_string(), value);
        self.write_scope(scope, &entries).await
    }

    async fn delete(&self, key: &str, scope: StorageScope) -> Result<(), RelayError> {
        if scope == StorageScope::Session {
            self.session.lock().await.remove(key);
            return Ok(());
        }
        let _guard = self.file_lock.lock().await;
        let mut entries = self.read_scope(scope).await?;
        if entries.remove(key).is_some() {
            self.write_scope(scope, &entries).await?;
        }
        Ok(())
    }
}
