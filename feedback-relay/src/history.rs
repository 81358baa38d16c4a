//! Remembers the URL of the last task page the user closed.
//!
//! Each context that navigates to a task page gets its URL recorded under `HAI-<id>`. When
//! that context is closed the recorded URL becomes the last task URL, which the resolver
//! falls back to when no task page is open.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::browser::ContextId;
use crate::config::AppConfig;
use crate::constants::{tasks, CONTEXT_URL_MAP_STORAGE};
use crate::errors::RelayError;
use crate::storage::{self, context_url_key, Store, StoredData};

pub struct TaskUrlTracker {
    store: Arc<dyn Store>,
}

impl TaskUrlTracker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Records `url` for the context when it is a task page. Returns whether it was recorded.
    pub async fn context_updated(
        &self,
        config: &AppConfig,
        id: ContextId,
        url: &str,
    ) -> Result<bool, RelayError> {
        if !config.tasks_remember_last || !url.starts_with(tasks::MULTIMANGO_PREFIX) {
            return Ok(false);
        }
        storage::save(
            self.store.as_ref(),
            &context_url_key(id),
            Value::String(url.to_string()),
            CONTEXT_URL_MAP_STORAGE,
        )
        .await?;
        debug!(id, url, "Recorded task url for context");
        Ok(true)
    }

    /// Promotes the closed context's task URL to the last task URL and forgets the context.
    pub async fn context_removed(
        &self,
        config: &AppConfig,
        id: ContextId,
    ) -> Result<Option<String>, RelayError> {
        if !config.tasks_remember_last {
            return Ok(None);
        }
        let key = context_url_key(id);
        let recorded: Option<String> =
            storage::load_as(self.store.as_ref(), &key, CONTEXT_URL_MAP_STORAGE).await?;
        let Some(url) = recorded.filter(|u| u.trim().starts_with(tasks::MULTIMANGO_PREFIX)) else {
            return Ok(None);
        };
        storage::save(
            self.store.as_ref(),
            StoredData::LastTaskUrl.key(),
            Value::String(url.clone()),
            config.storage_last_task_url,
        )
        .await?;
        storage::remove(self.store.as_ref(), &key, CONTEXT_URL_MAP_STORAGE).await?;
        info!(id, url = %url, "Remembered last task url");
        Ok(Some(url))
    }
}
