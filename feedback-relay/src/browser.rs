//! Browser contexts (tab + window) and the helpers that locate, open, focus and validate them.
//!
//! Contexts are owned by the browser, not by this crate: the user can close, navigate or
//! refocus them at any moment. Every helper re-reads a context before acting on it and
//! reports a context that changed underneath as [`RelayError::StaleState`].

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, instrument, warn};

use crate::channel::{Action, MessageChannel, Response};
use crate::constants::timeouts;
use crate::errors::RelayError;
use crate::poll::{wait_for_condition, DEFAULT_POLL_STEP};

pub type ContextId = i64;
pub type WindowId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStatus {
    Loading,
    Complete,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub id: ContextId,
    pub window_id: WindowId,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub status: LoadStatus,
    #[serde(default)]
    pub active: bool,
}

impl ExecutionContext {
    /// Loaded and showing a real page.
    pub fn is_ready(&self) -> bool {
        let has_url = self
            .url
            .as_deref()
            .is_some_and(|u| !u.is_empty() && u != "about:blank");
        self.status == LoadStatus::Complete && has_url
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowState {
    pub id: WindowId,
    pub focused: bool,
}

/// Tab and window operations of the hosting browser.
#[async_trait]
pub trait Browser: Send + Sync {
    /// Contexts whose URL matches a match pattern, in the browser's enumeration order.
    async fn query(&self, pattern: &str) -> Result<Vec<ExecutionContext>, RelayError>;

    async fn get(&self, id: ContextId) -> Result<ExecutionContext, RelayError>;

    async fn create(&self, url: &str) -> Result<ExecutionContext, RelayError>;

    /// Reloads bypassing the cache.
    async fn reload(&self, id: ContextId) -> Result<(), RelayError>;

    async fn activate(&self, id: ContextId) -> Result<ExecutionContext, RelayError>;

    async fn focus_window(&self, id: WindowId) -> Result<WindowState, RelayError>;
}

/// Checks `url` against a match pattern where `*` stands for any run of characters.
pub fn url_matches(pattern: &str, url: &str) -> bool {
    let body = regex::escape(pattern).replace(r"\*", ".*");
    match Regex::new(&format!("^{body}$")) {
        Ok(re) => re.is_match(url),
        Err(e) => {
            warn!(pattern, "Invalid url pattern: {}", e);
            false
        }
    }
}

pub async fn find_contexts(
    browser: &dyn Browser,
    pattern: &str,
) -> Result<Vec<ExecutionContext>, RelayError> {
    let contexts = browser.query(pattern).await.map_err(|e| {
        error!("Critical browser error during context query: {}", e);
        e
    })?;
    if contexts.is_empty() {
        warn!(pattern, "No contexts found");
        return Err(RelayError::ResourceNotFound(format!(
            "no contexts match {pattern}"
        )));
    }
    info!(pattern, count = contexts.len(), "Found existing contexts");
    Ok(contexts)
}

pub async fn create_context(
    browser: &dyn Browser,
    url: &str,
) -> Result<ExecutionContext, RelayError> {
    match browser.create(url).await {
        Ok(context) => {
            info!(url, id = context.id, "Created new context");
            Ok(context)
        }
        Err(e) => {
            error!(url, "Failed to create context: {}", e);
            Err(e)
        }
    }
}

/// Waits until a context has finished loading a real page.
///
/// A context whose status is unknown is reloaded first when `reload_if_unknown` is set.
pub async fn confirm_loading_complete(
    browser: &dyn Browser,
    id: ContextId,
    reload_if_unknown: bool,
    timeout: Duration,
) -> Result<ExecutionContext, RelayError> {
    let now = browser.get(id).await?;
    if now.is_ready() {
        return Ok(now);
    }
    if reload_if_unknown && now.status == LoadStatus::Unknown {
        if let Err(e) = browser.reload(id).await {
            warn!(id, "Failed to refresh context: {}", e);
        }
    }
    let loaded = wait_for_condition(
        move || async move { browser.get(id).await.map(|c| c.is_ready()) },
        timeout,
        DEFAULT_POLL_STEP,
    )
    .await;
    if !loaded {
        error!(id, url = ?now.url, "Could not wait for context to complete loading");
        return Err(RelayError::Timeout(format!(
            "context {id} did not finish loading within {timeout:?}"
        )));
    }
    let context = browser.get(id).await?;
    info!(id, url = ?context.url, "Context finished loading");
    Ok(context)
}

/// Returns the first context matching `url`, opening one when none exists.
#[instrument(level = "debug", skip(browser))]
pub async fn find_or_create_context(
    browser: &dyn Browser,
    url: &str,
    wait_for_loading: bool,
    refresh_if_found: bool,
    page_load_timeout: Duration,
) -> Result<ExecutionContext, RelayError> {
    let target = match find_contexts(browser, url).await {
        Ok(contexts) => {
            let first = contexts[0].clone();
            if refresh_if_found {
                browser.reload(first.id).await?;
                info!(id = first.id, "Refreshed context");
                return confirm_loading_complete(browser, first.id, false, page_load_timeout)
                    .await;
            }
            first
        }
        Err(RelayError::ResourceNotFound(_)) => create_context(browser, url).await?,
        Err(e) => return Err(e),
    };
    if !wait_for_loading {
        return Ok(target);
    }
    confirm_loading_complete(browser, target.id, true, page_load_timeout).await
}

/// Checks that a context is loaded, active, in a focused window and (optionally) still on
/// `expected_url`.
pub fn validate_focus(
    expected_url: Option<&str>,
    context: &ExecutionContext,
    window: &WindowState,
) -> Result<(), RelayError> {
    let stale = |reason: String| {
        error!("{}", reason);
        Err(RelayError::StaleState(reason))
    };
    if context.window_id != window.id {
        return stale(format!(
            "context window {} does not match focused window {}",
            context.window_id, window.id
        ));
    }
    if context.status != LoadStatus::Complete {
        return stale(format!("context is not ready. Status: {:?}", context.status));
    }
    if let Some(expected) = expected_url {
        if context.url.as_deref() != Some(expected) {
            return stale(format!(
                "context url does not match. Expected: {expected} Actual: {:?}",
                context.url
            ));
        }
    }
    if !context.active {
        return stale("context is not active".into());
    }
    if !window.focused {
        return stale("window is not focused".into());
    }
    info!("Context and window focus validation successful.");
    Ok(())
}

/// Brings a context and its window to the front, re-reading both afterwards.
pub async fn focus_context_and_window(
    browser: &dyn Browser,
    context: &ExecutionContext,
    validate: bool,
    expected_url: Option<&str>,
) -> Result<(ExecutionContext, WindowState), RelayError> {
    let activated = browser.activate(context.id).await?;
    if !activated.active {
        error!(url = ?context.url, "Failed to bring context to focus");
        return Err(RelayError::StaleState(format!(
            "context {} did not become active",
            context.id
        )));
    }
    info!(id = activated.id, url = ?activated.url, "Brought context to focus");
    let window = browser.focus_window(activated.window_id).await?;
    if !window.focused {
        error!(
            url = ?context.url,
            "Failed to bring window to focus. It might have been closed."
        );
        return Err(RelayError::StaleState(format!(
            "window {} did not take focus",
            activated.window_id
        )));
    }
    if validate {
        validate_focus(expected_url, &activated, &window)?;
    }
    Ok((activated, window))
}

/// Sends a context-scoped message to the first context matching `pattern`.
///
/// With `open_if_missing`, `pattern` must be a concrete URL: it is opened and waited for.
pub async fn send_by_url(
    browser: &dyn Browser,
    channel: &MessageChannel,
    pattern: &str,
    action: Action,
    value: Value,
    open_if_missing: bool,
    timeout: Duration,
) -> Result<Response, RelayError> {
    let target = match find_contexts(browser, pattern).await {
        Ok(contexts) => contexts[0].clone(),
        Err(RelayError::ResourceNotFound(_)) if open_if_missing => {
            info!("No context found with url: {}. Creating new context.", pattern);
            let created = create_context(browser, pattern).await?;
            confirm_loading_complete(browser, created.id, false, timeouts::PAGE_LOAD).await?
        }
        Err(e) => {
            error!("No context found with url: {}. Cannot send message: {}", pattern, action);
            return Err(e);
        }
    };
    channel
        .send_to_context(target.id, action, value, timeout)
        .await
}
