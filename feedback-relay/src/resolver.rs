//! Resolves which task is active and which ratings apply to it.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{error, info, instrument, warn};

use crate::browser::{find_contexts, send_by_url, Browser, ExecutionContext};
use crate::channel::{Action, MessageChannel};
use crate::config::AppConfig;
use crate::constants::{qa_feedback, tasks, timeouts};
use crate::errors::RelayError;
use crate::storage::{self, Store, StoredData};
use crate::types::{
    extract_task_id, extract_task_slug, CachedRatings, Ratings, RatingsPreview, TaskIdentity,
};

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTask {
    pub identity: TaskIdentity,
    /// The live context the identity came from, if any.
    pub context: Option<ExecutionContext>,
}

pub struct Resolver {
    browser: Arc<dyn Browser>,
    channel: MessageChannel,
    store: Arc<dyn Store>,
}

impl Resolver {
    pub fn new(browser: Arc<dyn Browser>, channel: MessageChannel, store: Arc<dyn Store>) -> Self {
        Self {
            browser,
            channel,
            store,
        }
    }

    /// Chooses the task context among candidates in enumeration order.
    ///
    /// Active contexts rank above inactive ones; ties keep enumeration order. Contexts without
    /// a URL are never chosen unless the configuration asks for the first one.
    pub fn pick_task_context(
        config: &AppConfig,
        candidates: Vec<ExecutionContext>,
    ) -> Option<ExecutionContext> {
        if config.tasks_always_pick_first {
            info!("Picking first task context - ALWAYS_PICK_FIRST_TASK=true");
            return candidates.into_iter().next();
        }
        let mut ranked: Vec<(ExecutionContext, u8)> = candidates
            .into_iter()
            .filter(|c| c.url.is_some())
            .map(|c| {
                let score = u8::from(c.active);
                (c, score)
            })
            .collect();
        // sort_by is stable
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        if ranked.is_empty() {
            error!("All task rankings are null");
            return None;
        }
        info!(
            ranked = ?ranked.iter().map(|(c, s)| (c.id, *s)).collect::<Vec<_>>(),
            "Picking from ranked task contexts - ALWAYS_PICK_FIRST_TASK=false"
        );
        ranked.into_iter().next().map(|(c, _)| c)
    }

    #[instrument(level = "debug", skip_all)]
    pub async fn resolve_task(&self, config: &AppConfig) -> Result<ResolvedTask, RelayError> {
        let mut task_id = None;
        let mut task_slug = None;
        let mut context = None;

        match find_contexts(self.browser.as_ref(), tasks::MULTIMANGO_URL).await {
            Ok(candidates) => {
                if let Some(chosen) = Self::pick_task_context(config, candidates) {
                    match chosen.url.as_deref() {
                        Some(url) => {
                            task_id = extract_task_id(url);
                            task_slug = extract_task_slug(url);
                            if task_id.is_none() || task_slug.is_none() {
                                error!("Could not extract task identity from url: {}", url);
                            } else {
                                info!(
                                    task_id = ?task_id,
                                    task_slug = ?task_slug,
                                    "Found task in open context"
                                );
                            }
                        }
                        None => error!("Could not find url in task context"),
                    }
                    context = Some(chosen);
                }
            }
            Err(e) => error!("Could not find any task contexts: {}", e),
        }

        let mut fallback_error = None;
        if (task_id.is_none() || task_slug.is_none()) && config.tasks_remember_last {
            warn!("No open task id found. Looking for stored ids");
            match storage::load_as::<String>(
                self.store.as_ref(),
                StoredData::LastTaskUrl.key(),
                config.storage_last_task_url,
            )
            .await
            {
                Ok(Some(url)) => {
                    info!("Found stored url: {}", url);
                    match extract_task_id(&url) {
                        Some(id) => {
                            info!("Found stored task id: {}", id);
                            task_id = Some(id);
                        }
                        None => warn!("No task id found in stored url"),
                    }
                    match extract_task_slug(&url) {
                        Some(slug) => {
                            info!("Found stored task slug: {}", slug);
                            task_slug = Some(slug);
                        }
                        None => warn!("No task slug found in stored url"),
                    }
                }
                Ok(None) => warn!("No stored task url found"),
                Err(e) => {
                    warn!("Could not load stored task url: {}", e);
                    fallback_error = Some(e);
                }
            }
        }

        match (task_id, task_slug) {
            (Some(id), Some(slug)) => Ok(ResolvedTask {
                identity: TaskIdentity { id, slug },
                context,
            }),
            (id, slug) => {
                if id.is_none() {
                    error!("No task id found");
                }
                if slug.is_none() {
                    error!("No task slug found");
                }
                Err(match fallback_error {
                    Some(e @ RelayError::PermissionDenied(_)) => e,
                    _ => RelayError::ResourceNotFound(
                        "task id and slug could not be resolved".into(),
                    ),
                })
            }
        }
    }

    /// Returns the ratings for this run, reusing the cache when the task page's preview
    /// still agrees with it.
    #[instrument(level = "debug", skip_all)]
    pub async fn resolve_ratings(
        &self,
        config: &AppConfig,
        task_context: Option<&ExecutionContext>,
    ) -> Result<Ratings, RelayError> {
        let remember = config.feedback_remember_ratings;
        let preview = match task_context {
            Some(context) if remember => self.read_preview(context).await,
            _ => None,
        };
        info!(?preview, "Ratings preview info");

        if let Some(preview) = preview {
            if let Some(CachedRatings(cached, saved_at)) = self.load_cached(config).await {
                if preview.matches(&cached) {
                    info!(saved_at = %saved_at, "Ratings info unchanged. Using saved ratings...");
                    return Ok(cached);
                }
            }
        }

        info!("Ratings info changed. Updating ratings...");
        let ratings = self.read_full_ratings().await?;
        info!(?ratings, "New ratings info");
        if remember {
            let entry = CachedRatings(ratings, Utc::now().timestamp_millis().to_string());
            if let Err(e) = storage::save_as(
                self.store.as_ref(),
                StoredData::Ratings.key(),
                &entry,
                config.storage_ratings,
            )
            .await
            {
                warn!("Could not cache ratings: {}", e);
            }
        }
        Ok(ratings)
    }

    async fn read_preview(&self, context: &ExecutionContext) -> Option<RatingsPreview> {
        let preview = self
            .channel
            .send_to_context(
                context.id,
                Action::ReadRatingsPreview,
                Value::Null,
                timeouts::MSG,
            )
            .await
            .and_then(|response| response.into_data::<Option<RatingsPreview>>());
        match preview {
            Ok(preview) => preview,
            Err(e) => {
                warn!("Could not read ratings preview: {}", e);
                None
            }
        }
    }

    async fn load_cached(&self, config: &AppConfig) -> Option<CachedRatings> {
        match storage::load_as::<CachedRatings>(
            self.store.as_ref(),
            StoredData::Ratings.key(),
            config.storage_ratings,
        )
        .await
        {
            Ok(cached) => cached,
            Err(e) => {
                warn!("Could not load saved ratings: {}", e);
                None
            }
        }
    }

    async fn read_full_ratings(&self) -> Result<Ratings, RelayError> {
        let response = send_by_url(
            self.browser.as_ref(),
            &self.channel,
            qa_feedback::URL,
            Action::ReadFullRatings,
            Value::Null,
            true,
            timeouts::MSG,
        )
        .await
        .map_err(|e| {
            error!("Failed to get ratings info from QA feedback page: {}", e);
            e
        })?;
        response.into_data::<Option<Ratings>>()?.ok_or_else(|| {
            error!("QA feedback page returned no ratings");
            RelayError::ResourceNotFound("QA feedback page returned no ratings".into())
        })
    }
}
