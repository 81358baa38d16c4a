//! Orchestrator pipeline: resolve task and ratings, optionally capture the QA feedback page,
//! hand everything to the handshake executor and report the outcome on the page.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{error, info, instrument, warn};

use crate::browser::{
    confirm_loading_complete, find_contexts, focus_context_and_window, send_by_url, Browser,
};
use crate::capture::{capture_qa_feedback, Downloader};
use crate::channel::{Action, Endpoint, Envelope, MessageChannel, Response, Status, Transport};
use crate::config::AppConfig;
use crate::constants::{tasks, timeouts, FAILURE_NOTICE, SUCCESS_NOTICE};
use crate::errors::RelayError;
use crate::executor::HandshakeJob;
use crate::resolver::Resolver;
use crate::session::SessionGate;
use crate::storage::Store;

pub struct Orchestrator {
    browser: Arc<dyn Browser>,
    channel: MessageChannel,
    store: Arc<dyn Store>,
    resolver: Resolver,
    downloader: Option<Arc<dyn Downloader>>,
    gate: SessionGate,
}

impl Orchestrator {
    pub fn new(
        browser: Arc<dyn Browser>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn Store>,
    ) -> Self {
        let channel = MessageChannel::new(transport);
        let resolver = Resolver::new(browser.clone(), channel.clone(), store.clone());
        Self {
            browser,
            channel,
            store,
            resolver,
            downloader: None,
            gate: SessionGate::new(),
        }
    }

    pub fn with_downloader(mut self, downloader: Arc<dyn Downloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    pub fn gate(&self) -> &SessionGate {
        &self.gate
    }

    /// One pipeline run. Any stage failure ends the run; fields already written stay written.
    #[instrument(skip_all)]
    pub async fn run(&self, config: &AppConfig) -> Result<(), RelayError> {
        info!("Getting task data...");
        let task = self.resolver.resolve_task(config).await?;

        info!("Getting ratings data...");
        let ratings = self
            .resolver
            .resolve_ratings(config, task.context.as_ref())
            .await?;

        if config.feedback_screenshot {
            info!("Capturing QA feedback page...");
            match capture_qa_feedback(
                self.browser.as_ref(),
                &self.channel,
                self.store.as_ref(),
                self.downloader.as_deref(),
            )
            .await
            {
                Ok(capture) => info!(download_id = ?capture.download_id, "QA feedback captured"),
                Err(e) => warn!("QA feedback capture failed: {}", e),
            }
        }

        info!("Writing handshake...");
        let job = HandshakeJob {
            config: config.clone(),
            task: task.identity,
            ratings,
        };
        self.write_handshake(&job).await
    }

    async fn write_handshake(&self, job: &HandshakeJob) -> Result<(), RelayError> {
        let browser = self.browser.as_ref();
        let contexts = find_contexts(browser, tasks::HANDSHAKE_URL)
            .await
            .map_err(|e| {
                error!("Could not find any handshake contexts");
                e
            })?;
        let first = &contexts[0];
        let loaded = confirm_loading_complete(browser, first.id, true, timeouts::PAGE_LOAD).await?;
        let (focused, _) = focus_context_and_window(browser, &loaded, true, None).await?;

        let response = self
            .channel
            .send_to_context(
                focused.id,
                Action::WriteHandshake,
                job.to_payload()?,
                timeouts::MSG,
            )
            .await?;
        info!(status = ?response.status, "Handshake executor answered");
        if response.into_data::<bool>()? {
            Ok(())
        } else {
            Err(RelayError::RemoteFailure(
                "handshake executor reported failure".into(),
            ))
        }
    }

    /// Handles runtime messages until the endpoint is closed.
    pub async fn serve(self: Arc<Self>, mut endpoint: Endpoint) {
        info!(target = %endpoint.target(), "Orchestrator listening");
        while let Some(envelope) = endpoint.recv().await {
            let this = self.clone();
            tokio::spawn(async move { this.handle_trigger(envelope).await });
        }
        info!("Orchestrator endpoint closed");
    }

    /// Answers one `RUN`: `{status, data: bool}`, followed by a notification on the handshake
    /// page.
    pub async fn handle_trigger(&self, envelope: Envelope) {
        let action = envelope.message.action;
        info!("Background starting: {}", action);
        if action != Action::Run {
            envelope.respond(Response::failed(
                Value::Bool(false),
                format!("{action} is not handled by the orchestrator"),
            ));
            return;
        }
        let Some(session) = self.gate.try_begin() else {
            warn!("Run already in progress. Refusing trigger.");
            envelope.respond(Response::busy());
            return;
        };

        let config = AppConfig::load_or_default(self.store.as_ref()).await;
        info!(?config, session = %session.id(), "Configs");
        let outcome = self.run(&config).await;
        let success = outcome.is_ok();
        let response = match outcome {
            Ok(()) => {
                info!("Run result success: true");
                Response::success(Value::Bool(true))
            }
            Err(e) => {
                error!("Run result success: false. {}", e);
                Response::failed(Value::Bool(false), e.to_string())
            }
        };
        envelope.respond(response);

        if let Err(e) = self.notify(success).await {
            warn!("Could not show run result: {}", e);
        }
        info!("Background finished: {}", action);
    }

    /// Shows the run result on the first handshake page. Never opens one.
    pub async fn notify(&self, success: bool) -> Result<(), RelayError> {
        let notice = if success {
            SUCCESS_NOTICE
        } else {
            FAILURE_NOTICE
        };
        let duration_ms = u64::try_from(timeouts::NOTIFICATION.as_millis()).unwrap_or(u64::MAX);
        let shown = send_by_url(
            self.browser.as_ref(),
            &self.channel,
            tasks::HANDSHAKE_URL,
            Action::ShowResult,
            json!([notice, duration_ms]),
            false,
            timeouts::MSG,
        )
        .await?
        .into_data::<bool>()?;
        if !shown {
            return Err(RelayError::RemoteFailure("notification was not shown".into()));
        }
        Ok(())
    }
}

/// Sends `RUN` to the orchestrator and returns the reported pipeline result.
///
/// An explicit failure response is `Ok(false)`; no answer, a busy orchestrator or a missing
/// listener are errors.
pub async fn request_run(channel: &MessageChannel) -> Result<bool, RelayError> {
    let response = channel
        .send_runtime(Action::Run, Value::Null, timeouts::RUN)
        .await?;
    match response.status {
        Status::Busy => Err(RelayError::Busy(
            response
                .error
                .unwrap_or_else(|| "a run is already in progress".into()),
        )),
        Status::Success | Status::Failed => Ok(response.data.as_bool().unwrap_or(false)),
    }
}
