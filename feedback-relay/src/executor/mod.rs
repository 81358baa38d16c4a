//! Page-embedded executor for the handshake task page.
//!
//! The executor owns a [`Page`] and is reachable only through its [`Endpoint`]. It admits one
//! session at a time and answers overlapping messages with an explicit busy status.

pub mod handshake;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{error, info, instrument};

use crate::channel::{Action, Endpoint, Message, Response};
use crate::constants::tasks;
use crate::page::Page;
use crate::session::{SessionGate, SessionToken};

pub use handshake::{
    region_matches, HandshakeJob, HandshakeRun, HandshakeStage, RatingField, ValidationHistory,
};

pub struct HandshakeExecutor {
    page: Arc<dyn Page>,
    gate: SessionGate,
}

impl HandshakeExecutor {
    pub fn new(page: Arc<dyn Page>) -> Self {
        Self {
            page,
            gate: SessionGate::new(),
        }
    }

    pub fn gate(&self) -> &SessionGate {
        &self.gate
    }

    /// Answers messages until the endpoint is closed. Each message is handled on its own task
    /// so that overlapping messages reach the gate instead of queueing behind a session.
    pub async fn serve(self: Arc<Self>, mut endpoint: Endpoint) {
        info!(target = %endpoint.target(), "Handshake executor loaded into page");
        while let Some(envelope) = endpoint.recv().await {
            let this = self.clone();
            tokio::spawn(async move {
                let response = this.handle(&envelope.message).await;
                envelope.respond(response);
            });
        }
        info!(target = %endpoint.target(), "Handshake executor endpoint closed");
    }

    #[instrument(skip(self, message), fields(action = %message.action))]
    pub async fn handle(&self, message: &Message) -> Response {
        info!("Handshake executor starting: {}", message.action);
        match self.page.location().await {
            Ok(url) if url.trim().starts_with(tasks::HANDSHAKE_PREFIX) => {}
            Ok(url) => {
                error!("Current url is not a handshake task url. Current url: {}", url);
                return Response::failed(
                    Value::Bool(false),
                    "Current url is not a handshake task url",
                );
            }
            Err(e) => {
                error!("Could not read page location: {}", e);
                return Response::failed(Value::Bool(false), e.to_string());
            }
        }
        let Some(session) = self.gate.try_begin() else {
            error!("Handshake already in progress. Refusing message.");
            return Response::busy();
        };
        let response = match message.action {
            Action::WriteHandshake => self.write_handshake(message, &session).await,
            Action::ShowResult => self.show_result(message).await,
            other => Response::failed(
                Value::Bool(false),
                format!("{other} is not handled by the handshake executor"),
            ),
        };
        info!("Handshake executor finished: {}", message.action);
        response
    }

    async fn write_handshake(&self, message: &Message, session: &SessionToken) -> Response {
        let job = match HandshakeJob::from_message(message) {
            Ok(job) => job,
            Err(e) => {
                error!(
                    "Invalid data format. Expected [configs, taskId, taskSlug, ratings]: {}",
                    e
                );
                return Response::failed(Value::Bool(false), "Invalid data format");
            }
        };
        info!(task_id = %job.task.id, ratings = ?job.ratings, "Received handshake data");
        match HandshakeRun::new(self.page.as_ref(), &job, session)
            .execute()
            .await
        {
            Ok(history) => {
                info!(written = ?history.written(), "Ratings submitted successfully.");
                Response::success(Value::Bool(true))
            }
            Err(e) => {
                error!("Ratings submit failed: {}", e);
                Response::failed(Value::Bool(false), e.to_string())
            }
        }
    }

    async fn show_result(&self, message: &Message) -> Response {
        let (text, duration_ms): (String, u64) = match message.payload() {
            Ok(data) => data,
            Err(e) => {
                error!("Invalid data format. Expected [message, durationMs]: {}", e);
                return Response::failed(Value::Bool(false), "Invalid data format");
            }
        };
        info!(message = %text, duration_ms, "Showing floating notification");
        match self
            .page
            .show_notification(&text, Duration::from_millis(duration_ms))
            .await
        {
            Ok(()) => Response::success(Value::Bool(true)),
            Err(e) => {
                error!("Could not show notification: {}", e);
                Response::failed(Value::Bool(false), e.to_string())
            }
        }
    }
}
