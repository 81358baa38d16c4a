//! Request/response messaging between isolated execution contexts.
//!
//! Contexts share no memory. A sender hands a [`Message`] to a [`Transport`] addressed at a
//! [`Target`] and gets back at most one [`Response`]. [`MessageChannel`] races every send
//! against a timeout, so a receiver that never answers is observed as
//! [`RelayError::Timeout`] rather than a hang.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, instrument, warn};

use crate::browser::ContextId;
use crate::errors::RelayError;
use crate::poll::with_timeout;

const ENDPOINT_QUEUE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Run,
    WriteHandshake,
    ShowResult,
    ReadRatingsPreview,
    ReadFullRatings,
    ScreenshotQaFeedback,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Run => "RUN",
            Action::WriteHandshake => "WRITE_HANDSHAKE",
            Action::ShowResult => "SHOW_RESULT",
            Action::ReadRatingsPreview => "READ_RATINGS_PREVIEW",
            Action::ReadFullRatings => "READ_FULL_RATINGS",
            Action::ScreenshotQaFeedback => "SCREENSHOT_QA_FEEDBACK",
        }
    }

    /// Runtime-scoped actions address the orchestrator itself rather than a context.
    pub fn is_runtime(&self) -> bool {
        matches!(self, Action::Run)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Runtime,
    Context(ContextId),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Runtime => write!(f, "runtime"),
            Target::Context(id) => write!(f, "context {id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub action: Action,
    #[serde(default)]
    pub value: Value,
}

impl Message {
    pub fn new(action: Action, value: Value) -> Self {
        Self { action, value }
    }

    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, RelayError> {
        serde_json::from_value(self.value.clone()).map_err(|e| {
            RelayError::InvalidPayload(format!("{} payload: {e}", self.action))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    #[serde(alias = "success")]
    Success,
    #[serde(alias = "failure", alias = "failed")]
    Failed,
    #[serde(alias = "busy")]
    Busy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn success(data: Value) -> Self {
        Self {
            status: Status::Success,
            data,
            error: None,
        }
    }

    pub fn failed(data: Value, error: impl Into<String>) -> Self {
        Self {
            status: Status::Failed,
            data,
            error: Some(error.into()),
        }
    }

    pub fn busy() -> Self {
        Self {
            status: Status::Busy,
            data: Value::Bool(false),
            error: Some("a session is already in progress".into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    /// Decodes the data of a successful response. Explicit failures and busy answers become
    /// the matching error.
    pub fn into_data<T: DeserializeOwned>(self) -> Result<T, RelayError> {
        match self.status {
            Status::Success => Ok(serde_json::from_value(self.data)?),
            Status::Failed => Err(RelayError::RemoteFailure(
                self.error.unwrap_or_else(|| "remote side reported failure".into()),
            )),
            Status::Busy => Err(RelayError::Busy(
                self.error.unwrap_or_else(|| "session in progress".into()),
            )),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Delivers one message and waits for its single response.
    async fn deliver(&self, target: Target, message: Message) -> Result<Response, RelayError>;
}

/// A received message together with the handle used to answer it.
pub struct Envelope {
    pub message: Message,
    reply: oneshot::Sender<Response>,
}

impl Envelope {
    pub fn respond(self, response: Response) {
        if self.reply.send(response).is_err() {
            debug!(action = %self.message.action, "Sender stopped waiting before the reply");
        }
    }
}

/// Receiving side of a registered target.
pub struct Endpoint {
    target: Target,
    rx: mpsc::Receiver<Envelope>,
}

impl Endpoint {
    pub fn target(&self) -> Target {
        self.target
    }

    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }
}

/// In-process transport. Targets without a registered endpoint go to the fallback
/// transport when there is one.
#[derive(Default)]
pub struct LocalRouter {
    routes: Mutex<HashMap<Target, mpsc::Sender<Envelope>>>,
    fallback: Option<Arc<dyn Transport>>,
}

impl LocalRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback(fallback: Arc<dyn Transport>) -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            fallback: Some(fallback),
        }
    }

    /// Registers a listener for `target`, replacing any previous one.
    pub async fn register(&self, target: Target) -> Endpoint {
        let (tx, rx) = mpsc::channel(ENDPOINT_QUEUE);
        if self.routes.lock().await.insert(target, tx).is_some() {
            info!(%target, "Replaced existing listener");
        }
        Endpoint { target, rx }
    }

    pub async fn unregister(&self, target: Target) {
        self.routes.lock().await.remove(&target);
    }

    pub async fn is_registered(&self, target: Target) -> bool {
        self.routes.lock().await.contains_key(&target)
    }
}

#[async_trait]
impl Transport for LocalRouter {
    async fn deliver(&self, target: Target, message: Message) -> Result<Response, RelayError> {
        let route = self.routes.lock().await.get(&target).cloned();
        let Some(tx) = route else {
            return match &self.fallback {
                Some(fallback) => fallback.deliver(target, message).await,
                None => Err(RelayError::ResourceNotFound(format!(
                    "no listener registered for {target}"
                ))),
            };
        };
        let (reply, reply_rx) = oneshot::channel();
        tx.send(Envelope { message, reply })
            .await
            .map_err(|_| RelayError::StaleState(format!("listener for {target} is gone")))?;
        reply_rx.await.map_err(|_| {
            RelayError::StaleState(format!("{target} dropped the message without answering"))
        })
    }
}

/// Timeout-bounded sending over a [`Transport`].
#[derive(Clone)]
pub struct MessageChannel {
    transport: Arc<dyn Transport>,
}

impl MessageChannel {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    #[instrument(level = "debug", skip(self, value))]
    pub async fn send_runtime(
        &self,
        action: Action,
        value: Value,
        timeout: Duration,
    ) -> Result<Response, RelayError> {
        self.send(Target::Runtime, action, value, timeout).await
    }

    #[instrument(level = "debug", skip(self, value))]
    pub async fn send_to_context(
        &self,
        context_id: ContextId,
        action: Action,
        value: Value,
        timeout: Duration,
    ) -> Result<Response, RelayError> {
        self.send(Target::Context(context_id), action, value, timeout)
            .await
    }

    async fn send(
        &self,
        target: Target,
        action: Action,
        value: Value,
        timeout: Duration,
    ) -> Result<Response, RelayError> {
        if action.is_runtime() != (target == Target::Runtime) {
            return Err(RelayError::Unsupported(format!(
                "{action} cannot be sent to {target}"
            )));
        }
        let what = format!("waiting for {action} reply from {target}");
        let result = with_timeout(
            self.transport.deliver(target, Message::new(action, value)),
            timeout,
            &what,
        )
        .await
        .and_then(|delivered| delivered);
        match &result {
            Ok(response) if response.status == Status::Busy => {
                warn!(%target, %action, "Receiver is busy with another session")
            }
            Ok(response) => debug!(%target, %action, status = ?response.status, "Reply received"),
            Err(e) => {
                error!("Failed to send {} to {}: {}", action, target, e);
                info!("Consider checking if {} is alive and checking return values", target);
            }
        }
        result
    }
}
