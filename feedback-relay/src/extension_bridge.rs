//! WebSocket bridge to the companion browser extension.
//!
//! The extension connects as a client and executes tab, window, messaging and DOM commands on
//! our behalf. Requests carry a uuid and are answered with `{id, ok, result, error}`; anything
//! else the extension sends is a typed event (`{"type": ...}`) republished on a broadcast
//! channel.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex as StdMutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    net::TcpListener,
    sync::{broadcast, mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage};
use uuid::Uuid;

use crate::browser::{Browser, ContextId, ExecutionContext, WindowId, WindowState};
use crate::channel::{Message, Response, Target, Transport};
use crate::constants::{timeouts, BRIDGE_CONNECT_POLL};
use crate::errors::RelayError;
use crate::page::Page;
use crate::poll::wait_for_condition;

pub const DEFAULT_WS_ADDR: &str = "127.0.0.1:17373";
/// Upper bound for tab, window and DOM commands.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_CAPACITY: usize = 64;

type BridgeResult = Result<Value, String>;
type PendingMap = HashMap<String, PendingReply>;
type Pending = Arc<StdMutex<PendingMap>>;
type Clients = Arc<Mutex<Vec<Client>>>;

/// Commands executed by the extension's background worker.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum BridgeCommand {
    TabsQuery { url: String },
    TabsGet { tab_id: ContextId },
    TabsCreate { url: String },
    TabsReload { tab_id: ContextId },
    TabsActivate { tab_id: ContextId },
    WindowsFocus { window_id: WindowId },
    /// Forwards a message to the content script of a tab and returns its response.
    SendMessage { tab_id: ContextId, message: Message },
    Dom { tab_id: ContextId, op: DomOp },
}

/// DOM operations run in a tab's content script.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DomOp {
    Location,
    Count { selector: String },
    Texts { selector: String },
    Attribute { selector: String, index: usize, name: String },
    Click { selector: String, index: usize },
    SetValue { selector: String, index: usize, value: String },
    Dispatch { selector: String, index: usize, event: String },
    Notify { message: String, duration_ms: u64 },
}

#[derive(Debug, Serialize)]
struct BridgeRequest<'a> {
    id: &'a str,
    command: &'a BridgeCommand,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BridgeIncoming {
    Reply {
        id: String,
        ok: bool,
        result: Option<Value>,
        error: Option<String>,
    },
    Typed(TypedIncoming),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum TypedIncoming {
    #[serde(rename = "hello")]
    Hello { from: Option<String> },
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "tab_updated")]
    TabUpdated {
        tab_id: ContextId,
        url: Option<String>,
    },
    #[serde(rename = "tab_removed")]
    TabRemoved { tab_id: ContextId },
    /// The user pressed run in the extension popup.
    #[serde(rename = "run")]
    Run,
    /// The user clicked the extension's toolbar icon.
    #[serde(rename = "action_clicked")]
    ActionClicked,
}

/// Events raised by the extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    Connected { from: Option<String> },
    Disconnected,
    TabUpdated { id: ContextId, url: String },
    TabRemoved { id: ContextId },
    RunRequested,
    ActionClicked,
}

struct Client {
    id: Uuid,
    sender: mpsc::UnboundedSender<WsMessage>,
}

/// A request waiting for its reply, tagged with the client it was sent to.
struct PendingReply {
    client: Uuid,
    tx: oneshot::Sender<BridgeResult>,
}

fn lock_pending(pending: &Pending) -> MutexGuard<'_, PendingMap> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes the pending entry when the waiting request finishes or is dropped.
struct PendingGuard {
    pending: Pending,
    id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        lock_pending(&self.pending).remove(&self.id);
    }
}

pub struct ExtensionBridge {
    _server_task: JoinHandle<()>,
    clients: Clients,
    pending: Pending,
    events: broadcast::Sender<BridgeEvent>,
    local_addr: SocketAddr,
}

impl ExtensionBridge {
    /// Binds the WebSocket listener and starts accepting extension clients.
    pub async fn start(addr: &str) -> Result<ExtensionBridge, RelayError> {
        let listener = match TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::warn!(%addr, ?e, "Port in use, waiting 2 seconds and retrying once...");
                tokio::time::sleep(Duration::from_secs(2)).await;
                TcpListener::bind(addr).await.map_err(|e2| {
                    tracing::error!(%addr, ?e2, "Failed to bind after retry");
                    RelayError::Platform(format!("bind {addr}: {e2}"))
                })?
            }
            Err(e) => {
                tracing::error!(%addr, ?e, "Failed to bind ws");
                return Err(RelayError::Platform(format!("bind {addr}: {e}")));
            }
        };
        let local_addr = listener.local_addr()?;
        tracing::info!("Feedback relay extension bridge listening on {}", local_addr);

        let clients: Clients = Arc::new(Mutex::new(Vec::new()));
        let pending: Pending = Arc::new(StdMutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let server_task = tokio::spawn(accept_loop(
            listener,
            clients.clone(),
            pending.clone(),
            events.clone(),
        ));

        Ok(ExtensionBridge {
            _server_task: server_task,
            clients,
            pending,
            events,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    pub async fn is_client_connected(&self) -> bool {
        !self.clients.lock().await.is_empty()
    }

    /// Waits until an extension client is connected.
    pub async fn wait_for_client(&self, timeout: Duration) -> bool {
        wait_for_condition(
            move || async move { self.is_client_connected().await },
            timeout,
            BRIDGE_CONNECT_POLL,
        )
        .await
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        lock_pending(&self.pending).len()
    }

    /// Sends one command to the first connected client and waits for its reply.
    pub async fn request(
        &self,
        command: BridgeCommand,
        timeout: Duration,
    ) -> Result<Value, RelayError> {
        if !self.is_client_connected().await {
            tracing::info!("ExtensionBridge: no clients connected");
            return Err(RelayError::ResourceNotFound(
                "no extension client connected".into(),
            ));
        }
        let id = Uuid::new_v4().to_string();
        let payload = serde_json::to_string(&BridgeRequest {
            id: &id,
            command: &command,
        })
        .map_err(|e| RelayError::Platform(format!("bridge serialize: {e}")))?;

        let (tx, rx) = oneshot::channel::<BridgeResult>();
        let _guard = PendingGuard {
            pending: self.pending.clone(),
            id: id.clone(),
        };
        let mut sent = false;
        {
            let clients = self.clients.lock().await;
            tracing::debug!(
                clients = clients.len(),
                preview = %payload.chars().take(120).collect::<String>(),
                "Sending command to extension"
            );
            if let Some(c) = clients.first() {
                lock_pending(&self.pending).insert(id.clone(), PendingReply { client: c.id, tx });
                sent = c.sender.send(WsMessage::Text(payload)).is_ok();
            }
        }
        if !sent {
            tracing::warn!("ExtensionBridge: failed to send command to first client");
            return Err(RelayError::StaleState(
                "extension client went away".into(),
            ));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(err))) => Err(RelayError::RemoteFailure(err)),
            Ok(Err(_canceled)) => {
                tracing::warn!("ExtensionBridge: reply channel dropped (id={})", id);
                Err(RelayError::StaleState(
                    "extension disconnected before replying".into(),
                ))
            }
            Err(_elapsed) => {
                tracing::warn!("ExtensionBridge: timed out waiting for reply (id={})", id);
                Err(RelayError::Timeout(format!(
                    "extension reply to {id} after {timeout:?}"
                )))
            }
        }
    }

    async fn call<T: DeserializeOwned>(&self, command: BridgeCommand) -> Result<T, RelayError> {
        let value = self.request(command, COMMAND_TIMEOUT).await?;
        serde_json::from_value(value)
            .map_err(|e| RelayError::InvalidPayload(format!("extension reply: {e}")))
    }
}

async fn accept_loop(
    listener: TcpListener,
    clients: Clients,
    pending: Pending,
    events: broadcast::Sender<BridgeEvent>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("ws accept error: {}", e);
                continue;
            }
        };
        tracing::debug!(%peer, "Extension client connecting");
        tokio::spawn(handle_client(
            stream,
            clients.clone(),
            pending.clone(),
            events.clone(),
        ));
    }
}

async fn handle_client(
    stream: tokio::net::TcpStream,
    clients: Clients,
    pending: Pending,
    events: broadcast::Sender<BridgeEvent>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("ws handshake error: {}", e);
            return;
        }
    };
    let (mut sink, mut stream) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = sink.send(msg).await {
                tracing::warn!("ws send error: {}", e);
                break;
            }
        }
    });

    let client_id = Uuid::new_v4();
    clients.lock().await.push(Client {
        id: client_id,
        sender: tx,
    });

    while let Some(Ok(msg)) = stream.next().await {
        if !msg.is_text() {
            continue;
        }
        let txt = msg.into_text().unwrap_or_default();
        match serde_json::from_str::<BridgeIncoming>(&txt) {
            Ok(BridgeIncoming::Reply {
                id,
                ok,
                result,
                error,
            }) => {
                if ok {
                    let size = result.as_ref().map(|r| r.to_string().len()).unwrap_or(0);
                    tracing::debug!(id = %id, result_size = size, "Bridge received reply");
                } else {
                    let head: String = error
                        .as_deref()
                        .unwrap_or("unknown error")
                        .chars()
                        .take(400)
                        .collect();
                    tracing::error!(id = %id, error = %head, "Bridge received error reply");
                }
                let waiting = lock_pending(&pending).remove(&id);
                if let Some(PendingReply { tx, .. }) = waiting {
                    let _ = tx.send(if ok {
                        Ok(result.unwrap_or(Value::Null))
                    } else {
                        Err(error.unwrap_or_else(|| "unknown error".into()))
                    });
                }
            }
            Ok(BridgeIncoming::Typed(typed)) => {
                if let Some(event) = into_event(typed) {
                    // no subscribers is fine
                    let _ = events.send(event);
                }
            }
            Err(e) => tracing::warn!("Invalid incoming JSON: {}", e),
        }
    }

    writer.abort();
    clients.lock().await.retain(|c| c.id != client_id);
    // Dropping the senders wakes their waiters with a cancelled reply.
    lock_pending(&pending).retain(|_, reply| reply.client != client_id);
    tracing::info!("Extension disconnected");
    let _ = events.send(BridgeEvent::Disconnected);
}

fn into_event(typed: TypedIncoming) -> Option<BridgeEvent> {
    match typed {
        TypedIncoming::Hello { from } => {
            tracing::info!(from = ?from, "Extension connected");
            Some(BridgeEvent::Connected { from })
        }
        TypedIncoming::Pong => None,
        TypedIncoming::TabUpdated { tab_id, url } => url.map(|url| BridgeEvent::TabUpdated {
            id: tab_id,
            url,
        }),
        TypedIncoming::TabRemoved { tab_id } => Some(BridgeEvent::TabRemoved { id: tab_id }),
        TypedIncoming::Run => Some(BridgeEvent::RunRequested),
        TypedIncoming::ActionClicked => Some(BridgeEvent::ActionClicked),
    }
}

#[async_trait]
impl Browser for ExtensionBridge {
    async fn query(&self, pattern: &str) -> Result<Vec<ExecutionContext>, RelayError> {
        self.call(BridgeCommand::TabsQuery {
            url: pattern.to_string(),
        })
        .await
    }

    async fn get(&self, id: ContextId) -> Result<ExecutionContext, RelayError> {
        // a closed tab is reported by the extension as an error
        self.call(BridgeCommand::TabsGet { tab_id: id })
            .await
            .map_err(|e| match e {
                RelayError::RemoteFailure(m) => RelayError::StaleState(m),
                other => other,
            })
    }

    async fn create(&self, url: &str) -> Result<ExecutionContext, RelayError> {
        self.call(BridgeCommand::TabsCreate {
            url: url.to_string(),
        })
        .await
    }

    async fn reload(&self, id: ContextId) -> Result<(), RelayError> {
        self.request(BridgeCommand::TabsReload { tab_id: id }, COMMAND_TIMEOUT)
            .await
            .map(|_| ())
    }

    async fn activate(&self, id: ContextId) -> Result<ExecutionContext, RelayError> {
        self.call(BridgeCommand::TabsActivate { tab_id: id }).await
    }

    async fn focus_window(&self, id: WindowId) -> Result<WindowState, RelayError> {
        self.call(BridgeCommand::WindowsFocus { window_id: id })
            .await
    }
}

#[async_trait]
impl Transport for ExtensionBridge {
    async fn deliver(&self, target: Target, message: Message) -> Result<Response, RelayError> {
        let Target::Context(tab_id) = target else {
            return Err(RelayError::Unsupported(
                "runtime messages are not routed through the extension".into(),
            ));
        };
        // the caller's channel applies the real timeout
        let reply = self
            .request(BridgeCommand::SendMessage { tab_id, message }, timeouts::RUN)
            .await?;
        if reply.is_null() {
            return Err(RelayError::StaleState(format!(
                "no listener answered in context {tab_id}"
            )));
        }
        Ok(serde_json::from_value(reply)?)
    }
}

/// A tab's document, driven through the extension's content script.
pub struct BridgePage {
    bridge: Arc<ExtensionBridge>,
    tab_id: ContextId,
}

impl BridgePage {
    pub fn new(bridge: Arc<ExtensionBridge>, tab_id: ContextId) -> Self {
        Self { bridge, tab_id }
    }

    async fn dom<T: DeserializeOwned>(&self, op: DomOp) -> Result<T, RelayError> {
        self.bridge
            .call(BridgeCommand::Dom {
                tab_id: self.tab_id,
                op,
            })
            .await
    }
}

#[async_trait]
impl Page for BridgePage {
    async fn location(&self) -> Result<String, RelayError> {
        self.dom(DomOp::Location).await
    }

    async fn count(&self, selector: &str) -> Result<usize, RelayError> {
        self.dom(DomOp::Count {
            selector: selector.to_string(),
        })
        .await
    }

    async fn texts(&self, selector: &str) -> Result<Vec<String>, RelayError> {
        self.dom(DomOp::Texts {
            selector: selector.to_string(),
        })
        .await
    }

    async fn attribute(
        &self,
        selector: &str,
        index: usize,
        name: &str,
    ) -> Result<Option<String>, RelayError> {
        self.dom(DomOp::Attribute {
            selector: selector.to_string(),
            index,
            name: name.to_string(),
        })
        .await
    }

    async fn click(&self, selector: &str, index: usize) -> Result<(), RelayError> {
        self.dom::<Value>(DomOp::Click {
            selector: selector.to_string(),
            index,
        })
        .await
        .map(|_| ())
    }

    async fn set_value(&self, selector: &str, index: usize, value: &str) -> Result<(), RelayError> {
        self.dom::<Value>(DomOp::SetValue {
            selector: selector.to_string(),
            index,
            value: value.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn dispatch_event(
        &self,
        selector: &str,
        index: usize,
        event: &str,
    ) -> Result<(), RelayError> {
        self.dom::<Value>(DomOp::Dispatch {
            selector: selector.to_string(),
            index,
            event: event.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn show_notification(&self, message: &str, duration: Duration) -> Result<(), RelayError> {
        let duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.dom::<Value>(DomOp::Notify {
            message: message.to_string(),
            duration_ms,
        })
        .await
        .map(|_| ())
    }
}
