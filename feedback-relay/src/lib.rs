//! Relays QA feedback ratings into the Handshake task form
//!
//! An orchestrator resolves the current task and its ratings, then hands both to an executor
//! attached to the Handshake task page, which fills and submits the form one field at a time.
//! The two sides share no state and only exchange request/response messages. A real browser is
//! driven through a companion extension connected over a WebSocket bridge.

pub mod browser;
pub mod capture;
pub mod channel;
pub mod config;
pub mod constants;
pub mod errors;
pub mod executor;
pub mod extension_bridge;
pub mod history;
pub mod page;
pub mod pipeline;
pub mod poll;
pub mod resolver;
pub mod session;
pub mod storage;
#[cfg(test)]
mod tests;
pub mod types;
pub mod utils;

pub use browser::{Browser, ContextId, ExecutionContext, LoadStatus, WindowId, WindowState};
pub use capture::{DirectoryDownloader, Downloader};
pub use channel::{
    Action, Endpoint, Envelope, LocalRouter, Message, MessageChannel, Response, Status, Target,
    Transport,
};
pub use config::AppConfig;
pub use errors::RelayError;
pub use executor::{HandshakeExecutor, HandshakeJob, ValidationHistory};
pub use extension_bridge::{BridgeEvent, BridgePage, ExtensionBridge};
pub use history::TaskUrlTracker;
pub use page::Page;
pub use pipeline::{request_run, Orchestrator};
pub use resolver::{ResolvedTask, Resolver};
pub use session::{SessionGate, SessionToken};
pub use storage::{JsonFileStore, MemoryStore, StorageScope, Store, StoredData};
pub use types::{CachedRatings, Ratings, RatingsPreview, TaskIdentity};
