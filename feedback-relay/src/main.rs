//! Feedback relay
//!
//! Starts the extension bridge, the orchestrator and one handshake executor per open
//! Handshake task page.
//!
//! Usage:
//!   feedback-relay serve                       # run whenever the extension asks
//!   feedback-relay run                         # one run as soon as the extension connects
//!   feedback-relay --config settings.json run  # store settings first, then run

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use feedback_relay::browser::find_contexts;
use feedback_relay::constants::{tasks, SETTINGS_STORAGE};
use feedback_relay::extension_bridge::DEFAULT_WS_ADDR;
use feedback_relay::poll::{wait_for_condition, DEFAULT_POLL_STEP};
use feedback_relay::utils::init_logging;
use feedback_relay::{
    request_run, storage, AppConfig, BridgeEvent, BridgePage, ContextId, DirectoryDownloader,
    ExtensionBridge, HandshakeExecutor, JsonFileStore, LocalRouter, MessageChannel, Orchestrator,
    Store, StoredData, Target, TaskUrlTracker,
};

#[derive(Parser)]
#[command(name = "feedback-relay")]
#[command(about = "Relays QA feedback ratings into the Handshake task form")]
struct Cli {
    /// Address the extension bridge listens on
    #[arg(long, global = true, default_value = DEFAULT_WS_ADDR)]
    addr: String,

    /// Settings file (JSON, extension settings format) stored before starting
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding persisted local and sync storage
    #[arg(long, global = true, env = "FEEDBACK_RELAY_STATE_DIR", default_value = ".feedback-relay")]
    state_dir: PathBuf,

    /// Directory QA feedback screenshots are downloaded to
    #[arg(long, global = true)]
    downloads: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve extension triggers until interrupted
    Serve,
    /// Run the pipeline once and exit with its result
    Run {
        /// Seconds to wait for the extension to connect
        #[arg(long, default_value_t = 60)]
        connect_timeout: u64,
    },
}

struct Relay {
    bridge: Arc<ExtensionBridge>,
    router: Arc<LocalRouter>,
    store: Arc<dyn Store>,
    orchestrator: Arc<Orchestrator>,
    channel: MessageChannel,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging()?;

    let store: Arc<dyn Store> = Arc::new(JsonFileStore::new(&cli.state_dir));
    if let Some(path) = &cli.config {
        let config = AppConfig::from_file(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?;
        storage::save_as(
            store.as_ref(),
            StoredData::Settings.key(),
            &config,
            SETTINGS_STORAGE,
        )
        .await?;
    }

    let bridge = Arc::new(ExtensionBridge::start(&cli.addr).await?);
    let router = Arc::new(LocalRouter::with_fallback(bridge.clone()));
    let mut orchestrator = Orchestrator::new(bridge.clone(), router.clone(), store.clone());
    if let Some(dir) = &cli.downloads {
        orchestrator = orchestrator.with_downloader(Arc::new(DirectoryDownloader::new(dir)));
    }
    let orchestrator = Arc::new(orchestrator);
    tokio::spawn(
        orchestrator
            .clone()
            .serve(router.register(Target::Runtime).await),
    );

    let relay = Relay {
        channel: MessageChannel::new(router.clone()),
        bridge,
        router,
        store,
        orchestrator,
    };

    match cli.command {
        Commands::Serve => serve(&relay).await,
        Commands::Run { connect_timeout } => run_once(&relay, connect_timeout).await,
    }
}

async fn serve(relay: &Relay) -> Result<()> {
    let mut events = relay.bridge.subscribe();
    let tracker = TaskUrlTracker::new(relay.store.clone());
    info!("Waiting for extension events. Press Ctrl+C to stop.");
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                return Ok(());
            }
        };
        match event {
            Ok(BridgeEvent::Connected { .. }) => attach_open_handshake_pages(relay).await,
            Ok(BridgeEvent::Disconnected) => warn!("Extension disconnected"),
            Ok(BridgeEvent::TabUpdated { id, url }) => {
                let config = AppConfig::load_or_default(relay.store.as_ref()).await;
                if let Err(e) = tracker.context_updated(&config, id, &url).await {
                    warn!(id, "Could not record task url: {}", e);
                }
                if url.starts_with(tasks::HANDSHAKE_PREFIX) {
                    attach_executor(relay, id).await;
                } else if url.starts_with(tasks::MULTIMANGO_PREFIX) && config.run_on_task_change {
                    info!(id, "Task page changed. Starting run.");
                    spawn_run(relay);
                }
            }
            Ok(BridgeEvent::TabRemoved { id }) => {
                let config = AppConfig::load_or_default(relay.store.as_ref()).await;
                if let Err(e) = tracker.context_removed(&config, id).await {
                    warn!(id, "Could not remember last task url: {}", e);
                }
                relay.router.unregister(Target::Context(id)).await;
            }
            Ok(BridgeEvent::RunRequested) => spawn_run(relay),
            Ok(BridgeEvent::ActionClicked) => {
                let config = AppConfig::load_or_default(relay.store.as_ref()).await;
                if config.run_on_click {
                    spawn_run(relay);
                } else {
                    debug!("Toolbar click ignored - RUN_ON_CLICK=false");
                }
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Dropped extension events"),
            Err(RecvError::Closed) => bail!("extension bridge stopped"),
        }
    }
}

async fn run_once(relay: &Relay, connect_timeout: u64) -> Result<()> {
    if !relay
        .bridge
        .wait_for_client(Duration::from_secs(connect_timeout))
        .await
    {
        bail!(
            "No extension connected to {} within {}s",
            relay.bridge.local_addr(),
            connect_timeout
        );
    }
    attach_open_handshake_pages(relay).await;
    let success = request_run(&relay.channel).await?;

    // let the result notification go out before the process exits
    let gate = relay.orchestrator.gate();
    wait_for_condition(
        move || async move { !gate.is_busy() },
        Duration::from_secs(30),
        DEFAULT_POLL_STEP,
    )
    .await;

    if !success {
        bail!("Run failed");
    }
    info!("Run succeeded");
    Ok(())
}

fn spawn_run(relay: &Relay) {
    let channel = relay.channel.clone();
    tokio::spawn(async move {
        match request_run(&channel).await {
            Ok(success) => info!(success, "Run finished"),
            Err(e) => error!("Run request failed: {}", e),
        }
    });
}

async fn attach_open_handshake_pages(relay: &Relay) {
    match find_contexts(relay.bridge.as_ref(), tasks::HANDSHAKE_URL).await {
        Ok(contexts) => {
            for context in contexts {
                attach_executor(relay, context.id).await;
            }
        }
        Err(e) => debug!("No handshake pages to attach to: {}", e),
    }
}

async fn attach_executor(relay: &Relay, id: ContextId) {
    let target = Target::Context(id);
    if relay.router.is_registered(target).await {
        return;
    }
    let page = Arc::new(BridgePage::new(relay.bridge.clone(), id));
    let executor = Arc::new(HandshakeExecutor::new(page));
    let endpoint = relay.router.register(target).await;
    tokio::spawn(executor.serve(endpoint));
    info!(id, "Attached handshake executor");
}
