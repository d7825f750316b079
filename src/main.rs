//! beekeeper-assistant: hands-free voice assistant for beekeepers
//!
//! The daemon listens for a wake phrase, takes a spoken command, and records
//! or reads hive notes. It provides:
//! - A single session controller driving the wake/listen/speak cycle
//! - Model-based intent classification with a pattern-matching fallback
//! - An offline-first note store with background upload
//! - An IPC socket for hosts to start, stop and watch the session

mod actions;
mod api;
mod assets;
mod config;
mod events;
mod intent;
mod ipc;
mod lifecycle;
mod locale;
mod state;
mod store;
mod sync;
mod voice;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::actions::ActionDispatcher;
use crate::api::{HiveApi, HttpHiveApi};
use crate::assets::ModelDirectory;
use crate::config::Config;
use crate::events::{EventSink, SessionEvent, StateEvent};
use crate::intent::{ModelClassifier, OllamaModel};
use crate::ipc::{Server, SessionLink};
use crate::lifecycle::ShutdownSignal;
use crate::state::{SessionController, Subsystems};
use crate::store::NoteStore;
use crate::sync::{SyncHandle, SyncSchedule, SyncScheduler};
use crate::voice::{
    required_models, ConsoleAnnouncer, ConsoleDetector, ConsoleInput, ConsoleTranscriber, Microphone,
};

/// How long cleanup waits for each background task
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "beekeeper-assistant starting");

    // Load configuration
    let config = Config::load()?;
    config.ensure_dirs()?;
    info!(?config.socket_path, locale = %config.locale, "configuration loaded");

    let shutdown = ShutdownSignal::new();

    // Remote API and the offline-first store in front of it
    let api: Arc<dyn HiveApi> = Arc::new(
        HttpHiveApi::new(&config.api_base_url, config.api_timeout())
            .context("failed to build API client")?,
    );
    let store = Arc::new(
        NoteStore::open(config.database_path(), api.clone()).context("failed to open note store")?,
    );

    let sync_handle = SyncHandle::new();
    let scheduler = SyncScheduler::new(
        store.clone(),
        SyncSchedule {
            interval: config.sync_interval(),
            retry_base: config.sync_retry_base(),
        },
        sync_handle.clone(),
    );

    // Create channels for inter-component communication
    // Components and IPC -> session controller
    let (inbox_tx, inbox_rx) = mpsc::channel(64);
    let inbox = EventSink::new(inbox_tx);
    // Session controller -> IPC server
    let (event_tx, _event_rx) = broadcast::channel::<StateEvent>(64);
    // Main -> sync scheduler
    let (stop_tx, _) = broadcast::channel::<()>(1);

    // Console voice backend sharing one microphone token
    let console = ConsoleInput::new(&config.wake_phrase, Arc::new(Microphone::new()));
    let console_reader = console.spawn_reader();
    let detector = Arc::new(ConsoleDetector::new(console.clone()));
    let transcriber = Arc::new(ConsoleTranscriber::new(console.clone()));

    let models = ModelDirectory::new(
        config.model_dir.clone(),
        required_models(detector.as_ref(), transcriber.as_ref()),
    )
    .with_classify_file(config.classify_model_file.as_str());
    info!(root = ?config.model_dir, installed = ?models.installed(), "model directory scanned");

    let model = OllamaModel::new(&config.ollama_url, &config.ollama_model, config.classify_timeout())
        .context("failed to build model client")?;

    let controller = SessionController::new(
        Subsystems {
            assets: Arc::new(models),
            detector,
            transcriber,
            announcer: Arc::new(ConsoleAnnouncer::new()),
            classifier: Arc::new(ModelClassifier::new(model, config.classify_timeout())),
            dispatcher: Arc::new(ActionDispatcher::new(store.clone(), api, sync_handle.clone())),
        },
        config.locale,
        config.listen_timeout(),
        inbox.clone(),
        event_tx.clone(),
    );

    // Create IPC server
    let server = Server::new(
        &config.socket_path,
        config.locale,
        &config.wake_phrase,
        SessionLink {
            inbox: inbox.clone(),
            sync: sync_handle,
            store,
        },
    )?;

    // Subscribe to state events for IPC updates
    let mut ipc_event_rx = event_tx.subscribe();

    let mut session = tokio::spawn(controller.run(inbox_rx));
    let mut sync_task = tokio::spawn(scheduler.run(stop_tx.subscribe()));

    inbox.emit(SessionEvent::Start).await;
    info!("daemon initialized, entering main loop");

    // Main event loop
    tokio::select! {
        // The daemon lives as long as the session
        result = &mut session => {
            if let Err(e) = result {
                error!(?e, "session task failed");
            }
            info!("session ended");
        }

        // Run the IPC server (accepts client connections)
        result = server.run() => {
            if let Err(e) = result {
                error!(?e, "IPC server error");
            }
        }

        // Handle state events for IPC synchronization
        _ = async {
            loop {
                match ipc_event_rx.recv().await {
                    Ok(StateEvent::StateChanged { from, to, duration_ms }) => {
                        server.set_state(from, to, duration_ms).await;
                    }
                    Ok(StateEvent::ClassifierSelected { name }) => {
                        server.set_classifier(&name).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "state event receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
        } => {
            info!("state event handler exited");
        }

        // Wait for shutdown signal
        _ = shutdown.wait() => {
            info!("shutdown signal received");
        }
    }

    // Cleanup
    info!("shutting down...");

    if !session.is_finished() {
        inbox.emit(SessionEvent::Stop).await;
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut session).await.is_err() {
            warn!("session did not stop in time");
            session.abort();
        }
    }

    let _ = stop_tx.send(());
    if tokio::time::timeout(SHUTDOWN_GRACE, &mut sync_task).await.is_err() {
        warn!("sync scheduler did not stop in time");
        sync_task.abort();
    }

    console_reader.abort();
    server.shutdown().await;

    info!("beekeeper-assistant stopped");

    Ok(())
}
