//! Unix domain socket server for IPC
//!
//! Provides request-response communication and push notifications for
//! state change events to subscribed clients. Session requests are not
//! executed here: they are posted to the controller inbox like any other
//! event.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::events::{Component, ComponentFailure, EventSink, SessionEvent};
use crate::locale::Locale;
use crate::state::{status_line, SessionState};
use crate::store::NoteStore;
use crate::sync::SyncHandle;

use super::protocol::{encode_frame, read_frame, DaemonStatus, Notification, Request, Response};

/// What the server needs to reach the rest of the daemon
pub struct SessionLink {
    pub inbox: EventSink,
    pub sync: SyncHandle,
    pub store: Arc<NoteStore>,
}

/// IPC Server handling client connections
pub struct Server {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    shared: Arc<Shared>,
    shutdown_tx: broadcast::Sender<()>,
}

/// State shared with client handlers
struct Shared {
    state: RwLock<ServerState>,
    link: SessionLink,
    notify_tx: broadcast::Sender<Notification>,
}

struct ServerState {
    status: DaemonStatus,
    start_time: std::time::Instant,
    wake_phrase: String,
}

impl Server {
    /// Create a new IPC server
    pub fn new(socket_path: &Path, locale: Locale, wake_phrase: &str, link: SessionLink) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).context("failed to create socket directory")?;
        }

        // Remove stale socket if it exists
        if socket_path.exists() {
            std::fs::remove_file(socket_path).context("failed to remove stale socket")?;
        }

        let listener = UnixListener::bind(socket_path).context("failed to bind Unix socket")?;

        // Set socket permissions to owner-only (0600)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        let (notify_tx, _) = broadcast::channel(64);

        let shared = Arc::new(Shared {
            state: RwLock::new(ServerState {
                status: DaemonStatus::new(locale),
                start_time: std::time::Instant::now(),
                wake_phrase: wake_phrase.to_string(),
            }),
            link,
            notify_tx,
        });

        info!(?socket_path, "IPC server listening");

        Ok(Self {
            socket_path: socket_path.to_owned(),
            listener: Some(listener),
            shared,
            shutdown_tx,
        })
    }

    /// Record a session transition and push it to subscribers
    pub async fn set_state(&self, from: SessionState, to: SessionState, duration_ms: u64) {
        let status = {
            let mut server_state = self.shared.state.write().await;
            let status = status_line(to, &server_state.wake_phrase);
            server_state.status.state = to;
            server_state.status.status = status.clone();
            status
        };

        debug!(%from, %to, "IPC server: state updated");
        let _ = self.shared.notify_tx.send(Notification::StateChanged {
            from,
            to,
            duration_ms,
            status,
        });
    }

    /// Record which classifier the session settled on
    pub async fn set_classifier(&self, name: &str) {
        self.shared.state.write().await.status.classifier = Some(name.to_string());
    }

    /// Run the server, accepting connections
    pub async fn run(&self) -> Result<()> {
        let listener = self.listener.as_ref().context("server not initialized")?;

        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    debug!("client connected");
                    let shared = Arc::clone(&self.shared);
                    let mut shutdown_rx = self.shutdown_tx.subscribe();

                    tokio::spawn(async move {
                        tokio::select! {
                            result = Self::handle_client(stream, shared) => {
                                if let Err(e) = result {
                                    warn!(?e, "client handler error");
                                }
                            }
                            _ = shutdown_rx.recv() => {
                                debug!("client handler shutting down");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(?e, "accept error");
                }
            }
        }
    }

    /// Handle a single client connection
    ///
    /// Responses and pushed notifications share one writer task, so a
    /// subscribed client never sees two frames interleaved.
    async fn handle_client(stream: UnixStream, shared: Arc<Shared>) -> Result<()> {
        let (mut reader, writer) = stream.into_split();
        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(32);
        let writer_task = tokio::spawn(write_frames(writer, out_rx));
        let mut forwarder = None;

        let result = loop {
            let body = match read_frame(&mut reader).await {
                Ok(Some(body)) => body,
                Ok(None) => {
                    debug!("client disconnected");
                    break Ok(());
                }
                Err(e) => break Err(e),
            };

            let response = match serde_json::from_slice::<Request>(&body) {
                Ok(request) => {
                    debug!(?request, "received request");

                    // Subscribe before confirming so no transition slips past
                    if matches!(request, Request::Subscribe) && forwarder.is_none() {
                        let notifications = shared.notify_tx.subscribe();
                        forwarder = Some(tokio::spawn(forward_notifications(
                            notifications,
                            out_tx.clone(),
                        )));
                        debug!("client subscribed to notifications");
                    }

                    Self::process_request(request, &shared).await
                }
                Err(e) => Response::Error {
                    code: "bad_request".to_string(),
                    message: e.to_string(),
                },
            };

            if out_tx.send(encode_frame(&response)?).await.is_err() {
                break Ok(());
            }
        };

        if let Some(forwarder) = forwarder {
            forwarder.abort();
        }
        drop(out_tx);
        let _ = writer_task.await;
        result
    }

    /// Process a request and return a response
    async fn process_request(request: Request, shared: &Shared) -> Response {
        match request {
            Request::Ping => Response::Pong,

            Request::GetStatus => {
                let unsynced = shared.link.store.count_unsynced();
                let mut state = shared.state.write().await;
                state.status.uptime_secs = state.start_time.elapsed().as_secs();
                match unsynced {
                    Ok(count) => state.status.unsynced_notes = count,
                    Err(e) => warn!(error = %e, "failed to count unsynced notes"),
                }
                Response::Status(state.status.clone())
            }

            Request::StartSession => {
                info!("session start requested via IPC");
                shared.link.inbox.emit(SessionEvent::Start).await;
                Response::Accepted
            }

            Request::StopSession => {
                info!("session stop requested via IPC");
                shared.link.inbox.emit(SessionEvent::Stop).await;
                Response::Accepted
            }

            Request::PermissionDenied { permission } => {
                warn!(%permission, "host reported a denied permission");
                let failure =
                    ComponentFailure::fatal(Component::Host, format!("{permission} permission denied"));
                shared.link.inbox.emit(SessionEvent::Failed(failure)).await;
                Response::Accepted
            }

            Request::SyncNow => {
                shared.link.sync.request();
                Response::Accepted
            }

            Request::Subscribe => Response::Subscribed,
        }
    }

    /// Gracefully shutdown the server
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        // Remove socket file
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(?e, "failed to remove socket file");
            }
        }

        info!("IPC server shutdown complete");
    }
}

async fn write_frames(mut writer: OwnedWriteHalf, mut out_rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(frame) = out_rx.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            debug!(?e, "client write failed");
            break;
        }
    }
}

async fn forward_notifications(
    mut notifications: broadcast::Receiver<Notification>,
    out_tx: mpsc::Sender<Vec<u8>>,
) {
    loop {
        match notifications.recv().await {
            Ok(notification) => {
                let frame = match encode_frame(&notification) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(?e, "failed to encode notification");
                        continue;
                    }
                };
                if out_tx.send(frame).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "subscriber lagged, notifications dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
