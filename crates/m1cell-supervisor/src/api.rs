//! [`SupervisorServer`] – the supervisor's HTTP API and dashboard socket.
//!
//! | Route | Method | Effect |
//! |---|---|---|
//! | `/start/:module` | POST | start; optional body `{"serial_port": "/dev/ttyUSB0"}` |
//! | `/stop/:module` | POST | stop (no-op when not running) |
//! | `/status` | GET | [`CellStatus`] snapshot |
//! | `/com_ports` | GET | serial devices visible to the OS |
//! | `/ws` | GET | pushes a [`CellStatus`] every sweep |

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use m1cell_types::CellError;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ports::scan_serial_ports;
use crate::supervisor::{CellStatus, Supervisor, SupervisorError};

impl SupervisorError {
    fn http_status(&self) -> StatusCode {
        match self {
            SupervisorError::UnknownModule(_) => StatusCode::NOT_FOUND,
            SupervisorError::AlreadyRunning(_) | SupervisorError::Stopping(_) => {
                StatusCode::CONFLICT
            }
            SupervisorError::SerialPortRequired(_) | SupervisorError::Cell(CellError::Config(_)) => {
                StatusCode::BAD_REQUEST
            }
            SupervisorError::StartFailed { .. } | SupervisorError::Cell(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for SupervisorError {
    fn into_response(self) -> Response {
        let body = json!({
            "ok": false,
            "message": self.to_string(),
            "error": &self,
        });
        (self.http_status(), Json(body)).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
struct StartRequest {
    #[serde(default)]
    serial_port: Option<String>,
}

// ────────────────────────────────────────────────────────────────────────────
// Server
// ────────────────────────────────────────────────────────────────────────────

pub struct SupervisorServer {
    supervisor: Arc<Supervisor>,
}

impl SupervisorServer {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }

    /// Bind `addr`, serve the API and start the sweep.
    ///
    /// # Errors
    ///
    /// Returns [`CellError::Io`] if the listener cannot bind.
    pub async fn spawn(self, addr: SocketAddr) -> Result<SupervisorHandle, CellError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| CellError::Io(format!("supervisor bind error on {addr}: {e}")))?;
        let local_addr = listener.local_addr()?;
        info!(
            %local_addr,
            modules = self.supervisor.registry().modules.len(),
            "supervisor listening"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeper = tokio::spawn(Arc::clone(&self.supervisor).sweep_loop(shutdown_rx.clone()));
        let app = router(Arc::clone(&self.supervisor), shutdown_rx.clone());
        let mut stop = shutdown_rx;
        let server = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = stop.wait_for(|s| *s).await;
            });
            if let Err(e) = serve.await {
                warn!(error = %e, "supervisor API exited with error");
            }
        });

        Ok(SupervisorHandle {
            local_addr,
            supervisor: self.supervisor,
            shutdown: shutdown_tx,
            tasks: vec![server, sweeper],
        })
    }
}

pub struct SupervisorHandle {
    local_addr: SocketAddr,
    supervisor: Arc<Supervisor>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SupervisorHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Stop serving, then stop every child process.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        self.supervisor.stop_all().await;
        info!(local_addr = %self.local_addr, "supervisor stopped");
    }
}

#[derive(Clone)]
struct AppState {
    supervisor: Arc<Supervisor>,
    shutdown: watch::Receiver<bool>,
}

pub fn router(supervisor: Arc<Supervisor>, shutdown: watch::Receiver<bool>) -> Router {
    Router::new()
        .route("/start/:module", post(start))
        .route("/stop/:module", post(stop))
        .route("/status", get(status))
        .route("/com_ports", get(com_ports))
        .route("/ws", get(ws_upgrade))
        .with_state(AppState {
            supervisor,
            shutdown,
        })
}

// ────────────────────────────────────────────────────────────────────────────
// HTTP handlers
// ────────────────────────────────────────────────────────────────────────────

async fn start(
    State(state): State<AppState>,
    Path(module): Path<String>,
    body: Option<Json<StartRequest>>,
) -> Result<Response, SupervisorError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let status = state
        .supervisor
        .start(&module, req.serial_port.as_deref())
        .await?;
    Ok(Json(json!({ "ok": true, "status": status })).into_response())
}

async fn stop(
    State(state): State<AppState>,
    Path(module): Path<String>,
) -> Result<Response, SupervisorError> {
    let status = state.supervisor.stop(&module).await?;
    Ok(Json(json!({ "ok": true, "status": status })).into_response())
}

async fn status(State(state): State<AppState>) -> Json<CellStatus> {
    Json(state.supervisor.status_all().await)
}

async fn com_ports() -> Response {
    match tokio::task::spawn_blocking(scan_serial_ports).await {
        Ok(ports) => Json(json!({ "ports": ports })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "ok": false, "message": format!("serial scan failed: {e}") })),
        )
            .into_response(),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// WebSocket
// ────────────────────────────────────────────────────────────────────────────

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| client_loop(socket, state))
}

async fn client_loop(socket: WebSocket, state: AppState) {
    let (mut tx, mut rx) = socket.split();
    let mut updates = state.supervisor.subscribe();
    let mut shutdown = state.shutdown;

    // Dashboards render immediately instead of waiting for the next sweep.
    let first = state.supervisor.status_all().await;
    if send_status(&mut tx, &first).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            update = updates.recv() => {
                let snapshot = match update {
                    Ok(snapshot) => snapshot,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "dashboard lagged; skipping snapshots");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if send_status(&mut tx, &snapshot).await.is_err() {
                    break;
                }
            }
            msg = rx.next() => match msg {
                Some(Ok(Message::Ping(payload))) => {
                    if tx.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            _ = async { shutdown.wait_for(|s| *s).await.map(|_| ()) } => {
                let _ = tx.send(Message::Close(None)).await;
                break;
            }
        }
    }
}

async fn send_status(tx: &mut SplitSink<WebSocket, Message>, status: &CellStatus) -> Result<(), ()> {
    let Ok(text) = serde_json::to_string(status) else {
        warn!("failed to serialise cell status");
        return Ok(());
    };
    tx.send(Message::Text(text)).await.map_err(|_| ())
}
