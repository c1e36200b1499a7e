//! [`CockpitServer`] – HTTP + WebSocket front of a [`Surface`].
//!
//! | Route | Method | Effect |
//! |---|---|---|
//! | `/api/health` | GET | liveness; `200` even while degraded |
//! | `/api/status` | GET | decoded status window; `503` with `connected: false` while degraded |
//! | `/api/command` | POST | allocate a `command_id`, write the window; `409` while a previous command is unconsumed, `503` while degraded |
//! | `/ws` | GET | duplex socket: pushed status frames, `refresh` and `command` actions |

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
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

use crate::surface::{CommandRequest, PushFrame, Surface};

/// Default listen port of a Web Control Surface.
pub const DEFAULT_PORT: u16 = 8080;

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// A [`CellError`] rendered as an HTTP response.
pub struct ApiError(pub CellError);

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            CellError::BusUnreachable(_) | CellError::BusException(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            CellError::UnknownOpcode(_) | CellError::ParamOutOfRange { .. } => {
                StatusCode::BAD_REQUEST
            }
            CellError::NotReady(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({
            "accepted": false,
            "message": self.0.to_string(),
            "error": self.0,
        });
        (status, Json(body)).into_response()
    }
}

impl From<CellError> for ApiError {
    fn from(e: CellError) -> Self {
        Self(e)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Server
// ────────────────────────────────────────────────────────────────────────────

/// Builder for a running Web Control Surface.
pub struct CockpitServer {
    surface: Arc<Surface>,
}

impl CockpitServer {
    pub fn new(surface: Arc<Surface>) -> Self {
        Self { surface }
    }

    /// Bind `addr`, serve, and start the bus keeper and refresher.
    ///
    /// # Errors
    ///
    /// Returns [`CellError::Io`] if the listener cannot bind.
    pub async fn spawn(self, addr: SocketAddr) -> Result<CockpitHandle, CellError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| CellError::Io(format!("web surface bind error on {addr}: {e}")))?;
        let local_addr = listener.local_addr()?;
        info!(
            module = %self.surface.config().module_id,
            %local_addr,
            "web control surface listening"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let app = router(Arc::clone(&self.surface), shutdown_rx.clone());

        let keeper = {
            let surface = Arc::clone(&self.surface);
            let shutdown = shutdown_rx.clone();
            tokio::spawn(async move { surface.maintain(shutdown).await })
        };
        let refresher = {
            let surface = Arc::clone(&self.surface);
            let shutdown = shutdown_rx.clone();
            tokio::spawn(async move { surface.refresh_loop(shutdown).await })
        };
        let mut stop = shutdown_rx;
        let server = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = stop.wait_for(|s| *s).await;
            });
            if let Err(e) = serve.await {
                warn!(error = %e, "web control surface exited with error");
            }
        });

        Ok(CockpitHandle {
            local_addr,
            shutdown: shutdown_tx,
            tasks: vec![server, keeper, refresher],
        })
    }
}

/// Handle to a running surface.
pub struct CockpitHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl CockpitHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting requests and wait for the background tasks.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        info!(local_addr = %self.local_addr, "web control surface stopped");
    }
}

#[derive(Clone)]
struct AppState {
    surface: Arc<Surface>,
    shutdown: watch::Receiver<bool>,
}

/// Build the router over `surface`.  Open sockets close once `shutdown`
/// flips to `true`.
pub fn router(surface: Arc<Surface>, shutdown: watch::Receiver<bool>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route("/api/command", post(command))
        .route("/ws", get(ws_upgrade))
        .with_state(AppState { surface, shutdown })
}

// ────────────────────────────────────────────────────────────────────────────
// HTTP handlers
// ────────────────────────────────────────────────────────────────────────────

async fn health(State(AppState { surface, .. }): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "module_id": surface.config().module_id,
        "connected": surface.is_connected().await,
    }))
}

async fn status(State(AppState { surface, .. }): State<AppState>) -> Response {
    let report = surface.status().await;
    let code = if report.connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report)).into_response()
}

async fn command(
    State(AppState { surface, .. }): State<AppState>,
    Json(req): Json<CommandRequest>,
) -> Result<Response, ApiError> {
    let ack = surface.submit(&req).await?;
    surface.push(PushFrame::Ack(ack.clone()));
    Ok(Json(ack).into_response())
}

// ────────────────────────────────────────────────────────────────────────────
// WebSocket
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientAction {
    Refresh,
    Command(CommandRequest),
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| client_loop(socket, state))
}

async fn client_loop(socket: WebSocket, state: AppState) {
    let AppState {
        surface,
        mut shutdown,
    } = state;
    let (mut tx, mut rx) = socket.split();
    let mut pushes = surface.subscribe();

    // Fresh clients get a status frame without waiting for the refresher.
    let first = PushFrame::Status(surface.status().await);
    if send_frame(&mut tx, &first).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            frame = pushes.recv() => {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "websocket client lagged; skipping frames");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if send_frame(&mut tx, &frame).await.is_err() {
                    break;
                }
            }
            msg = rx.next() => {
                let Some(Ok(msg)) = msg else {
                    break;
                };
                match msg {
                    Message::Text(text) => {
                        let reply = handle_action(&text, &surface).await;
                        if send_frame(&mut tx, &reply).await.is_err() {
                            break;
                        }
                    }
                    Message::Ping(payload) => {
                        if tx.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    Message::Binary(_) | Message::Pong(_) => {}
                }
            }
            _ = async { shutdown.wait_for(|s| *s).await.map(|_| ()) } => {
                let _ = tx.send(Message::Close(None)).await;
                break;
            }
        }
    }
}

async fn handle_action(text: &str, surface: &Surface) -> PushFrame {
    match serde_json::from_str::<ClientAction>(text) {
        Ok(ClientAction::Refresh) => PushFrame::Status(surface.status().await),
        Ok(ClientAction::Command(req)) => match surface.submit(&req).await {
            Ok(ack) => PushFrame::Ack(ack),
            Err(e) => PushFrame::Error {
                message: e.to_string(),
            },
        },
        Err(e) => {
            warn!(error = %e, "invalid websocket action");
            PushFrame::Error {
                message: format!("invalid action: {e}"),
            }
        }
    }
}

async fn send_frame(tx: &mut SplitSink<WebSocket, Message>, frame: &PushFrame) -> Result<(), ()> {
    let Ok(text) = serde_json::to_string(frame) else {
        warn!("failed to serialise push frame");
        return Ok(());
    };
    tx.send(Message::Text(text)).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use m1cell_bus::{LocalConnector, RegisterBank};
    use m1cell_types::config::ModuleConfig;
    use m1cell_types::{DeviceKind, ModuleState, StatusWindow};
    use serde_json::Value;
    use tokio::time::timeout;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    use super::*;
    use crate::surface::{CommandAck, SurfaceConfig};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    async fn serve(bank: &Arc<RegisterBank>, refresh_ms: u64) -> Result<CockpitHandle, CellError> {
        let mut module = ModuleConfig::new("led", DeviceKind::LedController, 500);
        module.web.refresh_interval_ms = refresh_ms;
        let mut cfg = SurfaceConfig::from_module(&module);
        cfg.slot_wait = Duration::from_millis(100);
        let surface = Surface::new(cfg, Box::new(LocalConnector::new(Arc::clone(bank))));
        CockpitServer::new(Arc::new(surface))
            .spawn(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
    }

    async fn wait_connected(base: &str) -> TestResult {
        let client = reqwest::Client::new();
        for _ in 0..50 {
            let health: Value = client.get(format!("{base}/api/health")).send().await?.json().await?;
            if health["connected"] == Value::Bool(true) {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Err("surface never connected".into())
    }

    /// Next text frame whose `type` is `kind`; other frames are skipped.
    async fn next_frame<S>(ws: &mut S, kind: &str) -> Result<Value, Box<dyn std::error::Error>>
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            let msg = timeout(Duration::from_secs(3), ws.next())
                .await?
                .ok_or("socket closed")??;
            if let WsMessage::Text(text) = msg {
                let value: Value = serde_json::from_str(text.as_str())?;
                if value["type"] == kind {
                    return Ok(value);
                }
            }
        }
    }

    fn publish_idle(bank: &RegisterBank) -> TestResult {
        let mut w = StatusWindow::new();
        w.set_module_state(ModuleState::Idle);
        w.set_device_online(true);
        bank.write(500, w.registers()).map_err(|e| format!("{e:?}"))?;
        Ok(())
    }

    #[tokio::test]
    async fn status_and_command_over_http() -> TestResult {
        let bank = Arc::new(RegisterBank::new(1000));
        publish_idle(&bank)?;
        let handle = serve(&bank, 0).await?;
        let base = format!("http://{}", handle.local_addr());
        wait_connected(&base).await?;
        let client = reqwest::Client::new();

        let resp = client.get(format!("{base}/api/status")).send().await?;
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let body: Value = resp.json().await?;
        assert_eq!(body["connected"], Value::Bool(true));
        assert_eq!(body["kind"], "led_controller");
        assert_eq!(body["status"]["module_state"], "idle");

        let resp = client
            .post(format!("{base}/api/command"))
            .json(&json!({"opcode": 4, "param1": 2, "param2": 300}))
            .send()
            .await?;
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let ack: CommandAck = resp.json().await?;
        assert!(ack.accepted);
        assert_eq!(
            bank.read(520, 5).map_err(|e| format!("{e:?}"))?,
            vec![4, 2, 300, ack.command_id, 0]
        );

        handle.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn unconsumed_command_answers_409() -> TestResult {
        let bank = Arc::new(RegisterBank::new(1000));
        let handle = serve(&bank, 0).await?;
        let base = format!("http://{}", handle.local_addr());
        wait_connected(&base).await?;
        let client = reqwest::Client::new();

        let first: CommandAck = client
            .post(format!("{base}/api/command"))
            .json(&json!({"opcode": 4, "param1": 1, "param2": 100}))
            .send()
            .await?
            .json()
            .await?;
        let resp = client
            .post(format!("{base}/api/command"))
            .json(&json!({"opcode": 4, "param1": 2, "param2": 300}))
            .send()
            .await?;
        assert_eq!(resp.status(), reqwest::StatusCode::CONFLICT);
        let body: Value = resp.json().await?;
        assert_eq!(body["accepted"], Value::Bool(false));
        assert_eq!(
            bank.read(520, 5).map_err(|e| format!("{e:?}"))?,
            vec![4, 1, 100, first.command_id, 0]
        );

        handle.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_closes_open_sockets() -> TestResult {
        let bank = Arc::new(RegisterBank::new(1000));
        publish_idle(&bank)?;
        let handle = serve(&bank, 0).await?;
        let (mut ws, _) = connect_async(format!("ws://{}/ws", handle.local_addr())).await?;
        next_frame(&mut ws, "status").await?;

        timeout(Duration::from_secs(3), handle.shutdown()).await?;
        let closed = timeout(Duration::from_secs(3), async {
            loop {
                match ws.next().await {
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => return,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "socket stayed open after shutdown");
        Ok(())
    }

    #[tokio::test]
    async fn oversized_command_is_a_client_error() -> TestResult {
        let bank = Arc::new(RegisterBank::new(1000));
        let handle = serve(&bank, 0).await?;
        let base = format!("http://{}", handle.local_addr());
        wait_connected(&base).await?;

        let resp = reqwest::Client::new()
            .post(format!("{base}/api/command"))
            .json(&json!({"opcode": 1, "extra": [1, 2, 3]}))
            .send()
            .await?;
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: Value = resp.json().await?;
        assert_eq!(body["accepted"], Value::Bool(false));

        handle.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn websocket_pushes_status_and_accepts_actions() -> TestResult {
        let bank = Arc::new(RegisterBank::new(1000));
        publish_idle(&bank)?;
        let handle = serve(&bank, 1000).await?;
        let base = format!("http://{}", handle.local_addr());
        wait_connected(&base).await?;

        let (mut ws, _) = connect_async(format!("ws://{}/ws", handle.local_addr())).await?;
        let first = next_frame(&mut ws, "status").await?;
        assert_eq!(first["connected"], Value::Bool(true));
        assert_eq!(first["module_id"], "led");

        ws.send(WsMessage::Text(
            json!({"action": "command", "opcode": 2}).to_string().into(),
        ))
        .await?;
        let ack = next_frame(&mut ws, "ack").await?;
        assert_eq!(ack["accepted"], Value::Bool(true));
        let window = bank.read(520, 5).map_err(|e| format!("{e:?}"))?;
        assert_eq!(window[0], 2);
        assert_eq!(Value::from(window[3]), ack["command_id"]);

        handle.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn degraded_surface_answers_503() -> TestResult {
        use failing::FailingConnector;

        let mut module = ModuleConfig::new("led", DeviceKind::LedController, 500);
        module.web.refresh_interval_ms = 0;
        let surface = Surface::new(SurfaceConfig::from_module(&module), Box::new(FailingConnector));
        let handle = CockpitServer::new(Arc::new(surface))
            .spawn(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await?;
        let base = format!("http://{}", handle.local_addr());
        let client = reqwest::Client::new();

        let resp = client.get(format!("{base}/api/status")).send().await?;
        assert_eq!(resp.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = resp.json().await?;
        assert_eq!(body["connected"], Value::Bool(false));

        let resp = client
            .post(format!("{base}/api/command"))
            .json(&json!({"opcode": 1}))
            .send()
            .await?;
        assert_eq!(resp.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);

        let resp = client.get(format!("{base}/api/health")).send().await?;
        assert_eq!(resp.status(), reqwest::StatusCode::OK);

        handle.shutdown().await;
        Ok(())
    }

    mod failing {
        use m1cell_bus::{BusConnector, RegisterIo};
        use m1cell_types::CellError;

        pub struct FailingConnector;

        #[async_trait::async_trait]
        impl BusConnector for FailingConnector {
            async fn connect(&self) -> Result<Box<dyn RegisterIo>, CellError> {
                Err(CellError::BusUnreachable("no bus in this test".into()))
            }

            fn describe(&self) -> String {
                "nowhere".into()
            }
        }
    }
}
