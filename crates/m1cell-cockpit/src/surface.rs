//! [`Surface`] – the bus-client half of a Web Control Surface.
//!
//! A surface owns one Modbus TCP connection and nothing else: it reads the
//! module's status window and writes its command window.  When the
//! connection drops the surface is *degraded*: reads report
//! `connected = false`, writes are refused locally, and
//! [`Surface::maintain`] reconnects in the background with backoff.

use std::collections::BTreeMap;
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;
use std::time::Duration;

use m1cell_bus::{Backoff, BusConnector, RegisterIo, TcpConnector};
use m1cell_types::config::ModuleConfig;
use m1cell_types::layout::{COMMAND_HEADER_LEN, FieldValue, STATUS_LEN, split_i32};
use m1cell_types::{CellError, DeviceKind, ErrorCode, ModuleState, RegisterWindow, StatusWindow};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::allocator::CommandIdAllocator;

/// Longest `wait_ms` a command request may ask for.
pub const MAX_WAIT: Duration = Duration::from_secs(5);
/// How long a submit waits for the previous command to leave the slot.
pub const SLOT_WAIT: Duration = Duration::from_secs(2);
const WAIT_POLL: Duration = Duration::from_millis(20);
const RECONNECT_CHECK: Duration = Duration::from_millis(100);
const PUSH_CAPACITY: usize = 16;

// ────────────────────────────────────────────────────────────────────────────
// Wire types
// ────────────────────────────────────────────────────────────────────────────

/// Decoded status window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedStatus {
    pub module_state: Option<ModuleState>,
    pub device_online: bool,
    pub error_count: u16,
    pub executing: bool,
    pub last_error_code: u16,
    pub last_error: Option<ErrorCode>,
    pub op_count: u32,
    pub last_command_id: u16,
    pub timestamp_lo: u16,
    pub device: BTreeMap<&'static str, FieldValue>,
}

impl DecodedStatus {
    pub fn decode(window: &StatusWindow, kind: DeviceKind) -> Self {
        Self {
            module_state: window.module_state(),
            device_online: window.device_online(),
            error_count: window.error_count(),
            executing: window.executing(),
            last_error_code: window.last_error_code(),
            last_error: ErrorCode::from_u16(window.last_error_code()),
            op_count: window.op_count(),
            last_command_id: window.last_command_id(),
            timestamp_lo: window.timestamp_lo(),
            device: window.device_fields(kind).into_iter().collect(),
        }
    }
}

/// Body of `GET /api/status` and of every pushed status frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub connected: bool,
    pub module_id: String,
    pub kind: DeviceKind,
    pub status: Option<DecodedStatus>,
    pub raw: Vec<u16>,
}

/// Body of `POST /api/command`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CommandRequest {
    pub opcode: u16,
    #[serde(default)]
    pub param1: u16,
    #[serde(default)]
    pub param2: u16,
    /// Signed 32-bit parameter split into `param1` (low) and `param2` (high).
    #[serde(default)]
    pub value: Option<i32>,
    /// Opcode-specific registers at offset 4 and beyond.
    #[serde(default)]
    pub extra: Vec<u16>,
    /// Wait up to this long for the bridge to clear the window.
    #[serde(default)]
    pub wait_ms: Option<u64>,
}

/// Reply to an accepted command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandAck {
    pub accepted: bool,
    pub command_id: u16,
    /// `true` once the window read clear with `executing = 0`.
    pub completed: bool,
    /// Outcome published by the bridge, when `completed`.
    pub last_error_code: Option<u16>,
}

/// Frames pushed over `/ws`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushFrame {
    Status(StatusReport),
    Ack(CommandAck),
    Error { message: String },
}

// ────────────────────────────────────────────────────────────────────────────
// Surface
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SurfaceConfig {
    pub module_id: String,
    pub kind: DeviceKind,
    pub status: RegisterWindow,
    pub command: RegisterWindow,
    /// Period of the background refresher; `None` means manual-only.
    pub refresh_interval: Option<Duration>,
    /// Bound on waiting for an occupied command slot before refusing.
    pub slot_wait: Duration,
}

impl SurfaceConfig {
    pub fn from_module(cfg: &ModuleConfig) -> Self {
        let refresh = cfg.web.refresh_interval_ms;
        Self {
            module_id: cfg.module_id.clone(),
            kind: cfg.device.kind,
            status: cfg.status_window(),
            command: cfg.command_window(),
            refresh_interval: (refresh > 0).then(|| Duration::from_millis(refresh)),
            slot_wait: SLOT_WAIT,
        }
    }
}

pub struct Surface {
    cfg: SurfaceConfig,
    connector: Box<dyn BusConnector>,
    bus: Mutex<Option<Box<dyn RegisterIo>>>,
    allocator: StdMutex<CommandIdAllocator>,
    push_tx: broadcast::Sender<PushFrame>,
}

impl Surface {
    pub fn new(cfg: SurfaceConfig, connector: Box<dyn BusConnector>) -> Self {
        let (push_tx, _) = broadcast::channel(PUSH_CAPACITY);
        Self {
            cfg,
            connector,
            bus: Mutex::new(None),
            allocator: StdMutex::new(CommandIdAllocator::default()),
            push_tx,
        }
    }

    pub fn from_config(cfg: &ModuleConfig) -> Self {
        let connector = TcpConnector::new(
            &cfg.bus.host,
            cfg.bus.port,
            cfg.bus.slave_id,
            Duration::from_millis(cfg.bus.timeout_ms),
        );
        Self::new(SurfaceConfig::from_module(cfg), Box::new(connector))
    }

    pub fn config(&self) -> &SurfaceConfig {
        &self.cfg
    }

    pub async fn is_connected(&self) -> bool {
        self.bus.lock().await.is_some()
    }

    /// Subscribe to pushed frames.  Slow subscribers skip ahead.
    pub fn subscribe(&self) -> broadcast::Receiver<PushFrame> {
        self.push_tx.subscribe()
    }

    /// Offer a frame to every subscriber.
    pub fn push(&self, frame: PushFrame) {
        let _ = self.push_tx.send(frame);
    }

    /// Try once to connect if disconnected.
    pub async fn connect(&self) -> Result<(), CellError> {
        let mut bus = self.bus.lock().await;
        if bus.is_none() {
            *bus = Some(self.connector.connect().await?);
            info!(module = %self.cfg.module_id, bus = %self.connector.describe(), "surface connected to bus");
        }
        Ok(())
    }

    /// Keep the bus connection alive until `shutdown` flips.
    pub async fn maintain(&self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Backoff::default();
        loop {
            let now = Instant::now();
            if !self.is_connected().await && backoff.ready(now) {
                match self.connect().await {
                    Ok(()) => backoff.succeeded(),
                    Err(e) => {
                        let wait = backoff.failed(now);
                        debug!(module = %self.cfg.module_id, error = %e, retry_ms = wait.as_millis() as u64, "surface reconnect failed");
                    }
                }
            }
            tokio::select! {
                _ = sleep(RECONNECT_CHECK) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Push a status frame every refresh period until `shutdown` flips.
    /// Returns at once in manual-only mode.
    pub async fn refresh_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let Some(period) = self.cfg.refresh_interval else {
            return;
        };
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.status().await;
                    self.push(PushFrame::Status(report));
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Read and decode the status window.  Never fails: a degraded surface
    /// returns `connected = false`.
    pub async fn status(&self) -> StatusReport {
        let read = self.read(self.cfg.status.base, STATUS_LEN).await;
        let window = read.ok().and_then(|raw| StatusWindow::from_registers(&raw));
        StatusReport {
            connected: window.is_some(),
            module_id: self.cfg.module_id.clone(),
            kind: self.cfg.kind,
            status: window.as_ref().map(|w| DecodedStatus::decode(w, self.cfg.kind)),
            raw: window.map(|w| w.registers().to_vec()).unwrap_or_default(),
        }
    }

    /// Allocate a command id, write the whole command window in one request
    /// and optionally wait for the bridge to clear it.
    ///
    /// A command still sitting in the slot is never overwritten: the submit
    /// waits up to [`SurfaceConfig::slot_wait`] for the bridge to consume it
    /// and then fails with [`CellError::NotReady`].
    pub async fn submit(&self, req: &CommandRequest) -> Result<CommandAck, CellError> {
        let registers = self.encode(req)?;
        let deadline = Instant::now() + self.cfg.slot_wait;
        let cid = loop {
            let pending = {
                let mut guard = self.bus.lock().await;
                let Some(bus) = guard.as_mut() else {
                    return Err(CellError::BusUnreachable("web surface is disconnected".into()));
                };
                let live = self.live_ids(bus.as_mut()).await;
                let (slot, consumed) = self.checked(&mut guard, live)?;
                if slot == 0 {
                    let cid = self.lock_allocator().allocate(&[slot, consumed], Instant::now());
                    let mut window = registers.clone();
                    window[3] = cid;
                    let written = match guard.as_mut() {
                        Some(bus) => bus.write(self.cfg.command.base, &window).await,
                        None => Err(CellError::BusUnreachable("web surface is disconnected".into())),
                    };
                    if let Err(e) = self.checked(&mut guard, written) {
                        self.lock_allocator().release(cid);
                        return Err(e);
                    }
                    break cid;
                }
                slot
            };
            if Instant::now() >= deadline {
                warn!(module = %self.cfg.module_id, pending, opcode = req.opcode, "command slot still occupied; refusing submit");
                return Err(CellError::NotReady(format!(
                    "command {pending} has not been consumed yet"
                )));
            }
            sleep(WAIT_POLL).await;
        };
        info!(module = %self.cfg.module_id, cid, opcode = req.opcode, "command submitted");

        let wait = req.wait_ms.map(Duration::from_millis).unwrap_or_default().min(MAX_WAIT);
        let (completed, last_error_code) = if wait.is_zero() {
            (false, None)
        } else {
            self.wait_for_clear(cid, wait).await
        };
        Ok(CommandAck {
            accepted: true,
            command_id: cid,
            completed,
            last_error_code,
        })
    }

    fn encode(&self, req: &CommandRequest) -> Result<Vec<u16>, CellError> {
        let max_extra = usize::from(self.cfg.command.len) - COMMAND_HEADER_LEN;
        if req.extra.len() > max_extra {
            return Err(CellError::ParamOutOfRange {
                opcode: req.opcode,
                param: "extra".into(),
                value: req.extra.len() as i64,
            });
        }
        let (param1, param2) = match req.value {
            Some(v) if req.param1 != 0 || req.param2 != 0 => {
                return Err(CellError::ParamOutOfRange {
                    opcode: req.opcode,
                    param: "value".into(),
                    value: i64::from(v),
                });
            }
            Some(v) => {
                let [lo, hi] = split_i32(v);
                (lo, hi)
            }
            None => (req.param1, req.param2),
        };
        let mut window = vec![req.opcode, param1, param2, 0];
        window.extend_from_slice(&req.extra);
        window.resize(usize::from(self.cfg.command.len), 0);
        Ok(window)
    }

    /// The id in the slot and the one the bridge consumed last.
    async fn live_ids(&self, bus: &mut dyn RegisterIo) -> Result<(u16, u16), CellError> {
        let command = bus.read(self.cfg.command.base, self.cfg.command.len).await?;
        let slot = command.get(3).copied().unwrap_or(0);
        if command.iter().all(|r| *r == 0) {
            self.lock_allocator().window_clear();
        }
        let status = bus.read(self.cfg.status.base, STATUS_LEN).await?;
        let consumed = StatusWindow::from_registers(&status)
            .map(|w| w.last_command_id())
            .unwrap_or(0);
        Ok((slot, consumed))
    }

    async fn wait_for_clear(&self, cid: u16, wait: Duration) -> (bool, Option<u16>) {
        let deadline = Instant::now() + wait;
        loop {
            if let Ok((command, status)) = self.read_both().await {
                let cleared = command.iter().all(|r| *r == 0);
                if cleared && !status.executing() {
                    self.lock_allocator().release(cid);
                    let code = (status.last_command_id() == cid).then(|| status.last_error_code());
                    return (true, code);
                }
            }
            if Instant::now() >= deadline {
                return (false, None);
            }
            sleep(WAIT_POLL).await;
        }
    }

    async fn read_both(&self) -> Result<(Vec<u16>, StatusWindow), CellError> {
        let command = self.read(self.cfg.command.base, self.cfg.command.len).await?;
        let raw = self.read(self.cfg.status.base, STATUS_LEN).await?;
        let status = StatusWindow::from_registers(&raw)
            .ok_or_else(|| CellError::BusUnreachable("short status read".into()))?;
        Ok((command, status))
    }

    async fn read(&self, addr: u16, count: u16) -> Result<Vec<u16>, CellError> {
        let mut guard = self.bus.lock().await;
        let Some(bus) = guard.as_mut() else {
            return Err(CellError::BusUnreachable("web surface is disconnected".into()));
        };
        let result = bus.read(addr, count).await;
        self.checked(&mut guard, result)
    }

    /// Drop the connection on a transport failure.
    fn checked<T>(
        &self,
        bus: &mut Option<Box<dyn RegisterIo>>,
        result: Result<T, CellError>,
    ) -> Result<T, CellError> {
        if let Err(CellError::BusUnreachable(detail)) = &result
            && bus.take().is_some()
        {
            warn!(module = %self.cfg.module_id, detail = %detail, "surface lost the bus; degraded");
        }
        result
    }

    fn lock_allocator(&self) -> std::sync::MutexGuard<'_, CommandIdAllocator> {
        self.allocator.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
